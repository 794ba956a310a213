//! Bridge errors

use thiserror::Error;

/// Errors raised by the broadcast bus and bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge is closed")]
    Closed,

    #[error("Bus connection failed: {0}")]
    Connect(String),

    #[error("Frame encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}
