//! Transport errors

use peer_bridge::{BridgeError, RequestId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the transport operation surface
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport was disconnected")]
    Disconnected,

    #[error("Leader failed to open connection: {0}")]
    LeaderConnect(String),

    #[error("Forwarded request {request_id} timed out after {timeout:?}")]
    ForwardedRequestTimeout {
        request_id: RequestId,
        timeout: Duration,
    },

    #[error("Request was aborted")]
    Aborted,

    #[error("Request was interrupted before completing")]
    Interrupted,

    /// Error raised on the leader, flattened to its message by the bridge
    #[error("{0}")]
    Remote(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
