//! Shared readiness outcome
//!
//! Every operation waits on the current outcome before routing. Each
//! handover starts a new generation; only the handler holding the current
//! generation may settle it, so a stale handler finishing late has no effect.

use crate::error::TransportError;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadyOutcome {
    Pending,
    Ready,
    NotConnected,
    Disconnected,
    Failed(String),
}

pub(crate) struct Readiness {
    tx: watch::Sender<(u64, ReadyOutcome)>,
}

impl Readiness {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::channel((0, ReadyOutcome::NotConnected)).0,
        }
    }

    /// Start a new pending generation and return it
    pub(crate) fn begin(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|(g, outcome)| {
            *g += 1;
            *outcome = ReadyOutcome::Pending;
            generation = *g;
        });
        generation
    }

    /// Settle `generation` if it is still current and pending
    pub(crate) fn resolve(&self, generation: u64, outcome: ReadyOutcome) -> bool {
        self.tx.send_if_modified(|(g, current)| {
            if *g == generation && *current == ReadyOutcome::Pending {
                *current = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Settle unconditionally, superseding every generation
    pub(crate) fn force(&self, outcome: ReadyOutcome) {
        self.tx.send_modify(|(g, current)| {
            *g += 1;
            *current = outcome;
        });
    }

    /// Wait until the current generation settles
    pub(crate) async fn wait(&self) -> Result<(), TransportError> {
        let mut rx = self.tx.subscribe();
        let outcome = rx
            .wait_for(|(_, outcome)| *outcome != ReadyOutcome::Pending)
            .await
            .map(|settled| settled.1.clone())
            .map_err(|_| TransportError::Disconnected)?;

        match outcome {
            ReadyOutcome::Ready => Ok(()),
            ReadyOutcome::NotConnected => Err(TransportError::NotConnected),
            ReadyOutcome::Disconnected => Err(TransportError::Disconnected),
            ReadyOutcome::Failed(reason) => Err(TransportError::LeaderConnect(reason)),
            ReadyOutcome::Pending => Err(TransportError::NotConnected),
        }
    }
}
