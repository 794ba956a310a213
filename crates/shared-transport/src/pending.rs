//! Correlation tables for forwarded requests
//!
//! Entries are keyed by request id. Replies for ids that are no longer
//! tracked are stale and get dropped.

use crate::error::TransportError;
use dashmap::DashMap;
use peer_bridge::{RequestId, TransportEvent};
use tokio::sync::{mpsc, oneshot};

/// One item relayed for a forwarded `send`
#[derive(Debug)]
pub(crate) enum StreamItem {
    Event(TransportEvent),
    End,
    Failed(TransportError),
}

struct PendingStream {
    tx: mpsc::UnboundedSender<StreamItem>,
    /// Request already went out on the bridge
    dispatched: bool,
}

#[derive(Default)]
pub(crate) struct PendingTables {
    requests: DashMap<RequestId, oneshot::Sender<Result<(), TransportError>>>,
    streams: DashMap<RequestId, PendingStream>,
}

impl PendingTables {
    pub(crate) fn register_request(
        &self,
        request_id: &str,
    ) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(request_id.to_string(), tx);
        rx
    }

    /// Settle a request. Returns false for unknown ids.
    pub(crate) fn resolve_request(&self, request_id: &str, result: Result<(), TransportError>) -> bool {
        match self.requests.remove(request_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn drop_request(&self, request_id: &str) {
        self.requests.remove(request_id);
    }

    pub(crate) fn register_stream(&self, request_id: &str) -> mpsc::UnboundedReceiver<StreamItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(
            request_id.to_string(),
            PendingStream {
                tx,
                dispatched: false,
            },
        );
        rx
    }

    pub(crate) fn mark_dispatched(&self, request_id: &str) {
        if let Some(mut entry) = self.streams.get_mut(request_id) {
            entry.dispatched = true;
        }
    }

    /// Route one relayed item. Terminal items retire the entry.
    ///
    /// Returns false for unknown ids.
    pub(crate) fn push_stream(&self, request_id: &str, item: StreamItem) -> bool {
        match item {
            StreamItem::Event(_) => match self.streams.get(request_id) {
                Some(entry) => {
                    let _ = entry.tx.send(item);
                    true
                }
                None => false,
            },
            StreamItem::End | StreamItem::Failed(_) => match self.streams.remove(request_id) {
                Some((_, entry)) => {
                    let _ = entry.tx.send(item);
                    true
                }
                None => false,
            },
        }
    }

    pub(crate) fn remove_stream(&self, request_id: &str) {
        self.streams.remove(request_id);
    }

    /// Fail streams whose request went to a leader that is gone
    pub(crate) fn fail_dispatched_streams(&self) -> usize {
        let stale: Vec<RequestId> = self
            .streams
            .iter()
            .filter(|entry| entry.dispatched)
            .map(|entry| entry.key().clone())
            .collect();

        for request_id in &stale {
            self.push_stream(request_id, StreamItem::Failed(TransportError::Interrupted));
        }
        stale.len()
    }

    /// Reject everything outstanding
    pub(crate) fn fail_all(&self) {
        let requests: Vec<RequestId> = self.requests.iter().map(|e| e.key().clone()).collect();
        for request_id in requests {
            self.resolve_request(&request_id, Err(TransportError::Disconnected));
        }

        let streams: Vec<RequestId> = self.streams.iter().map(|e| e.key().clone()).collect();
        for request_id in streams {
            self.push_stream(&request_id, StreamItem::Failed(TransportError::Disconnected));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len() + self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_ids_are_stale() {
        let tables = PendingTables::default();
        assert!(!tables.resolve_request("nope", Ok(())));
        assert!(!tables.push_stream("nope", StreamItem::End));
    }

    #[tokio::test]
    async fn test_stream_end_retires_entry() {
        let tables = PendingTables::default();
        let mut rx = tables.register_stream("r1");

        let event = TransportEvent::session("s1", "delta", json!({}));
        assert!(tables.push_stream("r1", StreamItem::Event(event.clone())));
        assert!(tables.push_stream("r1", StreamItem::End));
        assert!(!tables.push_stream("r1", StreamItem::Event(event.clone())));

        assert!(matches!(rx.recv().await, Some(StreamItem::Event(e)) if e == event));
        assert!(matches!(rx.recv().await, Some(StreamItem::End)));
        assert!(rx.recv().await.is_none());
        assert_eq!(tables.len(), 0);
    }

    #[tokio::test]
    async fn test_only_dispatched_streams_fail_on_leader_change() {
        let tables = PendingTables::default();
        let mut sent = tables.register_stream("r1");
        let _queued = tables.register_stream("r2");
        tables.mark_dispatched("r1");

        assert_eq!(tables.fail_dispatched_streams(), 1);
        assert!(matches!(
            sent.recv().await,
            Some(StreamItem::Failed(TransportError::Interrupted))
        ));
        assert_eq!(tables.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_requests() {
        let tables = PendingTables::default();
        let rx = tables.register_request("r1");

        tables.fail_all();

        assert!(matches!(rx.await, Ok(Err(TransportError::Disconnected))));
        assert_eq!(tables.len(), 0);
    }
}
