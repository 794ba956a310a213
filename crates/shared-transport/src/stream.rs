//! Streaming handle returned by `send`

use crate::error::TransportError;
use crate::real::EventStream;
use crate::transport::Inner;
use futures::Stream;
use parking_lot::Mutex;
use peer_bridge::{RequestId, SessionId, TransportEvent};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Where an abort has to be delivered
pub(crate) struct CancelTarget {
    pub(crate) transport: Weak<Inner>,
    pub(crate) request_id: RequestId,
    pub(crate) session_id: SessionId,
}

struct CancelState {
    signal: Option<oneshot::Sender<()>>,
    target: Option<CancelTarget>,
    /// The run reached the leader (or the real connection)
    dispatched: bool,
}

/// Aborts one in-flight `send` from anywhere
#[derive(Clone)]
pub struct SendCanceller {
    state: Arc<Mutex<CancelState>>,
}

impl SendCanceller {
    pub(crate) fn new(target: CancelTarget) -> (Self, oneshot::Receiver<()>) {
        let (signal, rx) = oneshot::channel();
        let canceller = Self {
            state: Arc::new(Mutex::new(CancelState {
                signal: Some(signal),
                target: Some(target),
                dispatched: false,
            })),
        };
        (canceller, rx)
    }

    pub(crate) fn mark_dispatched(&self) {
        self.state.lock().dispatched = true;
    }

    /// End the stream with `Aborted` and cancel the run
    ///
    /// The local stream ends right away. The remote cancellation is best
    /// effort. Aborting a finished stream does nothing.
    pub fn abort(&self) {
        let (signal, target, dispatched) = {
            let mut state = self.state.lock();
            (state.signal.take(), state.target.take(), state.dispatched)
        };
        let Some(signal) = signal else {
            return;
        };
        let _ = signal.send(());

        if let Some(target) = target {
            if let Some(inner) = target.transport.upgrade() {
                inner.cancel_send(&target.request_id, &target.session_id, dispatched);
            }
        }
    }

    /// Stop tracking the run without cancelling it
    fn release(&self) {
        let target = {
            let mut state = self.state.lock();
            state.signal = None;
            state.target.take()
        };
        if let Some(target) = target {
            if let Some(inner) = target.transport.upgrade() {
                inner.pending.remove_stream(&target.request_id);
            }
        }
    }
}

/// Events of one `send`, in order
///
/// Ends after the final event or with the first error. Dropping the stream
/// early stops relaying without cancelling the run.
pub struct SendStream {
    events: EventStream,
    abort_rx: Option<oneshot::Receiver<()>>,
    canceller: SendCanceller,
    finished: bool,
}

impl SendStream {
    pub(crate) fn new(
        events: EventStream,
        abort_rx: oneshot::Receiver<()>,
        canceller: SendCanceller,
    ) -> Self {
        Self {
            events,
            abort_rx: Some(abort_rx),
            canceller,
            finished: false,
        }
    }

    /// Handle that aborts this stream
    pub fn canceller(&self) -> SendCanceller {
        self.canceller.clone()
    }

    pub fn abort(&self) {
        self.canceller.abort();
    }

    fn finish(&mut self) {
        self.finished = true;
        self.abort_rx = None;
        self.canceller.release();
    }
}

impl Stream for SendStream {
    type Item = Result<TransportEvent, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(rx) = this.abort_rx.as_mut() {
            match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(())) => {
                    this.finished = true;
                    this.abort_rx = None;
                    return Poll::Ready(Some(Err(TransportError::Aborted)));
                }
                // Canceller released
                Poll::Ready(Err(_)) => this.abort_rx = None,
                Poll::Pending => {}
            }
        }

        match this.events.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if !self.finished {
            self.canceller.release();
        }
    }
}
