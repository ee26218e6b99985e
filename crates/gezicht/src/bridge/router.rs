//! Correlates worker responses with the requests waiting on them.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::protocol::{RequestId, WorkerResponse};

/// What a pending request eventually receives: the `result` or the raw `error`.
pub type Reply = Result<serde_json::Value, serde_json::Value>;

/// Outcome of routing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Delivered(RequestId),
    /// No pending request matched: push-style frame, unknown id, or a caller
    /// that already gave up.
    Unmatched,
}

/// Pending-request table keyed by correlation id.
///
/// Each entry is removed when its reply is delivered, so a response is routed
/// at most once even if the worker repeats it. Once closed, new registrations
/// resolve as closed immediately.
#[derive(Default)]
pub struct ResponseRouter {
    pending: DashMap<RequestId, oneshot::Sender<Reply>>,
    closed: AtomicBool,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before it is written so a fast reply cannot be missed.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&id);
        }
        rx
    }

    /// Drop a pending entry without replying (timeout, failed write).
    pub fn forget(&self, id: &RequestId) {
        self.pending.remove(id);
    }

    pub fn route(&self, response: WorkerResponse) -> Routed {
        let Some(id) = response.request_id() else {
            tracing::trace!("Frame without request id");
            return Routed::Unmatched;
        };
        let Some((_, tx)) = self.pending.remove(&id) else {
            tracing::debug!(request_id = %id, "Response for unknown request");
            return Routed::Unmatched;
        };
        if tx.send(response.into_reply()).is_err() {
            tracing::debug!(request_id = %id, "Requester dropped before response arrived");
            return Routed::Unmatched;
        }
        Routed::Delivered(id)
    }

    /// Drop every pending sender; their receivers observe a closed channel.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            tracing::debug!(count, "Closed pending requests");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
