//! Capacity-1 FIFO queue with a priority lane.
//!
//! Positions are reserved synchronously with [`SerialQueue::reserve`], so the
//! order in which callers reserve is the order in which they run, regardless of
//! when their futures are first polled. A [`QueuePermit`] hands the queue to the
//! next waiter when dropped: priority waiters first, then normal ones, FIFO
//! within each lane.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PermitError {
    #[error("queue closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Jumps ahead of every normal waiter.
    Priority,
    Normal,
}

#[derive(Default)]
struct QueueState {
    busy: bool,
    closed: bool,
    priority: VecDeque<oneshot::Sender<QueuePermit>>,
    normal: VecDeque<oneshot::Sender<QueuePermit>>,
}

#[derive(Default)]
struct Shared {
    state: StdMutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock();
        loop {
            let next = match state.priority.pop_front() {
                Some(tx) => Some(tx),
                None => state.normal.pop_front(),
            };
            let Some(tx) = next else {
                state.busy = false;
                return;
            };
            let permit = QueuePermit {
                shared: Some(Arc::clone(self)),
            };
            match tx.send(permit) {
                Ok(()) => return,
                // Waiter gave up; disarm so the drop does not re-enter release.
                Err(mut unclaimed) => unclaimed.shared = None,
            }
        }
    }
}

/// Exclusive hold on a [`SerialQueue`]. Dropping it passes the queue on.
pub struct QueuePermit {
    shared: Option<Arc<Shared>>,
}

impl std::fmt::Debug for QueuePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePermit")
            .field("armed", &self.shared.is_some())
            .finish()
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

/// A reserved queue position.
#[derive(Debug)]
pub enum Ticket {
    Granted(QueuePermit),
    Waiting(oneshot::Receiver<QueuePermit>),
}

impl Ticket {
    pub async fn acquire(self) -> Result<QueuePermit, PermitError> {
        match self {
            Ticket::Granted(permit) => Ok(permit),
            Ticket::Waiting(rx) => rx.await.map_err(|_| PermitError::Closed),
        }
    }
}

#[derive(Clone, Default)]
pub struct SerialQueue {
    shared: Arc<Shared>,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a place in line without waiting.
    pub fn reserve(&self, lane: Lane) -> Ticket {
        let mut state = self.shared.lock();
        let (tx, rx) = oneshot::channel();
        if state.closed {
            drop(tx);
            return Ticket::Waiting(rx);
        }
        if !state.busy {
            state.busy = true;
            return Ticket::Granted(QueuePermit {
                shared: Some(Arc::clone(&self.shared)),
            });
        }
        match lane {
            Lane::Priority => state.priority.push_back(tx),
            Lane::Normal => state.normal.push_back(tx),
        }
        Ticket::Waiting(rx)
    }

    pub async fn acquire(&self, lane: Lane) -> Result<QueuePermit, PermitError> {
        self.reserve(lane).acquire().await
    }

    /// Fail every waiter and every future reservation.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        state.priority.clear();
        state.normal.clear();
    }

    pub fn is_busy(&self) -> bool {
        self.shared.lock().busy
    }

    pub fn waiting(&self) -> usize {
        let state = self.shared.lock();
        state.priority.len() + state.normal.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn idle_queue_grants_immediately() {
        let queue = SerialQueue::new();
        let ticket = queue.reserve(Lane::Normal);
        assert!(matches!(ticket, Ticket::Granted(_)));
        assert!(queue.is_busy());

        drop(ticket);
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn priority_lane_runs_before_normal() {
        let queue = SerialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = queue.acquire(Lane::Normal).await.unwrap();

        let mut tasks = Vec::new();
        for (label, lane) in [
            ("normal-1", Lane::Normal),
            ("priority-1", Lane::Priority),
            ("normal-2", Lane::Normal),
            ("priority-2", Lane::Priority),
        ] {
            let ticket = queue.reserve(lane);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = ticket.acquire().await.unwrap();
                order.lock().unwrap().push(label);
            }));
        }
        assert_eq!(queue.waiting(), 4);

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["priority-1", "priority-2", "normal-1", "normal-2"]
        );
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn reservation_order_beats_poll_order() {
        let queue = SerialQueue::new();
        let held = queue.acquire(Lane::Normal).await.unwrap();

        let first = queue.reserve(Lane::Normal);
        let second = queue.reserve(Lane::Normal);

        drop(held);
        // Second is polled first but must still wait for first.
        let second = tokio::spawn(second.acquire());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        let first = first.acquire().await.unwrap();
        drop(first);
        let _second = second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn abandoned_ticket_is_skipped() {
        let queue = SerialQueue::new();
        let held = queue.acquire(Lane::Normal).await.unwrap();

        let abandoned = queue.reserve(Lane::Priority);
        let kept = queue.reserve(Lane::Normal);
        drop(abandoned);

        drop(held);
        let permit = tokio::time::timeout(Duration::from_secs(1), kept.acquire())
            .await
            .expect("next waiter should be granted")
            .unwrap();
        drop(permit);
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn close_fails_waiters_and_new_reservations() {
        let queue = SerialQueue::new();
        let _held = queue.acquire(Lane::Normal).await.unwrap();
        let waiting = queue.reserve(Lane::Normal);

        queue.close();
        assert_eq!(waiting.acquire().await.unwrap_err(), PermitError::Closed);
        assert_eq!(
            queue.acquire(Lane::Priority).await.unwrap_err(),
            PermitError::Closed
        );
    }
}
