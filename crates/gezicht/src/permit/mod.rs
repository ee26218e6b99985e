//! Serialization primitives for worker commands and pool-wide learning.
//!
//! - [`SerialQueue`]: capacity-1 queue with a priority lane, one per worker and
//!   one pool-wide learn queue
//! - [`LearnPermit`]: proof that the holder owns the pool-wide learn queue

mod queue;

pub use queue::{Lane, PermitError, QueuePermit, SerialQueue, Ticket};

/// Exclusive hold on the pool's learn queue.
///
/// Only the pool can mint one, so a worker-level learn can never run outside
/// the pool-wide ordering.
#[derive(Debug)]
pub struct LearnPermit(#[allow(dead_code)] QueuePermit);

impl LearnPermit {
    pub(crate) fn new(permit: QueuePermit) -> Self {
        Self(permit)
    }
}
