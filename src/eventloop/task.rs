//! Scheduled task records and their caller-facing handle.

use super::promise::{LoopError, PromiseFuture};
use super::virtual_loop::VirtualLoop;
use crate::types::Time;
use core::fmt;
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A unit of work queued on the loop.
///
/// Tasks compare by `(ready_at, insert_order)` ascending; `insert_order` is
/// unique per loop, making the order total: equal deadlines run FIFO by
/// submission.
pub(crate) struct ScheduledTask {
    /// Unique id, used only for cancellation lookup.
    pub(crate) id: u64,
    /// Virtual deadline.
    pub(crate) ready_at: Time,
    /// Queue-insertion tie-break, assigned under the loop's state lock.
    pub(crate) insert_order: u64,
    /// Runs the work and completes the task's promise.
    pub(crate) work: Box<dyn FnOnce() + Send>,
    /// Fails the task's promise when the loop drains it at shutdown.
    pub(crate) fail: Box<dyn FnOnce(LoopError) + Send>,
    /// Releases the promise's leak tracking when the task is cancelled.
    pub(crate) abandon: Box<dyn FnOnce() + Send>,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.insert_order == other.insert_order
    }
}

impl Eq for ScheduledTask {}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for BinaryHeap: earliest deadline first, then FIFO.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.insert_order.cmp(&self.insert_order))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("ready_at", &self.ready_at)
            .field("insert_order", &self.insert_order)
            .finish_non_exhaustive()
    }
}

/// Handle to a scheduled task.
///
/// Carries the future for the task's result and a cancellation operation.
/// The handle is armed synchronously at submission, so a task can be
/// cancelled even before the loop ever advances.
#[derive(Debug)]
pub struct Scheduled<T> {
    id: u64,
    owner: VirtualLoop,
    future: PromiseFuture<T>,
}

impl<T> Scheduled<T> {
    pub(crate) fn new(id: u64, owner: VirtualLoop, future: PromiseFuture<T>) -> Self {
        Self { id, owner, future }
    }

    /// Removes the task from the loop's queue.
    ///
    /// Cancelling a task that already ran, or one that no longer exists, is
    /// a no-op. Cancellation does not fail the result future; it simply
    /// stays unfulfilled.
    pub fn cancel(&self) {
        self.owner.cancel_task(self.id);
    }

    /// Extracts the result future, giving up the ability to cancel.
    #[must_use]
    pub fn into_future(self) -> PromiseFuture<T> {
        self.future
    }
}

impl<T> Future for Scheduled<T> {
    type Output = Result<T, LoopError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.future).poll(cx)
    }
}
