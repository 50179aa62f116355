//! Loop-bound oneshot promises.
//!
//! A [`Promise`] is the writing half of a single-value slot; its
//! [`PromiseFuture`] is the reading half. Scheduled-task results ride on the
//! same mechanism. In debug builds every promise created through a loop
//! registers its creation site, and the loop asserts at destruction that
//! each one was completed, a cheap detector for futures that can never
//! resolve.

use core::fmt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Errors raised by the virtual loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopError {
    /// `await_future` ran out of wall-clock time before the future resolved.
    TimeoutAwaitingFuture,
    /// The task was still queued when the loop shut down.
    Shutdown,
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeoutAwaitingFuture => write!(f, "timed out awaiting future"),
            Self::Shutdown => write!(f, "loop shut down before the task ran"),
        }
    }
}

impl std::error::Error for LoopError {}

/// Completion state of a promise slot.
enum SlotState<T> {
    /// Not yet completed; a parked waker may be waiting.
    Pending { waker: Option<Waker> },
    /// Completed; the result waits to be taken by the future.
    Ready(Option<Result<T, LoopError>>),
}

/// Debug registration of a promise against its loop's registry.
struct Tracking {
    registry: Arc<PromiseRegistry>,
    id: u64,
}

/// Shared slot between a promise and its future.
pub(crate) struct Shared<T> {
    state: Mutex<SlotState<T>>,
    tracking: Mutex<Option<Tracking>>,
}

impl<T> Shared<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending { waker: None }),
            tracking: Mutex::new(None),
        })
    }

    /// Registers this slot in a loop's debug registry.
    pub(crate) fn track(&self, registry: Arc<PromiseRegistry>, site: &'static Location<'static>) {
        let id = registry.register(site);
        *self.tracking.lock().expect("promise tracking lock poisoned") =
            Some(Tracking { registry, id });
    }

    /// Completes the slot and wakes any parked waiter. First write wins.
    pub(crate) fn complete(&self, result: Result<T, LoopError>) {
        let waker = {
            let mut state = self.state.lock().expect("promise lock poisoned");
            match &mut *state {
                SlotState::Pending { waker } => {
                    let waker = waker.take();
                    *state = SlotState::Ready(Some(result));
                    waker
                }
                SlotState::Ready(_) => None,
            }
        };
        self.release_tracking();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Drops the debug registration without completing the slot.
    ///
    /// Used by task cancellation: the future stays unfulfilled, but the
    /// abandoned promise must not be reported as a leak.
    pub(crate) fn release_tracking(&self) {
        if let Some(tracking) = self
            .tracking
            .lock()
            .expect("promise tracking lock poisoned")
            .take()
        {
            tracking.registry.release(tracking.id);
        }
    }
}

/// Creates an untracked promise/future pair as raw shared state.
pub(crate) fn pair_with_shared<T>() -> (Arc<Shared<T>>, PromiseFuture<T>) {
    let shared = Shared::new();
    let future = PromiseFuture {
        shared: Arc::clone(&shared),
    };
    (shared, future)
}

/// The writing half of a loop-bound oneshot slot.
///
/// A promise is single-use: completing it consumes the handle. Dropping a
/// tracked promise without completing it is a leak the owning loop reports
/// at destruction in debug builds.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Fulfills the promise with a value.
    pub fn succeed(self, value: T) {
        self.shared.complete(Ok(value));
    }

    /// Fails the promise with a loop error.
    pub fn fail(self, error: LoopError) {
        self.shared.complete(Err(error));
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// The reading half of a loop-bound oneshot slot.
pub struct PromiseFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Future for PromiseFuture<T> {
    type Output = Result<T, LoopError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock().expect("promise lock poisoned");
        match &mut *state {
            SlotState::Pending { waker } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            SlotState::Ready(slot) => {
                let result = slot.take().expect("promise future polled after completion");
                Poll::Ready(result)
            }
        }
    }
}

impl<T> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture").finish_non_exhaustive()
    }
}

/// Debug-build map from promise id to creation site.
#[derive(Debug, Default)]
pub(crate) struct PromiseRegistry {
    entries: Mutex<HashMap<u64, &'static Location<'static>>>,
    next_id: AtomicU64,
}

impl PromiseRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, site: &'static Location<'static>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("promise registry lock poisoned")
            .insert(id, site);
        id
    }

    fn release(&self, id: u64) {
        self.entries
            .lock()
            .expect("promise registry lock poisoned")
            .remove(&id);
    }

    /// Returns the creation sites of every still-uncompleted promise.
    pub(crate) fn leaked(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("promise registry lock poisoned")
            .values()
            .map(|site| format!("{}:{}", site.file(), site.line()))
            .collect()
    }

    pub(crate) fn pending(&self) -> usize {
        self.entries
            .lock()
            .expect("promise registry lock poisoned")
            .len()
    }
}
