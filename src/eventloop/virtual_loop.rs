//! The deterministic virtual-time loop.

use super::promise::{pair_with_shared, LoopError, Promise, PromiseFuture, PromiseRegistry};
use super::task::{Scheduled, ScheduledTask};
use crate::types::Time;
use std::cell::Cell;
use std::collections::BinaryHeap;
use std::mem;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

thread_local! {
    /// Nesting depth of loop work running on this thread.
    static LOOP_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running loop work for the guard's lifetime.
struct InLoopGuard;

impl InLoopGuard {
    fn enter() -> Self {
        LOOP_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for InLoopGuard {
    fn drop(&mut self) {
        LOOP_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Returns true while the current thread is executing loop work.
fn in_loop_context() -> bool {
    LOOP_DEPTH.with(Cell::get) > 0
}

/// Waker that does nothing; `await_future` polls on every spin anyway.
struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

/// Lifecycle of the loop's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Accepting and running tasks.
    Open,
    /// `shutdown_gracefully` is draining; new tasks will be failed.
    Draining,
    /// Drained. New tasks fail immediately.
    Shutdown,
}

/// Queue-confined loop state. All mutation happens under one lock.
#[derive(Debug)]
struct QueueState {
    queue: BinaryHeap<ScheduledTask>,
    insert_seq: u64,
    phase: Phase,
}

#[derive(Debug)]
struct Inner {
    /// Virtual now, in nanoseconds. Monotonic: only ever raised.
    now: AtomicU64,
    /// Task id source; atomic so handles are armed on the submitting thread.
    next_task_id: AtomicU64,
    state: Mutex<QueueState>,
    /// Serializes advancement, drains, and `run_in_context` sections.
    advance: Mutex<()>,
    registry: Arc<PromiseRegistry>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let Ok(state) = self.state.get_mut() else {
            return;
        };
        assert!(
            state.queue.is_empty(),
            "virtual loop dropped with {} tasks still scheduled; advance or shut down first",
            state.queue.len()
        );
        if cfg!(debug_assertions) {
            let leaked = self.registry.leaked();
            assert!(
                leaked.is_empty(),
                "loop promises never completed, created at: {leaked:?}"
            );
        }
    }
}

/// A deterministic, thread-safe, time-controllable executor.
///
/// Time is virtual: it moves only when a caller invokes [`run`](Self::run),
/// [`advance_by`](Self::advance_by), or [`advance_to`](Self::advance_to).
/// Due tasks execute ordered by `(deadline, submission order)`, and tasks
/// sharing a deadline are batched: a task enqueued mid-batch at the same
/// deadline runs in a later iteration of the same advancement, never in the
/// closed batch.
///
/// Handles are `Clone` and cheap; submissions are accepted from any thread.
///
/// # Example
///
/// ```
/// use netweave::eventloop::VirtualLoop;
/// use std::time::Duration;
///
/// let vl = VirtualLoop::new();
/// let task = vl.schedule(Duration::from_millis(5), || 2 + 2);
/// vl.advance_by(Duration::from_millis(5));
/// assert_eq!(vl.now().as_millis(), 5);
/// # drop(task);
/// ```
#[derive(Debug, Clone)]
pub struct VirtualLoop {
    inner: Arc<Inner>,
}

impl VirtualLoop {
    /// Creates an empty loop at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                now: AtomicU64::new(0),
                next_task_id: AtomicU64::new(0),
                state: Mutex::new(QueueState {
                    queue: BinaryHeap::new(),
                    insert_seq: 0,
                    phase: Phase::Open,
                }),
                advance: Mutex::new(()),
                registry: PromiseRegistry::new(),
            }),
        }
    }

    /// Returns the current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        Time::from_nanos(self.inner.now.load(Ordering::Acquire))
    }

    /// Submits work to run at the current virtual time, on the next
    /// advancement. Non-blocking.
    #[track_caller]
    pub fn execute(&self, work: impl FnOnce() + Send + 'static) {
        let _ = self.schedule_at(self.now(), work);
    }

    /// Schedules work to run `delay` after the current virtual time.
    ///
    /// `now` is read at call time, so two equal delays requested in program
    /// order from one thread share a deadline and run FIFO.
    #[track_caller]
    pub fn schedule<T, F>(&self, delay: Duration, work: F) -> Scheduled<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.schedule_at(self.now() + delay, work)
    }

    /// Schedules work to run at an absolute virtual deadline.
    ///
    /// The returned handle carries the result future and a cancellation
    /// operation, armed before the task can possibly run. After shutdown
    /// the task is not queued and its future fails with
    /// [`LoopError::Shutdown`] immediately.
    #[track_caller]
    pub fn schedule_at<T, F>(&self, deadline: Time, work: F) -> Scheduled<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (shared, future) = pair_with_shared::<T>();
        if cfg!(debug_assertions) {
            shared.track(Arc::clone(&self.inner.registry), Location::caller());
        }

        let task = {
            let run_slot = Arc::clone(&shared);
            let fail_slot = Arc::clone(&shared);
            ScheduledTask {
                id,
                ready_at: deadline,
                insert_order: 0,
                work: Box::new(move || run_slot.complete(Ok(work()))),
                fail: Box::new(move |error| fail_slot.complete(Err(error))),
                abandon: Box::new(move || shared.release_tracking()),
            }
        };

        let rejected = {
            let mut state = self.inner.state.lock().expect("loop state lock poisoned");
            if state.phase == Phase::Shutdown {
                Some(task)
            } else {
                let mut task = task;
                task.insert_order = state.insert_seq;
                state.insert_seq += 1;
                tracing::trace!(id, deadline = %deadline, "task scheduled");
                state.queue.push(task);
                None
            }
        };
        if let Some(task) = rejected {
            tracing::trace!(id, "task submitted after shutdown");
            (task.fail)(LoopError::Shutdown);
        }

        Scheduled::new(id, self.clone(), future)
    }

    /// Runs every task due at the current virtual time.
    pub fn run(&self) {
        self.advance_to(self.now());
    }

    /// Advances virtual time by `delta`, running due tasks in order.
    pub fn advance_by(&self, delta: Duration) {
        self.advance_to(self.now() + delta);
    }

    /// Advances virtual time to `target`, running due tasks in order.
    ///
    /// A `target` at or before the current time leaves the clock unchanged
    /// (time never goes backwards) but still runs anything already due.
    pub fn advance_to(&self, target: Time) {
        debug_assert!(
            !in_loop_context(),
            "loop advancement requested from inside loop work"
        );
        let _serial = self.inner.advance.lock().expect("advance lock poisoned");
        let limit = target.later(self.now());

        while let Some((deadline, batch)) = self.pop_due_batch(limit) {
            self.inner.now.fetch_max(deadline.as_nanos(), Ordering::AcqRel);
            tracing::trace!(time = %deadline, tasks = batch.len(), "running batch");
            let _ctx = InLoopGuard::enter();
            for task in batch {
                (task.work)();
            }
        }

        self.inner.now.fetch_max(limit.as_nanos(), Ordering::AcqRel);
    }

    /// Pops the earliest batch of tasks due at or before `limit`.
    ///
    /// The batch is closed at pop time: everything sharing the head task's
    /// deadline, in insertion order, and nothing enqueued afterwards.
    fn pop_due_batch(&self, limit: Time) -> Option<(Time, Vec<ScheduledTask>)> {
        let mut state = self.inner.state.lock().expect("loop state lock poisoned");
        let deadline = state.queue.peek().map(|task| task.ready_at)?;
        if deadline > limit {
            return None;
        }
        let mut batch = Vec::new();
        while state
            .queue
            .peek()
            .is_some_and(|task| task.ready_at == deadline)
        {
            if let Some(task) = state.queue.pop() {
                batch.push(task);
            }
        }
        Some((deadline, batch))
    }

    /// Runs `work` with the guarantee that no other loop work interleaves.
    pub fn run_in_context<R>(&self, work: impl FnOnce() -> R) -> R {
        debug_assert!(
            !in_loop_context(),
            "run_in_context requested from inside loop work"
        );
        let _serial = self.inner.advance.lock().expect("advance lock poisoned");
        let _ctx = InLoopGuard::enter();
        work()
    }

    /// Resolves a loop-bound future from outside the loop.
    ///
    /// Because such futures complete only when the loop runs, this spins:
    /// run due tasks, poll, yield. If `timeout` (wall clock) elapses first,
    /// one final `run` delivers any completion racing the deadline before
    /// the timeout is reported.
    ///
    /// # Errors
    ///
    /// [`LoopError::TimeoutAwaitingFuture`] if the future is still pending
    /// after `timeout`.
    pub fn await_future<F: std::future::Future>(
        &self,
        future: F,
        timeout: Duration,
    ) -> Result<F::Output, LoopError> {
        debug_assert!(
            !in_loop_context(),
            "await_future would deadlock from inside loop work"
        );
        let deadline = Instant::now() + timeout;
        let mut future = std::pin::pin!(future);
        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);

        loop {
            self.run();
            if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                // Final run: a completion posted just before the deadline
                // must be observed as success, not as a timeout.
                self.run();
                if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
                    return Ok(value);
                }
                tracing::debug!(?timeout, "await_future timed out");
                return Err(LoopError::TimeoutAwaitingFuture);
            }
            std::thread::yield_now();
        }
    }

    /// Drains the loop and refuses further work.
    ///
    /// Every task enqueued before the call runs to completion in deadline
    /// order, advancing `now` accordingly. Tasks enqueued *during* the
    /// drain fail with [`LoopError::Shutdown`], as does everything
    /// submitted afterwards. Idempotent.
    pub fn shutdown_gracefully(&self) {
        debug_assert!(
            !in_loop_context(),
            "shutdown requested from inside loop work"
        );
        let _serial = self.inner.advance.lock().expect("advance lock poisoned");
        {
            let mut state = self.inner.state.lock().expect("loop state lock poisoned");
            if state.phase == Phase::Shutdown {
                return;
            }
            state.phase = Phase::Draining;
        }

        let mut snapshot = {
            let mut state = self.inner.state.lock().expect("loop state lock poisoned");
            mem::take(&mut state.queue)
        };
        tracing::debug!(tasks = snapshot.len(), "draining loop for shutdown");
        {
            let _ctx = InLoopGuard::enter();
            while let Some(task) = snapshot.pop() {
                self.inner
                    .now
                    .fetch_max(task.ready_at.as_nanos(), Ordering::AcqRel);
                (task.work)();
            }
        }

        let mut late = {
            let mut state = self.inner.state.lock().expect("loop state lock poisoned");
            state.phase = Phase::Shutdown;
            mem::take(&mut state.queue)
        };
        if !late.is_empty() {
            tracing::debug!(tasks = late.len(), "failing tasks enqueued during drain");
        }
        while let Some(task) = late.pop() {
            (task.fail)(LoopError::Shutdown);
        }
    }

    /// Creates a promise bound to this loop.
    ///
    /// In debug builds the creation site is recorded; dropping the loop
    /// while the promise was never completed trips an assertion naming the
    /// site. Completion (success or failure) clears the record.
    #[track_caller]
    #[must_use]
    pub fn make_promise<T>(&self) -> (Promise<T>, PromiseFuture<T>) {
        let (shared, future) = pair_with_shared::<T>();
        if cfg!(debug_assertions) {
            shared.track(Arc::clone(&self.inner.registry), Location::caller());
        }
        (Promise::from_shared(shared), future)
    }

    /// Removes a queued task by id. No-op for ids that already ran.
    pub(crate) fn cancel_task(&self, id: u64) {
        let removed = {
            let mut state = self.inner.state.lock().expect("loop state lock poisoned");
            let tasks = mem::take(&mut state.queue).into_vec();
            let mut removed = None;
            let mut kept = Vec::with_capacity(tasks.len());
            for task in tasks {
                if task.id == id {
                    removed = Some(task);
                } else {
                    kept.push(task);
                }
            }
            state.queue = BinaryHeap::from(kept);
            removed
        };
        if let Some(task) = removed {
            tracing::trace!(id, deadline = %task.ready_at, "task cancelled");
            (task.abandon)();
        }
    }
}

impl Default for VirtualLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let log = Arc::clone(&log);
            move |entry| log.lock().unwrap().push(entry)
        };
        (log, sink)
    }

    #[test]
    fn fresh_loop_is_at_time_zero() {
        let vl = VirtualLoop::new();
        assert_eq!(vl.now(), Time::ZERO);
    }

    #[test]
    fn execute_runs_on_next_run() {
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        vl.execute({
            let sink = sink.clone();
            move || sink("a")
        });
        assert!(log.lock().unwrap().is_empty());
        vl.run();
        assert_eq!(*log.lock().unwrap(), ["a"]);
        assert_eq!(vl.now(), Time::ZERO);
    }

    #[test]
    fn immediate_and_delayed_tasks_interleave_deterministically() {
        // execute(A), schedule(10ms, B), execute(C) → A, C, B.
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        vl.execute({
            let sink = sink.clone();
            move || sink("a")
        });
        let b = vl.schedule(Duration::from_millis(10), {
            let sink = sink.clone();
            move || sink("b")
        });
        vl.execute({
            let sink = sink.clone();
            move || sink("c")
        });

        vl.advance_by(Duration::from_millis(10));
        assert_eq!(*log.lock().unwrap(), ["a", "c", "b"]);
        assert_eq!(vl.now(), Time::from_millis(10));
        assert_eq!(block_on(b), Ok(()));
    }

    #[test]
    fn tasks_run_once_in_deadline_order() {
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        for (deadline, label) in [(3, "t3"), (1, "t1"), (2, "t2"), (1, "t1-again")] {
            let sink = sink.clone();
            let _ = vl.schedule_at(Time::from_millis(deadline), move || sink(label));
        }
        vl.advance_to(Time::from_millis(3));
        assert_eq!(*log.lock().unwrap(), ["t1", "t1-again", "t2", "t3"]);

        // A second advance runs nothing further.
        vl.advance_to(Time::from_millis(5));
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[test]
    fn advancing_to_the_past_keeps_now_but_runs_due_tasks() {
        let vl = VirtualLoop::new();
        vl.advance_to(Time::from_millis(8));
        assert_eq!(vl.now(), Time::from_millis(8));

        let (log, sink) = recorder();
        let _ = vl.schedule_at(Time::from_millis(2), move || sink("overdue"));
        vl.advance_to(Time::from_millis(1));
        assert_eq!(*log.lock().unwrap(), ["overdue"]);
        assert_eq!(vl.now(), Time::from_millis(8));
    }

    #[test]
    fn scheduled_future_resolves_to_task_result() {
        let vl = VirtualLoop::new();
        let task = vl.schedule(Duration::from_millis(1), || 6 * 7);
        vl.advance_by(Duration::from_millis(1));
        assert_eq!(block_on(task), Ok(42));
    }

    #[test]
    fn same_deadline_task_enqueued_mid_batch_runs_next_iteration() {
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        let nested_loop = vl.clone();
        let nested_sink = sink.clone();
        let _ = vl.schedule_at(Time::from_millis(5), move || {
            sink("outer");
            // now is already 5ms here, so this lands at the same deadline.
            nested_loop.execute(move || nested_sink("nested"));
        });

        vl.advance_to(Time::from_millis(5));
        assert_eq!(*log.lock().unwrap(), ["outer", "nested"]);
    }

    #[test]
    fn tasks_scheduled_beyond_the_advance_target_stay_queued() {
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        let far = vl.schedule_at(Time::from_millis(100), {
            let sink = sink.clone();
            move || sink("far")
        });
        vl.advance_to(Time::from_millis(10));
        assert!(log.lock().unwrap().is_empty());

        far.cancel();
        vl.run();
    }

    #[test]
    fn cancellation_prevents_execution() {
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        let task = vl.schedule(Duration::from_millis(5), move || sink("x"));
        task.cancel();
        vl.advance_by(Duration::from_millis(5));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(vl.now(), Time::from_millis(5));
    }

    #[test]
    fn cancelling_a_finished_task_is_a_noop() {
        let vl = VirtualLoop::new();
        let task = vl.schedule(Duration::from_millis(1), || ());
        vl.advance_by(Duration::from_millis(1));
        task.cancel();
        task.cancel();
        assert_eq!(block_on(task), Ok(()));
    }

    #[test]
    fn cancellation_only_removes_its_own_task() {
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        let doomed = vl.schedule_at(Time::from_millis(1), {
            let sink = sink.clone();
            move || sink("doomed")
        });
        let _survivor = vl.schedule_at(Time::from_millis(1), move || sink("survivor"));
        doomed.cancel();
        vl.advance_to(Time::from_millis(1));
        assert_eq!(*log.lock().unwrap(), ["survivor"]);
    }

    #[test]
    fn shutdown_drains_in_deadline_order_and_fails_late_tasks() {
        let vl = VirtualLoop::new();
        let (log, sink) = recorder();
        let late_slot = Arc::new(Mutex::new(None));

        for (deadline, label) in [(0, "t0"), (1, "t1")] {
            let sink = sink.clone();
            let _ = vl.schedule_at(Time::from_millis(deadline), move || sink(label));
        }
        let drained_loop = vl.clone();
        let drained_sink = sink.clone();
        let slot = Arc::clone(&late_slot);
        let _ = vl.schedule_at(Time::from_millis(2), move || {
            drained_sink("t2");
            let late = drained_loop.schedule(Duration::from_millis(1), || ());
            *slot.lock().unwrap() = Some(late);
        });

        vl.shutdown_gracefully();

        assert_eq!(*log.lock().unwrap(), ["t0", "t1", "t2"]);
        assert!(vl.now() >= Time::from_millis(2));

        let late = late_slot.lock().unwrap().take().expect("late task handle");
        assert_eq!(block_on(late), Err(LoopError::Shutdown));
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_new_work() {
        let vl = VirtualLoop::new();
        vl.shutdown_gracefully();
        vl.shutdown_gracefully();

        let rejected = vl.schedule(Duration::from_millis(1), || ());
        assert_eq!(block_on(rejected), Err(LoopError::Shutdown));
    }

    #[test]
    fn run_in_context_returns_the_closure_result() {
        let vl = VirtualLoop::new();
        assert_eq!(vl.run_in_context(|| 5), 5);
    }

    #[test]
    fn await_future_resolves_via_loop_progress() {
        let vl = VirtualLoop::new();
        let (promise, future) = vl.make_promise::<u32>();
        vl.execute(move || promise.succeed(42));
        let value = vl.await_future(future, Duration::from_secs(5));
        assert_eq!(value, Ok(Ok(42)));
    }

    #[test]
    fn await_future_resolves_cross_thread_submissions() {
        let vl = VirtualLoop::new();
        let (promise, future) = vl.make_promise::<&'static str>();
        let submitter = vl.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            submitter.execute(move || promise.succeed("done"));
        });

        let value = vl.await_future(future, Duration::from_secs(5));
        assert_eq!(value, Ok(Ok("done")));
        handle.join().unwrap();
    }

    #[test]
    fn await_future_times_out() {
        let vl = VirtualLoop::new();
        let (promise, future) = vl.make_promise::<u32>();
        let result = vl.await_future(future, Duration::from_millis(20));
        assert_eq!(result, Err(LoopError::TimeoutAwaitingFuture));
        promise.fail(LoopError::TimeoutAwaitingFuture);
    }

    #[test]
    fn now_is_monotonic_across_mixed_advancement() {
        let vl = VirtualLoop::new();
        vl.advance_to(Time::from_millis(10));
        vl.advance_to(Time::from_millis(3));
        assert_eq!(vl.now(), Time::from_millis(10));
        vl.advance_by(Duration::from_millis(2));
        assert_eq!(vl.now(), Time::from_millis(12));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn completion_clears_promise_tracking() {
        let vl = VirtualLoop::new();
        let (promise, future) = vl.make_promise::<()>();
        assert_eq!(vl.inner.registry.pending(), 1);
        promise.succeed(());
        assert_eq!(vl.inner.registry.pending(), 0);
        assert_eq!(block_on(future), Ok(()));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn cancelled_tasks_are_not_reported_as_leaks() {
        let vl = VirtualLoop::new();
        let task = vl.schedule(Duration::from_millis(1), || ());
        assert_eq!(vl.inner.registry.pending(), 1);
        task.cancel();
        assert_eq!(vl.inner.registry.pending(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "await_future would deadlock")]
    fn awaiting_from_inside_loop_work_is_a_programmer_error() {
        let vl = VirtualLoop::new();
        let inner = vl.clone();
        vl.execute(move || {
            let (_promise, future) = inner.make_promise::<()>();
            let _ = inner.await_future(future, Duration::from_millis(1));
        });
        vl.run();
    }
}
