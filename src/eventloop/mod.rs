//! Deterministic virtual-time executor.
//!
//! [`VirtualLoop`] drives asynchronous networking code in tests and
//! simulations. It is single-threaded *by queue*: work may be submitted
//! from any thread, but every queue mutation is serialized, and tasks only
//! run when a caller advances virtual time.
//!
//! # Determinism Guarantees
//!
//! - Tasks execute ordered by `(deadline, submission order)`.
//! - Equal deadlines form a closed batch: "simultaneous" events run FIFO,
//!   and work enqueued mid-batch never jumps into the running batch.
//! - `now` is monotonic; advancement to the past is a no-op for the clock.
//!
//! # Example
//!
//! ```
//! use netweave::eventloop::VirtualLoop;
//! use std::time::Duration;
//!
//! let vl = VirtualLoop::new();
//! let answer = vl.schedule(Duration::from_millis(3), || 42);
//! vl.advance_by(Duration::from_millis(3));
//! assert_eq!(vl.await_future(answer, Duration::from_secs(1)), Ok(Ok(42)));
//! vl.shutdown_gracefully();
//! ```

mod promise;
mod task;
mod virtual_loop;

pub use promise::{LoopError, Promise, PromiseFuture};
pub use task::Scheduled;
pub use virtual_loop::VirtualLoop;
