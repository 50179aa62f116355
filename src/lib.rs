//! Netweave: event-loop networking toolkit. WebSocket upgrades and a
//! deterministic virtual-time loop.
//!
//! # Overview
//!
//! This crate carries the two protocol-and-scheduling cores of the toolkit:
//!
//! - A **server-side WebSocket upgrade engine** ([`websocket::ServerUpgrader`])
//!   that validates RFC 6455 handshake headers, derives the accept token, and
//!   rewires a channel pipeline from HTTP framing to WebSocket frame codecs.
//! - A **virtual-time event loop** ([`eventloop::VirtualLoop`]) for tests and
//!   simulations: tasks are keyed by a virtual deadline, time advances only on
//!   explicit request, and execution order is fully deterministic.
//!
//! # Core Guarantees
//!
//! - **Deterministic scheduling**: tasks run ordered by `(deadline,
//!   submission order)`; equal deadlines execute FIFO.
//! - **Monotonic virtual time**: the loop clock never moves backwards.
//! - **Graceful shutdown**: every enqueued task is either run or failed with
//!   a shutdown error; nothing is silently dropped.
//! - **Pure handshake**: the upgrade accept token is a pure function of the
//!   client key, and no pipeline mutation happens before validation passes.
//!
//! # Module Structure
//!
//! - [`types`]: virtual timestamps
//! - [`http`]: request-head data model and the header multimap
//! - [`pipeline`]: channel handle and ordered handler chain
//! - [`codec`]: `Decoder`/`Encoder` seam and the byte-to-message adapter
//! - [`websocket`]: frame codec and the server upgrade engine
//! - [`eventloop`]: the virtual-time loop, scheduled tasks, and promises

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod codec;
pub mod eventloop;
pub mod http;
pub mod pipeline;
pub mod types;
pub mod websocket;

pub use codec::{ByteToMessageHandler, Decoder, Encoder};
pub use eventloop::{LoopError, Promise, PromiseFuture, Scheduled, VirtualLoop};
pub use http::{Headers, Method, RequestHead, Version};
pub use pipeline::{Channel, ChannelHandler, Pipeline, PipelineError};
pub use types::Time;
pub use websocket::{
    accept_key, Frame, FrameDecoder, FrameEncoder, FrameError, Opcode, ProtocolErrorHandler,
    ServerUpgrader, UpgradeError,
};
