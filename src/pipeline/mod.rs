//! Channel handle and the ordered handler pipeline.
//!
//! A [`Channel`] is an opaque connection handle. Its [`Pipeline`] is the
//! ordered chain of handlers that process bytes and messages on that
//! connection; protocol upgrades rewire a connection by appending codec
//! handlers to the chain.
//!
//! This module deliberately exposes a narrow surface: handlers are appended
//! in order and can be enumerated. Driving bytes through the chain belongs
//! to the transport layer, not to the upgrade engine.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A handler installed on a channel pipeline.
pub trait ChannelHandler: Send + 'static {
    /// Stable name identifying the handler in the chain.
    fn name(&self) -> &'static str;
}

/// Errors raised by pipeline mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    /// The channel was closed before the operation could complete.
    ChannelClosed,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for PipelineError {}

/// An opaque handle to an established connection.
///
/// Cloning is cheap; all clones observe the same pipeline and open state.
#[derive(Debug, Clone)]
pub struct Channel {
    pipeline: Pipeline,
    open: Arc<AtomicBool>,
}

impl Channel {
    /// Creates an open channel with an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        let open = Arc::new(AtomicBool::new(true));
        Self {
            pipeline: Pipeline::new(Arc::clone(&open)),
            open,
        }
    }

    /// Returns the channel's pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns true until [`close`](Self::close) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closes the channel. Subsequent pipeline mutation fails.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered chain of channel handlers.
#[derive(Clone)]
pub struct Pipeline {
    handlers: Arc<Mutex<Vec<Box<dyn ChannelHandler>>>>,
    open: Arc<AtomicBool>,
}

impl Pipeline {
    fn new(open: Arc<AtomicBool>) -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
            open,
        }
    }

    /// Appends a handler at the tail of the chain.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::ChannelClosed`] once the owning channel
    /// is closed.
    #[allow(clippy::unused_async)]
    pub async fn add_handler(&self, handler: Box<dyn ChannelHandler>) -> Result<(), PipelineError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(PipelineError::ChannelClosed);
        }
        tracing::trace!(handler = handler.name(), "appending pipeline handler");
        self.handlers
            .lock()
            .expect("pipeline lock poisoned")
            .push(handler);
        Ok(())
    }

    /// Returns the number of installed handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().expect("pipeline lock poisoned").len()
    }

    /// Returns true if no handlers are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the handler names in chain order.
    #[must_use]
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers
            .lock()
            .expect("pipeline lock poisoned")
            .iter()
            .map(|h| h.name())
            .collect()
    }

    /// Returns true if a handler with the given name is installed.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handler_names().iter().any(|n| *n == name)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handler_names())
            .field("open", &self.open.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;

    struct Named(&'static str);

    impl ChannelHandler for Named {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn handlers_append_in_order() {
        let channel = Channel::new();
        block_on(async {
            channel.pipeline().add_handler(Box::new(Named("a"))).await.unwrap();
            channel.pipeline().add_handler(Box::new(Named("b"))).await.unwrap();
            channel.pipeline().add_handler(Box::new(Named("c"))).await.unwrap();
        });
        assert_eq!(channel.pipeline().handler_names(), ["a", "b", "c"]);
        assert!(channel.pipeline().contains("b"));
        assert!(!channel.pipeline().contains("d"));
    }

    #[test]
    fn closed_channel_rejects_handlers() {
        let channel = Channel::new();
        channel.close();
        assert!(!channel.is_open());
        let err = block_on(channel.pipeline().add_handler(Box::new(Named("late"))));
        assert_eq!(err, Err(PipelineError::ChannelClosed));
        assert!(channel.pipeline().is_empty());
    }

    #[test]
    fn clones_share_state() {
        let channel = Channel::new();
        let clone = channel.clone();
        block_on(channel.pipeline().add_handler(Box::new(Named("shared")))).unwrap();
        assert_eq!(clone.pipeline().len(), 1);
        clone.close();
        assert!(!channel.is_open());
    }
}
