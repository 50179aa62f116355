//! Server-side WebSocket upgrade engine (RFC 6455 Section 4.2).
//!
//! The upgrader plugs into an HTTP/1.1 server's upgrade machinery. It
//! advertises the single `websocket` upgrade token and declares no required
//! upgrade headers; the RFC does not oblige clients to list the
//! `Sec-WebSocket-*` headers in `Upgrade`, so the upgrader checks them
//! itself:
//!
//! 1. [`ServerUpgrader::build_upgrade_response`] validates the request and
//!    produces the `101 Switching Protocols` headers. Nothing is mutated.
//! 2. After the enclosing server has flushed the response,
//!    [`ServerUpgrader::upgrade`] installs the frame codecs on the channel
//!    pipeline and hands control to the user hook.
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```

use super::frame::{FrameDecoder, FrameEncoder, ProtocolErrorHandler};
use crate::codec::ByteToMessageHandler;
use crate::http::{Headers, RequestHead};
use crate::pipeline::{Channel, PipelineError};
use base64::Engine;
use core::fmt;
use sha1::{Digest, Sha1};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// RFC 6455 GUID mixed into the accept token.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default maximum frame size accepted after the upgrade (16 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// The token is the Base64-encoded SHA-1 digest of the verbatim key
/// concatenated with the protocol GUID; it proves to the client that the
/// server understood the handshake.
///
/// # Example
///
/// ```
/// use netweave::websocket::accept_key;
///
/// let accept = accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Upgrade request validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeError {
    /// A required header is missing, duplicated, or has an unsupported
    /// value.
    InvalidUpgradeHeader,
    /// The upgrade callback declined the request.
    UnsupportedWebSocketTarget,
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUpgradeHeader => write!(f, "invalid websocket upgrade header"),
            Self::UnsupportedWebSocketTarget => write!(f, "websocket target not supported"),
        }
    }
}

impl std::error::Error for UpgradeError {}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type ShouldUpgrade =
    Arc<dyn Fn(Channel, RequestHead) -> BoxFuture<Result<Option<Headers>, UpgradeError>> + Send + Sync>;
type UpgradeHook =
    Arc<dyn Fn(Channel, RequestHead) -> BoxFuture<Result<(), PipelineError>> + Send + Sync>;

/// Server-side WebSocket upgrade engine.
///
/// Holds no mutable state after construction; a single upgrader can serve
/// any number of channels concurrently.
#[derive(Clone)]
pub struct ServerUpgrader {
    max_frame_size: usize,
    automatic_error_handling: bool,
    should_upgrade: ShouldUpgrade,
    upgrade_pipeline_handler: UpgradeHook,
}

impl ServerUpgrader {
    /// Creates an upgrader from its two callbacks.
    ///
    /// `should_upgrade` decides whether a request is accepted: `Ok(Some)`
    /// accepts and merges the returned headers into the response,
    /// `Ok(None)` rejects with [`UpgradeError::UnsupportedWebSocketTarget`],
    /// and `Err` propagates verbatim. `upgrade_pipeline_handler` runs after
    /// the frame codecs are installed and typically appends the
    /// application's own handlers.
    pub fn new<S, SF, H, HF>(should_upgrade: S, upgrade_pipeline_handler: H) -> Self
    where
        S: Fn(Channel, RequestHead) -> SF + Send + Sync + 'static,
        SF: Future<Output = Result<Option<Headers>, UpgradeError>> + Send + 'static,
        H: Fn(Channel, RequestHead) -> HF + Send + Sync + 'static,
        HF: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            automatic_error_handling: true,
            should_upgrade: Arc::new(
                move |channel: Channel,
                      request: RequestHead|
                      -> BoxFuture<Result<Option<Headers>, UpgradeError>> {
                    Box::pin(should_upgrade(channel, request))
                },
            ),
            upgrade_pipeline_handler: Arc::new(
                move |channel: Channel,
                      request: RequestHead|
                      -> BoxFuture<Result<(), PipelineError>> {
                    Box::pin(upgrade_pipeline_handler(channel, request))
                },
            ),
        }
    }

    /// Sets the maximum frame payload size enforced after the upgrade.
    ///
    /// # Panics
    ///
    /// Panics unless `size` is in `1..=u32::MAX`. The RFC permits 64-bit
    /// lengths on the wire, but this engine caps a single frame at what a
    /// 32-bit length can carry.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        assert!(
            size > 0 && size as u64 <= u64::from(u32::MAX),
            "max frame size must be in 1..=u32::MAX, got {size}"
        );
        self.max_frame_size = size;
        self
    }

    /// Enables or disables installation of the protocol error handler
    /// during [`upgrade`](Self::upgrade). Defaults to enabled.
    #[must_use]
    pub const fn automatic_error_handling(mut self, enabled: bool) -> Self {
        self.automatic_error_handling = enabled;
        self
    }

    /// The single `Upgrade` token this engine negotiates.
    #[must_use]
    pub const fn supported_protocol(&self) -> &'static str {
        "websocket"
    }

    /// Headers the enclosing upgrade machinery must require: none.
    ///
    /// The `Sec-WebSocket-*` headers are validated here instead, because
    /// clients are not required to advertise them in `Upgrade`.
    #[must_use]
    pub const fn required_upgrade_headers(&self) -> &'static [&'static str] {
        &[]
    }

    /// Validates the upgrade request and produces the response headers.
    ///
    /// On acceptance the returned set is `base_headers` plus
    /// `Upgrade: websocket`, `Sec-WebSocket-Accept`, `Connection: upgrade`,
    /// and whatever the upgrade callback returned, verbatim. The pipeline
    /// is not touched; rejection leaves no trace on the channel.
    ///
    /// # Errors
    ///
    /// [`UpgradeError::InvalidUpgradeHeader`] when `Sec-WebSocket-Key` is
    /// not exactly single-valued or `Sec-WebSocket-Version` is not exactly
    /// `"13"`; [`UpgradeError::UnsupportedWebSocketTarget`] when the
    /// callback declines; any error the callback itself returns.
    pub async fn build_upgrade_response(
        &self,
        channel: &Channel,
        request: &RequestHead,
        base_headers: Headers,
    ) -> Result<Headers, UpgradeError> {
        let Some(key) = request.headers.exactly_one("sec-websocket-key") else {
            tracing::debug!(uri = %request.uri, "rejecting upgrade: bad Sec-WebSocket-Key");
            return Err(UpgradeError::InvalidUpgradeHeader);
        };
        let key = key.to_owned();

        match request.headers.exactly_one("sec-websocket-version") {
            Some("13") => {}
            other => {
                tracing::debug!(
                    uri = %request.uri,
                    version = ?other,
                    "rejecting upgrade: unsupported Sec-WebSocket-Version"
                );
                return Err(UpgradeError::InvalidUpgradeHeader);
            }
        }

        let decision = (self.should_upgrade)(channel.clone(), request.clone()).await?;
        let Some(extra_headers) = decision else {
            tracing::debug!(uri = %request.uri, "upgrade declined by callback");
            return Err(UpgradeError::UnsupportedWebSocketTarget);
        };

        let accept = accept_key(&key);
        tracing::debug!(uri = %request.uri, accept = %accept, "accepted websocket upgrade");

        let mut headers = base_headers;
        headers.replace_or_add("Upgrade", "websocket");
        headers.add("Sec-WebSocket-Accept", accept);
        headers.replace_or_add("Connection", "upgrade");
        for (name, value) in extra_headers.iter() {
            headers.add(name, value);
        }
        Ok(headers)
    }

    /// Rewires the channel for WebSocket framing.
    ///
    /// Called after the `101` response has been flushed. Installs the frame
    /// encoder, the byte-to-message decoder (its own error hook disabled so
    /// errors surface to the pipeline), and, when automatic error handling
    /// is on, the protocol error handler; then invokes the pipeline hook.
    /// A failure mid-sequence propagates and leaves already-installed
    /// handlers in place; teardown is the pipeline's responsibility.
    pub async fn upgrade(
        &self,
        channel: &Channel,
        request: &RequestHead,
    ) -> Result<(), PipelineError> {
        let pipeline = channel.pipeline();
        pipeline.add_handler(Box::new(FrameEncoder::new())).await?;

        let decoder = FrameDecoder::new(self.max_frame_size).automatic_error_handling(false);
        pipeline
            .add_handler(Box::new(ByteToMessageHandler::new(decoder)))
            .await?;

        if self.automatic_error_handling {
            pipeline
                .add_handler(Box::new(ProtocolErrorHandler::new()))
                .await?;
        }

        tracing::debug!(uri = %request.uri, "websocket frame codecs installed");
        (self.upgrade_pipeline_handler)(channel.clone(), request.clone()).await
    }
}

impl fmt::Debug for ServerUpgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerUpgrader")
            .field("max_frame_size", &self.max_frame_size)
            .field("automatic_error_handling", &self.automatic_error_handling)
            .finish_non_exhaustive()
    }
}
