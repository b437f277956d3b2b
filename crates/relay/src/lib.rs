//! Upstream relay strategies
//!
//! Defines the `Relay` trait that decouples the forwarder from how a call
//! reaches the upstream. Both strategies turn one upstream call into either a
//! buffered body or a lazy sequence of output frames:
//!
//! - `StructuredRelay` rebuilds a typed completion request and talks to the
//!   upstream through `CompletionClient`, re-emitting streamed chunks as
//!   server-sent event frames.
//! - `PassthroughRelay` forwards method, path, headers and body untouched and
//!   relays the raw response bytes, split on event-stream frame boundaries.

pub mod client;
pub mod framer;
pub mod headers;
pub mod passthrough;
pub mod structured;

#[cfg(test)]
mod testing;

pub use client::{ClientError, CompletionClient, CompletionRequest, Endpoint};
pub use framer::FrameSplitter;
pub use passthrough::PassthroughRelay;
pub use structured::{StructuredRelay, error_frame};

use bytes::Bytes;
use common::Secret;
use futures_util::Stream;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::pin::Pin;

/// Lazy, finite sequence of output frames from one upstream call.
///
/// Dropping the stream drops the upstream response and aborts the read.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One inbound request, ready to go upstream.
#[derive(Debug)]
pub struct UpstreamCall {
    pub method: Method,
    /// Path relative to the upstream base URL, including any query string.
    pub path: String,
    /// Inbound request headers, unfiltered.
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Key to authenticate with; `None` for public endpoints.
    pub credential: Option<Secret<String>>,
}

/// What the upstream answered.
///
/// Non-2xx answers are data, not errors: they come back as `Buffered` with
/// the upstream status so the caller can relay and inspect them.
pub enum RelayResponse {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Streaming {
        status: StatusCode,
        headers: HeaderMap,
        frames: FrameStream,
    },
}

impl RelayResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayResponse::Buffered { status, .. } | RelayResponse::Streaming { status, .. } => {
                *status
            }
        }
    }
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayResponse::Buffered { status, body, .. } => f
                .debug_struct("Buffered")
                .field("status", status)
                .field("body_len", &body.len())
                .finish(),
            RelayResponse::Streaming { status, .. } => {
                f.debug_struct("Streaming").field("status", status).finish()
            }
        }
    }
}

/// Errors from relaying a call.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The strategy does not serve this path.
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error("invalid request body: {0}")]
    InvalidRequest(String),

    /// No usable response (connect failure, timeout, broken body).
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The upstream reported an error inside a stream that had already started.
    #[error("upstream reported an error mid-stream")]
    Stream { body: Bytes },
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// One way of getting a call to the upstream and its answer back.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Relay>`).
pub trait Relay: Send + Sync {
    /// Identifier for logging (e.g. "structured", "passthrough").
    fn id(&self) -> &str;

    /// Reject a call this relay cannot serve, before a key is spent on it.
    ///
    /// `path` is relative to the upstream base URL, without query string.
    fn check(&self, _path: &str, _body: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Send `call` upstream and hand back its answer.
    fn dispatch(
        &self,
        call: UpstreamCall,
    ) -> Pin<Box<dyn Future<Output = Result<RelayResponse>> + Send + '_>>;
}

/// Strip the query string from a relative path.
pub(crate) fn path_only(path: &str) -> &str {
    path.split_once('?').map_or(path, |(p, _)| p)
}
