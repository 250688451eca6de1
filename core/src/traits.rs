//! Transport seam between the action layer and the HTTP client
//!
//! The trait is defined in core so the dispatcher and engine can be driven by
//! in-memory transports in tests. The reqwest implementation lives in
//! `boutsim-client`.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

/// HTTP method subset used by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl Method {
    /// Upper-case method name
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Outcome of one buffered call
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status of the final attempt
    pub status: u16,
    /// Time from the first attempt to the end of the body
    pub duration: Duration,
    /// Attempts made (1 = no retry)
    pub attempts: u32,
    /// Raw response body
    pub body: Bytes,
}

impl ApiResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Streamed response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Live streaming response; the caller owns the body and drops it to close
pub struct StreamResponse {
    /// HTTP status (always 200 when returned)
    pub status: u16,
    /// Response headers, lower-cased names
    pub headers: Vec<(String, String)>,
    /// Time until response headers arrived
    pub duration: Duration,
    /// Body chunks
    pub body: ByteStream,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("duration", &self.duration)
            .finish()
    }
}

/// Transport-level failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection, TLS, timeout or body read failure
    #[error("network error: {0}")]
    Network(String),

    /// Non-success status on a call that does not return statuses as data
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status
        status: u16,
        /// Response body text (possibly truncated)
        body: String,
    },

    /// The request body could not be encoded
    #[error("failed to encode request body: {0}")]
    Encode(String),

    /// The run was cancelled while the call was in flight
    #[error("request cancelled")]
    Cancelled,
}

/// HTTP transport used by the action layer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Buffered call with retry.
    ///
    /// Statuses, including retryable ones after exhaustion, are returned as
    /// `Ok`; only network failures and cancellation are errors.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        account: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, TransportError>;

    /// Streaming call without retry; any status other than 200 is an error.
    async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        account: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<StreamResponse, TransportError>;
}
