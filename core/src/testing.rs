//! In-memory transport for unit and engine tests

#![allow(missing_docs, dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use futures::StreamExt;

use crate::traits::{ApiResponse, ByteStream, Method, StreamResponse, Transport, TransportError};

/// One recorded call
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub account: Option<String>,
    pub body: Option<serde_json::Value>,
    pub streaming: bool,
}

/// What the mock answers with
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, &'static str),
    Stream(Vec<&'static str>),
    /// Chunks, then a body read error
    Broken(Vec<&'static str>),
    /// Chunks, then a body that never ends
    Stall(Vec<&'static str>),
    Fail(TransportError),
}

fn chunks_of(chunks: Vec<&'static str>) -> Vec<Result<Bytes, TransportError>> {
    chunks
        .into_iter()
        .map(|c| Ok(Bytes::from_static(c.as_bytes())))
        .collect()
}

fn event_stream(body: ByteStream) -> StreamResponse {
    StreamResponse {
        status: 200,
        headers: vec![("content-type".into(), "text/event-stream".into())],
        duration: Duration::ZERO,
        body,
    }
}

type Responder = Box<dyn Fn(&Call) -> Reply + Send + Sync>;

pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    responder: Responder,
    latency: Duration,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&Call) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            latency: Duration::ZERO,
        }
    }

    /// Answers every buffered call with 200 `{}` and every stream with `chunks`
    pub fn ok_with_stream(chunks: Vec<&'static str>) -> Self {
        Self::new(move |call| {
            if call.streaming {
                Reply::Stream(chunks.clone())
            } else {
                Reply::Status(200, "{}")
            }
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.path.clone()).collect()
    }

    async fn answer(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        account: Option<&str>,
        body: Option<&serde_json::Value>,
        streaming: bool,
    ) -> Result<Reply, TransportError> {
        let call = Call {
            method,
            path: path.to_string(),
            account: account.map(str::to_string),
            body: body.cloned(),
            streaming,
        };
        let reply = (self.responder)(&call);
        self.calls.lock().push(call);

        if !self.latency.is_zero() {
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.latency) => false,
            };
            if cancelled {
                return Err(TransportError::Cancelled);
            }
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        account: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, TransportError> {
        match self
            .answer(cancel, method, path, account, body, false)
            .await?
        {
            Reply::Status(status, text) => Ok(ApiResponse {
                status,
                duration: self.latency,
                attempts: 1,
                body: Bytes::from_static(text.as_bytes()),
            }),
            Reply::Stream(_) | Reply::Broken(_) | Reply::Stall(_) => Ok(ApiResponse {
                status: 200,
                duration: self.latency,
                attempts: 1,
                body: Bytes::new(),
            }),
            Reply::Fail(e) => Err(e),
        }
    }

    async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        account: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<StreamResponse, TransportError> {
        match self
            .answer(cancel, method, path, account, body, true)
            .await?
        {
            Reply::Stream(chunks) => Ok(event_stream(Box::pin(futures::stream::iter(
                chunks_of(chunks),
            )))),
            Reply::Broken(chunks) => {
                let failure = Err(TransportError::Network("connection reset".into()));
                Ok(event_stream(Box::pin(
                    futures::stream::iter(chunks_of(chunks)).chain(futures::stream::once(
                        futures::future::ready(failure),
                    )),
                )))
            }
            Reply::Stall(chunks) => Ok(event_stream(Box::pin(
                futures::stream::iter(chunks_of(chunks)).chain(futures::stream::pending()),
            ))),
            Reply::Status(200, _) => Ok(StreamResponse {
                status: 200,
                headers: Vec::new(),
                duration: self.latency,
                body: Box::pin(futures::stream::empty()),
            }),
            Reply::Status(status, text) => Err(TransportError::Status {
                status,
                body: text.to_string(),
            }),
            Reply::Fail(e) => Err(e),
        }
    }
}

/// Two-turn bout stream used across tests
pub const BOUT_STREAM: &[&str] = &[
    "data: {\"type\":\"start\"}\n",
    "data: {\"type\":\"data-turn\",\"data\":{\"turn\":0,\"agentId\":\"socrates\",\"agentName\":\"Socrates\"}}\n",
    "data: {\"type\":\"text-delta\",\"delta\":\"Well, \"}\ndata: {\"type\":\"text-delta\",\"delta\":\"my dear friend...\"}\n",
    "data: {\"type\":\"text-end\"}\n",
    "data: {\"type\":\"data-turn\",\"data\":{\"turn\":1,\"agentId\":\"nietzsche\",\"agentName\":\"Nietzsche\"}}\n",
    "data: {\"type\":\"text-delta\",\"delta\":\"Ha! \"}\ndata: {\"type\":\"text-delta\",\"delta\":\"You speak of...\"}\n",
    "data: {\"type\":\"data-share-line\",\"data\":{\"text\":\"A draw, apparently\"}}\n",
    "data: [DONE]\n",
];
