//! reqwest-backed transport with retry, backoff and streaming

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use boutsim_core::{ApiResponse, Method, StreamResponse, Transport, TransportError};
use futures::TryStreamExt;
use parking_lot::RwLock;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;

/// Statuses retried on buffered calls
pub const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Body text kept on streaming status errors
const ERROR_BODY_LIMIT: usize = 512;

const ACCEPT_VALUE: &str = "text/event-stream, application/json";

/// Whether a buffered call should be retried after `status`
pub fn is_retryable(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Client construction errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// reqwest rejected the configuration
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),

    /// The base URL is not an absolute http(s) URL
    #[error("invalid base URL: {0}")]
    InvalidUrl(String),

    /// A custom header name or value is invalid
    #[error("invalid header {0}")]
    InvalidHeader(String),
}

/// Shared HTTP client with connection pooling and per-account bearer tokens.
///
/// Buffered calls retry transient failures with exponential backoff;
/// streaming calls never retry.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    config: HttpConfig,
    tokens: RwLock<HashMap<String, String>>,
}

impl Client {
    /// Create a client from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or a custom header is invalid, or the
    /// HTTP client cannot be built.
    pub fn new(config: HttpConfig) -> Result<Self, ClientError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(config.base_url.clone()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ClientError::InvalidHeader(format!("name {name:?}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| ClientError::InvalidHeader(format!("value for {name}")))?;
            headers.insert(header_name, header_value);
        }

        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers);

        if let Some(keepalive) = config.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        Ok(Self {
            http: builder.build()?,
            base_url,
            config,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Get the configuration for this client.
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Use `token` as the bearer token for `account`
    pub fn register_token(&self, account: impl Into<String>, token: impl Into<String>) {
        self.tokens.write().insert(account.into(), token.into());
    }

    /// Number of registered accounts
    pub fn accounts(&self) -> usize {
        self.tokens.read().len()
    }

    /// Release pooled connections
    pub fn close(self) {
        tracing::debug!(base_url = %self.base_url, "Closing HTTP client");
        drop(self.http);
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// plus up to 25% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .config
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.config.backoff_max);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        base + base.mul_f64(jitter)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        account: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = match method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url),
        };

        if let Some(token) = account.and_then(|a| self.tokens.read().get(a).cloned()) {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req
    }

    async fn pause(&self, cancel: &CancellationToken, delay: Duration) -> Result<(), TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for Client {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        account: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, TransportError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let send = self.request(method, path, account, body).send();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                r = async {
                    let resp = send.await?;
                    let status = resp.status().as_u16();
                    let bytes = resp.bytes().await?;
                    Ok::<_, reqwest::Error>((status, bytes))
                } => r,
            };

            let can_retry = attempt <= self.config.max_retries;
            match result {
                Ok((status, bytes)) if !(is_retryable(status) && can_retry) => {
                    return Ok(ApiResponse {
                        status,
                        duration: started.elapsed(),
                        attempts: attempt,
                        body: bytes,
                    });
                }
                Ok((status, _)) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        method = method.as_str(),
                        path,
                        status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after retryable status"
                    );
                    self.pause(cancel, delay).await?;
                }
                Err(e) if can_retry => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        method = method.as_str(),
                        path,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after transport error"
                    );
                    self.pause(cancel, delay).await?;
                }
                Err(e) => return Err(TransportError::Network(e.to_string())),
            }
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
        let started = Instant::now();
        let send = self.request(method, path, account, body).send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            r = send => r.map_err(|e| TransportError::Network(e.to_string()))?,
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let mut text = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                text = resp.text() => text.unwrap_or_default(),
            };
            if text.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(TransportError::Status { status, body: text });
        }

        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let duration = started.elapsed();
        let body = resp
            .bytes_stream()
            .map_err(|e| TransportError::Network(e.to_string()));

        Ok(StreamResponse {
            status,
            headers,
            duration,
            body: Box::pin(body),
        })
    }
}
