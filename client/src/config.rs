//! HTTP client configuration

use std::time::Duration;

/// Connection pool, timeout and retry settings for [`Client`](crate::Client)
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Target base URL, e.g. `https://arena.example.com`
    pub base_url: String,

    /// Idle connection timeout
    pub pool_idle_timeout: Duration,

    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,

    /// Request timeout (covers streamed bodies too)
    pub request_timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,

    /// User agent string
    pub user_agent: String,

    /// Extra attempts for buffered calls
    pub max_retries: u32,

    /// First retry delay
    pub backoff_base: Duration,

    /// Retry delay ceiling (before jitter)
    pub backoff_max: Duration,

    /// Headers sent on every request
    pub headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: Some(Duration::from_secs(60)),
            user_agent: format!("boutsim/{}", env!("CARGO_PKG_VERSION")),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            headers: Vec::new(),
        }
    }
}

impl HttpConfig {
    /// Config for `base_url` with defaults elsewhere
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Create config with custom request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Create config with custom connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Create config with custom pool size.
    pub fn with_pool_max_idle(mut self, max_idle: usize) -> Self {
        self.pool_max_idle_per_host = max_idle;
        self
    }

    /// Set the retry budget for buffered calls
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff base and ceiling
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Add a header sent on every request
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}
