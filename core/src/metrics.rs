//! Live metrics collection and percentile calculation
//!
//! Scalar counters are plain atomics. Keyed collections (per-endpoint
//! histograms and error counters) take a short lock only to find or create
//! the entry; the entry itself synchronises its own updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Summary statistics for one histogram (all values in milliseconds)
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq)]
pub struct HistogramStats {
    /// Number of samples
    pub count: usize,
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
    /// Mean value
    pub mean: f64,
    /// 50th percentile (median)
    pub p50: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

impl HistogramStats {
    /// Calculate stats from a slice of values
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let len = sorted.len();
        Self {
            count: len,
            min: sorted[0],
            max: sorted[len - 1],
            mean: sorted.iter().sum::<f64>() / len as f64,
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        }
    }
}

/// Calculate percentile from sorted values using linear interpolation
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let idx = p * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    let frac = idx - lower as f64;

    if upper >= sorted.len() {
        sorted[sorted.len() - 1]
    } else {
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Append-only latency samples in milliseconds
#[derive(Debug, Default)]
pub struct Histogram {
    samples: Mutex<Vec<f64>>,
}

impl Histogram {
    /// Create an empty histogram
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value in milliseconds
    pub fn record_ms(&self, ms: f64) {
        self.samples.lock().push(ms);
    }

    /// Record a duration
    pub fn record(&self, duration: Duration) {
        self.record_ms(duration.as_secs_f64() * 1000.0);
    }

    /// Number of recorded samples
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Whether the histogram has no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute stats over a copy of the current samples
    pub fn stats(&self) -> HistogramStats {
        let copy = self.samples.lock().clone();
        HistogramStats::from_values(&copy)
    }
}

#[derive(Debug, Default)]
struct Keyed<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: Default> Keyed<T> {
    fn get(&self, key: &str) -> Arc<T> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }
        Arc::clone(self.entries.write().entry(key.to_string()).or_default())
    }

    fn collect<U>(&self, f: impl Fn(&T) -> U) -> BTreeMap<String, U> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), f(v)))
            .collect()
    }
}

/// Run-wide metrics shared by every worker
#[derive(Debug)]
pub struct MetricsCollector {
    clock: Mutex<(Instant, chrono::DateTime<chrono::Utc>)>,

    requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    budget_skips: AtomicU64,

    bouts_started: AtomicU64,
    bouts_completed: AtomicU64,
    deltas: AtomicU64,
    chars: AtomicU64,

    active_workers: AtomicI64,
    active_streams: AtomicI64,
    peak_streams: AtomicI64,
    stream_errors: AtomicU64,
    stream_failures: AtomicU64,

    latency: Keyed<Histogram>,
    ttfb: Keyed<Histogram>,
    endpoint_errors: Keyed<AtomicU64>,
    statuses: Mutex<BTreeMap<u16, u64>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a collector; elapsed time is measured from this call until
    /// [`mark_started`](Self::mark_started) resets it
    pub fn new() -> Self {
        Self {
            clock: Mutex::new((Instant::now(), chrono::Utc::now())),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            budget_skips: AtomicU64::new(0),
            bouts_started: AtomicU64::new(0),
            bouts_completed: AtomicU64::new(0),
            deltas: AtomicU64::new(0),
            chars: AtomicU64::new(0),
            active_workers: AtomicI64::new(0),
            active_streams: AtomicI64::new(0),
            peak_streams: AtomicI64::new(0),
            stream_errors: AtomicU64::new(0),
            stream_failures: AtomicU64::new(0),
            latency: Keyed::default(),
            ttfb: Keyed::default(),
            endpoint_errors: Keyed::default(),
            statuses: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a completed HTTP exchange
    pub fn record_response(&self, endpoint: &str, status: u16, latency: Duration, attempts: u32) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
        *self.statuses.lock().entry(status).or_insert(0) += 1;
        self.latency.get(endpoint).record(latency);

        if status == 429 {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        if status < 400 {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            self.endpoint_errors
                .get(endpoint)
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a request that never produced a status (network failure, cancellation)
    pub fn record_failure(&self, endpoint: &str) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.endpoint_errors
            .get(endpoint)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error against `key` without counting a request
    pub fn record_endpoint_error(&self, key: &str) {
        self.endpoint_errors.get(key).fetch_add(1, Ordering::Relaxed);
    }

    /// Record time-to-first-byte for a streamed endpoint
    pub fn record_ttfb(&self, endpoint: &str, ttfb: Duration) {
        self.ttfb.get(endpoint).record(ttfb);
    }

    /// A cost-bearing action was skipped by the budget gate
    pub fn record_budget_skip(&self) {
        self.budget_skips.fetch_add(1, Ordering::Relaxed);
    }

    /// A bout request was sent
    pub fn record_bout_started(&self) {
        self.bouts_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A bout finished without transport, parse or in-stream errors
    pub fn record_bout_completed(&self) {
        self.bouts_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add streamed text volume
    pub fn record_stream_volume(&self, deltas: u64, chars: u64) {
        self.deltas.fetch_add(deltas, Ordering::Relaxed);
        self.chars.fetch_add(chars, Ordering::Relaxed);
    }

    /// A stream carried an in-band error event
    pub fn record_stream_error(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A stream broke off on a read, decode or size failure.
    ///
    /// Counted as a stream error and against `endpoint`, and separately so
    /// broken streams can be told apart from in-band error events.
    pub fn record_stream_failure(&self, endpoint: &str) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
        self.stream_failures.fetch_add(1, Ordering::Relaxed);
        self.endpoint_errors
            .get(endpoint)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A stream was opened; updates the live gauge and the peak watermark
    pub fn stream_started(&self) {
        let now = self.active_streams.fetch_add(1, Ordering::AcqRel) + 1;
        let mut peak = self.peak_streams.load(Ordering::Acquire);
        while now > peak {
            match self.peak_streams.compare_exchange_weak(
                peak,
                now,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    /// A stream was closed
    pub fn stream_finished(&self) {
        self.active_streams.fetch_sub(1, Ordering::AcqRel);
    }

    /// A worker entered its loop
    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    /// A worker left its loop
    pub fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Restart the run clock; counters are kept
    pub fn mark_started(&self) {
        *self.clock.lock() = (Instant::now(), chrono::Utc::now());
    }

    /// Time since the run clock started
    pub fn elapsed(&self) -> Duration {
        self.clock.lock().0.elapsed()
    }

    /// Immutable copy of every counter and histogram
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (started, started_at) = *self.clock.lock();
        let elapsed = started.elapsed();
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();

        MetricsSnapshot {
            started_at,
            elapsed_secs: secs,
            requests,
            successes: self.successes.load(Ordering::Relaxed),
            errors,
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            budget_skips: self.budget_skips.load(Ordering::Relaxed),
            bouts_started: self.bouts_started.load(Ordering::Relaxed),
            bouts_completed: self.bouts_completed.load(Ordering::Relaxed),
            deltas: self.deltas.load(Ordering::Relaxed),
            chars: self.chars.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            peak_streams: self.peak_streams.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            requests_per_second: if secs > 0.0 {
                requests as f64 / secs
            } else {
                0.0
            },
            error_rate: if requests > 0 {
                errors as f64 / requests as f64
            } else {
                0.0
            },
            latency: self.latency.collect(Histogram::stats),
            ttfb: self.ttfb.collect(Histogram::stats),
            statuses: self.statuses.lock().clone(),
            endpoint_errors: self
                .endpoint_errors
                .collect(|c| c.load(Ordering::Relaxed)),
        }
    }
}

/// Serializable point-in-time view of [`MetricsCollector`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Wall-clock start of the run
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Seconds since start
    pub elapsed_secs: f64,
    /// Requests issued (including failures without a status)
    pub requests: u64,
    /// Responses with status below 400
    pub successes: u64,
    /// Failed requests and responses with status 400 or above
    pub errors: u64,
    /// Extra attempts spent on retries
    pub retries: u64,
    /// Responses with status 429
    pub rate_limited: u64,
    /// Cost-bearing actions skipped by the budget gate
    pub budget_skips: u64,
    /// Bouts sent
    pub bouts_started: u64,
    /// Bouts finished cleanly
    pub bouts_completed: u64,
    /// Text deltas received
    pub deltas: u64,
    /// Characters received in deltas
    pub chars: u64,
    /// Workers currently running
    pub active_workers: i64,
    /// Streams currently open
    pub active_streams: i64,
    /// Highest concurrent stream count seen
    pub peak_streams: i64,
    /// Streams that failed or carried an error event
    pub stream_errors: u64,
    /// Streams that broke off on a read, decode or size failure
    pub stream_failures: u64,
    /// Request throughput over the whole run
    pub requests_per_second: f64,
    /// errors / requests (0.0 with no requests)
    pub error_rate: f64,
    /// Latency stats per endpoint
    pub latency: BTreeMap<String, HistogramStats>,
    /// Time-to-first-byte stats per streamed endpoint
    pub ttfb: BTreeMap<String, HistogramStats>,
    /// Response count per status code
    pub statuses: BTreeMap<u16, u64>,
    /// Error count per endpoint
    pub endpoint_errors: BTreeMap<String, u64>,
}
