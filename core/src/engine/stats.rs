//! Per-worker statistics and their aggregation

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::dispatcher::Outcome;

/// Statistics tracked by each worker
#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerStats {
    /// Worker id
    pub worker_id: usize,

    /// Persona the worker played
    pub persona: &'static str,

    /// Sessions started
    pub sessions: usize,

    /// Actions that got a status below 400
    pub successes: usize,

    /// Actions that failed or got a status of 400 or above
    pub errors: usize,

    /// Actions that sent nothing
    pub skipped: usize,

    /// Worker start time
    #[serde(skip)]
    pub started_at: Option<Instant>,

    /// Worker end time
    #[serde(skip)]
    pub ended_at: Option<Instant>,
}

impl WorkerStats {
    /// Create new empty stats for a worker
    pub fn new(worker_id: usize, persona: &'static str) -> Self {
        Self {
            worker_id,
            persona,
            ..Default::default()
        }
    }

    /// Start tracking (records start time)
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stop tracking (records end time)
    pub fn stop(&mut self) {
        self.ended_at = Some(Instant::now());
    }

    /// Actions dispatched, skipped ones included
    pub fn total_actions(&self) -> usize {
        self.successes + self.errors + self.skipped
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            self.ended_at
                .map(|end| end.duration_since(start))
                .unwrap_or_else(|| start.elapsed())
        })
    }

    /// Fold one dispatch outcome into the counters.
    ///
    /// Cancelled calls are not counted.
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Responded(status) if status < 400 => self.successes += 1,
            Outcome::Responded(_) | Outcome::Failed => self.errors += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Cancelled => {}
        }
    }
}

/// Aggregated statistics from all workers
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedStats {
    /// Number of workers that reported
    pub total_workers: usize,

    /// Sessions across all workers
    pub total_sessions: usize,

    /// Successful actions
    pub total_successes: usize,

    /// Failed actions
    pub total_errors: usize,

    /// Skipped actions
    pub total_skipped: usize,

    /// Longest worker lifetime
    pub total_duration: Duration,

    /// Actions per second over the longest worker lifetime
    pub actions_per_second: f64,
}

impl AggregatedStats {
    /// Actions dispatched, skipped ones included
    pub fn total_actions(&self) -> usize {
        self.total_successes + self.total_errors + self.total_skipped
    }

    /// Successful share of sent actions (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let sent = self.total_successes + self.total_errors;
        if sent > 0 {
            self.total_successes as f64 / sent as f64
        } else {
            0.0
        }
    }
}

/// Aggregate statistics from multiple workers
pub fn aggregate_worker_stats(stats: &[WorkerStats]) -> AggregatedStats {
    if stats.is_empty() {
        return AggregatedStats::default();
    }

    let total_duration = stats
        .iter()
        .filter_map(|s| s.elapsed())
        .max()
        .unwrap_or(Duration::ZERO);

    let mut agg = AggregatedStats {
        total_workers: stats.len(),
        total_duration,
        ..Default::default()
    };
    for s in stats {
        agg.total_sessions += s.sessions;
        agg.total_successes += s.successes;
        agg.total_errors += s.errors;
        agg.total_skipped += s.skipped;
    }

    let secs = total_duration.as_secs_f64();
    if secs > 0.0 {
        agg.actions_per_second = agg.total_actions() as f64 / secs;
    }
    agg
}
