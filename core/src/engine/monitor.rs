//! Periodic progress reporting

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetGate, BudgetSnapshot};
use crate::metrics::{MetricsCollector, MetricsSnapshot};

/// Metrics and budget captured at one instant
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    /// Capture time
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Metrics at capture time
    pub metrics: MetricsSnapshot,
    /// Budget at capture time
    pub budget: BudgetSnapshot,
}

impl RunSnapshot {
    /// Capture the current state of `metrics` and `budget`
    pub fn capture(metrics: &MetricsCollector, budget: &BudgetGate) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            metrics: metrics.snapshot(),
            budget: budget.snapshot(),
        }
    }
}

/// Logs and publishes a [`RunSnapshot`] every interval
pub(crate) struct Monitor {
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) budget: Arc<BudgetGate>,
    pub(crate) interval: Duration,
    pub(crate) tx: watch::Sender<RunSnapshot>,
}

impl Monitor {
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.publish(),
            }
        }
    }

    fn publish(&self) {
        let snap = RunSnapshot::capture(&self.metrics, &self.budget);
        let m = &snap.metrics;
        tracing::info!(
            elapsed_secs = m.elapsed_secs.round(),
            requests = m.requests,
            rps = m.requests_per_second,
            errors = m.errors,
            rate_limited = m.rate_limited,
            bouts = m.bouts_completed,
            active_workers = m.active_workers,
            active_streams = m.active_streams,
            spent_gbp = snap.budget.spent_gbp,
            remaining_gbp = ?snap.budget.remaining_gbp,
            "progress"
        );
        self.tx.send_replace(snap);
    }
}
