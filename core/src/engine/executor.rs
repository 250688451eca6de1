//! Engine execution logic

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::budget::BudgetGate;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::persona::PersonaSpec;

use super::monitor::{Monitor, RunSnapshot};
use super::rate_limiter::{IssuerStats, TicketIssuer};
use super::stats::{aggregate_worker_stats, AggregatedStats, WorkerStats};
use super::worker::Worker;

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured duration elapsed
    DurationElapsed,
    /// The caller cancelled the run
    Cancelled,
    /// Every worker stopped on budget exhaustion
    BudgetExhausted,
}

/// Final outcome of [`Engine::run`]
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Why the run ended
    pub reason: StopReason,
    /// Metrics and budget at the end of the run
    pub snapshot: RunSnapshot,
    /// Per-worker statistics
    pub workers: Vec<WorkerStats>,
    /// Worker statistics summed
    pub aggregated: AggregatedStats,
    /// Ticket issuer totals
    pub tickets: IssuerStats,
}

/// Engine manages the simulation lifecycle
///
/// Owns the worker pool, the ticket issuer and the monitor. All three share
/// one dispatcher, and through it one budget gate and metrics collector.
pub struct Engine {
    config: EngineConfig,
    personas: Vec<&'static PersonaSpec>,
    dispatcher: Arc<Dispatcher>,
    snapshot_tx: watch::Sender<RunSnapshot>,
}

impl Engine {
    /// Create an engine
    ///
    /// Use [`EngineBuilder`](super::EngineBuilder) for a more ergonomic construction.
    pub fn new(
        config: EngineConfig,
        personas: Vec<&'static PersonaSpec>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let initial = RunSnapshot::capture(dispatcher.metrics(), dispatcher.budget());
        let (snapshot_tx, _) = watch::channel(initial);
        Self {
            config,
            personas,
            dispatcher,
            snapshot_tx,
        }
    }

    /// Get the engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Personas assigned round-robin to workers
    pub fn personas(&self) -> &[&'static PersonaSpec] {
        &self.personas
    }

    /// Shared budget gate
    pub fn budget(&self) -> &Arc<BudgetGate> {
        self.dispatcher.budget()
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.dispatcher.metrics()
    }

    /// Receive every snapshot the monitor publishes
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Capture a snapshot now
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot::capture(self.metrics(), self.budget())
    }

    /// Run the simulation
    ///
    /// Returns when the duration elapses, `cancel` fires, or every worker has
    /// stopped on budget exhaustion.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        if self.personas.is_empty() {
            return Err(Error::NoPersonas);
        }
        self.config.validate()?;

        let start = Instant::now();
        self.metrics().mark_started();
        let run = cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));

        tracing::info!(
            workers = self.config.workers,
            duration_secs = self.config.duration.as_secs_f64(),
            rate = %self.config.rate,
            personas = ?self.personas.iter().map(|p| p.id).collect::<Vec<_>>(),
            budget_gbp = self.budget().ceiling(),
            "Starting simulation"
        );

        let timer = {
            let run = run.clone();
            let deadline_hit = Arc::clone(&deadline_hit);
            let duration = self.config.duration;
            tokio::spawn(async move {
                tokio::select! {
                    _ = run.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        deadline_hit.store(true, Ordering::SeqCst);
                        tracing::info!("Run duration elapsed, shutting down");
                        run.cancel();
                    }
                }
            })
        };

        let (tx, rx) = mpsc::channel(self.config.effective_queue_capacity());
        let tickets = Arc::new(Mutex::new(rx));
        let issuer = TicketIssuer::new(
            tx,
            self.config.rate.into_rate_fn(self.config.duration),
            self.config.tick_interval,
        );
        let issuer_handle = tokio::spawn(issuer.run(run.clone()));

        let monitor = Monitor {
            metrics: Arc::clone(self.metrics()),
            budget: Arc::clone(self.budget()),
            interval: self.config.monitor_interval,
            tx: self.snapshot_tx.clone(),
        };
        let monitor_handle = tokio::spawn(monitor.run(run.clone()));

        let mut handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let persona = self.personas[worker_id % self.personas.len()];
            let worker = Worker::new(
                worker_id,
                persona,
                Arc::clone(&self.dispatcher),
                Arc::clone(&tickets),
            );
            handles.push(tokio::spawn(worker.run(run.clone())));
        }

        let mut workers = Vec::with_capacity(handles.len());
        let mut worker_failures = 0;
        for (idx, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(stats) => workers.push(stats),
                Err(e) => {
                    worker_failures += 1;
                    tracing::error!(worker_id = idx, error = %e, "Worker task panicked");
                }
            }
        }

        // Workers are done; stop the issuer, monitor and timer.
        run.cancel();
        let tickets = issuer_handle.await.unwrap_or_default();
        let _ = monitor_handle.await;
        let _ = timer.await;

        if workers.is_empty() && worker_failures > 0 {
            return Err(Error::Worker(format!(
                "All {worker_failures} workers failed to complete"
            )));
        }

        let reason = if cancel.is_cancelled() {
            StopReason::Cancelled
        } else if deadline_hit.load(Ordering::SeqCst) {
            StopReason::DurationElapsed
        } else {
            StopReason::BudgetExhausted
        };

        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        let aggregated = aggregate_worker_stats(&workers);

        tracing::info!(
            reason = ?reason,
            elapsed_secs = start.elapsed().as_secs_f64(),
            requests = snapshot.metrics.requests,
            errors = snapshot.metrics.errors,
            bouts = snapshot.metrics.bouts_completed,
            spent_gbp = snapshot.budget.spent_gbp,
            tickets_issued = tickets.issued,
            tickets_dropped = tickets.dropped,
            "Simulation completed"
        );

        Ok(RunReport {
            reason,
            snapshot,
            workers,
            aggregated,
            tickets,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field(
                "personas",
                &self.personas.iter().map(|p| p.id).collect::<Vec<_>>(),
            )
            .finish()
    }
}
