//! Simulated user loop

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::persona::PersonaSpec;

use super::rate_limiter::Ticket;
use super::stats::WorkerStats;

/// Ticket queue shared by every worker
pub type TicketQueue = Arc<Mutex<mpsc::Receiver<Ticket>>>;

/// Why a worker left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    BudgetExhausted,
    TicketsClosed,
}

/// One simulated user: session after session of its persona's actions
///
/// Each action waits for a ticket, dispatches, then thinks. Every wait races
/// the run's cancellation token.
pub struct Worker {
    id: usize,
    persona: &'static PersonaSpec,
    dispatcher: Arc<Dispatcher>,
    tickets: TicketQueue,
}

impl Worker {
    /// Create a worker playing `persona`
    pub fn new(
        id: usize,
        persona: &'static PersonaSpec,
        dispatcher: Arc<Dispatcher>,
        tickets: TicketQueue,
    ) -> Self {
        Self {
            id,
            persona,
            dispatcher,
            tickets,
        }
    }

    /// Run sessions until cancellation, budget exhaustion or ticket shutdown
    pub async fn run(self, cancel: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::new(self.id, self.persona.id);
        stats.start();
        let metrics = Arc::clone(self.dispatcher.metrics());
        metrics.worker_started();

        tracing::debug!(worker_id = self.id, persona = self.persona.id, "Worker started");

        let exit = loop {
            if cancel.is_cancelled() {
                break Exit::Cancelled;
            }
            if self.dispatcher.budget().exhausted() {
                tracing::info!(worker_id = self.id, "Budget exhausted, worker stopping");
                break Exit::BudgetExhausted;
            }

            stats.sessions += 1;
            if let Some(exit) = self.session(&cancel, &mut stats).await {
                break exit;
            }
        };

        metrics.worker_stopped();
        stats.stop();
        tracing::debug!(
            worker_id = self.id,
            persona = self.persona.id,
            sessions = stats.sessions,
            successes = stats.successes,
            errors = stats.errors,
            exit = ?exit,
            "Worker finished"
        );
        stats
    }

    /// One session; `Some` when the worker must stop
    async fn session(&self, cancel: &CancellationToken, stats: &mut WorkerStats) -> Option<Exit> {
        let length = self.persona.session_length();
        tracing::trace!(worker_id = self.id, length, "Session started");

        for _ in 0..length {
            let ticket = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(Exit::Cancelled),
                t = self.next_ticket() => t,
            };
            if ticket.is_none() {
                return Some(Exit::TicketsClosed);
            }

            let action = self.persona.pick_action();
            let outcome = self
                .dispatcher
                .dispatch(cancel, self.id, self.persona, action)
                .await;
            stats.record(outcome);

            let think = self.persona.think_delay();
            if !think.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Some(Exit::Cancelled),
                    _ = tokio::time::sleep(think) => {}
                }
            }
        }
        None
    }

    async fn next_ticket(&self) -> Option<Ticket> {
        self.tickets.lock().await.recv().await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("persona", &self.persona.id)
            .finish()
    }
}
