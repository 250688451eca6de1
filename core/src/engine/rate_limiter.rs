//! Ticket issuing for rate-shaped load
//!
//! A single coordinator task feeds a bounded queue of tickets; workers take
//! one ticket per action. Without a rate function the queue is kept full.
//! With one, a fractional bank accrues `rate * tick` per tick and whole
//! tickets are emitted from it. Tickets that do not fit in the queue are
//! dropped, so a slow worker pool never builds a backlog.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RateFn;

/// Permission to perform one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket;

/// Issuer totals at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IssuerStats {
    /// Tickets placed in the queue
    pub issued: u64,
    /// Tickets dropped because the queue was full
    pub dropped: u64,
}

/// Single-producer ticket coordinator
pub struct TicketIssuer {
    tx: mpsc::Sender<Ticket>,
    rate: Option<RateFn>,
    tick: Duration,
}

impl TicketIssuer {
    /// Create an issuer. `rate: None` floods the queue.
    pub fn new(tx: mpsc::Sender<Ticket>, rate: Option<RateFn>, tick: Duration) -> Self {
        Self { tx, rate, tick }
    }

    /// Whether a rate function is in effect
    pub fn is_limited(&self) -> bool {
        self.rate.is_some()
    }

    /// Issue tickets until `cancel` fires or every receiver is gone
    pub async fn run(self, cancel: CancellationToken) -> IssuerStats {
        let stats = match self.rate.clone() {
            None => self.flood(&cancel).await,
            Some(rate) => self.metered(&cancel, rate).await,
        };
        tracing::debug!(
            issued = stats.issued,
            dropped = stats.dropped,
            "Ticket issuer stopped"
        );
        stats
    }

    async fn flood(&self, cancel: &CancellationToken) -> IssuerStats {
        let mut stats = IssuerStats::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.tx.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(Ticket);
                        stats.issued += 1;
                    }
                    Err(_) => break,
                },
            }
        }
        stats
    }

    async fn metered(&self, cancel: &CancellationToken, rate: RateFn) -> IssuerStats {
        let mut stats = IssuerStats::default();
        let started = Instant::now();
        let tick_secs = self.tick.as_secs_f64();
        let mut bank = 0.0_f64;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let target = rate(started.elapsed());
                    if target.is_finite() && target > 0.0 {
                        bank += target * tick_secs;
                    }

                    while bank >= 1.0 {
                        bank -= 1.0;
                        match self.tx.try_send(Ticket) {
                            Ok(()) => stats.issued += 1,
                            Err(TrySendError::Full(_)) => stats.dropped += 1,
                            Err(TrySendError::Closed(_)) => return stats,
                        }
                    }
                }
            }
        }
        stats
    }
}

impl std::fmt::Debug for TicketIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketIssuer")
            .field("limited", &self.is_limited())
            .field("tick", &self.tick)
            .finish()
    }
}
