//! Engine for simulation lifecycle management
//!
//! The Engine coordinates one run:
//! - a fixed pool of workers, each playing one persona session after session
//! - a ticket issuer shaping the aggregate request rate
//! - a monitor that logs and publishes snapshots
//! - shutdown on deadline, external cancellation or budget exhaustion
//!
//! # Example
//!
//! ```ignore
//! use boutsim_core::{EngineBuilder, EngineConfig, RateProfile};
//!
//! let engine = EngineBuilder::new()
//!     .config(EngineConfig::new(10).with_rate("ramp:1:20".parse()?))
//!     .personas(boutsim_core::persona::resolve(&[], &[])?)
//!     .transport(transport)
//!     .build()?;
//!
//! let mut progress = engine.subscribe();
//! let report = engine.run(cancel).await?;
//! ```

mod builder;
mod executor;
mod monitor;
mod rate_limiter;
mod stats;
mod worker;

pub use builder::EngineBuilder;
pub use executor::{Engine, RunReport, StopReason};
pub use monitor::RunSnapshot;
pub use rate_limiter::{IssuerStats, Ticket, TicketIssuer};
pub use stats::{aggregate_worker_stats, AggregatedStats, WorkerStats};
pub use worker::{TicketQueue, Worker};
