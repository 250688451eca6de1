//! boutsim-core: simulation engine for cost-bounded synthetic traffic
//!
//! This crate holds everything except the concrete HTTP client:
//!
//! - Persona model and registry
//! - Transport seam and the typed action layer over it
//! - Streaming bout response parser
//! - Budget gate and metrics collector
//! - Dispatcher and the worker/ticket/monitor engine
//! - Configuration and error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod budget;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod persona;
pub mod sse;
pub mod traits;

#[cfg(test)]
mod testing;

pub use budget::{BudgetGate, BudgetSnapshot};
pub use config::{ConfigError, EngineConfig, RateFn, RateProfile};
pub use dispatcher::{Dispatcher, Outcome};
pub use engine::{
    AggregatedStats, Engine, EngineBuilder, RunReport, RunSnapshot, StopReason, WorkerStats,
};
pub use error::*;
pub use metrics::{Histogram, HistogramStats, MetricsCollector, MetricsSnapshot};
pub use persona::{Action, PersonaSpec, Tier};
pub use sse::{StreamError, StreamEvent, StreamFailure, StreamResult, Turn};
pub use traits::*;
