//! boutsim-client: pooled HTTP transport for the simulator
//!
//! [`Client`] implements [`boutsim_core::Transport`] over reqwest with
//! per-account bearer tokens, retry with exponential backoff for buffered
//! calls, and unretried streaming for bout runs.

#![warn(missing_docs)]

pub mod config;
pub mod http;

pub use config::HttpConfig;
pub use http::{is_retryable, Client, ClientError, RETRYABLE_STATUSES};
