//! Error types for boutsim-core

use thiserror::Error;

use crate::config::ConfigError;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The engine was asked to run with an empty persona set
    #[error("no personas configured")]
    NoPersonas,

    /// A persona id did not match the registry
    #[error("unknown persona: {0}")]
    UnknownPersona(String),

    /// A required builder field was not set
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),

    /// Worker error
    #[error("worker error: {0}")]
    Worker(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
