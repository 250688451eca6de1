//! Builder pattern for Engine construction

use std::sync::Arc;

use crate::api::Actions;
use crate::budget::BudgetGate;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::persona::PersonaSpec;
use crate::traits::Transport;

use super::executor::Engine;

/// Builder for creating an Engine with proper configuration
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(EngineConfig::new(20).with_duration(Duration::from_secs(300)))
///     .personas(persona::resolve(&[], &["registered".into()])?)
///     .budget_gbp(5.0)
///     .transport(Arc::new(client))
///     .build()?;
///
/// let report = engine.run(CancellationToken::new()).await?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    personas: Vec<&'static PersonaSpec>,
    transport: Option<Arc<dyn Transport>>,
    budget_gbp: f64,
}

impl EngineBuilder {
    /// Create a new engine builder with default configuration
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            personas: Vec::new(),
            transport: None,
            budget_gbp: 0.0,
        }
    }

    /// Set the full engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the worker count
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the personas workers are drawn from
    pub fn personas(mut self, personas: Vec<&'static PersonaSpec>) -> Self {
        self.personas = personas;
        self
    }

    /// Set the spend ceiling in GBP (0 = unlimited)
    pub fn budget_gbp(mut self, ceiling: f64) -> Self {
        self.budget_gbp = ceiling;
        self
    }

    /// Set the transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not set or the configuration is
    /// invalid. An empty persona set is reported by [`Engine::run`].
    pub fn build(self) -> Result<Engine> {
        let transport = self
            .transport
            .ok_or(Error::MissingConfig("transport"))?;

        self.config.validate()?;

        let dispatcher = Dispatcher::new(
            Actions::new(transport),
            Arc::new(BudgetGate::new(self.budget_gbp)),
            Arc::new(MetricsCollector::new()),
            self.config.accounts.clone(),
        );

        Ok(Engine::new(self.config, self.personas, Arc::new(dispatcher)))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
