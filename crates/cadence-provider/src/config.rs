use crate::backends::{SimulatedFailure, SimulatedProvider};
use crate::provider::Provider;
use crate::registry::ProviderRegistry;
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Backend implementation behind a configured provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process simulation; used for dry runs.
    #[default]
    Simulated,
}

/// One `[[providers]]` entry of the orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry id.
    pub id: String,
    /// Backend implementation.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Model reported in responses.
    #[serde(default = "default_model")]
    pub model: String,
    /// Artificial delay per call.
    #[serde(default)]
    pub latency_ms: u64,
    /// Completion tokens reported per call.
    #[serde(default = "default_output_tokens")]
    pub output_tokens: u64,
    /// Whether the provider starts online.
    #[serde(default = "default_available")]
    pub available: bool,
    /// Failures returned by the first calls, in order.
    #[serde(default)]
    pub fail_first: Vec<SimulatedFailure>,
}

fn default_model() -> String {
    "sim-1".into()
}

fn default_output_tokens() -> u64 {
    256
}

fn default_available() -> bool {
    true
}

impl ProviderConfig {
    /// Simulated provider entry with defaults.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ProviderKind::Simulated,
            model: default_model(),
            latency_ms: 0,
            output_tokens: default_output_tokens(),
            available: true,
            fail_first: Vec::new(),
        }
    }

    /// Instantiate the provider.
    pub fn build(&self) -> Arc<dyn Provider> {
        match self.kind {
            ProviderKind::Simulated => {
                let provider = SimulatedProvider::new(self.id.clone())
                    .with_latency(Duration::from_millis(self.latency_ms))
                    .with_output_tokens(self.output_tokens)
                    .with_failures(self.fail_first.iter().cloned());
                provider.set_available(self.available);
                Arc::new(provider)
            }
        }
    }
}

/// Register a factory for every configured provider.
pub fn register_configured(
    registry: &ProviderRegistry,
    providers: &[ProviderConfig],
) -> CadenceResult<()> {
    for config in providers {
        if config.id.trim().is_empty() {
            return Err(CadenceError::Config("provider id must not be empty".into()));
        }
        let config = config.clone();
        registry.register_provider(config.id.clone(), Box::new(move || Ok(config.build())))?;
    }
    Ok(())
}
