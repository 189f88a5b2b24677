use crate::budget::{BudgetConfig, ModelPricing, PricingTable};
use crate::concurrency::ConcurrencyConfig;
use crate::dependencies::WorkflowDependencyMap;
use cadence_core::{CadenceError, CadenceResult};
use cadence_provider::{HealthConfig, ProviderConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Settings of the pipeline driver itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model name passed to providers and used for pricing.
    pub model: String,
    /// Token cap for a single agent across all its executions.
    pub max_tokens_per_agent: Option<u64>,
    /// Fallback poll interval while waiting for a provider.
    pub provider_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "sim-1".into(),
            max_tokens_per_agent: None,
            provider_poll_interval_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Interval between provider health polls while an agent waits.
    pub fn provider_poll_interval(&self) -> Duration {
        Duration::from_millis(self.provider_poll_interval_ms)
    }
}

/// Top-level orchestrator configuration, usually read from `cadence.toml`.
///
/// ```toml
/// default_provider = "openai"
///
/// [workflow]
/// concept_leader = []
/// design_leader = ["concept_leader"]
///
/// [concurrency]
/// default_max_concurrent = 3
/// providers = { openai = 2 }
///
/// [[concurrency.groups]]
/// name = "image"
/// providers = ["stability", "dalle"]
/// max_concurrent = 2
///
/// [budget]
/// monthly_limit_usd = 250.0
///
/// [[pricing]]
/// provider = "openai"
/// model = "gpt-4o"
/// input_per_million = 2.5
/// output_per_million = 10.0
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Provider for agent types the project does not map.
    pub default_provider: Option<String>,
    /// Agent type -> prerequisite agent types. Empty means the built-in pipeline.
    pub workflow: BTreeMap<String, Vec<String>>,
    /// Admission caps.
    pub concurrency: ConcurrencyConfig,
    /// Retry policy for agent execution.
    pub retry: RetryConfig,
    /// Monthly spending policy.
    pub budget: BudgetConfig,
    /// Health polling settings.
    pub health: HealthConfig,
    /// Execution settings.
    pub engine: EngineConfig,
    /// Model prices.
    pub pricing: Vec<ModelPricing>,
    /// Providers to register at startup.
    pub providers: Vec<ProviderConfig>,
}

impl OrchestratorConfig {
    /// Read, parse and validate `path`.
    pub fn load(path: &Path) -> CadenceResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CadenceError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| CadenceError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(raw: &str) -> CadenceResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| CadenceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section, including the workflow graph.
    pub fn validate(&self) -> CadenceResult<()> {
        self.workflow_map()?;
        self.concurrency.validate()?;
        self.retry.validate()?;
        self.budget.validate()?;
        if self.health.probe_timeout_secs == 0 {
            return Err(CadenceError::Config(
                "health.probe_timeout_secs must be at least 1".into(),
            ));
        }
        for row in &self.pricing {
            let prices = [row.input_per_million, row.output_per_million, row.per_generation];
            if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(CadenceError::Config(format!(
                    "pricing for {}/{} must be non-negative",
                    row.provider, row.model
                )));
            }
        }
        let mut ids = std::collections::HashSet::new();
        for provider in &self.providers {
            if !ids.insert(provider.id.as_str()) {
                return Err(CadenceError::Config(format!(
                    "provider '{}' configured twice",
                    provider.id
                )));
            }
        }
        Ok(())
    }

    /// The configured dependency map, or the built-in pipeline when none is set.
    pub fn workflow_map(&self) -> CadenceResult<WorkflowDependencyMap> {
        if self.workflow.is_empty() {
            Ok(WorkflowDependencyMap::default_pipeline())
        } else {
            WorkflowDependencyMap::new(self.workflow.clone())
        }
    }

    /// Pricing rows as a lookup table.
    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::new(self.pricing.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::concurrency::GroupCapMode;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.concurrency.default_max_concurrent, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.budget.stop_on_exceeded);
        assert!(config.workflow_map().unwrap().contains("concept_leader"));
    }

    #[test]
    fn test_full_file() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            default_provider = "openai"

            [workflow]
            outline = []
            draft = ["outline"]

            [concurrency]
            default_max_concurrent = 4
            group_cap_mode = "both"
            providers = { openai = 2 }

            [[concurrency.groups]]
            name = "image"
            providers = ["stability", "dalle"]
            max_concurrent = 2

            [retry]
            max_retries = 5
            jitter = false

            [budget]
            monthly_limit_usd = 50.0
            stop_on_exceeded = false

            [engine]
            max_tokens_per_agent = 10000

            [[pricing]]
            provider = "openai"
            input_per_million = 1.0

            [[providers]]
            id = "openai"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("openai"));
        assert_eq!(config.workflow_map().unwrap().phase_of("draft"), 1);
        assert_eq!(config.concurrency.group_cap_mode, GroupCapMode::Both);
        assert_eq!(config.concurrency.providers["openai"], 2);
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.budget.stop_on_exceeded);
        assert_eq!(config.engine.max_tokens_per_agent, Some(10_000));
        assert_eq!(config.pricing[0].model, "*");
        assert_eq!(config.providers[0].id, "openai");
    }

    #[test]
    fn test_cycle_rejected() {
        let err = OrchestratorConfig::from_toml_str(
            r#"
            [workflow]
            a = ["b"]
            b = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn test_zero_cap_rejected() {
        assert!(OrchestratorConfig::from_toml_str("[concurrency]\nproviders = { openai = 0 }").is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[budget]\nmonthly_limit_usd = -1.0").unwrap();
        let err = OrchestratorConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));

        let missing = OrchestratorConfig::load(Path::new("/nonexistent/cadence.toml")).unwrap_err();
        assert!(matches!(missing, CadenceError::Config(_)));
    }
}
