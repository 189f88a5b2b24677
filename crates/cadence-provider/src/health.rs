//! Per-provider availability tracking.
//!
//! The monitor is constructed explicitly and shared by `Arc`; the periodic
//! probe loop ([`ProviderHealthMonitor::run`]) is spawned by the owner, never
//! implicitly.

use crate::provider::{ConnectionTest, Provider};
use crate::registry::ProviderRegistry;
use cadence_core::{notify_or_log, DomainEvent, EventKind, Notifier, ProviderHealthStatus};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default seconds between two probe cycles.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

/// Default timeout of one connection probe.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Health polling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between two probe cycles.
    pub check_interval_secs: u64,
    /// Timeout of one connection probe, in seconds.
    pub probe_timeout_secs: u64,
    /// Skip the callback and notification when a check repeats the previous
    /// state. Off by default: every check is re-emitted as a liveness signal.
    pub dedupe_notifications: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            dedupe_notifications: false,
        }
    }
}

/// Callback invoked with every recorded state.
pub type HealthChangeCallback = Arc<dyn Fn(&ProviderHealthStatus) + Send + Sync>;

/// Tracks the latest availability observation of every provider.
pub struct ProviderHealthMonitor {
    config: HealthConfig,
    states: Mutex<HashMap<String, ProviderHealthStatus>>,
    callback: RwLock<Option<HealthChangeCallback>>,
    notifier: Arc<dyn Notifier>,
    changed: Arc<Notify>,
}

impl ProviderHealthMonitor {
    /// Monitor with no observations yet.
    pub fn new(config: HealthConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            callback: RwLock::new(None),
            notifier,
            changed: Arc::new(Notify::new()),
        }
    }

    /// Polling settings.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Call `callback` with every recorded state.
    pub fn set_change_callback(&self, callback: HealthChangeCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Woken every time a state is recorded.
    pub fn changes(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// Record the outcome of a check for `provider_id`.
    ///
    /// The stored state is replaced, never merged. The change callback and a
    /// `provider_health_changed` notification follow every call unless
    /// de-duplication is enabled and the state did not change.
    pub fn update_health_state(
        &self,
        provider_id: &str,
        result: &ConnectionTest,
    ) -> ProviderHealthStatus {
        let status = ProviderHealthStatus {
            provider_id: provider_id.to_string(),
            available: result.success,
            latency_ms: result.latency_ms,
            error: result.error.clone(),
            checked_at: Utc::now(),
        };

        let previous = self
            .states
            .lock()
            .insert(provider_id.to_string(), status.clone());

        match &previous {
            Some(prev) if prev.available && !status.available => {
                warn!(provider = provider_id, error = ?status.error, "Provider became unavailable");
            }
            Some(prev) if !prev.available && status.available => {
                info!(provider = provider_id, "Provider available again");
            }
            None if !status.available => {
                warn!(provider = provider_id, error = ?status.error, "Provider unavailable");
            }
            _ => {}
        }

        let unchanged = previous.is_some_and(|prev| prev.same_state(&status));
        if self.config.dedupe_notifications && unchanged {
            debug!(provider = provider_id, "Health state unchanged, notification skipped");
        } else {
            let callback = self.callback.read().clone();
            if let Some(callback) = callback {
                callback(&status);
            }
            match serde_json::to_value(&status) {
                Ok(payload) => notify_or_log(
                    self.notifier.as_ref(),
                    DomainEvent::new(EventKind::ProviderHealthChanged, payload)
                        .scoped(provider_id),
                ),
                Err(e) => warn!(provider = provider_id, error = %e, "Failed to encode health status"),
            }
        }

        self.changed.notify_waiters();
        status
    }

    /// Latest observation of `provider_id`.
    pub fn get_health_status(&self, provider_id: &str) -> Option<ProviderHealthStatus> {
        self.states.lock().get(provider_id).cloned()
    }

    /// Every recorded state, sorted by provider id.
    pub fn all_statuses(&self) -> Vec<ProviderHealthStatus> {
        let mut all: Vec<_> = self.states.lock().values().cloned().collect();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        all
    }

    /// Providers that were never checked count as available.
    pub fn is_available(&self, provider_id: &str) -> bool {
        self.states
            .lock()
            .get(provider_id)
            .map_or(true, |s| s.available)
    }

    /// Forget every recorded state.
    pub fn clear(&self) {
        self.states.lock().clear();
    }

    /// Run one connection test against `provider` and record it.
    pub async fn probe(&self, provider: &dyn Provider) -> ProviderHealthStatus {
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let result = match tokio::time::timeout(timeout, provider.test_connection()).await {
            Ok(result) => result,
            Err(_) => ConnectionTest::failed(format!(
                "probe timed out after {}s",
                self.config.probe_timeout_secs
            )),
        };
        self.update_health_state(provider.id(), &result)
    }

    /// Probe every registered provider concurrently.
    pub async fn check_all(&self, registry: &ProviderRegistry) -> Vec<ProviderHealthStatus> {
        let probes = registry.ids().into_iter().map(|id| async move {
            match registry.get(&id) {
                Ok(provider) => self.probe(provider.as_ref()).await,
                Err(e) => self.update_health_state(&id, &ConnectionTest::failed(e.to_string())),
            }
        });
        join_all(probes).await
    }

    /// Probe all providers every `check_interval_secs` until `cancel` fires.
    pub async fn run(&self, registry: Arc<ProviderRegistry>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.check_interval_secs);
        info!(interval_secs = self.config.check_interval_secs, "Provider health loop started");
        loop {
            let statuses = self.check_all(&registry).await;
            debug!(
                checked = statuses.len(),
                unavailable = statuses.iter().filter(|s| !s.available).count(),
                "Health check cycle complete"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Provider health loop stopped");
    }
}
