use cadence_core::{CadenceError, CadenceResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Cap applied to providers with no explicit entry.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// How a group cap combines with the caps of its member providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCapMode {
    /// The group cap replaces the per-provider caps of its members.
    #[default]
    Override,
    /// A job needs room in both the group and its provider.
    Both,
}

/// Providers sharing one quota (e.g. several image backends behind one key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderGroup {
    /// Group name, used in usage reports.
    pub name: String,
    /// Member providers.
    pub providers: Vec<String>,
    /// Jobs allowed across the whole group.
    pub max_concurrent: usize,
}

/// Admission caps, per provider and per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Cap for providers without an explicit one.
    pub default_max_concurrent: usize,
    /// Per-provider caps.
    pub providers: HashMap<String, usize>,
    /// Shared quotas.
    pub groups: Vec<ProviderGroup>,
    /// How a group cap combines with member caps.
    pub group_cap_mode: GroupCapMode,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            providers: HashMap::new(),
            groups: Vec::new(),
            group_cap_mode: GroupCapMode::Override,
        }
    }
}

impl ConcurrencyConfig {
    /// Reject zero caps and providers listed in two groups.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.default_max_concurrent == 0 {
            return Err(CadenceError::Config(
                "concurrency.default_max_concurrent must be at least 1".into(),
            ));
        }
        if let Some((provider, _)) = self.providers.iter().find(|(_, cap)| **cap == 0) {
            return Err(CadenceError::Config(format!(
                "concurrency cap for provider '{provider}' must be at least 1"
            )));
        }
        let mut names = HashSet::new();
        let mut members = HashSet::new();
        for group in &self.groups {
            if group.max_concurrent == 0 {
                return Err(CadenceError::Config(format!(
                    "concurrency group '{}' must allow at least 1 job",
                    group.name
                )));
            }
            if !names.insert(group.name.as_str()) {
                return Err(CadenceError::Config(format!(
                    "duplicate concurrency group '{}'",
                    group.name
                )));
            }
            for provider in &group.providers {
                if !members.insert(provider.as_str()) {
                    return Err(CadenceError::Config(format!(
                        "provider '{provider}' belongs to more than one concurrency group"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct ActiveJobs {
    by_provider: HashMap<String, HashSet<String>>,
    by_group: HashMap<String, HashSet<String>>,
}

impl ActiveJobs {
    fn provider_count(&self, provider: &str) -> usize {
        self.by_provider.get(provider).map_or(0, HashSet::len)
    }

    fn group_count(&self, group: &str) -> usize {
        self.by_group.get(group).map_or(0, HashSet::len)
    }

    fn holds(&self, provider: &str, job_id: &str) -> bool {
        self.by_provider
            .get(provider)
            .is_some_and(|jobs| jobs.contains(job_id))
    }
}

/// Occupancy of one provider at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderUsage {
    /// Provider id.
    pub provider: String,
    /// Jobs holding a slot.
    pub active: usize,
    /// Effective cap.
    pub limit: usize,
    /// Group the provider belongs to, if any.
    pub group: Option<String>,
}

/// Per-provider (and per-group) admission control for running jobs.
///
/// All state sits behind one mutex: [`register`](Self::register) re-checks
/// capacity and records the job in a single critical section, so concurrent
/// callers can never push a provider past its cap. [`can_start`](Self::can_start)
/// is advisory only.
pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    group_of: HashMap<String, usize>,
    active: Mutex<ActiveJobs>,
}

impl ConcurrencyController {
    /// Controller with no jobs registered.
    pub fn new(config: ConcurrencyConfig) -> Self {
        let group_of = config
            .groups
            .iter()
            .enumerate()
            .flat_map(|(idx, group)| group.providers.iter().map(move |p| (p.clone(), idx)))
            .collect();
        Self {
            config,
            group_of,
            active: Mutex::new(ActiveJobs::default()),
        }
    }

    /// Configured caps.
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Cap of `provider` ignoring any group.
    pub fn provider_limit(&self, provider: &str) -> usize {
        self.config
            .providers
            .get(provider)
            .copied()
            .unwrap_or(self.config.default_max_concurrent)
    }

    /// Group containing `provider`, if any.
    pub fn group_for(&self, provider: &str) -> Option<&ProviderGroup> {
        self.group_of.get(provider).map(|&idx| &self.config.groups[idx])
    }

    fn admits(&self, active: &ActiveJobs, provider: &str) -> bool {
        let provider_ok = || active.provider_count(provider) < self.provider_limit(provider);
        match self.group_for(provider) {
            Some(group) => {
                let group_ok = active.group_count(&group.name) < group.max_concurrent;
                match self.config.group_cap_mode {
                    GroupCapMode::Override => group_ok,
                    GroupCapMode::Both => group_ok && provider_ok(),
                }
            }
            None => provider_ok(),
        }
    }

    /// Whether `job_id` could start on `provider` right now. A job that is
    /// already registered there can always "start".
    pub fn can_start(&self, provider: &str, job_id: &str) -> bool {
        let active = self.active.lock();
        active.holds(provider, job_id) || self.admits(&active, provider)
    }

    /// Claim a slot. Returns `false` without side effects when the provider
    /// (or its group) is full. Registering the same job twice is a no-op
    /// that returns `true`.
    pub fn register(&self, job_id: &str, provider: &str) -> bool {
        let mut active = self.active.lock();
        if active.holds(provider, job_id) {
            return true;
        }
        if !self.admits(&active, provider) {
            debug!(provider, job_id, "Concurrency limit reached");
            return false;
        }
        active
            .by_provider
            .entry(provider.to_string())
            .or_default()
            .insert(job_id.to_string());
        if let Some(group) = self.group_for(provider) {
            active
                .by_group
                .entry(group.name.clone())
                .or_default()
                .insert(job_id.to_string());
        }
        true
    }

    /// Release a slot. Returns whether the job was registered.
    pub fn unregister(&self, job_id: &str, provider: &str) -> bool {
        let mut active = self.active.lock();
        let removed = active
            .by_provider
            .get_mut(provider)
            .is_some_and(|jobs| jobs.remove(job_id));
        if removed {
            if let Some(group) = self.group_for(provider) {
                if let Some(jobs) = active.by_group.get_mut(&group.name) {
                    jobs.remove(job_id);
                }
            }
        }
        removed
    }

    /// Jobs holding a slot on `provider`.
    pub fn active_count(&self, provider: &str) -> usize {
        self.active.lock().provider_count(provider)
    }

    /// Jobs holding a slot in `group`.
    pub fn group_active_count(&self, group: &str) -> usize {
        self.active.lock().group_count(group)
    }

    /// Drop every registration. Called once at process start, before recovery.
    pub fn clear_all(&self) {
        let mut active = self.active.lock();
        let jobs: usize = active.by_provider.values().map(HashSet::len).sum();
        *active = ActiveJobs::default();
        if jobs > 0 {
            info!(jobs, "Cleared stale concurrency registrations");
        }
    }

    /// Occupancy of every provider that has a configured cap or a running job.
    pub fn usage(&self) -> Vec<ProviderUsage> {
        let active = self.active.lock();
        let mut providers: HashSet<&str> = self.config.providers.keys().map(String::as_str).collect();
        providers.extend(self.group_of.keys().map(String::as_str));
        providers.extend(active.by_provider.keys().map(String::as_str));

        let mut usage: Vec<ProviderUsage> = providers
            .into_iter()
            .map(|provider| {
                let group = self.group_for(provider);
                let limit = match (group, self.config.group_cap_mode) {
                    (Some(g), GroupCapMode::Override) => g.max_concurrent,
                    (Some(g), GroupCapMode::Both) => g.max_concurrent.min(self.provider_limit(provider)),
                    (None, _) => self.provider_limit(provider),
                };
                ProviderUsage {
                    provider: provider.to_string(),
                    active: active.provider_count(provider),
                    limit,
                    group: group.map(|g| g.name.clone()),
                }
            })
            .collect();
        usage.sort_by(|a, b| a.provider.cmp(&b.provider));
        usage
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn with_cap(provider: &str, cap: usize) -> ConcurrencyController {
        let mut config = ConcurrencyConfig::default();
        config.providers.insert(provider.into(), cap);
        ConcurrencyController::new(config)
    }

    fn image_group(mode: GroupCapMode) -> ConcurrencyController {
        let mut config = ConcurrencyConfig {
            group_cap_mode: mode,
            groups: vec![ProviderGroup {
                name: "image".into(),
                providers: vec!["stability".into(), "dalle".into()],
                max_concurrent: 3,
            }],
            ..Default::default()
        };
        config.providers.insert("stability".into(), 1);
        ConcurrencyController::new(config)
    }

    #[test]
    fn test_cap_rejects_third_job() {
        let ctl = with_cap("openai", 2);
        assert!(ctl.register("a", "openai"));
        assert!(ctl.register("b", "openai"));
        assert!(!ctl.can_start("openai", "c"));
        assert!(!ctl.register("c", "openai"));
        assert_eq!(ctl.active_count("openai"), 2);
    }

    #[test]
    fn test_register_is_idempotent() {
        let ctl = with_cap("openai", 1);
        assert!(ctl.register("a", "openai"));
        assert!(ctl.register("a", "openai"));
        assert!(ctl.can_start("openai", "a"));
        assert_eq!(ctl.active_count("openai"), 1);
    }

    #[test]
    fn test_unregister_frees_slot() {
        let ctl = with_cap("openai", 1);
        assert!(ctl.register("a", "openai"));
        assert!(ctl.unregister("a", "openai"));
        assert!(!ctl.unregister("a", "openai"));
        assert!(ctl.register("b", "openai"));
    }

    #[test]
    fn test_default_cap() {
        let ctl = ConcurrencyController::default();
        for job in ["a", "b", "c"] {
            assert!(ctl.register(job, "anthropic"));
        }
        assert!(!ctl.register("d", "anthropic"));
    }

    #[test]
    fn test_group_overrides_provider_cap() {
        let ctl = image_group(GroupCapMode::Override);
        assert!(ctl.register("a", "stability"));
        assert!(ctl.register("b", "stability"));
        assert!(ctl.register("c", "dalle"));
        assert!(!ctl.register("d", "dalle"));
        assert_eq!(ctl.group_active_count("image"), 3);
    }

    #[test]
    fn test_group_and_provider_caps_both_apply() {
        let ctl = image_group(GroupCapMode::Both);
        assert!(ctl.register("a", "stability"));
        assert!(!ctl.register("b", "stability"));
        assert!(ctl.register("b", "dalle"));
    }

    #[test]
    fn test_clear_all() {
        let ctl = image_group(GroupCapMode::Override);
        ctl.register("a", "stability");
        ctl.register("b", "openai");
        ctl.clear_all();
        assert_eq!(ctl.active_count("stability"), 0);
        assert_eq!(ctl.group_active_count("image"), 0);
    }

    #[test]
    fn test_usage_report() {
        let ctl = image_group(GroupCapMode::Override);
        ctl.register("a", "dalle");
        let usage = ctl.usage();
        let dalle = usage.iter().find(|u| u.provider == "dalle").unwrap();
        assert_eq!((dalle.active, dalle.limit), (1, 3));
        assert_eq!(dalle.group.as_deref(), Some("image"));
    }

    #[test]
    fn test_validate_rejects_overlapping_groups() {
        let config = ConcurrencyConfig {
            groups: vec![
                ProviderGroup {
                    name: "a".into(),
                    providers: vec!["x".into()],
                    max_concurrent: 1,
                },
                ProviderGroup {
                    name: "b".into(),
                    providers: vec!["x".into()],
                    max_concurrent: 1,
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ConcurrencyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_concurrent_registration_never_exceeds_cap() {
        let ctl = Arc::new(with_cap("openai", 4));
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ctl = ctl.clone();
                std::thread::spawn(move || ctl.register(&format!("job-{i}"), "openai"))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 4);
        assert_eq!(ctl.active_count("openai"), 4);
    }
}
