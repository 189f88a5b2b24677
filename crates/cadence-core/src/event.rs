use crate::CadenceResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Names of the domain events published by the orchestration core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An agent moved from pending to running.
    AgentStarted,
    /// Any agent status transition.
    AgentStatusChanged,
    /// An intervention parked agents of later phases.
    AgentsPaused,
    /// A parked agent went back to pending.
    AgentRearmed,
    /// An agent raised a review checkpoint.
    CheckpointCreated,
    /// A checkpoint received a decision.
    CheckpointResolved,
    /// A pending checkpoint was closed by an intervention.
    CheckpointSuperseded,
    /// An asset was approved or rejected.
    AssetReviewed,
    /// A rule resolved a checkpoint or asset.
    AutoApproved,
    /// Every agent of a phase completed.
    PhaseAdvanced,
    /// A project was left in flight at startup.
    ProjectInterrupted,
    /// A project was paused.
    ProjectPaused,
    /// A project was resumed.
    ProjectResumed,
    /// A human intervention arrived.
    InterventionReceived,
    /// Spend crossed the alert threshold.
    BudgetWarning,
    /// Spend reached the monthly limit.
    BudgetExceeded,
    /// A provider's share of spend crossed its threshold.
    ThresholdWarning,
    /// A provider changed between healthy and unhealthy.
    ProviderHealthChanged,
    /// An agent is waiting for a provider to recover.
    ProviderWaiting,
    /// A waiting agent's provider is healthy again.
    ProviderRecovered,
    /// A snapshot was captured.
    SnapshotCaptured,
}

impl EventKind {
    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AgentStarted => "agent_started",
            EventKind::AgentStatusChanged => "agent_status_changed",
            EventKind::AgentsPaused => "agents_paused",
            EventKind::AgentRearmed => "agent_rearmed",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::CheckpointResolved => "checkpoint_resolved",
            EventKind::CheckpointSuperseded => "checkpoint_superseded",
            EventKind::AssetReviewed => "asset_reviewed",
            EventKind::AutoApproved => "auto_approved",
            EventKind::PhaseAdvanced => "phase_advanced",
            EventKind::ProjectInterrupted => "project_interrupted",
            EventKind::ProjectPaused => "project_paused",
            EventKind::ProjectResumed => "project_resumed",
            EventKind::InterventionReceived => "intervention_received",
            EventKind::BudgetWarning => "budget_warning",
            EventKind::BudgetExceeded => "budget_exceeded",
            EventKind::ThresholdWarning => "threshold_warning",
            EventKind::ProviderHealthChanged => "provider_health_changed",
            EventKind::ProviderWaiting => "provider_waiting",
            EventKind::ProviderRecovered => "provider_recovered",
            EventKind::SnapshotCaptured => "snapshot_captured",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event: name, JSON payload and an optional scope key
/// (usually the project id) used by subscribers to filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event name.
    pub kind: EventKind,
    /// Event-specific data.
    pub payload: serde_json::Value,
    /// Subscriber filter key.
    pub scope: Option<String>,
    /// Emission time.
    pub emitted_at: DateTime<Utc>,
}

impl DomainEvent {
    /// An unscoped event stamped now.
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            scope: None,
            emitted_at: Utc::now(),
        }
    }

    /// Attach a scope key.
    pub fn scoped(mut self, scope: impl ToString) -> Self {
        self.scope = Some(scope.to_string());
        self
    }
}

/// Fan-out of domain events to subscribers. Implementations must not block.
pub trait Notifier: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: DomainEvent) -> CadenceResult<()>;
}

/// Notifier that drops every event.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn emit(&self, _event: DomainEvent) -> CadenceResult<()> {
        Ok(())
    }
}

/// Emit `event`, logging instead of propagating any failure.
pub fn notify_or_log(notifier: &dyn Notifier, event: DomainEvent) {
    let kind = event.kind;
    if let Err(e) = notifier.emit(event) {
        warn!(event = %kind, error = %e, "Failed to emit notification");
    }
}
