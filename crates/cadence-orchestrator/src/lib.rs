//! Orchestration core for the Cadence generation pipeline.
//!
//! Agents of a project form a DAG keyed by agent type. Each tick the
//! scheduler starts the pending agents whose prerequisites are completed and
//! approved, subject to per-provider concurrency caps and the monthly budget.
//! Human reviewers gate progress through checkpoints and assets; urgent
//! interventions pause a project and can re-activate a single agent.
//!
//! # Main types
//!
//! - [`WorkflowScheduler`]: Decides which pending agents start on each tick.
//! - [`AgentLifecycleManager`]: Retries, restart recovery, interventions, status updates.
//! - [`CheckpointResolver`]: Checkpoint and asset review, auto-approval rules.
//! - [`ConcurrencyController`]: Per-provider and per-group admission control.
//! - [`BudgetGuard`]: Monthly spend limit, warnings and cost projection.
//! - [`PipelineEngine`]: Wires the components together and executes agents.
//! - [`OrchestratorConfig`]: TOML configuration.

mod audit;
/// Auto-approval rule matching.
pub mod auto_approval;
/// Monthly budget enforcement and pricing.
pub mod budget;
/// Checkpoint and asset review.
pub mod checkpoint;
/// Per-provider concurrency limits.
pub mod concurrency;
/// Orchestrator configuration.
pub mod config;
/// Workflow dependency map.
pub mod dependencies;
/// Pipeline driver.
pub mod engine;
/// Notifier implementations.
pub mod events;
/// Agent and project lifecycle transitions.
pub mod lifecycle;
/// Dependency-aware agent scheduling.
pub mod scheduler;
/// Workflow snapshots.
pub mod snapshot;

pub use auto_approval::{compile_pattern, RuleMatcher};
pub use budget::{
    BudgetCheck, BudgetConfig, BudgetGuard, BudgetWarning, CostProjection, ModelPricing,
    PricingTable,
};
pub use checkpoint::{AutoApprovalOutcome, CheckpointResolver, PendingGates};
pub use concurrency::{
    ConcurrencyConfig, ConcurrencyController, GroupCapMode, ProviderGroup, ProviderUsage,
    DEFAULT_MAX_CONCURRENT,
};
pub use config::{EngineConfig, OrchestratorConfig};
pub use dependencies::{phase_of_agent, WorkflowDependencyMap, WorkflowHandle};
pub use engine::{
    AgentExecutor, AssetDraft, ChatExecutor, DriveReport, ExecutionContext, ExecutionOutput,
    PipelineEngine, ReviewRequest,
};
pub use events::{BroadcastNotifier, FanoutNotifier, TracingNotifier};
pub use lifecycle::{AgentLifecycleManager, InterventionOutcome, RecoveryGate, RecoveryReport};
pub use scheduler::{BlockReason, BlockedAgent, WorkflowScheduler};
pub use snapshot::SnapshotManager;
