//! Core types and error definitions for the Cadence orchestration workspace.
//!
//! This crate provides the foundational types shared across all Cadence crates:
//! the error taxonomy, the domain entities driven through the pipeline, and the
//! contracts of the external collaborators (persistence and notification).
//!
//! # Main types
//!
//! - [`CadenceError`]: Unified error enum for all Cadence subsystems.
//! - [`CadenceResult`]: Convenience alias for `Result<T, CadenceError>`.
//! - [`Project`], [`Agent`], [`Checkpoint`], [`Asset`], [`Intervention`],
//!   [`CostEntry`], [`ProviderHealthStatus`], [`WorkflowSnapshot`]: domain entities.
//! - [`Store`]: Persistence collaborator consumed by the orchestrator.
//! - [`Notifier`]: Fire-and-forget fan-out of [`DomainEvent`]s.

/// Approval types for human-in-the-loop review.
pub mod approval;
/// Domain events and the notifier contract.
pub mod event;
/// Domain entities.
pub mod model;
/// Persistence contract.
pub mod store;

pub use approval::{
    ApprovalStatus, AutoApprovalRule, CheckpointStatus, Resolution, RuleCondition, RuleTarget,
};
pub use event::{notify_or_log, DomainEvent, EventKind, Notifier, NullNotifier};
pub use model::{
    Agent, AgentLog, AgentRole, AgentStatus, Asset, AssetKind, Checkpoint, CostEntry, CostUnit,
    Intervention, InterventionPriority, InterventionTarget, LogLevel, Project, ProjectConfig,
    ProjectStatus, ProviderHealthStatus, SystemLog, WorkerTaskSnapshot, WorkflowSnapshot,
};
pub use store::Store;

use std::time::Duration;
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for Cadence.
///
/// The first block of variants is the orchestration taxonomy; recoverable
/// ones are absorbed by the retry coordinator and the provider-wait loop.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    /// The provider is temporarily unavailable (recoverable).
    #[error("Provider '{provider}' unavailable: {message}")]
    ProviderUnavailable {
        /// Provider id.
        provider: String,
        /// Vendor message.
        message: String,
    },

    /// The provider throttled the request (recoverable).
    #[error("Rate limited by '{provider}'{}", retry_after_suffix(.retry_after))]
    RateLimited {
        /// Provider id.
        provider: String,
        /// Wait suggested by the provider.
        retry_after: Option<Duration>,
    },

    /// Bad input handed to an agent or provider (fatal).
    #[error("Context validation failed: {0}")]
    ContextValidation(String),

    /// A caller-imposed wait on a checkpoint elapsed (recoverable).
    #[error("Checkpoint {checkpoint_id} not resolved within {waited:?}")]
    CheckpointTimeout {
        /// The unresolved checkpoint.
        checkpoint_id: Uuid,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Generated output failed a quality gate.
    #[error("Quality check failed (attempt {attempts}/{limit}): {reason}")]
    QualityCheckFailed {
        /// Attempts made so far.
        attempts: u32,
        /// Attempts allowed.
        limit: u32,
        /// Why the output was refused.
        reason: String,
    },

    /// Retries were exhausted for an operation (fatal).
    #[error("Max retries exceeded for '{operation}' after {retries} retries")]
    MaxRetriesExceeded {
        /// Label of the retried operation.
        operation: String,
        /// Retries made after the first attempt.
        retries: u32,
        /// Messages of every failed attempt, oldest first.
        history: Vec<String>,
    },

    /// An agent consumed more tokens than it is allowed (fatal).
    #[error("Token budget exceeded: used {used} of {limit} tokens")]
    TokenBudgetExceeded {
        /// Tokens consumed.
        used: u64,
        /// Tokens allowed.
        limit: u64,
    },

    /// A transport-level connection failure (recoverable).
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation timed out (recoverable).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An unstructured failure reported by a provider.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A waiting operation was cancelled by its caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The requested entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `agent`.
        entity: &'static str,
        /// Requested id.
        id: String,
    },

    /// A state-machine transition that is not allowed.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        /// Entity kind, e.g. `agent`.
        entity: &'static str,
        /// Status the entity is in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// Invalid arguments supplied by a caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error reported by the persistence collaborator.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestration layer itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

impl CadenceError {
    /// Shorthand for [`CadenceError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        CadenceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`CadenceError::InvalidTransition`].
    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        CadenceError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether the taxonomy classifies this error as recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CadenceError::ProviderUnavailable { .. }
            | CadenceError::RateLimited { .. }
            | CadenceError::CheckpointTimeout { .. }
            | CadenceError::Connection(_)
            | CadenceError::Timeout(_) => true,
            CadenceError::QualityCheckFailed {
                attempts, limit, ..
            } => attempts < limit,
            _ => false,
        }
    }

    /// Explicit retry-after hint carried by the error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CadenceError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A convenience `Result` alias using [`CadenceError`].
pub type CadenceResult<T> = Result<T, CadenceError>;
