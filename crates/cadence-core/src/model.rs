//! Domain entities shared by every Cadence crate.
//!
//! All entities are owned by a [`Store`](crate::store::Store); the
//! orchestration components read them, apply a transition and write them back.

use crate::approval::{ApprovalStatus, AutoApprovalRule, CheckpointStatus, Resolution};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// --- Project ---

/// Lifecycle status of a [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Created but never started.
    Draft,
    /// Agents may be scheduled.
    Running,
    /// Halted by an operator or an urgent intervention.
    Paused,
    /// Was running when the process last stopped.
    Interrupted,
    /// Every agent finished.
    Completed,
    /// Aborted by a fatal error.
    Failed,
}

impl ProjectStatus {
    /// Whether the project may move from `self` to `next`.
    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Draft, Running)
                | (Running, Paused)
                | (Running, Interrupted)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Interrupted, Running)
                | (Interrupted, Paused)
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::Running => "running",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Interrupted => "interrupted",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-project configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Rules that resolve checkpoints and assets without a human.
    #[serde(default)]
    pub auto_approval_rules: Vec<AutoApprovalRule>,
    /// AI-service selection: agent type -> provider id.
    #[serde(default)]
    pub ai_services: HashMap<String, String>,
    /// Provider used by agent types without an explicit selection.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Free-form settings owned by the API layer.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl ProjectConfig {
    /// The provider an agent of `agent_type` is expected to use.
    pub fn provider_for(&self, agent_type: &str) -> Option<&str> {
        self.ai_services
            .get(agent_type)
            .or(self.default_provider.as_ref())
            .map(String::as_str)
    }
}

/// A generation project: one run of the agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: ProjectStatus,
    /// Ordinal of the workflow phase currently under review.
    pub current_phase: u32,
    /// Per-project settings: providers and auto-approval rules.
    #[serde(default)]
    pub config: ProjectConfig,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last modification.
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// A new draft project with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ProjectStatus::Draft,
            current_phase: 0,
            config: ProjectConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the project settings.
    pub fn with_config(mut self, config: ProjectConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the status, mostly for fixtures and recovery.
    pub fn with_status(mut self, status: ProjectStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark the entity as modified.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// --- Agent ---

/// Leader agents own a workflow step; workers are fanned out by a leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Owns one workflow step and may fan out workers.
    Leader,
    /// Spawned by a leader to do part of its work.
    Worker,
}

/// Status of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created, waiting for the scheduler.
    Pending,
    /// Executing.
    Running,
    /// Parked behind a checkpoint or an intervention.
    WaitingApproval,
    /// Blocked until its provider is healthy again.
    WaitingProvider,
    /// Left in flight by a process that stopped.
    Interrupted,
    /// Finished successfully.
    Completed,
    /// Finished with a fatal error.
    Failed,
}

impl AgentStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// ```text
    /// pending -> running -> {waiting_approval, waiting_provider, completed, failed, interrupted}
    /// waiting_provider -> {running, failed, interrupted}
    /// waiting_approval -> {running, completed, pending}
    /// failed | interrupted -> pending
    /// completed -> pending            (revision requested)
    /// ```
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, WaitingApproval)
                | (Running, WaitingProvider)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Interrupted)
                | (WaitingProvider, Running)
                | (WaitingProvider, Failed)
                | (WaitingProvider, Interrupted)
                | (WaitingApproval, Running)
                | (WaitingApproval, Completed)
                | (WaitingApproval, Pending)
                | (Failed, Pending)
                | (Interrupted, Pending)
                | (Completed, Pending)
        )
    }

    /// Statuses that mean work is in flight in this process.
    pub fn is_in_flight(self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::WaitingProvider)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::WaitingApproval => "waiting_approval",
            AgentStatus::WaitingProvider => "waiting_provider",
            AgentStatus::Interrupted => "interrupted",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One unit of AI-driven work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Key into the workflow dependency map, e.g. `concept_leader`.
    pub agent_type: String,
    /// Leader or worker.
    pub role: AgentRole,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// 0..=100.
    pub progress: u8,
    /// Human-readable label of what the agent is doing.
    pub current_task: Option<String>,
    /// Prompt tokens consumed so far.
    pub input_tokens: u64,
    /// Completion tokens produced so far.
    pub output_tokens: u64,
    /// Set for workers fanned out by a leader.
    pub parent_agent_id: Option<Uuid>,
    /// Last fatal error, preserved verbatim.
    pub error_message: Option<String>,
    /// Reviewer feedback carried into the next execution.
    pub revision_feedback: Option<String>,
    /// The agent whose intervention parked this one. Set while the agent
    /// sits in `waiting_approval` for that intervention.
    #[serde(default)]
    pub paused_for: Option<Uuid>,
    /// When the agent last entered `running` from `pending`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the agent completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last modification.
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// A pending agent with no usage.
    pub fn new(project_id: Uuid, agent_type: impl Into<String>, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_type: agent_type.into(),
            role,
            status: AgentStatus::Pending,
            progress: 0,
            current_task: None,
            input_tokens: 0,
            output_tokens: 0,
            parent_agent_id: None,
            error_message: None,
            revision_feedback: None,
            paused_for: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A leader agent of the given type.
    pub fn leader(project_id: Uuid, agent_type: impl Into<String>) -> Self {
        Self::new(project_id, agent_type, AgentRole::Leader)
    }

    /// A worker spawned by `parent`.
    pub fn worker(parent: &Agent, agent_type: impl Into<String>) -> Self {
        let mut agent = Self::new(parent.project_id, agent_type, AgentRole::Worker);
        agent.parent_agent_id = Some(parent.id);
        agent
    }

    /// Override the status, mostly for fixtures and recovery.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Input plus output tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Mark the entity as modified.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// --- Checkpoint & Asset ---

/// A human-approval gate raised by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Agent that raised the checkpoint.
    pub agent_id: Uuid,
    /// Review point label, e.g. `concept_review`.
    pub kind: String,
    /// What the reviewer is asked to look at.
    pub title: String,
    /// Pending until resolved or superseded.
    pub status: CheckpointStatus,
    /// Decision, once resolved.
    pub resolution: Option<Resolution>,
    /// Reviewer comments, carried into a revision.
    pub feedback: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the checkpoint was closed.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// A pending checkpoint raised by `agent_id`.
    pub fn new(
        project_id: Uuid,
        agent_id: Uuid,
        kind: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_id,
            kind: kind.into(),
            title: title.into(),
            status: CheckpointStatus::Pending,
            resolution: None,
            feedback: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Still awaiting a decision.
    pub fn is_pending(&self) -> bool {
        self.status == CheckpointStatus::Pending
    }
}

/// Media kind of a generated [`Asset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Prose, scripts and other text.
    Text,
    /// Still images.
    Image,
    /// Voice and music.
    Audio,
    /// Anything else.
    Other,
}

/// A generated artefact that needs approval before dependents may start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Agent that produced the asset.
    pub agent_id: Uuid,
    /// File or display name.
    pub name: String,
    /// Media kind.
    pub kind: AssetKind,
    /// Review state; dependents wait while it is pending.
    pub approval_status: ApprovalStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Asset {
    /// A new asset awaiting review.
    pub fn new(project_id: Uuid, agent_id: Uuid, name: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_id,
            name: name.into(),
            kind,
            approval_status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

// --- Intervention ---

/// Who an intervention is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterventionTarget {
    /// Every agent of the project.
    All,
    /// One agent.
    Agent {
        /// The addressed agent.
        agent_id: Uuid,
    },
}

/// How disruptive an intervention is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionPriority {
    /// Delivered without pausing the project.
    Normal,
    /// Pauses the project.
    Urgent,
}

/// An out-of-band human message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    /// Unique identifier.
    pub id: Uuid,
    /// Target project.
    pub project_id: Uuid,
    /// Addressee.
    pub target: InterventionTarget,
    /// Priority.
    pub priority: InterventionPriority,
    /// The human's message.
    pub message: String,
    /// References to files the human attached.
    #[serde(default)]
    pub attached_files: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Intervention {
    /// A new intervention without attachments.
    pub fn new(
        project_id: Uuid,
        target: InterventionTarget,
        priority: InterventionPriority,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            target,
            priority,
            message: message.into(),
            attached_files: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach file references.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.attached_files = files;
        self
    }
}

// --- Cost ---

/// The billable quantity behind a [`CostEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum CostUnit {
    /// Token usage of a chat completion.
    Tokens {
        /// Prompt tokens.
        input: u64,
        /// Completion tokens.
        output: u64,
    },
    /// Non-token generations such as images or clips.
    Generations {
        /// Number of generations.
        count: u32,
    },
}

/// Immutable record of one billable unit. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    /// Unique identifier.
    pub id: Uuid,
    /// Project billed, if any.
    pub project_id: Option<Uuid>,
    /// Agent that incurred the cost, if any.
    pub agent_id: Option<Uuid>,
    /// Provider that served the request.
    pub provider: String,
    /// Model that served the request.
    pub model: String,
    /// Billable quantity.
    pub unit: CostUnit,
    /// Cost in US dollars at the time of recording.
    pub cost_usd: f64,
    /// When the cost was recorded.
    pub recorded_at: DateTime<Utc>,
}

// --- Provider health ---

/// Latest availability observation for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealthStatus {
    /// Registry id of the provider.
    pub provider_id: String,
    /// Whether the last probe succeeded.
    pub available: bool,
    /// Round-trip time of the last successful probe.
    pub latency_ms: Option<u64>,
    /// Failure message of the last probe.
    pub error: Option<String>,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
}

impl ProviderHealthStatus {
    /// Two observations describe the same state (timestamps ignored).
    pub fn same_state(&self, other: &ProviderHealthStatus) -> bool {
        self.provider_id == other.provider_id
            && self.available == other.available
            && self.error == other.error
    }
}

// --- Snapshots ---

/// State of one worker captured inside a [`WorkflowSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskSnapshot {
    /// The worker.
    pub agent_id: Uuid,
    /// Its workflow type.
    pub agent_type: String,
    /// Status at capture time.
    pub status: AgentStatus,
    /// Progress at capture time.
    pub progress: u8,
    /// Task label at capture time.
    pub current_task: Option<String>,
}

/// Point-in-time capture of an agent and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Captured agent.
    pub agent_id: Uuid,
    /// Execution run the snapshot belongs to.
    pub run_id: Uuid,
    /// Full copy of the agent at capture time.
    pub agent: Agent,
    /// Its workers at capture time.
    pub workers: Vec<WorkerTaskSnapshot>,
    /// Set once a later snapshot of the same agent and run supersedes this one.
    pub invalidated: bool,
    /// Capture time.
    pub created_at: DateTime<Utc>,
}

// --- Logs ---

/// Severity of a persisted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Normal progress.
    Info,
    /// Something degraded but work continues.
    Warn,
    /// A failure.
    Error,
}

/// Project-wide operator log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLog {
    /// Unique identifier.
    pub id: Uuid,
    /// Project the line is about, if any.
    pub project_id: Option<Uuid>,
    /// Severity.
    pub level: LogLevel,
    /// Log text.
    pub message: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl SystemLog {
    /// A new log line stamped now.
    pub fn new(project_id: Option<Uuid>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Log line attached to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Agent the line is about.
    pub agent_id: Uuid,
    /// Severity.
    pub level: LogLevel,
    /// Log text.
    pub message: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl AgentLog {
    /// A new log line for `agent`, stamped now.
    pub fn new(agent: &Agent, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: agent.project_id,
            agent_id: agent.id,
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
