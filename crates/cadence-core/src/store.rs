use crate::model::{
    Agent, AgentLog, AgentStatus, Asset, Checkpoint, CostEntry, Intervention, Project,
    ProjectStatus, SystemLog, WorkflowSnapshot,
};
use crate::CadenceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence collaborator.
///
/// Every method is one transactional scope: a read-modify-write of a single
/// entity or a read of a consistent set. Cross-entity invariants are checked
/// by the orchestrator on a snapshot read, then committed with
/// [`Store::update_agent_if_status`] so that concurrent writers cannot both
/// win the same transition.
#[async_trait]
pub trait Store: Send + Sync {
    // Projects
    /// Persist a new project.
    async fn insert_project(&self, project: &Project) -> CadenceResult<()>;
    /// Load a project.
    async fn get_project(&self, id: Uuid) -> CadenceResult<Option<Project>>;
    /// Overwrite a stored project.
    async fn update_project(&self, project: &Project) -> CadenceResult<()>;
    /// Projects currently in `status`.
    async fn get_projects_by_status(&self, status: ProjectStatus) -> CadenceResult<Vec<Project>>;

    // Agents
    /// Persist a new agent.
    async fn insert_agent(&self, agent: &Agent) -> CadenceResult<()>;
    /// Load an agent.
    async fn get_agent(&self, id: Uuid) -> CadenceResult<Option<Agent>>;
    /// Every agent of a project.
    async fn get_agents_by_project(&self, project_id: Uuid) -> CadenceResult<Vec<Agent>>;
    /// Agents in any of `statuses`, across projects.
    async fn get_agents_by_status(&self, statuses: &[AgentStatus]) -> CadenceResult<Vec<Agent>>;
    /// Overwrite a stored agent unconditionally.
    async fn update_agent(&self, agent: &Agent) -> CadenceResult<()>;
    /// Write `agent` only if the stored copy still has status `expected`.
    /// Returns `false` (and writes nothing) when another writer got there first.
    async fn update_agent_if_status(
        &self,
        agent: &Agent,
        expected: AgentStatus,
    ) -> CadenceResult<bool>;

    // Checkpoints
    /// Persist a new checkpoint.
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> CadenceResult<()>;
    /// Load a checkpoint.
    async fn get_checkpoint(&self, id: Uuid) -> CadenceResult<Option<Checkpoint>>;
    /// Checkpoints raised by one agent.
    async fn get_checkpoints_by_agent(&self, agent_id: Uuid) -> CadenceResult<Vec<Checkpoint>>;
    /// Checkpoints of every agent of a project.
    async fn get_checkpoints_by_project(&self, project_id: Uuid)
        -> CadenceResult<Vec<Checkpoint>>;
    /// Overwrite a stored checkpoint.
    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> CadenceResult<()>;

    // Assets
    /// Persist a new asset.
    async fn insert_asset(&self, asset: &Asset) -> CadenceResult<()>;
    /// Load an asset.
    async fn get_asset(&self, id: Uuid) -> CadenceResult<Option<Asset>>;
    /// Every asset of a project.
    async fn get_assets_by_project(&self, project_id: Uuid) -> CadenceResult<Vec<Asset>>;
    /// Assets of one agent still awaiting review.
    async fn get_pending_assets_by_agent(&self, agent_id: Uuid) -> CadenceResult<Vec<Asset>>;
    /// Overwrite a stored asset.
    async fn update_asset(&self, asset: &Asset) -> CadenceResult<()>;

    // Interventions
    /// Persist a new intervention.
    async fn insert_intervention(&self, intervention: &Intervention) -> CadenceResult<()>;
    /// Load an intervention.
    async fn get_intervention(&self, id: Uuid) -> CadenceResult<Option<Intervention>>;

    // Costs (append-only)
    /// Append a cost entry.
    async fn add_cost_entry(&self, entry: &CostEntry) -> CadenceResult<()>;
    /// Entries with `from <= recorded_at < to`.
    async fn get_cost_entries_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CadenceResult<Vec<CostEntry>>;

    // Snapshots
    /// Persist a new snapshot.
    async fn insert_snapshot(&self, snapshot: &WorkflowSnapshot) -> CadenceResult<()>;
    /// Load a snapshot.
    async fn get_snapshot(&self, id: Uuid) -> CadenceResult<Option<WorkflowSnapshot>>;
    /// Snapshots of one agent, oldest first.
    async fn get_snapshots_by_agent(&self, agent_id: Uuid)
        -> CadenceResult<Vec<WorkflowSnapshot>>;
    /// Overwrite a stored snapshot.
    async fn update_snapshot(&self, snapshot: &WorkflowSnapshot) -> CadenceResult<()>;

    // Logs
    /// Append a system log line.
    async fn add_system_log(&self, log: &SystemLog) -> CadenceResult<()>;
    /// Append an agent log line.
    async fn add_agent_log(&self, log: &AgentLog) -> CadenceResult<()>;
    /// System log lines, optionally for one project.
    async fn get_system_logs(&self, project_id: Option<Uuid>) -> CadenceResult<Vec<SystemLog>>;
    /// Log lines of one agent, oldest first.
    async fn get_agent_logs(&self, agent_id: Uuid) -> CadenceResult<Vec<AgentLog>>;
}
