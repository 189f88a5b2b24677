use async_trait::async_trait;
use cadence_core::{
    Agent, AgentLog, AgentStatus, ApprovalStatus, Asset, CadenceError, CadenceResult, Checkpoint,
    CostEntry, Intervention, Project, ProjectStatus, Store, SystemLog, WorkflowSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    projects: HashMap<Uuid, Project>,
    #[serde(default)]
    agents: HashMap<Uuid, Agent>,
    #[serde(default)]
    checkpoints: HashMap<Uuid, Checkpoint>,
    #[serde(default)]
    assets: HashMap<Uuid, Asset>,
    #[serde(default)]
    interventions: HashMap<Uuid, Intervention>,
    #[serde(default)]
    cost_entries: Vec<CostEntry>,
    #[serde(default)]
    snapshots: HashMap<Uuid, WorkflowSnapshot>,
    #[serde(default)]
    system_logs: Vec<SystemLog>,
    #[serde(default)]
    agent_logs: Vec<AgentLog>,
}

/// Process-local [`Store`]. Each trait call takes the state lock once, so
/// every call is its own transactional scope.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the whole state to `path` as pretty JSON.
    pub async fn save_to(&self, path: &Path) -> CadenceResult<()> {
        let json = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), "Store state saved");
        Ok(())
    }

    /// Load a state previously written by [`save_to`](Self::save_to).
    pub async fn load_from(path: &Path) -> CadenceResult<Self> {
        let data = tokio::fs::read_to_string(path).await?;
        let state: StoreState = serde_json::from_str(&data).map_err(|e| {
            CadenceError::Store(format!("failed to parse {}: {e}", path.display()))
        })?;
        info!(
            path = %path.display(),
            projects = state.projects.len(),
            agents = state.agents.len(),
            "Store state loaded"
        );
        Ok(Self {
            state: RwLock::new(state),
        })
    }
}

fn insert_new<T: Clone>(
    map: &mut HashMap<Uuid, T>,
    entity: &'static str,
    id: Uuid,
    value: &T,
) -> CadenceResult<()> {
    if map.contains_key(&id) {
        return Err(CadenceError::Store(format!("{entity} {id} already exists")));
    }
    map.insert(id, value.clone());
    Ok(())
}

fn replace<T: Clone>(
    map: &mut HashMap<Uuid, T>,
    entity: &'static str,
    id: Uuid,
    value: &T,
) -> CadenceResult<()> {
    match map.get_mut(&id) {
        Some(slot) => {
            *slot = value.clone();
            Ok(())
        }
        None => Err(CadenceError::not_found(entity, id)),
    }
}

fn sorted_by_created<T: Clone>(
    items: impl Iterator<Item = T>,
    key: impl Fn(&T) -> (DateTime<Utc>, Uuid),
) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by_key(key);
    out
}

#[async_trait]
impl Store for MemoryStore {
    // --- Projects ---

    async fn insert_project(&self, project: &Project) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.projects, "project", project.id, project)
    }

    async fn get_project(&self, id: Uuid) -> CadenceResult<Option<Project>> {
        Ok(self.state.read().await.projects.get(&id).cloned())
    }

    async fn update_project(&self, project: &Project) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        replace(&mut state.projects, "project", project.id, project)
    }

    async fn get_projects_by_status(&self, status: ProjectStatus) -> CadenceResult<Vec<Project>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state.projects.values().filter(|p| p.status == status).cloned(),
            |p| (p.created_at, p.id),
        ))
    }

    // --- Agents ---

    async fn insert_agent(&self, agent: &Agent) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.agents, "agent", agent.id, agent)
    }

    async fn get_agent(&self, id: Uuid) -> CadenceResult<Option<Agent>> {
        Ok(self.state.read().await.agents.get(&id).cloned())
    }

    async fn get_agents_by_project(&self, project_id: Uuid) -> CadenceResult<Vec<Agent>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state
                .agents
                .values()
                .filter(|a| a.project_id == project_id)
                .cloned(),
            |a| (a.created_at, a.id),
        ))
    }

    async fn get_agents_by_status(&self, statuses: &[AgentStatus]) -> CadenceResult<Vec<Agent>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state
                .agents
                .values()
                .filter(|a| statuses.contains(&a.status))
                .cloned(),
            |a| (a.created_at, a.id),
        ))
    }

    async fn update_agent(&self, agent: &Agent) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        replace(&mut state.agents, "agent", agent.id, agent)
    }

    async fn update_agent_if_status(
        &self,
        agent: &Agent,
        expected: AgentStatus,
    ) -> CadenceResult<bool> {
        let mut state = self.state.write().await;
        let slot = state
            .agents
            .get_mut(&agent.id)
            .ok_or_else(|| CadenceError::not_found("agent", agent.id))?;
        if slot.status != expected {
            return Ok(false);
        }
        *slot = agent.clone();
        Ok(true)
    }

    // --- Checkpoints ---

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.checkpoints, "checkpoint", checkpoint.id, checkpoint)
    }

    async fn get_checkpoint(&self, id: Uuid) -> CadenceResult<Option<Checkpoint>> {
        Ok(self.state.read().await.checkpoints.get(&id).cloned())
    }

    async fn get_checkpoints_by_agent(&self, agent_id: Uuid) -> CadenceResult<Vec<Checkpoint>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state
                .checkpoints
                .values()
                .filter(|c| c.agent_id == agent_id)
                .cloned(),
            |c| (c.created_at, c.id),
        ))
    }

    async fn get_checkpoints_by_project(
        &self,
        project_id: Uuid,
    ) -> CadenceResult<Vec<Checkpoint>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state
                .checkpoints
                .values()
                .filter(|c| c.project_id == project_id)
                .cloned(),
            |c| (c.created_at, c.id),
        ))
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        replace(&mut state.checkpoints, "checkpoint", checkpoint.id, checkpoint)
    }

    // --- Assets ---

    async fn insert_asset(&self, asset: &Asset) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.assets, "asset", asset.id, asset)
    }

    async fn get_asset(&self, id: Uuid) -> CadenceResult<Option<Asset>> {
        Ok(self.state.read().await.assets.get(&id).cloned())
    }

    async fn get_assets_by_project(&self, project_id: Uuid) -> CadenceResult<Vec<Asset>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state
                .assets
                .values()
                .filter(|a| a.project_id == project_id)
                .cloned(),
            |a| (a.created_at, a.id),
        ))
    }

    async fn get_pending_assets_by_agent(&self, agent_id: Uuid) -> CadenceResult<Vec<Asset>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state
                .assets
                .values()
                .filter(|a| a.agent_id == agent_id && a.approval_status == ApprovalStatus::Pending)
                .cloned(),
            |a| (a.created_at, a.id),
        ))
    }

    async fn update_asset(&self, asset: &Asset) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        replace(&mut state.assets, "asset", asset.id, asset)
    }

    // --- Interventions ---

    async fn insert_intervention(&self, intervention: &Intervention) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        insert_new(
            &mut state.interventions,
            "intervention",
            intervention.id,
            intervention,
        )
    }

    async fn get_intervention(&self, id: Uuid) -> CadenceResult<Option<Intervention>> {
        Ok(self.state.read().await.interventions.get(&id).cloned())
    }

    // --- Costs ---

    async fn add_cost_entry(&self, entry: &CostEntry) -> CadenceResult<()> {
        self.state.write().await.cost_entries.push(entry.clone());
        Ok(())
    }

    async fn get_cost_entries_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CadenceResult<Vec<CostEntry>> {
        let state = self.state.read().await;
        Ok(state
            .cost_entries
            .iter()
            .filter(|e| e.recorded_at >= from && e.recorded_at < to)
            .cloned()
            .collect())
    }

    // --- Snapshots ---

    async fn insert_snapshot(&self, snapshot: &WorkflowSnapshot) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        insert_new(&mut state.snapshots, "snapshot", snapshot.id, snapshot)
    }

    async fn get_snapshot(&self, id: Uuid) -> CadenceResult<Option<WorkflowSnapshot>> {
        Ok(self.state.read().await.snapshots.get(&id).cloned())
    }

    async fn get_snapshots_by_agent(
        &self,
        agent_id: Uuid,
    ) -> CadenceResult<Vec<WorkflowSnapshot>> {
        let state = self.state.read().await;
        Ok(sorted_by_created(
            state
                .snapshots
                .values()
                .filter(|s| s.agent_id == agent_id)
                .cloned(),
            |s| (s.created_at, s.id),
        ))
    }

    async fn update_snapshot(&self, snapshot: &WorkflowSnapshot) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        replace(&mut state.snapshots, "snapshot", snapshot.id, snapshot)
    }

    // --- Logs ---

    async fn add_system_log(&self, log: &SystemLog) -> CadenceResult<()> {
        self.state.write().await.system_logs.push(log.clone());
        Ok(())
    }

    async fn add_agent_log(&self, log: &AgentLog) -> CadenceResult<()> {
        self.state.write().await.agent_logs.push(log.clone());
        Ok(())
    }

    async fn get_system_logs(&self, project_id: Option<Uuid>) -> CadenceResult<Vec<SystemLog>> {
        let state = self.state.read().await;
        Ok(state
            .system_logs
            .iter()
            .filter(|l| project_id.is_none() || l.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_agent_logs(&self, agent_id: Uuid) -> CadenceResult<Vec<AgentLog>> {
        let state = self.state.read().await;
        Ok(state
            .agent_logs
            .iter()
            .filter(|l| l.agent_id == agent_id)
            .cloned()
            .collect())
    }
}
