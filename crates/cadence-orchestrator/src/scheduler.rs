use crate::audit;
use crate::budget::BudgetGuard;
use crate::checkpoint::{CheckpointResolver, PendingGates};
use crate::concurrency::ConcurrencyController;
use crate::dependencies::WorkflowHandle;
use crate::lifecycle::RecoveryGate;
use cadence_core::{
    notify_or_log, Agent, AgentStatus, CadenceError, CadenceResult, DomainEvent, EventKind,
    LogLevel, Notifier, Project, ProjectStatus, Store,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a pending agent did not start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockReason {
    /// The project is not in `running` status.
    ProjectNotRunning {
        /// Current project status.
        status: ProjectStatus,
    },
    /// The monthly budget is spent and `stop_on_exceeded` is set.
    BudgetStopped,
    /// No agent of a prerequisite type exists in the project.
    MissingDependency {
        /// The missing prerequisite type.
        agent_type: String,
    },
    /// A prerequisite agent has not completed yet.
    DependencyNotCompleted {
        /// Type of the prerequisite.
        agent_type: String,
        /// Its current status.
        status: AgentStatus,
    },
    /// A completed prerequisite still has checkpoints awaiting review.
    PendingCheckpoints {
        /// Type of the prerequisite.
        agent_type: String,
        /// Unresolved checkpoints.
        count: usize,
    },
    /// A completed prerequisite still has assets awaiting review.
    PendingAssets {
        /// Type of the prerequisite.
        agent_type: String,
        /// Assets still pending.
        count: usize,
    },
    /// The worker's parent leader no longer exists.
    MissingParent {
        /// Id recorded on the worker.
        parent_id: Uuid,
    },
    /// The worker's parent leader is neither running nor completed.
    ParentNotReady {
        /// Type of the parent leader.
        agent_type: String,
        /// Its current status.
        status: AgentStatus,
    },
    /// Every concurrency slot for the provider is taken.
    NoCapacity {
        /// Provider the agent would run on.
        provider: String,
    },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::ProjectNotRunning { status } => write!(f, "project is {status}"),
            BlockReason::BudgetStopped => f.write_str("monthly budget exhausted"),
            BlockReason::MissingDependency { agent_type } => {
                write!(f, "no {agent_type} agent in project")
            }
            BlockReason::DependencyNotCompleted { agent_type, status } => {
                write!(f, "{agent_type} is {status}")
            }
            BlockReason::PendingCheckpoints { agent_type, count } => {
                write!(f, "{agent_type} has {count} pending checkpoint(s)")
            }
            BlockReason::PendingAssets { agent_type, count } => {
                write!(f, "{agent_type} has {count} pending asset(s)")
            }
            BlockReason::MissingParent { parent_id } => write!(f, "parent agent {parent_id} is gone"),
            BlockReason::ParentNotReady { agent_type, status } => {
                write!(f, "parent {agent_type} is {status}")
            }
            BlockReason::NoCapacity { provider } => write!(f, "provider '{provider}' is at capacity"),
        }
    }
}

/// A pending agent and everything currently holding it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedAgent {
    /// The blocked agent.
    pub agent_id: Uuid,
    /// Its workflow type.
    pub agent_type: String,
    /// Every reason found, shared project-level reasons first.
    pub reasons: Vec<BlockReason>,
}

/// Decides which pending agents start on each tick.
///
/// A pending leader of a running project is eligible when every agent of
/// each prerequisite type is completed with no pending checkpoint or asset.
/// A pending worker is eligible once its parent leader is running or
/// completed. Eligible agents are started through a compare-and-set on
/// their `pending` status, after claiming a concurrency slot for their
/// provider when a controller is attached. Ticks on the same project are
/// serialized.
pub struct WorkflowScheduler {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    workflow: Arc<WorkflowHandle>,
    checkpoints: Arc<CheckpointResolver>,
    gate: Arc<RecoveryGate>,
    concurrency: Option<Arc<ConcurrencyController>>,
    budget: Option<Arc<BudgetGuard>>,
    default_provider: Option<String>,
    tick_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkflowScheduler {
    /// Scheduler without concurrency or budget admission.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        workflow: Arc<WorkflowHandle>,
        checkpoints: Arc<CheckpointResolver>,
        gate: Arc<RecoveryGate>,
    ) -> Self {
        Self {
            store,
            notifier,
            workflow,
            checkpoints,
            gate,
            concurrency: None,
            budget: None,
            default_provider: None,
            tick_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a provider slot before starting each agent.
    pub fn with_concurrency(mut self, concurrency: Arc<ConcurrencyController>) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Start nothing while the monthly budget stops work.
    pub fn with_budget(mut self, budget: Arc<BudgetGuard>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Provider assumed for agent types the project does not map.
    pub fn with_default_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_provider = Some(provider.into());
        self
    }

    /// Provider an agent of `agent_type` runs on in `project`.
    pub fn provider_for(&self, project: &Project, agent_type: &str) -> Option<String> {
        project
            .config
            .provider_for(agent_type)
            .map(str::to_string)
            .or_else(|| self.default_provider.clone())
    }

    /// Provider an agent runs on. A worker the project does not map runs
    /// on its parent leader's provider.
    pub fn provider_for_agent(
        &self,
        project: &Project,
        agent: &Agent,
        parent: Option<&Agent>,
    ) -> Option<String> {
        match parent {
            Some(parent) if !project.config.ai_services.contains_key(&agent.agent_type) => {
                self.provider_for(project, &parent.agent_type)
            }
            _ => self.provider_for(project, &agent.agent_type),
        }
    }

    /// [`provider_for_agent`](Self::provider_for_agent), loading the parent
    /// of a worker from the store.
    pub async fn resolve_provider(&self, project: &Project, agent: &Agent) -> CadenceResult<Option<String>> {
        let parent = match agent.parent_agent_id {
            Some(parent_id) => self.store.get_agent(parent_id).await?,
            None => None,
        };
        Ok(self.provider_for_agent(project, agent, parent.as_ref()))
    }

    fn tick_lock(&self, project_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.tick_locks.lock().entry(project_id).or_default().clone()
    }

    async fn load_project(&self, project_id: Uuid) -> CadenceResult<Project> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("project", project_id))
    }

    /// Blocking reasons of one pending agent: its parent for a worker, its
    /// prerequisites for a leader.
    async fn admission_blocks(
        &self,
        agent: &Agent,
        by_id: &HashMap<Uuid, &Agent>,
        by_type: &HashMap<&str, Vec<&Agent>>,
        gates: &mut HashMap<Uuid, PendingGates>,
    ) -> CadenceResult<Vec<BlockReason>> {
        let Some(parent_id) = agent.parent_agent_id else {
            return self.dependency_blocks(agent, by_type, gates).await;
        };
        Ok(match by_id.get(&parent_id) {
            None => vec![BlockReason::MissingParent { parent_id }],
            Some(parent) if matches!(parent.status, AgentStatus::Running | AgentStatus::Completed) => {
                Vec::new()
            }
            Some(parent) => vec![BlockReason::ParentNotReady {
                agent_type: parent.agent_type.clone(),
                status: parent.status,
            }],
        })
    }

    /// Blocking reasons coming from the prerequisites of `agent`, using
    /// `gates` to cache per-dependency lookups within one pass.
    async fn dependency_blocks(
        &self,
        agent: &Agent,
        by_type: &HashMap<&str, Vec<&Agent>>,
        gates: &mut HashMap<Uuid, PendingGates>,
    ) -> CadenceResult<Vec<BlockReason>> {
        let workflow = self.workflow.current();
        let mut reasons = Vec::new();
        for dep_type in workflow.prerequisites(&agent.agent_type) {
            let Some(deps) = by_type.get(dep_type.as_str()) else {
                reasons.push(BlockReason::MissingDependency {
                    agent_type: dep_type.clone(),
                });
                continue;
            };
            for dep in deps {
                if dep.status != AgentStatus::Completed {
                    reasons.push(BlockReason::DependencyNotCompleted {
                        agent_type: dep_type.clone(),
                        status: dep.status,
                    });
                    continue;
                }
                let pending = match gates.get(&dep.id) {
                    Some(g) => *g,
                    None => {
                        let g = self.checkpoints.pending_gates(dep.id).await?;
                        gates.insert(dep.id, g);
                        g
                    }
                };
                if pending.checkpoints > 0 {
                    reasons.push(BlockReason::PendingCheckpoints {
                        agent_type: dep_type.clone(),
                        count: pending.checkpoints,
                    });
                }
                if pending.assets > 0 {
                    reasons.push(BlockReason::PendingAssets {
                        agent_type: dep_type.clone(),
                        count: pending.assets,
                    });
                }
            }
        }
        Ok(reasons)
    }

    /// Start every agent of the project whose prerequisites are satisfied.
    /// Returns the agents that were started, already in `running` state.
    pub async fn start_next_agents(&self, project_id: Uuid) -> CadenceResult<Vec<Agent>> {
        self.gate.ensure_open()?;
        let lock = self.tick_lock(project_id);
        let _tick = lock.lock().await;

        let project = self.load_project(project_id).await?;
        if project.status != ProjectStatus::Running {
            debug!(project_id = %project_id, status = %project.status, "Project not running, nothing to schedule");
            return Ok(Vec::new());
        }
        if let Some(budget) = &self.budget {
            let check = budget.check_budget().await?;
            if !check.allowed {
                info!(project_id = %project_id, spent = check.spent_usd, "Budget exhausted, not starting agents");
                return Ok(Vec::new());
            }
        }

        let agents = self.store.get_agents_by_project(project_id).await?;
        let by_id: HashMap<Uuid, &Agent> = agents.iter().map(|a| (a.id, a)).collect();
        let by_type = roots_by_type(&agents);
        let mut gates = HashMap::new();
        let mut started = Vec::new();

        for agent in agents.iter().filter(|a| a.status == AgentStatus::Pending) {
            let blocks = self.admission_blocks(agent, &by_id, &by_type, &mut gates).await?;
            if !blocks.is_empty() {
                continue;
            }
            let parent = agent.parent_agent_id.and_then(|id| by_id.get(&id).copied());
            let provider = self.provider_for_agent(&project, agent, parent);
            match self.start_agent(project_id, agent, provider.as_deref()).await {
                Ok(Some(next)) => started.push(next),
                Ok(None) => {}
                Err(e) if started.is_empty() => return Err(e),
                Err(e) => {
                    // The agents already started must still reach the engine.
                    warn!(project_id = %project_id, error = %e, started = started.len(), "Tick stopped early");
                    break;
                }
            }
        }
        Ok(started)
    }

    /// Claim a slot and flip one eligible agent to `running`. Returns
    /// `None` when there is no capacity or another writer won the start.
    /// The slot is released on every path that does not start the agent.
    async fn start_agent(
        &self,
        project_id: Uuid,
        agent: &Agent,
        provider: Option<&str>,
    ) -> CadenceResult<Option<Agent>> {
        let job_id = agent.id.to_string();
        let claimed = match (&self.concurrency, provider) {
            (Some(ctl), Some(p)) => {
                if !ctl.register(&job_id, p) {
                    debug!(agent = %agent.agent_type, provider = %p, "No capacity, deferring");
                    return Ok(None);
                }
                Some((ctl, p))
            }
            _ => None,
        };
        let release = || {
            if let Some((ctl, p)) = claimed {
                ctl.unregister(&job_id, p);
            }
        };

        let mut next = agent.clone();
        next.status = AgentStatus::Running;
        next.progress = 0;
        next.started_at = Some(Utc::now());
        next.completed_at = None;
        next.error_message = None;
        next.current_task = Some(format!("Starting {}", agent.agent_type));
        next.touch();

        match self.store.update_agent_if_status(&next, AgentStatus::Pending).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(agent_id = %agent.id, "Lost start race, skipping");
                release();
                return Ok(None);
            }
            Err(e) => {
                release();
                return Err(e);
            }
        }

        info!(agent_id = %next.id, agent = %next.agent_type, provider = ?provider, "Agent started");
        if let Err(e) = self.record_start(project_id, &next).await {
            warn!(agent_id = %next.id, error = %e, "Agent started but its start logs were not written");
        }
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::AgentStarted,
                serde_json::json!({
                    "agent_id": next.id,
                    "agent_type": next.agent_type,
                    "parent_agent_id": next.parent_agent_id,
                    "provider": provider,
                }),
            )
            .scoped(project_id),
        );
        Ok(Some(next))
    }

    async fn record_start(&self, project_id: Uuid, agent: &Agent) -> CadenceResult<()> {
        audit::system_log(
            self.store.as_ref(),
            Some(project_id),
            LogLevel::Info,
            format!("Started {} ({})", agent.agent_type, agent.id),
        )
        .await?;
        audit::agent_log(
            self.store.as_ref(),
            agent,
            LogLevel::Info,
            match &agent.revision_feedback {
                Some(feedback) => format!("Started with revision feedback: {feedback}"),
                None => "Started".to_string(),
            },
        )
        .await
    }

    /// Every pending agent of the project with its blocking reasons. Agents
    /// that would start on the next tick are omitted.
    pub async fn explain_blocked(&self, project_id: Uuid) -> CadenceResult<Vec<BlockedAgent>> {
        let project = self.load_project(project_id).await?;
        let mut shared = Vec::new();
        if project.status != ProjectStatus::Running {
            shared.push(BlockReason::ProjectNotRunning {
                status: project.status,
            });
        }
        if let Some(budget) = &self.budget {
            if !budget.check_budget().await?.allowed {
                shared.push(BlockReason::BudgetStopped);
            }
        }

        let agents = self.store.get_agents_by_project(project_id).await?;
        let by_id: HashMap<Uuid, &Agent> = agents.iter().map(|a| (a.id, a)).collect();
        let by_type = roots_by_type(&agents);
        let mut gates = HashMap::new();
        let mut blocked = Vec::new();

        for agent in agents.iter().filter(|a| a.status == AgentStatus::Pending) {
            let mut reasons = shared.clone();
            reasons.extend(self.admission_blocks(agent, &by_id, &by_type, &mut gates).await?);
            let parent = agent.parent_agent_id.and_then(|id| by_id.get(&id).copied());
            if let (Some(ctl), Some(provider)) = (
                &self.concurrency,
                self.provider_for_agent(&project, agent, parent),
            ) {
                if !ctl.can_start(&provider, &agent.id.to_string()) {
                    reasons.push(BlockReason::NoCapacity { provider });
                }
            }
            if !reasons.is_empty() {
                blocked.push(BlockedAgent {
                    agent_id: agent.id,
                    agent_type: agent.agent_type.clone(),
                    reasons,
                });
            }
        }
        Ok(blocked)
    }
}

/// Leader-level agents grouped by type.
fn roots_by_type(agents: &[Agent]) -> HashMap<&str, Vec<&Agent>> {
    let mut by_type: HashMap<&str, Vec<&Agent>> = HashMap::new();
    for agent in agents.iter().filter(|a| a.parent_agent_id.is_none()) {
        by_type.entry(agent.agent_type.as_str()).or_default().push(agent);
    }
    by_type
}
