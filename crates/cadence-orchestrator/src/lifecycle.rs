use crate::audit;
use crate::dependencies::{phase_of_agent, WorkflowHandle};
use cadence_core::{
    notify_or_log, Agent, AgentStatus, CadenceError, CadenceResult, CheckpointStatus,
    DomainEvent, EventKind, Intervention, InterventionPriority, InterventionTarget, LogLevel,
    Notifier, Project, ProjectStatus, Store,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at a field update before giving up on an agent whose status
/// keeps changing underneath it.
const FIELD_UPDATE_ATTEMPTS: usize = 8;

/// Opens once startup recovery has run. Scheduling is refused until then.
#[derive(Debug, Default)]
pub struct RecoveryGate {
    open: AtomicBool,
}

impl RecoveryGate {
    /// A closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether recovery has run.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Open the gate. Idempotent.
    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Fail unless the gate is open.
    pub fn ensure_open(&self) -> CadenceResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CadenceError::Orchestrator(
                "scheduling refused: startup recovery has not run".into(),
            ))
        }
    }
}

/// What startup recovery touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Projects moved to `interrupted`.
    pub projects: Vec<Uuid>,
    /// Agents moved to `interrupted`.
    pub agents: Vec<Uuid>,
}

impl RecoveryReport {
    /// Whether recovery found nothing in flight.
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty() && self.agents.is_empty()
    }
}

/// Result of handling one intervention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterventionOutcome {
    /// The stored intervention.
    pub intervention_id: Uuid,
    /// Whether an urgent priority paused the project.
    pub project_paused: bool,
    /// Agent moved back to `pending`, if any.
    pub activated: Option<Uuid>,
    /// Agents parked in `waiting_approval`.
    pub paused_agents: Vec<Uuid>,
}

/// Agent and project state transitions outside of normal scheduling:
/// retries, crash recovery, interventions, and the status updates made
/// while an agent executes.
pub struct AgentLifecycleManager {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    workflow: Arc<WorkflowHandle>,
    gate: Arc<RecoveryGate>,
}

impl AgentLifecycleManager {
    /// Manager sharing `gate` with the scheduler.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        workflow: Arc<WorkflowHandle>,
        gate: Arc<RecoveryGate>,
    ) -> Self {
        Self {
            store,
            notifier,
            workflow,
            gate,
        }
    }

    /// The recovery gate.
    pub fn gate(&self) -> &Arc<RecoveryGate> {
        &self.gate
    }

    async fn load_agent(&self, agent_id: Uuid) -> CadenceResult<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("agent", agent_id))
    }

    async fn load_project(&self, project_id: Uuid) -> CadenceResult<Project> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("project", project_id))
    }

    /// Validate, persist and publish a status change. Fails with
    /// `InvalidTransition` when another writer changed the status since
    /// `agent` was read.
    async fn apply(&self, agent: Agent, next: AgentStatus) -> CadenceResult<Agent> {
        audit::commit(self.store.as_ref(), self.notifier.as_ref(), agent, next).await
    }

    /// Update non-status fields, re-reading the agent whenever a concurrent
    /// status change wins the compare-and-set.
    async fn update_fields<F>(&self, agent_id: Uuid, update: F) -> CadenceResult<Agent>
    where
        F: Fn(&mut Agent),
    {
        for _ in 0..FIELD_UPDATE_ATTEMPTS {
            let mut agent = self.load_agent(agent_id).await?;
            let expected = agent.status;
            update(&mut agent);
            agent.touch();
            if self.store.update_agent_if_status(&agent, expected).await? {
                return Ok(agent);
            }
            debug!(agent_id = %agent_id, "Agent status changed during field update, retrying");
        }
        Err(CadenceError::Orchestrator(format!(
            "agent {agent_id} kept changing status during update"
        )))
    }

    // --- Retry & recovery ---

    /// Re-arm a failed or interrupted agent. Agents in any other status are
    /// left alone and `None` is returned.
    pub async fn retry_agent(&self, agent_id: Uuid) -> CadenceResult<Option<Agent>> {
        let mut agent = self.load_agent(agent_id).await?;
        if !matches!(agent.status, AgentStatus::Failed | AgentStatus::Interrupted) {
            info!(agent_id = %agent_id, status = %agent.status, "Retry ignored, agent is not failed or interrupted");
            return Ok(None);
        }
        let previous = agent.status;
        agent.error_message = None;
        agent.progress = 0;
        agent.current_task = None;
        let agent = self.apply(agent, AgentStatus::Pending).await?;
        audit::system_log(
            self.store.as_ref(),
            Some(agent.project_id),
            LogLevel::Info,
            format!("Agent {} ({}) re-armed after {previous}", agent.id, agent.agent_type),
        )
        .await?;
        Ok(Some(agent))
    }

    /// Interrupted agents, optionally limited to one project.
    pub async fn get_interrupted_agents(&self, project_id: Option<Uuid>) -> CadenceResult<Vec<Agent>> {
        let agents = self
            .store
            .get_agents_by_status(&[AgentStatus::Interrupted])
            .await?;
        Ok(match project_id {
            Some(pid) => agents.into_iter().filter(|a| a.project_id == pid).collect(),
            None => agents,
        })
    }

    /// Mark everything left in flight by a previous process as interrupted,
    /// then open the recovery gate. Safe to call more than once; a second
    /// call finds nothing to do.
    pub async fn recover_interrupted_agents(&self) -> CadenceResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for mut project in self.store.get_projects_by_status(ProjectStatus::Running).await? {
            project.status = ProjectStatus::Interrupted;
            project.touch();
            self.store.update_project(&project).await?;
            report.projects.push(project.id);
            notify_or_log(
                self.notifier.as_ref(),
                DomainEvent::new(
                    EventKind::ProjectInterrupted,
                    serde_json::json!({ "project_id": project.id, "name": project.name }),
                )
                .scoped(project.id),
            );
        }

        let in_flight = self
            .store
            .get_agents_by_status(&[AgentStatus::Running, AgentStatus::WaitingProvider])
            .await?;
        for agent in in_flight {
            let was = agent.status;
            let agent = self.apply(agent, AgentStatus::Interrupted).await?;
            audit::system_log(
                self.store.as_ref(),
                Some(agent.project_id),
                LogLevel::Warn,
                format!(
                    "Agent {} ({}) interrupted by process restart while {was}",
                    agent.id, agent.agent_type
                ),
            )
            .await?;
            report.agents.push(agent.id);
        }

        self.gate.open();
        if report.is_empty() {
            info!("Startup recovery found nothing in flight");
        } else {
            warn!(
                projects = report.projects.len(),
                agents = report.agents.len(),
                "Recovered work interrupted by restart"
            );
        }
        Ok(report)
    }

    // --- Interventions ---

    /// Persist an intervention and act on it. Urgent interventions pause the
    /// project; agent-targeted ones activate that agent.
    pub async fn handle_intervention(&self, intervention: Intervention) -> CadenceResult<InterventionOutcome> {
        self.load_project(intervention.project_id).await?;
        self.store.insert_intervention(&intervention).await?;
        info!(
            intervention_id = %intervention.id,
            project_id = %intervention.project_id,
            "Intervention received"
        );
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::InterventionReceived,
                serde_json::json!({
                    "intervention_id": intervention.id,
                    "target": intervention.target,
                    "priority": intervention.priority,
                    "message": intervention.message,
                    "attached_files": intervention.attached_files,
                }),
            )
            .scoped(intervention.project_id),
        );

        let mut outcome = InterventionOutcome {
            intervention_id: intervention.id,
            ..Default::default()
        };
        if intervention.priority == InterventionPriority::Urgent {
            let project = self.load_project(intervention.project_id).await?;
            if project.status.can_transition_to(ProjectStatus::Paused) {
                self.pause_project(project.id).await?;
                outcome.project_paused = true;
            }
        }
        if let InterventionTarget::Agent { agent_id } = intervention.target {
            let paused = self
                .activate_agent_for_intervention(agent_id, intervention.id)
                .await?;
            if let Some(paused) = paused {
                outcome.activated = Some(agent_id);
                outcome.paused_agents = paused;
            }
        }
        Ok(outcome)
    }

    /// Start the targeted agent and park every running agent of a later
    /// phase until it completes. Pending checkpoints of the targeted agent
    /// are superseded. Returns the parked agent ids, or `None` when the
    /// agent was not in an activatable status.
    pub async fn activate_agent_for_intervention(
        &self,
        agent_id: Uuid,
        intervention_id: Uuid,
    ) -> CadenceResult<Option<Vec<Uuid>>> {
        let intervention = self
            .store
            .get_intervention(intervention_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("intervention", intervention_id))?;
        let mut agent = self.load_agent(agent_id).await?;
        if agent.project_id != intervention.project_id {
            return Err(CadenceError::Validation(format!(
                "agent {agent_id} does not belong to project {}",
                intervention.project_id
            )));
        }
        if !matches!(agent.status, AgentStatus::Pending | AgentStatus::WaitingApproval) {
            info!(agent_id = %agent_id, status = %agent.status, "Intervention target not activatable");
            return Ok(None);
        }

        agent.current_task = Some(format!("Applying intervention: {}", intervention.message));
        agent.started_at.get_or_insert_with(Utc::now);
        agent.paused_for = None;
        let agent = match self.apply(agent, AgentStatus::Running).await {
            Ok(agent) => agent,
            Err(CadenceError::InvalidTransition { from, .. }) => {
                info!(agent_id = %agent_id, status = %from, "Intervention target changed status, not activated");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        audit::agent_log(
            self.store.as_ref(),
            &agent,
            LogLevel::Info,
            format!("Activated by intervention {intervention_id}"),
        )
        .await?;
        self.supersede_checkpoints(&agent, intervention_id).await?;

        let workflow = self.workflow.current();
        let agents: HashMap<Uuid, Agent> = self
            .store
            .get_agents_by_project(agent.project_id)
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();
        let phase = phase_of_agent(&workflow, &agent, &agents);

        let mut paused = Vec::new();
        for other in agents.values() {
            if other.id == agent.id
                || other.status != AgentStatus::Running
                || phase_of_agent(&workflow, other, &agents) <= phase
            {
                continue;
            }
            let mut other = other.clone();
            other.current_task = Some(format!("Paused for intervention {intervention_id}"));
            other.paused_for = Some(agent.id);
            match self.apply(other, AgentStatus::WaitingApproval).await {
                Ok(other) => paused.push(other.id),
                // Finished or failed meanwhile; nothing left to pause.
                Err(CadenceError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if !paused.is_empty() {
            info!(count = paused.len(), phase, "Paused later-phase agents for intervention");
            notify_or_log(
                self.notifier.as_ref(),
                DomainEvent::new(
                    EventKind::AgentsPaused,
                    serde_json::json!({
                        "intervention_id": intervention_id,
                        "activated": agent.id,
                        "paused": paused,
                    }),
                )
                .scoped(agent.project_id),
            );
        }
        Ok(Some(paused))
    }

    /// Close the pending checkpoints of an agent that an intervention
    /// re-runs. Its next execution raises fresh ones if it needs review.
    async fn supersede_checkpoints(&self, agent: &Agent, intervention_id: Uuid) -> CadenceResult<usize> {
        let pending: Vec<_> = self
            .store
            .get_checkpoints_by_agent(agent.id)
            .await?
            .into_iter()
            .filter(|c| c.is_pending())
            .collect();
        for mut checkpoint in pending.iter().cloned() {
            checkpoint.status = CheckpointStatus::Superseded;
            checkpoint.resolved_at = Some(Utc::now());
            checkpoint.feedback = Some(format!("superseded by intervention {intervention_id}"));
            self.store.update_checkpoint(&checkpoint).await?;
            audit::agent_log(
                self.store.as_ref(),
                agent,
                LogLevel::Info,
                format!("Checkpoint '{}' superseded by intervention", checkpoint.title),
            )
            .await?;
            notify_or_log(
                self.notifier.as_ref(),
                DomainEvent::new(
                    EventKind::CheckpointSuperseded,
                    serde_json::json!({
                        "checkpoint_id": checkpoint.id,
                        "agent_id": agent.id,
                        "intervention_id": intervention_id,
                    }),
                )
                .scoped(agent.project_id),
            );
        }
        if !pending.is_empty() {
            info!(agent_id = %agent.id, count = pending.len(), "Superseded pending checkpoints");
        }
        Ok(pending.len())
    }

    // --- Project status ---

    async fn set_project_status(
        &self,
        project_id: Uuid,
        next: ProjectStatus,
        event: Option<EventKind>,
    ) -> CadenceResult<Project> {
        let mut project = self.load_project(project_id).await?;
        if project.status == next {
            return Ok(project);
        }
        if !project.status.can_transition_to(next) {
            return Err(CadenceError::invalid_transition("project", project.status, next));
        }
        let from = project.status;
        project.status = next;
        project.touch();
        self.store.update_project(&project).await?;
        info!(project_id = %project_id, %from, to = %next, "Project status changed");
        audit::system_log(
            self.store.as_ref(),
            Some(project_id),
            LogLevel::Info,
            format!("Project '{}' {from} -> {next}", project.name),
        )
        .await?;
        if let Some(kind) = event {
            notify_or_log(
                self.notifier.as_ref(),
                DomainEvent::new(kind, serde_json::json!({ "project_id": project_id }))
                    .scoped(project_id),
            );
        }
        Ok(project)
    }

    /// Move the project to `running`.
    pub async fn start_project(&self, project_id: Uuid) -> CadenceResult<Project> {
        self.set_project_status(project_id, ProjectStatus::Running, None).await
    }

    /// Pause a running project.
    pub async fn pause_project(&self, project_id: Uuid) -> CadenceResult<Project> {
        self.set_project_status(project_id, ProjectStatus::Paused, Some(EventKind::ProjectPaused))
            .await
    }

    /// Resume a paused or interrupted project.
    pub async fn resume_project(&self, project_id: Uuid) -> CadenceResult<Project> {
        let project = self.load_project(project_id).await?;
        if !matches!(project.status, ProjectStatus::Paused | ProjectStatus::Interrupted) {
            return Err(CadenceError::invalid_transition(
                "project",
                project.status,
                ProjectStatus::Running,
            ));
        }
        self.set_project_status(project_id, ProjectStatus::Running, Some(EventKind::ProjectResumed))
            .await
    }

    /// Complete or fail a running project once none of its agents can make
    /// further progress.
    pub async fn finish_project_if_done(&self, project_id: Uuid) -> CadenceResult<Option<Project>> {
        let project = self.load_project(project_id).await?;
        if project.status != ProjectStatus::Running {
            return Ok(None);
        }
        let agents = self.store.get_agents_by_project(project_id).await?;
        if agents.is_empty() {
            return Ok(None);
        }
        if agents.iter().all(|a| a.status == AgentStatus::Completed) {
            return self
                .set_project_status(project_id, ProjectStatus::Completed, None)
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// Mark a running project failed.
    pub async fn fail_project(&self, project_id: Uuid) -> CadenceResult<Project> {
        self.set_project_status(project_id, ProjectStatus::Failed, None).await
    }

    // --- Execution updates ---

    /// Park a running agent until `provider` is healthy.
    pub async fn mark_waiting_provider(&self, agent_id: Uuid, provider: &str) -> CadenceResult<Agent> {
        let mut agent = self.load_agent(agent_id).await?;
        expect_status(&agent, &[AgentStatus::Running], AgentStatus::WaitingProvider)?;
        agent.current_task = Some(format!("Waiting for provider '{provider}'"));
        self.apply(agent, AgentStatus::WaitingProvider).await
    }

    /// Back to `running` after a provider wait.
    pub async fn mark_running(&self, agent_id: Uuid) -> CadenceResult<Agent> {
        let agent = self.load_agent(agent_id).await?;
        if agent.status == AgentStatus::Running {
            return Ok(agent);
        }
        expect_status(&agent, &[AgentStatus::WaitingProvider], AgentStatus::Running)?;
        self.apply(agent, AgentStatus::Running).await
    }

    /// Park a running agent behind a checkpoint titled `task`.
    pub async fn mark_waiting_approval(&self, agent_id: Uuid, task: &str) -> CadenceResult<Agent> {
        let mut agent = self.load_agent(agent_id).await?;
        expect_status(&agent, &[AgentStatus::Running], AgentStatus::WaitingApproval)?;
        agent.current_task = Some(task.to_string());
        self.apply(agent, AgentStatus::WaitingApproval).await
    }

    /// Complete a running agent and re-arm whatever an intervention on it
    /// had parked.
    pub async fn mark_completed(&self, agent_id: Uuid) -> CadenceResult<Agent> {
        let mut agent = self.load_agent(agent_id).await?;
        expect_status(&agent, &[AgentStatus::Running], AgentStatus::Completed)?;
        agent.progress = 100;
        agent.current_task = None;
        agent.completed_at = Some(Utc::now());
        let agent = self.apply(agent, AgentStatus::Completed).await?;
        audit::agent_log(self.store.as_ref(), &agent, LogLevel::Info, "Completed").await?;
        audit::release_parked(self.store.as_ref(), self.notifier.as_ref(), &agent).await?;
        Ok(agent)
    }

    /// Fail an executing agent, keeping `message` verbatim as its error.
    pub async fn mark_failed(&self, agent_id: Uuid, message: &str) -> CadenceResult<Agent> {
        let mut agent = self.load_agent(agent_id).await?;
        expect_status(
            &agent,
            &[AgentStatus::Running, AgentStatus::WaitingProvider],
            AgentStatus::Failed,
        )?;
        agent.error_message = Some(message.to_string());
        agent.current_task = None;
        let agent = self.apply(agent, AgentStatus::Failed).await?;
        warn!(agent_id = %agent.id, agent = %agent.agent_type, error = message, "Agent failed");
        audit::agent_log(self.store.as_ref(), &agent, LogLevel::Error, message).await?;
        audit::system_log(
            self.store.as_ref(),
            Some(agent.project_id),
            LogLevel::Error,
            format!("Agent {} ({}) failed: {message}", agent.id, agent.agent_type),
        )
        .await?;
        Ok(agent)
    }

    /// Set progress and, if given, the task label. Status is left alone.
    pub async fn update_progress(
        &self,
        agent_id: Uuid,
        progress: u8,
        task: Option<String>,
    ) -> CadenceResult<Agent> {
        self.update_fields(agent_id, |agent| {
            agent.progress = progress.min(100);
            if task.is_some() {
                agent.current_task.clone_from(&task);
            }
        })
        .await
    }

    /// Add token usage to the agent's running totals.
    pub async fn record_tokens(&self, agent_id: Uuid, input: u64, output: u64) -> CadenceResult<Agent> {
        self.update_fields(agent_id, |agent| {
            agent.input_tokens = agent.input_tokens.saturating_add(input);
            agent.output_tokens = agent.output_tokens.saturating_add(output);
        })
        .await
    }

    /// Create a pending worker under `parent_id`.
    pub async fn spawn_worker(&self, parent_id: Uuid, agent_type: &str) -> CadenceResult<Agent> {
        let parent = self.load_agent(parent_id).await?;
        let worker = Agent::worker(&parent, agent_type);
        self.store.insert_agent(&worker).await?;
        audit::agent_log(
            self.store.as_ref(),
            &parent,
            LogLevel::Info,
            format!("Spawned worker {} ({agent_type})", worker.id),
        )
        .await?;
        Ok(worker)
    }
}

fn expect_status(agent: &Agent, allowed: &[AgentStatus], next: AgentStatus) -> CadenceResult<()> {
    if allowed.contains(&agent.status) {
        Ok(())
    } else {
        Err(CadenceError::invalid_transition("agent", agent.status, next))
    }
}
