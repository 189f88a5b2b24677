use crate::audit;
use crate::auto_approval::RuleMatcher;
use crate::dependencies::{phase_of_agent, WorkflowHandle};
use cadence_core::{
    notify_or_log, Agent, AgentStatus, ApprovalStatus, Asset, AssetKind, AutoApprovalRule,
    CadenceError, CadenceResult, Checkpoint, CheckpointStatus, DomainEvent, EventKind, LogLevel,
    Notifier, Resolution, Store,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Outstanding human gates of one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingGates {
    /// Unresolved checkpoints.
    pub checkpoints: usize,
    /// Assets awaiting review.
    pub assets: usize,
}

impl PendingGates {
    /// Whether nothing blocks the agent.
    pub fn is_clear(&self) -> bool {
        self.checkpoints == 0 && self.assets == 0
    }
}

/// Items resolved by an auto-approval pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoApprovalOutcome {
    /// Checkpoints resolved.
    pub checkpoints: Vec<Uuid>,
    /// Assets reviewed.
    pub assets: Vec<Uuid>,
}

impl AutoApprovalOutcome {
    /// Whether the pass resolved nothing.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty() && self.assets.is_empty()
    }
}

fn approval_str(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
    }
}

/// Human-approval gates: checkpoint submission and resolution, asset review,
/// and project auto-approval rules.
pub struct CheckpointResolver {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    workflow: Arc<WorkflowHandle>,
}

impl CheckpointResolver {
    /// Resolver over `store`, using `workflow` to find dependents.
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, workflow: Arc<WorkflowHandle>) -> Self {
        Self {
            store,
            notifier,
            workflow,
        }
    }

    async fn load_agent(&self, agent_id: Uuid) -> CadenceResult<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("agent", agent_id))
    }

    /// Count the unresolved gates of one agent.
    pub async fn pending_gates(&self, agent_id: Uuid) -> CadenceResult<PendingGates> {
        let checkpoints = self
            .store
            .get_checkpoints_by_agent(agent_id)
            .await?
            .iter()
            .filter(|c| c.is_pending())
            .count();
        let assets = self.store.get_pending_assets_by_agent(agent_id).await?.len();
        Ok(PendingGates {
            checkpoints,
            assets,
        })
    }

    /// Unresolved checkpoints of a project.
    pub async fn pending_checkpoints(&self, project_id: Uuid) -> CadenceResult<Vec<Checkpoint>> {
        Ok(self
            .store
            .get_checkpoints_by_project(project_id)
            .await?
            .into_iter()
            .filter(Checkpoint::is_pending)
            .collect())
    }

    /// Raise a review gate for a running agent, moving it to
    /// `waiting_approval`. Project auto-approval rules are applied at once.
    pub async fn submit_checkpoint(
        &self,
        agent_id: Uuid,
        kind: &str,
        title: &str,
    ) -> CadenceResult<Checkpoint> {
        let mut agent = self.load_agent(agent_id).await?;
        match agent.status {
            AgentStatus::Running => {
                agent.current_task = Some(format!("Awaiting review: {title}"));
                agent = audit::commit(
                    self.store.as_ref(),
                    self.notifier.as_ref(),
                    agent,
                    AgentStatus::WaitingApproval,
                )
                .await?;
            }
            AgentStatus::WaitingApproval if agent.paused_for.is_none() => {}
            other => {
                return Err(CadenceError::invalid_transition(
                    "agent",
                    other,
                    AgentStatus::WaitingApproval,
                ))
            }
        }

        let checkpoint = Checkpoint::new(agent.project_id, agent.id, kind, title);
        self.store.insert_checkpoint(&checkpoint).await?;
        info!(checkpoint_id = %checkpoint.id, agent = %agent.agent_type, kind, "Checkpoint created");
        audit::agent_log(
            self.store.as_ref(),
            &agent,
            LogLevel::Info,
            format!("Checkpoint '{title}' ({kind}) awaiting review"),
        )
        .await?;
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::CheckpointCreated,
                serde_json::json!({
                    "checkpoint_id": checkpoint.id,
                    "agent_id": agent.id,
                    "kind": kind,
                    "title": title,
                }),
            )
            .scoped(agent.project_id),
        );

        if let Some((resolution, pattern)) = self.matching_checkpoint_rule(&agent, &checkpoint).await? {
            return self.auto_resolve(checkpoint.id, resolution, &pattern).await;
        }
        Ok(checkpoint)
    }

    /// Record a generated asset in `pending` review state. Project
    /// auto-approval rules are applied at once.
    pub async fn submit_asset(&self, agent_id: Uuid, name: &str, kind: AssetKind) -> CadenceResult<Asset> {
        let agent = self.load_agent(agent_id).await?;
        let asset = Asset::new(agent.project_id, agent.id, name, kind);
        self.store.insert_asset(&asset).await?;
        debug!(asset_id = %asset.id, name, "Asset submitted");

        let matched = match self.store.get_project(agent.project_id).await? {
            Some(project) => {
                let matcher = RuleMatcher::compile(&project.config.auto_approval_rules)?;
                matcher
                    .for_asset(&agent.agent_type, &asset)
                    .map(|(rule, status)| (status, rule.agent_type.clone()))
            }
            None => None,
        };
        match matched {
            Some((status, pattern)) => self.review_as(asset, status, Some(&pattern)).await,
            None => Ok(asset),
        }
    }

    /// Resolve from the wire spelling of a resolution.
    pub async fn resolve_str(
        &self,
        checkpoint_id: Uuid,
        resolution: &str,
        feedback: Option<String>,
    ) -> CadenceResult<Checkpoint> {
        self.resolve(checkpoint_id, resolution.parse()?, feedback).await
    }

    /// Resolve a pending checkpoint.
    ///
    /// - `approved`: the originating agent completes once none of its
    ///   checkpoints remain pending, and the project phase advances when the
    ///   phase has nothing left under review.
    /// - `rejected`: the agent is left where it is.
    /// - `revision_requested`: only the originating agent is re-armed to
    ///   `pending`, carrying the feedback into its next run.
    pub async fn resolve(
        &self,
        checkpoint_id: Uuid,
        resolution: Resolution,
        feedback: Option<String>,
    ) -> CadenceResult<Checkpoint> {
        let mut checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("checkpoint", checkpoint_id))?;
        if !checkpoint.is_pending() {
            return Err(CadenceError::invalid_transition("checkpoint", checkpoint.status, resolution));
        }
        let agent = self.load_agent(checkpoint.agent_id).await?;
        if resolution == Resolution::RevisionRequested
            && !agent.status.can_transition_to(AgentStatus::Pending)
        {
            return Err(CadenceError::invalid_transition(
                "agent",
                agent.status,
                AgentStatus::Pending,
            ));
        }

        checkpoint.status = CheckpointStatus::Resolved;
        checkpoint.resolution = Some(resolution);
        checkpoint.feedback = feedback.clone();
        checkpoint.resolved_at = Some(Utc::now());
        self.store.update_checkpoint(&checkpoint).await?;

        info!(checkpoint_id = %checkpoint.id, %resolution, agent = %agent.agent_type, "Checkpoint resolved");
        audit::agent_log(
            self.store.as_ref(),
            &agent,
            LogLevel::Info,
            format!("Checkpoint '{}' {resolution}", checkpoint.title),
        )
        .await?;
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::CheckpointResolved,
                serde_json::json!({
                    "checkpoint_id": checkpoint.id,
                    "agent_id": agent.id,
                    "resolution": resolution,
                    "feedback": feedback,
                }),
            )
            .scoped(checkpoint.project_id),
        );

        match resolution {
            Resolution::Approved => {
                self.complete_if_clear(agent.clone()).await?;
                self.advance_phase_if_clear(&agent).await?;
            }
            Resolution::Rejected => {}
            Resolution::RevisionRequested => self.rearm(agent, feedback).await?,
        }
        Ok(checkpoint)
    }

    /// Approve or reject a pending asset.
    pub async fn review_asset(&self, asset_id: Uuid, approved: bool) -> CadenceResult<Asset> {
        let asset = self
            .store
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("asset", asset_id))?;
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.review_as(asset, status, None).await
    }

    async fn review_as(
        &self,
        mut asset: Asset,
        status: ApprovalStatus,
        rule: Option<&str>,
    ) -> CadenceResult<Asset> {
        if asset.approval_status != ApprovalStatus::Pending {
            return Err(CadenceError::invalid_transition(
                "asset",
                approval_str(asset.approval_status),
                approval_str(status),
            ));
        }
        asset.approval_status = status;
        self.store.update_asset(&asset).await?;
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::AssetReviewed,
                serde_json::json!({
                    "asset_id": asset.id,
                    "agent_id": asset.agent_id,
                    "status": approval_str(status),
                    "rule": rule,
                }),
            )
            .scoped(asset.project_id),
        );
        if let Some(pattern) = rule {
            self.publish_auto_approved("asset", asset.id, asset.project_id, pattern, approval_str(status));
        }
        Ok(asset)
    }

    /// Replace a project's auto-approval rules and immediately apply them to
    /// everything still pending.
    pub async fn update_auto_approval_rules(
        &self,
        project_id: Uuid,
        rules: Vec<AutoApprovalRule>,
    ) -> CadenceResult<AutoApprovalOutcome> {
        RuleMatcher::compile(&rules)?;
        let mut project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("project", project_id))?;
        let count = rules.len();
        project.config.auto_approval_rules = rules;
        project.touch();
        self.store.update_project(&project).await?;
        audit::system_log(
            self.store.as_ref(),
            Some(project_id),
            LogLevel::Info,
            format!("Auto-approval rules updated ({count} rules)"),
        )
        .await?;
        self.apply_auto_approval(project_id).await
    }

    /// Resolve every pending checkpoint and asset of the project that a rule
    /// matches.
    pub async fn apply_auto_approval(&self, project_id: Uuid) -> CadenceResult<AutoApprovalOutcome> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("project", project_id))?;
        let matcher = RuleMatcher::compile(&project.config.auto_approval_rules)?;
        let mut outcome = AutoApprovalOutcome::default();
        if matcher.is_empty() {
            return Ok(outcome);
        }

        let agents: HashMap<Uuid, Agent> = self
            .store
            .get_agents_by_project(project_id)
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();

        for checkpoint in self.pending_checkpoints(project_id).await? {
            let Some(agent) = agents.get(&checkpoint.agent_id) else {
                continue;
            };
            let matched = matcher
                .for_checkpoint(&agent.agent_type, &checkpoint)
                .map(|rule| (rule.resolution, rule.agent_type.clone()));
            if let Some((resolution, pattern)) = matched {
                self.auto_resolve(checkpoint.id, resolution, &pattern).await?;
                outcome.checkpoints.push(checkpoint.id);
            }
        }

        for asset in self.store.get_assets_by_project(project_id).await? {
            if asset.approval_status != ApprovalStatus::Pending {
                continue;
            }
            let Some(agent) = agents.get(&asset.agent_id) else {
                continue;
            };
            let matched = matcher
                .for_asset(&agent.agent_type, &asset)
                .map(|(rule, status)| (status, rule.agent_type.clone()));
            if let Some((status, pattern)) = matched {
                let id = asset.id;
                self.review_as(asset, status, Some(&pattern)).await?;
                outcome.assets.push(id);
            }
        }

        if !outcome.is_empty() {
            info!(
                project_id = %project_id,
                checkpoints = outcome.checkpoints.len(),
                assets = outcome.assets.len(),
                "Auto-approval applied"
            );
        }
        Ok(outcome)
    }

    async fn matching_checkpoint_rule(
        &self,
        agent: &Agent,
        checkpoint: &Checkpoint,
    ) -> CadenceResult<Option<(Resolution, String)>> {
        let Some(project) = self.store.get_project(agent.project_id).await? else {
            return Ok(None);
        };
        let matcher = RuleMatcher::compile(&project.config.auto_approval_rules)?;
        Ok(matcher
            .for_checkpoint(&agent.agent_type, checkpoint)
            .map(|rule| (rule.resolution, rule.agent_type.clone())))
    }

    async fn auto_resolve(
        &self,
        checkpoint_id: Uuid,
        resolution: Resolution,
        pattern: &str,
    ) -> CadenceResult<Checkpoint> {
        let checkpoint = self
            .resolve(
                checkpoint_id,
                resolution,
                Some(format!("auto-resolved by rule '{pattern}'")),
            )
            .await?;
        self.publish_auto_approved(
            "checkpoint",
            checkpoint.id,
            checkpoint.project_id,
            pattern,
            resolution.as_str(),
        );
        Ok(checkpoint)
    }

    fn publish_auto_approved(&self, target: &str, id: Uuid, project_id: Uuid, pattern: &str, outcome: &str) {
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::AutoApproved,
                serde_json::json!({
                    "target": target,
                    "id": id,
                    "rule": pattern,
                    "outcome": outcome,
                }),
            )
            .scoped(project_id),
        );
    }

    async fn complete_if_clear(&self, mut agent: Agent) -> CadenceResult<()> {
        if agent.status != AgentStatus::WaitingApproval || agent.paused_for.is_some() {
            return Ok(());
        }
        if self.pending_gates(agent.id).await?.checkpoints > 0 {
            return Ok(());
        }
        agent.progress = 100;
        agent.current_task = None;
        agent.completed_at = Some(Utc::now());
        let agent = audit::commit(
            self.store.as_ref(),
            self.notifier.as_ref(),
            agent,
            AgentStatus::Completed,
        )
        .await?;
        audit::agent_log(self.store.as_ref(), &agent, LogLevel::Info, "Approved and completed").await?;
        audit::release_parked(self.store.as_ref(), self.notifier.as_ref(), &agent).await?;
        Ok(())
    }

    async fn rearm(&self, mut agent: Agent, feedback: Option<String>) -> CadenceResult<()> {
        agent.revision_feedback = feedback;
        agent.progress = 0;
        agent.current_task = None;
        agent.error_message = None;
        agent.completed_at = None;
        agent.paused_for = None;
        let agent = audit::commit(
            self.store.as_ref(),
            self.notifier.as_ref(),
            agent,
            AgentStatus::Pending,
        )
        .await?;
        info!(agent_id = %agent.id, agent = %agent.agent_type, "Agent re-armed for revision");
        audit::agent_log(
            self.store.as_ref(),
            &agent,
            LogLevel::Info,
            "Revision requested, agent re-armed",
        )
        .await?;
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::AgentRearmed,
                serde_json::json!({
                    "agent_id": agent.id,
                    "agent_type": agent.agent_type,
                    "feedback": agent.revision_feedback,
                }),
            )
            .scoped(agent.project_id),
        );
        Ok(())
    }

    /// Advance `current_phase` when the approved agent belongs to it and no
    /// checkpoint of that phase is still pending. Never moves past the last
    /// phase of the workflow.
    async fn advance_phase_if_clear(&self, agent: &Agent) -> CadenceResult<()> {
        let Some(mut project) = self.store.get_project(agent.project_id).await? else {
            return Ok(());
        };
        let workflow = self.workflow.current();
        let agents: HashMap<Uuid, Agent> = self
            .store
            .get_agents_by_project(project.id)
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();
        let phase = phase_of_agent(&workflow, agent, &agents);
        let last_phase = workflow.phases().len().saturating_sub(1) as u32;
        if phase != project.current_phase || phase >= last_phase {
            return Ok(());
        }
        let still_pending = self.pending_checkpoints(project.id).await?.iter().any(|c| {
            agents
                .get(&c.agent_id)
                .is_some_and(|a| phase_of_agent(&workflow, a, &agents) == phase)
        });
        if still_pending {
            return Ok(());
        }

        project.current_phase = phase + 1;
        project.touch();
        self.store.update_project(&project).await?;
        info!(project_id = %project.id, phase = project.current_phase, "Project phase advanced");
        audit::system_log(
            self.store.as_ref(),
            Some(project.id),
            LogLevel::Info,
            format!("Phase {phase} approved, advancing to phase {}", project.current_phase),
        )
        .await?;
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::PhaseAdvanced,
                serde_json::json!({ "from": phase, "to": project.current_phase }),
            )
            .scoped(project.id),
        );
        Ok(())
    }
}
