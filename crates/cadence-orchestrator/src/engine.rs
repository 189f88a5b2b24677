use crate::auto_approval::compile_pattern;
use crate::budget::BudgetGuard;
use crate::checkpoint::CheckpointResolver;
use crate::concurrency::ConcurrencyController;
use crate::config::{EngineConfig, OrchestratorConfig};
use crate::dependencies::WorkflowHandle;
use crate::lifecycle::{AgentLifecycleManager, InterventionOutcome, RecoveryGate, RecoveryReport};
use crate::scheduler::WorkflowScheduler;
use crate::snapshot::SnapshotManager;
use async_trait::async_trait;
use cadence_core::{
    notify_or_log, Agent, AssetKind, CadenceError, CadenceResult, Checkpoint, CostUnit,
    DomainEvent, EventKind, Intervention, LogLevel, Notifier, Project, ProjectConfig,
    ProjectStatus, Resolution, Store,
};
use cadence_provider::{
    collect_stream, retry_with_backoff_cancellable, ChatMessage, ChatRequest, OnRetry, Provider,
    ProviderHealthMonitor, ProviderRegistry, ProviderWaitObserver, RetryCoordinator,
    TokenUsage,
};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit;

/// Upper bound on scheduling rounds in one [`PipelineEngine::drive`] call.
const MAX_DRIVE_ROUNDS: usize = 1_000;

/// Everything an executor needs to run one agent once.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Owning project.
    pub project: Project,
    /// The agent, as it was when it started.
    pub agent: Agent,
    /// Provider id resolved for the agent.
    pub provider_id: Option<String>,
    /// `None` when the project names no provider or the id is unregistered.
    pub provider: Option<Arc<dyn Provider>>,
    /// Model requested from the provider.
    pub model: String,
}

/// A review gate the agent asks for when it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    /// Checkpoint kind.
    pub kind: String,
    /// Checkpoint title shown to the reviewer.
    pub title: String,
}

/// An asset produced by an execution, recorded as pending review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDraft {
    /// Asset name.
    pub name: String,
    /// Media kind.
    pub kind: AssetKind,
}

/// What one execution produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// Tokens consumed.
    pub usage: TokenUsage,
    /// Billable non-token generations (images, audio clips).
    pub generations: u32,
    /// Assets to record.
    pub assets: Vec<AssetDraft>,
    /// `Some` parks the agent in `waiting_approval` behind a checkpoint.
    pub review: Option<ReviewRequest>,
}

/// The work an agent actually performs. Errors are classified by the retry
/// policy; recoverable ones are retried, the rest fail the agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run the agent once.
    async fn execute(&self, ctx: &ExecutionContext) -> CadenceResult<ExecutionOutput>;
}

/// Executor that streams one chat completion per agent from its provider.
pub struct ChatExecutor {
    max_tokens: u32,
    review: Option<Regex>,
    emit_assets: bool,
}

impl ChatExecutor {
    /// Executor with a 1024-token completion budget.
    pub fn new() -> Self {
        Self {
            max_tokens: 1024,
            review: None,
            emit_assets: false,
        }
    }

    /// Raise a checkpoint for agent types matching `pattern` (`*` wildcards).
    pub fn with_review(mut self, pattern: &str) -> CadenceResult<Self> {
        self.review = Some(compile_pattern(pattern)?);
        Ok(self)
    }

    /// Record each response as a text asset.
    pub fn with_assets(mut self, emit: bool) -> Self {
        self.emit_assets = emit;
        self
    }

    /// Cap the completion length.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl Default for ChatExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for ChatExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> CadenceResult<ExecutionOutput> {
        let agent_type = &ctx.agent.agent_type;
        let provider = ctx.provider.as_ref().ok_or_else(|| {
            CadenceError::ContextValidation(format!("no provider available for {agent_type}"))
        })?;

        let mut prompt = format!(
            "Produce the {agent_type} deliverable for project '{}'.",
            ctx.project.name
        );
        if let Some(feedback) = &ctx.agent.revision_feedback {
            prompt.push_str("\nRevision feedback: ");
            prompt.push_str(feedback);
        }
        let request = ChatRequest::new(ctx.model.clone())
            .with_message(ChatMessage::system(format!("You are the {agent_type} agent.")))
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(self.max_tokens);

        let rx = provider.chat_stream(&request).await?;
        let response = collect_stream(&ctx.model, rx).await?;

        let assets = if self.emit_assets {
            vec![AssetDraft {
                name: format!("{agent_type}.md"),
                kind: AssetKind::Text,
            }]
        } else {
            Vec::new()
        };
        let review = self
            .review
            .as_ref()
            .filter(|re| re.is_match(agent_type))
            .map(|_| ReviewRequest {
                kind: "deliverable".into(),
                title: format!("{agent_type} output"),
            });
        Ok(ExecutionOutput {
            usage: response.usage,
            generations: 0,
            assets,
            review,
        })
    }
}

/// Publishes provider waits of one agent as domain events.
struct EventWaitObserver {
    notifier: Arc<dyn Notifier>,
    project_id: Uuid,
    agent_id: Uuid,
}

impl ProviderWaitObserver for EventWaitObserver {
    fn on_waiting(&self, provider_id: &str) {
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::ProviderWaiting,
                serde_json::json!({ "provider": provider_id, "agent_id": self.agent_id }),
            )
            .scoped(self.project_id),
        );
    }

    fn on_recovered(&self, provider_id: &str, waited: Duration) {
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::ProviderRecovered,
                serde_json::json!({
                    "provider": provider_id,
                    "agent_id": self.agent_id,
                    "waited_ms": waited.as_millis() as u64,
                }),
            )
            .scoped(self.project_id),
        );
    }
}

/// Summary of one [`PipelineEngine::drive`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriveReport {
    /// Scheduler rounds run.
    pub rounds: usize,
    /// Agents started, in start order.
    pub started: Vec<Uuid>,
    /// Project status when driving stopped.
    pub final_status: Option<ProjectStatus>,
}

/// Drives projects through the workflow: ticks the scheduler, executes the
/// started agents in background tasks and records their outcomes.
///
/// Call [`startup`](Self::startup) once before anything else.
pub struct PipelineEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    workflow: Arc<WorkflowHandle>,
    lifecycle: Arc<AgentLifecycleManager>,
    checkpoints: Arc<CheckpointResolver>,
    scheduler: Arc<WorkflowScheduler>,
    concurrency: Arc<ConcurrencyController>,
    budget: Arc<BudgetGuard>,
    health: Arc<ProviderHealthMonitor>,
    retry: Arc<RetryCoordinator>,
    snapshots: Arc<SnapshotManager>,
    providers: Arc<ProviderRegistry>,
    executor: Arc<dyn AgentExecutor>,
    config: EngineConfig,
    cancel: CancellationToken,
    running: Mutex<JoinSet<()>>,
    /// Cancellation handle of each live execution, keyed by agent. Whoever
    /// removes an entry owns releasing that agent's concurrency slot.
    executions: Mutex<HashMap<Uuid, Execution>>,
    next_execution: AtomicU64,
}

struct Execution {
    seq: u64,
    cancel: CancellationToken,
}

impl PipelineEngine {
    /// Wire every component from `config`.
    pub fn new(
        config: &OrchestratorConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        providers: Arc<ProviderRegistry>,
        executor: Arc<dyn AgentExecutor>,
    ) -> CadenceResult<Arc<Self>> {
        config.validate()?;
        let workflow = Arc::new(WorkflowHandle::new(config.workflow_map()?));
        let gate = Arc::new(RecoveryGate::new());
        let health = Arc::new(ProviderHealthMonitor::new(config.health.clone(), notifier.clone()));
        let retry = Arc::new(
            RetryCoordinator::new(config.retry.clone())
                .with_health(health.clone())
                .with_poll_interval(config.engine.provider_poll_interval()),
        );
        let concurrency = Arc::new(ConcurrencyController::new(config.concurrency.clone()));
        let budget = Arc::new(BudgetGuard::new(
            store.clone(),
            notifier.clone(),
            config.budget.clone(),
            config.pricing_table(),
        ));
        let checkpoints = Arc::new(CheckpointResolver::new(
            store.clone(),
            notifier.clone(),
            workflow.clone(),
        ));
        let lifecycle = Arc::new(AgentLifecycleManager::new(
            store.clone(),
            notifier.clone(),
            workflow.clone(),
            gate.clone(),
        ));
        let mut scheduler = WorkflowScheduler::new(
            store.clone(),
            notifier.clone(),
            workflow.clone(),
            checkpoints.clone(),
            gate,
        )
        .with_concurrency(concurrency.clone())
        .with_budget(budget.clone());
        if let Some(provider) = &config.default_provider {
            scheduler = scheduler.with_default_provider(provider.clone());
        }
        let snapshots = Arc::new(SnapshotManager::new(store.clone(), notifier.clone()));

        Ok(Arc::new(Self {
            store,
            notifier,
            workflow,
            lifecycle,
            checkpoints,
            scheduler: Arc::new(scheduler),
            concurrency,
            budget,
            health,
            retry,
            snapshots,
            providers,
            executor,
            config: config.engine.clone(),
            cancel: CancellationToken::new(),
            running: Mutex::new(JoinSet::new()),
            executions: Mutex::new(HashMap::new()),
            next_execution: AtomicU64::new(0),
        }))
    }

    /// Persistence.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Workflow dependency map.
    pub fn workflow(&self) -> &Arc<WorkflowHandle> {
        &self.workflow
    }

    /// Lifecycle transitions.
    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }

    /// Checkpoint and asset gates.
    pub fn checkpoints(&self) -> &Arc<CheckpointResolver> {
        &self.checkpoints
    }

    /// Scheduler.
    pub fn scheduler(&self) -> &Arc<WorkflowScheduler> {
        &self.scheduler
    }

    /// Admission control.
    pub fn concurrency(&self) -> &Arc<ConcurrencyController> {
        &self.concurrency
    }

    /// Budget guard.
    pub fn budget(&self) -> &Arc<BudgetGuard> {
        &self.budget
    }

    /// Provider health monitor.
    pub fn health(&self) -> &Arc<ProviderHealthMonitor> {
        &self.health
    }

    /// Snapshot manager.
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Process-start sequence: forget stale concurrency slots, interrupt
    /// whatever a previous process left in flight, open the recovery gate.
    pub async fn startup(&self) -> CadenceResult<RecoveryReport> {
        self.concurrency.clear_all();
        self.lifecycle.recover_interrupted_agents().await
    }

    /// Spawn the periodic provider health loop. Stops on [`shutdown`](Self::shutdown).
    pub fn spawn_health_loop(&self) -> JoinHandle<()> {
        let health = self.health.clone();
        let providers = self.providers.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move { health.run(providers, cancel).await })
    }

    /// Insert a draft project with one pending leader per workflow agent type.
    pub async fn create_project(
        &self,
        name: &str,
        config: ProjectConfig,
    ) -> CadenceResult<(Project, Vec<Agent>)> {
        let project = Project::new(name).with_config(config);
        self.store.insert_project(&project).await?;
        let workflow = self.workflow.current();
        let mut agents = Vec::with_capacity(workflow.len());
        for agent_type in workflow.agent_types() {
            let agent = Agent::leader(project.id, agent_type);
            self.store.insert_agent(&agent).await?;
            agents.push(agent);
        }
        info!(project_id = %project.id, name, agents = agents.len(), "Project created");
        audit::system_log(
            self.store.as_ref(),
            Some(project.id),
            LogLevel::Info,
            format!("Project '{name}' created with {} agents", agents.len()),
        )
        .await?;
        Ok((project, agents))
    }

    /// Move a draft project to running and start its root agents.
    pub async fn start_project(self: &Arc<Self>, project_id: Uuid) -> CadenceResult<Vec<Agent>> {
        self.lifecycle.start_project(project_id).await?;
        self.tick(project_id).await
    }

    /// Resume a paused or interrupted project and tick it.
    pub async fn resume_project(self: &Arc<Self>, project_id: Uuid) -> CadenceResult<Vec<Agent>> {
        self.lifecycle.resume_project(project_id).await?;
        self.tick(project_id).await
    }

    /// Start every eligible agent and execute each in the background.
    pub async fn tick(self: &Arc<Self>, project_id: Uuid) -> CadenceResult<Vec<Agent>> {
        let started = self.scheduler.start_next_agents(project_id).await?;
        for agent in &started {
            self.spawn_execution(agent.clone());
        }
        Ok(started)
    }

    /// Tick and wait for executions until nothing more starts or finishes,
    /// then complete the project if every agent is done.
    pub async fn drive(self: &Arc<Self>, project_id: Uuid) -> CadenceResult<DriveReport> {
        let mut report = DriveReport::default();
        loop {
            let started = self.tick(project_id).await?;
            let finished = self.join_running().await;
            report.rounds += 1;
            report.started.extend(started.iter().map(|a| a.id));
            if started.is_empty() && finished == 0 {
                break;
            }
            if report.rounds >= MAX_DRIVE_ROUNDS {
                warn!(project_id = %project_id, rounds = report.rounds, "Drive stopped, round limit reached");
                break;
            }
        }
        self.lifecycle.finish_project_if_done(project_id).await?;
        report.final_status = self.store.get_project(project_id).await?.map(|p| p.status);
        Ok(report)
    }

    /// Resolve a checkpoint and start whatever it unblocked.
    pub async fn resolve_checkpoint(
        self: &Arc<Self>,
        checkpoint_id: Uuid,
        resolution: Resolution,
        feedback: Option<String>,
    ) -> CadenceResult<Checkpoint> {
        let checkpoint = self.checkpoints.resolve(checkpoint_id, resolution, feedback).await?;
        self.tick_if_running(checkpoint.project_id).await?;
        Ok(checkpoint)
    }

    /// Re-arm a failed or interrupted agent and tick its project.
    pub async fn retry_agent(self: &Arc<Self>, agent_id: Uuid) -> CadenceResult<Option<Agent>> {
        let agent = self.lifecycle.retry_agent(agent_id).await?;
        if let Some(agent) = &agent {
            self.tick_if_running(agent.project_id).await?;
        }
        Ok(agent)
    }

    /// Handle an intervention and execute the agent it activated, if any.
    ///
    /// Executions of the agents it parked are cancelled and their slots
    /// released; those agents are re-armed once the activated agent
    /// completes. The activated agent takes a concurrency slot when one is
    /// free but runs either way.
    pub async fn handle_intervention(
        self: &Arc<Self>,
        intervention: Intervention,
    ) -> CadenceResult<InterventionOutcome> {
        let outcome = self.lifecycle.handle_intervention(intervention).await?;
        for agent_id in &outcome.paused_agents {
            self.stop_execution(*agent_id).await?;
        }
        if let Some(agent_id) = outcome.activated {
            if let Some(agent) = self.store.get_agent(agent_id).await? {
                if let Some(project) = self.store.get_project(agent.project_id).await? {
                    if let Some(provider) = self.scheduler.resolve_provider(&project, &agent).await? {
                        if !self.concurrency.register(&agent.id.to_string(), &provider) {
                            warn!(agent_id = %agent.id, provider = %provider, "Intervention runs over the concurrency cap");
                        }
                    }
                }
                self.spawn_execution(agent);
            }
        }
        Ok(outcome)
    }

    /// Cancel the live execution of a parked agent and release its slot.
    async fn stop_execution(&self, agent_id: Uuid) -> CadenceResult<()> {
        let Some(execution) = self.executions.lock().remove(&agent_id) else {
            return Ok(());
        };
        execution.cancel.cancel();
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            return Ok(());
        };
        if let Some(project) = self.store.get_project(agent.project_id).await? {
            if let Some(provider) = self.scheduler.resolve_provider(&project, &agent).await? {
                self.concurrency.unregister(&agent_id.to_string(), &provider);
            }
        }
        info!(agent_id = %agent_id, "Execution cancelled, agent parked for intervention");
        Ok(())
    }

    /// Cancel every execution, then wait for their tasks to end. Agents
    /// cut short stay in flight for restart recovery.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let finished = self.join_running().await;
        info!(finished, "Engine shut down");
    }

    async fn tick_if_running(self: &Arc<Self>, project_id: Uuid) -> CadenceResult<()> {
        let running = self
            .store
            .get_project(project_id)
            .await?
            .is_some_and(|p| p.status == ProjectStatus::Running);
        if running {
            self.tick(project_id).await?;
        }
        Ok(())
    }

    fn spawn_execution(self: &Arc<Self>, agent: Agent) {
        let seq = self.next_execution.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        self.executions.lock().insert(
            agent.id,
            Execution {
                seq,
                cancel: cancel.clone(),
            },
        );
        let engine = Arc::clone(self);
        self.running
            .lock()
            .spawn(async move { engine.execute_agent(agent, seq, cancel).await });
    }

    /// Drop the execution entry if it is still the one numbered `seq`.
    /// Returns whether it was, i.e. whether the caller still owns the slot.
    fn finish_execution(&self, agent_id: Uuid, seq: u64) -> bool {
        let mut executions = self.executions.lock();
        if executions.get(&agent_id).is_some_and(|e| e.seq == seq) {
            executions.remove(&agent_id);
            true
        } else {
            false
        }
    }

    /// Wait for every spawned execution, including ones spawned meanwhile.
    /// Returns how many finished.
    async fn join_running(&self) -> usize {
        let mut finished = 0;
        loop {
            let mut batch = std::mem::take(&mut *self.running.lock());
            if batch.is_empty() {
                return finished;
            }
            while let Some(result) = batch.join_next().await {
                finished += 1;
                if let Err(e) = result {
                    error!(error = %e, "Agent execution task panicked");
                }
            }
        }
    }

    async fn execute_agent(&self, agent: Agent, seq: u64, cancel: CancellationToken) {
        let project = match self.store.get_project(agent.project_id).await {
            Ok(Some(project)) => Some(project),
            Ok(None) => {
                error!(agent_id = %agent.id, "Project of running agent is gone");
                None
            }
            Err(e) => {
                error!(agent_id = %agent.id, error = %e, "Cannot load project for agent");
                None
            }
        };
        let Some(project) = project else {
            self.finish_execution(agent.id, seq);
            return;
        };
        let provider_id = match self.scheduler.resolve_provider(&project, &agent).await {
            Ok(provider) => provider,
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Cannot resolve provider of worker parent");
                self.scheduler.provider_for(&project, &agent.agent_type)
            }
        };
        let result = self
            .run_agent(&project, &agent, provider_id.as_deref(), &cancel)
            .await;
        if self.finish_execution(agent.id, seq) {
            if let Some(provider) = &provider_id {
                self.concurrency.unregister(&agent.id.to_string(), provider);
            }
        }

        match result {
            Ok(()) => {}
            Err(CadenceError::Cancelled(reason)) => {
                if self.cancel.is_cancelled() {
                    info!(agent_id = %agent.id, reason = %reason, "Execution cancelled, left for restart recovery");
                } else {
                    info!(agent_id = %agent.id, reason = %reason, "Execution stopped for intervention");
                }
            }
            Err(CadenceError::InvalidTransition { from, to, .. }) => {
                info!(agent_id = %agent.id, %from, %to, "Agent left running state during execution, result discarded");
            }
            Err(e) => match self.lifecycle.mark_failed(agent.id, &e.to_string()).await {
                Ok(_) => {}
                Err(CadenceError::InvalidTransition { from, .. }) => {
                    info!(agent_id = %agent.id, status = %from, error = %e, "Failure not recorded, agent no longer executing");
                }
                Err(mark) => {
                    error!(agent_id = %agent.id, error = %mark, "Cannot record agent failure");
                }
            },
        }
    }

    async fn run_agent(
        &self,
        project: &Project,
        agent: &Agent,
        provider_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> CadenceResult<()> {
        if let Some(pid) = provider_id {
            if !self.health.is_available(pid) {
                self.lifecycle.mark_waiting_provider(agent.id, pid).await?;
                let observer = EventWaitObserver {
                    notifier: self.notifier.clone(),
                    project_id: project.id,
                    agent_id: agent.id,
                };
                self.retry.wait_for_provider(pid, cancel, &observer).await?;
                self.lifecycle.mark_running(agent.id).await?;
            }
        }

        let provider = match provider_id {
            Some(pid) => match self.providers.get(pid) {
                Ok(provider) => Some(provider),
                Err(e) => {
                    warn!(provider = pid, error = %e, "Provider not registered");
                    None
                }
            },
            None => None,
        };
        let ctx = ExecutionContext {
            project: project.clone(),
            agent: agent.clone(),
            provider_id: provider_id.map(str::to_string),
            provider,
            model: self.config.model.clone(),
        };

        let operation = format!("{}:{}", agent.agent_type, agent.id);
        let hook: OnRetry<'_> = &|attempt| {
            warn!(
                agent_id = %agent.id,
                attempt = attempt.attempt,
                delay_ms = attempt.delay.as_millis() as u64,
                error = %attempt.error,
                "Agent execution will be retried"
            );
        };
        let output = retry_with_backoff_cancellable(
            &operation,
            self.retry.config(),
            || async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(CadenceError::Cancelled(format!(
                        "'{operation}' cancelled while executing"
                    ))),
                    result = self.executor.execute(&ctx) => result,
                }
            },
            Some(hook),
            cancel,
        )
        .await?;
        if cancel.is_cancelled() {
            return Err(CadenceError::Cancelled(format!("'{operation}' cancelled before recording")));
        }

        let updated = self
            .lifecycle
            .record_tokens(agent.id, output.usage.input_tokens, output.usage.output_tokens)
            .await?;
        let billed_provider = provider_id.unwrap_or("unassigned");
        if output.usage.total() > 0 {
            self.budget
                .record_usage(
                    Some(project.id),
                    Some(agent.id),
                    billed_provider,
                    &self.config.model,
                    CostUnit::Tokens {
                        input: output.usage.input_tokens,
                        output: output.usage.output_tokens,
                    },
                )
                .await?;
        }
        if output.generations > 0 {
            self.budget
                .record_usage(
                    Some(project.id),
                    Some(agent.id),
                    billed_provider,
                    &self.config.model,
                    CostUnit::Generations {
                        count: output.generations,
                    },
                )
                .await?;
        }
        if let Some(limit) = self.config.max_tokens_per_agent {
            if updated.total_tokens() > limit {
                return Err(CadenceError::TokenBudgetExceeded {
                    used: updated.total_tokens(),
                    limit,
                });
            }
        }

        for draft in &output.assets {
            self.checkpoints
                .submit_asset(agent.id, &draft.name, draft.kind)
                .await?;
        }
        match &output.review {
            Some(review) => {
                self.checkpoints
                    .submit_checkpoint(agent.id, &review.kind, &review.title)
                    .await?;
            }
            None => {
                self.lifecycle.mark_completed(agent.id).await?;
            }
        }
        Ok(())
    }
}
