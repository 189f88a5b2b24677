//! End-to-end orchestration tests.
//!
//! Drives projects through the pipeline engine against the in-memory store
//! with a scripted executor: dependency gating, budget and concurrency
//! admission, checkpoint review, restart recovery, retries and interventions.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cadence_core::*;
use cadence_orchestrator::*;
use cadence_provider::{ConnectionTest, ProviderRegistry, RetryConfig, TokenUsage};
use cadence_store::MemoryStore;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedExecutor {
    /// Agent types that finish behind a review checkpoint.
    review: Vec<String>,
    /// Agent types that ask for review on their first execution only.
    review_once: Vec<String>,
    /// Agent types whose first execution hangs until cancelled.
    slow_once: Vec<String>,
    /// Errors returned by the next executions of an agent type, in order.
    failures: Mutex<HashMap<String, VecDeque<CadenceError>>>,
    /// (agent type, revision feedback) of every execution.
    calls: Mutex<Vec<(String, Option<String>)>>,
    tokens: u64,
}

impl ScriptedExecutor {
    fn reviewing(types: &[&str]) -> Self {
        Self {
            review: types.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn with_review_once(mut self, types: &[&str]) -> Self {
        self.review_once = types.iter().map(|t| t.to_string()).collect();
        self
    }

    fn with_slow_once(mut self, types: &[&str]) -> Self {
        self.slow_once = types.iter().map(|t| t.to_string()).collect();
        self
    }

    fn failing(agent_type: &str, errors: Vec<CadenceError>) -> Self {
        let exec = Self::default();
        exec.failures
            .lock()
            .unwrap()
            .insert(agent_type.to_string(), errors.into());
        exec
    }

    fn calls_for(&self, agent_type: &str) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == agent_type)
            .map(|(_, feedback)| feedback.clone())
            .collect()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> CadenceResult<ExecutionOutput> {
        let agent_type = ctx.agent.agent_type.clone();
        let first = {
            let mut calls = self.calls.lock().unwrap();
            let first = !calls.iter().any(|(t, _)| *t == agent_type);
            calls.push((agent_type.clone(), ctx.agent.revision_feedback.clone()));
            first
        };
        if first && self.slow_once.contains(&agent_type) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&agent_type)
            .and_then(VecDeque::pop_front);
        if let Some(err) = failure {
            return Err(err);
        }
        let wants_review = self.review.contains(&agent_type)
            || (first && self.review_once.contains(&agent_type));
        let review = wants_review.then(|| ReviewRequest {
            kind: "deliverable".into(),
            title: format!("{agent_type} output"),
        });
        Ok(ExecutionOutput {
            usage: TokenUsage {
                input_tokens: self.tokens,
                output_tokens: self.tokens,
            },
            review,
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn config(workflow: &[(&str, &[&str])]) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.workflow = workflow
        .iter()
        .map(|(ty, pre)| (ty.to_string(), pre.iter().map(|p| p.to_string()).collect()))
        .collect();
    config.retry = RetryConfig::immediate(3);
    config.engine.provider_poll_interval_ms = 5;
    config
}

fn two_step() -> OrchestratorConfig {
    config(&[("concept_leader", &[]), ("design_leader", &["concept_leader"])])
}

struct Harness {
    engine: Arc<PipelineEngine>,
    store: Arc<MemoryStore>,
    events: broadcast::Receiver<DomainEvent>,
}

impl Harness {
    async fn new(config: OrchestratorConfig, executor: Arc<ScriptedExecutor>) -> Self {
        let harness = Self::unstarted(config, executor, Arc::new(MemoryStore::new()));
        harness.engine.startup().await.unwrap();
        harness
    }

    fn unstarted(
        config: OrchestratorConfig,
        executor: Arc<ScriptedExecutor>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let notifier = Arc::new(BroadcastNotifier::new(1024));
        let events = notifier.subscribe();
        let engine = PipelineEngine::new(
            &config,
            store.clone(),
            notifier,
            Arc::new(ProviderRegistry::new()),
            executor,
        )
        .unwrap();
        Self {
            engine,
            store,
            events,
        }
    }

    async fn project(&self, config: ProjectConfig) -> Project {
        let (project, _) = self.engine.create_project("Fox in the snow", config).await.unwrap();
        self.engine.lifecycle().start_project(project.id).await.unwrap();
        project
    }

    async fn agent(&self, project_id: Uuid, agent_type: &str) -> Agent {
        self.store
            .get_agents_by_project(project_id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.agent_type == agent_type)
            .unwrap()
    }

    async fn set_status(&self, agent: &Agent, status: AgentStatus) {
        let updated = agent.clone().with_status(status);
        self.store.update_agent(&updated).await.unwrap();
    }

    async fn wait_for_status(&self, agent_id: Uuid, status: AgentStatus) -> Agent {
        for _ in 0..400 {
            let agent = self.store.get_agent(agent_id).await.unwrap().unwrap();
            if agent.status == status {
                return agent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agent {agent_id} never reached {status}");
    }

    fn drain_events(&mut self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }
}

fn on_provider(provider: &str) -> ProjectConfig {
    ProjectConfig {
        default_provider: Some(provider.into()),
        ..Default::default()
    }
}

fn types(agents: &[Agent]) -> Vec<&str> {
    let mut types: Vec<&str> = agents.iter().map(|a| a.agent_type.as_str()).collect();
    types.sort_unstable();
    types
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dependency_gates_design_behind_concept() {
    let mut h = Harness::new(two_step(), Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(ProjectConfig::default()).await;
    let scheduler = h.engine.scheduler().clone();

    let started = scheduler.start_next_agents(project.id).await.unwrap();
    assert_eq!(types(&started), ["concept_leader"]);
    assert_eq!(started[0].status, AgentStatus::Running);
    assert_eq!(started[0].progress, 0);
    assert_eq!(started[0].current_task.as_deref(), Some("Starting concept_leader"));
    assert!(started[0].started_at.is_some());
    assert!(h.drain_events().contains(&EventKind::AgentStarted));

    // A second tick starts nothing new.
    assert!(scheduler.start_next_agents(project.id).await.unwrap().is_empty());

    let concept = started[0].id;
    let checkpoint = h
        .engine
        .checkpoints()
        .submit_checkpoint(concept, "concept", "Moodboard")
        .await
        .unwrap();
    let blocked = scheduler.explain_blocked(project.id).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].agent_type, "design_leader");
    assert!(matches!(
        blocked[0].reasons[0],
        BlockReason::DependencyNotCompleted {
            status: AgentStatus::WaitingApproval,
            ..
        }
    ));

    h.engine
        .checkpoints()
        .resolve(checkpoint.id, Resolution::Approved, None)
        .await
        .unwrap();
    assert_eq!(h.agent(project.id, "concept_leader").await.status, AgentStatus::Completed);

    let started = scheduler.start_next_agents(project.id).await.unwrap();
    assert_eq!(types(&started), ["design_leader"]);

    let logs = h.store.get_system_logs(Some(project.id)).await.unwrap();
    assert!(logs.iter().any(|l| l.message.starts_with("Started concept_leader")));
    assert!(logs.iter().any(|l| l.message.starts_with("Started design_leader")));
}

#[tokio::test]
async fn test_pending_asset_blocks_dependents() {
    let h = Harness::new(two_step(), Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(ProjectConfig::default()).await;
    let scheduler = h.engine.scheduler().clone();

    let concept = scheduler.start_next_agents(project.id).await.unwrap().remove(0);
    let asset = h
        .engine
        .checkpoints()
        .submit_asset(concept.id, "palette.png", AssetKind::Image)
        .await
        .unwrap();
    h.engine.lifecycle().mark_completed(concept.id).await.unwrap();

    let blocked = scheduler.explain_blocked(project.id).await.unwrap();
    assert_eq!(
        blocked[0].reasons,
        vec![BlockReason::PendingAssets {
            agent_type: "concept_leader".into(),
            count: 1
        }]
    );
    assert!(scheduler.start_next_agents(project.id).await.unwrap().is_empty());

    h.engine.checkpoints().review_asset(asset.id, true).await.unwrap();
    let err = h.engine.checkpoints().review_asset(asset.id, false).await.unwrap_err();
    assert!(matches!(err, CadenceError::InvalidTransition { entity: "asset", .. }));
    assert_eq!(scheduler.start_next_agents(project.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_scheduler_refuses_before_recovery() {
    let h = Harness::unstarted(
        two_step(),
        Arc::new(ScriptedExecutor::default()),
        Arc::new(MemoryStore::new()),
    );
    let (project, _) = h
        .engine
        .create_project("early", ProjectConfig::default())
        .await
        .unwrap();
    let err = h
        .engine
        .scheduler()
        .start_next_agents(project.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::Orchestrator(_)));
}

#[tokio::test]
async fn test_project_not_running_starts_nothing() {
    let h = Harness::new(two_step(), Arc::new(ScriptedExecutor::default())).await;
    let (project, _) = h
        .engine
        .create_project("draft", ProjectConfig::default())
        .await
        .unwrap();
    let scheduler = h.engine.scheduler();
    assert!(scheduler.start_next_agents(project.id).await.unwrap().is_empty());
    let blocked = scheduler.explain_blocked(project.id).await.unwrap();
    assert!(blocked.iter().all(|b| b.reasons[0]
        == BlockReason::ProjectNotRunning {
            status: ProjectStatus::Draft
        }));
}

#[tokio::test]
async fn test_worker_waits_for_leader_then_runs() {
    let executor = Arc::new(ScriptedExecutor::default());
    let h = Harness::new(two_step(), executor.clone()).await;
    let mut project_config = ProjectConfig::default();
    project_config
        .ai_services
        .insert("concept_leader".into(), "openai".into());
    let project = h.project(project_config).await;
    let scheduler = h.engine.scheduler().clone();

    let leader = h.agent(project.id, "concept_leader").await;
    let worker = h
        .engine
        .lifecycle()
        .spawn_worker(leader.id, "concept_worker")
        .await
        .unwrap();
    assert_eq!(worker.parent_agent_id, Some(leader.id));
    assert_eq!(
        scheduler.provider_for_agent(&project, &worker, Some(&leader)).as_deref(),
        Some("openai")
    );

    let blocked = scheduler.explain_blocked(project.id).await.unwrap();
    let reasons = &blocked.iter().find(|b| b.agent_id == worker.id).unwrap().reasons;
    assert_eq!(
        reasons,
        &vec![BlockReason::ParentNotReady {
            agent_type: "concept_leader".into(),
            status: AgentStatus::Pending,
        }]
    );

    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
    assert!(report.started.contains(&worker.id));
    let done = h.store.get_agent(worker.id).await.unwrap().unwrap();
    assert_eq!(done.status, AgentStatus::Completed);
    assert_eq!(done.progress, 100);

    let order: Vec<String> = executor
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|(t, _)| t.clone())
        .collect();
    let leader_at = order.iter().position(|t| t == "concept_leader").unwrap();
    let worker_at = order.iter().position(|t| t == "concept_worker").unwrap();
    assert!(leader_at < worker_at);
    assert_eq!(h.engine.concurrency().active_count("openai"), 0);
}

#[tokio::test]
async fn test_worker_of_deleted_leader_is_reported() {
    let h = Harness::new(two_step(), Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(ProjectConfig::default()).await;
    let ghost = Agent::leader(project.id, "concept_leader");
    let orphan = Agent::worker(&ghost, "concept_worker");
    h.store.insert_agent(&orphan).await.unwrap();

    let blocked = h.engine.scheduler().explain_blocked(project.id).await.unwrap();
    let reasons = &blocked.iter().find(|b| b.agent_id == orphan.id).unwrap().reasons;
    assert_eq!(reasons, &vec![BlockReason::MissingParent { parent_id: ghost.id }]);
    let started = h.engine.scheduler().start_next_agents(project.id).await.unwrap();
    assert!(started.iter().all(|a| a.id != orphan.id));
}

// ---------------------------------------------------------------------------
// Store failures during admission
// ---------------------------------------------------------------------------

/// Memory store whose log writes or status swaps can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_logs: AtomicBool,
    fail_status_swap: AtomicBool,
}

impl FlakyStore {
    fn check(flag: &AtomicBool, what: &str) -> CadenceResult<()> {
        if flag.load(AtomicOrdering::SeqCst) {
            Err(CadenceError::Store(format!("{what} failed: disk full")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_project(&self, project: &Project) -> CadenceResult<()> {
        self.inner.insert_project(project).await
    }
    async fn get_project(&self, id: Uuid) -> CadenceResult<Option<Project>> {
        self.inner.get_project(id).await
    }
    async fn update_project(&self, project: &Project) -> CadenceResult<()> {
        self.inner.update_project(project).await
    }
    async fn get_projects_by_status(&self, status: ProjectStatus) -> CadenceResult<Vec<Project>> {
        self.inner.get_projects_by_status(status).await
    }
    async fn insert_agent(&self, agent: &Agent) -> CadenceResult<()> {
        self.inner.insert_agent(agent).await
    }
    async fn get_agent(&self, id: Uuid) -> CadenceResult<Option<Agent>> {
        self.inner.get_agent(id).await
    }
    async fn get_agents_by_project(&self, project_id: Uuid) -> CadenceResult<Vec<Agent>> {
        self.inner.get_agents_by_project(project_id).await
    }
    async fn get_agents_by_status(&self, statuses: &[AgentStatus]) -> CadenceResult<Vec<Agent>> {
        self.inner.get_agents_by_status(statuses).await
    }
    async fn update_agent(&self, agent: &Agent) -> CadenceResult<()> {
        self.inner.update_agent(agent).await
    }
    async fn update_agent_if_status(&self, agent: &Agent, expected: AgentStatus) -> CadenceResult<bool> {
        Self::check(&self.fail_status_swap, "status swap")?;
        self.inner.update_agent_if_status(agent, expected).await
    }
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> CadenceResult<()> {
        self.inner.insert_checkpoint(checkpoint).await
    }
    async fn get_checkpoint(&self, id: Uuid) -> CadenceResult<Option<Checkpoint>> {
        self.inner.get_checkpoint(id).await
    }
    async fn get_checkpoints_by_agent(&self, agent_id: Uuid) -> CadenceResult<Vec<Checkpoint>> {
        self.inner.get_checkpoints_by_agent(agent_id).await
    }
    async fn get_checkpoints_by_project(&self, project_id: Uuid) -> CadenceResult<Vec<Checkpoint>> {
        self.inner.get_checkpoints_by_project(project_id).await
    }
    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> CadenceResult<()> {
        self.inner.update_checkpoint(checkpoint).await
    }
    async fn insert_asset(&self, asset: &Asset) -> CadenceResult<()> {
        self.inner.insert_asset(asset).await
    }
    async fn get_asset(&self, id: Uuid) -> CadenceResult<Option<Asset>> {
        self.inner.get_asset(id).await
    }
    async fn get_assets_by_project(&self, project_id: Uuid) -> CadenceResult<Vec<Asset>> {
        self.inner.get_assets_by_project(project_id).await
    }
    async fn get_pending_assets_by_agent(&self, agent_id: Uuid) -> CadenceResult<Vec<Asset>> {
        self.inner.get_pending_assets_by_agent(agent_id).await
    }
    async fn update_asset(&self, asset: &Asset) -> CadenceResult<()> {
        self.inner.update_asset(asset).await
    }
    async fn insert_intervention(&self, intervention: &Intervention) -> CadenceResult<()> {
        self.inner.insert_intervention(intervention).await
    }
    async fn get_intervention(&self, id: Uuid) -> CadenceResult<Option<Intervention>> {
        self.inner.get_intervention(id).await
    }
    async fn add_cost_entry(&self, entry: &CostEntry) -> CadenceResult<()> {
        self.inner.add_cost_entry(entry).await
    }
    async fn get_cost_entries_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CadenceResult<Vec<CostEntry>> {
        self.inner.get_cost_entries_between(from, to).await
    }
    async fn insert_snapshot(&self, snapshot: &WorkflowSnapshot) -> CadenceResult<()> {
        self.inner.insert_snapshot(snapshot).await
    }
    async fn get_snapshot(&self, id: Uuid) -> CadenceResult<Option<WorkflowSnapshot>> {
        self.inner.get_snapshot(id).await
    }
    async fn get_snapshots_by_agent(&self, agent_id: Uuid) -> CadenceResult<Vec<WorkflowSnapshot>> {
        self.inner.get_snapshots_by_agent(agent_id).await
    }
    async fn update_snapshot(&self, snapshot: &WorkflowSnapshot) -> CadenceResult<()> {
        self.inner.update_snapshot(snapshot).await
    }
    async fn add_system_log(&self, log: &SystemLog) -> CadenceResult<()> {
        Self::check(&self.fail_logs, "system log")?;
        self.inner.add_system_log(log).await
    }
    async fn add_agent_log(&self, log: &AgentLog) -> CadenceResult<()> {
        Self::check(&self.fail_logs, "agent log")?;
        self.inner.add_agent_log(log).await
    }
    async fn get_system_logs(&self, project_id: Option<Uuid>) -> CadenceResult<Vec<SystemLog>> {
        self.inner.get_system_logs(project_id).await
    }
    async fn get_agent_logs(&self, agent_id: Uuid) -> CadenceResult<Vec<AgentLog>> {
        self.inner.get_agent_logs(agent_id).await
    }
}

async fn flaky_engine(store: Arc<FlakyStore>) -> (Arc<PipelineEngine>, Project) {
    let mut cfg = config(&[("writer", &[]), ("painter", &[])]);
    cfg.concurrency.providers.insert("openai".into(), 2);
    let engine = PipelineEngine::new(
        &cfg,
        store,
        Arc::new(NullNotifier),
        Arc::new(ProviderRegistry::new()),
        Arc::new(ScriptedExecutor::default()),
    )
    .unwrap();
    engine.startup().await.unwrap();
    let (project, _) = engine.create_project("flaky", on_provider("openai")).await.unwrap();
    engine.lifecycle().start_project(project.id).await.unwrap();
    (engine, project)
}

#[tokio::test]
async fn test_failed_start_log_does_not_lose_started_agents() {
    let store = Arc::new(FlakyStore::default());
    let (engine, project) = flaky_engine(store.clone()).await;
    store.fail_logs.store(true, AtomicOrdering::SeqCst);

    let started = engine.scheduler().start_next_agents(project.id).await.unwrap();
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|a| a.status == AgentStatus::Running));
    // One slot per running agent, none leaked.
    assert_eq!(engine.concurrency().active_count("openai"), 2);

    for agent in &started {
        assert!(engine
            .concurrency()
            .unregister(&agent.id.to_string(), "openai"));
    }
    assert_eq!(engine.concurrency().active_count("openai"), 0);
}

#[tokio::test]
async fn test_failed_status_swap_releases_slot() {
    let store = Arc::new(FlakyStore::default());
    let (engine, project) = flaky_engine(store.clone()).await;
    store.fail_status_swap.store(true, AtomicOrdering::SeqCst);

    let err = engine
        .scheduler()
        .start_next_agents(project.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::Store(_)));
    assert_eq!(engine.concurrency().active_count("openai"), 0);
    let agents = store.get_agents_by_project(project.id).await.unwrap();
    assert!(agents.iter().all(|a| a.status == AgentStatus::Pending));

    store.fail_status_swap.store(false, AtomicOrdering::SeqCst);
    let report = engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
    assert_eq!(engine.concurrency().active_count("openai"), 0);
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

fn spend(usd: f64) -> CostEntry {
    CostEntry {
        id: Uuid::new_v4(),
        project_id: None,
        agent_id: None,
        provider: "openai".into(),
        model: "gpt-4o".into(),
        unit: CostUnit::Tokens {
            input: 1_000,
            output: 1_000,
        },
        cost_usd: usd,
        recorded_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_exhausted_budget_stops_scheduling() {
    let mut cfg = two_step();
    cfg.budget = BudgetConfig {
        monthly_limit_usd: 100.0,
        alert_threshold_percent: 80.0,
        stop_on_exceeded: true,
    };
    let mut h = Harness::new(cfg, Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(ProjectConfig::default()).await;

    let check = h.engine.budget().record_cost(spend(100.0)).await.unwrap();
    assert!(!check.allowed);
    assert_eq!(check.warning, Some(BudgetWarning::BudgetExceeded));
    h.engine.budget().record_cost(spend(1.0)).await.unwrap();
    let budget_events = h
        .drain_events()
        .into_iter()
        .filter(|k| *k == EventKind::BudgetExceeded)
        .count();
    assert_eq!(budget_events, 1);

    let scheduler = h.engine.scheduler();
    assert!(scheduler.start_next_agents(project.id).await.unwrap().is_empty());
    let blocked = scheduler.explain_blocked(project.id).await.unwrap();
    assert!(blocked[0].reasons.contains(&BlockReason::BudgetStopped));

    // Warn-only mode lets work continue.
    h.engine
        .budget()
        .set_config(BudgetConfig {
            stop_on_exceeded: false,
            ..h.engine.budget().config()
        })
        .unwrap();
    let check = h.engine.budget().check_budget().await.unwrap();
    assert!(check.allowed);
    assert_eq!(check.warning, Some(BudgetWarning::BudgetWarning));
    assert_eq!(scheduler.start_next_agents(project.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_projection_extrapolates_month() {
    let h = Harness::new(two_step(), Arc::new(ScriptedExecutor::default())).await;
    h.engine.budget().record_cost(spend(10.0)).await.unwrap();
    let now = Utc::now();
    let projection = h.engine.budget().projection_at(now).await.unwrap();
    assert!((projection.spent_usd - 10.0).abs() < 1e-9);
    let expected = 10.0 / f64::from(projection.days_elapsed) * f64::from(projection.days_in_month);
    assert!((projection.projected_total_usd - expected).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrency_cap_defers_third_agent() {
    let mut cfg = config(&[("writer", &[]), ("painter", &[]), ("composer", &[])]);
    cfg.concurrency.providers.insert("openai".into(), 2);
    let h = Harness::new(cfg, Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(on_provider("openai")).await;
    let scheduler = h.engine.scheduler();

    let started = scheduler.start_next_agents(project.id).await.unwrap();
    assert_eq!(started.len(), 2);
    assert_eq!(h.engine.concurrency().active_count("openai"), 2);

    let blocked = scheduler.explain_blocked(project.id).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(
        blocked[0].reasons,
        vec![BlockReason::NoCapacity {
            provider: "openai".into()
        }]
    );

    let first = &started[0];
    assert!(h
        .engine
        .concurrency()
        .unregister(&first.id.to_string(), "openai"));
    h.engine.lifecycle().mark_completed(first.id).await.unwrap();
    assert_eq!(scheduler.start_next_agents(project.id).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Review flow through the engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_revision_rearms_only_the_originating_agent() {
    let executor = Arc::new(ScriptedExecutor::reviewing(&["concept_leader", "design_leader"]));
    let h = Harness::new(two_step(), executor.clone()).await;
    let project = h.project(ProjectConfig::default()).await;
    let checkpoints = h.engine.checkpoints().clone();

    h.engine.drive(project.id).await.unwrap();
    assert_eq!(
        h.agent(project.id, "concept_leader").await.status,
        AgentStatus::WaitingApproval
    );
    assert_eq!(h.agent(project.id, "design_leader").await.status, AgentStatus::Pending);

    let pending = checkpoints.pending_checkpoints(project.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    h.engine
        .resolve_checkpoint(pending[0].id, Resolution::Approved, None)
        .await
        .unwrap();
    h.engine.drive(project.id).await.unwrap();
    assert_eq!(
        h.store.get_project(project.id).await.unwrap().unwrap().current_phase,
        1
    );

    let design_review = checkpoints.pending_checkpoints(project.id).await.unwrap().remove(0);
    checkpoints
        .resolve_str(design_review.id, "revision_requested", Some("warmer palette".into()))
        .await
        .unwrap();
    let design = h.agent(project.id, "design_leader").await;
    assert_eq!(design.status, AgentStatus::Pending);
    assert_eq!(design.revision_feedback.as_deref(), Some("warmer palette"));
    assert_eq!(h.agent(project.id, "concept_leader").await.status, AgentStatus::Completed);

    // Resolving twice is rejected.
    let err = checkpoints
        .resolve(design_review.id, Resolution::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::InvalidTransition { entity: "checkpoint", .. }));

    h.engine.drive(project.id).await.unwrap();
    assert_eq!(
        executor.calls_for("design_leader"),
        vec![None, Some("warmer palette".to_string())]
    );
    assert_eq!(executor.calls_for("concept_leader").len(), 1);

    let second_review = checkpoints.pending_checkpoints(project.id).await.unwrap().remove(0);
    h.engine
        .resolve_checkpoint(second_review.id, Resolution::Approved, None)
        .await
        .unwrap();
    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
}

#[tokio::test]
async fn test_invalid_resolution_string_rejected() {
    let h = Harness::new(two_step(), Arc::new(ScriptedExecutor::reviewing(&["concept_leader"]))).await;
    let project = h.project(ProjectConfig::default()).await;
    h.engine.drive(project.id).await.unwrap();
    let checkpoint = h
        .engine
        .checkpoints()
        .pending_checkpoints(project.id)
        .await
        .unwrap()
        .remove(0);
    let err = h
        .engine
        .checkpoints()
        .resolve_str(checkpoint.id, "approve", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::Validation(_)));
    assert!(h.store.get_checkpoint(checkpoint.id).await.unwrap().unwrap().is_pending());
}

#[tokio::test]
async fn test_auto_approval_rules_resolve_pending_work() {
    let h = Harness::new(two_step(), Arc::new(ScriptedExecutor::reviewing(&["concept_leader"]))).await;
    let project = h.project(ProjectConfig::default()).await;
    h.engine.drive(project.id).await.unwrap();
    let concept = h.agent(project.id, "concept_leader").await;
    assert_eq!(concept.status, AgentStatus::WaitingApproval);

    let outcome = h
        .engine
        .checkpoints()
        .update_auto_approval_rules(project.id, vec![AutoApprovalRule::approve_all("concept_*")])
        .await
        .unwrap();
    assert_eq!(outcome.checkpoints.len(), 1);
    assert_eq!(h.agent(project.id, "concept_leader").await.status, AgentStatus::Completed);

    // New assets from matching agents are approved on submission.
    let asset = h
        .engine
        .checkpoints()
        .submit_asset(concept.id, "sketch.png", AssetKind::Image)
        .await
        .unwrap();
    assert_eq!(asset.approval_status, ApprovalStatus::Approved);

    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_restart_recovery_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let project = Project::new("crashed").with_status(ProjectStatus::Running);
    store.insert_project(&project).await.unwrap();
    let running = Agent::leader(project.id, "concept_leader").with_status(AgentStatus::Running);
    let waiting = Agent::leader(project.id, "design_leader").with_status(AgentStatus::WaitingProvider);
    let done = Agent::leader(project.id, "script_leader").with_status(AgentStatus::Completed);
    for agent in [&running, &waiting, &done] {
        store.insert_agent(agent).await.unwrap();
    }

    let h = Harness::unstarted(
        OrchestratorConfig::default(),
        Arc::new(ScriptedExecutor::default()),
        store.clone(),
    );
    h.engine.concurrency().register("stale-job", "openai");
    let report = h.engine.startup().await.unwrap();
    assert_eq!(report.projects, vec![project.id]);
    assert_eq!(report.agents.len(), 2);
    assert_eq!(h.engine.concurrency().active_count("openai"), 0);

    let stored = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ProjectStatus::Interrupted);
    let interrupted = h
        .engine
        .lifecycle()
        .get_interrupted_agents(Some(project.id))
        .await
        .unwrap();
    assert_eq!(interrupted.len(), 2);
    let logs = store.get_system_logs(Some(project.id)).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.message.contains("interrupted by process restart while waiting_provider")));

    let again = h.engine.lifecycle().recover_interrupted_agents().await.unwrap();
    assert!(again.is_empty());

    let lifecycle = h.engine.lifecycle();
    let rearmed = lifecycle.retry_agent(running.id).await.unwrap().unwrap();
    assert_eq!(rearmed.status, AgentStatus::Pending);
    assert!(lifecycle.retry_agent(done.id).await.unwrap().is_none());

    let resumed = lifecycle.resume_project(project.id).await.unwrap();
    assert_eq!(resumed.status, ProjectStatus::Running);
}

// ---------------------------------------------------------------------------
// Retry & failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let executor = Arc::new(ScriptedExecutor::failing(
        "concept_leader",
        vec![
            CadenceError::ProviderUnavailable {
                provider: "openai".into(),
                message: "503".into(),
            },
            CadenceError::RateLimited {
                provider: "openai".into(),
                retry_after: Some(Duration::ZERO),
            },
        ],
    ));
    let h = Harness::new(two_step(), executor.clone()).await;
    let project = h.project(ProjectConfig::default()).await;

    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(executor.calls_for("concept_leader").len(), 3);
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
}

#[tokio::test]
async fn test_fatal_error_fails_agent_verbatim() {
    let executor = Arc::new(ScriptedExecutor::failing(
        "concept_leader",
        vec![CadenceError::ContextValidation("prompt is empty".into())],
    ));
    let h = Harness::new(two_step(), executor.clone()).await;
    let project = h.project(ProjectConfig::default()).await;

    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(executor.calls_for("concept_leader").len(), 1);
    assert_eq!(report.final_status, Some(ProjectStatus::Running));
    let concept = h.agent(project.id, "concept_leader").await;
    assert_eq!(concept.status, AgentStatus::Failed);
    assert_eq!(
        concept.error_message.as_deref(),
        Some("Context validation failed: prompt is empty")
    );
    assert_eq!(h.agent(project.id, "design_leader").await.status, AgentStatus::Pending);

    // A manual retry runs it again and the pipeline finishes.
    h.engine.retry_agent(concept.id).await.unwrap();
    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
}

#[tokio::test]
async fn test_exhausted_retries_fail_agent() {
    let outage = || CadenceError::Connection("reset by peer".into());
    let executor = Arc::new(ScriptedExecutor::failing(
        "concept_leader",
        vec![outage(), outage(), outage(), outage()],
    ));
    let h = Harness::new(two_step(), executor.clone()).await;
    let project = h.project(ProjectConfig::default()).await;

    h.engine.drive(project.id).await.unwrap();
    assert_eq!(executor.calls_for("concept_leader").len(), 4);
    let concept = h.agent(project.id, "concept_leader").await;
    assert_eq!(concept.status, AgentStatus::Failed);
    assert!(concept
        .error_message
        .unwrap()
        .starts_with("Max retries exceeded for 'concept_leader:"));
}

#[tokio::test]
async fn test_token_cap_fails_agent_and_costs_are_recorded() {
    let mut cfg = two_step();
    cfg.engine.max_tokens_per_agent = Some(10);
    cfg.pricing = vec![ModelPricing {
        provider: "openai".into(),
        model: "*".into(),
        input_per_million: 10_000.0,
        output_per_million: 10_000.0,
        per_generation: 0.0,
    }];
    let executor = Arc::new(ScriptedExecutor {
        tokens: 50,
        ..Default::default()
    });
    let h = Harness::new(cfg, executor).await;
    let project = h.project(on_provider("openai")).await;

    h.engine.drive(project.id).await.unwrap();
    let concept = h.agent(project.id, "concept_leader").await;
    assert_eq!(concept.status, AgentStatus::Failed);
    assert_eq!(concept.total_tokens(), 100);
    assert_eq!(
        concept.error_message.as_deref(),
        Some("Token budget exceeded: used 100 of 10 tokens")
    );
    let spent = h.engine.budget().monthly_spend_at(Utc::now()).await.unwrap();
    assert!((spent - 1.0).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Provider wait
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_agent_waits_for_unavailable_provider() {
    let mut h = Harness::new(two_step(), Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(on_provider("elevenlabs")).await;
    h.engine
        .health()
        .update_health_state("elevenlabs", &ConnectionTest::failed("connection refused"));

    let started = h.engine.tick(project.id).await.unwrap();
    assert_eq!(started.len(), 1);
    let concept_id = started[0].id;

    let mut waited = false;
    for _ in 0..200 {
        let agent = h.store.get_agent(concept_id).await.unwrap().unwrap();
        if agent.status == AgentStatus::WaitingProvider {
            waited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(waited, "agent never entered waiting_provider");

    h.engine
        .health()
        .update_health_state("elevenlabs", &ConnectionTest::ok(12));
    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));

    let kinds = h.drain_events();
    assert!(kinds.contains(&EventKind::ProviderWaiting));
    assert!(kinds.contains(&EventKind::ProviderRecovered));
    assert!(kinds.contains(&EventKind::ProviderHealthChanged));
}

// ---------------------------------------------------------------------------
// Interventions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_intervention_activates_target_and_parks_later_phases() {
    let h = Harness::new(OrchestratorConfig::default(), Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(ProjectConfig::default()).await;

    let design = h.agent(project.id, "design_leader").await; // phase 1
    let script = h.agent(project.id, "script_leader").await; // phase 1
    let voice = h.agent(project.id, "voice_leader").await; // phase 2
    let storyboard = h.agent(project.id, "storyboard_leader").await; // phase 2
    for agent in [&script, &voice, &storyboard] {
        h.set_status(agent, AgentStatus::Running).await;
    }

    let intervention = Intervention::new(
        project.id,
        InterventionTarget::Agent {
            agent_id: design.id,
        },
        InterventionPriority::Urgent,
        "Use the brand colours",
    );
    let outcome = h
        .engine
        .lifecycle()
        .handle_intervention(intervention.clone())
        .await
        .unwrap();

    assert!(outcome.project_paused);
    assert_eq!(outcome.activated, Some(design.id));
    let mut paused = outcome.paused_agents.clone();
    paused.sort();
    let mut expected = vec![voice.id, storyboard.id];
    expected.sort();
    assert_eq!(paused, expected);

    assert_eq!(h.agent(project.id, "design_leader").await.status, AgentStatus::Running);
    assert_eq!(h.agent(project.id, "script_leader").await.status, AgentStatus::Running);
    let parked = h.agent(project.id, "voice_leader").await;
    assert_eq!(parked.status, AgentStatus::WaitingApproval);
    assert_eq!(parked.paused_for, Some(design.id));
    assert!(parked.current_task.unwrap().starts_with("Paused for intervention"));
    assert_eq!(
        h.store.get_project(project.id).await.unwrap().unwrap().status,
        ProjectStatus::Paused
    );
    assert!(h.store.get_intervention(intervention.id).await.unwrap().is_some());

    // The same agent is no longer activatable.
    let again = h
        .engine
        .lifecycle()
        .activate_agent_for_intervention(design.id, intervention.id)
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_parked_agent_rejects_stale_outcomes() {
    let h = Harness::new(OrchestratorConfig::default(), Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(ProjectConfig::default()).await;
    let design = h.agent(project.id, "design_leader").await;
    let voice = h.agent(project.id, "voice_leader").await;
    h.set_status(&voice, AgentStatus::Running).await;

    let intervention = Intervention::new(
        project.id,
        InterventionTarget::Agent {
            agent_id: design.id,
        },
        InterventionPriority::Normal,
        "Rework the palette",
    );
    let outcome = h
        .engine
        .lifecycle()
        .handle_intervention(intervention)
        .await
        .unwrap();
    assert!(!outcome.project_paused);
    assert_eq!(outcome.paused_agents, vec![voice.id]);

    // An execution that finishes after being parked cannot move the agent.
    let lifecycle = h.engine.lifecycle();
    let err = lifecycle.mark_completed(voice.id).await.unwrap_err();
    assert!(matches!(err, CadenceError::InvalidTransition { entity: "agent", .. }));
    let err = lifecycle.mark_failed(voice.id, "late failure").await.unwrap_err();
    assert!(matches!(err, CadenceError::InvalidTransition { .. }));
    let err = h
        .engine
        .checkpoints()
        .submit_checkpoint(voice.id, "deliverable", "late review")
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::InvalidTransition { .. }));

    let updated = lifecycle.record_tokens(voice.id, 5, 7).await.unwrap();
    assert_eq!(updated.status, AgentStatus::WaitingApproval);
    assert_eq!(updated.total_tokens(), 12);
    let stored = h.store.get_agent(voice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AgentStatus::WaitingApproval);
    assert_eq!(stored.paused_for, Some(design.id));
    assert!(stored.completed_at.is_none());

    // Completing the activated agent re-arms the parked one.
    lifecycle.mark_completed(design.id).await.unwrap();
    let rearmed = h.store.get_agent(voice.id).await.unwrap().unwrap();
    assert_eq!(rearmed.status, AgentStatus::Pending);
    assert_eq!(rearmed.paused_for, None);
}

#[tokio::test]
async fn test_intervention_cancels_inflight_execution() {
    let mut cfg = config(&[
        ("concept_leader", &[]),
        ("research_leader", &[]),
        ("design_leader", &["concept_leader"]),
    ]);
    cfg.concurrency.providers.insert("openai".into(), 2);
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with_review_once(&["research_leader"])
            .with_slow_once(&["design_leader"]),
    );
    let mut h = Harness::new(cfg, executor.clone()).await;
    let project = h.project(on_provider("openai")).await;
    let concept = h.agent(project.id, "concept_leader").await;
    let research = h.agent(project.id, "research_leader").await;
    let design = h.agent(project.id, "design_leader").await;

    assert_eq!(h.engine.tick(project.id).await.unwrap().len(), 2);
    h.wait_for_status(concept.id, AgentStatus::Completed).await;
    h.wait_for_status(research.id, AgentStatus::WaitingApproval).await;
    let review = h
        .engine
        .checkpoints()
        .pending_checkpoints(project.id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(review.agent_id, research.id);
    // Slots are released just after the status change.
    while h.engine.concurrency().active_count("openai") > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = h.engine.tick(project.id).await.unwrap();
    assert_eq!(types(&started), ["design_leader"]);
    h.wait_for_status(design.id, AgentStatus::Running).await;
    while executor.calls_for("design_leader").is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.engine.concurrency().active_count("openai"), 1);

    let outcome = h
        .engine
        .handle_intervention(Intervention::new(
            project.id,
            InterventionTarget::Agent {
                agent_id: research.id,
            },
            InterventionPriority::Normal,
            "Cite primary sources",
        ))
        .await
        .unwrap();
    assert_eq!(outcome.activated, Some(research.id));
    assert_eq!(outcome.paused_agents, vec![design.id]);
    // Design gave its slot back; at most the re-run holds one.
    assert!(h.engine.concurrency().active_count("openai") <= 1);

    let superseded = h.store.get_checkpoint(review.id).await.unwrap().unwrap();
    assert_eq!(superseded.status, CheckpointStatus::Superseded);
    assert!(superseded.resolution.is_none());

    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
    assert_eq!(executor.calls_for("research_leader").len(), 2);
    assert_eq!(executor.calls_for("design_leader").len(), 2);
    assert_eq!(h.engine.concurrency().active_count("openai"), 0);

    let design_logs = h.store.get_agent_logs(design.id).await.unwrap();
    let completions = design_logs.iter().filter(|l| l.message == "Completed").count();
    assert_eq!(completions, 1);
    assert!(h
        .engine
        .checkpoints()
        .pending_checkpoints(project.id)
        .await
        .unwrap()
        .is_empty());

    let kinds = h.drain_events();
    assert!(kinds.contains(&EventKind::AgentsPaused));
    assert!(kinds.contains(&EventKind::CheckpointSuperseded));
    assert!(kinds.contains(&EventKind::AgentRearmed));
}

#[tokio::test]
async fn test_intervention_supersedes_pending_checkpoint() {
    let executor = Arc::new(ScriptedExecutor::default().with_review_once(&["concept_leader"]));
    let h = Harness::new(two_step(), executor.clone()).await;
    let project = h.project(ProjectConfig::default()).await;

    h.engine.drive(project.id).await.unwrap();
    let concept = h.agent(project.id, "concept_leader").await;
    assert_eq!(concept.status, AgentStatus::WaitingApproval);
    let checkpoint = h
        .engine
        .checkpoints()
        .pending_checkpoints(project.id)
        .await
        .unwrap()
        .remove(0);

    let outcome = h
        .engine
        .handle_intervention(Intervention::new(
            project.id,
            InterventionTarget::Agent {
                agent_id: concept.id,
            },
            InterventionPriority::Normal,
            "Darker mood",
        ))
        .await
        .unwrap();
    assert_eq!(outcome.activated, Some(concept.id));
    assert!(outcome.paused_agents.is_empty());

    let closed = h.store.get_checkpoint(checkpoint.id).await.unwrap().unwrap();
    assert_eq!(closed.status, CheckpointStatus::Superseded);
    assert!(closed.resolved_at.is_some());
    // A superseded checkpoint can no longer be resolved.
    let err = h
        .engine
        .checkpoints()
        .resolve(checkpoint.id, Resolution::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::InvalidTransition { entity: "checkpoint", .. }));

    let report = h.engine.drive(project.id).await.unwrap();
    assert_eq!(report.final_status, Some(ProjectStatus::Completed));
    assert_eq!(executor.calls_for("concept_leader").len(), 2);
    assert_eq!(h.agent(project.id, "design_leader").await.status, AgentStatus::Completed);
    assert!(h
        .engine
        .checkpoints()
        .pending_checkpoints(project.id)
        .await
        .unwrap()
        .is_empty());
    let logs = h.store.get_agent_logs(concept.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("superseded by intervention")));
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_snapshot_capture_and_restore() {
    let h = Harness::new(two_step(), Arc::new(ScriptedExecutor::default())).await;
    let project = h.project(ProjectConfig::default()).await;
    let leader = h.agent(project.id, "design_leader").await;
    let lifecycle = h.engine.lifecycle();
    let worker = lifecycle.spawn_worker(leader.id, "design_worker").await.unwrap();
    h.set_status(&worker, AgentStatus::Running).await;
    lifecycle
        .update_progress(worker.id, 40, Some("Rendering frame 4".into()))
        .await
        .unwrap();

    let snapshots = h.engine.snapshots();
    let run = Uuid::new_v4();
    let first = snapshots.capture(leader.id, run).await.unwrap();
    let second = snapshots.capture(leader.id, run).await.unwrap();
    assert_eq!(second.workers.len(), 1);
    assert_eq!(second.workers[0].progress, 40);
    assert_eq!(
        snapshots.latest_valid(leader.id).await.unwrap().unwrap().id,
        second.id
    );

    let err = snapshots.restore(first.id).await.unwrap_err();
    assert!(matches!(err, CadenceError::Validation(_)));

    lifecycle.update_progress(worker.id, 90, None).await.unwrap();
    snapshots.restore(second.id).await.unwrap();
    let restored = h.store.get_agent(worker.id).await.unwrap().unwrap();
    assert_eq!(restored.status, AgentStatus::Pending);
    assert_eq!(restored.progress, 40);
    assert_eq!(restored.current_task.as_deref(), Some("Rendering frame 4"));
}
