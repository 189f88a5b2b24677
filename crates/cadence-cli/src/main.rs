//! Command-line driver for the Cadence orchestration core.

mod config_watcher;

use cadence_core::{AutoApprovalRule, Notifier, ProjectConfig, Store};
use cadence_orchestrator::{ChatExecutor, OrchestratorConfig, PipelineEngine, TracingNotifier, WorkflowHandle};
use cadence_provider::{register_configured, ProviderRegistry, SimulatedProvider};
use cadence_store::MemoryStore;
use clap::{Args, Parser, Subcommand};
use config_watcher::{apply_workflow, ConfigWatcher};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence: multi-agent generation pipeline orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config file and summarize it
    Check,
    /// Print the workflow phases and dependencies as JSON
    Plan,
    /// Run a project end to end against the configured providers
    Simulate(SimulateArgs),
    /// Run restart recovery on a saved state file
    Recover {
        /// State file written by `simulate --state`
        #[arg(long)]
        state: PathBuf,
    },
    /// Watch the config file and hot-reload the workflow
    Watch {
        /// Minimum milliseconds between two reloads
        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// Project name
    #[arg(long, default_value = "simulation")]
    name: String,
    /// Load and save store state here
    #[arg(long)]
    state: Option<PathBuf>,
    /// Raise a review checkpoint for agent types matching this pattern
    #[arg(long)]
    review: Option<String>,
    /// Auto-approve every checkpoint and asset
    #[arg(long)]
    approve: bool,
    /// Record one text asset per agent
    #[arg(long)]
    assets: bool,
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if pretty {
        builder.init();
    } else {
        builder.json().init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    OrchestratorConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {e}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    match cli.command {
        Commands::Check => check(&cli.config),
        Commands::Plan => plan(&cli.config),
        Commands::Simulate(args) => simulate(&cli.config, args).await,
        Commands::Recover { state } => recover(&cli.config, &state).await,
        Commands::Watch { debounce_ms } => watch(cli.config, debounce_ms).await,
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let workflow = config.workflow_map()?;

    println!("Configuration OK: {}", path.display());
    let phases = workflow.phases();
    println!("Workflow: {} agent type(s) in {} phase(s)", workflow.len(), phases.len());
    for (phase, types) in phases.iter().enumerate() {
        println!("  phase {phase}: {}", types.join(", "));
    }

    println!(
        "Concurrency: {} per provider by default",
        config.concurrency.default_max_concurrent
    );
    let mut caps: Vec<_> = config.concurrency.providers.iter().collect();
    caps.sort();
    for (provider, cap) in caps {
        println!("  {provider}: {cap}");
    }
    for group in &config.concurrency.groups {
        println!(
            "  group {} [{}]: {}",
            group.name,
            group.providers.join(", "),
            group.max_concurrent
        );
    }

    println!(
        "Budget: ${:.2}/month, alert at {}%, {}",
        config.budget.monthly_limit_usd,
        config.budget.alert_threshold_percent,
        if config.budget.stop_on_exceeded {
            "stops when exceeded"
        } else {
            "warns when exceeded"
        }
    );
    println!(
        "Retry: {} retries, {}ms base delay",
        config.retry.max_retries, config.retry.base_delay_ms
    );
    if config.pricing.is_empty() {
        println!("Pricing: none configured, usage is recorded at $0");
    } else {
        println!("Pricing: {} row(s)", config.pricing.len());
    }
    match &config.default_provider {
        Some(provider) => println!("Default provider: {provider}"),
        None => println!("Default provider: none"),
    }
    Ok(())
}

fn plan(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let workflow = config.workflow_map()?;
    let dependents: serde_json::Map<String, serde_json::Value> = workflow
        .agent_types()
        .map(|ty| (ty.to_string(), json!(workflow.dependents(ty))))
        .collect();
    print_json(&json!({
        "phases": workflow.phases(),
        "prerequisites": workflow.as_map(),
        "dependents": dependents,
    }))
}

fn build_registry(config: &OrchestratorConfig) -> anyhow::Result<Arc<ProviderRegistry>> {
    let registry = Arc::new(ProviderRegistry::new());
    register_configured(&registry, &config.providers)?;
    if let Some(default) = &config.default_provider {
        if !registry.contains(default) {
            warn!(provider = %default, "Default provider not configured, simulating it");
            registry.register_instance(Arc::new(SimulatedProvider::new(default.clone())))?;
        }
    }
    Ok(registry)
}

async fn open_store(state: Option<&Path>) -> anyhow::Result<Arc<MemoryStore>> {
    let store = match state {
        Some(path) if path.exists() => MemoryStore::load_from(path).await?,
        _ => MemoryStore::new(),
    };
    Ok(Arc::new(store))
}

async fn simulate(path: &Path, args: SimulateArgs) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let store = open_store(args.state.as_deref()).await?;
    let registry = build_registry(&config)?;

    let mut executor = ChatExecutor::new().with_assets(args.assets);
    if let Some(pattern) = &args.review {
        executor = executor.with_review(pattern)?;
    }
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let engine = PipelineEngine::new(&config, store.clone(), notifier, registry, Arc::new(executor))?;

    let recovery = engine.startup().await?;
    if !recovery.is_empty() {
        info!(
            projects = recovery.projects.len(),
            agents = recovery.agents.len(),
            "Recovered interrupted work from state file"
        );
    }
    let health = engine.spawn_health_loop();

    let project_config = ProjectConfig {
        auto_approval_rules: if args.approve {
            vec![AutoApprovalRule::approve_all("*")]
        } else {
            Vec::new()
        },
        ..Default::default()
    };
    let (project, _) = engine.create_project(&args.name, project_config).await?;
    engine.lifecycle().start_project(project.id).await?;
    let report = engine.drive(project.id).await?;

    let agents: Vec<_> = store
        .get_agents_by_project(project.id)
        .await?
        .into_iter()
        .map(|a| {
            json!({
                "agent_type": a.agent_type,
                "status": a.status,
                "tokens": a.total_tokens(),
                "error": a.error_message,
            })
        })
        .collect();
    let pending = engine.checkpoints().pending_checkpoints(project.id).await?;
    let blocked = engine.scheduler().explain_blocked(project.id).await?;
    let projection = engine.budget().projection().await?;

    print_json(&json!({
        "project_id": project.id,
        "report": report,
        "agents": agents,
        "pending_checkpoints": pending.iter().map(|c| &c.title).collect::<Vec<_>>(),
        "blocked": blocked,
        "concurrency": engine.concurrency().usage(),
        "budget": projection,
    }))?;

    engine.shutdown().await;
    if let Err(e) = health.await {
        warn!(error = %e, "Health loop ended abnormally");
    }
    if let Some(state) = &args.state {
        store.save_to(state).await?;
    }
    Ok(())
}

async fn recover(path: &Path, state: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    if !state.exists() {
        anyhow::bail!("State file '{}' does not exist", state.display());
    }
    let store = open_store(Some(state)).await?;
    let registry = build_registry(&config)?;
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let engine = PipelineEngine::new(
        &config,
        store.clone(),
        notifier,
        registry,
        Arc::new(ChatExecutor::new()),
    )?;

    let report = engine.startup().await?;
    let interrupted = engine.lifecycle().get_interrupted_agents(None).await?;
    print_json(&json!({
        "recovered": report,
        "interrupted": interrupted
            .iter()
            .map(|a| json!({ "agent_id": a.id, "project_id": a.project_id, "agent_type": a.agent_type }))
            .collect::<Vec<_>>(),
    }))?;
    store.save_to(state).await?;
    Ok(())
}

async fn watch(path: PathBuf, debounce_ms: u64) -> anyhow::Result<()> {
    let config = load_config(&path)?;
    let handle = Arc::new(WorkflowHandle::new(config.workflow_map()?));

    let reload_target = handle.clone();
    let _watcher = ConfigWatcher::start(path.clone(), debounce_ms, move |config| {
        if let Err(e) = apply_workflow(&reload_target, &config) {
            warn!(error = %e, "Reloaded config rejected");
        }
    })?;

    info!(path = %path.display(), "Watching config, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    let phases = handle.current().phases().len();
    info!(phases, "Stopped watching");
    Ok(())
}
