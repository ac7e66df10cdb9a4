// Action Scheduler Admin CLI
// Schema setup, inspection and manual interventions against the shared state store

use action_scheduler::engine::ActionFilter;
use action_scheduler::{
    ActionState, BatchExecutor, DagBuilder, EngineRegistry, HttpBatchExecutor, MutexService,
    Mutexes, NatsTriggerBroker, PostgresStateStore, SchedulerConfig, SchedulerLoop, StateStore,
    TriggerProxy, WorkflowLauncher,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "scheduler-admin")]
#[command(about = "Action Scheduler Admin CLI - inspect and repair scheduler state")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, env = "SCHEDULER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables and indexes if they do not exist
    InitSchema,

    /// List actions, optionally filtered by state
    ListActions {
        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        datastore_id: Option<String>,
    },

    /// Force a named mutex back to READY
    ReleaseMutex { name: String },

    /// Start a new instance of a workflow
    LaunchWorkflow {
        workflow_id: String,

        #[arg(long, default_value_t = 0)]
        retry_num: u32,
    },

    /// Run every control-loop task once
    Tick,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = SchedulerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let store = Arc::new(
        PostgresStateStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to connect to the state store")?,
    );

    let outcome = run(cli.command, &config, store.clone()).await;
    store.close().await;
    outcome
}

async fn run(command: Commands, config: &SchedulerConfig, store: Arc<PostgresStateStore>) -> Result<()> {
    match command {
        Commands::InitSchema => {
            store.ensure_schema().await?;
            info!("✅ Schema is up to date");
        }

        Commands::ListActions { state, datastore_id } => {
            let mut filter = ActionFilter::default();
            if let Some(state) = state {
                filter.states = vec![ActionState::from_str(&state.to_uppercase())?];
            }
            filter.datastore_id = datastore_id;
            list_actions(store.as_ref(), &filter).await?;
        }

        Commands::ReleaseMutex { name } => {
            if !Mutexes::ALL.contains(&name.as_str()) {
                warn!("⚠️  {} is not a well-known mutex (known: {:?})", name, Mutexes::ALL);
            }
            let previous = MutexService::new(store).force_release(&name).await?;
            match previous {
                Some(state) => info!("🔓 Released {} (was {})", name, state.as_str()),
                None => info!("🔓 {} has never been taken, nothing to release", name),
            }
        }

        Commands::LaunchWorkflow { workflow_id, retry_num } => {
            let (state, dag, _) = wiring(config, store)?;
            let launcher = WorkflowLauncher::new(state, dag, config.batch.notification_target.clone());
            match launcher.launch(&workflow_id, retry_num).await {
                Ok(instance) => info!("🚀 Launched workflow {} as instance {}", workflow_id, instance.id),
                Err(e) => {
                    error!("❌ Launch failed: {}", e);
                    return Err(e.into());
                }
            }
        }

        Commands::Tick => {
            let (state, dag, executor) = wiring(config, store)?;
            let broker = NatsTriggerBroker::connect(&config.nats.url, config.nats.subject.clone()).await?;
            let scheduler = SchedulerLoop::new(
                state,
                dag,
                executor,
                TriggerProxy::new(Arc::new(broker)),
                config.scheduler.clone(),
            )
            .with_notification_target(config.batch.notification_target.clone());
            scheduler.run_all_tasks().await?;
            info!("✅ Ran one pass of every scheduler task");
        }
    }
    Ok(())
}

/// State store, DAG builder and batch executor as the scheduler process wires them
fn wiring(
    config: &SchedulerConfig,
    store: Arc<PostgresStateStore>,
) -> Result<(Arc<dyn StateStore>, Arc<DagBuilder>, Arc<dyn BatchExecutor>)> {
    let state: Arc<dyn StateStore> = store;
    let executor: Arc<dyn BatchExecutor> = Arc::new(HttpBatchExecutor::new(
        &config.batch.endpoint,
        config.batch.request_timeout(),
    )?);
    let dag = DagBuilder::new(
        state.clone(),
        executor.clone(),
        EngineRegistry::from_config(&config.engines),
        config.batch.job_queue.clone(),
        config.batch.job_definition_suffix.clone(),
    );
    Ok((state, Arc::new(dag), executor))
}

async fn list_actions(store: &dyn StateStore, filter: &ActionFilter) -> Result<()> {
    let actions = store.find_actions(filter).await?;

    println!("\n📋 Actions ({})", actions.len());
    println!("=====================================");

    if actions.is_empty() {
        println!("No actions found.");
        return Ok(());
    }

    for action in actions {
        println!("🔧 ID: {}", action.id);
        println!("   Name: {}", action.name);
        println!("   State: {}", action.state);
        println!("   Engine: {}", action.engine_name);
        println!("   Datastore: {}", action.datastore_id);
        if let Some(job_id) = &action.batch_job_id {
            println!("   Batch job: {}", job_id);
        }
        if let Some(err) = &action.error_message {
            println!("   Error: {}", err);
        }
        println!();
    }

    Ok(())
}
