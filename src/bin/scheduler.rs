// Action Scheduler - main process
// Runs the control loop, the completion callback server and the trigger listener
// Run with: cargo run --bin scheduler -- --config scheduler.toml

//! # Scheduler Binary
//!
//! One process per scheduler node. Several nodes can share the same database;
//! the conditional updates and named mutexes keep them from double-submitting.
//!
//! ```text
//! main()
//!   ├─ SchedulerLoop      promote / reconcile / scale down on every tick
//!   ├─ CallbackServer     PUT /action/state from running jobs
//!   └─ TriggerListener    retry and COMPLETE_ACTION messages from NATS
//! ```
//!
//! Everything stops on ctrl-c; the database pool is closed last.

use action_scheduler::{
    BatchExecutor, CallbackServerBuilder, CompletionHandler, DagBuilder, EngineRegistry,
    HttpBatchExecutor, NatsTriggerBroker, PostgresStateStore, SchedulerConfig, SchedulerLoop,
    StateStore, TriggerListener, TriggerMessage, TriggerProxy, WorkflowLauncher,
};
use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scheduler")]
#[command(about = "Action scheduler - control loop and completion callback server")]
#[command(version = "0.1")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "SCHEDULER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let cli = Cli::parse();
    let config = SchedulerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Action Scheduler...");
    info!("=====================================");
    info!("Job queue: {}", config.batch.job_queue);
    info!("Job definition suffix: {}", config.batch.job_definition_suffix);

    let store = Arc::new(
        PostgresStateStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to connect to the state store")?,
    );
    store.ensure_schema().await?;
    info!("✅ State store ready");

    let broker = Arc::new(NatsTriggerBroker::connect(&config.nats.url, config.nats.subject.clone()).await?);
    let triggers = TriggerProxy::new(broker.clone());

    let executor: Arc<dyn BatchExecutor> = Arc::new(HttpBatchExecutor::new(
        &config.batch.endpoint,
        config.batch.request_timeout(),
    )?);

    let engines = EngineRegistry::from_config(&config.engines);
    info!(engines = ?engines.names(), "✅ Engine registry loaded");

    let state: Arc<dyn StateStore> = store.clone();
    let dag = Arc::new(DagBuilder::new(
        state.clone(),
        executor.clone(),
        engines,
        config.batch.job_queue.clone(),
        config.batch.job_definition_suffix.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = CallbackServerBuilder::new(CompletionHandler::new(state.clone(), triggers.clone()))
        .with_port(config.server.port)
        .with_cors(config.server.cors)
        .build();
    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(server.run(async move {
        let _ = server_shutdown.changed().await;
    }));

    let launcher = WorkflowLauncher::new(state.clone(), dag.clone(), config.batch.notification_target.clone());
    let listener = TriggerListener::new(state.clone(), launcher);
    let mut subscription = broker.subscribe().await?;
    let mut listener_shutdown = shutdown_rx.clone();
    let listener_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = listener_shutdown.changed() => break,
                next = subscription.next() => {
                    let Some(message) = next else { break };
                    match serde_json::from_slice::<TriggerMessage>(&message.payload) {
                        Ok(trigger) => {
                            if let Err(e) = listener.handle(&trigger).await {
                                error!(call = trigger.call_name(), "Trigger handling failed: {}", e);
                            }
                        }
                        Err(e) => warn!(subject = %message.subject, "Dropping malformed trigger message: {}", e),
                    }
                }
            }
        }
    });

    if config.batch.notification_target.is_none() {
        warn!("No notification target configured; jobs will not publish completion notices");
    }
    info!("Scale-down disabled: no capacity manager configured");

    let mut scheduler = SchedulerLoop::new(state, dag, executor, triggers, config.scheduler.clone())
        .with_notification_target(config.batch.notification_target.clone());
    let loop_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown requested");
    let _ = shutdown_tx.send(true);

    loop_task.await?;
    listener_task.await?;
    server_task.await??;

    store.close().await;
    info!("👋 Scheduler stopped");
    Ok(())
}
