//! CLI entry point: submits one analysis task and drives it to completion
//! in this process, printing progress as it goes.
//!
//! Agent stages are out of this engine's scope; the bundled binary wires
//! every generated pipeline step to an `EchoAgentStage` so the state
//! machine, scheduler, and control protocol can be exercised end to end
//! without a real LLM integration.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use orchestrator_store::{FallbackStore, InMemoryKvClient, LocalFileStore, LocalFileStoreFactory, StateStore};
use taskengine::cli::{Cli, OutputFormat};
use taskengine::config::{Config, StorageBackend};
use taskengine::control::ControlManager;
use taskengine::domain::AnalysisParams;
use taskengine::fabric::{DisabledFabric, InMemoryFabric, MessageFabric};
use taskengine::pipeline::{AgentStage, EchoAgentStage, TaskManager, TaskManagerConfig};
use taskengine::progress::step_plan;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("taskengine").join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level_str = cli_log_level.or(config_log_level);
    let level = if let Some(s) = level_str {
        debug!(level_str = %s, "setup_logging: level_str is Some");
        match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{s}', defaulting to INFO");
                tracing::Level::INFO
            }
        }
    } else {
        tracing::Level::INFO
    };

    let log_file = fs::File::create(log_dir.join("taskengine.log")).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Builds an echo agent map covering every module name the submission's
/// step plan will invoke, so the binary works without a separate config
/// listing agent implementations.
fn echo_agents_for(params: &AnalysisParams) -> HashMap<String, Arc<dyn AgentStage>> {
    let plan = step_plan::plan(&params.analysts, params.research_depth, params.market_type);
    let mut agents: HashMap<String, Arc<dyn AgentStage>> = HashMap::new();
    for step in &plan.steps {
        if let Some(module_name) = &step.module_name {
            agents.entry(module_name.clone()).or_insert_with(|| {
                Arc::new(EchoAgentStage::new(module_name.clone(), Duration::from_millis(50), json!({ (module_name.clone()): "ok" })))
            });
        }
    }
    agents
}

async fn build_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    match config.storage.backend {
        StorageBackend::LocalFile => {
            Ok(Arc::new(LocalFileStore::open(&config.storage.data_dir).context("failed to open local file store")?))
        }
        StorageBackend::RemoteKv => {
            let client = InMemoryKvClient::new();
            let local = LocalFileStoreFactory::new(&config.storage.data_dir);
            Ok(Arc::new(FallbackStore::connect(client, local).await.context("failed to connect remote kv store")?))
        }
    }
}

async fn build_manager(config: &Config, agents: HashMap<String, Arc<dyn AgentStage>>) -> Result<TaskManager> {
    let store = build_store(config).await?;
    let control_manager = Arc::new(ControlManager::new(config.storage.checkpoint_dir.clone()));
    let fabric: Arc<dyn MessageFabric> = if config.fabric.enabled { InMemoryFabric::new() } else { Arc::new(DisabledFabric) };

    let manager_config = TaskManagerConfig {
        max_concurrent_tasks: config.concurrency.max_concurrent_tasks,
        poll_interval: config.concurrency.poll_interval(),
        shutdown_timeout: config.concurrency.shutdown_timeout(),
        default_cache_sleep_min: config.cache.sleep_min_seconds,
        default_cache_sleep_max: config.cache.sleep_max_seconds,
        duration_provider: config.duration.provider.clone(),
    };

    TaskManager::new(manager_config, control_manager, fabric, store, agents).await.context("failed to start task manager")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(max_concurrent_tasks = config.concurrency.max_concurrent_tasks, "taskengine: loaded config");

    let params = AnalysisParams {
        stock_symbol: cli.symbol,
        market_type: cli.market.into(),
        analysis_date: cli.date,
        analysts: cli.analysts,
        research_depth: cli.depth,
        include_sentiment: false,
        include_risk_assessment: false,
        custom_prompt: None,
        extra_config: serde_json::Value::Null,
        cache_reuse_config: None,
    };

    let manager = Arc::new(build_manager(&config, echo_agents_for(&params)).await?);
    let task_id = manager.start_task(params).await?;
    info!(%task_id, "taskengine: task submitted");

    if let Some(secs) = cli.pause_after_secs {
        let manager = manager.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if let Ok(true) = manager.pause_task(&task_id).await {
                info!(%task_id, "taskengine: paused");
                tokio::time::sleep(Duration::from_secs(secs)).await;
                if let Ok(true) = manager.resume_task(&task_id).await {
                    info!(%task_id, "taskengine: resumed");
                }
            }
        });
    }

    if let Some(secs) = cli.stop_after_secs {
        let manager = manager.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if let Ok(true) = manager.stop_task(&task_id) {
                info!(%task_id, "taskengine: stop requested");
            }
        });
    }

    loop {
        let task = manager.get_task_status(&task_id).await;
        let terminal = task.as_ref().map(|t| t.status.is_terminal()).unwrap_or(false);
        if let Some(task) = &task {
            println!("[{}] {:.0}% {}", task.status, task.progress.percentage * 100.0, task.progress.message);
        }
        if terminal {
            if let Some(task) = task {
                match cli.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
                    OutputFormat::Text => println!("final status: {}", task.status),
                }
            }
            break;
        }
        tokio::time::sleep(config.concurrency.poll_interval()).await;
    }

    manager.shutdown().await;
    Ok(())
}
