//! `swarmline` command-line runner.

mod bodies;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarmline_orchestrator::{
    AgentRegistry, Priority, SwarmConfig, SwarmScheduler, TaskRequest, TaskStatus,
};
use swarmline_stream::{FileExecutionStore, StreamItem};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "swarmline", about = "Swarmline: priority task scheduler with streamed executions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "swarmline.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit tasks and stream their events until all are terminal
    Run {
        /// One task per description
        #[arg(required = true)]
        descriptions: Vec<String>,
        /// Priority from 1 (critical) to 5 (background)
        #[arg(short, long, default_value_t = 3)]
        priority: u8,
        /// Agent to run on (selected by keywords when omitted)
        #[arg(short, long)]
        agent: Option<String>,
        /// User id recorded on the executions
        #[arg(short, long, default_value = "cli")]
        user: String,
    },
    /// List configured agents
    Agents,
    /// Print the effective configuration
    Config,
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

/// Load the config file, or fall back to defaults with the demo agents when
/// it does not exist.
async fn load_config(path: &Path) -> anyhow::Result<SwarmConfig> {
    if tokio::fs::try_exists(path).await? {
        let config = SwarmConfig::load(path).await?;
        info!(path = %path.display(), agents = config.agents.len(), "Config loaded");
        return Ok(config);
    }
    warn!(path = %path.display(), "Config file not found, using defaults with demo agents");
    Ok(SwarmConfig {
        agents: bodies::demo_agents(),
        ..SwarmConfig::default()
    })
}

async fn build_scheduler(config: SwarmConfig) -> anyhow::Result<SwarmScheduler> {
    let registry = Arc::new(AgentRegistry::from_definitions(&config.agents, bodies::build)?);
    let store = match &config.store.data_dir {
        Some(dir) => Some(FileExecutionStore::new(dir.clone()).await?),
        None => None,
    };
    let mut builder = SwarmScheduler::builder(config).with_registry(registry);
    if let Some(store) = store {
        builder = builder.with_store(Arc::new(store));
    }
    Ok(builder.build()?)
}

async fn run(
    scheduler: &SwarmScheduler,
    descriptions: Vec<String>,
    priority: Priority,
    agent: Option<String>,
    user: String,
) -> anyhow::Result<bool> {
    let mut task_ids: Vec<Uuid> = Vec::new();
    let mut streams = Vec::new();
    for description in descriptions {
        let mut request = TaskRequest::new(description)
            .with_priority(priority)
            .with_user(user.clone());
        request.preferred_agent = agent.clone();
        let task_id = scheduler.submit_request(request)?;
        streams.push(scheduler.subscribe_task(task_id, 0)?);
        task_ids.push(task_id);
    }

    let mut events = futures_util::stream::select_all(streams);
    loop {
        tokio::select! {
            item = events.next() => match item {
                Some(StreamItem::Keepalive { .. }) => {}
                Some(item) => println!("{}", serde_json::to_string(&item)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling tasks");
                for id in &task_ids {
                    if let Err(e) = scheduler.cancel_task(*id) {
                        warn!(task_id = %id, error = %e, "Cancel failed");
                    }
                }
            }
        }
    }

    let mut all_completed = true;
    for id in &task_ids {
        let task = scheduler.get_task_status(*id)?;
        all_completed &= task.status == TaskStatus::Completed;
        println!(
            "{}",
            serde_json::json!({
                "task_id": task.id,
                "status": task.status,
                "agent": task.assigned_agent,
                "retries": task.retry_count,
                "execution_time_ms": task.execution_time_ms,
                "error": task.error,
            })
        );
    }
    println!("{}", scheduler.get_metrics().to_json());
    Ok(all_completed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Run {
            descriptions,
            priority,
            agent,
            user,
        } => {
            let priority = Priority::new(priority)?;
            let scheduler = build_scheduler(config).await?;
            scheduler.start();
            let outcome = run(&scheduler, descriptions, priority, agent, user).await;
            scheduler.shutdown().await;
            if !outcome? {
                std::process::exit(1);
            }
        }
        Commands::Agents => {
            for agent in &config.agents {
                println!(
                    "{}",
                    serde_json::json!({
                        "name": agent.name,
                        "kind": agent.kind,
                        "category": agent.category,
                        "capabilities": agent.capabilities,
                        "max_concurrent_tasks": agent.max_concurrent_tasks,
                    })
                );
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}
