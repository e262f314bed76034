use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;

use ai_tasks::api::{ApiState, task_routes};
use ai_tasks::app::Backends;
use ai_tasks::config::AppConfig;
use ai_tasks::tasks::TaskType;
use ai_tasks::worker::{Consumer, WorkerRegistry};
use ai_tasks::workers::{WorkerDeps, default_registry};

#[derive(Debug, Parser)]
#[command(name = "ai-tasks", version, about = "Asynchronous analysis task service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long, env = "AI_TASKS_PORT")]
        port: Option<u16>,
    },
    /// Run a worker process that consumes task streams.
    Worker {
        /// Task types to serve. Defaults to every registered type.
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        types: Vec<TaskType>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        worker_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().context("invalid configuration")?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Worker {
            types,
            group,
            worker_id,
        } => {
            if let Some(group) = group {
                config.consumer.group = group;
            }
            if let Some(worker_id) = worker_id {
                config.consumer.name = worker_id;
            }
            work(config, &types).await
        }
    }
}

fn registry(config: &AppConfig) -> anyhow::Result<Arc<WorkerRegistry>> {
    let deps = WorkerDeps::from_config(config).context("failed to build worker collaborators")?;
    Ok(Arc::new(default_registry(deps)))
}

fn spawn_consumer(
    config: &AppConfig,
    backends: &Backends,
    registry: Arc<WorkerRegistry>,
    types: &[TaskType],
) -> (Arc<Consumer>, JoinHandle<()>) {
    let consumer = Arc::new(Consumer::new(
        backends.transport.clone(),
        backends.store.clone(),
        registry,
        config.consumer.clone(),
        types,
    ));
    let runner = consumer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    (consumer, handle)
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let backends = Backends::open(&config).await?;

    let embedded = if config.server.embedded_workers {
        let registry = registry(&config)?;
        Some(spawn_consumer(&config, &backends, registry, &[]))
    } else {
        None
    };

    let app = task_routes(
        ApiState {
            producer: backends.producer(),
        },
        &config.server.cors_allow_origins,
    );
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.server.port))?;
    tracing::info!(
        port = config.server.port,
        embedded_workers = config.server.embedded_workers,
        "API server started"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some((consumer, handle)) = embedded {
        consumer.stop();
        let _ = handle.await;
    }
    backends.shutdown().await;
    Ok(())
}

async fn work(config: AppConfig, types: &[TaskType]) -> anyhow::Result<()> {
    let backends = Backends::open(&config).await?;
    let registry = registry(&config)?;
    let (consumer, handle) = spawn_consumer(&config, &backends, registry, types);
    tracing::info!(worker_id = %consumer.name(), streams = ?consumer.streams(), "Worker process started");

    shutdown_signal().await;
    consumer.stop();
    let _ = handle.await;
    backends.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
