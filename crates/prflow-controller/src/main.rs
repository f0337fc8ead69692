//! prflow controller: reconcilers, admission worker and webhook server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use prflow_chatops::default_dispatcher;
use prflow_config::{LogFormat, Settings, load_settings};
use prflow_controller::config::{ConfigContext, run_config_controller};
use prflow_controller::crd::{PipelineJob, RepoConfig};
use prflow_controller::git::GitClients;
use prflow_controller::job::{JobContext, run_job_controller};
use prflow_controller::pipeline::PipelineManager;
use prflow_controller::scheduler::QueueScheduler;
use prflow_controller::store::{KubeStore, ResourceStore};
use prflow_controller::{AppState, routes};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prflow-controller")]
#[command(about = "CI/CD controller for pull request workflows", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, env = "PRFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Only watch this namespace
    #[arg(long)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the custom resource definitions as JSON
    Crds,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Crds) = cli.command {
        println!("{}", serde_json::to_string_pretty(&RepoConfig::crd())?);
        println!("{}", serde_json::to_string_pretty(&PipelineJob::crd())?);
        return Ok(());
    }

    let mut settings = match &cli.config {
        Some(path) => load_settings(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if cli.namespace.is_some() {
        settings.namespace = cli.namespace;
    }

    init_tracing(settings.log_format);
    info!(
        listen = %settings.listen,
        namespace = ?settings.namespace,
        max_concurrent_jobs = settings.max_concurrent_jobs,
        "Starting prflow controller"
    );

    let client = Client::try_default().await?;
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));
    let git = GitClients::new();
    let pipelines = PipelineManager::new();

    let (scheduler, admission) =
        QueueScheduler::spawn(store.clone(), pipelines.clone(), settings.max_concurrent_jobs);

    let job_ctx = Arc::new(JobContext {
        store: store.clone(),
        scheduler: Arc::new(scheduler),
        pipelines,
        git: git.clone(),
        settings: settings.clone(),
    });
    let config_ctx = Arc::new(ConfigContext {
        store: store.clone(),
        git: git.clone(),
        settings: settings.clone(),
    });

    let app = routes::router(AppState::new(store, git, default_dispatcher()))
        .layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind(settings.listen).await?;
    info!("Webhook server listening on {}", settings.listen);

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        _ = run_job_controller(client.clone(), job_ctx) => {},
        _ = run_config_controller(client, config_ctx) => {},
        result = admission => result?,
    }

    info!("prflow controller stopped");
    Ok(())
}
