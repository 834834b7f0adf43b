use anyhow::Result;
use clap::Parser;
use drydock::api;
use drydock::compute::HttpCompute;
use drydock::config::AppConfig;
use drydock::manager::SessionManager;
use drydock::notify::BusNotifier;
use drydock::store::Store;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "drydock",
    about = "Rolling maintenance orchestration for compute clusters"
)]
struct Cli {
    /// API bind address
    #[arg(long)]
    host: Option<String>,

    /// API port
    #[arg(long)]
    port: Option<u16>,

    /// Compute control plane endpoint
    #[arg(long)]
    compute_url: Option<String>,

    /// SQLite database location
    #[arg(long)]
    database: Option<PathBuf>,

    /// Identity used toward the compute plane
    #[arg(long)]
    workflow_user: Option<String>,

    /// Password for the workflow identity
    #[arg(long)]
    workflow_password: Option<String>,

    /// Admin project reported in host notifications
    #[arg(long)]
    workflow_project: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drydock=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::default();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(compute_url) = cli.compute_url {
        config.compute_url = compute_url;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(workflow_user) = cli.workflow_user {
        config.workflow_user = workflow_user;
    }
    if let Some(workflow_password) = cli.workflow_password {
        config.workflow_password = workflow_password;
    }
    if let Some(workflow_project) = cli.workflow_project {
        config.workflow_project = workflow_project;
    }

    let store = Arc::new(Store::open(&config.database_path)?);
    tracing::info!(database = %store.db_path().display(), "session store ready");

    let compute = Arc::new(HttpCompute::new(
        &config.compute_url,
        &config.workflow_user,
        &config.workflow_password,
    ));
    let notifier = Arc::new(BusNotifier::new(&config.rpc_topic));
    let manager = Arc::new(SessionManager::new(
        config.clone(),
        store,
        compute,
        notifier,
    ));

    let app = api::router(manager);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(host = %config.host, port = config.port, "drydock API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
