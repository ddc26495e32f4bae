//! `atelierd` — the atelier task orchestration server.
//!
//! Usage:
//!   atelierd -c <context-name-or-path> [--listen <addr>]
//!
//! The context name resolves to `/etc/atelier/<name>.toml`.
//! If a path with `/` or `.` is given, it's used directly.

mod config;
mod routes;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use atelier_core::Module;
use atelier_task::TaskModule;
use atelier_task::billing::{BillingGateway, NoopBillingGateway};
use atelier_task::queue::QueueSet;

use config::ServerConfig;

/// Atelier task orchestration server.
#[derive(Parser, Debug)]
#[command(name = "atelierd", about = "Atelier task orchestration server")]
struct Cli {
    /// Context name or path to config file.
    #[arg(short = 'c', long = "config", required = true)]
    config: String,

    /// Listen address (overrides default 0.0.0.0:8080).
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load server configuration.
    let config_path = ServerConfig::resolve_path(&cli.config);
    info!("Loading configuration from {}", config_path.display());
    let server_config = ServerConfig::load(&config_path)?;

    // Initialize storage.
    let data_dir = std::path::PathBuf::from(&server_config.storage.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let core_config = atelier_core::ServiceConfig {
        data_dir: Some(data_dir),
        listen: cli.listen.clone(),
        ..Default::default()
    };

    let sql: Arc<dyn atelier_sql::SQLStore> = Arc::new(
        atelier_sql::SqliteStore::open(&core_config.resolve_sqlite_path())
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {}", e))?,
    );

    // In-process execution queues; external workers drive jobs through the
    // task module's worker-facing API.
    let queues = Arc::new(QueueSet::memory());

    // No billing backend configured: releases always succeed.
    let billing: Arc<dyn BillingGateway> = Arc::new(NoopBillingGateway);

    let task_module = TaskModule::with_config(
        sql,
        queues,
        billing,
        server_config.watchdog.to_reconcile_config(),
    )?;
    info!("Task module initialized");

    let module_routes = vec![(task_module.name(), task_module.routes())];
    let app = routes::build_router(module_routes);

    // Start server.
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!("atelier server listening on {}", cli.listen);
    axum::serve(listener, app).await?;

    Ok(())
}
