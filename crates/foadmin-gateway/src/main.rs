use clap::Parser;
use foadmin_core::config::FoadminConfig;
use foadmin_scheduler::{tasks::register_builtin, JobStore, Scheduler, TaskTable};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

mod app;
mod auth;
mod http;

/// foadmin admin backend: job scheduler plus its HTTP admin API.
#[derive(Debug, Parser)]
#[command(name = "foadmin-gateway", version)]
struct Cli {
    /// Path to foadmin.toml (overrides FOADMIN_CONFIG).
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "foadmin_gateway=info,foadmin_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    // load config: --config > FOADMIN_CONFIG env > ~/.foadmin/foadmin.toml
    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("FOADMIN_CONFIG").ok());
    let config = FoadminConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        FoadminConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    // initialize SQLite database
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    // runs the schema migrations (idempotent)
    let store = JobStore::new(db)?;
    info!("database migrations complete");

    let mut tasks = TaskTable::new();
    register_builtin(&mut tasks, store.clone(), config.scheduler.log_retention_days)?;
    info!(tasks = tasks.len(), "task table ready");

    let scheduler = Scheduler::build(store, tasks, &config.scheduler)?;
    if config.scheduler.enabled {
        if let Some(report) = scheduler.start()? {
            if !report.skipped.is_empty() {
                warn!(
                    skipped = report.skipped.len(),
                    "some enabled jobs could not be scheduled; fix or pause them"
                );
            }
        }
    } else {
        info!("scheduler disabled by config; jobs will not fire");
    }

    let state = Arc::new(app::AppState::new(config, scheduler));
    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("foadmin gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop firing once the server is down
    state.scheduler.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
