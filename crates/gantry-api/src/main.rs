//! Gantry API server

use clap::Parser;
use gantry_api::buildserver::owner_address;
use gantry_api::drain::spawn_signal_handler;
use gantry_api::events::TrackingEngine;
use gantry_api::{AppState, Storage, routes};
use gantry_config::{DatabaseConfig, NodeConfig, load_node_config};
use gantry_db::{LockManager, MemoryStore, PgLockManager, create_pool, run_migrations};
use gantry_scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gantry-server")]
#[command(about = "Gantry build scheduler node", long_about = None)]
struct Args {
    /// Node configuration file
    #[arg(long, env = "GANTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Shared database, overriding the config file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Listen address, overriding the config file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = match &args.config {
        Some(path) => load_node_config(path)?,
        None => NodeConfig::default(),
    };
    if let Some(url) = args.database_url {
        let max_connections = config.database.as_ref().map_or(10, |db| db.max_connections);
        config.database = Some(DatabaseConfig {
            url,
            max_connections,
        });
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let owner = owner_address(&config.peer_url);
    let (storage, locks, pg_locks) = match &config.database {
        Some(db) => {
            info!("Connecting to database...");
            let pool = create_pool(&db.url, db.max_connections).await?;
            run_migrations(&pool).await?;
            info!("Database connected");

            let locks = Arc::new(PgLockManager::start(pool.clone(), owner.clone()).await?);
            let shared: Arc<dyn LockManager> = locks.clone();
            (Storage::postgres(pool), shared, Some(locks))
        }
        None => {
            warn!("No database configured, running on in-process storage");
            let store = MemoryStore::new();
            let locks: Arc<dyn LockManager> = Arc::new(store.lock_manager(&owner));
            (Storage::memory(store), locks, None)
        }
    };

    let drain = CancellationToken::new();
    spawn_signal_handler(drain.clone());

    let state = AppState::new(&config, storage.clone(), drain.clone());

    let engine = Arc::new(TrackingEngine::new(state.tracker.clone()));
    let scheduler = Arc::new(Scheduler::new(
        storage.jobs,
        storage.builds,
        locks,
        engine,
        owner.clone(),
    ));
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let scheduler_config = config.scheduler.clone();
        let trigger = state.scheduler_trigger.clone();
        let drain = drain.clone();
        async move { scheduler.run(scheduler_config, trigger, drain).await }
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(
        listen = %config.listen,
        peer_url = %owner,
        external_url = %config.external_url,
        "Starting server"
    );
    let listener = TcpListener::bind(config.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(drain.clone().cancelled_owned())
        .await?;

    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }
    if let Some(locks) = pg_locks {
        // Frees this node's serial-group locks without waiting for the reaper.
        locks.close().await?;
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
