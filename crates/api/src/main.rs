use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conveyor_db::{Broker, JobStore, MemoryBroker, PgBroker, PgRecords, StoreConfig};
use conveyor_events::{EventBus, PgEventBridge};
use conveyor_worker::{tasks, WorkerConfig, WorkerPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_api::config::ServerConfig;
use conveyor_api::router::build_app_router;
use conveyor_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conveyor_api=debug,conveyor_worker=debug,tower_http=debug".into());
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let store_config = StoreConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let shutdown = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let bus = Arc::new(EventBus::default());
    let registry = Arc::new(
        tasks::builtin_registry(&worker_config.tasks).expect("Failed to register job types"),
    );

    // --- Store and broker ---
    let (store, broker): (Arc<JobStore>, Arc<dyn Broker>) = match &store_config.database_url {
        Some(database_url) => {
            let pool = conveyor_db::create_pool(database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            conveyor_db::health_check(&pool)
                .await
                .expect("Database health check failed");

            conveyor_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            background.push(tokio::spawn(PgEventBridge::run(
                pool.clone(),
                Arc::clone(&bus),
                shutdown.clone(),
            )));

            let store = Arc::new(JobStore::new(
                Arc::new(PgRecords::new(pool.clone())),
                Arc::clone(&bus),
                store_config.retention,
            ));
            let broker: Arc<dyn Broker> =
                Arc::new(PgBroker::new(pool).with_lease(store_config.lease));
            (store, broker)
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set, using in-memory store and queue with embedded workers"
            );
            let store = Arc::new(JobStore::in_memory(
                Arc::clone(&bus),
                store_config.retention,
            ));
            let broker: Arc<dyn Broker> =
                Arc::new(MemoryBroker::with_lease(store_config.lease));

            let workers = Arc::new(WorkerPool::new(
                Arc::clone(&store),
                Arc::clone(&broker),
                Arc::clone(&registry),
                worker_config,
            ));
            background.push(tokio::spawn(workers.run(shutdown.clone())));
            (store, broker)
        }
    };

    // --- Retention sweeper ---
    background.push(tokio::spawn(conveyor_db::sweeper::run(
        Arc::clone(&store),
        store_config.sweep_interval,
        shutdown.clone(),
    )));

    // --- Router ---
    let state = AppState::new(config.clone(), store, broker, registry);
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    shutdown.cancel();

    for handle in background {
        if tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .is_err()
        {
            tracing::warn!("Background task did not stop in time");
        }
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
