use std::sync::Arc;

use conveyor_db::{JobStore, PgBroker, PgRecords, StoreConfig};
use conveyor_events::{EventBus, PgEventBridge};
use conveyor_worker::{tasks, WorkerConfig, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conveyor_worker=debug,conveyor_db=info".into());
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

    let config = WorkerConfig::from_env();
    let store_config = StoreConfig::from_env();
    let database_url = store_config
        .database_url
        .clone()
        .expect("DATABASE_URL must be set for a standalone worker");

    let pool = conveyor_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    conveyor_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    let shutdown = CancellationToken::new();

    let bus = Arc::new(EventBus::default());
    let bridge = tokio::spawn(PgEventBridge::run(
        pool.clone(),
        Arc::clone(&bus),
        shutdown.clone(),
    ));

    let store = Arc::new(JobStore::new(
        Arc::new(PgRecords::new(pool.clone())),
        bus,
        store_config.retention,
    ));
    let broker = Arc::new(PgBroker::new(pool).with_lease(store_config.lease));
    let registry =
        Arc::new(tasks::builtin_registry(&config.tasks).expect("Failed to register job types"));

    let worker = Arc::new(WorkerPool::new(store, broker, registry, config));
    let running = tokio::spawn(worker.run(shutdown.clone()));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining running jobs");
    shutdown.cancel();

    if let Err(e) = running.await {
        tracing::error!(error = %e, "Worker pool task failed");
    }
    let _ = bridge.await;
    tracing::info!("Worker stopped");
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
