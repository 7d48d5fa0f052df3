use std::sync::Arc;

use conveyor_core::registry::DispatchRegistry;
use conveyor_db::{Broker, JobStore};

use crate::config::ServerConfig;
use crate::engine::{CancellationCoordinator, JobSubmitter, StatusService};

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Job record store.
    pub store: Arc<JobStore>,
    /// Queue the submit path writes to.
    pub broker: Arc<dyn Broker>,
    /// Registered job types.
    pub registry: Arc<DispatchRegistry>,
    pub submitter: Arc<JobSubmitter>,
    pub status: Arc<StatusService>,
    pub cancellation: Arc<CancellationCoordinator>,
}

impl AppState {
    /// Wire the services over one store, broker and registry.
    pub fn new(
        config: ServerConfig,
        store: Arc<JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<DispatchRegistry>,
    ) -> Self {
        let submitter = JobSubmitter::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&broker),
        );
        let status = StatusService::new(Arc::clone(&store), config.status_poll);
        let cancellation = CancellationCoordinator::new(Arc::clone(&store), Arc::clone(&broker));

        Self {
            config: Arc::new(config),
            store,
            broker,
            registry,
            submitter: Arc::new(submitter),
            status: Arc::new(status),
            cancellation: Arc::new(cancellation),
        }
    }
}
