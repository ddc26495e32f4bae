pub mod api;
pub mod billing;
pub mod engine;
pub mod events;
pub mod manual;
pub mod model;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod watchdog;

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use atelier_core::Module;
use atelier_sql::SQLStore;

use billing::BillingGateway;
use engine::TaskEngine;
use queue::QueueSet;
use reconcile::ReconcileConfig;
use store::TaskStore;

/// The Task module — orchestration and reconciliation engine.
///
/// Embed this in a server to get task submission with dedup, worker-facing
/// lifecycle transitions, the manual completion protocol, the reconciliation
/// watchdog and the lifecycle event stream.
pub struct TaskModule {
    engine: Arc<TaskEngine>,
    watchdog_cancel: CancellationToken,
}

impl TaskModule {
    /// Create the task module with default watchdog thresholds and start
    /// the background watchdog.
    pub fn new(
        db: Arc<dyn SQLStore>,
        queues: Arc<QueueSet>,
        billing: Arc<dyn BillingGateway>,
    ) -> Result<Self, atelier_core::ServiceError> {
        Self::with_config(db, queues, billing, ReconcileConfig::default())
    }

    /// Create with explicit watchdog configuration.
    pub fn with_config(
        db: Arc<dyn SQLStore>,
        queues: Arc<QueueSet>,
        billing: Arc<dyn BillingGateway>,
        config: ReconcileConfig,
    ) -> Result<Self, atelier_core::ServiceError> {
        let store = Arc::new(TaskStore::new(db)?);
        let engine = Arc::new(TaskEngine::new(store, queues, billing));
        let watchdog_cancel = watchdog::start(Arc::clone(&engine), config);

        Ok(Self {
            engine,
            watchdog_cancel,
        })
    }

    /// Get a reference to the TaskEngine for programmatic use.
    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// Stop the background watchdog.
    pub fn shutdown(&self) {
        self.watchdog_cancel.cancel();
    }
}

impl Module for TaskModule {
    fn name(&self) -> &str {
        "task"
    }

    fn routes(&self) -> Router {
        api::router(Arc::clone(&self.engine))
    }
}
