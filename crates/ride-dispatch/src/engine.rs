//! Wiring and lifecycle for the dispatch runtime.
//!
//! ```ignore
//! let engine = DispatchEngine::builder(stores, geo)
//!     .with_config(DispatchConfig::from_env()?)
//!     .with_queue(Arc::new(PgPropagationQueue::new(pool, backoff)))
//!     .build()?;
//!
//! let handle = engine.start();
//! let ride = handle.service().request_ride(&caller, request).await?;
//! // ...
//! handle.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collab::GeoIndex;
use crate::config::DispatchConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::queue::{MemoryPropagationQueue, PropagationQueue};
use crate::service::DispatchService;
use crate::store::RideStores;
use crate::sweeper::ReconciliationSweeper;
use crate::sync::Synchronizer;
use crate::worker::SyncWorker;

pub struct DispatchEngineBuilder {
    stores: RideStores,
    geo: Arc<dyn GeoIndex>,
    config: DispatchConfig,
    queue: Option<Arc<dyn PropagationQueue>>,
    bus: Option<EventBus>,
}

impl DispatchEngineBuilder {
    #[must_use]
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a durable queue for pending propagations.
    ///
    /// Without one, an in-memory queue is used and pending retries do not
    /// survive a restart (the sweeper still repairs them within its window).
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn PropagationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<DispatchEngine> {
        self.config.validate()?;

        let queue = self.queue.unwrap_or_else(|| {
            warn!("no durable propagation queue configured; using in-memory queue");
            Arc::new(MemoryPropagationQueue::new(self.config.backoff))
        });
        let bus = self.bus.unwrap_or_default();
        let store_timeout = self.config.store_timeout();

        let sync = Arc::new(Synchronizer::new(
            self.stores.clone(),
            queue,
            bus.clone(),
            self.config.backoff,
            store_timeout,
        ));
        let worker = Arc::new(SyncWorker::new(Arc::clone(&sync), self.config.worker.clone()));
        let sweeper = Arc::new(ReconciliationSweeper::new(
            self.stores.clone(),
            Arc::clone(&sync),
            self.config.sweeper.clone(),
            store_timeout,
        ));
        let service = Arc::new(DispatchService::new(
            self.stores,
            self.geo,
            sync,
            bus,
            self.config,
        ));

        Ok(DispatchEngine {
            service,
            worker,
            sweeper,
        })
    }
}

/// A built, not yet running, dispatch runtime.
pub struct DispatchEngine {
    service: Arc<DispatchService>,
    worker: Arc<SyncWorker>,
    sweeper: Arc<ReconciliationSweeper>,
}

impl DispatchEngine {
    pub fn builder(stores: RideStores, geo: Arc<dyn GeoIndex>) -> DispatchEngineBuilder {
        DispatchEngineBuilder {
            stores,
            geo,
            config: DispatchConfig::default(),
            queue: None,
            bus: None,
        }
    }

    pub fn service(&self) -> &Arc<DispatchService> {
        &self.service
    }

    /// Spawn the retry worker and the reconciliation sweeper.
    pub fn start(self) -> DispatchHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Arc::clone(&self.worker);
        let worker_rx = shutdown_rx.clone();
        let worker_task = tokio::spawn(async move { worker.run(worker_rx).await });

        let sweeper = Arc::clone(&self.sweeper);
        let sweeper_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

        info!(worker_id = %self.worker.worker_id(), "dispatch engine started");

        DispatchHandle {
            service: self.service,
            worker: self.worker,
            sweeper: self.sweeper,
            shutdown_tx,
            tasks: vec![worker_task, sweeper_task],
        }
    }
}

/// Handle to a running dispatch runtime.
pub struct DispatchHandle {
    service: Arc<DispatchService>,
    worker: Arc<SyncWorker>,
    sweeper: Arc<ReconciliationSweeper>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatchHandle {
    pub fn service(&self) -> &Arc<DispatchService> {
        &self.service
    }

    /// For operator-triggered retries outside the poll loop.
    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    /// For operator-triggered sweeps outside the interval.
    pub fn sweeper(&self) -> &Arc<ReconciliationSweeper> {
        &self.sweeper
    }

    /// Stop background tasks and wait for them to finish their current pass.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "dispatch background task ended abnormally");
            }
        }
        info!("dispatch engine stopped");
    }
}
