//! Controller worker pool.
//!
//! Feeds resource keys from change notifications and periodic resyncs into
//! the work queue, and runs a fixed number of workers that reconcile them.

use std::sync::Arc;
use std::time::Duration;

use keel_reconcile::BackoffPolicy;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::InstanceManagerController;
use crate::queue::WorkQueue;
use crate::store::ResourceChange;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Number of concurrent reconcile workers.
    pub workers: usize,

    /// Interval between full resyncs.
    pub resync_interval: Duration,

    /// Time allowed for workers and monitor sessions to finish on shutdown.
    pub shutdown_timeout: Duration,

    /// Requeue backoff for failed passes.
    pub backoff: BackoffPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: keel_reconcile::DEFAULT_RESYNC_INTERVAL,
            shutdown_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Runs the reconcile loop until shutdown.
pub struct ControllerWorker {
    controller: Arc<InstanceManagerController>,
    queue: Arc<WorkQueue>,
    settings: WorkerSettings,
}

impl ControllerWorker {
    pub fn new(controller: Arc<InstanceManagerController>, settings: WorkerSettings) -> Self {
        Self {
            controller,
            queue: WorkQueue::new(settings.backoff.clone()),
            settings,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Run until shutdown is signaled, then drain workers and monitors.
    #[instrument(skip(self, shutdown), fields(controller_id = %self.controller.controller_id()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.settings.workers,
            resync_interval_secs = self.settings.resync_interval.as_secs(),
            "Starting instance manager controller"
        );

        match self.controller.is_registered_node().await {
            Ok(true) => {}
            Ok(false) => warn!(
                controller_id = %self.controller.controller_id(),
                "Controller id is not a registered node; set KEEL_CONTROLLER_ID or NODE_NAME to the node name"
            ),
            Err(e) => warn!(error = %e, "Failed to check controller id against nodes"),
        }

        let handles: Vec<JoinHandle<()>> = (0..self.settings.workers)
            .map(|worker| {
                tokio::spawn(work_loop(
                    worker,
                    Arc::clone(&self.controller),
                    Arc::clone(&self.queue),
                ))
            })
            .collect();

        let mut changes = self.controller.subscribe();
        let mut changes_open = true;
        let mut resync = tokio::time::interval(self.settings.resync_interval);

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    self.resync().await;
                }
                change = changes.recv(), if changes_open => match change {
                    Ok(change) => self.on_change(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed change notifications, resyncing");
                        self.enqueue_all().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Change notifications closed, relying on resync");
                        changes_open = false;
                    }
                },
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Instance manager controller shutting down");
                        break;
                    }
                }
            }
        }

        self.queue.shutdown().await;

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Force aborting reconcile worker");
                handle.abort();
            }
        }

        self.controller.shutdown(self.settings.shutdown_timeout).await;
        info!("Instance manager controller stopped");
    }

    async fn on_change(&self, change: ResourceChange) {
        match change {
            // Pods share their instance manager's name.
            ResourceChange::InstanceManager(name) | ResourceChange::Pod(name) => {
                self.queue.add(&name).await;
            }
            ResourceChange::Node(_)
            | ResourceChange::EngineImage(_)
            | ResourceChange::Setting(_)
            | ResourceChange::Membership => {
                self.enqueue_all().await;
            }
        }
    }

    async fn enqueue_all(&self) -> usize {
        match self.controller.list_names().await {
            Ok(names) => {
                for name in &names {
                    self.queue.add(name).await;
                }
                names.len()
            }
            Err(e) => {
                error!(error = %e, "Failed to list instance managers");
                0
            }
        }
    }

    async fn resync(&self) {
        let queued = self.enqueue_all().await;
        debug!(queued, "Resync");

        match self.controller.cleanup_orphan_pods().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Cleaned up orphaned pods"),
            Err(e) => warn!(error = %e, "Orphaned pod cleanup failed"),
        }
    }
}

async fn work_loop(worker: usize, controller: Arc<InstanceManagerController>, queue: Arc<WorkQueue>) {
    while let Some(key) = queue.get().await {
        process(&controller, &queue, &key).await;
        queue.done(&key).await;
    }
    debug!(worker, "Reconcile worker exiting");
}

async fn process(controller: &InstanceManagerController, queue: &Arc<WorkQueue>, key: &str) {
    match controller.reconcile(key).await {
        Ok(action) => {
            queue.forget(key).await;
            if let Some(delay) = action.requeue_after {
                queue.add_after(key, delay);
            }
        }
        Err(e) if e.is_conflict() => {
            debug!(instance_manager = %key, "Status conflict, retrying with fresh read");
            queue.add_rate_limited(key).await;
        }
        Err(e) if e.is_gating() => {
            info!(instance_manager = %key, reason = %e, "Instance manager not deployable, requeueing");
            queue.add_rate_limited(key).await;
        }
        Err(e) => {
            let requeues = queue.num_requeues(key).await;
            warn!(instance_manager = %key, error = %e, requeues, "Reconcile failed");
            queue.add_rate_limited(key).await;
        }
    }
}
