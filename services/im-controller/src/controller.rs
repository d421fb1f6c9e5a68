//! Instance-manager reconciliation.
//!
//! One pass reads the resource fresh, decides who owns its node, converges
//! the backing Pod and writes status back with a version-checked update.
//! Rules are evaluated in order and the first that applies ends the pass:
//!
//! 1. Not responsible and not the recorded owner: release the local monitor
//! 2. Node down: `Unknown`, hand ownership to the responsible replica
//! 3. Deletion requested: remove the Pod, then the finalizer
//! 4. Image not ready or tolerations unparsable: requeue, state untouched
//! 5. Pod absent, exited, pending or running: derive state from the Pod
//!
//! Status is only written when it changed, so a pass over an unchanged world
//! performs no writes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_reconcile::{ClusterView, RetryTracker};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::ControllerError;
use crate::monitor::ProcessMonitor;
use crate::pod::{PodManager, PodObservation};
use crate::store::{ResourceChange, ResourceStore};
use crate::toleration::parse_tolerations;
use crate::types::{
    engine_image_name, EngineImageState, Event, InstanceManager, InstanceManagerState,
    InstanceManagerStatus, PodPhase, Toleration, FINALIZER, SETTING_TAINT_TOLERATION,
};

/// Outcome of a successful pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    /// Reconcile again after this delay even without a change notification.
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing to do until something changes.
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Identity of this replica.
    pub controller_id: String,

    /// Unhealthy time before a node counts as down.
    pub node_down_grace: Duration,

    /// Re-check interval for resources on a down node.
    pub node_down_requeue: Duration,

    /// Re-check interval while waiting for a Pod to go away.
    pub pod_wait_requeue: Duration,

    /// Pod failures tolerated inside `crash_loop_window` before a crash-loop
    /// warning is recorded.
    pub crash_loop_threshold: u32,

    pub crash_loop_window: Duration,
}

impl ControllerSettings {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
            node_down_grace: keel_reconcile::DEFAULT_NODE_DOWN_GRACE,
            node_down_requeue: Duration::from_secs(30),
            pod_wait_requeue: Duration::from_secs(5),
            crash_loop_threshold: keel_reconcile::DEFAULT_MAX_RETRIES,
            crash_loop_window: keel_reconcile::DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Drives instance-manager resources through their lifecycle.
pub struct InstanceManagerController {
    settings: ControllerSettings,
    store: Arc<dyn ResourceStore>,
    pods: PodManager,
    monitor: ProcessMonitor,
    pod_failures: Mutex<RetryTracker>,
}

impl InstanceManagerController {
    pub fn new(
        settings: ControllerSettings,
        store: Arc<dyn ResourceStore>,
        pods: PodManager,
        monitor: ProcessMonitor,
    ) -> Self {
        let pod_failures = RetryTracker::new(settings.crash_loop_threshold, settings.crash_loop_window);
        Self {
            settings,
            store,
            pods,
            monitor,
            pod_failures: Mutex::new(pod_failures),
        }
    }

    pub fn controller_id(&self) -> &str {
        &self.settings.controller_id
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.monitor
    }

    /// Change notifications from the resource store.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceChange> {
        self.store.subscribe()
    }

    /// Run one reconciliation pass for the named resource.
    #[instrument(skip(self), fields(controller_id = %self.settings.controller_id))]
    pub async fn reconcile(&self, name: &str) -> Result<Action, ControllerError> {
        let im = match self.store.get_instance_manager(name).await {
            Ok(im) => im,
            Err(e) if e.is_not_found() => {
                debug!("Instance manager gone");
                self.monitor.stop(name).await;
                self.pod_failures.lock().await.clear(name);
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let view = self.cluster_view().await?;
        let me = self.settings.controller_id.as_str();
        let node = im.spec.node_id.as_str();
        let responsible = view.responsible_replica(node);

        if responsible != Some(me) && im.status.owner_id != me {
            if self.monitor.stop(name).await {
                debug!(node = %node, owner = ?responsible, "Released monitor for instance manager owned elsewhere");
            }
            return Ok(Action::await_change());
        }

        if view.is_node_down(node) {
            let new_owner = responsible.unwrap_or(me);
            return self.handle_node_down(&im, new_owner).await;
        }

        if im.metadata.is_deleting() {
            return self.handle_deletion(&im).await;
        }

        let mut status = im.status.clone();
        status.owner_id = me.to_string();

        let tolerations = match self.check_deployable(&im).await {
            Ok(tolerations) => tolerations,
            Err(e) if e.is_gating() => {
                warn!(error = %e, "Instance manager cannot be deployed yet");
                let reason = match e {
                    ControllerError::ImageNotReady { .. } => "ImageNotReady",
                    _ => "InvalidToleration",
                };
                self.record(Event::warning(name, reason, e.to_string())).await;
                self.persist_status(&im, status).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let observed = self.pods.ensure_pod(&im, tolerations).await?;
        self.converge(&im, status, observed).await
    }

    async fn converge(
        &self,
        im: &InstanceManager,
        mut status: InstanceManagerStatus,
        observed: PodObservation,
    ) -> Result<Action, ControllerError> {
        let name = im.name();

        if observed.created {
            self.monitor.stop(name).await;
            status.transition(InstanceManagerState::Starting);
            self.persist_status(im, status).await?;
            return Ok(Action::await_change());
        }

        if observed.terminating {
            self.monitor.stop(name).await;
            status.transition(InstanceManagerState::Starting);
            self.persist_status(im, status).await?;
            return Ok(Action::requeue(self.settings.pod_wait_requeue));
        }

        if observed.phase.has_exited() {
            self.monitor.stop(name).await;
            self.pods.delete_pod(name).await?;
            self.note_pod_failure(im, observed.phase).await;
            status.transition(InstanceManagerState::Starting);
            self.persist_status(im, status).await?;
            return Ok(Action::await_change());
        }

        match (observed.phase, observed.ip) {
            (PodPhase::Running, Some(ip)) => {
                let was_running = im.status.current_state == InstanceManagerState::Running;
                let mut watched = self.monitor.session_ip(name).await;
                if watched.as_deref().is_some_and(|watched| watched != ip) {
                    self.monitor.stop(name).await;
                    watched = None;
                }

                status.mark_running(&ip);
                // Nothing is mirroring the process table until a session starts.
                if watched.is_none() {
                    status.instances.clear();
                }
                self.persist_status(im, status).await?;
                self.pod_failures.lock().await.clear(name);

                if !was_running {
                    info!(instance_manager = %name, ip = %ip, "Instance manager running");
                    self.record(Event::normal(name, "Running", format!("process manager running at {ip}")))
                        .await;
                }

                self.monitor.start(name, &ip).await;
                Ok(Action::await_change())
            }
            _ => {
                self.monitor.stop(name).await;
                status.transition(InstanceManagerState::Starting);
                self.persist_status(im, status).await?;
                Ok(Action::await_change())
            }
        }
    }

    async fn handle_node_down(&self, im: &InstanceManager, new_owner: &str) -> Result<Action, ControllerError> {
        let name = im.name();
        self.monitor.stop(name).await;

        let mut status = im.status.clone();
        status.transition(InstanceManagerState::Unknown);
        status.owner_id = new_owner.to_string();

        if im.status.current_state != InstanceManagerState::Unknown {
            warn!(
                instance_manager = %name,
                node = %im.spec.node_id,
                new_owner = %new_owner,
                "Node is down, instance manager state unknown"
            );
            self.record(Event::warning(
                name,
                "NodeDown",
                format!("node {} is down", im.spec.node_id),
            ))
            .await;
        }

        self.persist_status(im, status).await?;
        Ok(Action::requeue(self.settings.node_down_requeue))
    }

    async fn handle_deletion(&self, im: &InstanceManager) -> Result<Action, ControllerError> {
        let name = im.name();
        self.monitor.stop(name).await;

        if self.pods.delete_pod(name).await? {
            debug!(instance_manager = %name, "Waiting for pod removal before releasing finalizer");
            return Ok(Action::requeue(self.settings.pod_wait_requeue));
        }

        if im.metadata.has_finalizer(FINALIZER) {
            self.store.remove_instance_manager_finalizer(im).await?;
            info!(instance_manager = %name, "Released instance manager finalizer");
        }
        self.pod_failures.lock().await.clear(name);
        Ok(Action::await_change())
    }

    /// Tolerations to deploy with, or the reason the resource cannot be deployed.
    async fn check_deployable(&self, im: &InstanceManager) -> Result<Vec<Toleration>, ControllerError> {
        let image_not_ready = || ControllerError::ImageNotReady {
            image: im.spec.image.clone(),
        };

        match self.store.get_engine_image(&engine_image_name(&im.spec.image)).await {
            Ok(image) if image.state == EngineImageState::Ready => {}
            Ok(_) => return Err(image_not_ready()),
            Err(e) if e.is_not_found() => return Err(image_not_ready()),
            Err(e) => return Err(e.into()),
        }

        let setting = match self.store.get_setting(SETTING_TAINT_TOLERATION).await {
            Ok(setting) => setting.value,
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(parse_tolerations(&setting)?)
    }

    async fn note_pod_failure(&self, im: &InstanceManager, phase: PodPhase) {
        let name = im.name();
        let exhausted = self.pod_failures.lock().await.record_failure(name);

        warn!(instance_manager = %name, phase = ?phase, "Instance manager pod exited, recreating");
        self.record(Event::warning(name, "PodFailed", format!("pod exited with phase {phase:?}")))
            .await;

        if exhausted {
            warn!(instance_manager = %name, "Instance manager pod is crash looping");
            self.record(Event::warning(
                name,
                "CrashLoop",
                format!(
                    "pod exited more than {} times within {}s",
                    self.settings.crash_loop_threshold,
                    self.settings.crash_loop_window.as_secs()
                ),
            ))
            .await;
        }
    }

    /// Write `status` if it differs from what `im` carries.
    async fn persist_status(
        &self,
        im: &InstanceManager,
        status: InstanceManagerStatus,
    ) -> Result<(), ControllerError> {
        if im.status == status {
            return Ok(());
        }

        let mut updated = im.clone();
        updated.status = status;
        self.store.update_instance_manager_status(&updated).await?;
        debug!(
            instance_manager = %im.name(),
            from = %im.status.current_state,
            to = %updated.status.current_state,
            owner = %updated.status.owner_id,
            "Persisted instance manager status"
        );
        Ok(())
    }

    async fn record(&self, event: Event) {
        if let Err(e) = self.store.record_event(event).await {
            warn!(error = %e, "Failed to record event");
        }
    }

    async fn cluster_view(&self) -> Result<ClusterView, ControllerError> {
        let nodes = self.store.list_nodes().await?;
        let replicas = self.store.list_controller_replicas().await?;
        Ok(ClusterView::new(
            nodes.iter().map(|n| n.health()),
            replicas,
            self.settings.node_down_grace,
            Utc::now(),
        ))
    }

    /// Whether this replica's id names a registered node. A replica that is
    /// not co-located with any node is only ever picked by hashing.
    pub async fn is_registered_node(&self) -> Result<bool, ControllerError> {
        let nodes = self.store.list_nodes().await?;
        Ok(nodes.iter().any(|n| n.metadata.name == self.settings.controller_id))
    }

    /// Names of every instance manager, for resync.
    pub async fn list_names(&self) -> Result<Vec<String>, ControllerError> {
        Ok(self
            .store
            .list_instance_managers()
            .await?
            .into_iter()
            .map(|im| im.metadata.name)
            .collect())
    }

    /// Delete instance-manager Pods on nodes this replica owns whose resource
    /// no longer exists. Also drops expired crash-loop counters.
    pub async fn cleanup_orphan_pods(&self) -> Result<usize, ControllerError> {
        self.pod_failures.lock().await.prune();

        // Pods first: a resource created after this point cannot lose its Pod.
        let pods = self.pods.list_managed().await?;
        let known: HashSet<String> = self.list_names().await?.into_iter().collect();
        let view = self.cluster_view().await?;

        let mut removed = 0;
        for pod in pods.iter().filter(|p| !known.contains(p.name())) {
            if !view.is_responsible(&self.settings.controller_id, &pod.spec.node_name) {
                continue;
            }
            if self.pods.delete_pod(pod.name()).await? {
                info!(pod = %pod.name(), "Removed orphaned instance manager pod");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stop every monitor session.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.monitor.stop_all(drain_timeout).await;
    }
}
