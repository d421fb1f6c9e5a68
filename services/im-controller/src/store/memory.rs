//! In-memory resource store.
//!
//! Used by the standalone binary and by tests. Every write bumps a
//! store-wide resource version, as an API server would.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{ResourceChange, ResourceStore, StoreResult};
use crate::error::StoreError;
use crate::types::{
    EngineImage, Event, InstanceManager, Node, Pod, PodPhase, Setting, FINALIZER,
};

const KIND_INSTANCE_MANAGER: &str = "InstanceManager";
const KIND_POD: &str = "Pod";
const KIND_ENGINE_IMAGE: &str = "EngineImage";
const KIND_SETTING: &str = "Setting";

/// Distinct events retained; the oldest are dropped first.
const MAX_EVENTS: usize = 1000;

/// Number of writes the store has accepted, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub status_updates: u64,
    pub pod_creates: u64,
    pub pod_deletes: u64,
}

#[derive(Default)]
struct StoreState {
    instance_managers: BTreeMap<String, InstanceManager>,
    pods: BTreeMap<String, Pod>,
    nodes: BTreeMap<String, Node>,
    engine_images: BTreeMap<String, EngineImage>,
    settings: BTreeMap<String, Setting>,
    replicas: BTreeSet<String>,
    events: VecDeque<Event>,
    last_version: u64,
    counts: WriteCounts,
    /// Status writes that will fail with a conflict before any succeeds.
    injected_conflicts: u32,
    /// Status writes that will fail as unavailable before any succeeds.
    injected_outages: u32,
    /// Non-forced Pod deletes only mark the Pod terminating.
    graceful_pod_deletion: bool,
}

impl StoreState {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

/// In-memory [`ResourceStore`].
pub struct MemoryStore {
    namespace: String,
    state: RwLock<StoreState>,
    changes: broadcast::Sender<ResourceChange>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            namespace: namespace.into(),
            state: RwLock::new(StoreState::default()),
            changes,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn notify(&self, change: ResourceChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    // -------------------------------------------------------------------------
    // Administrative writes
    // -------------------------------------------------------------------------

    pub async fn create_instance_manager(&self, mut im: InstanceManager) -> StoreResult<InstanceManager> {
        let mut state = self.state.write().await;
        if state.instance_managers.contains_key(im.name()) {
            return Err(StoreError::AlreadyExists {
                kind: KIND_INSTANCE_MANAGER,
                name: im.name().to_string(),
            });
        }

        im.metadata.namespace = self.namespace.clone();
        im.metadata.resource_version = state.next_version();
        im.metadata.creation_timestamp = Some(Utc::now());
        state.instance_managers.insert(im.name().to_string(), im.clone());
        drop(state);

        self.notify(ResourceChange::InstanceManager(im.name().to_string()));
        Ok(im)
    }

    /// Mark an instance manager for deletion. Without finalizers it is removed
    /// immediately.
    pub async fn delete_instance_manager(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let im = state
            .instance_managers
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(KIND_INSTANCE_MANAGER, name))?;

        if im.metadata.finalizers.is_empty() {
            state.instance_managers.remove(name);
        } else if im.metadata.deletion_timestamp.is_none() {
            im.metadata.deletion_timestamp = Some(Utc::now());
            im.metadata.resource_version = version;
        }
        drop(state);

        self.notify(ResourceChange::InstanceManager(name.to_string()));
        Ok(())
    }

    pub async fn put_node(&self, mut node: Node) {
        let mut state = self.state.write().await;
        node.metadata.resource_version = state.next_version();
        let name = node.metadata.name.clone();
        state.nodes.insert(name.clone(), node);
        drop(state);
        self.notify(ResourceChange::Node(name));
    }

    pub async fn remove_node(&self, name: &str) {
        self.state.write().await.nodes.remove(name);
        self.notify(ResourceChange::Node(name.to_string()));
    }

    pub async fn set_controller_replicas<I, S>(&self, replicas: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.write().await.replicas = replicas.into_iter().map(Into::into).collect();
        self.notify(ResourceChange::Membership);
    }

    pub async fn put_engine_image(&self, mut image: EngineImage) {
        let mut state = self.state.write().await;
        image.metadata.resource_version = state.next_version();
        let name = image.metadata.name.clone();
        state.engine_images.insert(name.clone(), image);
        drop(state);
        self.notify(ResourceChange::EngineImage(name));
    }

    pub async fn put_setting(&self, mut setting: Setting) {
        let mut state = self.state.write().await;
        setting.metadata.resource_version = state.next_version();
        let name = setting.metadata.name.clone();
        state.settings.insert(name.clone(), setting);
        drop(state);
        self.notify(ResourceChange::Setting(name));
    }

    /// Record what the container platform observed for a Pod.
    pub async fn set_pod_status(&self, name: &str, phase: PodPhase, ip: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(KIND_POD, name))?;
        pod.status.phase = phase;
        pod.status.pod_ip = ip.to_string();
        pod.metadata.resource_version = version;
        drop(state);

        self.notify(ResourceChange::Pod(name.to_string()));
        Ok(())
    }

    /// Mark a Pod as terminating since `since`.
    pub async fn set_pod_terminating(&self, name: &str, since: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(KIND_POD, name))?;
        pod.metadata.deletion_timestamp = Some(since);
        pod.metadata.resource_version = version;
        drop(state);

        self.notify(ResourceChange::Pod(name.to_string()));
        Ok(())
    }

    /// Make the next `count` status writes fail as if the store were down.
    pub async fn inject_status_outages(&self, count: u32) {
        self.state.write().await.injected_outages = count;
    }

    pub async fn set_graceful_pod_deletion(&self, graceful: bool) {
        self.state.write().await.graceful_pod_deletion = graceful;
    }

    /// Make the next `count` status writes fail as if another writer won.
    pub async fn inject_status_conflicts(&self, count: u32) {
        self.state.write().await.injected_conflicts = count;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub async fn instance_manager(&self, name: &str) -> Option<InstanceManager> {
        self.state.read().await.instance_managers.get(name).cloned()
    }

    pub async fn pod(&self, name: &str) -> Option<Pod> {
        self.state.read().await.pods.get(name).cloned()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.read().await.events.iter().cloned().collect()
    }

    pub async fn write_counts(&self) -> WriteCounts {
        self.state.read().await.counts
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_instance_manager(&self, name: &str) -> StoreResult<InstanceManager> {
        self.state
            .read()
            .await
            .instance_managers
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(KIND_INSTANCE_MANAGER, name))
    }

    async fn list_instance_managers(&self) -> StoreResult<Vec<InstanceManager>> {
        Ok(self.state.read().await.instance_managers.values().cloned().collect())
    }

    async fn update_instance_manager_status(&self, im: &InstanceManager) -> StoreResult<InstanceManager> {
        let mut state = self.state.write().await;

        if state.injected_outages > 0 {
            state.injected_outages -= 1;
            return Err(StoreError::Unavailable(format!(
                "status write for {} rejected",
                im.name()
            )));
        }

        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            let version = state.next_version();
            if let Some(stored) = state.instance_managers.get_mut(im.name()) {
                stored.metadata.resource_version = version;
            }
        }

        let version = state.last_version + 1;
        let stored = state
            .instance_managers
            .get_mut(im.name())
            .ok_or_else(|| StoreError::not_found(KIND_INSTANCE_MANAGER, im.name()))?;

        if stored.metadata.resource_version != im.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: KIND_INSTANCE_MANAGER,
                name: im.name().to_string(),
                expected: im.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }

        stored.status = im.status.clone();
        stored.metadata.resource_version = version;
        let updated = stored.clone();
        state.last_version = version;
        state.counts.status_updates += 1;
        drop(state);

        debug!(
            instance_manager = %updated.name(),
            state = %updated.status.current_state,
            version,
            "status updated"
        );
        self.notify(ResourceChange::InstanceManager(updated.name().to_string()));
        Ok(updated)
    }

    async fn remove_instance_manager_finalizer(&self, im: &InstanceManager) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let version = state.last_version + 1;
        let stored = state
            .instance_managers
            .get_mut(im.name())
            .ok_or_else(|| StoreError::not_found(KIND_INSTANCE_MANAGER, im.name()))?;

        if stored.metadata.resource_version != im.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: KIND_INSTANCE_MANAGER,
                name: im.name().to_string(),
                expected: im.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }

        stored.metadata.finalizers.retain(|f| f != FINALIZER);
        stored.metadata.resource_version = version;
        let gone = stored.metadata.is_deleting() && stored.metadata.finalizers.is_empty();
        state.last_version = version;
        if gone {
            state.instance_managers.remove(im.name());
        }
        drop(state);

        self.notify(ResourceChange::InstanceManager(im.name().to_string()));
        Ok(())
    }

    async fn get_engine_image(&self, name: &str) -> StoreResult<EngineImage> {
        self.state
            .read()
            .await
            .engine_images
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(KIND_ENGINE_IMAGE, name))
    }

    async fn get_setting(&self, name: &str) -> StoreResult<Setting> {
        self.state
            .read()
            .await
            .settings
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(KIND_SETTING, name))
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn list_controller_replicas(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.read().await.replicas.iter().cloned().collect())
    }

    async fn get_pod(&self, name: &str) -> StoreResult<Pod> {
        self.state
            .read()
            .await
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(KIND_POD, name))
    }

    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Pod>> {
        Ok(self
            .state
            .read()
            .await
            .pods
            .values()
            .filter(|pod| {
                selector
                    .iter()
                    .all(|(k, v)| pod.metadata.labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn create_pod(&self, mut pod: Pod) -> StoreResult<Pod> {
        let mut state = self.state.write().await;
        if state.pods.contains_key(pod.name()) {
            return Err(StoreError::AlreadyExists {
                kind: KIND_POD,
                name: pod.name().to_string(),
            });
        }

        pod.metadata.namespace = self.namespace.clone();
        pod.metadata.resource_version = state.next_version();
        pod.metadata.creation_timestamp = Some(Utc::now());
        pod.metadata.deletion_timestamp = None;
        pod.status = Default::default();
        state.pods.insert(pod.name().to_string(), pod.clone());
        state.counts.pod_creates += 1;
        drop(state);

        self.notify(ResourceChange::Pod(pod.name().to_string()));
        Ok(pod)
    }

    async fn delete_pod(&self, name: &str, force: bool) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let graceful = state.graceful_pod_deletion && !force;
        let version = state.next_version();
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(KIND_POD, name))?;

        if graceful {
            if pod.metadata.deletion_timestamp.is_none() {
                pod.metadata.deletion_timestamp = Some(Utc::now());
                pod.metadata.resource_version = version;
            }
        } else {
            state.pods.remove(name);
        }
        state.counts.pod_deletes += 1;
        drop(state);

        self.notify(ResourceChange::Pod(name.to_string()));
        Ok(())
    }

    /// Repeats of an (object, kind, reason) triple are folded into the
    /// existing event, as an API server aggregates them.
    async fn record_event(&self, event: Event) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let existing = state.events.iter_mut().find(|e| {
            e.involved_object == event.involved_object && e.kind == event.kind && e.reason == event.reason
        });

        match existing {
            Some(existing) => {
                existing.count += 1;
                existing.message = event.message;
                existing.timestamp = event.timestamp;
            }
            None => {
                if state.events.len() >= MAX_EVENTS {
                    state.events.pop_front();
                }
                state.events.push_back(event);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceChange> {
        self.changes.subscribe()
    }
}
