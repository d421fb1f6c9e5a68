//! Cluster resource store interface.
//!
//! The controller never talks to the cluster directly. Everything it reads or
//! writes goes through [`ResourceStore`], scoped to the controller namespace.
//! Writes to instance-manager resources are version-checked: a stale
//! `resource_version` yields [`StoreError::Conflict`] and the caller re-reads.

mod memory;

pub use memory::{MemoryStore, WriteCounts};

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::types::{EngineImage, Event, InstanceManager, Node, Pod, Setting};

pub type StoreResult<T> = Result<T, StoreError>;

/// Notification that a stored object changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceChange {
    InstanceManager(String),
    Pod(String),
    Node(String),
    EngineImage(String),
    Setting(String),
    Membership,
}

/// Resource store interface.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_instance_manager(&self, name: &str) -> StoreResult<InstanceManager>;

    async fn list_instance_managers(&self) -> StoreResult<Vec<InstanceManager>>;

    /// Write the status of `im`, failing with a conflict if the stored
    /// version differs from `im.metadata.resource_version`.
    async fn update_instance_manager_status(&self, im: &InstanceManager) -> StoreResult<InstanceManager>;

    /// Drop the controller finalizer, version-checked like a status write.
    /// A resource pending deletion disappears once no finalizers remain.
    async fn remove_instance_manager_finalizer(&self, im: &InstanceManager) -> StoreResult<()>;

    async fn get_engine_image(&self, name: &str) -> StoreResult<EngineImage>;

    async fn get_setting(&self, name: &str) -> StoreResult<Setting>;

    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;

    /// IDs of the registered controller replicas.
    async fn list_controller_replicas(&self) -> StoreResult<Vec<String>>;

    async fn get_pod(&self, name: &str) -> StoreResult<Pod>;

    /// Pods carrying every label in `selector`.
    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Pod>>;

    async fn create_pod(&self, pod: Pod) -> StoreResult<Pod>;

    /// Request Pod deletion. A forced delete skips graceful termination.
    async fn delete_pod(&self, name: &str, force: bool) -> StoreResult<()>;

    async fn record_event(&self, event: Event) -> StoreResult<()>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ResourceChange>;
}
