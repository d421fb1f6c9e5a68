//! Resource types read and written by the controller.
//!
//! These mirror the objects held by the cluster resource store: the
//! instance-manager resource itself, the Pods that host the process-manager
//! daemon, and the collaborator objects consulted while reconciling (engine
//! images, settings, node health, recorded events).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use keel_reconcile::NodeHealth;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const LABEL_COMPONENT: &str = "keel.io/component";
pub const LABEL_NODE: &str = "keel.io/node";
pub const LABEL_ENGINE_IMAGE: &str = "keel.io/engine-image";
pub const LABEL_INSTANCE_MANAGER_TYPE: &str = "keel.io/instance-manager-type";

pub const COMPONENT_INSTANCE_MANAGER: &str = "instance-manager";

/// Finalizer that keeps an instance-manager resource alive until its Pod is gone.
pub const FINALIZER: &str = "keel.io";

/// Name of the setting holding the taint-toleration list.
pub const SETTING_TAINT_TOLERATION: &str = "taint-toleration";

// =============================================================================
// Metadata
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Bumped by the store on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set once deletion has been requested.
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

// =============================================================================
// Instance manager
// =============================================================================

/// Which kind of process manager a resource hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceManagerType {
    Engine,
    Replica,
}

impl InstanceManagerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Replica => "replica",
        }
    }

    /// Container name, which is also the process-manager binary it runs.
    pub fn manager_binary(&self) -> &'static str {
        match self {
            Self::Engine => "engine-manager",
            Self::Replica => "replica-manager",
        }
    }

    fn short(&self) -> char {
        match self {
            Self::Engine => 'e',
            Self::Replica => 'r',
        }
    }
}

impl fmt::Display for InstanceManagerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed lifecycle state of an instance manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceManagerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
    Unknown,
}

impl fmt::Display for InstanceManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceManagerSpec {
    /// Node the process manager must run on.
    pub node_id: String,
    #[serde(rename = "type")]
    pub im_type: InstanceManagerType,
    /// Engine image the Pod runs.
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceManagerStatus {
    /// Controller replica currently responsible for this resource.
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub current_state: InstanceManagerState,
    /// Pod address; only meaningful while running.
    #[serde(default)]
    pub ip: String,
    /// Last process snapshot published by the monitor, keyed by process name.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceProcess>,
}

impl InstanceManagerStatus {
    /// Move to a non-running state, dropping the address and process snapshot.
    pub fn transition(&mut self, state: InstanceManagerState) {
        self.current_state = state;
        if state != InstanceManagerState::Running {
            self.ip.clear();
            self.instances.clear();
        }
    }

    /// Move to running at `ip`. The process snapshot is kept when the address
    /// is unchanged and dropped otherwise.
    pub fn mark_running(&mut self, ip: &str) {
        if self.ip != ip {
            self.instances.clear();
            self.ip = ip.to_string();
        }
        self.current_state = InstanceManagerState::Running;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceManager {
    pub metadata: ObjectMeta,
    pub spec: InstanceManagerSpec,
    #[serde(default)]
    pub status: InstanceManagerStatus,
}

impl InstanceManager {
    /// Build a new resource with its deterministic name, labels and finalizer.
    pub fn new(
        namespace: impl Into<String>,
        node_id: impl Into<String>,
        image: impl Into<String>,
        im_type: InstanceManagerType,
    ) -> Self {
        let node_id = node_id.into();
        let image = image.into();

        let mut metadata = ObjectMeta::new(Self::generate_name(&node_id, &image, im_type), namespace);
        metadata.labels = Self::labels(&node_id, &image, im_type);
        metadata.finalizers.push(FINALIZER.to_string());

        Self {
            metadata,
            spec: InstanceManagerSpec {
                node_id,
                im_type,
                image,
            },
            status: InstanceManagerStatus::default(),
        }
    }

    /// `instance-manager-{e|r}-<hash>`, stable for a node and image pair.
    pub fn generate_name(node_id: &str, image: &str, im_type: InstanceManagerType) -> String {
        format!(
            "instance-manager-{}-{}",
            im_type.short(),
            short_hash(&[node_id, image])
        )
    }

    /// Labels shared by the resource and its Pod.
    pub fn labels(node_id: &str, image: &str, im_type: InstanceManagerType) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_COMPONENT.to_string(), COMPONENT_INSTANCE_MANAGER.to_string()),
            (LABEL_NODE.to_string(), node_id.to_string()),
            (LABEL_ENGINE_IMAGE.to_string(), engine_image_name(image)),
            (LABEL_INSTANCE_MANAGER_TYPE.to_string(), im_type.as_str().to_string()),
        ])
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Name of the engine-image resource tracking `image`.
pub fn engine_image_name(image: &str) -> String {
    format!("ei-{}", short_hash(&[image]))
}

fn short_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

// =============================================================================
// Instance processes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl InstanceProcessState {
    /// Parse the state string reported by a process manager.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One process hosted by a process manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProcess {
    pub name: String,
    pub state: InstanceProcessState,
    #[serde(default)]
    pub port_start: i32,
    #[serde(default)]
    pub port_end: i32,
    #[serde(default)]
    pub error_msg: String,
}

// =============================================================================
// Pods
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// The container has exited and will not come back on its own.
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TolerationOperator {
    Equal,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Node the Pod is pinned to.
    pub node_name: String,
    pub service_account_name: String,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    pub containers: Vec<Container>,
    /// Always `Never`; restarts are driven by the controller.
    pub restart_policy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub pod_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.is_deleting()
    }

    /// Address of a running Pod, if it has one.
    pub fn running_ip(&self) -> Option<&str> {
        if self.status.phase == PodPhase::Running && !self.status.pod_ip.is_empty() {
            Some(&self.status.pod_ip)
        } else {
            None
        }
    }
}

// =============================================================================
// Collaborator objects
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineImageState {
    #[default]
    Deploying,
    Ready,
    Incompatible,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineImage {
    pub metadata: ObjectMeta,
    pub image: String,
    #[serde(default)]
    pub state: EngineImageState,
}

impl EngineImage {
    pub fn new(namespace: impl Into<String>, image: impl Into<String>, state: EngineImageState) -> Self {
        let image = image.into();
        Self {
            metadata: ObjectMeta::new(engine_image_name(&image), namespace),
            image,
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub value: String,
}

impl Setting {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConditions {
    pub ready: bool,
    pub reachable: bool,
    pub last_transition: DateTime<Utc>,
}

/// Cluster node as seen by the node-health collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub conditions: NodeConditions,
}

impl Node {
    pub fn healthy(namespace: impl Into<String>, name: impl Into<String>, since: DateTime<Utc>) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            conditions: NodeConditions {
                ready: true,
                reachable: true,
                last_transition: since,
            },
        }
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth {
            name: self.metadata.name.clone(),
            ready: self.conditions.ready,
            reachable: self.conditions.reachable,
            last_transition: self.conditions.last_transition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Operator-visible record of something the controller did or observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub involved_object: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    /// Times this event was recorded; repeats update message and timestamp.
    #[serde(default = "one")]
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

fn one() -> u32 {
    1
}

impl Event {
    pub fn warning(object: &str, reason: &str, message: impl Into<String>) -> Self {
        Self::new(object, EventKind::Warning, reason, message)
    }

    pub fn normal(object: &str, reason: &str, message: impl Into<String>) -> Self {
        Self::new(object, EventKind::Normal, reason, message)
    }

    fn new(object: &str, kind: EventKind, reason: &str, message: impl Into<String>) -> Self {
        Self {
            involved_object: object.to_string(),
            kind,
            reason: reason.to_string(),
            message: message.into(),
            count: 1,
            timestamp: Utc::now(),
        }
    }
}
