//! keel instance-manager controller.
//!
//! Keeps one process-manager Pod per instance-manager resource running on
//! its node and mirrors the processes it hosts into the resource status.
//!
//! ## Architecture
//!
//! - **Controller**: per-resource state machine (`Stopped`, `Starting`,
//!   `Running`, `Error`, `Unknown`) driven by Pod phase and node health
//! - **Ownership**: which controller replica acts on which node, from
//!   `keel_reconcile::ClusterView`
//! - **Pod manager**: builds, creates and deletes the hosting Pods
//! - **Process monitor**: one watch session per running resource
//! - **Worker**: keyed work queue feeding a pool of reconcile workers

pub mod config;
pub mod controller;
pub mod error;
pub mod monitor;
pub mod pod;
pub mod queue;
pub mod store;
pub mod toleration;
pub mod types;
pub mod worker;

pub use controller::{Action, ControllerSettings, InstanceManagerController};
pub use error::{ConfigError, ControllerError, MonitorError, StoreError, TolerationError};
pub use monitor::{GrpcProcessWatcher, MonitorSettings, ProcessMonitor, ProcessWatcher};
pub use pod::{PodManager, PodTemplate};
pub use store::{MemoryStore, ResourceStore};
pub use worker::{ControllerWorker, WorkerSettings};
