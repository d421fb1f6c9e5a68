//! Process-manager RPC client.
//!
//! Every instance-manager Pod hosts a process manager that supervises the
//! engine or replica worker processes running inside it. The controller only
//! needs the client half: a unary `ProcessList` for full snapshots and the
//! server-streaming `ProcessWatch` notification feed.

pub mod imrpc {
    // The service is declared without a package, so prost emits `_.rs`.
    tonic::include_proto!("_");

    pub use process_manager_service_client::ProcessManagerServiceClient;
}

/// Port the process manager listens on inside the instance-manager Pod.
pub const DEFAULT_PROCESS_MANAGER_PORT: u16 = 8500;
