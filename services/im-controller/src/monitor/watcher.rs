//! Process-manager watch transport.
//!
//! A [`ProcessWatcher`] opens a stream of full process snapshots against a
//! process-manager endpoint. The gRPC implementation emits the current
//! process list first, then a fresh list after every watch notification.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{future, stream, StreamExt};
use keel_proto::imrpc::{ProcessListRequest, ProcessManagerServiceClient, ProcessResponse};
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::debug;

use crate::error::MonitorError;
use crate::types::{InstanceProcess, InstanceProcessState};

/// Every process a manager hosts, keyed by process name.
pub type ProcessSnapshot = BTreeMap<String, InstanceProcess>;

pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<ProcessSnapshot, MonitorError>> + Send>>;

/// Opens snapshot streams against process managers.
#[async_trait]
pub trait ProcessWatcher: Send + Sync {
    /// Watch the process manager at `endpoint` (`host:port`). The first item
    /// is the complete current snapshot.
    async fn watch(&self, endpoint: &str) -> Result<SnapshotStream, MonitorError>;
}

/// gRPC [`ProcessWatcher`] backed by the process-manager service.
#[derive(Debug, Clone)]
pub struct GrpcProcessWatcher {
    connect_timeout: Duration,
}

impl GrpcProcessWatcher {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for GrpcProcessWatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ProcessWatcher for GrpcProcessWatcher {
    async fn watch(&self, endpoint: &str) -> Result<SnapshotStream, MonitorError> {
        let uri = format!("http://{endpoint}");
        let connect_error = |source: tonic::transport::Error| MonitorError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        let channel = Endpoint::from_shared(uri)
            .map_err(connect_error)?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .map_err(connect_error)?;
        let mut client = ProcessManagerServiceClient::new(channel);

        // Subscribe before listing so no change falls between the two.
        let notifications = client.process_watch(()).await?.into_inner();
        let initial = list_processes(&mut client).await?;
        debug!(endpoint = %endpoint, processes = initial.len(), "Process watch established");

        let updates = stream::unfold((client, notifications), next_snapshot);
        Ok(stream::once(future::ready(Ok(initial))).chain(updates).boxed())
    }
}

async fn next_snapshot(
    (mut client, mut notifications): (ProcessManagerServiceClient<Channel>, Streaming<ProcessResponse>),
) -> Option<(
    Result<ProcessSnapshot, MonitorError>,
    (ProcessManagerServiceClient<Channel>, Streaming<ProcessResponse>),
)> {
    match notifications.message().await {
        Ok(Some(_)) => {
            let snapshot = list_processes(&mut client).await;
            Some((snapshot, (client, notifications)))
        }
        Ok(None) => None,
        Err(status) => Some((Err(MonitorError::Rpc(status)), (client, notifications))),
    }
}

async fn list_processes(
    client: &mut ProcessManagerServiceClient<Channel>,
) -> Result<ProcessSnapshot, MonitorError> {
    let response = client.process_list(ProcessListRequest {}).await?.into_inner();
    Ok(response
        .processes
        .into_iter()
        .filter(|(_, process)| !process.deleted)
        .map(|(name, process)| {
            let process = instance_process(&name, process);
            (name, process)
        })
        .collect())
}

/// Convert a reported process into its status entry.
pub fn instance_process(name: &str, response: ProcessResponse) -> InstanceProcess {
    let Some(status) = response.status else {
        return InstanceProcess {
            name: name.to_string(),
            state: InstanceProcessState::Error,
            port_start: 0,
            port_end: 0,
            error_msg: "process manager reported no status".to_string(),
        };
    };

    let (state, error_msg) = match InstanceProcessState::parse(&status.state) {
        Some(state) => (state, status.error_msg),
        None => (
            InstanceProcessState::Error,
            format!("unknown process state '{}'", status.state),
        ),
    };

    InstanceProcess {
        name: name.to_string(),
        state,
        port_start: status.port_start,
        port_end: status.port_end,
        error_msg,
    }
}
