//! Process monitor.
//!
//! One session per running instance manager mirrors the remote process table
//! into the resource's `instances` status. Sessions are tracked in a single
//! name-keyed table behind one lock, so "is a session active for X" has one
//! answer for both the controller and the sessions themselves.
//!
//! Session lifecycle:
//! - Open a watch stream; retry with backoff up to the connect budget
//! - Publish every snapshot with a version-checked status write
//! - Retry failed status writes with the reconnect backoff
//! - Stop when told to, when the resource stops being `Running` at the
//!   session's address, or when the connect budget is spent
//! - Remove itself from the table on exit, unless a newer session took its slot,
//!   and clear the published table it leaves behind

mod watcher;

pub use watcher::{instance_process, GrpcProcessWatcher, ProcessSnapshot, ProcessWatcher, SnapshotStream};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use keel_reconcile::BackoffPolicy;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::ResourceStore;
use crate::types::InstanceManagerState;

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Port the process manager listens on.
    pub port: u16,

    /// Consecutive failed stream opens before a session gives up.
    pub connect_attempts: u32,

    /// Re-reads after a conflicting snapshot write before giving up.
    pub conflict_retries: u32,

    /// Delay between stream opens.
    pub reconnect_backoff: BackoffPolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            port: keel_proto::DEFAULT_PROCESS_MANAGER_PORT,
            connect_attempts: 5,
            conflict_retries: 5,
            reconnect_backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(10),
                jitter: 0.25,
            },
        }
    }
}

struct Session {
    id: u64,
    ip: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct MonitorInner {
    store: Arc<dyn ResourceStore>,
    watcher: Arc<dyn ProcessWatcher>,
    settings: MonitorSettings,
    sessions: Mutex<HashMap<String, Session>>,
}

/// Shared handle to the monitor session table.
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
}

/// What a session does after a publish attempt.
#[derive(Debug, PartialEq, Eq)]
enum Publish {
    Continue,
    Halt,
    /// Stop was signaled while waiting to retry.
    Stopped,
}

impl ProcessMonitor {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        watcher: Arc<dyn ProcessWatcher>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                store,
                watcher,
                settings,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a session for `name` against the process manager at `ip`.
    ///
    /// No-op if a session already exists. Returns whether one was started.
    pub async fn start(&self, name: &str, ip: &str) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(name) {
            return false;
        }

        let id = next_session_id();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(
            Arc::clone(&self.inner),
            id,
            name.to_string(),
            ip.to_string(),
            stop_rx,
        ));

        info!(instance_manager = %name, ip = %ip, session_id = id, "Started process monitor");
        sessions.insert(
            name.to_string(),
            Session {
                id,
                ip: ip.to_string(),
                stop_tx,
                task,
            },
        );
        true
    }

    /// Stop the session for `name`. Returns whether one existed.
    pub async fn stop(&self, name: &str) -> bool {
        let session = self.inner.sessions.lock().await.remove(name);
        match session {
            Some(session) => {
                let _ = session.stop_tx.send(true);
                info!(instance_manager = %name, session_id = session.id, "Stopped process monitor");
                true
            }
            None => false,
        }
    }

    pub async fn is_monitoring(&self, name: &str) -> bool {
        self.inner.sessions.lock().await.contains_key(name)
    }

    /// Address the session for `name` is watching, if any.
    pub async fn session_ip(&self, name: &str) -> Option<String> {
        self.inner.sessions.lock().await.get(name).map(|s| s.ip.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Stop every session, waiting up to `timeout` before aborting stragglers.
    pub async fn stop_all(&self, timeout: Duration) {
        let sessions: Vec<(String, Session)> = self.inner.sessions.lock().await.drain().collect();
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "Stopping all process monitors");
        for (_, session) in &sessions {
            let _ = session.stop_tx.send(true);
        }

        let deadline = Instant::now() + timeout;
        for (name, mut session) in sessions {
            if tokio::time::timeout_at(deadline, &mut session.task).await.is_err() {
                warn!(instance_manager = %name, "Force aborting process monitor");
                session.task.abort();
            }
        }
    }
}

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_session_id() -> u64 {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

async fn run_session(
    inner: Arc<MonitorInner>,
    id: u64,
    name: String,
    ip: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    let endpoint = format!("{}:{}", ip, inner.settings.port);
    let mut failures = 0u32;

    'session: loop {
        if *stop_rx.borrow() {
            break;
        }

        let opened = tokio::select! {
            biased;
            _ = stop_rx.changed() => break 'session,
            opened = inner.watcher.watch(&endpoint) => opened,
        };

        match opened {
            Ok(mut snapshots) => loop {
                let item = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break 'session,
                    item = snapshots.next() => item,
                };

                match item {
                    Some(Ok(snapshot)) => {
                        failures = 0;
                        match publish(&inner, &name, &ip, snapshot, &mut stop_rx).await {
                            Publish::Continue => {}
                            Publish::Halt | Publish::Stopped => break 'session,
                        }
                    }
                    Some(Err(e)) => {
                        warn!(instance_manager = %name, endpoint = %endpoint, error = %e, "Process watch failed");
                        break;
                    }
                    None => {
                        debug!(instance_manager = %name, endpoint = %endpoint, "Process watch closed");
                        break;
                    }
                }
            },
            Err(e) => {
                warn!(instance_manager = %name, endpoint = %endpoint, error = %e, "Failed to open process watch");
            }
        }

        failures += 1;
        if failures >= inner.settings.connect_attempts {
            warn!(
                instance_manager = %name,
                endpoint = %endpoint,
                attempts = failures,
                "Giving up on process manager"
            );
            break;
        }

        let delay = inner.settings.reconnect_backoff.delay(failures - 1);
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break 'session,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // A stopped session has already been removed; a matching entry means
    // this session ended on its own.
    let mut sessions = inner.sessions.lock().await;
    if sessions.get(&name).map(|s| s.id) == Some(id) {
        sessions.remove(&name);
        clear_instances(&inner, &name, &ip).await;
        debug!(instance_manager = %name, session_id = id, "Process monitor exited");
    }
}

/// Replace the resource's `instances` with `snapshot`.
///
/// Conflicts are retried at once with a fresh read. Other store failures are
/// retried with the reconnect backoff, up to the connect budget.
async fn publish(
    inner: &MonitorInner,
    name: &str,
    ip: &str,
    snapshot: ProcessSnapshot,
    stop_rx: &mut watch::Receiver<bool>,
) -> Publish {
    let mut conflicts = 0;
    let mut outages = 0;
    loop {
        let written = match inner.store.get_instance_manager(name).await {
            Ok(mut im) => {
                if im.status.current_state != InstanceManagerState::Running || im.status.ip != ip {
                    debug!(
                        instance_manager = %name,
                        state = %im.status.current_state,
                        "Instance manager no longer running at monitored address"
                    );
                    return Publish::Halt;
                }
                if im.status.instances == snapshot {
                    return Publish::Continue;
                }

                im.status.instances = snapshot.clone();
                inner.store.update_instance_manager_status(&im).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                debug!(instance_manager = %name, processes = snapshot.len(), "Published process snapshot");
                return Publish::Continue;
            }
            Err(e) if e.is_not_found() => return Publish::Halt,
            Err(e) if e.is_conflict() => {
                if conflicts < inner.settings.conflict_retries {
                    conflicts += 1;
                    continue;
                }
                warn!(instance_manager = %name, attempts = conflicts + 1, "Persistent conflict publishing snapshot");
                return Publish::Halt;
            }
            Err(e) => {
                outages += 1;
                if outages >= inner.settings.connect_attempts {
                    warn!(instance_manager = %name, error = %e, attempts = outages, "Giving up publishing snapshot");
                    return Publish::Halt;
                }

                let delay = inner.settings.reconnect_backoff.delay(outages - 1);
                warn!(
                    instance_manager = %name,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to publish process snapshot"
                );
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return Publish::Stopped,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Empty the published process table of a session that ended on its own,
/// while the resource is still `Running` at the session's address.
async fn clear_instances(inner: &MonitorInner, name: &str, ip: &str) {
    for _ in 0..=inner.settings.conflict_retries {
        let mut im = match inner.store.get_instance_manager(name).await {
            Ok(im) => im,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!(instance_manager = %name, error = %e, "Failed to read instance manager");
                return;
            }
        };

        if im.status.current_state != InstanceManagerState::Running
            || im.status.ip != ip
            || im.status.instances.is_empty()
        {
            return;
        }

        im.status.instances.clear();
        match inner.store.update_instance_manager_status(&im).await {
            Ok(_) => {
                info!(instance_manager = %name, "Cleared process table of ended monitor");
                return;
            }
            Err(e) if e.is_conflict() => {}
            Err(e) => {
                warn!(instance_manager = %name, error = %e, "Failed to clear process table");
                return;
            }
        }
    }
    warn!(instance_manager = %name, "Persistent conflict clearing process table");
}
