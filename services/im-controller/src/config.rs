//! Configuration for the instance-manager controller.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this controller replica; the name of the node it runs on.
    pub controller_id: String,

    /// Namespace holding the controller's resources.
    pub namespace: String,

    /// Service account assigned to instance-manager Pods.
    pub service_account: String,

    /// Number of concurrent reconcile workers.
    pub workers: usize,

    /// Interval between full resyncs.
    pub resync_interval: Duration,

    /// How long a node must be unhealthy before it is treated as down.
    pub node_down_grace: Duration,

    /// Port the process-manager daemon listens on inside the Pod.
    pub process_manager_port: u16,

    /// How long a terminating Pod may linger before it is force-deleted.
    pub pod_termination_grace: Duration,

    /// Connection attempts per monitor session before giving up.
    pub monitor_connect_attempts: u32,

    /// Retries for a snapshot write that hits a version conflict.
    pub monitor_conflict_retries: u32,

    /// Engine image to deploy instance managers for on this node, if any.
    pub engine_image: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let controller_id = ["KEEL_CONTROLLER_ID", "NODE_NAME"]
            .iter()
            .filter_map(|key| lookup(*key))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .ok_or(ConfigError::MissingControllerId)?;

        let namespace = lookup("KEEL_NAMESPACE").unwrap_or_else(|| "keel-system".to_string());

        let service_account =
            lookup("KEEL_SERVICE_ACCOUNT").unwrap_or_else(|| "keel-service-account".to_string());

        let workers: usize = parse_or(&lookup, "KEEL_WORKERS", 4)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                key: "KEEL_WORKERS",
                value: "0".to_string(),
            });
        }

        let resync_interval = Duration::from_secs(parse_or(&lookup, "KEEL_RESYNC_INTERVAL_SECS", 30)?);
        let node_down_grace = Duration::from_secs(parse_or(&lookup, "KEEL_NODE_DOWN_GRACE_SECS", 30)?);
        let process_manager_port = parse_or(
            &lookup,
            "KEEL_PROCESS_MANAGER_PORT",
            keel_proto::DEFAULT_PROCESS_MANAGER_PORT,
        )?;
        let pod_termination_grace =
            Duration::from_secs(parse_or(&lookup, "KEEL_POD_TERMINATION_GRACE_SECS", 60)?);
        let monitor_connect_attempts = parse_or(&lookup, "KEEL_MONITOR_CONNECT_ATTEMPTS", 5)?;
        let monitor_conflict_retries = parse_or(&lookup, "KEEL_MONITOR_CONFLICT_RETRIES", 5)?;

        let engine_image = lookup("KEEL_ENGINE_IMAGE").filter(|v| !v.trim().is_empty());

        let log_level = lookup("KEEL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            controller_id,
            namespace,
            service_account,
            workers,
            resync_interval,
            node_down_grace,
            process_manager_port,
            pod_termination_grace,
            monitor_connect_attempts,
            monitor_conflict_retries,
            engine_image,
            log_level,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(_) => Err(ConfigError::Invalid { key, value }),
        },
        None => Ok(default),
    }
}
