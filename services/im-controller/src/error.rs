//! Error types for the instance-manager controller.

use thiserror::Error;

/// Resource store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Optimistic concurrency failure; re-read and retry.
    #[error("conflict writing {kind} '{name}': expected version {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The store could not serve the request; retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Malformed taint-toleration setting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TolerationError {
    #[error("toleration '{0}' is missing an effect")]
    MissingEffect(String),

    #[error("toleration '{entry}' has unknown effect '{effect}'")]
    UnknownEffect { entry: String, effect: String },

    #[error("toleration '{0}' has an empty key")]
    EmptyKey(String),
}

/// Process-monitor errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to connect to process manager at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("process manager call failed: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Errors returned from a single reconcile pass.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The engine image is missing or not ready; nothing is deployed.
    #[error("engine image {image} is not ready")]
    ImageNotReady { image: String },

    /// The toleration setting cannot be parsed; nothing is deployed.
    #[error("invalid taint toleration setting: {0}")]
    InvalidToleration(#[from] TolerationError),
}

impl ControllerError {
    /// Failure of a deployment precondition rather than of an operation.
    pub fn is_gating(&self) -> bool {
        matches!(self, Self::ImageNotReady { .. } | Self::InvalidToleration(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing controller id: set KEEL_CONTROLLER_ID or NODE_NAME")]
    MissingControllerId,

    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}
