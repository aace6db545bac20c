//! Error types for the node-detacher controller

use thiserror::Error;

/// Main error type for node-detacher operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    /// A load balancer, target group or scaling group call failed
    #[error("Target registry error during {operation}: {message}")]
    RegistryError { operation: String, message: String },

    /// The node lacks the label carrying its cloud instance id
    #[error("Node {node} must be labeled with `{label}` for its attachments to be managed")]
    MissingInstanceKey { node: String, label: String },

    /// Detach was attempted before the attachment record was cached
    #[error("Attachment record for node {0} not found")]
    AttachmentNotFound(String),

    /// The object being created already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// The object was modified since it was last read
    #[error("Conflict updating {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::KubeError(err)
    }
}

impl Error {
    /// Create a registry error for the given operation
    pub fn registry(operation: impl Into<String>, message: impl ToString) -> Self {
        Error::RegistryError {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether a requeue with a short delay is expected to make progress
    ///
    /// A missing instance label only goes away when the node object itself
    /// changes, which already triggers a new reconciliation.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::RegistryError { .. }
            | Error::AttachmentNotFound(_)
            | Error::AlreadyExists { .. }
            | Error::Conflict { .. } => true,
            Error::MissingInstanceKey { .. }
            | Error::SerializationError(_)
            | Error::ConfigError(_) => false,
        }
    }

    /// Short error category used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::RegistryError { .. } => "registry",
            Error::MissingInstanceKey { .. } => "missing_instance_key",
            Error::AttachmentNotFound(_) => "attachment_not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Conflict { .. } => "conflict",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
