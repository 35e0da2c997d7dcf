//! Error types for the meshfed control plane.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Resource already exists.
    #[error("Resource already exists: {kind} {namespace}/{name}")]
    AlreadyExists {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Optimistic concurrency failure on write.
    #[error("Resource version conflict on {kind} {namespace}/{name}")]
    Conflict {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Store is temporarily unable to serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Gateway host is neither an IPv4 literal nor a DNS-1123 subdomain.
    #[error("Invalid gateway host {host:?}: must be an IPv4 address or a DNS-1123 subdomain")]
    InvalidGatewayHost {
        /// Offending host.
        host: String,
    },

    /// Gateway host is a valid name but has no IPv4 address.
    #[error("Gateway host {host:?} does not resolve to an IPv4 address")]
    UnresolvedGatewayHost {
        /// Offending host.
        host: String,
    },

    /// Gateway address is loopback or unspecified.
    #[error("Gateway IP {ip} is loopback or unspecified")]
    UnusableGatewayIp {
        /// Resolved address.
        ip: Ipv4Addr,
    },

    /// Gateway port outside 1..65535.
    #[error("Invalid gateway port {port}: must be between 1 and 65535")]
    InvalidGatewayPort {
        /// Offending port.
        port: i32,
    },

    /// Member is already claimed by another control plane.
    #[error("Cluster {cluster} is already managed by control plane {owner}, cannot join the federation")]
    AlreadyManagedElsewhere {
        /// Cluster key.
        cluster: String,
        /// UID of the owning control plane.
        owner: String,
    },

    /// Cluster name collides with a reserved label.
    #[error("Cluster name {name:?} is reserved")]
    ReservedClusterName {
        /// Reserved name.
        name: String,
    },

    /// Two declarations map to the same cluster key.
    #[error("Cluster key {key} is already used by cluster {existing}")]
    DuplicateClusterKey {
        /// Colliding key.
        key: String,
        /// Name of the declaration already holding the key.
        existing: String,
    },

    /// Mesh controller deployment is absent from the member.
    #[error("Mesh controller {name} not found in namespace {namespace}")]
    MeshControllerMissing {
        /// Deployment name.
        name: String,
        /// Namespace searched.
        namespace: String,
    },

    /// Member API server is older than required.
    #[error("Kubernetes version {found} is not supported, requires at least {required}")]
    UnsupportedServerVersion {
        /// Version reported by the member.
        found: String,
        /// Minimum version.
        required: String,
    },

    /// Kubeconfig could not be loaded.
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Watch stream failure.
    #[error("Watch error: {0}")]
    WatchError(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    /// Whether retrying the same operation may succeed without a configuration change.
    pub fn is_transient(&self) -> bool {
        match self {
            OperatorError::Conflict { .. } | OperatorError::Unavailable(_) => true,
            OperatorError::WatchError(_) => true,
            OperatorError::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            OperatorError::KubeError(_) => true,
            _ => false,
        }
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether this is an already-exists error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::AlreadyExists { .. })
    }

    /// Map a kube API error for a specific object onto the store taxonomy.
    pub fn from_api(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => OperatorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                OperatorError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => OperatorError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            other => OperatorError::KubeError(other),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}
