//! Runtime shadow of a Cluster declaration.

use crate::crd::{Cluster, ClusterMode};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Per-member context owned by the federation reconciler.
///
/// Connectors get a shared reference; cancelling the token is the only
/// teardown signal they observe.
#[derive(Debug)]
pub struct ConnectorContext {
    cluster_key: String,
    cluster_name: String,
    hash: String,
    kubeconfig: String,
    mesh_config_name: String,
    mesh_namespace: String,
    mode: ClusterMode,
    token: CancellationToken,
}

impl ConnectorContext {
    /// Derive a context from a declaration, cancelled together with `parent`.
    pub fn new(cluster: &Cluster, hash: String, parent: &CancellationToken) -> Self {
        Self {
            cluster_key: cluster.cluster_key(),
            cluster_name: kube::ResourceExt::name_any(cluster),
            hash,
            kubeconfig: cluster.spec.kubeconfig.clone(),
            mesh_config_name: cluster.spec.mesh_config_name.clone(),
            mesh_namespace: cluster.spec.mesh_namespace.clone(),
            mode: cluster.spec.mode,
            token: parent.child_token(),
        }
    }

    /// Cluster key.
    pub fn key(&self) -> &str {
        &self.cluster_key
    }

    /// Name of the owning Cluster object.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Content hash of the declaration this context was built from.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Opaque connection credential.
    pub fn kubeconfig(&self) -> &str {
        &self.kubeconfig
    }

    /// MeshConfig name inside the member.
    pub fn mesh_config_name(&self) -> &str {
        &self.mesh_config_name
    }

    /// Namespace holding the MeshConfig and mesh controller.
    pub fn mesh_namespace(&self) -> &str {
        &self.mesh_namespace
    }

    /// Declared connection mode.
    pub fn mode(&self) -> ClusterMode {
        self.mode
    }

    /// Stop every loop rooted in this context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context has been stopped.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is stopped.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Token for child tasks.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
