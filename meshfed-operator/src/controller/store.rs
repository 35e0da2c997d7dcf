//! Access to Cluster declarations.

use crate::crd::{Cluster, ClusterStatus};
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

/// Where the reconciler reads declarations and reports their status.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read a declaration by name.
    async fn get(&self, name: &str) -> OperatorResult<Option<Cluster>>;

    /// Write the status subresource, returning the updated object.
    async fn update_status(&self, name: &str, status: &ClusterStatus) -> OperatorResult<Cluster>;
}

/// [`ClusterStore`] backed by the control plane's API server.
#[derive(Clone)]
pub struct KubeClusterStore {
    api: Api<Cluster>,
}

impl KubeClusterStore {
    /// Create a store over cluster-scoped Cluster objects.
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, name: &str) -> OperatorResult<Option<Cluster>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn update_status(&self, name: &str, status: &ClusterStatus) -> OperatorResult<Cluster> {
        let patch = serde_json::json!({
            "status": status
        });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_api(e, "Cluster", "", name))
    }
}
