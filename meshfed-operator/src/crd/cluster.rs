//! Cluster Custom Resource Definition.
//!
//! Declares a member cluster of the federation.

use super::condition::{CONDITION_MANAGED, Condition, find_condition};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster is the Schema for the clusters API.
///
/// A Cluster declares the locality of a member cluster, how to reach its
/// gateway and how to connect to its API server. The control plane keeps one
/// connector running per Cluster.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "meshfed.io",
    version = "v1alpha1",
    derive = "PartialEq",
    kind = "Cluster",
    plural = "clusters",
    shortname = "mcl",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Region", "type":"string", "jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Zone", "type":"string", "jsonPath":".spec.zone"}"#,
    printcolumn = r#"{"name":"Group", "type":"string", "jsonPath":".spec.group"}"#,
    printcolumn = r#"{"name":"Gateway Host", "type":"string", "jsonPath":".spec.gatewayHost"}"#,
    printcolumn = r#"{"name":"Gateway Port", "type":"integer", "jsonPath":".spec.gatewayPort"}"#,
    printcolumn = r#"{"name":"Managed", "type":"string", "jsonPath":".status.conditions[?(@.type=='Managed')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Region the member belongs to.
    #[serde(default = "default_locality")]
    pub region: String,

    /// Zone the member belongs to.
    #[serde(default = "default_locality")]
    pub zone: String,

    /// Group the member belongs to.
    #[serde(default = "default_locality")]
    pub group: String,

    /// Gateway address, an IPv4 literal or a DNS name.
    #[serde(default)]
    pub gateway_host: String,

    /// Gateway port.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: i32,

    /// Kubeconfig used to reach the member's API server.
    #[serde(default)]
    pub kubeconfig: String,

    /// Name of the MeshConfig inside the member.
    #[serde(default = "default_mesh_config_name")]
    pub mesh_config_name: String,

    /// Namespace holding the MeshConfig and the mesh controller.
    #[serde(default = "default_mesh_namespace")]
    pub mesh_namespace: String,

    /// Whether the member is the cluster hosting the control plane.
    #[serde(default)]
    pub mode: ClusterMode,
}

fn default_locality() -> String {
    "default".to_string()
}

fn default_gateway_port() -> i32 {
    80
}

fn default_mesh_config_name() -> String {
    "mesh-config".to_string()
}

fn default_mesh_namespace() -> String {
    "mesh-system".to_string()
}

/// Connection mode of a member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterMode {
    /// The control plane runs inside this member.
    InCluster,
    /// The member is reached through its kubeconfig.
    #[default]
    OutCluster,
}

/// Observed state of a Cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Conditions representing the current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Cluster {
    /// Canonical `region/zone/group/name` key.
    pub fn cluster_key(&self) -> String {
        crate::connector::cluster_key(
            &self.spec.region,
            &self.spec.zone,
            &self.spec.group,
            &self.name_any(),
        )
    }

    /// The Managed condition, if reported.
    pub fn managed_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, CONDITION_MANAGED))
    }

    /// Whether the object is being deleted.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
