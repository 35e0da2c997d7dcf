//! ServiceImport Custom Resource Definition.
//!
//! Materialized inside a member for every accepted export from its peers.
//! Written only by the member's connector.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The federated view of a service exported by one or more peers.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "meshfed.io",
    version = "v1alpha1",
    derive = "PartialEq",
    kind = "ServiceImport",
    plural = "serviceimports",
    shortname = "simp",
    namespaced,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    /// Routing model of the imported service.
    #[serde(rename = "type", default)]
    pub import_type: ServiceImportType,

    /// Imported ports with their per-exporter endpoints.
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Cluster-set virtual IPs, when allocated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,

    /// Session affinity copied from the exporting Service (`None` or `ClientIP`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,

    /// Session affinity tuning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity_config: Option<SessionAffinityConfig>,

    /// Service account bound to the imported service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// How the imported service is addressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ServiceImportType {
    /// A single virtual IP fronts all endpoints.
    #[serde(rename = "ClusterSetIP")]
    #[default]
    ClusterSetIp,
    /// Endpoints are addressed directly.
    Headless,
}

/// One imported port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name from the exporting Service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Transport protocol.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Application protocol hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    /// Port number.
    pub port: i32,

    /// Gateway endpoints, at most one per exporting cluster, ordered by cluster key.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// A route to the service through one exporter's gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Gateway target.
    pub target: Target,

    /// Key of the exporting cluster.
    pub cluster_key: String,
}

/// Gateway coordinates of an exporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Gateway host as declared.
    pub host: String,
    /// Resolved gateway IPv4.
    pub ip: String,
    /// Gateway port.
    pub port: i32,
    /// Path the service is reachable under.
    #[serde(default)]
    pub path: String,
}

/// Session affinity tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionAffinityConfig {
    /// Client IP based affinity.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "clientIP")]
    pub client_ip: Option<ClientIpConfig>,
}

/// Client IP affinity settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientIpConfig {
    /// Sticky session lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}
