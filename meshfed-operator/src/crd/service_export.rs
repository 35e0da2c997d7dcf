//! ServiceExport Custom Resource Definition.
//!
//! Created by application owners inside a member to federate a Service.

use super::condition::{CONDITION_CONFLICT, CONDITION_VALID, Condition, find_condition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares that the Service with the same namespaced name should be
/// visible in the other members of the federation.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "meshfed.io",
    version = "v1alpha1",
    derive = "PartialEq",
    kind = "ServiceExport",
    plural = "serviceexports",
    shortname = "sexp",
    namespaced,
    status = "ServiceExportStatus",
    printcolumn = r#"{"name":"Valid", "type":"string", "jsonPath":".status.conditions[?(@.type=='Valid')].status"}"#,
    printcolumn = r#"{"name":"Conflict", "type":"string", "jsonPath":".status.conditions[?(@.type=='Conflict')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportSpec {
    /// Ports to export and the path each is reachable under.
    #[serde(default)]
    pub rules: Vec<ServiceExportRule>,

    /// Optional path rewrite applied by the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite: Option<PathRewrite>,

    /// Whether gateway routing should be session sticky.
    #[serde(default)]
    pub session_sticky: bool,

    /// Load balancing hint for the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerType>,

    /// Cluster keys allowed to import this service. Empty means all members.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_clusters: Vec<String>,

    /// Service account bound to the imported service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// One exported port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportRule {
    /// Service port number this rule applies to.
    pub port_number: i32,

    /// Path the port is reachable under. Used verbatim.
    #[serde(default)]
    pub path: String,

    /// How `path` is matched.
    #[serde(default)]
    pub path_type: PathMatchType,
}

/// Path matching mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PathMatchType {
    /// Exact match.
    Exact,
    /// Prefix match.
    #[default]
    Prefix,
    /// Left to the gateway implementation.
    ImplementationSpecific,
}

/// Path rewrite rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PathRewrite {
    /// Pattern to replace.
    pub from: String,
    /// Replacement.
    pub to: String,
}

/// Gateway load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LoadBalancerType {
    /// Round robin across endpoints.
    RoundRobinLoadBalancer,
    /// Consistent hashing.
    HashingLoadBalancer,
    /// Fewest active connections.
    LeastConnectionLoadBalancer,
}

/// Observed state of a ServiceExport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportStatus {
    /// Conditions representing the current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ServiceExport {
    fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, condition_type))
    }

    /// Whether the export was explicitly marked invalid.
    pub fn is_invalid(&self) -> bool {
        self.condition(CONDITION_VALID).is_some_and(Condition::is_false)
    }

    /// Whether admission already flagged the export as conflicting.
    pub fn is_conflicted(&self) -> bool {
        self.condition(CONDITION_CONFLICT).is_some_and(Condition::is_true)
    }

    /// Whether `cluster_key` may import this export.
    pub fn targets(&self, cluster_key: &str) -> bool {
        self.spec.target_clusters.is_empty()
            || self.spec.target_clusters.iter().any(|k| k == cluster_key)
    }
}
