//! MeshConfig Custom Resource Definition.
//!
//! Lives inside each member. Only the `clusterSet` block is read or written
//! by the control plane; everything else belongs to the member's mesh.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Member-side mesh configuration.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "meshfed.io",
    version = "v1alpha1",
    derive = "PartialEq",
    kind = "MeshConfig",
    plural = "meshconfigs",
    shortname = "meshcfg",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfigSpec {
    /// Federation membership stamped by the control plane.
    #[serde(default)]
    pub cluster_set: ClusterSetSpec,
}

/// Federation membership of a member cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSetSpec {
    /// Whether a control plane has adopted this member.
    #[serde(default)]
    pub is_managed: bool,

    /// Region of the member.
    #[serde(default)]
    pub region: String,

    /// Zone of the member.
    #[serde(default)]
    pub zone: String,

    /// Group of the member.
    #[serde(default)]
    pub group: String,

    /// Name of the member.
    #[serde(default)]
    pub name: String,

    /// UID of the adopting control plane.
    #[serde(default, rename = "controlPlaneUID")]
    pub control_plane_uid: String,
}

impl ClusterSetSpec {
    /// Whether a control plane other than `uid` owns this member.
    pub fn is_owned_by_other(&self, uid: &str) -> bool {
        self.is_managed && !self.control_plane_uid.is_empty() && self.control_plane_uid != uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_check() {
        let mut set = ClusterSetSpec::default();
        assert!(!set.is_owned_by_other("p2"));

        set.is_managed = true;
        set.control_plane_uid = "p1".into();
        assert!(set.is_owned_by_other("p2"));
        assert!(!set.is_owned_by_other("p1"));

        set.control_plane_uid.clear();
        assert!(!set.is_owned_by_other("p2"));
    }

    #[test]
    fn uid_field_name_on_the_wire() {
        let set = ClusterSetSpec {
            is_managed: true,
            control_plane_uid: "p1".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["controlPlaneUID"], "p1");
        assert_eq!(json["isManaged"], true);
    }
}
