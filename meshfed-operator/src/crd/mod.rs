//! Custom Resource Definitions for the meshfed control plane.
//!
//! - [`Cluster`]: a member of the federation (fleet scoped, control plane side)
//! - [`MeshConfig`]: member-side mesh settings carrying federation membership
//! - [`ServiceExport`]: a Service a member offers to its peers
//! - [`ServiceImport`]: the federated view of peers' exports inside a member

pub mod condition;
mod cluster;
mod mesh_config;
mod service_export;
mod service_import;

pub use cluster::{Cluster, ClusterMode, ClusterSpec, ClusterStatus};
pub use condition::Condition;
pub use mesh_config::{ClusterSetSpec, MeshConfig, MeshConfigSpec};
pub use service_export::{
    LoadBalancerType, PathMatchType, PathRewrite, ServiceExport, ServiceExportRule,
    ServiceExportSpec, ServiceExportStatus,
};
pub use service_import::{
    ClientIpConfig, Endpoint, ServiceImport, ServiceImportSpec, ServiceImportType, ServicePort,
    SessionAffinityConfig, Target,
};
