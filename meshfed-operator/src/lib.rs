//! Meshfed control plane
//!
//! This crate federates service meshes across Kubernetes clusters. Each
//! member is declared by a `Cluster` resource; applications opt in by
//! creating a `ServiceExport` next to their Service, and every other member
//! then receives a `ServiceImport` listing the exporters' gateways.
//!
//! # Custom Resource Definitions
//!
//! - **Cluster**: declares a member and how to reach it
//! - **MeshConfig**: the member mesh's configuration, stamped on adoption
//! - **ServiceExport**: exports a Service to the rest of the fleet
//! - **ServiceImport**: the fleet-wide view of an exported Service
//!
//! # Example
//!
//! ```yaml
//! apiVersion: meshfed.io/v1alpha1
//! kind: Cluster
//! metadata:
//!   name: east
//! spec:
//!   region: eu
//!   zone: eu-west-1a
//!   gatewayHost: gw.east.example.com
//!   gatewayPort: 8091
//!   kubeconfig: |
//!     apiVersion: v1
//!     kind: Config
//!     ...
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connector;
pub mod controller;
pub mod crd;
pub mod error;
pub mod messaging;
pub mod projection;
pub mod retry;
pub mod validation;

pub use config::OperatorConfig;
pub use crd::{Cluster, ClusterSpec, MeshConfig, ServiceExport, ServiceImport};
pub use error::{OperatorError, OperatorResult};
