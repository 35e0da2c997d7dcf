//! Admission rules for Cluster declarations.
//!
//! Served by the validating webhook so that bad declarations are refused
//! before the reconciler ever sees them.

use crate::connector::is_dns1123_subdomain;
use crate::crd::{Cluster, ClusterMode};
use crate::error::{OperatorError, OperatorResult};
use kube::ResourceExt;
use std::net::Ipv4Addr;

/// Name reserved for the control plane's own cluster.
pub const RESERVED_CLUSTER_NAME: &str = "local";

/// Check a single declaration in isolation.
pub fn validate_cluster(cluster: &Cluster) -> OperatorResult<()> {
    if cluster.spec.mode == ClusterMode::InCluster {
        return Ok(());
    }

    let name = cluster.name_any();
    if name == RESERVED_CLUSTER_NAME {
        return Err(OperatorError::ReservedClusterName { name });
    }

    let host = cluster.spec.gateway_host.trim();
    if host.is_empty() {
        return Err(OperatorError::InvalidConfig(
            "gatewayHost is required for OutCluster members".into(),
        ));
    }
    validate_gateway_host(host)?;

    if !(1..=i32::from(u16::MAX)).contains(&cluster.spec.gateway_port) {
        return Err(OperatorError::InvalidGatewayPort {
            port: cluster.spec.gateway_port,
        });
    }

    if cluster.spec.kubeconfig.trim().is_empty() {
        return Err(OperatorError::InvalidConfig(
            "kubeconfig is required for OutCluster members".into(),
        ));
    }
    Ok(())
}

fn validate_gateway_host(host: &str) -> OperatorResult<()> {
    match host.parse::<Ipv4Addr>() {
        Ok(ip) if ip.is_loopback() || ip.is_unspecified() => {
            Err(OperatorError::UnusableGatewayIp { ip })
        }
        Ok(_) => Ok(()),
        Err(_) if is_dns1123_subdomain(host) => Ok(()),
        Err(_) => Err(OperatorError::InvalidGatewayHost {
            host: host.to_string(),
        }),
    }
}

/// `mode` cannot change once set.
pub fn validate_mode_unchanged(old: &Cluster, new: &Cluster) -> OperatorResult<()> {
    if old.spec.mode != new.spec.mode {
        return Err(OperatorError::InvalidConfig(format!(
            "mode is immutable, cannot change from {:?} to {:?}",
            old.spec.mode, new.spec.mode
        )));
    }
    Ok(())
}

/// At most one InCluster member may exist across the fleet.
pub fn validate_single_in_cluster(new: &Cluster, fleet: &[Cluster]) -> OperatorResult<()> {
    if new.spec.mode != ClusterMode::InCluster {
        return Ok(());
    }
    let name = new.name_any();
    let other = fleet
        .iter()
        .find(|c| c.spec.mode == ClusterMode::InCluster && c.name_any() != name);
    match other {
        Some(existing) => Err(OperatorError::InvalidConfig(format!(
            "only one InCluster member is allowed, {} already exists",
            existing.name_any()
        ))),
        None => Ok(()),
    }
}

/// Validate one admission request for a Cluster.
///
/// `operation` is the admission operation (`CREATE`, `UPDATE`, `DELETE`).
/// Deletes are always allowed.
pub fn validate_admission(
    operation: &str,
    new: Option<&Cluster>,
    old: Option<&Cluster>,
    fleet: &[Cluster],
) -> OperatorResult<()> {
    if operation == "DELETE" {
        return Ok(());
    }
    let Some(new) = new else {
        return Ok(());
    };

    validate_cluster(new)?;
    if let Some(old) = old {
        if operation == "UPDATE" {
            validate_mode_unchanged(old, new)?;
        }
    }
    validate_single_in_cluster(new, fleet)
}
