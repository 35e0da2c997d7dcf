//! Service-import projection.
//!
//! Pure functions computing what a member's ServiceImport should look like
//! after an exporter's export is accepted or withdrawn. Endpoints on a port
//! are keyed by exporting cluster key, so applying the same event twice
//! produces the same object.

use crate::connector::ConnectorConfig;
use crate::crd::{
    ClientIpConfig, Endpoint, ServiceExport, ServiceImport, ServiceImportSpec, ServiceImportType,
    ServicePort, SessionAffinityConfig, Target,
};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Annotation naming the exporter whose service account the import carries.
pub const SERVICE_ACCOUNT_OWNER_ANNOTATION: &str = "meshfed.io/service-account-owner";

/// Result of withdrawing an exporter from an existing import.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// The exporter had no endpoints; nothing to write.
    Unchanged,
    /// Write the updated import.
    Update(ServiceImport),
    /// No endpoints remain; delete the import.
    Delete,
}

/// Build a fresh ServiceImport carrying only `geo`'s endpoints.
///
/// A port is imported when the export has a rule whose port number matches
/// one of the Service's ports; the endpoint path is the rule's path verbatim.
pub fn build_service_import(
    export: &ServiceExport,
    service: &Service,
    geo: &ConnectorConfig,
) -> ServiceImport {
    let spec = service.spec.as_ref();
    let session_affinity_config = spec
        .and_then(|s| s.session_affinity_config.as_ref())
        .map(|config| SessionAffinityConfig {
            client_ip: config.client_ip.as_ref().map(|c| ClientIpConfig {
                timeout_seconds: c.timeout_seconds,
            }),
        });

    let mut import = ServiceImport::new(
        &export.name_any(),
        ServiceImportSpec {
            import_type: import_type(service),
            ports: declared_ports(export, service, geo),
            ips: Vec::new(),
            session_affinity: spec.and_then(|s| s.session_affinity.clone()),
            session_affinity_config,
            service_account_name: export.spec.service_account_name.clone(),
        },
    );
    import.metadata.namespace = export.namespace();
    if import.spec.service_account_name.is_some() {
        set_service_account_owner(&mut import, Some(geo.key()));
    }
    import
}

/// Fold an accepted export from `geo` into an existing import.
///
/// Ports the export declares get (or replace) `geo`'s endpoint; ports it no
/// longer declares lose `geo`'s endpoint; declared ports missing from the
/// import are appended. Other exporters' endpoints are never touched.
pub fn merge_accepted(
    existing: &ServiceImport,
    export: &ServiceExport,
    service: &Service,
    geo: &ConnectorConfig,
) -> ServiceImport {
    let declared = declared_ports(export, service, geo);
    let mut merged = existing.clone();

    for port in merged.spec.ports.iter_mut() {
        let mut by_cluster: BTreeMap<String, Endpoint> = port
            .endpoints
            .drain(..)
            .map(|ep| (ep.cluster_key.clone(), ep))
            .collect();

        match declared.iter().find(|d| same_port(d, port)) {
            Some(d) => {
                for ep in &d.endpoints {
                    by_cluster.insert(ep.cluster_key.clone(), ep.clone());
                }
            }
            None => {
                by_cluster.remove(geo.key());
            }
        }
        port.endpoints = by_cluster.into_values().collect();
    }
    merged.spec.ports.retain(|p| !p.endpoints.is_empty());

    for d in declared {
        if !merged.spec.ports.iter().any(|p| same_port(p, &d)) {
            merged.spec.ports.push(d);
        }
    }

    // The first exporter to bind a service account keeps it until withdrawn.
    let owned = service_account_owner(&merged) == Some(geo.key());
    match &export.spec.service_account_name {
        Some(account) if owned || merged.spec.service_account_name.is_none() => {
            merged.spec.service_account_name = Some(account.clone());
            set_service_account_owner(&mut merged, Some(geo.key()));
        }
        None if owned => {
            merged.spec.service_account_name = None;
            set_service_account_owner(&mut merged, None);
        }
        _ => {}
    }
    merged
}

/// Withdraw every endpoint tagged with `cluster_key`.
///
/// Ports left without endpoints are dropped; an import left without ports
/// is deleted.
pub fn remove_exporter(existing: &ServiceImport, cluster_key: &str) -> Projection {
    let owns_any = existing
        .spec
        .ports
        .iter()
        .any(|p| p.endpoints.iter().any(|ep| ep.cluster_key == cluster_key));
    let owns_account = service_account_owner(existing) == Some(cluster_key);
    if !owns_any && !owns_account {
        return Projection::Unchanged;
    }

    let mut updated = existing.clone();
    for port in updated.spec.ports.iter_mut() {
        port.endpoints.retain(|ep| ep.cluster_key != cluster_key);
    }
    if owns_account {
        updated.spec.service_account_name = None;
        set_service_account_owner(&mut updated, None);
    }
    updated.spec.ports.retain(|p| !p.endpoints.is_empty());

    if updated.spec.ports.is_empty() {
        Projection::Delete
    } else {
        Projection::Update(updated)
    }
}

/// Headless when the Service has no cluster IP, ClusterSetIP otherwise.
pub fn import_type(service: &Service) -> ServiceImportType {
    let headless = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .is_some_and(|ip| ip == "None");
    if headless {
        ServiceImportType::Headless
    } else {
        ServiceImportType::ClusterSetIp
    }
}

fn declared_ports(export: &ServiceExport, service: &Service, geo: &ConnectorConfig) -> Vec<ServicePort> {
    let service_ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();

    service_ports
        .iter()
        .filter_map(|sp| {
            let rule = export
                .spec
                .rules
                .iter()
                .find(|r| r.port_number == sp.port)?;
            Some(ServicePort {
                name: sp.name.clone(),
                protocol: sp.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                app_protocol: sp.app_protocol.clone(),
                port: sp.port,
                endpoints: vec![endpoint_for(geo, &rule.path)],
            })
        })
        .collect()
}

fn endpoint_for(geo: &ConnectorConfig, path: &str) -> Endpoint {
    Endpoint {
        cluster_key: geo.key().to_string(),
        target: Target {
            host: geo.gateway_host().to_string(),
            ip: geo.gateway_ip().to_string(),
            port: i32::from(geo.gateway_port()),
            path: path.to_string(),
        },
    }
}

fn same_port(a: &ServicePort, b: &ServicePort) -> bool {
    a.port == b.port && a.protocol == b.protocol
}

/// Cluster key of the exporter whose service account the import carries.
pub fn service_account_owner(import: &ServiceImport) -> Option<&str> {
    import
        .metadata
        .annotations
        .as_ref()?
        .get(SERVICE_ACCOUNT_OWNER_ANNOTATION)
        .map(String::as_str)
}

fn set_service_account_owner(import: &mut ServiceImport, owner: Option<&str>) {
    match owner {
        Some(owner) => {
            import
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SERVICE_ACCOUNT_OWNER_ANNOTATION.to_string(), owner.to_string());
        }
        None => {
            if let Some(annotations) = import.metadata.annotations.as_mut() {
                annotations.remove(SERVICE_ACCOUNT_OWNER_ANNOTATION);
                if annotations.is_empty() {
                    import.metadata.annotations = None;
                }
            }
        }
    }
}
