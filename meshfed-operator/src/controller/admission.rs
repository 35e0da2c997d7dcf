//! Global admission of ServiceExports.
//!
//! An export observed in one member is checked against every other member
//! before its endpoints are allowed to spread. The first exporter of a name
//! wins; later exporters must agree on the Service type and port set.

use crate::connector::ServiceExportEvent;
use crate::error::OperatorResult;
use crate::messaging::Message;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";
const DEFAULT_PROTOCOL: &str = "TCP";

/// Read access to one member, as seen by admission.
#[async_trait]
pub trait PeerView: Send + Sync {
    /// Cluster key of the member.
    fn cluster_key(&self) -> &str;

    /// Whether the member holds a ServiceImport of this name.
    ///
    /// Lookup failures count as present.
    async fn service_import_exists(&self, namespace: &str, name: &str) -> bool;

    /// The member's own Service of this name.
    async fn local_service(&self, namespace: &str, name: &str) -> OperatorResult<Option<Service>>;
}

/// Why an export was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportConflict {
    /// Exporter and peer disagree on the Service type.
    ServiceTypeMismatch {
        /// Cluster key of the disagreeing peer.
        peer: String,
        /// Service type in the exporting member.
        exporter_type: String,
        /// Service type in the peer.
        peer_type: String,
    },
    /// Exporter and peer disagree on the Service ports.
    PortSetMismatch {
        /// Cluster key of the disagreeing peer.
        peer: String,
    },
    /// The peer's Service could not be read.
    PeerLookupFailed {
        /// Cluster key of the peer.
        peer: String,
        /// Lookup error.
        error: String,
    },
}

impl fmt::Display for ExportConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportConflict::ServiceTypeMismatch {
                peer,
                exporter_type,
                peer_type,
            } => write!(
                f,
                "[{peer}] service type doesn't match: {exporter_type} vs {peer_type}"
            ),
            ExportConflict::PortSetMismatch { peer } => {
                write!(f, "[{peer}] spec.ports conflict, please check service spec")
            }
            ExportConflict::PeerLookupFailed { peer, error } => {
                write!(f, "[{peer}] failed to read service: {error}")
            }
        }
    }
}

/// Why an export was dropped without a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The export carries `Valid=False`.
    Invalid,
    /// The export already carries `Conflict=True`.
    AlreadyConflicted,
    /// The origin member is no longer federated.
    StaleOrigin,
    /// The event carries no backing Service.
    MissingService,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DropReason::Invalid => "export is marked invalid",
            DropReason::AlreadyConflicted => "export is already in conflict",
            DropReason::StaleOrigin => "origin member is no longer federated",
            DropReason::MissingService => "export has no backing service",
        };
        f.write_str(reason)
    }
}

/// Outcome of admitting one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Nothing is published.
    Drop(DropReason),
    /// Publish `ExportAccepted`.
    Accept,
    /// Publish `ExportRejected`.
    Reject(ExportConflict),
}

impl AdmissionDecision {
    /// The message to publish for this decision, if any.
    pub fn into_message(self, event: Arc<ServiceExportEvent>) -> Option<Message> {
        match self {
            AdmissionDecision::Drop(_) => None,
            AdmissionDecision::Accept => Some(Message::export_accepted(event)),
            AdmissionDecision::Reject(conflict) => Some(Message::export_rejected(Arc::new(
                event.rejected(conflict.to_string()),
            ))),
        }
    }
}

/// Decide whether an observed export may federate.
///
/// `peers` must hold one view per running connector, origin included, in a
/// stable order. The decision depends only on the event and the peers'
/// current state, so admitting the same event twice yields the same answer.
pub async fn admit(event: &ServiceExportEvent, peers: &[Arc<dyn PeerView>]) -> AdmissionDecision {
    let export = &event.service_export;
    if export.is_invalid() {
        return AdmissionDecision::Drop(DropReason::Invalid);
    }
    if export.is_conflicted() {
        return AdmissionDecision::Drop(DropReason::AlreadyConflicted);
    }

    let origin = event.cluster_key();
    if !peers.iter().any(|p| p.cluster_key() == origin) {
        return AdmissionDecision::Drop(DropReason::StaleOrigin);
    }
    let Some(service) = event.service.as_ref() else {
        return AdmissionDecision::Drop(DropReason::MissingService);
    };

    let namespace = event.namespace();
    let name = event.name();

    let mut imported_anywhere = false;
    for peer in peers {
        if peer.service_import_exists(&namespace, &name).await {
            imported_anywhere = true;
            break;
        }
    }
    if !imported_anywhere {
        return AdmissionDecision::Accept;
    }

    for peer in peers.iter().filter(|p| p.cluster_key() != origin) {
        match peer.local_service(&namespace, &name).await {
            Ok(None) => {}
            Ok(Some(local)) => {
                if let Err(conflict) = compare_services(peer.cluster_key(), service, &local) {
                    return AdmissionDecision::Reject(conflict);
                }
            }
            Err(e) => {
                return AdmissionDecision::Reject(ExportConflict::PeerLookupFailed {
                    peer: peer.cluster_key().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    AdmissionDecision::Accept
}

/// Check that an exported Service agrees with a peer's Service of the same name.
pub fn compare_services(peer: &str, exported: &Service, local: &Service) -> Result<(), ExportConflict> {
    let exporter_type = service_type(exported);
    let peer_type = service_type(local);
    if exporter_type != peer_type {
        return Err(ExportConflict::ServiceTypeMismatch {
            peer: peer.to_string(),
            exporter_type: exporter_type.to_string(),
            peer_type: peer_type.to_string(),
        });
    }

    if port_signature(exported) != port_signature(local) {
        return Err(ExportConflict::PortSetMismatch {
            peer: peer.to_string(),
        });
    }
    Ok(())
}

fn service_type(service: &Service) -> &str {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_SERVICE_TYPE)
}

/// Comparable form of one Service port. Node ports are allocated per member
/// and left out.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PortSignature {
    name: String,
    protocol: String,
    port: i32,
    target_port: String,
    app_protocol: String,
}

impl From<&ServicePort> for PortSignature {
    fn from(port: &ServicePort) -> Self {
        let target_port = match &port.target_port {
            Some(IntOrString::Int(n)) => n.to_string(),
            Some(IntOrString::String(s)) => s.clone(),
            None => port.port.to_string(),
        };
        Self {
            name: port.name.clone().unwrap_or_default(),
            protocol: port
                .protocol
                .clone()
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            port: port.port,
            target_port,
            app_protocol: port.app_protocol.clone().unwrap_or_default(),
        }
    }
}

fn port_signature(service: &Service) -> BTreeSet<PortSignature> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().map(PortSignature::from).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorConfig, GatewayResolver, Locality};
    use crate::crd::condition::{CONDITION_CONFLICT, CONDITION_VALID, REASON_CONFLICT};
    use crate::crd::{Condition, ServiceExport, ServiceExportSpec, ServiceExportStatus};
    use crate::error::OperatorError;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    struct StaticResolver;

    #[async_trait]
    impl GatewayResolver for StaticResolver {
        async fn resolve_ipv4(&self, _host: &str) -> OperatorResult<Option<Ipv4Addr>> {
            Ok(Some(Ipv4Addr::new(10, 0, 0, 1)))
        }
    }

    #[derive(Default)]
    struct Peer {
        key: String,
        imports: bool,
        services: HashMap<String, Service>,
        broken: bool,
    }

    #[async_trait]
    impl PeerView for Peer {
        fn cluster_key(&self) -> &str {
            &self.key
        }

        async fn service_import_exists(&self, _namespace: &str, _name: &str) -> bool {
            self.imports
        }

        async fn local_service(&self, namespace: &str, name: &str) -> OperatorResult<Option<Service>> {
            if self.broken {
                return Err(OperatorError::Unavailable("connection refused".into()));
            }
            Ok(self.services.get(&format!("{namespace}/{name}")).cloned())
        }
    }

    fn peer(name: &str) -> Peer {
        Peer {
            key: format!("default/default/default/{name}"),
            ..Default::default()
        }
    }

    fn service(type_: Option<&str>, ports: &[i32]) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some("api".into());
        svc.metadata.namespace = Some("orders".into());
        svc.spec = Some(ServiceSpec {
            type_: type_.map(str::to_string),
            ports: Some(
                ports
                    .iter()
                    .map(|p| ServicePort {
                        port: *p,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        svc
    }

    async fn event(origin: &str, svc: Service) -> ServiceExportEvent {
        let locality = Locality::new("default", "default", "default", origin);
        let geo = ConnectorConfig::new(locality, "10.0.0.1", 80, "uid-1", &StaticResolver)
            .await
            .unwrap();
        let mut export = ServiceExport::new("api", ServiceExportSpec::default());
        export.metadata.namespace = Some("orders".into());
        ServiceExportEvent::new(Arc::new(geo), export, svc)
    }

    fn views(peers: Vec<Peer>) -> Vec<Arc<dyn PeerView>> {
        peers
            .into_iter()
            .map(|p| Arc::new(p) as Arc<dyn PeerView>)
            .collect()
    }

    #[tokio::test]
    async fn first_export_is_accepted() {
        let ev = event("a", service(None, &[80])).await;
        let peers = views(vec![peer("a"), peer("b")]);
        assert_eq!(admit(&ev, &peers).await, AdmissionDecision::Accept);
    }

    #[tokio::test]
    async fn port_mismatch_with_existing_import_is_rejected() {
        let ev = event("b", service(None, &[8080])).await;
        let mut a = peer("a");
        a.services.insert("orders/api".into(), service(None, &[80]));
        let mut b = peer("b");
        b.imports = true;
        let peers = views(vec![a, b]);

        let conflict = match admit(&ev, &peers).await {
            AdmissionDecision::Reject(conflict) => conflict,
            other => panic!("expected rejection, got {other:?}"),
        };
        assert!(conflict.to_string().contains("spec.ports"));
        assert!(conflict.to_string().contains("default/default/default/a"));
    }

    #[tokio::test]
    async fn type_mismatch_is_rejected() {
        let ev = event("b", service(Some("NodePort"), &[80])).await;
        let mut a = peer("a");
        a.imports = true;
        a.services.insert("orders/api".into(), service(None, &[80]));
        let peers = views(vec![a, peer("b")]);

        assert_eq!(
            admit(&ev, &peers).await,
            AdmissionDecision::Reject(ExportConflict::ServiceTypeMismatch {
                peer: "default/default/default/a".into(),
                exporter_type: "NodePort".into(),
                peer_type: "ClusterIP".into(),
            })
        );
    }

    #[tokio::test]
    async fn matching_peer_is_accepted() {
        let ev = event("b", service(Some("ClusterIP"), &[80])).await;
        let mut a = peer("a");
        a.imports = true;
        a.services.insert("orders/api".into(), service(None, &[80]));
        let peers = views(vec![a, peer("b")]);

        assert_eq!(admit(&ev, &peers).await, AdmissionDecision::Accept);
    }

    #[tokio::test]
    async fn origin_is_not_compared_with_itself() {
        let ev = event("a", service(None, &[80])).await;
        let mut a = peer("a");
        a.services.insert("orders/api".into(), service(None, &[9090]));
        let mut b = peer("b");
        b.imports = true;
        let peers = views(vec![a, b]);

        assert_eq!(admit(&ev, &peers).await, AdmissionDecision::Accept);
    }

    #[tokio::test]
    async fn unreadable_peer_rejects() {
        let ev = event("b", service(None, &[80])).await;
        let mut a = peer("a");
        a.imports = true;
        a.broken = true;
        let peers = views(vec![a, peer("b")]);

        assert!(matches!(
            admit(&ev, &peers).await,
            AdmissionDecision::Reject(ExportConflict::PeerLookupFailed { .. })
        ));
    }

    #[tokio::test]
    async fn stale_origin_is_dropped() {
        let ev = event("gone", service(None, &[80])).await;
        let peers = views(vec![peer("a")]);
        assert_eq!(
            admit(&ev, &peers).await,
            AdmissionDecision::Drop(DropReason::StaleOrigin)
        );
    }

    #[tokio::test]
    async fn flagged_exports_are_dropped() {
        let peers = views(vec![peer("a")]);

        let mut ev = event("a", service(None, &[80])).await;
        ev.service_export.status = Some(ServiceExportStatus {
            conditions: vec![Condition::new(CONDITION_VALID, false, "Invalid", "bad", None)],
        });
        assert_eq!(admit(&ev, &peers).await, AdmissionDecision::Drop(DropReason::Invalid));

        ev.service_export.status = Some(ServiceExportStatus {
            conditions: vec![Condition::new(CONDITION_CONFLICT, true, REASON_CONFLICT, "x", None)],
        });
        assert_eq!(
            admit(&ev, &peers).await,
            AdmissionDecision::Drop(DropReason::AlreadyConflicted)
        );
    }

    #[tokio::test]
    async fn decision_is_stable_across_calls() {
        let ev = event("b", service(None, &[8080])).await;
        let mut a = peer("a");
        a.imports = true;
        a.services.insert("orders/api".into(), service(None, &[80]));
        let peers = views(vec![a, peer("b")]);

        let first = admit(&ev, &peers).await;
        let second = admit(&ev, &peers).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rejection_message_carries_reason() {
        let ev = Arc::new(event("b", service(None, &[80])).await);
        let msg = AdmissionDecision::Reject(ExportConflict::PortSetMismatch { peer: "x".into() })
            .into_message(Arc::clone(&ev))
            .unwrap();
        let carried = msg.event().unwrap();
        assert_eq!(carried.error.as_deref(), Some("[x] spec.ports conflict, please check service spec"));

        assert!(AdmissionDecision::Drop(DropReason::Invalid).into_message(ev).is_none());
    }

    #[test]
    fn port_order_and_node_ports_are_ignored() {
        let mut left = service(None, &[80, 443]);
        let mut right = service(None, &[443, 80]);
        if let Some(ports) = right.spec.as_mut().and_then(|s| s.ports.as_mut()) {
            ports[0].node_port = Some(30443);
        }
        assert!(compare_services("p", &left, &right).is_ok());

        if let Some(ports) = left.spec.as_mut().and_then(|s| s.ports.as_mut()) {
            ports[0].target_port = Some(IntOrString::Int(8080));
        }
        assert!(compare_services("p", &left, &right).is_err());
    }
}
