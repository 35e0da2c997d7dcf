//! Payload carried over the event bus.

use super::config::ConnectorConfig;
use crate::crd::ServiceExport;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::sync::Arc;

/// A ServiceExport observed in one member, with its origin and backing Service.
///
/// Shared behind `Arc` once enqueued and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ServiceExportEvent {
    /// Origin member.
    pub geo: Arc<ConnectorConfig>,
    /// The export as observed.
    pub service_export: ServiceExport,
    /// Backing Service. Absent on deletions.
    pub service: Option<Service>,
    /// Rejection reason, set by admission.
    pub error: Option<String>,
}

impl ServiceExportEvent {
    /// Event for an applied export.
    pub fn new(geo: Arc<ConnectorConfig>, service_export: ServiceExport, service: Service) -> Self {
        Self {
            geo,
            service_export,
            service: Some(service),
            error: None,
        }
    }

    /// Event for a deleted export.
    pub fn deleted(geo: Arc<ConnectorConfig>, service_export: ServiceExport) -> Self {
        Self {
            geo,
            service_export,
            service: None,
            error: None,
        }
    }

    /// Copy of this event carrying a rejection reason.
    pub fn rejected(&self, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..self.clone()
        }
    }

    /// Key of the origin member.
    pub fn cluster_key(&self) -> &str {
        self.geo.key()
    }

    /// Namespace of the export.
    pub fn namespace(&self) -> String {
        self.service_export.namespace().unwrap_or_default()
    }

    /// Name of the export.
    pub fn name(&self) -> String {
        self.service_export.name_any()
    }
}
