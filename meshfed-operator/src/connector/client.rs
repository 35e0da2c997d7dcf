//! Access to a member cluster's API server.
//!
//! [`MemberClient`] is the only path a connector uses to read or write
//! member state, which keeps the connector logic testable without an API
//! server.

use super::context::ConnectorContext;
use crate::config::ServerVersion;
use crate::crd::{
    ClusterMode, ClusterSetSpec, MeshConfig, ServiceExport, ServiceExportStatus, ServiceImport,
};
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::WatchStreamExt;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher::{self, watcher};
use kube::{Api, Client, Config, Resource, ResourceExt};
use std::sync::Arc;

/// Name the control plane reports Kubernetes events under.
pub const EVENT_REPORTER: &str = "meshfed-operator";

/// Stream of ServiceExport watch events across all namespaces.
pub type ExportWatchStream = BoxStream<'static, OperatorResult<watcher::Event<ServiceExport>>>;

/// Severity of an event recorded on a member object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    /// Informational.
    Normal,
    /// Something the owner should look at.
    Warning,
}

/// Operations a connector performs against its member.
#[async_trait]
pub trait MemberClient: Send + Sync {
    /// Version reported by the member's API server.
    async fn server_version(&self) -> OperatorResult<ServerVersion>;

    /// Whether a Deployment exists.
    async fn deployment_exists(&self, namespace: &str, name: &str) -> OperatorResult<bool>;

    /// Read a MeshConfig.
    async fn get_mesh_config(&self, namespace: &str, name: &str)
    -> OperatorResult<Option<MeshConfig>>;

    /// Overwrite the `clusterSet` block of a MeshConfig, leaving the rest untouched.
    async fn patch_cluster_set(
        &self,
        namespace: &str,
        name: &str,
        cluster_set: &ClusterSetSpec,
    ) -> OperatorResult<()>;

    /// Read a Service.
    async fn get_service(&self, namespace: &str, name: &str) -> OperatorResult<Option<Service>>;

    /// Create a namespace unless it exists.
    async fn ensure_namespace(&self, namespace: &str) -> OperatorResult<()>;

    /// Read a ServiceImport.
    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<ServiceImport>>;

    /// Create a ServiceImport. Fails with [`OperatorError::AlreadyExists`] if present.
    async fn create_service_import(&self, import: &ServiceImport) -> OperatorResult<ServiceImport>;

    /// Replace a ServiceImport. Fails with [`OperatorError::Conflict`] on a stale resource version.
    async fn replace_service_import(&self, import: &ServiceImport)
    -> OperatorResult<ServiceImport>;

    /// Delete a ServiceImport. Absent objects are not an error.
    async fn delete_service_import(&self, namespace: &str, name: &str) -> OperatorResult<()>;

    /// Read a ServiceExport.
    async fn get_service_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<ServiceExport>>;

    /// Watch ServiceExports in every namespace.
    fn watch_service_exports(&self) -> ExportWatchStream;

    /// Write the status subresource of a ServiceExport.
    async fn update_service_export_status(
        &self,
        export: &ServiceExport,
        status: &ServiceExportStatus,
    ) -> OperatorResult<()>;

    /// Record a Kubernetes event on a ServiceExport.
    async fn record_export_event(
        &self,
        export: &ServiceExport,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    ) -> OperatorResult<()>;
}

/// Builds member clients from connector contexts.
#[async_trait]
pub trait MemberClientFactory: Send + Sync {
    /// Connect to the member described by `ctx`.
    async fn connect(&self, ctx: &ConnectorContext) -> OperatorResult<Arc<dyn MemberClient>>;
}

/// Factory producing [`KubeMemberClient`]s.
///
/// In-cluster members without a kubeconfig reuse the control plane's own client.
pub struct KubeMemberClientFactory {
    local: Client,
}

impl KubeMemberClientFactory {
    /// Create a factory. `local` is the control plane's own client.
    pub fn new(local: Client) -> Self {
        Self { local }
    }
}

#[async_trait]
impl MemberClientFactory for KubeMemberClientFactory {
    async fn connect(&self, ctx: &ConnectorContext) -> OperatorResult<Arc<dyn MemberClient>> {
        let client = if ctx.mode() == ClusterMode::InCluster && ctx.kubeconfig().is_empty() {
            self.local.clone()
        } else {
            client_from_kubeconfig(ctx.kubeconfig()).await?
        };
        Ok(Arc::new(KubeMemberClient::new(client, ctx.key())))
    }
}

async fn client_from_kubeconfig(raw: &str) -> OperatorResult<Client> {
    if raw.trim().is_empty() {
        return Err(OperatorError::Kubeconfig("kubeconfig is empty".into()));
    }
    let kubeconfig =
        Kubeconfig::from_yaml(raw).map_err(|e| OperatorError::Kubeconfig(e.to_string()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| OperatorError::Kubeconfig(e.to_string()))?;
    Ok(Client::try_from(config)?)
}

/// [`MemberClient`] backed by a kube client.
#[derive(Clone)]
pub struct KubeMemberClient {
    client: Client,
    recorder: Recorder,
}

impl KubeMemberClient {
    /// Wrap a client. `cluster_key` tags recorded events.
    pub fn new(client: Client, cluster_key: &str) -> Self {
        let reporter = Reporter {
            controller: EVENT_REPORTER.to_string(),
            instance: Some(cluster_key.to_string()),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    fn imports(&self, namespace: &str) -> Api<ServiceImport> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl MemberClient for KubeMemberClient {
    async fn server_version(&self) -> OperatorResult<ServerVersion> {
        let info = self.client.apiserver_version().await?;
        ServerVersion::from_parts(&info.major, &info.minor)
    }

    async fn deployment_exists(&self, namespace: &str, name: &str) -> OperatorResult<bool> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.get_opt(name).await?.is_some())
    }

    async fn get_mesh_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<MeshConfig>> {
        let configs: Api<MeshConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(configs.get_opt(name).await?)
    }

    async fn patch_cluster_set(
        &self,
        namespace: &str,
        name: &str,
        cluster_set: &ClusterSetSpec,
    ) -> OperatorResult<()> {
        let configs: Api<MeshConfig> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": {
                "clusterSet": cluster_set
            }
        });
        configs
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_api(e, "MeshConfig", namespace, name))?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> OperatorResult<Option<Service>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(services.get_opt(name).await?)
    }

    async fn ensure_namespace(&self, namespace: &str) -> OperatorResult<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        if namespaces.get_opt(namespace).await?.is_some() {
            return Ok(());
        }

        let mut ns = Namespace::default();
        ns.metadata.name = Some(namespace.to_string());
        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                tracing::info!(namespace = %namespace, "Created namespace");
                Ok(())
            }
            Err(e) => match OperatorError::from_api(e, "Namespace", "", namespace) {
                OperatorError::AlreadyExists { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<ServiceImport>> {
        Ok(self.imports(namespace).get_opt(name).await?)
    }

    async fn create_service_import(&self, import: &ServiceImport) -> OperatorResult<ServiceImport> {
        let namespace = import.namespace().unwrap_or_default();
        let name = import.name_any();
        self.imports(&namespace)
            .create(&PostParams::default(), import)
            .await
            .map_err(|e| OperatorError::from_api(e, "ServiceImport", &namespace, &name))
    }

    async fn replace_service_import(
        &self,
        import: &ServiceImport,
    ) -> OperatorResult<ServiceImport> {
        let namespace = import.namespace().unwrap_or_default();
        let name = import.name_any();
        self.imports(&namespace)
            .replace(&name, &PostParams::default(), import)
            .await
            .map_err(|e| OperatorError::from_api(e, "ServiceImport", &namespace, &name))
    }

    async fn delete_service_import(&self, namespace: &str, name: &str) -> OperatorResult<()> {
        match self
            .imports(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match OperatorError::from_api(e, "ServiceImport", namespace, name) {
                OperatorError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_service_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<ServiceExport>> {
        let exports: Api<ServiceExport> = Api::namespaced(self.client.clone(), namespace);
        Ok(exports.get_opt(name).await?)
    }

    fn watch_service_exports(&self) -> ExportWatchStream {
        let exports: Api<ServiceExport> = Api::all(self.client.clone());
        watcher(exports, watcher::Config::default())
            .default_backoff()
            .map(|event| event.map_err(|e| OperatorError::WatchError(e.to_string())))
            .boxed()
    }

    async fn update_service_export_status(
        &self,
        export: &ServiceExport,
        status: &ServiceExportStatus,
    ) -> OperatorResult<()> {
        let namespace = export.namespace().unwrap_or_default();
        let name = export.name_any();
        let exports: Api<ServiceExport> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "status": status
        });
        exports
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_api(e, "ServiceExport", &namespace, &name))?;
        Ok(())
    }

    async fn record_export_event(
        &self,
        export: &ServiceExport,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    ) -> OperatorResult<()> {
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Admission".to_string(),
            secondary: None,
        };
        self.recorder
            .publish(&event, &export.object_ref(&()))
            .await?;
        Ok(())
    }
}
