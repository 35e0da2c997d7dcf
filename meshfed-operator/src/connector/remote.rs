//! Remote connector: one per managed member.
//!
//! Bridges the member's ServiceExports onto the event bus and materializes
//! accepted exports from peers as ServiceImports inside the member.

use super::client::{EventSeverity, MemberClient};
use super::config::ConnectorConfig;
use super::context::ConnectorContext;
use super::event::ServiceExportEvent;
use crate::config::OperatorConfig;
use crate::controller::PeerView;
use crate::crd::condition::{CONDITION_CONFLICT, REASON_CONFLICT, set_condition};
use crate::crd::{ClusterSetSpec, Condition, ServiceExport};
use crate::error::{OperatorError, OperatorResult};
use crate::messaging::{Broker, Message, MessageKind, Subscription};
use crate::projection::{self, Projection};
use crate::retry::{DEFAULT_RETRY_BASE, FibonacciBackoff, RetryOutcome, retry};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::runtime::watcher;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type ObjectKey = (String, String);

/// Create/read/replace rounds before an upsert yields to the retry loop.
const MAX_UPSERT_ATTEMPTS: usize = 3;

fn object_key(export: &ServiceExport) -> ObjectKey {
    (export.namespace().unwrap_or_default(), export.name_any())
}

/// Bus subscriptions taken during startup, handed to [`RemoteConnector::spawn`].
pub struct ConnectorSubscriptions {
    deleted: Subscription,
    accepted: Subscription,
    rejected: Subscription,
}

/// Connector bridging one member to the federation.
pub struct RemoteConnector {
    context: Arc<ConnectorContext>,
    config: Arc<ConnectorConfig>,
    client: Arc<dyn MemberClient>,
    broker: Arc<Broker>,
    settings: Arc<OperatorConfig>,
    managed: AtomicBool,
    cache: Mutex<HashMap<ObjectKey, ServiceExport>>,
    inflight: Mutex<HashMap<ObjectKey, JoinHandle<()>>>,
    synced: Notify,
}

impl RemoteConnector {
    /// Run the startup sequence against the member.
    ///
    /// Checks the API server version and the mesh controller, adopts the
    /// member's MeshConfig and subscribes to federation messages. Nothing is
    /// spawned; call [`RemoteConnector::spawn`] on success.
    pub async fn start(
        context: Arc<ConnectorContext>,
        config: Arc<ConnectorConfig>,
        client: Arc<dyn MemberClient>,
        broker: Arc<Broker>,
        settings: Arc<OperatorConfig>,
    ) -> OperatorResult<(Arc<Self>, ConnectorSubscriptions)> {
        let connector = Self {
            context,
            config,
            client,
            broker,
            settings,
            managed: AtomicBool::new(false),
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            synced: Notify::new(),
        };

        connector.preflight().await?;
        connector.adopt_mesh_config().await?;

        let subscriptions = ConnectorSubscriptions {
            deleted: connector.broker.subscribe(MessageKind::ExportDeleted),
            accepted: connector.broker.subscribe(MessageKind::ExportAccepted),
            rejected: connector.broker.subscribe(MessageKind::ExportRejected),
        };

        info!(cluster = %connector.key(), gateway = %connector.config, "Connector started");
        Ok((Arc::new(connector), subscriptions))
    }

    /// Spawn the informer and the federation message loop.
    pub fn spawn(self: &Arc<Self>, subscriptions: ConnectorSubscriptions) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(subscriptions).await })
    }

    /// Cluster key of the member.
    pub fn key(&self) -> &str {
        self.config.key()
    }

    /// Connector descriptor.
    pub fn config(&self) -> &Arc<ConnectorConfig> {
        &self.config
    }

    /// Owning context.
    pub fn context(&self) -> &Arc<ConnectorContext> {
        &self.context
    }

    /// Whether the member's MeshConfig is adopted by this control plane.
    pub fn is_managed(&self) -> bool {
        self.managed.load(Ordering::Acquire)
    }

    /// Signal every loop of this connector to exit.
    pub fn stop(&self) {
        self.context.cancel();
    }

    async fn preflight(&self) -> OperatorResult<()> {
        let version = self.client.server_version().await?;
        let required = self.settings.min_server_version;
        if version < required {
            return Err(OperatorError::UnsupportedServerVersion {
                found: version.to_string(),
                required: required.to_string(),
            });
        }

        let namespace = self.context.mesh_namespace();
        let controller = &self.settings.mesh_controller_name;
        if !self.client.deployment_exists(namespace, controller).await? {
            return Err(OperatorError::MeshControllerMissing {
                name: controller.clone(),
                namespace: namespace.to_string(),
            });
        }
        Ok(())
    }

    async fn adopt_mesh_config(&self) -> OperatorResult<()> {
        let namespace = self.context.mesh_namespace();
        let name = self.context.mesh_config_name();
        let uid = self.config.control_plane_uid();

        let mesh = self
            .client
            .get_mesh_config(namespace, name)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: "MeshConfig".into(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;

        let current = &mesh.spec.cluster_set;
        if current.is_owned_by_other(uid) {
            return Err(OperatorError::AlreadyManagedElsewhere {
                cluster: self.key().to_string(),
                owner: current.control_plane_uid.clone(),
            });
        }

        let desired = ClusterSetSpec {
            is_managed: true,
            region: self.config.region().to_string(),
            zone: self.config.zone().to_string(),
            group: self.config.group().to_string(),
            name: self.config.name().to_string(),
            control_plane_uid: uid.to_string(),
        };
        if *current != desired {
            self.client
                .patch_cluster_set(namespace, name, &desired)
                .await?;
            info!(cluster = %self.key(), mesh_config = %name, "Adopted member MeshConfig");
        }

        self.managed.store(true, Ordering::Release);
        Ok(())
    }

    async fn run(self: Arc<Self>, subscriptions: ConnectorSubscriptions) {
        let ConnectorSubscriptions {
            mut deleted,
            mut accepted,
            mut rejected,
        } = subscriptions;

        let informer = tokio::spawn(Arc::clone(&self).run_informer());

        let sync_timeout = self.settings.informer_sync_timeout();
        tokio::select! {
            _ = self.context.cancelled() => {}
            synced = tokio::time::timeout(sync_timeout, self.synced.notified()) => {
                if synced.is_err() {
                    warn!(
                        cluster = %self.key(),
                        timeout = ?sync_timeout,
                        "ServiceExport cache did not sync in time, continuing"
                    );
                }
            }
        }

        let period = self.settings.resync_period();
        let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.context.cancelled() => break,
                Some(msg) = accepted.recv() => self.dispatch(msg),
                Some(msg) = deleted.recv() => self.dispatch(msg),
                Some(msg) = rejected.recv() => self.dispatch(msg),
                _ = resync.tick() => {
                    self.inflight.lock().retain(|_, handle| !handle.is_finished());
                    tokio::spawn(Arc::clone(&self).resync());
                }
            }
        }

        self.broker.unsubscribe(deleted);
        self.broker.unsubscribe(accepted);
        self.broker.unsubscribe(rejected);
        if let Err(e) = informer.await {
            error!(cluster = %self.key(), error = %e, "Informer task failed");
        }
        info!(cluster = %self.key(), "Connector stopped");
    }

    /// Queue a federation message behind earlier messages for the same export.
    fn dispatch(self: &Arc<Self>, msg: Message) {
        let Some(event) = msg.event() else {
            return;
        };
        let key = object_key(&event.service_export);
        let this = Arc::clone(self);

        let mut inflight = self.inflight.lock();
        let previous = inflight.remove(&key);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(cluster = %this.key(), error = %e, "Previous federation message task failed");
                }
            }
            this.handle_with_retry(msg).await;
        });
        inflight.insert(key, handle);
    }

    async fn handle_with_retry(&self, msg: Message) {
        let kind = msg.kind;
        let backoff = FibonacciBackoff::new(DEFAULT_RETRY_BASE);
        match retry(self.context.token(), backoff, || self.handle_message(&msg)).await {
            RetryOutcome::Succeeded(()) => {}
            RetryOutcome::Failed(e) => {
                error!(cluster = %self.key(), kind = %kind, error = %e, "Federation message handling failed");
            }
            RetryOutcome::Cancelled => {
                debug!(cluster = %self.key(), kind = %kind, "Federation message abandoned on shutdown");
            }
        }
    }

    async fn handle_message(&self, msg: &Message) -> OperatorResult<()> {
        let Some(event) = msg.event() else {
            return Ok(());
        };
        let from_self = event.cluster_key() == self.key();

        match msg.kind {
            MessageKind::ExportAccepted if !from_self => {
                if event.service_export.targets(self.key()) {
                    self.upsert_service_import(event).await
                } else {
                    debug!(
                        cluster = %self.key(),
                        origin = %event.cluster_key(),
                        name = %event.name(),
                        "Export not targeted at this member"
                    );
                    self.remove_exporter_from_import(event).await
                }
            }
            MessageKind::ExportDeleted | MessageKind::ExportRejected if !from_self => {
                self.remove_exporter_from_import(event).await
            }
            MessageKind::ExportRejected => self.reject_service_export(event).await,
            _ => Ok(()),
        }
    }

    /// Fold an accepted peer export into this member's ServiceImport.
    async fn upsert_service_import(&self, event: &ServiceExportEvent) -> OperatorResult<()> {
        let namespace = event.namespace();
        let name = event.name();
        let service = event.service.as_ref().ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "accepted export {namespace}/{name} carries no Service"
            ))
        })?;

        self.client.ensure_namespace(&namespace).await?;

        let template = projection::build_service_import(&event.service_export, service, &event.geo);

        for _ in 0..MAX_UPSERT_ATTEMPTS {
            if !template.spec.ports.is_empty() {
                match self.client.create_service_import(&template).await {
                    Ok(_) => {
                        info!(
                            cluster = %self.key(),
                            origin = %event.cluster_key(),
                            namespace = %namespace,
                            name = %name,
                            "Created ServiceImport"
                        );
                        return Ok(());
                    }
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
            }

            let live = match self.client.get_service_import(&namespace, &name).await? {
                Some(live) if live.metadata.deletion_timestamp.is_none() => live,
                _ if template.spec.ports.is_empty() => return Ok(()),
                // Deleted between create and get.
                None => continue,
                Some(_) => break,
            };

            let merged =
                projection::merge_accepted(&live, &event.service_export, service, &event.geo);
            if merged.spec == live.spec && merged.metadata.annotations == live.metadata.annotations {
                debug!(cluster = %self.key(), namespace = %namespace, name = %name, "ServiceImport up to date");
                return Ok(());
            }

            if merged.spec.ports.is_empty() {
                self.client.delete_service_import(&namespace, &name).await?;
                info!(cluster = %self.key(), namespace = %namespace, name = %name, "Deleted empty ServiceImport");
                return Ok(());
            }

            match self.client.replace_service_import(&merged).await {
                Ok(_) => {
                    info!(
                        cluster = %self.key(),
                        origin = %event.cluster_key(),
                        namespace = %namespace,
                        name = %name,
                        "Updated ServiceImport"
                    );
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    debug!(cluster = %self.key(), namespace = %namespace, name = %name, "ServiceImport vanished, recreating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(OperatorError::Conflict {
            kind: "ServiceImport".into(),
            name,
            namespace,
        })
    }

    /// Withdraw a peer's endpoints from this member's ServiceImport.
    async fn remove_exporter_from_import(&self, event: &ServiceExportEvent) -> OperatorResult<()> {
        let namespace = event.namespace();
        let name = event.name();

        let Some(live) = self.client.get_service_import(&namespace, &name).await? else {
            return Ok(());
        };
        if live.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        match projection::remove_exporter(&live, event.cluster_key()) {
            Projection::Unchanged => Ok(()),
            Projection::Update(updated) => {
                match self.client.replace_service_import(&updated).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                }
                info!(
                    cluster = %self.key(),
                    origin = %event.cluster_key(),
                    namespace = %namespace,
                    name = %name,
                    "Removed exporter from ServiceImport"
                );
                Ok(())
            }
            Projection::Delete => {
                self.client.delete_service_import(&namespace, &name).await?;
                info!(
                    cluster = %self.key(),
                    namespace = %namespace,
                    name = %name,
                    "Deleted ServiceImport with no remaining exporters"
                );
                Ok(())
            }
        }
    }

    /// Surface a rejection on the local ServiceExport.
    ///
    /// Conditions are written onto the live object, never the snapshot the
    /// rejection carried.
    async fn reject_service_export(&self, event: &ServiceExportEvent) -> OperatorResult<()> {
        let namespace = event.namespace();
        let name = event.name();
        let Some(export) = self.client.get_service_export(&namespace, &name).await? else {
            debug!(cluster = %self.key(), namespace = %namespace, name = %name, "Rejected ServiceExport is gone");
            return Ok(());
        };
        if export.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let reason = event.error.as_deref().unwrap_or("rejected by admission");
        let note = format!("ServiceExport {namespace}/{name} conflicts, {reason}");

        if let Err(e) = self
            .client
            .record_export_event(&export, EventSeverity::Warning, "Rejected", &note)
            .await
        {
            warn!(cluster = %self.key(), error = %e, "Failed to record rejection event");
        }

        let mut status = export.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_CONFLICT,
                true,
                REASON_CONFLICT,
                note,
                export.metadata.generation,
            ),
        );
        self.client.update_service_export_status(&export, &status).await?;

        warn!(
            cluster = %self.key(),
            namespace = %namespace,
            name = %name,
            reason = %reason,
            "ServiceExport rejected"
        );
        Ok(())
    }

    async fn run_informer(self: Arc<Self>) {
        let mut stream = self.client.watch_service_exports();
        let mut relisted: Option<HashSet<ObjectKey>> = None;

        loop {
            let event = tokio::select! {
                _ = self.context.cancelled() => break,
                event = stream.next() => event,
            };
            let Some(event) = event else {
                warn!(cluster = %self.key(), "ServiceExport watch ended");
                break;
            };

            tokio::select! {
                _ = self.context.cancelled() => break,
                _ = self.on_watch_event(event, &mut relisted) => {}
            }
        }
    }

    async fn on_watch_event(
        &self,
        event: OperatorResult<watcher::Event<ServiceExport>>,
        relisted: &mut Option<HashSet<ObjectKey>>,
    ) {
        match event {
            Ok(watcher::Event::Init) => {
                *relisted = Some(HashSet::new());
            }
            Ok(watcher::Event::InitApply(export)) => {
                if let Some(seen) = relisted.as_mut() {
                    seen.insert(object_key(&export));
                }
                self.on_export_applied(export).await;
            }
            Ok(watcher::Event::InitDone) => {
                let seen = relisted.take().unwrap_or_default();
                self.forget_missing(&seen);
                self.synced.notify_one();
                debug!(cluster = %self.key(), exports = seen.len(), "ServiceExport cache synced");
            }
            Ok(watcher::Event::Apply(export)) => {
                self.on_export_applied(export).await;
            }
            Ok(watcher::Event::Delete(export)) => {
                self.on_export_deleted(export);
            }
            Err(e) => {
                warn!(cluster = %self.key(), error = %e, "ServiceExport watch error");
            }
        }
    }

    async fn on_export_applied(&self, export: ServiceExport) {
        self.cache.lock().insert(object_key(&export), export.clone());
        if export.metadata.deletion_timestamp.is_some() {
            return;
        }
        self.publish_export(export).await;
    }

    async fn publish_export(&self, export: ServiceExport) {
        let (namespace, name) = object_key(&export);

        if !self.is_managed() {
            warn!(cluster = %self.key(), namespace = %namespace, name = %name, "Member is not managed, ignoring ServiceExport");
            return;
        }

        let service = match self.client.get_service(&namespace, &name).await {
            Ok(Some(service)) => service,
            Ok(None) => {
                warn!(cluster = %self.key(), namespace = %namespace, name = %name, "ServiceExport has no backing Service");
                return;
            }
            Err(e) => {
                warn!(cluster = %self.key(), namespace = %namespace, name = %name, error = %e, "Failed to read backing Service");
                return;
            }
        };
        if is_external_name(&service) {
            warn!(cluster = %self.key(), namespace = %namespace, name = %name, "ExternalName Services cannot be exported");
            return;
        }

        debug!(cluster = %self.key(), namespace = %namespace, name = %name, "Publishing ServiceExport");
        let event = ServiceExportEvent::new(Arc::clone(&self.config), export, service);
        self.broker.enqueue(Message::export_created(Arc::new(event)));
    }

    fn on_export_deleted(&self, export: ServiceExport) {
        let key = object_key(&export);
        let last_known = self.cache.lock().remove(&key).unwrap_or(export);
        debug!(cluster = %self.key(), namespace = %key.0, name = %key.1, "ServiceExport deleted");
        let event = ServiceExportEvent::deleted(Arc::clone(&self.config), last_known);
        self.broker.enqueue(Message::export_deleted(Arc::new(event)));
    }

    /// Emit deletions for cached exports absent from a fresh listing.
    fn forget_missing(&self, seen: &HashSet<ObjectKey>) {
        let gone: Vec<ServiceExport> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(key, _)| !seen.contains(*key))
                .map(|(_, export)| export.clone())
                .collect()
        };
        for export in gone {
            self.on_export_deleted(export);
        }
    }

    async fn resync(self: Arc<Self>) {
        let exports: Vec<ServiceExport> = self.cache.lock().values().cloned().collect();
        debug!(cluster = %self.key(), exports = exports.len(), "Resyncing ServiceExports");
        for export in exports {
            if export.metadata.deletion_timestamp.is_none() {
                self.publish_export(export).await;
            }
        }
    }
}

fn is_external_name(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "ExternalName")
}

#[async_trait]
impl PeerView for RemoteConnector {
    fn cluster_key(&self) -> &str {
        self.key()
    }

    async fn service_import_exists(&self, namespace: &str, name: &str) -> bool {
        match self.client.get_service_import(namespace, name).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(
                    cluster = %self.key(),
                    namespace = %namespace,
                    name = %name,
                    error = %e,
                    "ServiceImport lookup failed, assuming it exists"
                );
                true
            }
        }
    }

    async fn local_service(&self, namespace: &str, name: &str) -> OperatorResult<Option<Service>> {
        self.client.get_service(namespace, name).await
    }
}
