//! Federation reconciler.
//!
//! Keeps exactly one running connector per declared member and arbitrates
//! ServiceExports observed anywhere in the fleet.

use super::admission::{self, AdmissionDecision, PeerView};
use super::store::ClusterStore;
use super::{ControllerContext, ReconcileAction};
use crate::config::OperatorConfig;
use crate::connector::{
    ConnectorConfig, ConnectorContext, GatewayResolver, MemberClientFactory, RemoteConnector,
    ServiceExportEvent,
};
use crate::crd::condition::{CONDITION_MANAGED, REASON_FAILED, REASON_SUCCESS, set_condition};
use crate::crd::{Cluster, ClusterSpec, Condition};
use crate::error::{OperatorError, OperatorResult};
use crate::messaging::{Broker, Message, MessageKind};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Content hash of a declaration.
///
/// Two declarations hash equal iff their spec, resource version, generation
/// and UID are equal.
pub fn cluster_hash(cluster: &Cluster) -> OperatorResult<String> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct HashInput<'a> {
        spec: &'a ClusterSpec,
        resource_version: Option<&'a str>,
        generation: Option<i64>,
        uid: Option<&'a str>,
    }

    let input = HashInput {
        spec: &cluster.spec,
        resource_version: cluster.metadata.resource_version.as_deref(),
        generation: cluster.metadata.generation,
        uid: cluster.metadata.uid.as_deref(),
    };
    let encoded = serde_json::to_vec(&input)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// A running connector owned by the reconciler.
struct Background {
    hash: String,
    context: Arc<ConnectorContext>,
    connector: Arc<RemoteConnector>,
    task: JoinHandle<()>,
}

enum Plan {
    Create,
    Recreate,
    Unchanged,
    Duplicate(String),
}

/// Supervisor of the connector fleet.
pub struct FederationReconciler {
    store: Arc<dyn ClusterStore>,
    factory: Arc<dyn MemberClientFactory>,
    resolver: Arc<dyn GatewayResolver>,
    broker: Arc<Broker>,
    settings: Arc<OperatorConfig>,
    backgrounds: Mutex<BTreeMap<String, Background>>,
    shutdown: CancellationToken,
}

impl FederationReconciler {
    /// Create a reconciler. Every connector it starts is cancelled with `shutdown`.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        factory: Arc<dyn MemberClientFactory>,
        resolver: Arc<dyn GatewayResolver>,
        broker: Arc<Broker>,
        settings: Arc<OperatorConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            factory,
            resolver,
            broker,
            settings,
            backgrounds: Mutex::new(BTreeMap::new()),
            shutdown,
        }
    }

    /// Bring the connector of the named Cluster in line with its declaration.
    pub async fn reconcile(&self, name: &str) -> OperatorResult<ReconcileAction> {
        let mut backgrounds = self.backgrounds.lock().await;

        let Some(cluster) = self.store.get(name).await?.filter(|c| !c.is_deleting()) else {
            stop_named(&mut backgrounds, name, None);
            return Ok(ReconcileAction::Done);
        };

        let key = cluster.cluster_key();
        let hash = cluster_hash(&cluster)?;

        tracing::debug!(name = %name, key = %key, "Reconciling Cluster");

        // A locality change moves the member to a new key.
        stop_named(&mut backgrounds, name, Some(key.as_str()));

        let plan = match backgrounds.get(&key) {
            None => Plan::Create,
            Some(bg) if bg.context.cluster_name() != name => {
                Plan::Duplicate(bg.context.cluster_name().to_string())
            }
            Some(bg) if bg.hash == hash => Plan::Unchanged,
            Some(_) => Plan::Recreate,
        };

        let created = match plan {
            Plan::Unchanged => {
                if !cluster.managed_condition().is_some_and(Condition::is_true) {
                    let updated = self
                        .report_managed(&cluster, true, REASON_SUCCESS, joined_message(name))
                        .await?;
                    if let (Some(updated), Some(bg)) = (updated, backgrounds.get_mut(&key)) {
                        refresh_hash(bg, &cluster, &updated);
                    }
                }
                return Ok(ReconcileAction::Done);
            }
            Plan::Duplicate(existing) => Err(OperatorError::DuplicateClusterKey {
                key: key.clone(),
                existing,
            }),
            Plan::Recreate => {
                if let Some(old) = backgrounds.remove(&key) {
                    tracing::info!(name = %name, key = %key, "Cluster declaration changed, recreating connector");
                    stop_background(old);
                }
                self.create_background(&cluster, hash).await
            }
            Plan::Create => self.create_background(&cluster, hash).await,
        };

        match created {
            Ok(mut bg) => {
                tracing::info!(name = %name, key = %key, "Cluster joined ClusterSet");
                let report = self
                    .report_managed(&cluster, true, REASON_SUCCESS, joined_message(name))
                    .await;
                if let Ok(Some(updated)) = &report {
                    refresh_hash(&mut bg, &cluster, updated);
                }
                backgrounds.insert(key, bg);
                report.map(|_| ReconcileAction::Done)
            }
            Err(e) => {
                tracing::warn!(name = %name, key = %key, error = %e, "Cluster failed to join ClusterSet");
                let message = format!("Cluster {name} failed to join ClusterSet: {e}.");
                self.report_managed(&cluster, false, REASON_FAILED, message)
                    .await?;
                Ok(action_for(&e))
            }
        }
    }

    async fn create_background(&self, cluster: &Cluster, hash: String) -> OperatorResult<Background> {
        let config = ConnectorConfig::for_cluster(
            cluster,
            &self.settings.control_plane_uid,
            self.resolver.as_ref(),
        )
        .await?;
        let context = Arc::new(ConnectorContext::new(cluster, hash.clone(), &self.shutdown));
        let client = self.factory.connect(&context).await?;

        let (connector, subscriptions) = RemoteConnector::start(
            Arc::clone(&context),
            Arc::new(config),
            client,
            Arc::clone(&self.broker),
            Arc::clone(&self.settings),
        )
        .await?;
        let task = connector.spawn(subscriptions);

        Ok(Background {
            hash,
            context,
            connector,
            task,
        })
    }

    async fn report_managed(
        &self,
        cluster: &Cluster,
        managed: bool,
        reason: &str,
        message: String,
    ) -> OperatorResult<Option<Cluster>> {
        let mut status = cluster.status.clone().unwrap_or_default();
        let condition = Condition::new(
            CONDITION_MANAGED,
            managed,
            reason,
            message,
            cluster.metadata.generation,
        );
        if !set_condition(&mut status.conditions, condition) {
            return Ok(None);
        }
        let updated = self.store.update_status(&cluster.name_any(), &status).await?;
        Ok(Some(updated))
    }

    /// Subscribe to observed exports and admit them one at a time.
    pub fn start_admission(self: &Arc<Self>) -> JoinHandle<()> {
        let mut subscription = self.broker.subscribe(MessageKind::ExportCreated);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    msg = subscription.recv() => msg,
                };
                let Some(msg) = msg else {
                    break;
                };
                this.admit_message(msg).await;
            }
            this.broker.unsubscribe(subscription);
            tracing::info!("Admission loop stopped");
        })
    }

    async fn admit_message(&self, msg: Message) {
        let Some(event) = msg.event().cloned() else {
            return;
        };
        let decision = self.admit_event(&event).await;

        match &decision {
            AdmissionDecision::Drop(reason) => tracing::debug!(
                origin = %event.cluster_key(),
                namespace = %event.namespace(),
                name = %event.name(),
                reason = %reason,
                "Dropped ServiceExport"
            ),
            AdmissionDecision::Accept => tracing::info!(
                origin = %event.cluster_key(),
                namespace = %event.namespace(),
                name = %event.name(),
                "Accepted ServiceExport"
            ),
            AdmissionDecision::Reject(conflict) => tracing::warn!(
                origin = %event.cluster_key(),
                namespace = %event.namespace(),
                name = %event.name(),
                reason = %conflict,
                "Rejected ServiceExport"
            ),
        }

        if let Some(verdict) = decision.into_message(event) {
            self.broker.enqueue(verdict);
        }
    }

    /// Admit one observed export against the live fleet.
    pub async fn admit_event(&self, event: &ServiceExportEvent) -> AdmissionDecision {
        let backgrounds = self.backgrounds.lock().await;
        let peers: Vec<Arc<dyn PeerView>> = backgrounds
            .values()
            .map(|bg| Arc::clone(&bg.connector) as Arc<dyn PeerView>)
            .collect();
        admission::admit(event, &peers).await
    }

    /// Keys of the running connectors, sorted.
    pub async fn background_keys(&self) -> Vec<String> {
        self.backgrounds.lock().await.keys().cloned().collect()
    }

    /// Declaration hash the connector under `key` currently reflects.
    pub async fn background_hash(&self, key: &str) -> Option<String> {
        self.backgrounds.lock().await.get(key).map(|bg| bg.hash.clone())
    }

    /// The connector running under `key`.
    pub async fn connector(&self, key: &str) -> Option<Arc<RemoteConnector>> {
        self.backgrounds
            .lock()
            .await
            .get(key)
            .map(|bg| Arc::clone(&bg.connector))
    }

    /// Stop every connector and the admission loop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained = std::mem::take(&mut *self.backgrounds.lock().await);
        let joins: Vec<JoinHandle<()>> = drained.into_values().map(stop_background).collect();
        for join in joins {
            let _ = join.await;
        }
        tracing::info!("Federation reconciler stopped");
    }
}

/// Stop every connector started for the named Cluster, except the one under `keep`.
fn stop_named(backgrounds: &mut BTreeMap<String, Background>, name: &str, keep: Option<&str>) {
    let keys: Vec<String> = backgrounds
        .iter()
        .filter(|(k, bg)| bg.context.cluster_name() == name && Some(k.as_str()) != keep)
        .map(|(k, _)| k.clone())
        .collect();

    for key in keys {
        if let Some(bg) = backgrounds.remove(&key) {
            stop_background(bg);
            tracing::info!(name = %name, key = %key, "Cluster left ClusterSet");
        }
    }
}

/// Cancel a connector and reap its task in the background.
///
/// Never waits on the member, so callers may hold the backgrounds lock.
fn stop_background(bg: Background) -> JoinHandle<()> {
    bg.connector.stop();
    let Background { context, task, .. } = bg;
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!(key = %context.key(), error = %e, "Connector task failed");
        }
    })
}

fn joined_message(name: &str) -> String {
    format!("Cluster {name} joined ClusterSet successfully.")
}

/// Our own status write bumps the resource version; follow it unless the
/// declaration moved underneath.
fn refresh_hash(bg: &mut Background, before: &Cluster, after: &Cluster) {
    if same_declaration(before, after) {
        if let Ok(hash) = cluster_hash(after) {
            bg.hash = hash;
        }
    }
}

/// Whether a status write left the declaration itself untouched.
fn same_declaration(before: &Cluster, after: &Cluster) -> bool {
    before.spec == after.spec
        && before.metadata.generation == after.metadata.generation
        && before.metadata.uid == after.metadata.uid
}

/// How soon to look at a declaration again after a failed join.
fn action_for(error: &OperatorError) -> ReconcileAction {
    match error {
        e if e.is_transient() => ReconcileAction::requeue_short(),
        OperatorError::UnresolvedGatewayHost { .. } => ReconcileAction::requeue_medium(),
        _ => ReconcileAction::Done,
    }
}

/// Error policy for the Cluster controller.
pub fn error_policy(
    _cluster: Arc<Cluster>,
    error: &OperatorError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    tracing::error!(error = %error, "Cluster reconciliation error");
    if error.is_transient() {
        Action::requeue(std::time::Duration::from_secs(5))
    } else {
        Action::requeue(std::time::Duration::from_secs(30))
    }
}
