//! Common test utilities for meshfed-operator tests.
//!
//! In-memory stand-ins for member API servers and the Cluster store, wired
//! into a real reconciler and event bus.

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use k8s_openapi::api::core::v1::{Service, ServicePort as K8sServicePort, ServiceSpec};
use kube::runtime::watcher;
use kube::ResourceExt;
use meshfed_operator::config::{OperatorConfig, ServerVersion};
use meshfed_operator::connector::{
    ConnectorContext, EventSeverity, ExportWatchStream, GatewayResolver, MemberClient,
    MemberClientFactory,
};
use meshfed_operator::controller::{ClusterStore, FederationReconciler};
use meshfed_operator::crd::{
    Cluster, ClusterMode, ClusterSetSpec, ClusterSpec, ClusterStatus, MeshConfig, MeshConfigSpec,
    PathMatchType, ServiceExport, ServiceExportRule, ServiceExportSpec, ServiceExportStatus,
    ServiceImport,
};
use meshfed_operator::error::{OperatorError, OperatorResult};
use meshfed_operator::messaging::Broker;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// UID of the control plane under test.
pub const CONTROL_PLANE_UID: &str = "cp-test";

/// Mesh namespace every fake member runs its mesh in.
pub const MESH_NAMESPACE: &str = "mesh-system";

/// MeshConfig name every fake member uses.
pub const MESH_CONFIG: &str = "mesh-config";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// A recorded Kubernetes event.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub namespace: String,
    pub name: String,
    pub severity: EventSeverity,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
struct MemberState {
    version: Option<ServerVersion>,
    deployments: HashSet<Key>,
    mesh_configs: HashMap<Key, MeshConfig>,
    services: HashMap<Key, Service>,
    namespaces: HashSet<String>,
    imports: HashMap<Key, ServiceImport>,
    exports: HashMap<Key, ServiceExport>,
    events: Vec<RecordedEvent>,
    watchers: Vec<UnboundedSender<OperatorResult<watcher::Event<ServiceExport>>>>,
    next_version: u64,
    vanish_on_replace: HashSet<Key>,
}

impl MemberState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn broadcast(&mut self, make: impl Fn() -> watcher::Event<ServiceExport>) {
        self.watchers.retain(|tx| tx.unbounded_send(Ok(make())).is_ok());
    }
}

/// In-memory member API server.
#[derive(Default)]
pub struct FakeMember {
    state: Mutex<MemberState>,
    cluster_set_patches: AtomicUsize,
    service_read_delay_ms: AtomicU64,
}

#[allow(dead_code)]
impl FakeMember {
    /// A healthy, unclaimed member.
    pub fn healthy() -> Arc<Self> {
        let member = Self::default();
        {
            let mut state = member.state.lock();
            state.version = Some(ServerVersion::new(1, 27));
            state
                .deployments
                .insert(key(MESH_NAMESPACE, "mesh-controller"));
            let mut mesh = MeshConfig::new(MESH_CONFIG, MeshConfigSpec::default());
            mesh.metadata.namespace = Some(MESH_NAMESPACE.into());
            state.mesh_configs.insert(key(MESH_NAMESPACE, MESH_CONFIG), mesh);
        }
        Arc::new(member)
    }

    /// A member already adopted by another control plane.
    pub fn claimed_by(uid: &str) -> Arc<Self> {
        let member = Self::healthy();
        {
            let mut state = member.state.lock();
            if let Some(mesh) = state.mesh_configs.get_mut(&key(MESH_NAMESPACE, MESH_CONFIG)) {
                mesh.spec.cluster_set = ClusterSetSpec {
                    is_managed: true,
                    region: "default".into(),
                    zone: "default".into(),
                    group: "default".into(),
                    name: "elsewhere".into(),
                    control_plane_uid: uid.into(),
                };
            }
        }
        member
    }

    pub fn put_service(&self, service: Service) {
        let k = key(&service.namespace().unwrap_or_default(), &service.name_any());
        self.state.lock().services.insert(k, service);
    }

    /// Create or update an export and notify watchers.
    pub fn apply_export(&self, mut export: ServiceExport) {
        let mut state = self.state.lock();
        export.metadata.resource_version = Some(state.bump());
        let k = key(&export.namespace().unwrap_or_default(), &export.name_any());
        state.exports.insert(k, export.clone());
        state.broadcast(|| watcher::Event::Apply(export.clone()));
    }

    /// Delete an export and notify watchers.
    pub fn delete_export(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        if let Some(export) = state.exports.remove(&key(namespace, name)) {
            state.broadcast(|| watcher::Event::Delete(export.clone()));
        }
    }

    /// Overwrite an export's status without notifying watchers.
    pub fn set_export_status(&self, namespace: &str, name: &str, status: ServiceExportStatus) {
        let mut state = self.state.lock();
        let version = state.bump();
        if let Some(export) = state.exports.get_mut(&key(namespace, name)) {
            export.status = Some(status);
            export.metadata.resource_version = Some(version);
        }
    }

    /// Make every Service read hang for `delay`.
    pub fn stall_service_reads(&self, delay: Duration) {
        self.service_read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delete the import and fail the next replace of it with NotFound.
    pub fn vanish_import_on_next_replace(&self, namespace: &str, name: &str) {
        self.state.lock().vanish_on_replace.insert(key(namespace, name));
    }

    pub fn export(&self, namespace: &str, name: &str) -> Option<ServiceExport> {
        self.state.lock().exports.get(&key(namespace, name)).cloned()
    }

    pub fn import(&self, namespace: &str, name: &str) -> Option<ServiceImport> {
        self.state.lock().imports.get(&key(namespace, name)).cloned()
    }

    pub fn insert_import(&self, mut import: ServiceImport) {
        let mut state = self.state.lock();
        import.metadata.resource_version = Some(state.bump());
        let k = key(&import.namespace().unwrap_or_default(), &import.name_any());
        state.imports.insert(k, import);
    }

    pub fn mesh_config(&self) -> Option<MeshConfig> {
        self.state
            .lock()
            .mesh_configs
            .get(&key(MESH_NAMESPACE, MESH_CONFIG))
            .cloned()
    }

    pub fn cluster_set_patches(&self) -> usize {
        self.cluster_set_patches.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().events.clone()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().namespaces.contains(namespace)
    }
}

#[async_trait]
impl MemberClient for FakeMember {
    async fn server_version(&self) -> OperatorResult<ServerVersion> {
        self.state
            .lock()
            .version
            .ok_or_else(|| OperatorError::Unavailable("no version".into()))
    }

    async fn deployment_exists(&self, namespace: &str, name: &str) -> OperatorResult<bool> {
        Ok(self.state.lock().deployments.contains(&key(namespace, name)))
    }

    async fn get_mesh_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<MeshConfig>> {
        Ok(self.state.lock().mesh_configs.get(&key(namespace, name)).cloned())
    }

    async fn patch_cluster_set(
        &self,
        namespace: &str,
        name: &str,
        cluster_set: &ClusterSetSpec,
    ) -> OperatorResult<()> {
        let mut state = self.state.lock();
        let mesh = state
            .mesh_configs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| OperatorError::NotFound {
                kind: "MeshConfig".into(),
                name: name.into(),
                namespace: namespace.into(),
            })?;
        mesh.spec.cluster_set = cluster_set.clone();
        self.cluster_set_patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> OperatorResult<Option<Service>> {
        let delay = self.service_read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self.state.lock().services.get(&key(namespace, name)).cloned())
    }

    async fn ensure_namespace(&self, namespace: &str) -> OperatorResult<()> {
        self.state.lock().namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<ServiceImport>> {
        Ok(self.import(namespace, name))
    }

    async fn create_service_import(&self, import: &ServiceImport) -> OperatorResult<ServiceImport> {
        let mut state = self.state.lock();
        let namespace = import.namespace().unwrap_or_default();
        let name = import.name_any();
        let k = key(&namespace, &name);
        if state.imports.contains_key(&k) {
            return Err(OperatorError::AlreadyExists {
                kind: "ServiceImport".into(),
                name,
                namespace,
            });
        }
        let mut stored = import.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.imports.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_service_import(
        &self,
        import: &ServiceImport,
    ) -> OperatorResult<ServiceImport> {
        let mut state = self.state.lock();
        let namespace = import.namespace().unwrap_or_default();
        let name = import.name_any();
        let k = key(&namespace, &name);
        if state.vanish_on_replace.remove(&k) {
            state.imports.remove(&k);
        }
        let current = state
            .imports
            .get(&k)
            .and_then(|i| i.metadata.resource_version.clone());
        if current.is_none() {
            return Err(OperatorError::NotFound {
                kind: "ServiceImport".into(),
                name,
                namespace,
            });
        }
        if current != import.metadata.resource_version {
            return Err(OperatorError::Conflict {
                kind: "ServiceImport".into(),
                name,
                namespace,
            });
        }
        let mut stored = import.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.imports.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete_service_import(&self, namespace: &str, name: &str) -> OperatorResult<()> {
        self.state.lock().imports.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_service_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<Option<ServiceExport>> {
        Ok(self.export(namespace, name))
    }

    fn watch_service_exports(&self) -> ExportWatchStream {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock();
        let _ = tx.unbounded_send(Ok(watcher::Event::Init));
        for export in state.exports.values() {
            let _ = tx.unbounded_send(Ok(watcher::Event::InitApply(export.clone())));
        }
        let _ = tx.unbounded_send(Ok(watcher::Event::InitDone));
        state.watchers.push(tx);
        rx.boxed()
    }

    async fn update_service_export_status(
        &self,
        export: &ServiceExport,
        status: &ServiceExportStatus,
    ) -> OperatorResult<()> {
        let mut state = self.state.lock();
        let k = key(&export.namespace().unwrap_or_default(), &export.name_any());
        let version = state.bump();
        let Some(stored) = state.exports.get_mut(&k) else {
            return Err(OperatorError::NotFound {
                kind: "ServiceExport".into(),
                name: export.name_any(),
                namespace: export.namespace().unwrap_or_default(),
            });
        };
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.broadcast(|| watcher::Event::Apply(updated.clone()));
        Ok(())
    }

    async fn record_export_event(
        &self,
        export: &ServiceExport,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    ) -> OperatorResult<()> {
        self.state.lock().events.push(RecordedEvent {
            namespace: export.namespace().unwrap_or_default(),
            name: export.name_any(),
            severity,
            reason: reason.to_string(),
            note: note.to_string(),
        });
        Ok(())
    }
}

/// Connects contexts to fake members by kubeconfig.
#[derive(Default)]
pub struct FakeFactory {
    members: Mutex<HashMap<String, Arc<FakeMember>>>,
    connects: AtomicUsize,
}

#[allow(dead_code)]
impl FakeFactory {
    pub fn register(&self, kubeconfig: &str, member: Arc<FakeMember>) {
        self.members.lock().insert(kubeconfig.to_string(), member);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemberClientFactory for FakeFactory {
    async fn connect(&self, ctx: &ConnectorContext) -> OperatorResult<Arc<dyn MemberClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let member = self
            .members
            .lock()
            .get(ctx.kubeconfig())
            .cloned()
            .ok_or_else(|| OperatorError::Kubeconfig(format!("unknown member {}", ctx.kubeconfig())))?;
        Ok(member as Arc<dyn MemberClient>)
    }
}

/// In-memory Cluster store.
#[derive(Default)]
pub struct FakeStore {
    clusters: Mutex<HashMap<String, Cluster>>,
    next_version: AtomicUsize,
}

#[allow(dead_code)]
impl FakeStore {
    fn bump(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Create or update a declaration, stamping uid, generation and resource version.
    pub fn put(&self, mut cluster: Cluster) {
        let mut clusters = self.clusters.lock();
        let name = cluster.name_any();
        let previous = clusters.get(&name);
        cluster.metadata.uid = Some(format!("uid-{name}"));
        cluster.metadata.generation = Some(previous.and_then(|c| c.metadata.generation).unwrap_or(0) + 1);
        cluster.status = previous.and_then(|c| c.status.clone());
        cluster.metadata.resource_version = Some(self.bump());
        clusters.insert(name, cluster);
    }

    pub fn remove(&self, name: &str) {
        self.clusters.lock().remove(name);
    }

    pub fn cluster(&self, name: &str) -> Option<Cluster> {
        self.clusters.lock().get(name).cloned()
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn get(&self, name: &str) -> OperatorResult<Option<Cluster>> {
        Ok(self.cluster(name))
    }

    async fn update_status(&self, name: &str, status: &ClusterStatus) -> OperatorResult<Cluster> {
        let version = self.bump();
        let mut clusters = self.clusters.lock();
        let cluster = clusters.get_mut(name).ok_or_else(|| OperatorError::NotFound {
            kind: "Cluster".into(),
            name: name.into(),
            namespace: String::new(),
        })?;
        cluster.status = Some(status.clone());
        cluster.metadata.resource_version = Some(version);
        Ok(cluster.clone())
    }
}

/// Resolves every name to a fixed address.
pub struct StaticResolver(pub Ipv4Addr);

#[async_trait]
impl GatewayResolver for StaticResolver {
    async fn resolve_ipv4(&self, _host: &str) -> OperatorResult<Option<Ipv4Addr>> {
        Ok(Some(self.0))
    }
}

/// A reconciler, bus and fakes wired together.
#[allow(dead_code)]
pub struct TestFleet {
    pub reconciler: Arc<FederationReconciler>,
    pub broker: Arc<Broker>,
    pub store: Arc<FakeStore>,
    pub factory: Arc<FakeFactory>,
    admission: JoinHandle<()>,
    token: CancellationToken,
}

#[allow(dead_code)]
impl TestFleet {
    pub fn new() -> Self {
        let mut settings = OperatorConfig::default();
        settings.control_plane_uid = CONTROL_PLANE_UID.into();
        settings.informer_sync_timeout_ms = 1_000;
        settings.resync_period_ms = 3_600_000;
        let settings = Arc::new(settings);

        let token = CancellationToken::new();
        let broker = Broker::start(&settings.bus, token.clone());
        let store = Arc::new(FakeStore::default());
        let factory = Arc::new(FakeFactory::default());

        let reconciler = Arc::new(FederationReconciler::new(
            Arc::clone(&store) as Arc<dyn ClusterStore>,
            Arc::clone(&factory) as Arc<dyn MemberClientFactory>,
            Arc::new(StaticResolver(Ipv4Addr::new(10, 1, 1, 1))),
            Arc::clone(&broker),
            settings,
            token.clone(),
        ));
        let admission = reconciler.start_admission();

        Self {
            reconciler,
            broker,
            store,
            factory,
            admission,
            token,
        }
    }

    /// Register a member and declare it, reachable at `10.0.0.<octet>:80`.
    pub fn declare(&self, name: &str, octet: u8, member: Arc<FakeMember>) {
        self.factory.register(name, member);
        self.store.put(cluster(name, &format!("10.0.0.{octet}"), 80));
    }

    pub async fn reconcile(&self, name: &str) {
        self.reconciler
            .reconcile(name)
            .await
            .expect("reconcile should not fail");
    }

    pub async fn shutdown(self) {
        self.reconciler.shutdown().await;
        self.token.cancel();
        let _ = self.admission.await;
    }
}

/// Cluster key of a member in the default locality.
pub fn member_key(name: &str) -> String {
    format!("default/default/default/{name}")
}

/// Declaration of a member whose kubeconfig is its name.
pub fn cluster(name: &str, gateway_host: &str, gateway_port: i32) -> Cluster {
    Cluster::new(
        name,
        ClusterSpec {
            region: "default".into(),
            zone: "default".into(),
            group: "default".into(),
            gateway_host: gateway_host.into(),
            gateway_port,
            kubeconfig: name.into(),
            mesh_config_name: MESH_CONFIG.into(),
            mesh_namespace: MESH_NAMESPACE.into(),
            mode: ClusterMode::OutCluster,
        },
    )
}

/// A ClusterIP Service with the given ports.
pub fn service(namespace: &str, name: &str, ports: &[i32]) -> Service {
    let mut svc = Service::default();
    svc.metadata.name = Some(name.into());
    svc.metadata.namespace = Some(namespace.into());
    svc.spec = Some(ServiceSpec {
        type_: Some("ClusterIP".into()),
        ports: Some(
            ports
                .iter()
                .map(|p| K8sServicePort {
                    name: Some(format!("port-{p}")),
                    port: *p,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    });
    svc
}

/// An export of `ports`, each under path `/`.
pub fn export(namespace: &str, name: &str, ports: &[i32]) -> ServiceExport {
    let mut export = ServiceExport::new(
        name,
        ServiceExportSpec {
            rules: ports
                .iter()
                .map(|p| ServiceExportRule {
                    port_number: *p,
                    path: "/".into(),
                    path_type: PathMatchType::Prefix,
                })
                .collect(),
            ..Default::default()
        },
    );
    export.metadata.namespace = Some(namespace.into());
    export.metadata.generation = Some(1);
    export
}

/// Poll `condition` until it holds or `timeout_ms` passes.
pub async fn wait_for(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
