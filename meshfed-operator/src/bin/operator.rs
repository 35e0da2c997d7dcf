//! Meshfed control plane binary.
//!
//! Watches `Cluster` resources, keeps one connector per member and
//! arbitrates the ServiceExports they observe.

use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use meshfed_operator::config::OperatorConfig;
use meshfed_operator::connector::{KubeMemberClientFactory, SystemResolver};
use meshfed_operator::controller::{
    ControllerContext, FederationReconciler, KubeClusterStore, ReconcileAction, error_policy,
};
use meshfed_operator::crd::{Cluster, MeshConfig, ServiceExport, ServiceImport};
use meshfed_operator::error::OperatorError;
use meshfed_operator::messaging::Broker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshfed_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    if std::env::args().any(|arg| arg == "--generate-crds") {
        generate_crds()?;
        return Ok(());
    }

    tracing::info!("Starting meshfed control plane");

    let settings = OperatorConfig::from_env()?;
    if settings.control_plane_uid.is_empty() {
        anyhow::bail!("MESHFED_CONTROL_PLANE_UID must be set");
    }
    let settings = Arc::new(settings);

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let broker = Broker::start(&settings.bus, shutdown.clone());

    let reconciler = Arc::new(FederationReconciler::new(
        Arc::new(KubeClusterStore::new(client.clone())),
        Arc::new(KubeMemberClientFactory::new(client.clone())),
        Arc::new(SystemResolver),
        broker,
        Arc::clone(&settings),
        shutdown.clone(),
    ));
    let admission = reconciler.start_admission();

    let ctx = Arc::new(ControllerContext::new(Arc::clone(&reconciler)));
    run_cluster_controller(client, ctx).await;

    tracing::info!("Cluster controller exited, shutting down");
    reconciler.shutdown().await;
    shutdown.cancel();
    if let Err(e) = admission.await {
        tracing::error!(error = %e, "Admission loop failed");
    }

    Ok(())
}

/// Run the Cluster controller until a shutdown signal arrives.
async fn run_cluster_controller(client: Client, ctx: Arc<ControllerContext>) {
    tracing::info!("Starting Cluster controller");

    let clusters: Api<Cluster> = Api::all(client);

    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            |cluster, ctx: Arc<ControllerContext>| async move {
                let action = ctx.reconciler.reconcile(&cluster.name_any()).await?;
                Ok::<_, OperatorError>(match action {
                    ReconcileAction::Requeue(duration) => Action::requeue(duration),
                    ReconcileAction::Done => Action::await_change(),
                })
            },
            error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(cluster = %obj.name, ?action, "Reconciled cluster");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Cluster controller stream error");
                }
            }
        })
        .await;
}

/// Print CRD manifests.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&Cluster::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&MeshConfig::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&ServiceExport::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&ServiceImport::crd())?);
    Ok(())
}
