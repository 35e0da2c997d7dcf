//! Federation controllers.
//!
//! - [`FederationReconciler`]: keeps one connector per Cluster and admits exports
//! - [`admission`]: the cross-member admission rules
//! - [`ClusterStore`]: where declarations are read and status is written
//!
//! # Usage with kube-runtime
//!
//! ```ignore
//! use meshfed_operator::controller::{ControllerContext, error_policy};
//!
//! Controller::new(clusters, watcher_config)
//!     .run(|cluster, ctx| async move {
//!         ctx.reconciler.reconcile(&cluster.name_any()).await
//!     }, error_policy, context)
//!     .for_each(|_| futures::future::ready(()))
//!     .await;
//! ```

pub mod admission;
mod federation;
mod store;

pub use admission::{AdmissionDecision, DropReason, ExportConflict, PeerView};
pub use federation::{FederationReconciler, cluster_hash, error_policy};
pub use store::{ClusterStore, KubeClusterStore};

use std::sync::Arc;

/// Shared context for controllers.
pub struct ControllerContext {
    /// The fleet supervisor.
    pub reconciler: Arc<FederationReconciler>,
}

impl ControllerContext {
    /// Create a new controller context.
    pub fn new(reconciler: Arc<FederationReconciler>) -> Self {
        Self { reconciler }
    }
}

/// Result type for reconciliation actions.
#[derive(Debug)]
pub enum ReconcileAction {
    /// Requeue after the specified duration.
    Requeue(std::time::Duration),
    /// Don't requeue (reconciliation complete).
    Done,
}

impl ReconcileAction {
    /// Requeue after 5 seconds (transient failures).
    pub fn requeue_short() -> Self {
        Self::Requeue(std::time::Duration::from_secs(5))
    }

    /// Requeue after 30 seconds (waiting on external resources).
    pub fn requeue_medium() -> Self {
        Self::Requeue(std::time::Duration::from_secs(30))
    }
}
