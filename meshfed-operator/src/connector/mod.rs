//! Per-member connectors.
//!
//! - [`ConnectorConfig`]: validated locality and gateway of a member
//! - [`ConnectorContext`]: cancellable handle to a running connector
//! - [`MemberClient`]: the connector's view of the member API server
//! - [`RemoteConnector`]: informer plus federation message handlers

mod client;
mod config;
mod context;
mod event;
mod remote;

pub use client::{
    EVENT_REPORTER, EventSeverity, ExportWatchStream, KubeMemberClient, KubeMemberClientFactory,
    MemberClient, MemberClientFactory,
};
pub use config::{
    ConnectorConfig, GatewayResolver, Locality, SystemResolver, cluster_key, is_dns1123_subdomain,
};
pub use context::ConnectorContext;
pub use event::ServiceExportEvent;
pub use remote::{ConnectorSubscriptions, RemoteConnector};
