//! Validated locality and gateway descriptor of a member.

use crate::crd::Cluster;
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("DNS-1123 subdomain pattern is valid")
});

const DNS1123_SUBDOMAIN_MAX_LEN: usize = 253;

/// Whether `value` is a DNS-1123 subdomain.
pub fn is_dns1123_subdomain(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= DNS1123_SUBDOMAIN_MAX_LEN
        && DNS1123_SUBDOMAIN.is_match(value)
}

/// Compose the canonical `region/zone/group/name` key.
pub fn cluster_key(region: &str, zone: &str, group: &str, name: &str) -> String {
    format!("{region}/{zone}/{group}/{name}")
}

/// Where a member sits in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locality {
    /// Region.
    pub region: String,
    /// Zone.
    pub zone: String,
    /// Group.
    pub group: String,
    /// Member name.
    pub name: String,
}

impl Locality {
    /// Create a locality.
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            group: group.into(),
            name: name.into(),
        }
    }

    /// Locality declared by a Cluster.
    pub fn of(cluster: &Cluster) -> Self {
        Self::new(
            cluster.spec.region.clone(),
            cluster.spec.zone.clone(),
            cluster.spec.group.clone(),
            cluster.name_any(),
        )
    }

    /// Canonical key.
    pub fn key(&self) -> String {
        cluster_key(&self.region, &self.zone, &self.group, &self.name)
    }
}

/// Resolves gateway names to IPv4 addresses.
#[async_trait]
pub trait GatewayResolver: Send + Sync {
    /// First IPv4 address of `host`, or `None` when it has none.
    async fn resolve_ipv4(&self, host: &str) -> OperatorResult<Option<Ipv4Addr>>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl GatewayResolver for SystemResolver {
    async fn resolve_ipv4(&self, host: &str) -> OperatorResult<Option<Ipv4Addr>> {
        let addrs = match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "Gateway lookup failed");
                return Ok(None);
            }
        };
        Ok(addrs.into_iter().find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }))
    }
}

/// Connection descriptor of one member, fixed for the connector's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    locality: Locality,
    key: String,
    gateway_host: String,
    gateway_ip: Ipv4Addr,
    gateway_port: u16,
    control_plane_uid: String,
}

impl ConnectorConfig {
    /// Validate and resolve a member's gateway.
    pub async fn new(
        locality: Locality,
        gateway_host: &str,
        gateway_port: i32,
        control_plane_uid: &str,
        resolver: &dyn GatewayResolver,
    ) -> OperatorResult<Self> {
        let key = locality.key();
        let gateway_ip = resolve_gateway(gateway_host, resolver).await?;

        if gateway_ip.is_loopback() || gateway_ip.is_unspecified() {
            return Err(OperatorError::UnusableGatewayIp { ip: gateway_ip });
        }

        let gateway_port = u16::try_from(gateway_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(OperatorError::InvalidGatewayPort { port: gateway_port })?;

        Ok(Self {
            locality,
            key,
            gateway_host: gateway_host.to_string(),
            gateway_ip,
            gateway_port,
            control_plane_uid: control_plane_uid.to_string(),
        })
    }

    /// Build the descriptor declared by a Cluster.
    pub async fn for_cluster(
        cluster: &Cluster,
        control_plane_uid: &str,
        resolver: &dyn GatewayResolver,
    ) -> OperatorResult<Self> {
        Self::new(
            Locality::of(cluster),
            &cluster.spec.gateway_host,
            cluster.spec.gateway_port,
            control_plane_uid,
            resolver,
        )
        .await
    }

    /// Member name.
    pub fn name(&self) -> &str {
        &self.locality.name
    }

    /// Region.
    pub fn region(&self) -> &str {
        &self.locality.region
    }

    /// Zone.
    pub fn zone(&self) -> &str {
        &self.locality.zone
    }

    /// Group.
    pub fn group(&self) -> &str {
        &self.locality.group
    }

    /// Locality.
    pub fn locality(&self) -> &Locality {
        &self.locality
    }

    /// Canonical cluster key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Gateway host as declared.
    pub fn gateway_host(&self) -> &str {
        &self.gateway_host
    }

    /// Resolved gateway address.
    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway_ip
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway_port
    }

    /// UID of the control plane that built this descriptor.
    pub fn control_plane_uid(&self) -> &str {
        &self.control_plane_uid
    }
}

impl fmt::Display for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{} -> {})",
            self.key, self.gateway_host, self.gateway_port, self.gateway_ip
        )
    }
}

async fn resolve_gateway(host: &str, resolver: &dyn GatewayResolver) -> OperatorResult<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    if !is_dns1123_subdomain(host) {
        return Err(OperatorError::InvalidGatewayHost {
            host: host.to_string(),
        });
    }
    resolver
        .resolve_ipv4(host)
        .await?
        .ok_or_else(|| OperatorError::UnresolvedGatewayHost {
            host: host.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticResolver(HashMap<&'static str, Ipv4Addr>);

    #[async_trait]
    impl GatewayResolver for StaticResolver {
        async fn resolve_ipv4(&self, host: &str) -> OperatorResult<Option<Ipv4Addr>> {
            Ok(self.0.get(host).copied())
        }
    }

    fn resolver() -> StaticResolver {
        StaticResolver(
            [
                ("gw.member-a.example", Ipv4Addr::new(10, 0, 0, 1)),
                ("loop.example", Ipv4Addr::LOCALHOST),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn locality() -> Locality {
        Locality::new("default", "default", "default", "a")
    }

    #[tokio::test]
    async fn ipv4_literal_skips_resolution() {
        let config = ConnectorConfig::new(locality(), "192.168.1.7", 8080, "cp", &resolver())
            .await
            .unwrap();
        assert_eq!(config.gateway_ip(), Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(config.gateway_port(), 8080);
        assert_eq!(config.key(), "default/default/default/a");
        assert_eq!(config.control_plane_uid(), "cp");
    }

    #[tokio::test]
    async fn dns_name_is_resolved() {
        let config = ConnectorConfig::new(locality(), "gw.member-a.example", 80, "cp", &resolver())
            .await
            .unwrap();
        assert_eq!(config.gateway_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.gateway_host(), "gw.member-a.example");
    }

    #[tokio::test]
    async fn loopback_and_unspecified_are_rejected() {
        for host in ["127.0.0.1", "0.0.0.0", "loop.example"] {
            let err = ConnectorConfig::new(locality(), host, 80, "cp", &resolver())
                .await
                .unwrap_err();
            assert!(
                matches!(err, OperatorError::UnusableGatewayIp { .. }),
                "{host}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn malformed_host_is_invalid() {
        let err = ConnectorConfig::new(locality(), "Not_A_Host!", 80, "cp", &resolver())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::InvalidGatewayHost { .. }));
    }

    #[tokio::test]
    async fn unknown_name_is_unresolved() {
        let err = ConnectorConfig::new(locality(), "missing.example", 80, "cp", &resolver())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::UnresolvedGatewayHost { .. }));
    }

    #[tokio::test]
    async fn port_range_is_enforced() {
        for port in [0, -1, 65536] {
            let err = ConnectorConfig::new(locality(), "10.1.1.1", port, "cp", &resolver())
                .await
                .unwrap_err();
            assert!(matches!(err, OperatorError::InvalidGatewayPort { .. }));
        }
        assert!(
            ConnectorConfig::new(locality(), "10.1.1.1", 65535, "cp", &resolver())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn key_has_four_segments() {
        let pattern = Regex::new(r"^[^/]+/[^/]+/[^/]+/[^/]+$").unwrap();
        let config = ConnectorConfig::new(
            Locality::new("eu", "eu-west-1a", "payments", "prod-1"),
            "10.2.0.9",
            443,
            "cp",
            &resolver(),
        )
        .await
        .unwrap();
        assert!(pattern.is_match(config.key()));
    }

    #[test]
    fn dns_subdomain_rules() {
        assert!(is_dns1123_subdomain("gateway.example.com"));
        assert!(is_dns1123_subdomain("a"));
        assert!(!is_dns1123_subdomain(""));
        assert!(!is_dns1123_subdomain("-leading.example"));
        assert!(!is_dns1123_subdomain("UPPER.example"));
        assert!(!is_dns1123_subdomain(&"a".repeat(254)));
    }
}
