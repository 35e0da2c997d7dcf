//! Control plane configuration.

use crate::error::{OperatorError, OperatorResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default name of the mesh controller deployment expected in every member.
pub const DEFAULT_MESH_CONTROLLER_NAME: &str = "mesh-controller";

/// Configuration for the federation control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// UID stamped into every adopted member's mesh config.
    pub control_plane_uid: String,

    /// Deployment that must exist in the member's mesh namespace.
    pub mesh_controller_name: String,

    /// Oldest member API server accepted.
    pub min_server_version: ServerVersion,

    /// Upper bound on waiting for a member's initial export listing.
    pub informer_sync_timeout_ms: u64,

    /// Interval at which cached exports are re-published.
    pub resync_period_ms: u64,

    /// Event bus tuning.
    pub bus: BusConfig,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber buffer capacity.
    pub subscriber_buffer: usize,

    /// How long delivery waits on a full subscriber buffer before dropping.
    pub publish_timeout_ms: u64,

    /// Sustained ingress rate (messages per second).
    pub rate_limit: f64,

    /// Token bucket burst size.
    pub burst: u32,

    /// First backoff step when the ingress worker is throttled.
    pub base_backoff_ms: u64,

    /// Ceiling for the throttle backoff.
    pub max_backoff_ms: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            control_plane_uid: String::new(),
            mesh_controller_name: DEFAULT_MESH_CONTROLLER_NAME.to_string(),
            min_server_version: ServerVersion::new(1, 19),
            informer_sync_timeout_ms: 30_000,
            resync_period_ms: 5 * 60 * 1000,
            bus: BusConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024 * 10,
            publish_timeout_ms: 100,
            rate_limit: 8192.0,
            burst: 9216,
            base_backoff_ms: 5,
            max_backoff_ms: 1000 * 1000,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from `MESHFED_*` environment variables on top of defaults.
    pub fn from_env() -> OperatorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> OperatorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(uid) = lookup("MESHFED_CONTROL_PLANE_UID") {
            config.control_plane_uid = uid;
        }
        if let Some(name) = lookup("MESHFED_MESH_CONTROLLER_NAME") {
            config.mesh_controller_name = name;
        }
        if let Some(version) = lookup("MESHFED_MIN_SERVER_VERSION") {
            config.min_server_version = version.parse()?;
        }
        if let Some(secs) = lookup("MESHFED_INFORMER_SYNC_TIMEOUT_SECS") {
            config.informer_sync_timeout_ms = parse_number::<u64>("MESHFED_INFORMER_SYNC_TIMEOUT_SECS", &secs)? * 1000;
        }
        if let Some(secs) = lookup("MESHFED_RESYNC_PERIOD_SECS") {
            config.resync_period_ms = parse_number::<u64>("MESHFED_RESYNC_PERIOD_SECS", &secs)? * 1000;
        }
        if let Some(size) = lookup("MESHFED_BUS_BUFFER") {
            config.bus.subscriber_buffer = parse_number("MESHFED_BUS_BUFFER", &size)?;
        }
        if let Some(ms) = lookup("MESHFED_BUS_PUBLISH_TIMEOUT_MS") {
            config.bus.publish_timeout_ms = parse_number("MESHFED_BUS_PUBLISH_TIMEOUT_MS", &ms)?;
        }
        if let Some(rate) = lookup("MESHFED_BUS_RATE_LIMIT") {
            config.bus.rate_limit = parse_number("MESHFED_BUS_RATE_LIMIT", &rate)?;
        }
        if let Some(burst) = lookup("MESHFED_BUS_BURST") {
            config.bus.burst = parse_number("MESHFED_BUS_BURST", &burst)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.mesh_controller_name.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "mesh controller name must not be empty".into(),
            ));
        }
        if self.resync_period_ms == 0 || self.informer_sync_timeout_ms == 0 {
            return Err(OperatorError::InvalidConfig(
                "resync period and informer sync timeout must be positive".into(),
            ));
        }
        if self.bus.subscriber_buffer == 0 {
            return Err(OperatorError::InvalidConfig(
                "bus subscriber buffer must be positive".into(),
            ));
        }
        if self.bus.rate_limit <= 0.0 || self.bus.burst == 0 {
            return Err(OperatorError::InvalidConfig(
                "bus rate limit and burst must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Initial sync wait as a Duration.
    pub fn informer_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.informer_sync_timeout_ms)
    }

    /// Resync interval as a Duration.
    pub fn resync_period(&self) -> Duration {
        Duration::from_millis(self.resync_period_ms)
    }
}

impl BusConfig {
    /// Publish timeout as a Duration.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Throttle backoff bounds as Durations.
    pub fn backoff_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> OperatorResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OperatorError::InvalidConfig(format!("{key} has invalid value {value:?}")))
}

/// Kubernetes API server version, compared on (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl ServerVersion {
    /// Create a version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the `major`/`minor` strings reported by `/version`.
    ///
    /// Managed offerings append suffixes such as `"27+"`; only the leading digits count.
    pub fn from_parts(major: &str, minor: &str) -> OperatorResult<Self> {
        Ok(Self {
            major: leading_number(major)?,
            minor: leading_number(minor)?,
        })
    }
}

fn leading_number(part: &str) -> OperatorResult<u32> {
    let digits: String = part.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .map_err(|_| OperatorError::InvalidConfig(format!("invalid version component {part:?}")))
}

impl FromStr for ServerVersion {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        match (parts.next(), parts.next()) {
            (Some(major), Some(minor)) => Self::from_parts(major, minor),
            _ => Err(OperatorError::InvalidConfig(format!(
                "invalid server version {s:?}, expected major.minor"
            ))),
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_bus_limits() {
        let config = OperatorConfig::default();
        assert_eq!(config.bus.subscriber_buffer, 10240);
        assert_eq!(config.bus.burst, 9216);
        assert_eq!(config.min_server_version, ServerVersion::new(1, 19));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("MESHFED_CONTROL_PLANE_UID", "cp-1"),
            ("MESHFED_MIN_SERVER_VERSION", "v1.25"),
            ("MESHFED_RESYNC_PERIOD_SECS", "60"),
            ("MESHFED_BUS_BUFFER", "16"),
        ]
        .into_iter()
        .collect();

        let config =
            OperatorConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.control_plane_uid, "cp-1");
        assert_eq!(config.min_server_version, ServerVersion::new(1, 25));
        assert_eq!(config.resync_period(), Duration::from_secs(60));
        assert_eq!(config.bus.subscriber_buffer, 16);
    }

    #[test]
    fn rejects_garbage_numbers() {
        let result = OperatorConfig::from_lookup(|key| {
            (key == "MESHFED_BUS_BUFFER").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn server_version_parsing_and_ordering() {
        assert_eq!(
            ServerVersion::from_parts("1", "27+").unwrap(),
            ServerVersion::new(1, 27)
        );
        assert!(ServerVersion::new(1, 18) < ServerVersion::new(1, 19));
        assert!(ServerVersion::new(2, 0) > ServerVersion::new(1, 30));
        assert!("1".parse::<ServerVersion>().is_err());
        assert_eq!(ServerVersion::new(1, 19).to_string(), "1.19");
    }
}
