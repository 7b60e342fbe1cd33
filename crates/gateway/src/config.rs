//! Gateway configuration.
//!
//! Every knob has a default matching the production deployment, and the whole
//! tree deserialises from JSON with missing fields falling back to those
//! defaults. Durations are written as integer milliseconds.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DomainName, GatewayError, OperationKind, ResourceName};

/// Serde adapter for `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Same as [`duration_ms`] for optional fields.
pub mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Complete configuration for one gateway instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub guard: GuardConfig,
    pub quota: QuotaConfig,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub maintenance: MaintenanceConfig,
}

impl GatewayConfig {
    /// Checks every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), GatewayError> {
        self.guard.validate()?;
        self.quota.validate()?;
        self.pool.validate()?;
        self.breaker.validate()?;
        self.maintenance.validate()
    }
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::Configuration {
        message: message.into(),
    }
}

/// Rejects allow-list entries that are empty once trimmed of whitespace and dots.
fn validate_allow_list(field: &str, entries: &BTreeSet<String>) -> Result<(), GatewayError> {
    match entries
        .iter()
        .find(|entry| DomainName::normalize_entry(entry).is_none())
    {
        Some(entry) => Err(invalid(format!("{field} contains an empty entry: {entry:?}"))),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Session ceilings and URL allow-list applied by the guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Hosts (and their subdomains) that may be navigated to.
    pub allowed_domains: BTreeSet<String>,
    pub max_navigation_depth: u32,
    pub max_markets_per_session: u32,
    #[serde(with = "duration_ms")]
    pub max_exploration_time: Duration,
    /// When `false`, the quota limiter is skipped entirely.
    pub rate_limit_enabled: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            allowed_domains: [
                "kalshi.com",
                "polymarket.com",
                "predictit.org",
                "manifold.markets",
                "metaculus.com",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_navigation_depth: 3,
            max_markets_per_session: 10,
            max_exploration_time: Duration::from_secs(30),
            rate_limit_enabled: true,
        }
    }
}

impl GuardConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        validate_allow_list("guard.allowed_domains", &self.allowed_domains)?;
        if self.max_exploration_time.is_zero() {
            return Err(invalid("guard.max_exploration_time must be positive"));
        }
        Ok(())
    }

    /// Returns a copy of this config with `overrides` applied on top.
    pub fn merged(&self, overrides: &GuardOverrides) -> Self {
        Self {
            allowed_domains: overrides
                .allowed_domains
                .clone()
                .unwrap_or_else(|| self.allowed_domains.clone()),
            max_navigation_depth: overrides
                .max_navigation_depth
                .unwrap_or(self.max_navigation_depth),
            max_markets_per_session: overrides
                .max_markets_per_session
                .unwrap_or(self.max_markets_per_session),
            max_exploration_time: overrides
                .max_exploration_time
                .unwrap_or(self.max_exploration_time),
            rate_limit_enabled: overrides.rate_limit_enabled.unwrap_or(self.rate_limit_enabled),
        }
    }
}

/// Per-call adjustments to [`GuardConfig`]; `None` keeps the base value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardOverrides {
    pub allowed_domains: Option<BTreeSet<String>>,
    pub max_navigation_depth: Option<u32>,
    pub max_markets_per_session: Option<u32>,
    #[serde(with = "option_duration_ms")]
    pub max_exploration_time: Option<Duration>,
    pub rate_limit_enabled: Option<bool>,
}

impl GuardOverrides {
    /// Returns `true` if no field is overridden.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Checks the overridden allow-list, if any.
    pub fn validate(&self) -> Result<(), GatewayError> {
        match &self.allowed_domains {
            Some(entries) => validate_allow_list("overrides.allowed_domains", entries),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

/// Base quota, window and burst allowance for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLimit {
    pub base_limit: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub burst_limit: u32,
}

impl OperationLimit {
    /// `base_limit` requests per `window`, plus `burst_limit` extra.
    pub fn new(base_limit: u32, window: Duration, burst_limit: u32) -> Self {
        Self {
            base_limit,
            window,
            burst_limit,
        }
    }
}

/// Request ceiling for one domain bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLimit {
    pub requests: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
}

impl DomainLimit {
    /// `requests` per `window`.
    pub fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }
}

/// Limits consulted by the [`crate::QuotaLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub operations: BTreeMap<OperationKind, OperationLimit>,
    /// Used for operation kinds missing from `operations`.
    pub default_operation: OperationLimit,
    pub domains: BTreeMap<String, DomainLimit>,
    /// Bucket shared by every domain missing from `domains`.
    pub default_domain: DomainLimit,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let market_exploration = OperationLimit::new(50, minute, 10);
        Self {
            operations: BTreeMap::from([
                (OperationKind::MarketExploration, market_exploration),
                (OperationKind::ArbitrageDiscovery, OperationLimit::new(30, minute, 5)),
                (OperationKind::DataExtraction, OperationLimit::new(20, minute, 3)),
            ]),
            default_operation: market_exploration,
            domains: BTreeMap::from([
                ("kalshi.com".to_string(), DomainLimit::new(100, minute)),
                ("polymarket.com".to_string(), DomainLimit::new(100, minute)),
            ]),
            default_domain: DomainLimit::new(50, minute),
        }
    }
}

impl QuotaConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        let operations = self
            .operations
            .iter()
            .map(|(op, limit)| (op.as_str(), limit))
            .chain(std::iter::once(("default", &self.default_operation)));
        for (name, limit) in operations {
            if limit.window.is_zero() {
                return Err(invalid(format!("quota.operations.{name}.window must be positive")));
            }
        }
        let domains = self
            .domains
            .iter()
            .map(|(d, limit)| (d.as_str(), limit))
            .chain(std::iter::once(("default", &self.default_domain)));
        for (name, limit) in domains {
            if limit.window.is_zero() {
                return Err(invalid(format!("quota.domains.{name}.window must be positive")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Sizing and timers for the [`crate::SessionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_concurrent_sessions: usize,
    /// How long a queued request may wait for a slot.
    #[serde(with = "duration_ms")]
    pub acquisition_timeout: Duration,
    /// Age after which an active slot is force-released.
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            acquisition_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.max_concurrent_sessions == 0 {
            return Err(invalid("pool.max_concurrent_sessions must be at least 1"));
        }
        if self.acquisition_timeout.is_zero() || self.session_timeout.is_zero() {
            return Err(invalid("pool timeouts must be positive"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Thresholds for one [`crate::CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Resource protected by the guard's breaker.
    pub resource: ResourceName,
    pub failure_threshold: u32,
    #[serde(with = "duration_ms")]
    pub open_duration: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            resource: ResourceName::from_static("MCP_OPERATIONS"),
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

impl BreakerConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(invalid("breaker thresholds must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Schedule for the background sweeper (see [`crate::MaintenanceTask`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Time between sweeps.
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Sessions older than this are dropped from the guard.
    #[serde(with = "duration_ms")]
    pub session_retention: Duration,
    /// Monitoring state older than this is discarded.
    #[serde(with = "duration_ms")]
    pub metrics_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        let day = Duration::from_secs(24 * 60 * 60);
        Self {
            interval: Duration::from_secs(60),
            session_retention: day,
            metrics_retention: day,
        }
    }
}

impl MaintenanceConfig {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.interval.is_zero() {
            return Err(invalid("maintenance.interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{ "pool": { "max_concurrent_sessions": 2 }, "guard": { "max_exploration_time": 1500 } }"#;
        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pool.max_concurrent_sessions, 2);
        assert_eq!(config.pool.acquisition_timeout, Duration::from_secs(30));
        assert_eq!(config.guard.max_exploration_time, Duration::from_millis(1500));
        assert_eq!(config.guard.max_navigation_depth, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = GatewayConfig::default();
        config.pool.max_concurrent_sessions = 0;
        assert!(matches!(config.validate(), Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let base = GuardConfig::default();
        let overrides = GuardOverrides {
            max_navigation_depth: Some(7),
            ..GuardOverrides::default()
        };
        let merged = base.merged(&overrides);
        assert_eq!(merged.max_navigation_depth, 7);
        assert_eq!(merged.max_markets_per_session, base.max_markets_per_session);
        assert_eq!(merged.allowed_domains, base.allowed_domains);
        assert!(GuardOverrides::default().is_empty());
        assert!(!overrides.is_empty());
    }

    #[test]
    fn blank_allow_list_entries_are_rejected() {
        let mut config = GatewayConfig::default();
        config.guard.allowed_domains.insert(".".to_string());
        assert!(matches!(config.validate(), Err(GatewayError::Configuration { .. })));

        let overrides = GuardOverrides {
            allowed_domains: Some(BTreeSet::from([" .. ".to_string()])),
            ..GuardOverrides::default()
        };
        assert!(overrides.validate().is_err());
        let mixed_case = GuardOverrides {
            allowed_domains: Some(BTreeSet::from(["Kalshi.com".to_string()])),
            ..GuardOverrides::default()
        };
        assert!(mixed_case.validate().is_ok());
        assert!(GuardOverrides::default().validate().is_ok());
    }
}
