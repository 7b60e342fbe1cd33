//! Shared value types for the gateway domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! the vocabulary of guard decisions: which operation is being attempted, which
//! action was taken, and why a request was refused.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DomainName;

// ---------------------------------------------------------------------------
// Operation vocabulary
// ---------------------------------------------------------------------------

/// Kind of externally-bound operation a caller wants to perform.
///
/// Selects the quota bucket in the limiter and tags sessions, pool slots and
/// monitoring records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    MarketExploration,
    ArbitrageDiscovery,
    CrossPlatformAnalysis,
    RelatedMarketNavigation,
    BraveNewsSearch,
    BraveWebSearch,
    BreakingNewsMonitoring,
    WeatherEvJob,
    DataExtraction,
}

impl OperationKind {
    /// Returns the snake-case key used in configuration and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarketExploration => "market_exploration",
            Self::ArbitrageDiscovery => "arbitrage_discovery",
            Self::CrossPlatformAnalysis => "cross_platform_analysis",
            Self::RelatedMarketNavigation => "related_market_navigation",
            Self::BraveNewsSearch => "brave_news_search",
            Self::BraveWebSearch => "brave_web_search",
            Self::BreakingNewsMonitoring => "breaking_news_monitoring",
            Self::WeatherEvJob => "weather_ev_job",
            Self::DataExtraction => "data_extraction",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flavour of a guarded search, see [`crate::ExplorationGuard::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    Web,
    News,
}

impl SearchKind {
    /// Operation kind the search is validated and charged as.
    pub fn operation(self) -> OperationKind {
        match self {
            Self::Web => OperationKind::BraveWebSearch,
            Self::News => OperationKind::BraveNewsSearch,
        }
    }
}

/// An action recorded against a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Follows a link; increments navigation depth.
    Navigate,
    /// Pulls data out of the current page.
    Extract,
    /// Interacts with the current page.
    Click,
    /// Finishes exploring one market; increments the markets counter.
    Explore,
}

impl ActionKind {
    /// Returns the snake-case name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Extract => "extract",
            Self::Click => "click",
            Self::Explore => "explore",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller priority for quota accounting.
///
/// Only [`Priority::High`] changes behavior: it draws on the burst allowance
/// before the base quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Why a guarded operation or URL was refused.
///
/// Every refusal the gateway produces, whether a policy denial or malformed
/// input, is one of these values. `Display` yields the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenialReason {
    /// The protecting circuit breaker is open.
    CircuitOpen,
    /// The session has been running longer than the configured maximum.
    TimeLimitExceeded,
    /// The session reached its maximum navigation depth.
    DepthExceeded,
    /// The session explored its maximum number of markets.
    MarketsExceeded,
    /// The per-domain request window is full.
    DomainRateLimited {
        domain: DomainName,
        retry_after: Duration,
    },
    /// The user's base quota and burst allowance are both spent.
    UserRateLimited {
        operation: OperationKind,
        retry_after: Duration,
    },
    /// The URL could not be parsed or has no host.
    InvalidUrl,
    /// The URL host is not on the allow-list.
    DomainNotAllowed { domain: DomainName },
    /// The URL targets an authentication or administration path.
    RestrictedPath,
    /// The URL matches a pattern associated with credential or config access.
    SensitivePattern,
}

impl DenialReason {
    /// How long the caller should wait before retrying, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::DomainRateLimited { retry_after, .. }
            | Self::UserRateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open: too many recent failures"),
            Self::TimeLimitExceeded => write!(f, "exploration time limit exceeded"),
            Self::DepthExceeded => write!(f, "maximum navigation depth exceeded"),
            Self::MarketsExceeded => write!(f, "maximum markets per session exceeded"),
            Self::DomainRateLimited { domain, .. } => {
                write!(f, "domain limit exceeded for {domain}")
            }
            Self::UserRateLimited { operation, .. } => {
                write!(f, "{operation} rate limit exceeded")
            }
            Self::InvalidUrl => write!(f, "invalid URL format"),
            Self::DomainNotAllowed { domain } => write!(f, "domain {domain} not in allowed list"),
            Self::RestrictedPath => write!(f, "URL contains restricted path"),
            Self::SensitivePattern => write!(f, "URL contains sensitive pattern"),
        }
    }
}

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenialReason),
}

impl Decision {
    /// Returns `true` if the operation may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Returns the denial reason, or `None` for [`Decision::Allow`].
    pub fn reason(&self) -> Option<&DenialReason> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// One entry handed to the [`crate::AuditSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: Timestamp,
    pub operation: OperationKind,
    /// Where the data came from, e.g. `"mcp_navigate"`.
    pub data_source: String,
    pub result_count: u32,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Session age for actions; run time for guarded operations.
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly. Interval arithmetic inside the gateway uses the monotonic
/// [`tokio::time::Instant`] instead; this type only labels records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
