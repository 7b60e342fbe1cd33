//! Observability adapters for the gateway.
//!
//! ## Architectural Layer
//!
//! **Infrastructure adapter.** Implements the gateway's `MonitoringSink` and
//! `AuditSink` ports.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`metrics`] | `ExplorationMonitor`: session/global metrics, alerts, cache efficiency |
//! | [`audit`] | `TracingAuditSink`: audit records as `tracing` events |

pub mod audit;
pub mod metrics;

pub use audit::TracingAuditSink;
pub use metrics::{
    Alert, AlertKind, AlertLevel, CacheEfficiency, ExplorationMonitor, GlobalMetrics,
    MonitorConfig, SessionError, SessionMetrics,
};
