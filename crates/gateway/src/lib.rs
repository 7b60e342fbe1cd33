//! Guarded operation gateway.
//!
//! Sits in front of every externally-bound exploration operation (market
//! navigation, data extraction, web and news search) and decides, before the
//! operation runs, whether it may proceed. The decision combines failure
//! isolation, per-user and per-domain quotas, bounded concurrency and
//! per-session ceilings.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** Cache stores, audit sinks and
//! monitoring backends are supplied through the traits in [`ports`]; adapter
//! crates implement them. Every component is an explicitly constructed
//! instance owned by the host's composition root.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`SessionId`, `UserId`, `DomainName`, ...) |
//! | [`types`] | Operation vocabulary, `Decision`, `DenialReason`, `AuditRecord`, `Timestamp` |
//! | [`errors`] | `GatewayError`, `CollaboratorError`, batch and guarded-run errors |
//! | [`config`] | `GatewayConfig` and its sections, with defaults and validation |
//! | [`ports`] | Collaborator traits: `DecisionCache`, `AuditSink`, `MonitoringSink` |
//! | [`breaker`] | `CircuitBreaker` and `BreakerRegistry` |
//! | [`quota`] | `QuotaLimiter`: per-user windows with burst, per-domain buckets |
//! | [`pool`] | `SessionPool`: FIFO-admitted bounded concurrency |
//! | [`guard`] | `ExplorationGuard`: the orchestrating entry point |
//! | [`maintenance`] | `MaintenanceTask`: periodic sweeps |

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod breaker;
pub mod config;
pub mod errors;
pub mod guard;
pub mod identifiers;
pub mod maintenance;
pub mod pool;
pub mod ports;
pub mod quota;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitEvent, CircuitState};
pub use config::{
    BreakerConfig, DomainLimit, GatewayConfig, GuardConfig, GuardOverrides, MaintenanceConfig,
    OperationLimit, PoolConfig, QuotaConfig,
};
pub use errors::{BatchError, CollaboratorError, GatewayError, GuardedError};
pub use guard::{Collaborators, ExplorationGuard, GlobalStats, OperationContext, SessionSnapshot};
pub use identifiers::{DomainName, ResourceName, SessionId, UserId};
pub use maintenance::{MaintenanceTask, SweepReport};
pub use pool::{BatchOperation, PoolStats, SessionPool, SlotLease};
pub use ports::{
    AuditSink, CacheKey, DecisionCache, MonitoringSink, NoopAudit, NoopMonitor, NullCache,
};
pub use quota::{DomainUsage, OperationUsage, QuotaLimiter, QuotaOutcome, QuotaRecord, QuotaSource};
pub use types::{
    ActionKind, AuditRecord, Decision, DenialReason, OperationKind, Priority, SearchKind,
    Timestamp,
};

/// Locks `mutex`, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its state consistent between
/// statements, so a poisoned lock carries no torn data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
