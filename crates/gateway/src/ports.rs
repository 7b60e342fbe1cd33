//! Collaborator port traits.
//!
//! The gateway consumes three collaborators supplied by the host application:
//! a decision cache, an audit sink, and a monitoring backend. Adapter crates
//! implement these traits; the gateway only ever holds them as
//! `Arc<dyn Trait>`.
//!
//! None of these collaborators may fail or block a guarded call. Cache errors
//! are logged and treated as a miss; audit and monitoring calls return nothing
//! and must not panic.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    AuditRecord, CircuitEvent, CollaboratorError, Decision, OperationKind, ResourceName,
    SessionId, UserId,
};

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Key under which a [`Decision`] is cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Operation decision, keyed by the session fingerprint.
    Operation(String),
    /// URL verdict, keyed by the URL (plus any per-call policy tag).
    Url(String),
}

impl CacheKey {
    /// Flattens the key into a single namespaced string.
    pub fn to_key_string(&self) -> String {
        match self {
            Self::Operation(fp) => format!("op:{fp}"),
            Self::Url(url) => format!("url:{url}"),
        }
    }
}

/// Stores previously computed guard decisions.
///
/// The cache is an optimisation only: any implementation, including
/// [`NullCache`], preserves the gateway's correctness. Live session counters
/// are never stored here.
#[async_trait]
pub trait DecisionCache: Send + Sync {
    /// Returns the cached decision for `key`, if present and fresh.
    async fn get(&self, key: &CacheKey) -> Result<Option<Decision>, CollaboratorError>;

    /// Stores `decision` under `key`.
    async fn set(&self, key: &CacheKey, decision: &Decision) -> Result<(), CollaboratorError>;
}

/// A cache that never stores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl DecisionCache for NullCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<Decision>, CollaboratorError> {
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _decision: &Decision) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Receives one [`AuditRecord`] per recorded action.
///
/// Fire-and-forget: implementations must return promptly and absorb their own
/// failures.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// An audit sink that discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _record: AuditRecord) {}
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

/// Purely observational hooks invoked by the gateway.
///
/// `cached` flags tell the monitor whether a decision was served from the
/// decision cache rather than recomputed.
pub trait MonitoringSink: Send + Sync {
    /// A session was created on first reference.
    fn start_session(&self, session_id: &SessionId, operation: OperationKind, user_id: Option<&UserId>);

    /// A session was ended explicitly or swept.
    fn end_session(&self, session_id: &SessionId);

    /// A URL was checked against the allow-list.
    fn record_url_validation(&self, session_id: &SessionId, url: &str, safe: bool, cached: bool);

    /// An operation was validated.
    fn record_operation_validation(
        &self,
        session_id: &SessionId,
        operation: OperationKind,
        allowed: bool,
        cached: bool,
    );

    /// Something went wrong inside a session (e.g. a collaborator failed).
    fn record_error(&self, session_id: &SessionId, message: &str);

    /// A circuit breaker changed state.
    fn record_circuit_event(&self, resource: &ResourceName, event: CircuitEvent);

    /// Drops per-session state older than `retention`. Called by the
    /// maintenance task.
    fn cleanup(&self, _retention: Duration) {}
}

/// A monitor that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl MonitoringSink for NoopMonitor {
    fn start_session(&self, _: &SessionId, _: OperationKind, _: Option<&UserId>) {}
    fn end_session(&self, _: &SessionId) {}
    fn record_url_validation(&self, _: &SessionId, _: &str, _: bool, _: bool) {}
    fn record_operation_validation(&self, _: &SessionId, _: OperationKind, _: bool, _: bool) {}
    fn record_error(&self, _: &SessionId, _: &str) {}
    fn record_circuit_event(&self, _: &ResourceName, _: CircuitEvent) {}
}
