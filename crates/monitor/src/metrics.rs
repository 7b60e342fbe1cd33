//! In-memory monitoring collaborator.
//!
//! Tracks per-session counters, process-wide totals and a bounded ring of
//! alerts. Everything is observational: no method fails and nothing here
//! feeds back into guard decisions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gateway::config::duration_ms;
use gateway::{
    CircuitEvent, MonitoringSink, OperationKind, ResourceName, SessionId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Alerting thresholds for [`ExplorationMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Capacity of the alert ring; the oldest alert is dropped past it.
    pub max_alerts: usize,
    /// Errors within one session at which an error-rate alert is raised.
    pub error_alert_threshold: usize,
    /// Session age past which an error raises a long-running alert.
    #[serde(with = "duration_ms")]
    pub long_session: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_alerts: 100,
            error_alert_threshold: 3,
            long_session: Duration::from_secs(5 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// Reported types
// ---------------------------------------------------------------------------

/// One error recorded against a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionError {
    pub timestamp: Timestamp,
    pub message: String,
}

/// Counters for one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub session_id: SessionId,
    pub operation: OperationKind,
    pub user_id: Option<UserId>,
    pub started_at: Timestamp,
    pub urls_validated: u64,
    pub operations_validated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: Vec<SessionError>,
    /// Age of the session when the snapshot was taken.
    pub duration: Duration,
}

/// Process-wide totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalMetrics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Mean duration of ended sessions.
    pub average_session_duration: Duration,
    pub total_urls_validated: u64,
    pub total_operations_validated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub circuit_breaker_trips: u64,
    pub last_updated: Timestamp,
}

/// Hit rates in percent, `0.0` where nothing was looked up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheEfficiency {
    pub url_cache_hit_rate: f64,
    pub operation_cache_hit_rate: f64,
    pub overall_hit_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CircuitBreaker,
    ErrorRate,
    Performance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub session_id: Option<SessionId>,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LiveSession {
    metrics: SessionMetrics,
    started: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct HitCounter {
    hits: u64,
    misses: u64,
}

impl HitCounter {
    fn record(&mut self, cached: bool) {
        if cached {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    fn total(self) -> u64 {
        self.hits + self.misses
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<SessionId, LiveSession>,
    total_sessions: u64,
    ended_sessions: u64,
    ended_duration_total: Duration,
    successful_operations: u64,
    failed_operations: u64,
    total_urls_validated: u64,
    url_cache: HitCounter,
    operation_cache: HitCounter,
    circuit_breaker_trips: u64,
    alerts: VecDeque<Alert>,
}

impl State {
    fn finish(&mut self, session_id: &SessionId) -> Option<Duration> {
        let live = self.sessions.remove(session_id)?;
        let duration = live.started.elapsed();
        self.ended_sessions += 1;
        self.ended_duration_total += duration;
        Some(duration)
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// [`MonitoringSink`] that keeps metrics and alerts in memory.
#[derive(Debug, Default)]
pub struct ExplorationMonitor {
    config: MonitorConfig,
    state: Mutex<State>,
}

impl ExplorationMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Counters for a live session.
    pub fn session_metrics(&self, session_id: &SessionId) -> Option<SessionMetrics> {
        self.state().sessions.get(session_id).map(|live| SessionMetrics {
            duration: live.started.elapsed(),
            ..live.metrics.clone()
        })
    }

    pub fn global_metrics(&self) -> GlobalMetrics {
        let state = self.state();
        let average_session_duration = u32::try_from(state.ended_sessions)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| state.ended_duration_total / n);
        GlobalMetrics {
            total_sessions: state.total_sessions,
            active_sessions: state.sessions.len() as u64,
            total_operations: state.successful_operations + state.failed_operations,
            successful_operations: state.successful_operations,
            failed_operations: state.failed_operations,
            average_session_duration,
            total_urls_validated: state.total_urls_validated,
            total_operations_validated: state.operation_cache.total(),
            cache_hits: state.url_cache.hits + state.operation_cache.hits,
            cache_misses: state.url_cache.misses + state.operation_cache.misses,
            circuit_breaker_trips: state.circuit_breaker_trips,
            last_updated: Timestamp::now(),
        }
    }

    pub fn cache_efficiency(&self) -> CacheEfficiency {
        let state = self.state();
        let (url, op) = (state.url_cache, state.operation_cache);
        CacheEfficiency {
            url_cache_hit_rate: percent(url.hits, url.total()),
            operation_cache_hit_rate: percent(op.hits, op.total()),
            overall_hit_rate: percent(url.hits + op.hits, url.total() + op.total()),
        }
    }

    /// The `limit` most recent alerts, oldest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let state = self.state();
        let skip = state.alerts.len().saturating_sub(limit);
        state.alerts.iter().skip(skip).cloned().collect()
    }

    /// Ends every session older than `retention`, returning how many.
    pub fn cleanup_older_than(&self, retention: Duration) -> usize {
        let mut state = self.state();
        let expired: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, live)| live.started.elapsed() > retention)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.finish(id);
        }
        if !expired.is_empty() {
            tracing::debug!(sessions = expired.len(), "expired session metrics discarded");
        }
        expired.len()
    }

    fn raise(&self, state: &mut State, alert: Alert) {
        match alert.level {
            AlertLevel::Error => tracing::error!(kind = ?alert.kind, session_id = ?alert.session_id, "{}", alert.message),
            AlertLevel::Warning => tracing::warn!(kind = ?alert.kind, session_id = ?alert.session_id, "{}", alert.message),
            AlertLevel::Info => tracing::info!(kind = ?alert.kind, session_id = ?alert.session_id, "{}", alert.message),
        }
        state.alerts.push_back(alert);
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MonitoringSink for ExplorationMonitor {
    fn start_session(&self, session_id: &SessionId, operation: OperationKind, user_id: Option<&UserId>) {
        let mut state = self.state();
        state.total_sessions += 1;
        state.sessions.insert(
            session_id.clone(),
            LiveSession {
                metrics: SessionMetrics {
                    session_id: session_id.clone(),
                    operation,
                    user_id: user_id.cloned(),
                    started_at: Timestamp::now(),
                    urls_validated: 0,
                    operations_validated: 0,
                    cache_hits: 0,
                    cache_misses: 0,
                    errors: Vec::new(),
                    duration: Duration::ZERO,
                },
                started: Instant::now(),
            },
        );
    }

    fn end_session(&self, session_id: &SessionId) {
        if let Some(duration) = self.state().finish(session_id) {
            tracing::debug!(%session_id, ?duration, "session metrics closed");
        }
    }

    fn record_url_validation(&self, session_id: &SessionId, _url: &str, _safe: bool, cached: bool) {
        let mut state = self.state();
        state.total_urls_validated += 1;
        state.url_cache.record(cached);
        if let Some(live) = state.sessions.get_mut(session_id) {
            live.metrics.urls_validated += 1;
            bump_cache(&mut live.metrics, cached);
        }
    }

    fn record_operation_validation(
        &self,
        session_id: &SessionId,
        _operation: OperationKind,
        allowed: bool,
        cached: bool,
    ) {
        let mut state = self.state();
        state.operation_cache.record(cached);
        if allowed {
            state.successful_operations += 1;
        } else {
            state.failed_operations += 1;
        }
        if let Some(live) = state.sessions.get_mut(session_id) {
            live.metrics.operations_validated += 1;
            bump_cache(&mut live.metrics, cached);
        }
    }

    fn record_error(&self, session_id: &SessionId, message: &str) {
        let mut state = self.state();
        let Some(live) = state.sessions.get_mut(session_id) else {
            return;
        };
        live.metrics.errors.push(SessionError {
            timestamp: Timestamp::now(),
            message: message.to_string(),
        });
        let errors = live.metrics.errors.len();
        let age = live.started.elapsed();

        if errors >= self.config.error_alert_threshold {
            self.raise(
                &mut state,
                Alert {
                    level: AlertLevel::Error,
                    kind: AlertKind::ErrorRate,
                    message: format!("high error rate in session {session_id}: {errors} errors"),
                    session_id: Some(session_id.clone()),
                    timestamp: Timestamp::now(),
                },
            );
        }
        if age > self.config.long_session {
            self.raise(
                &mut state,
                Alert {
                    level: AlertLevel::Warning,
                    kind: AlertKind::Performance,
                    message: format!("long-running session {session_id} ({}s)", age.as_secs()),
                    session_id: Some(session_id.clone()),
                    timestamp: Timestamp::now(),
                },
            );
        }
    }

    fn record_circuit_event(&self, resource: &ResourceName, event: CircuitEvent) {
        if event != CircuitEvent::Opened {
            return;
        }
        let mut state = self.state();
        state.circuit_breaker_trips += 1;
        self.raise(
            &mut state,
            Alert {
                level: AlertLevel::Warning,
                kind: AlertKind::CircuitBreaker,
                message: format!("circuit breaker {resource} opened: too many failures"),
                session_id: None,
                timestamp: Timestamp::now(),
            },
        );
    }

    fn cleanup(&self, retention: Duration) {
        self.cleanup_older_than(retention);
    }
}

fn bump_cache(metrics: &mut SessionMetrics, cached: bool) {
    if cached {
        metrics.cache_hits += 1;
    } else {
        metrics.cache_misses += 1;
    }
}
