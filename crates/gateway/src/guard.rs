//! Guard orchestrator.
//!
//! [`ExplorationGuard`] is the single entry point callers consult before an
//! externally-bound operation. It combines the circuit breaker, the quota
//! limiter and per-session ceilings (time, navigation depth, markets
//! explored) into one [`Decision`], caching decisions through the
//! [`DecisionCache`] port and reporting every validation to the
//! [`MonitoringSink`].
//!
//! Live session state is owned by the guard. The decision cache only ever
//! holds verdicts; the fingerprint it is keyed by is derived from the live
//! counters, so a cached verdict can never outlive the state it was computed
//! from.

use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    lock, ActionKind, AuditRecord, AuditSink, BreakerSnapshot, CacheKey, CircuitBreaker,
    Decision, DecisionCache, DenialReason, DomainName, GuardConfig, GuardOverrides, GuardedError,
    MonitoringSink, NoopAudit, NoopMonitor, NullCache, OperationKind, Priority, QuotaLimiter,
    QuotaOutcome, SearchKind, SessionId, Timestamp, UserId,
};

/// Substrings that mark an authentication or administration path.
const RESTRICTED_SEGMENTS: [&str; 3] = ["login", "signup", "admin"];

/// Substrings that mark configuration or storage access.
const SENSITIVE_SEGMENTS: [&str; 3] = ["admin", "config", "database"];

/// Credential words that are sensitive when they follow an `api/` segment.
const CREDENTIAL_WORDS: [&str; 3] = ["key", "token", "secret"];

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Caller-supplied context for [`ExplorationGuard::validate_operation`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationContext {
    /// Session the validation belongs to. A fresh id is generated when absent.
    pub session_id: Option<SessionId>,
    /// User charged for quota. Falls back to the session's owner.
    pub user_id: Option<UserId>,
    pub priority: Priority,
}

impl OperationContext {
    /// Context bound to an existing (or to-be-created) session.
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Point-in-time copy of one session's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub operation: OperationKind,
    pub user_id: Option<UserId>,
    pub started_at: Timestamp,
    pub elapsed: Duration,
    pub current_depth: u32,
    pub markets_explored: u32,
    pub urls_visited: Vec<String>,
    pub domains_accessed: Vec<DomainName>,
}

/// Aggregate view returned by [`ExplorationGuard::global_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub active_sessions: usize,
    /// Every domain touched by a live session, deduplicated and sorted.
    pub domains_accessed: Vec<DomainName>,
    pub circuit: BreakerSnapshot,
}

/// Collaborators injected into the guard.
///
/// Defaults to no-op implementations of every port.
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn DecisionCache>,
    pub audit: Arc<dyn AuditSink>,
    pub monitor: Arc<dyn MonitoringSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            cache: Arc::new(NullCache),
            audit: Arc::new(NoopAudit),
            monitor: Arc::new(NoopMonitor),
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SessionContext {
    session_id: SessionId,
    operation: OperationKind,
    user_id: Option<UserId>,
    started: Instant,
    started_at: Timestamp,
    current_depth: u32,
    markets_explored: u32,
    urls_visited: Vec<String>,
    domains_accessed: BTreeSet<DomainName>,
}

impl SessionContext {
    fn new(session_id: SessionId, operation: OperationKind, user_id: Option<UserId>) -> Self {
        Self {
            session_id,
            operation,
            user_id,
            started: Instant::now(),
            started_at: Timestamp::now(),
            current_depth: 0,
            markets_explored: 0,
            urls_visited: Vec::new(),
            domains_accessed: BTreeSet::new(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            operation: self.operation,
            user_id: self.user_id.clone(),
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
            current_depth: self.current_depth,
            markets_explored: self.markets_explored,
            urls_visited: self.urls_visited.clone(),
            domains_accessed: self.domains_accessed.iter().cloned().collect(),
        }
    }

    /// Domain bucket used for quota: the host of the first visited URL.
    fn quota_domain(&self) -> Option<DomainName> {
        self.urls_visited.first().and_then(|url| DomainName::from_url(url))
    }
}

/// Counters read under the session lock for one validation.
struct Progress {
    user_id: Option<UserId>,
    elapsed: Duration,
    depth: u32,
    markets: u32,
    domain: Option<DomainName>,
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Pre-flight safety checks for guarded operations.
pub struct ExplorationGuard {
    config: GuardConfig,
    breaker: Arc<CircuitBreaker>,
    quota: Arc<QuotaLimiter>,
    cache: Arc<dyn DecisionCache>,
    audit: Arc<dyn AuditSink>,
    monitor: Arc<dyn MonitoringSink>,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<SessionContext>>>>,
}

impl std::fmt::Debug for ExplorationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplorationGuard")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .field("sessions", &lock(&self.sessions).len())
            .finish_non_exhaustive()
    }
}

impl ExplorationGuard {
    pub fn new(
        config: GuardConfig,
        breaker: Arc<CircuitBreaker>,
        quota: Arc<QuotaLimiter>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            breaker,
            quota,
            cache: collaborators.cache,
            audit: collaborators.audit,
            monitor: collaborators.monitor,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Decides whether `operation` may proceed in the given context.
    ///
    /// Checks run in order and stop at the first refusal: circuit breaker,
    /// exploration time, navigation depth, markets explored, then quota (only
    /// when rate limiting is enabled and a user is known). A circuit-open
    /// refusal is neither cached nor reported; every other verdict is cached
    /// under the session fingerprint and reported to monitoring, including
    /// verdicts served from the cache.
    pub async fn validate_operation(
        &self,
        operation: OperationKind,
        context: &OperationContext,
        overrides: Option<&GuardOverrides>,
    ) -> Decision {
        if !self.breaker.is_available() {
            tracing::debug!(%operation, resource = %self.breaker.resource(), "operation denied: circuit open");
            return Decision::Deny(DenialReason::CircuitOpen);
        }

        let config = self.effective_config(overrides);
        let session_id = context
            .session_id
            .clone()
            .unwrap_or_else(|| SessionId::generate("mcp"));
        let session = self.ensure_session(&session_id, operation, context.user_id.as_ref());
        let progress = {
            let s = lock(&session);
            Progress {
                user_id: context.user_id.clone().or_else(|| s.user_id.clone()),
                elapsed: s.started.elapsed(),
                depth: s.current_depth,
                markets: s.markets_explored,
                domain: s.quota_domain(),
            }
        };

        let key = CacheKey::Operation(fingerprint(operation, &session_id, &progress, &config, overrides));
        if let Some(decision) = self.cached(&key, Some(&session_id)).await {
            self.monitor
                .record_operation_validation(&session_id, operation, decision.is_allowed(), true);
            return decision;
        }

        let decision = self.evaluate(operation, &progress, &config, context.priority);
        if let Decision::Deny(reason) = &decision {
            tracing::debug!(%session_id, %operation, %reason, "operation denied");
        }
        self.store(&key, &decision, Some(&session_id)).await;
        self.monitor
            .record_operation_validation(&session_id, operation, decision.is_allowed(), false);
        decision
    }

    /// Checks `url` against the allow-list and path rules.
    ///
    /// Verdicts are cached per URL (and per allow-list, when overridden).
    /// With a `session_id`, the validation is reported to monitoring; no
    /// session is created.
    pub async fn validate_url(
        &self,
        url: &str,
        overrides: Option<&GuardOverrides>,
        session_id: Option<&SessionId>,
    ) -> Decision {
        let override_list = overrides.and_then(|o| o.allowed_domains.as_ref());
        if let Some(Err(e)) = overrides.map(GuardOverrides::validate) {
            tracing::warn!(error = %e, "blank allow-list entries match no domain");
        }
        let key = match override_list {
            Some(list) => CacheKey::Url(format!(
                "{url}#allow={}",
                list.iter().map(String::as_str).collect::<Vec<_>>().join(",")
            )),
            None => CacheKey::Url(url.to_string()),
        };

        if let Some(decision) = self.cached(&key, session_id).await {
            if let Some(session_id) = session_id {
                self.monitor
                    .record_url_validation(session_id, url, decision.is_allowed(), true);
            }
            return decision;
        }

        let allowed = override_list.unwrap_or(&self.config.allowed_domains);
        let decision = classify_url(url, allowed);
        if let Decision::Deny(reason) = &decision {
            tracing::debug!(url, %reason, "url rejected");
        }
        self.store(&key, &decision, session_id).await;
        if let Some(session_id) = session_id {
            self.monitor
                .record_url_validation(session_id, url, decision.is_allowed(), false);
        }
        decision
    }

    /// Applies an action to a live session and emits an audit record.
    ///
    /// A navigate increments depth, an explore increments markets explored;
    /// any `url` is appended to the visited list. Unknown sessions are ignored.
    pub fn record_action(
        &self,
        session_id: &SessionId,
        action: ActionKind,
        url: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let Some(session) = self.session(session_id) else {
            tracing::debug!(%session_id, %action, "action for unknown session ignored");
            return;
        };

        let record = {
            let mut s = lock(&session);
            if let Some(url) = url {
                s.urls_visited.push(url.to_string());
                if let Some(domain) = DomainName::from_url(url) {
                    s.domains_accessed.insert(domain);
                }
            }
            match action {
                ActionKind::Navigate => s.current_depth += 1,
                ActionKind::Explore => s.markets_explored += 1,
                ActionKind::Extract | ActionKind::Click => {}
            }
            tracing::trace!(
                %session_id,
                %action,
                depth = s.current_depth,
                markets = s.markets_explored,
                ?metadata,
                "session action recorded"
            );
            AuditRecord {
                timestamp: Timestamp::now(),
                operation: s.operation,
                data_source: format!("mcp_{action}"),
                result_count: 1,
                approved: true,
                error: None,
                duration_ms: millis(s.started.elapsed()),
            }
        };
        self.audit.record(record);
    }

    /// Removes a session and returns its final counters.
    pub fn end_session(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let session = lock(&self.sessions).remove(session_id)?;
        let snapshot = lock(&session).snapshot();
        tracing::info!(
            %session_id,
            elapsed = ?snapshot.elapsed,
            markets = snapshot.markets_explored,
            "session ended"
        );
        self.monitor.end_session(session_id);
        Some(snapshot)
    }

    /// Current counters of a live session.
    pub fn session_stats(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.session(session_id).map(|s| lock(&s).snapshot())
    }

    /// Live session count, domains touched, and breaker state.
    pub fn global_stats(&self) -> GlobalStats {
        let sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        let domains: BTreeSet<DomainName> = sessions
            .iter()
            .flat_map(|s| lock(s).domains_accessed.iter().cloned().collect::<Vec<_>>())
            .collect();
        GlobalStats {
            active_sessions: sessions.len(),
            domains_accessed: domains.into_iter().collect(),
            circuit: self.breaker.state(),
        }
    }

    /// Feeds the outcome of a guarded operation into the circuit breaker.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }

    /// Ends every session started more than `retention` ago.
    ///
    /// Returns the number of sessions removed.
    pub fn sweep_sessions(&self, retention: Duration) -> usize {
        let expired: Vec<SessionId> = lock(&self.sessions)
            .iter()
            .filter(|(_, s)| lock(s).started.elapsed() > retention)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.end_session(id))
            .count()
    }

    // -----------------------------------------------------------------------
    // Guarded flows
    // -----------------------------------------------------------------------

    /// Validates a navigation to `url` and, when allowed, records it.
    ///
    /// The URL is checked first; the operation is then validated as market
    /// exploration.
    pub async fn navigate(
        &self,
        url: &str,
        context: &OperationContext,
        overrides: Option<&GuardOverrides>,
    ) -> Decision {
        let (session_id, context) = bind_session(context);
        let verdict = self.validate_url(url, overrides, Some(&session_id)).await;
        if !verdict.is_allowed() {
            return verdict;
        }
        let decision = self
            .validate_operation(OperationKind::MarketExploration, &context, overrides)
            .await;
        if decision.is_allowed() {
            self.record_action(&session_id, ActionKind::Navigate, Some(url), None);
        }
        decision
    }

    /// Validates a data extraction and, when allowed, records it.
    pub async fn extract(
        &self,
        context: &OperationContext,
        data_type: &str,
        overrides: Option<&GuardOverrides>,
    ) -> Decision {
        let (session_id, context) = bind_session(context);
        let decision = self
            .validate_operation(OperationKind::ArbitrageDiscovery, &context, overrides)
            .await;
        if decision.is_allowed() {
            let metadata = serde_json::json!({ "data_type": data_type });
            self.record_action(&session_id, ActionKind::Extract, None, Some(metadata));
        }
        decision
    }

    /// Validates, then runs `task`.
    ///
    /// A success records an explore action; either outcome is fed to the
    /// circuit breaker and, when a user is known, to the quota limiter. Failures
    /// are reported to monitoring, audited as unapproved, and returned.
    pub async fn run_guarded<T, E, F, Fut>(
        &self,
        context: &OperationContext,
        operation: OperationKind,
        overrides: Option<&GuardOverrides>,
        task: F,
    ) -> Result<T, GuardedError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let (session_id, value, _) = self.execute(context, operation, overrides, task).await?;
        self.record_action(&session_id, ActionKind::Explore, None, None);
        Ok(value)
    }

    /// Runs a web or news search under the guard.
    ///
    /// Behaves like [`run_guarded`](Self::run_guarded) under the search's
    /// operation kind, except that a success is audited with the number of
    /// results instead of counting as an explored market.
    pub async fn search<T, E, F, Fut>(
        &self,
        context: &OperationContext,
        kind: SearchKind,
        overrides: Option<&GuardOverrides>,
        task: F,
    ) -> Result<Vec<T>, GuardedError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
        E: std::fmt::Display,
    {
        let operation = kind.operation();
        let (_, results, took) = self.execute(context, operation, overrides, task).await?;
        self.audit.record(AuditRecord {
            timestamp: Timestamp::now(),
            operation,
            data_source: operation.to_string(),
            result_count: u32::try_from(results.len()).unwrap_or(u32::MAX),
            approved: true,
            error: None,
            duration_ms: millis(took),
        });
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Validate, run, and feed the outcome to the breaker and quota limiter.
    ///
    /// Returns the bound session and how long `task` took.
    async fn execute<T, E, F, Fut>(
        &self,
        context: &OperationContext,
        operation: OperationKind,
        overrides: Option<&GuardOverrides>,
        task: F,
    ) -> Result<(SessionId, T, Duration), GuardedError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let (session_id, context) = bind_session(context);
        if let Decision::Deny(reason) = self.validate_operation(operation, &context, overrides).await {
            return Err(GuardedError::Denied(reason));
        }

        let started = Instant::now();
        let result = task().await;
        let took = started.elapsed();
        let charged = self.quota_subject(&session_id, &context);
        match result {
            Ok(value) => {
                self.record_outcome(true);
                if let Some((user_id, domain)) = &charged {
                    self.quota.record_success(user_id, operation, domain.as_ref());
                }
                Ok((session_id, value, took))
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(%session_id, %operation, error = %message, "guarded operation failed");
                self.record_outcome(false);
                if let Some((user_id, _)) = &charged {
                    self.quota.record_failure(user_id, operation);
                }
                self.monitor.record_error(&session_id, &message);
                self.audit.record(AuditRecord {
                    timestamp: Timestamp::now(),
                    operation,
                    data_source: operation.to_string(),
                    result_count: 0,
                    approved: false,
                    error: Some(message),
                    duration_ms: millis(took),
                });
                Err(GuardedError::Operation(e))
            }
        }
    }

    fn effective_config<'a>(&'a self, overrides: Option<&GuardOverrides>) -> Cow<'a, GuardConfig> {
        match overrides {
            Some(o) if !o.is_empty() => Cow::Owned(self.config.merged(o)),
            _ => Cow::Borrowed(&self.config),
        }
    }

    fn session(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionContext>>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// User (and domain bucket) whose quota a validation in `context` charges.
    fn quota_subject(
        &self,
        session_id: &SessionId,
        context: &OperationContext,
    ) -> Option<(UserId, Option<DomainName>)> {
        let session = self.session(session_id)?;
        let s = lock(&session);
        let user_id = context.user_id.clone().or_else(|| s.user_id.clone())?;
        Some((user_id, s.quota_domain()))
    }

    fn ensure_session(
        &self,
        session_id: &SessionId,
        operation: OperationKind,
        user_id: Option<&UserId>,
    ) -> Arc<Mutex<SessionContext>> {
        let (session, created) = match lock(&self.sessions).entry(session_id.clone()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let context = SessionContext::new(session_id.clone(), operation, user_id.cloned());
                (Arc::clone(e.insert(Arc::new(Mutex::new(context)))), true)
            }
        };
        if created {
            tracing::debug!(%session_id, %operation, "session started");
            self.monitor.start_session(session_id, operation, user_id);
        }
        session
    }

    fn evaluate(
        &self,
        operation: OperationKind,
        progress: &Progress,
        config: &GuardConfig,
        priority: Priority,
    ) -> Decision {
        if progress.elapsed > config.max_exploration_time {
            return Decision::Deny(DenialReason::TimeLimitExceeded);
        }
        if progress.depth >= config.max_navigation_depth {
            return Decision::Deny(DenialReason::DepthExceeded);
        }
        if progress.markets >= config.max_markets_per_session {
            return Decision::Deny(DenialReason::MarketsExceeded);
        }
        if config.rate_limit_enabled {
            if let Some(user_id) = &progress.user_id {
                let outcome =
                    self.quota
                        .check_limit(user_id, operation, progress.domain.as_ref(), priority);
                if let QuotaOutcome::Denied(reason) = outcome {
                    return Decision::Deny(reason);
                }
            }
        }
        Decision::Allow
    }

    async fn cached(&self, key: &CacheKey, session_id: Option<&SessionId>) -> Option<Decision> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key = %key.to_key_string(), error = %e, "decision cache lookup failed");
                if let Some(session_id) = session_id {
                    self.monitor.record_error(session_id, &e.to_string());
                }
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, decision: &Decision, session_id: Option<&SessionId>) {
        if let Err(e) = self.cache.set(key, decision).await {
            tracing::warn!(key = %key.to_key_string(), error = %e, "decision cache write failed");
            if let Some(session_id) = session_id {
                self.monitor.record_error(session_id, &e.to_string());
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Pins the context to a concrete session, generating an id if none was given.
fn bind_session(context: &OperationContext) -> (SessionId, OperationContext) {
    let session_id = context
        .session_id
        .clone()
        .unwrap_or_else(|| SessionId::generate("mcp"));
    let context = OperationContext {
        session_id: Some(session_id.clone()),
        ..context.clone()
    };
    (session_id, context)
}

/// Cache key for an operation decision.
///
/// Covers every input the decision depends on: the session's live counters,
/// whether its time budget is spent, the user, and any per-call policy.
fn fingerprint(
    operation: OperationKind,
    session_id: &SessionId,
    progress: &Progress,
    config: &GuardConfig,
    overrides: Option<&GuardOverrides>,
) -> String {
    let user = progress.user_id.as_ref().map_or("-", UserId::as_str);
    let expired = u8::from(progress.elapsed > config.max_exploration_time);
    let mut key = format!(
        "{operation}_{session_id}_{user}_{}_{}_{expired}",
        progress.depth, progress.markets
    );
    if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
        key.push('_');
        key.push_str(&serde_json::to_string(overrides).unwrap_or_default());
    }
    key
}

/// Applies the allow-list and path rules to `url`.
fn classify_url(url: &str, allowed_domains: &BTreeSet<String>) -> Decision {
    let Ok(parsed) = url::Url::parse(url) else {
        return Decision::Deny(DenialReason::InvalidUrl);
    };
    let Some(domain) = parsed
        .host_str()
        .and_then(|h| DomainName::new(h.to_ascii_lowercase()))
    else {
        return Decision::Deny(DenialReason::InvalidUrl);
    };

    if !allowed_domains.iter().any(|allowed| domain.is_within(allowed)) {
        return Decision::Deny(DenialReason::DomainNotAllowed { domain });
    }

    let target = match parsed.query() {
        Some(query) => format!("{}?{query}", parsed.path()),
        None => parsed.path().to_string(),
    }
    .to_ascii_lowercase();

    if RESTRICTED_SEGMENTS.iter().any(|s| target.contains(s)) {
        return Decision::Deny(DenialReason::RestrictedPath);
    }
    let credential_path = target
        .find("api/")
        .map(|at| &target[at + 4..])
        .is_some_and(|rest| CREDENTIAL_WORDS.iter().any(|w| rest.contains(w)));
    if credential_path || SENSITIVE_SEGMENTS.iter().any(|s| target.contains(s)) {
        return Decision::Deny(DenialReason::SensitivePattern);
    }
    Decision::Allow
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{MapCache, RecordingAudit, RecordingMonitor};
    use crate::{BreakerConfig, CollaboratorError, DomainLimit, OperationLimit, QuotaConfig};

    const OP: OperationKind = OperationKind::MarketExploration;

    struct Harness {
        guard: ExplorationGuard,
        quota: Arc<QuotaLimiter>,
        monitor: Arc<RecordingMonitor>,
        audit: Arc<RecordingAudit>,
        cache: Arc<MapCache>,
    }

    fn harness_with(config: GuardConfig, quota: QuotaConfig) -> Harness {
        let monitor = Arc::new(RecordingMonitor::default());
        let audit = Arc::new(RecordingAudit::default());
        let cache = Arc::new(MapCache::default());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), monitor.clone()));
        let quota = Arc::new(QuotaLimiter::new(quota));
        let guard = ExplorationGuard::new(
            config,
            breaker,
            quota.clone(),
            Collaborators {
                cache: cache.clone(),
                audit: audit.clone(),
                monitor: monitor.clone(),
            },
        );
        Harness {
            guard,
            quota,
            monitor,
            audit,
            cache,
        }
    }

    fn harness() -> Harness {
        harness_with(GuardConfig::default(), QuotaConfig::default())
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn tight_quota(base: u32, domain_requests: u32) -> QuotaConfig {
        let minute = Duration::from_secs(60);
        QuotaConfig {
            operations: BTreeMap::new(),
            default_operation: OperationLimit::new(base, minute, 0),
            domains: BTreeMap::new(),
            default_domain: DomainLimit::new(domain_requests, minute),
        }
    }

    // -- URL rules ----------------------------------------------------------

    #[tokio::test]
    async fn url_allow_list_examples() {
        let h = harness();
        assert_eq!(h.guard.validate_url("https://kalshi.com/markets/x", None, None).await, Decision::Allow);

        let evil = h.guard.validate_url("https://evil.com/x", None, None).await;
        assert!(evil.reason().unwrap().to_string().contains("not in allowed list"));

        let admin = h.guard.validate_url("https://kalshi.com/admin", None, None).await;
        assert!(admin.reason().unwrap().to_string().contains("restricted path"));
    }

    #[tokio::test]
    async fn url_rules_cover_subdomains_and_sensitive_paths() {
        let h = harness();
        let check = |url: &'static str| h.guard.validate_url(url, None, None);

        assert_eq!(check("https://api.polymarket.com/events").await, Decision::Allow);
        assert_eq!(
            check("not a url").await,
            Decision::Deny(DenialReason::InvalidUrl)
        );
        assert_eq!(
            check("https://kalshi.com/markets?next=login").await,
            Decision::Deny(DenialReason::RestrictedPath)
        );
        assert_eq!(
            check("https://kalshi.com/api/v2/apikeys").await,
            Decision::Deny(DenialReason::SensitivePattern)
        );
        assert_eq!(
            check("https://kalshi.com/exports/database.csv").await,
            Decision::Deny(DenialReason::SensitivePattern)
        );
        assert!(matches!(
            check("https://notkalshi.com/").await,
            Decision::Deny(DenialReason::DomainNotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn cached_url_verdicts_are_reported_without_creating_sessions() {
        let h = harness();
        let session = sid("s1");
        h.guard.validate_url("https://kalshi.com/m", None, Some(&session)).await;
        h.guard.validate_url("https://kalshi.com/m", None, Some(&session)).await;

        let cached: Vec<bool> = h.monitor.url_validations().iter().map(|v| v.3).collect();
        assert_eq!(cached, vec![false, true]);
        assert!(h.guard.session_stats(&session).is_none());
        assert!(h.monitor.sessions_started().is_empty());
    }

    #[tokio::test]
    async fn overridden_allow_list_is_cached_separately() {
        let h = harness();
        let url = "https://example.org/page";
        assert!(!h.guard.validate_url(url, None, None).await.is_allowed());

        let overrides = GuardOverrides {
            allowed_domains: Some(BTreeSet::from(["example.org".to_string()])),
            ..GuardOverrides::default()
        };
        assert_eq!(h.guard.validate_url(url, Some(&overrides), None).await, Decision::Allow);
    }

    #[tokio::test]
    async fn blank_or_mixed_case_allow_list_entries() {
        let h = harness();
        let url = "https://kalshi.com/markets/x";
        let blank = GuardOverrides {
            allowed_domains: Some(BTreeSet::from([".".to_string()])),
            ..GuardOverrides::default()
        };
        assert!(matches!(
            h.guard.validate_url(url, Some(&blank), None).await,
            Decision::Deny(DenialReason::DomainNotAllowed { .. })
        ));

        let mixed = GuardOverrides {
            allowed_domains: Some(BTreeSet::from(["KALSHI.com".to_string()])),
            ..GuardOverrides::default()
        };
        assert_eq!(h.guard.validate_url(url, Some(&mixed), None).await, Decision::Allow);
    }

    // -- Operation checks ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cache_hits_still_register_with_monitoring() {
        let h = harness();
        let ctx = OperationContext::for_session(sid("s1")).with_user(UserId::new("u1").unwrap());

        assert!(h.guard.validate_operation(OP, &ctx, None).await.is_allowed());
        assert!(h.guard.validate_operation(OP, &ctx, None).await.is_allowed());

        let validations = h.monitor.operation_validations();
        assert_eq!(validations.len(), 2);
        assert_eq!((validations[0].3, validations[1].3), (false, true));
        assert_eq!(h.monitor.sessions_started(), vec![sid("s1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn depth_ceiling_denies_regardless_of_quota() {
        let h = harness_with(GuardConfig::default(), tight_quota(1000, 1000));
        let session = sid("deep");
        let ctx = OperationContext::for_session(session.clone());
        h.guard.validate_operation(OP, &ctx, None).await;
        for _ in 0..3 {
            h.guard.record_action(&session, ActionKind::Navigate, None, None);
        }

        assert_eq!(
            h.guard.validate_operation(OP, &ctx, None).await,
            Decision::Deny(DenialReason::DepthExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn markets_and_time_ceilings_deny() {
        let h = harness();
        let session = sid("busy");
        let ctx = OperationContext::for_session(session.clone());
        h.guard.validate_operation(OP, &ctx, None).await;
        for _ in 0..10 {
            h.guard.record_action(&session, ActionKind::Explore, None, None);
        }
        assert_eq!(
            h.guard.validate_operation(OP, &ctx, None).await,
            Decision::Deny(DenialReason::MarketsExceeded)
        );

        let slow = OperationContext::for_session(sid("slow"));
        assert!(h.guard.validate_operation(OP, &slow, None).await.is_allowed());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            h.guard.validate_operation(OP, &slow, None).await,
            Decision::Deny(DenialReason::TimeLimitExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_denies_without_caching() {
        let h = harness();
        for _ in 0..5 {
            h.guard.record_outcome(false);
        }
        let ctx = OperationContext::for_session(sid("s1"));
        assert_eq!(
            h.guard.validate_operation(OP, &ctx, None).await,
            Decision::Deny(DenialReason::CircuitOpen)
        );
        assert_eq!(h.cache.len(), 0);
        assert!(h.monitor.operation_validations().is_empty());
        assert!(h.guard.session_stats(&sid("s1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_uses_first_visited_domain() {
        let mut h = harness_with(GuardConfig::default(), tight_quota(100, 1));
        h.guard.cache = Arc::new(NullCache);
        let session = sid("s1");
        let ctx = OperationContext::for_session(session.clone()).with_user(UserId::new("u1").unwrap());

        assert!(h.guard.validate_operation(OP, &ctx, None).await.is_allowed());
        h.guard
            .record_action(&session, ActionKind::Click, Some("https://predictit.org/m/1"), None);
        h.guard
            .record_action(&session, ActionKind::Click, Some("https://kalshi.com/m/2"), None);

        assert!(h.guard.validate_operation(OP, &ctx, None).await.is_allowed());
        let denied = h.guard.validate_operation(OP, &ctx, None).await;
        assert_eq!(
            denied.reason().map(ToString::to_string),
            Some("domain limit exceeded for predictit.org".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quota_is_skipped_when_rate_limiting_is_disabled() {
        let config = GuardConfig {
            rate_limit_enabled: false,
            ..GuardConfig::default()
        };
        let mut h = harness_with(config, tight_quota(1, 100));
        h.guard.cache = Arc::new(NullCache);
        let ctx = OperationContext::for_session(sid("s1")).with_user(UserId::new("u1").unwrap());
        for _ in 0..3 {
            assert!(h.guard.validate_operation(OP, &ctx, None).await.is_allowed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overrides_change_the_fingerprint() {
        let h = harness();
        let ctx = OperationContext::for_session(sid("s1"));
        assert!(h.guard.validate_operation(OP, &ctx, None).await.is_allowed());

        let strict = GuardOverrides {
            max_navigation_depth: Some(0),
            ..GuardOverrides::default()
        };
        assert_eq!(
            h.guard.validate_operation(OP, &ctx, Some(&strict)).await,
            Decision::Deny(DenialReason::DepthExceeded)
        );
        assert!(h.guard.validate_operation(OP, &ctx, None).await.is_allowed());
    }

    // -- Session bookkeeping ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn actions_update_counters_and_emit_audit_records() {
        let h = harness();
        let session = sid("s1");
        h.guard.record_action(&sid("ghost"), ActionKind::Navigate, None, None);
        assert!(h.audit.records().is_empty());

        h.guard
            .validate_operation(OP, &OperationContext::for_session(session.clone()), None)
            .await;
        h.guard
            .record_action(&session, ActionKind::Navigate, Some("https://kalshi.com/a"), None);
        h.guard
            .record_action(&session, ActionKind::Explore, Some("https://kalshi.com/b"), None);

        let stats = h.guard.session_stats(&session).unwrap();
        assert_eq!(stats.current_depth, 1);
        assert_eq!(stats.markets_explored, 1);
        assert_eq!(stats.urls_visited.len(), 2);
        assert_eq!(stats.domains_accessed, vec![DomainName::new("kalshi.com").unwrap()]);

        let sources: Vec<_> = h.audit.records().into_iter().map(|r| r.data_source).collect();
        assert_eq!(sources, vec!["mcp_navigate", "mcp_explore"]);
        assert!(h.audit.records().iter().all(|r| r.approved));
    }

    #[tokio::test(start_paused = true)]
    async fn ending_and_sweeping_sessions() {
        let h = harness();
        for id in ["a", "b"] {
            h.guard
                .validate_operation(OP, &OperationContext::for_session(sid(id)), None)
                .await;
        }
        assert_eq!(h.guard.global_stats().active_sessions, 2);

        let ended = h.guard.end_session(&sid("a")).unwrap();
        assert_eq!(ended.session_id, sid("a"));
        assert!(h.guard.end_session(&sid("a")).is_none());
        assert_eq!(h.monitor.sessions_ended(), vec![sid("a")]);

        assert_eq!(h.guard.sweep_sessions(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(h.guard.sweep_sessions(Duration::from_secs(60)), 1);
        assert_eq!(h.guard.global_stats().active_sessions, 0);
    }

    // -- Guarded flows ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn navigate_checks_url_before_recording() {
        let h = harness();
        let session = sid("nav");
        let ctx = OperationContext::for_session(session.clone());
        let denied = h.guard.navigate("https://evil.com/", &ctx, None).await;
        assert!(!denied.is_allowed());
        assert!(h.guard.session_stats(&session).is_none());

        assert!(h.guard.navigate("https://kalshi.com/m/1", &ctx, None).await.is_allowed());
        assert_eq!(h.guard.session_stats(&session).unwrap().current_depth, 1);
        assert_eq!(
            h.guard.global_stats().domains_accessed,
            vec![DomainName::new("kalshi.com").unwrap()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn extract_records_an_extract_action() {
        let h = harness();
        let ctx = OperationContext::for_session(sid("ext")).with_user(UserId::new("u1").unwrap());
        assert!(h.guard.extract(&ctx, "orderbook", None).await.is_allowed());
        assert_eq!(h.guard.session_stats(&sid("ext")).unwrap().user_id, UserId::new("u1"));
        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data_source, "mcp_extract");
        assert_eq!(records[0].operation, OperationKind::ArbitrageDiscovery);
    }

    #[tokio::test(start_paused = true)]
    async fn run_guarded_feeds_the_breaker() {
        let h = harness();
        let ctx = OperationContext::for_session(sid("run"));

        let value = h
            .guard
            .run_guarded(&ctx, OP, None, || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(h.guard.session_stats(&sid("run")).unwrap().markets_explored, 1);

        for i in 0..5 {
            let ctx = OperationContext::for_session(sid(&format!("fail{i}")));
            let err = h
                .guard
                .run_guarded(&ctx, OP, None, || async { Err::<(), _>("upstream 503") })
                .await
                .unwrap_err();
            assert!(matches!(err, GuardedError::Operation("upstream 503")));
        }
        assert_eq!(h.monitor.errors().len(), 5);

        let mut ran = false;
        let err = h
            .guard
            .run_guarded(&ctx, OP, None, || {
                ran = true;
                async { Ok::<_, String>(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardedError::Denied(DenialReason::CircuitOpen)));
        assert!(!ran);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_guarded_operation_spends_burst() {
        let h = harness();
        let user = UserId::new("u1").unwrap();
        let ctx = OperationContext::for_session(sid("burst")).with_user(user.clone());

        let _ = h
            .guard
            .run_guarded(&ctx, OP, None, || async { Err::<(), _>("boom") })
            .await;
        let usage = h.quota.user_status(&user);
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].current_count, 1);
        // Default market exploration burst is 10; the failure spends one.
        assert_eq!(usage[0].burst_remaining, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_operation_is_audited_as_unapproved() {
        let h = harness();
        let ctx = OperationContext::for_session(sid("search"));

        let err = h
            .guard
            .run_guarded(&ctx, OperationKind::BraveWebSearch, None, || async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Err::<(), _>("boom")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardedError::Operation("boom")));

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.operation, OperationKind::BraveWebSearch);
        assert_eq!(record.data_source, "brave_web_search");
        assert!(!record.approved);
        assert_eq!(record.result_count, 0);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.duration_ms, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn search_audits_result_count_without_exploring() {
        let h = harness();
        let ctx = OperationContext::for_session(sid("news")).with_user(UserId::new("u1").unwrap());

        let hits = h
            .guard
            .search(&ctx, SearchKind::News, None, || async {
                Ok::<_, String>(vec!["fed", "cpi", "jobs"])
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, OperationKind::BraveNewsSearch);
        assert_eq!(records[0].result_count, 3);
        assert!(records[0].approved);
        assert_eq!(h.guard.session_stats(&sid("news")).unwrap().markets_explored, 0);
        let usage = h.quota.user_status(&UserId::new("u1").unwrap());
        assert_eq!(usage[0].operation, OperationKind::BraveNewsSearch);
        assert_eq!(usage[0].current_count, 1);
    }

    /// Decision cache whose every call fails.
    struct BrokenCache;

    #[async_trait::async_trait]
    impl DecisionCache for BrokenCache {
        async fn get(&self, _: &CacheKey) -> Result<Option<Decision>, CollaboratorError> {
            Err(CollaboratorError::new("decision cache", "connection refused"))
        }

        async fn set(&self, _: &CacheKey, _: &Decision) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::new("decision cache", "connection refused"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_failures_are_reported_and_swallowed() {
        let monitor = Arc::new(RecordingMonitor::default());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), monitor.clone()));
        let guard = ExplorationGuard::new(
            GuardConfig::default(),
            breaker,
            Arc::new(QuotaLimiter::new(QuotaConfig::default())),
            Collaborators {
                cache: Arc::new(BrokenCache),
                monitor: monitor.clone(),
                ..Collaborators::default()
            },
        );
        let ctx = OperationContext::for_session(sid("flaky-cache")).with_user(UserId::new("u1").unwrap());

        assert_eq!(guard.validate_operation(OP, &ctx, None).await, Decision::Allow);

        let errors = monitor.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|(session, message)| *session == sid("flaky-cache")
                && message.contains("connection refused")));
        let validations = monitor.operation_validations();
        assert_eq!(validations.len(), 1);
        assert!(validations[0].2 && !validations[0].3);
    }
}
