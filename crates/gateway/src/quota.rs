//! Per-user and per-domain quota accounting.
//!
//! Each (user, operation) pair owns a [`QuotaRecord`]: a base allowance of
//! `base_limit` requests plus `burst_limit` extra requests per window. Each
//! domain owns a request counter with its own window. A domain-bound request
//! must pass both.
//!
//! Windows are fixed, not sliding, and expire lazily: every check first
//! resets any bucket whose window has elapsed, so callers never observe a
//! stale count even if [`QuotaLimiter::sweep`] never runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    lock, DenialReason, DomainLimit, DomainName, OperationKind, OperationLimit, Priority,
    QuotaConfig, UserId,
};

/// Which allowance admitted a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaSource {
    Base,
    Burst,
}

/// Result of [`QuotaLimiter::check_limit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaOutcome {
    Admitted(QuotaSource),
    Denied(DenialReason),
}

impl QuotaOutcome {
    /// Returns `true` if the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// Suggested wait before retrying, for denials.
    pub fn wait_time(&self) -> Option<Duration> {
        match self {
            Self::Admitted(_) => None,
            Self::Denied(reason) => reason.retry_after(),
        }
    }
}

/// Consumption state of one (user, operation) pair within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRecord {
    pub count: u32,
    pub reset_at: Instant,
    pub burst_remaining: u32,
}

impl QuotaRecord {
    fn fresh(limit: &OperationLimit, now: Instant) -> Self {
        Self {
            count: 0,
            reset_at: now + limit.window,
            burst_remaining: limit.burst_limit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DomainQuota {
    limit: DomainLimit,
    current_count: u32,
    last_reset: Instant,
}

impl DomainQuota {
    fn new(limit: DomainLimit, now: Instant) -> Self {
        Self {
            limit,
            current_count: 0,
            last_reset: now,
        }
    }

    fn refresh(&mut self, now: Instant) {
        if now.duration_since(self.last_reset) > self.limit.window {
            self.current_count = 0;
            self.last_reset = now;
        }
    }
}

/// One row of [`QuotaLimiter::user_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationUsage {
    pub operation: OperationKind,
    pub current_count: u32,
    pub burst_remaining: u32,
    /// Time left until the window resets.
    pub resets_in: Duration,
}

/// Result of [`QuotaLimiter::domain_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainUsage {
    /// The bucket name: the domain itself, or `"default"`.
    pub bucket: String,
    pub current_count: u32,
    pub limit: u32,
    pub resets_in: Duration,
}

#[derive(Debug)]
struct Tables {
    operation_limits: BTreeMap<OperationKind, OperationLimit>,
    default_operation: OperationLimit,
    users: HashMap<UserId, HashMap<OperationKind, QuotaRecord>>,
    /// Named buckets; anything else shares `default_domain`.
    domains: HashMap<String, DomainQuota>,
    default_domain: DomainQuota,
}

impl Tables {
    fn domain_mut(&mut self, domain: &DomainName) -> &mut DomainQuota {
        match self.domains.get_mut(domain.as_str()) {
            Some(bucket) => bucket,
            None => &mut self.default_domain,
        }
    }
}

/// Quota limiter shared by every caller of the gateway.
///
/// All tables live behind one lock; each check is a short critical section
/// with no I/O.
#[derive(Debug)]
pub struct QuotaLimiter {
    tables: Mutex<Tables>,
}

impl QuotaLimiter {
    /// Creates a limiter with the given operation and domain limits.
    pub fn new(config: QuotaConfig) -> Self {
        let now = Instant::now();
        let domains = config
            .domains
            .into_iter()
            .map(|(name, limit)| (name.to_ascii_lowercase(), DomainQuota::new(limit, now)))
            .collect();
        Self {
            tables: Mutex::new(Tables {
                operation_limits: config.operations,
                default_operation: config.default_operation,
                users: HashMap::new(),
                domains,
                default_domain: DomainQuota::new(config.default_domain, now),
            }),
        }
    }

    /// Decides whether `user_id` may perform `operation` now, consuming one
    /// unit of quota on admission.
    ///
    /// The domain bucket is checked before any user quota is touched, so a
    /// domain denial never consumes the user's allowance. Base quota is used
    /// before burst except for [`Priority::High`] callers, who draw on burst
    /// first.
    pub fn check_limit(
        &self,
        user_id: &UserId,
        operation: OperationKind,
        domain: Option<&DomainName>,
        priority: Priority,
    ) -> QuotaOutcome {
        let now = Instant::now();
        let mut tables = lock(&self.tables);
        let limit = tables
            .operation_limits
            .get(&operation)
            .copied()
            .unwrap_or(tables.default_operation);

        if let Some(domain) = domain {
            let bucket = tables.domain_mut(domain);
            bucket.refresh(now);
            if bucket.current_count >= bucket.limit.requests {
                let elapsed = now.duration_since(bucket.last_reset);
                let retry_after = bucket.limit.window.saturating_sub(elapsed);
                tracing::debug!(%user_id, %domain, ?retry_after, "domain quota exhausted");
                return QuotaOutcome::Denied(DenialReason::DomainRateLimited {
                    domain: domain.clone(),
                    retry_after,
                });
            }
        }

        let record = tables
            .users
            .entry(user_id.clone())
            .or_default()
            .entry(operation)
            .or_insert_with(|| QuotaRecord::fresh(&limit, now));
        if now > record.reset_at {
            *record = QuotaRecord::fresh(&limit, now);
        }

        let source = if record.count >= limit.base_limit && record.burst_remaining == 0 {
            let retry_after = record.reset_at.saturating_duration_since(now);
            tracing::debug!(%user_id, %operation, ?retry_after, "user quota exhausted");
            return QuotaOutcome::Denied(DenialReason::UserRateLimited {
                operation,
                retry_after,
            });
        } else if priority == Priority::High && record.burst_remaining > 0 {
            record.burst_remaining -= 1;
            QuotaSource::Burst
        } else if record.count < limit.base_limit {
            record.count += 1;
            QuotaSource::Base
        } else {
            record.burst_remaining -= 1;
            QuotaSource::Burst
        };

        if let Some(domain) = domain {
            tables.domain_mut(domain).current_count += 1;
        }
        QuotaOutcome::Admitted(source)
    }

    /// Notes a successful operation. Accounting happens in
    /// [`check_limit`](Self::check_limit); this only traces.
    pub fn record_success(&self, user_id: &UserId, operation: OperationKind, domain: Option<&DomainName>) {
        tracing::trace!(%user_id, %operation, domain = ?domain.map(DomainName::as_str), "guarded operation succeeded");
    }

    /// Shrinks the remaining burst allowance by one after a failed operation,
    /// so repeated failures cannot cascade through the burst budget.
    pub fn record_failure(&self, user_id: &UserId, operation: OperationKind) {
        let mut tables = lock(&self.tables);
        if let Some(record) = tables
            .users
            .get_mut(user_id)
            .and_then(|ops| ops.get_mut(&operation))
        {
            record.burst_remaining = record.burst_remaining.saturating_sub(1);
        }
    }

    /// Current consumption for every operation `user_id` has used this window.
    pub fn user_status(&self, user_id: &UserId) -> Vec<OperationUsage> {
        let now = Instant::now();
        let tables = lock(&self.tables);
        let mut usage: Vec<_> = tables
            .users
            .get(user_id)
            .into_iter()
            .flatten()
            .map(|(operation, record)| OperationUsage {
                operation: *operation,
                current_count: record.count,
                burst_remaining: record.burst_remaining,
                resets_in: record.reset_at.saturating_duration_since(now),
            })
            .collect();
        usage.sort_by_key(|u| u.operation);
        usage
    }

    /// Current state of a named domain bucket, or of the default bucket when
    /// `domain` is `None`. Returns `None` for unknown names.
    pub fn domain_status(&self, domain: Option<&str>) -> Option<DomainUsage> {
        let now = Instant::now();
        let tables = lock(&self.tables);
        let (bucket, quota) = match domain {
            None | Some("default") => ("default".to_string(), &tables.default_domain),
            Some(name) => {
                let name = name.to_ascii_lowercase();
                let quota = tables.domains.get(&name)?;
                (name, quota)
            }
        };
        let elapsed = now.duration_since(quota.last_reset);
        Some(DomainUsage {
            bucket,
            current_count: quota.current_count,
            limit: quota.limit.requests,
            resets_in: quota.limit.window.saturating_sub(elapsed),
        })
    }

    /// Replaces the limits for `operation`. Existing records keep their
    /// current window.
    pub fn update_operation_limit(&self, operation: OperationKind, limit: OperationLimit) {
        lock(&self.tables).operation_limits.insert(operation, limit);
    }

    /// Replaces the limits for `domain`, creating the bucket if needed.
    pub fn update_domain_limit(&self, domain: &str, limit: DomainLimit) {
        let now = Instant::now();
        let mut tables = lock(&self.tables);
        let name = domain.to_ascii_lowercase();
        if name == "default" {
            tables.default_domain.limit = limit;
            return;
        }
        tables
            .domains
            .entry(name)
            .and_modify(|bucket| bucket.limit = limit)
            .or_insert_with(|| DomainQuota::new(limit, now));
    }

    /// Drops expired user records and resets elapsed domain windows.
    ///
    /// Returns the number of user records removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut tables = lock(&self.tables);
        let mut removed = 0;
        tables.users.retain(|_, ops| {
            let before = ops.len();
            ops.retain(|_, record| now <= record.reset_at);
            removed += before - ops.len();
            !ops.is_empty()
        });
        for bucket in tables.domains.values_mut() {
            bucket.refresh(now);
        }
        tables.default_domain.refresh(now);
        removed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn limiter(base: u32, burst: u32, domain_requests: u32) -> QuotaLimiter {
        QuotaLimiter::new(QuotaConfig {
            operations: BTreeMap::from([(
                OperationKind::MarketExploration,
                OperationLimit::new(base, HOUR, burst),
            )]),
            default_operation: OperationLimit::new(base, HOUR, burst),
            domains: BTreeMap::from([(
                "kalshi.com".to_string(),
                DomainLimit::new(domain_requests, Duration::from_secs(60)),
            )]),
            default_domain: DomainLimit::new(domain_requests, Duration::from_secs(60)),
        })
    }

    fn user() -> UserId {
        UserId::new("alice").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn base_then_burst_then_denied_until_window_resets() {
        let limiter = limiter(100, 10, 1_000);
        let op = OperationKind::MarketExploration;

        for _ in 0..100 {
            assert_eq!(
                limiter.check_limit(&user(), op, None, Priority::Medium),
                QuotaOutcome::Admitted(QuotaSource::Base)
            );
        }
        for _ in 0..10 {
            assert_eq!(
                limiter.check_limit(&user(), op, None, Priority::Medium),
                QuotaOutcome::Admitted(QuotaSource::Burst)
            );
        }

        tokio::time::advance(Duration::from_secs(600)).await;
        let denied = limiter.check_limit(&user(), op, None, Priority::Medium);
        assert!(!denied.is_allowed());
        assert_eq!(denied.wait_time(), Some(HOUR - Duration::from_secs(600)));

        tokio::time::advance(HOUR).await;
        assert_eq!(
            limiter.check_limit(&user(), op, None, Priority::Medium),
            QuotaOutcome::Admitted(QuotaSource::Base)
        );
        let status = limiter.user_status(&user());
        assert_eq!(status[0].current_count, 1);
        assert_eq!(status[0].burst_remaining, 10);
    }

    #[test]
    fn high_priority_draws_burst_before_base() {
        let limiter = limiter(5, 2, 1_000);
        let op = OperationKind::MarketExploration;

        assert_eq!(
            limiter.check_limit(&user(), op, None, Priority::High),
            QuotaOutcome::Admitted(QuotaSource::Burst)
        );
        let status = limiter.user_status(&user());
        assert_eq!(status[0].current_count, 0);
        assert_eq!(status[0].burst_remaining, 1);
    }

    #[test]
    fn domain_denial_does_not_consume_user_quota() {
        let limiter = limiter(100, 10, 2);
        let op = OperationKind::MarketExploration;
        let domain = DomainName::new("kalshi.com").unwrap();

        assert!(limiter.check_limit(&user(), op, Some(&domain), Priority::Medium).is_allowed());
        assert!(limiter.check_limit(&user(), op, Some(&domain), Priority::High).is_allowed());

        let denied = limiter.check_limit(&user(), op, Some(&domain), Priority::Medium);
        assert!(matches!(
            denied,
            QuotaOutcome::Denied(DenialReason::DomainRateLimited { .. })
        ));
        assert!(denied.wait_time().unwrap() <= Duration::from_secs(60));

        let status = limiter.user_status(&user());
        assert_eq!(status[0].current_count, 1);
        assert_eq!(status[0].burst_remaining, 9);
        assert_eq!(limiter.domain_status(Some("kalshi.com")).unwrap().current_count, 2);
    }

    #[test]
    fn unknown_domains_share_the_default_bucket() {
        let limiter = limiter(100, 10, 1);
        let op = OperationKind::MarketExploration;
        let a = DomainName::new("predictit.org").unwrap();
        let b = DomainName::new("metaculus.com").unwrap();

        assert!(limiter.check_limit(&user(), op, Some(&a), Priority::Medium).is_allowed());
        assert!(!limiter.check_limit(&user(), op, Some(&b), Priority::Medium).is_allowed());
        assert_eq!(limiter.domain_status(None).unwrap().current_count, 1);
        assert!(limiter.domain_status(Some("predictit.org")).is_none());
    }

    #[test]
    fn failures_shrink_burst_allowance() {
        let limiter = limiter(1, 2, 1_000);
        let op = OperationKind::MarketExploration;
        assert!(limiter.check_limit(&user(), op, None, Priority::Medium).is_allowed());

        limiter.record_failure(&user(), op);
        limiter.record_failure(&user(), op);
        limiter.record_failure(&user(), op);
        assert_eq!(limiter.user_status(&user())[0].burst_remaining, 0);
        assert!(!limiter.check_limit(&user(), op, None, Priority::Medium).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_records_and_resets_domains() {
        let limiter = limiter(10, 0, 5);
        let op = OperationKind::MarketExploration;
        let domain = DomainName::new("kalshi.com").unwrap();
        assert!(limiter.check_limit(&user(), op, Some(&domain), Priority::Medium).is_allowed());

        assert_eq!(limiter.sweep(), 0);
        tokio::time::advance(HOUR + Duration::from_secs(1)).await;
        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.user_status(&user()).is_empty());
        assert_eq!(limiter.domain_status(Some("kalshi.com")).unwrap().current_count, 0);
    }

    #[test]
    fn unknown_operations_use_the_default_limit() {
        let limiter = limiter(1, 0, 1_000);
        let op = OperationKind::BraveWebSearch;
        assert!(limiter.check_limit(&user(), op, None, Priority::Medium).is_allowed());
        assert!(!limiter.check_limit(&user(), op, None, Priority::Medium).is_allowed());

        limiter.update_operation_limit(op, OperationLimit::new(5, HOUR, 0));
        assert!(limiter.check_limit(&user(), op, None, Priority::Medium).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn updated_domain_limit_gets_its_own_bucket() {
        let limiter = limiter(10, 0, 1);
        let op = OperationKind::MarketExploration;
        let domain = DomainName::new("predictit.org").unwrap();

        limiter.update_domain_limit("PredictIt.org", DomainLimit::new(2, Duration::from_secs(60)));
        assert!(limiter.check_limit(&user(), op, Some(&domain), Priority::Medium).is_allowed());
        assert!(limiter.check_limit(&user(), op, Some(&domain), Priority::Medium).is_allowed());
        assert!(!limiter.check_limit(&user(), op, Some(&domain), Priority::Medium).is_allowed());

        let status = limiter.domain_status(Some("predictit.org")).unwrap();
        assert_eq!((status.current_count, status.limit), (2, 2));
        assert_eq!(limiter.domain_status(None).unwrap().current_count, 0);
        limiter.record_success(&user(), op, Some(&domain));
    }
}
