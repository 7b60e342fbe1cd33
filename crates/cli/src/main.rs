//! explorer-gate entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Wire observability**: JSON `tracing` output plus an optional OTLP
//!    exporter (see [`telemetry`]).
//! 2. **Load configuration**: `explorer-gate [CONFIG.json|-] [URL...]`. The
//!    first argument names a JSON config file (`-` or absent for defaults).
//! 3. **Construct components**: breaker, quota limiter, session pool, guard
//!    and their collaborators, injected explicitly.
//! 4. **Run**: start the maintenance task, explore every URL as one pooled
//!    batch, then print a JSON report of the gateway's state.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cache::{CacheStats, InMemoryDecisionCache};
use gateway::{
    BatchOperation, BreakerRegistry, BreakerSnapshot, Collaborators, Decision, ExplorationGuard,
    GlobalStats, MaintenanceTask, OperationContext, OperationKind, OperationUsage, PoolStats,
    QuotaLimiter, SessionId, SessionPool, UserId,
};
use monitor::{Alert, CacheEfficiency, ExplorationMonitor, GlobalMetrics, TracingAuditSink};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::AppConfig;

const DEFAULT_TARGETS: [&str; 5] = [
    "https://kalshi.com/markets/inflation",
    "https://polymarket.com/event/fed-decision",
    "https://www.metaculus.com/questions/3479",
    "https://kalshi.com/admin/settings",
    "https://evil.example.com/markets",
];

/// Outcome of exploring one target URL.
#[derive(Debug, Serialize)]
struct TargetOutcome {
    url: String,
    session_id: SessionId,
    navigated: bool,
    extracted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    denied: Option<String>,
}

/// State dump printed when the run completes.
#[derive(Debug, Serialize)]
struct Report {
    outcomes: Vec<TargetOutcome>,
    pool: PoolStats,
    guard: GlobalStats,
    breakers: Vec<BreakerSnapshot>,
    quota: Vec<OperationUsage>,
    metrics: GlobalMetrics,
    cache_efficiency: CacheEfficiency,
    cache: CacheStats,
    alerts: Vec<Alert>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = telemetry::init()?;
    let result = run().await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "explorer-gate failed");
    }
    telemetry.shutdown();
    result
}

async fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().filter(|a| a != "-").map(PathBuf::from);
    let mut targets: Vec<String> = args.collect();
    if targets.is_empty() {
        targets = DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect();
    }

    let config = AppConfig::load(config_path.as_deref())?;
    tracing::info!(
        config = %config_path.as_ref().map_or("<defaults>".into(), |p| p.display().to_string()),
        targets = targets.len(),
        "explorer-gate starting"
    );

    // -- Construct -----------------------------------------------------------
    let monitor = Arc::new(ExplorationMonitor::new(config.monitor));
    let decision_cache = Arc::new(InMemoryDecisionCache::new(config.cache));
    let gw = config.gateway;

    let breakers = BreakerRegistry::new(gw.breaker.clone(), monitor.clone());
    let breaker = breakers.breaker(&gw.breaker.resource);
    let quota = Arc::new(QuotaLimiter::new(gw.quota));
    let pool = SessionPool::new(gw.pool);
    let guard = Arc::new(ExplorationGuard::new(
        gw.guard,
        breaker,
        quota.clone(),
        Collaborators {
            cache: decision_cache.clone(),
            audit: Arc::new(TracingAuditSink),
            monitor: monitor.clone(),
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = MaintenanceTask::new(
        gw.maintenance,
        quota.clone(),
        pool.clone(),
        guard.clone(),
        monitor.clone(),
    )
    .spawn(shutdown_rx);

    // -- Explore -------------------------------------------------------------
    let user = UserId::new(std::env::var("EXPLORER_USER").unwrap_or_else(|_| "local".into()))
        .context("EXPLORER_USER must not be empty")?;
    let operations = targets
        .into_iter()
        .map(|url| {
            let guard = guard.clone();
            let user = user.clone();
            BatchOperation {
                operation: OperationKind::MarketExploration,
                user_id: Some(user.clone()),
                task: move |session_id: SessionId| async move {
                    let outcome = explore(&guard, url, session_id, user).await;
                    Ok::<_, std::convert::Infallible>(outcome)
                },
            }
        })
        .collect();

    let mut outcomes = Vec::new();
    for result in pool.execute_batch(operations).await {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::warn!(error = %e, "exploration could not start"),
        }
    }

    // -- Report --------------------------------------------------------------
    let report = Report {
        outcomes,
        pool: pool.stats(),
        guard: guard.global_stats(),
        breakers: breakers.snapshots(),
        quota: quota.user_status(&user),
        metrics: monitor.global_metrics(),
        cache_efficiency: monitor.cache_efficiency(),
        cache: decision_cache.stats(),
        alerts: monitor.recent_alerts(10),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    shutdown_tx.send_replace(true);
    maintenance.await.context("maintenance task panicked")?;
    pool.close();
    Ok(())
}

/// Navigates to `url` and extracts its order book within one session.
async fn explore(
    guard: &ExplorationGuard,
    url: String,
    session_id: SessionId,
    user: UserId,
) -> TargetOutcome {
    let context = OperationContext::for_session(session_id.clone()).with_user(user);
    let mut outcome = TargetOutcome {
        url,
        session_id: session_id.clone(),
        navigated: false,
        extracted: false,
        denied: None,
    };

    match guard.navigate(&outcome.url, &context, None).await {
        Decision::Allow => outcome.navigated = true,
        Decision::Deny(reason) => outcome.denied = Some(reason.to_string()),
    }
    if outcome.navigated {
        match guard.extract(&context, "orderbook", None).await {
            Decision::Allow => outcome.extracted = true,
            Decision::Deny(reason) => outcome.denied = Some(reason.to_string()),
        }
    }
    guard.end_session(&session_id);
    outcome
}
