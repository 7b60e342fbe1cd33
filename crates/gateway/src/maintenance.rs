//! Background sweeper.
//!
//! Expiry in the gateway is lazy: quota windows and breaker cool-downs are
//! re-evaluated whenever they are touched. The maintenance task only reclaims
//! memory and capacity that nothing touches any more: expired quota records,
//! orphaned pool slots, stale sessions and old monitoring state.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{ExplorationGuard, MaintenanceConfig, MonitoringSink, QuotaLimiter, SessionPool};

/// What one sweep reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub quota_records: usize,
    pub pool_slots: usize,
    pub sessions: usize,
}

/// Periodically sweeps the gateway's components.
pub struct MaintenanceTask {
    config: MaintenanceConfig,
    quota: Arc<QuotaLimiter>,
    pool: SessionPool,
    guard: Arc<ExplorationGuard>,
    monitor: Arc<dyn MonitoringSink>,
}

impl MaintenanceTask {
    pub fn new(
        config: MaintenanceConfig,
        quota: Arc<QuotaLimiter>,
        pool: SessionPool,
        guard: Arc<ExplorationGuard>,
        monitor: Arc<dyn MonitoringSink>,
    ) -> Self {
        Self {
            config,
            quota,
            pool,
            guard,
            monitor,
        }
    }

    /// Runs every sweep once.
    pub fn run_once(&self) -> SweepReport {
        let report = SweepReport {
            quota_records: self.quota.sweep(),
            pool_slots: self.pool.sweep(),
            sessions: self.guard.sweep_sessions(self.config.session_retention),
        };
        self.monitor.cleanup(self.config.metrics_retention);
        if report != SweepReport::default() {
            tracing::info!(
                quota_records = report.quota_records,
                pool_slots = report.pool_slots,
                sessions = report.sessions,
                "maintenance sweep reclaimed state"
            );
        }
        report
    }

    /// Sweeps every `interval` until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("maintenance task stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}
