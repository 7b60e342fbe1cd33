//! Circuit breaker for named protected resources.
//!
//! A breaker starts [`CircuitState::Closed`] and opens after
//! `failure_threshold` consecutive failures. While open it refuses work until
//! `open_duration` has elapsed since the last failure; the next availability
//! check after that is a probe that moves it to [`CircuitState::HalfOpen`].
//! The transition is evaluated lazily on that check, never on a timer.
//! `success_threshold` consecutive successes while half-open close it again;
//! a single failure reopens it.
//!
//! State changes are reported to the [`MonitoringSink`] after the breaker's
//! lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{lock, BreakerConfig, MonitoringSink, ResourceName, Timestamp};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures are being counted.
    Closed,
    /// Refusing work until the open duration has elapsed.
    Open,
    /// Probing; successes are being counted toward closing.
    HalfOpen,
}

/// A state transition reported to monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEvent {
    Opened,
    HalfOpened,
    Closed,
}

/// Point-in-time view of a breaker, as returned by [`CircuitBreaker::state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub resource: ResourceName,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Timestamp>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    half_open_success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<Timestamp>,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_success_count: 0,
            last_failure: None,
            last_failure_at: None,
        }
    }

    fn mark_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Timestamp::now());
    }
}

/// Failure-isolation state machine for one protected resource.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    monitor: Arc<dyn MonitoringSink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker for `config.resource`.
    pub fn new(config: BreakerConfig, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::closed()),
            monitor,
        }
    }

    /// Name of the protected resource.
    pub fn resource(&self) -> &ResourceName {
        &self.config.resource
    }

    /// Returns `true` if work may be attempted now.
    ///
    /// Once an open breaker's `open_duration` has elapsed this call moves it
    /// to half-open and returns `true`.
    pub fn is_available(&self) -> bool {
        let (available, event) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, None),
                CircuitState::Open => {
                    let cooled = inner
                        .last_failure
                        .map_or(true, |at| at.elapsed() >= self.config.open_duration);
                    if cooled {
                        inner.state = CircuitState::HalfOpen;
                        inner.failure_count = 0;
                        inner.half_open_success_count = 0;
                        (true, Some(CircuitEvent::HalfOpened))
                    } else {
                        (false, None)
                    }
                }
            }
        };
        self.emit(event);
        available
    }

    /// Records a successful call against the resource.
    pub fn record_success(&self) {
        let event = {
            let mut inner = lock(&self.inner);
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.half_open_success_count += 1;
                    if inner.half_open_success_count >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.failure_count = 0;
                        inner.half_open_success_count = 0;
                        Some(CircuitEvent::Closed)
                    } else {
                        None
                    }
                }
                // Late completions of calls admitted before the trip.
                CircuitState::Open => None,
            }
        };
        self.emit(event);
    }

    /// Records a failed call against the resource.
    pub fn record_failure(&self) {
        let event = {
            let mut inner = lock(&self.inner);
            inner.failure_count += 1;
            inner.mark_failure();
            match inner.state {
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    inner.state = CircuitState::Open;
                    Some(CircuitEvent::Opened)
                }
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.half_open_success_count = 0;
                    Some(CircuitEvent::Opened)
                }
                _ => None,
            }
        };
        self.emit(event);
    }

    /// Returns the current state without triggering a probe transition.
    pub fn state(&self) -> BreakerSnapshot {
        let inner = lock(&self.inner);
        BreakerSnapshot {
            resource: self.config.resource.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_at,
        }
    }

    /// Forces the breaker back to closed with all counters cleared.
    pub fn reset(&self) {
        let was_closed = {
            let mut inner = lock(&self.inner);
            let was_closed = inner.state == CircuitState::Closed;
            *inner = Inner::closed();
            was_closed
        };
        if !was_closed {
            self.emit(Some(CircuitEvent::Closed));
        }
    }

    fn emit(&self, event: Option<CircuitEvent>) {
        let Some(event) = event else { return };
        match event {
            CircuitEvent::Opened => tracing::warn!(
                resource = %self.config.resource,
                failure_threshold = self.config.failure_threshold,
                "circuit breaker opened"
            ),
            CircuitEvent::HalfOpened => {
                tracing::info!(resource = %self.config.resource, "circuit breaker probing")
            }
            CircuitEvent::Closed => {
                tracing::info!(resource = %self.config.resource, "circuit breaker closed")
            }
        }
        self.monitor.record_circuit_event(&self.config.resource, event);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Hands out one shared [`CircuitBreaker`] per resource name.
///
/// Breakers created here share the template's thresholds.
pub struct BreakerRegistry {
    template: BreakerConfig,
    monitor: Arc<dyn MonitoringSink>,
    breakers: Mutex<HashMap<ResourceName, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Creates an empty registry whose breakers use `template`'s thresholds.
    pub fn new(template: BreakerConfig, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self {
            template,
            monitor,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `resource`, creating it on first use.
    pub fn breaker(&self, resource: &ResourceName) -> Arc<CircuitBreaker> {
        let mut breakers = lock(&self.breakers);
        Arc::clone(breakers.entry(resource.clone()).or_insert_with(|| {
            let config = BreakerConfig {
                resource: resource.clone(),
                ..self.template.clone()
            };
            Arc::new(CircuitBreaker::new(config, Arc::clone(&self.monitor)))
        }))
    }

    /// Snapshots every registered breaker, ordered by resource name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<_> = lock(&self.breakers).values().cloned().collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.state()).collect();
        snapshots.sort_by(|a, b| a.resource.cmp(&b.resource));
        snapshots
    }
}
