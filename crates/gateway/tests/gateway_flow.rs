//! End-to-end flows through the public gateway API.

use std::sync::Arc;
use std::time::Duration;

use gateway::{
    BatchOperation, BreakerConfig, CircuitBreaker, CircuitState, Collaborators, Decision,
    DenialReason, ExplorationGuard, GatewayConfig, GuardedError, OperationContext, OperationKind,
    Priority, QuotaLimiter, QuotaOutcome, QuotaSource, SessionId, SessionPool, UserId,
};
use pretty_assertions::assert_eq;

struct Gateway {
    guard: Arc<ExplorationGuard>,
    pool: SessionPool,
    quota: Arc<QuotaLimiter>,
    breaker: Arc<CircuitBreaker>,
}

fn gateway(config: GatewayConfig) -> Gateway {
    config.validate().unwrap();
    let collaborators = Collaborators::default();
    let breaker = Arc::new(CircuitBreaker::new(config.breaker, collaborators.monitor.clone()));
    let quota = Arc::new(QuotaLimiter::new(config.quota));
    let guard = Arc::new(ExplorationGuard::new(
        config.guard,
        breaker.clone(),
        quota.clone(),
        collaborators,
    ));
    Gateway {
        guard,
        pool: SessionPool::new(config.pool),
        quota,
        breaker,
    }
}

#[tokio::test(start_paused = true)]
async fn batch_of_guarded_explorations_shares_the_pool() {
    let gw = gateway(GatewayConfig::default());
    let user = UserId::new("trader").unwrap();

    let operations = (0..8)
        .map(|i| {
            let guard = gw.guard.clone();
            let user = user.clone();
            BatchOperation {
                operation: OperationKind::MarketExploration,
                user_id: Some(user.clone()),
                task: move |session: SessionId| async move {
                    let url = format!("https://kalshi.com/markets/{i}");
                    let ctx = OperationContext::for_session(session.clone()).with_user(user);
                    let decision = guard.navigate(&url, &ctx, None).await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let mined = guard
                        .run_guarded(&ctx, OperationKind::ArbitrageDiscovery, None, || async {
                            Ok::<_, String>(i * 10)
                        })
                        .await;
                    guard.end_session(&session);
                    match (decision, mined) {
                        (Decision::Allow, Ok(value)) => Ok(value),
                        (Decision::Deny(reason), _) => Err(reason.to_string()),
                        (_, Err(e)) => Err(e.to_string()),
                    }
                },
            }
        })
        .collect();

    let results = gw.pool.execute_batch(operations).await;
    let values: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values, (0..8).map(|i| i * 10).collect::<Vec<_>>());

    let stats = gw.pool.stats();
    assert_eq!((stats.active_sessions, stats.queued_requests), (0, 0));
    assert_eq!(gw.guard.global_stats().active_sessions, 0);
    assert_eq!(gw.breaker.state().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_quota_and_open_circuit_are_values_not_errors() {
    let mut config = GatewayConfig::default();
    config.breaker = BreakerConfig {
        failure_threshold: 2,
        ..BreakerConfig::default()
    };
    let gw = gateway(config);
    let user = UserId::new("heavy").unwrap();

    // Default data extraction budget: 20 base + 3 burst per minute.
    for _ in 0..23 {
        assert!(gw
            .quota
            .check_limit(&user, OperationKind::DataExtraction, None, Priority::Low)
            .is_allowed());
    }
    let denied = gw
        .quota
        .check_limit(&user, OperationKind::DataExtraction, None, Priority::High);
    assert!(matches!(
        denied,
        QuotaOutcome::Denied(DenialReason::UserRateLimited { .. })
    ));
    assert_eq!(denied.wait_time(), Some(Duration::from_secs(60)));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(
        gw.quota
            .check_limit(&user, OperationKind::DataExtraction, None, Priority::High),
        QuotaOutcome::Admitted(QuotaSource::Burst)
    );

    let ctx = OperationContext::for_session(SessionId::new("flaky").unwrap());
    for _ in 0..2 {
        let err = gw
            .guard
            .run_guarded(&ctx, OperationKind::BraveWebSearch, None, || async {
                Err::<(), _>("timeout")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardedError::Operation(_)));
    }
    assert_eq!(
        gw.guard
            .validate_operation(OperationKind::BraveWebSearch, &ctx, None)
            .await,
        Decision::Deny(DenialReason::CircuitOpen)
    );

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(gw.breaker.is_available());
    assert_eq!(gw.breaker.state().state, CircuitState::HalfOpen);
}
