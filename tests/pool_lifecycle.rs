//! End-to-end pool lifecycle: admission control, idle reaping, and drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use roost::config::DaemonConfig;
use roost::engine::mock::MockDriver;
use roost::error::PoolError;
use roost::events::{topic, EventBus};
use roost::pool::{reaper, PoolManager};

fn config(max_engines: usize) -> DaemonConfig {
    DaemonConfig {
        max_engines,
        engine_type: "mock".to_string(),
        ..DaemonConfig::default()
    }
}

async fn started_pool(cfg: DaemonConfig) -> (Arc<PoolManager>, Arc<MockDriver>, EventBus) {
    let driver = Arc::new(MockDriver::new());
    let bus = EventBus::new();
    let pool = PoolManager::new(Arc::new(cfg), driver.clone(), bus.clone());
    pool.start().await.expect("pool start");
    (pool, driver, bus)
}

#[tokio::test]
async fn capacity_two_then_release_admits_third() {
    let (pool, _driver, _bus) = started_pool(config(2)).await;

    let a = pool.create_session(None, HashMap::new()).await.unwrap();
    let b = pool.create_session(None, HashMap::new()).await.unwrap();

    let err = pool.create_session(None, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, PoolError::CapacityExceeded { .. }));

    assert!(pool.close_session(&a.session_id).await.unwrap());
    let c = pool.create_session(None, HashMap::new()).await.unwrap();

    assert_ne!(b.session_id, c.session_id);
    assert_eq!(pool.active_session_count().await, 2);
}

#[tokio::test]
async fn session_count_never_exceeds_capacity_under_churn() {
    let (pool, _driver, _bus) = started_pool(config(3)).await;
    let pool = pool.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                if let Ok(view) = pool.create_session(None, HashMap::new()).await {
                    assert!(pool.active_session_count().await <= 3);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    let _ = pool.close_session(&view.session_id).await;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(pool.active_session_count().await, 0);
}

#[tokio::test]
async fn idle_session_is_reaped_within_one_sweep() {
    let cfg = DaemonConfig {
        session_timeout_secs: 1,
        reap_interval_secs: 1,
        ..config(2)
    };
    let (pool, _driver, bus) = started_pool(cfg).await;
    let mut rx = bus.subscribe();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(reaper::run(pool.clone(), shutdown_rx));

    let view = pool.create_session(None, HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let err = pool.session_info(&view.session_id).await.unwrap_err();
    assert!(matches!(err, PoolError::NotFound { .. }));

    // Exactly one session.closed broadcast, carrying the expired reason.
    let mut closed = 0;
    while let Ok(ev) = rx.try_recv() {
        if ev.topic == topic::SESSION_CLOSED {
            assert_eq!(ev.payload["sessionId"], view.session_id.as_str());
            assert_eq!(ev.payload["reason"], "expired");
            closed += 1;
        }
    }
    assert_eq!(closed, 1);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn activity_defers_the_reaper() {
    let cfg = DaemonConfig {
        session_timeout_secs: 2,
        reap_interval_secs: 1,
        ..config(1)
    };
    let (pool, _driver, _bus) = started_pool(cfg).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(reaper::run(pool.clone(), shutdown_rx));

    let view = pool.create_session(None, HashMap::new()).await.unwrap();
    // Touch the session every second; it must outlive several sweeps.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        pool.session_info(&view.session_id)
            .await
            .expect("active session must not be reaped");
    }

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn drain_rejects_new_work_and_closes_everything() {
    let (pool, _driver, bus) = started_pool(config(2)).await;
    let mut rx = bus.subscribe();

    let a = pool.create_session(None, HashMap::new()).await.unwrap();
    let b = pool.create_session(None, HashMap::new()).await.unwrap();

    let errors = tokio::time::timeout(Duration::from_secs(5), pool.drain())
        .await
        .expect("drain must finish inside the deadline");
    assert!(errors.is_empty());

    let err = pool.create_session(None, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, PoolError::Draining));
    assert_eq!(pool.active_session_count().await, 0);

    // Drain publishes the draining notice plus one close per session.
    let mut saw_draining = false;
    let mut closed_ids = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        match ev.topic.as_str() {
            "pool.draining" => saw_draining = true,
            "session.closed" => {
                assert_eq!(ev.payload["reason"], "drained");
                closed_ids.push(ev.payload["sessionId"].as_str().unwrap().to_string());
            }
            _ => {}
        }
    }
    assert!(saw_draining);
    assert!(closed_ids.contains(&a.session_id));
    assert!(closed_ids.contains(&b.session_id));
}
