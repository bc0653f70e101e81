//! Crash handling: disconnecting an engine closes its sessions and heals
//! the pool with a replacement launch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use roost::config::DaemonConfig;
use roost::engine::mock::MockDriver;
use roost::events::{topic, EventBus};
use roost::pool::PoolManager;

async fn started_pool(
    max_engines: usize,
) -> (Arc<PoolManager>, Arc<MockDriver>, EventBus) {
    let driver = Arc::new(MockDriver::new());
    let bus = EventBus::new();
    let config = Arc::new(DaemonConfig {
        max_engines,
        engine_type: "mock".to_string(),
        ..DaemonConfig::default()
    });
    let pool = PoolManager::new(config, driver.clone(), bus.clone());
    pool.start().await.expect("pool start");
    (pool, driver, bus)
}

#[tokio::test]
async fn disconnect_closes_all_bound_sessions_and_heals() {
    let (pool, driver, bus) = started_pool(2).await;
    let mut rx = bus.subscribe();

    // First-available selection binds both sessions to the first engine.
    let a = pool.create_session(None, HashMap::new()).await.unwrap();
    let b = pool.create_session(None, HashMap::new()).await.unwrap();
    assert_eq!(pool.active_session_count().await, 2);

    driver.engines()[0].sever();

    // Both sessions transition to closed with the disconnect reason, and the
    // engine.disconnected event is broadcast.
    let mut closed = Vec::new();
    let mut saw_disconnect = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while closed.len() < 2 || !saw_disconnect {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("disconnect cleanup timed out");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(ev)) if ev.topic == topic::SESSION_CLOSED => {
                assert_eq!(ev.payload["reason"], "engine_disconnected");
                closed.push(ev.payload["sessionId"].as_str().unwrap().to_string());
            }
            Ok(Ok(ev)) if ev.topic == topic::ENGINE_DISCONNECTED => {
                saw_disconnect = true;
            }
            Ok(Ok(_)) => {}
            _ => panic!("timed out waiting for disconnect cleanup"),
        }
    }
    assert!(closed.contains(&a.session_id));
    assert!(closed.contains(&b.session_id));
    assert_eq!(pool.active_session_count().await, 0);

    // A replacement engine reaches the pool within the heal bound.
    let mut healed = false;
    for _ in 0..100 {
        if driver.launch_count() >= 3 {
            healed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(healed, "expected a replacement launch after disconnect");

    // The healed pool admits new sessions again.
    let c = pool.create_session(None, HashMap::new()).await.unwrap();
    assert!(!c.session_id.is_empty());
}

#[tokio::test]
async fn replacement_retries_after_failed_launches() {
    let (pool, driver, _bus) = started_pool(1).await;
    let _session = pool.create_session(None, HashMap::new()).await.unwrap();

    // The first two replacement attempts fail; the loop must back off and
    // eventually succeed.
    driver.fail_next_launches(2);
    driver.engines()[0].sever();

    let mut healed = false;
    for _ in 0..300 {
        // initial launch + 2 failures + 1 success
        if driver.launch_count() >= 4 && driver.engines().len() >= 2 {
            healed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(healed, "replacement launch should retry until it succeeds");
}

#[tokio::test]
async fn surviving_engine_keeps_its_sessions() {
    let (pool, driver, _bus) = started_pool(2).await;

    let a = pool.create_session(None, HashMap::new()).await.unwrap();

    // Sever the second (idle) engine; the session on engine one survives.
    driver.engines()[1].sever();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(pool.session_info(&a.session_id).await.is_ok());
    assert_eq!(pool.active_session_count().await, 1);
}
