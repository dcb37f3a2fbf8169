//! Connection pool integration tests.
//!
//! These run against the mock factory from `tds-pool-testing` on a paused
//! tokio clock, so timeouts and delays are virtual and deterministic.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tds_pool::{Pool, PoolConfig, PoolError};
use tds_pool_testing::{MockFactory, settle, settle_for};

fn pool_with(config: PoolConfig, factory: &MockFactory) -> Pool<MockFactory> {
    Pool::new(config, factory.clone()).expect("valid pool config")
}

// =============================================================================
// Construction and Fill
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_fill_reaches_min() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(2).max_connections(5), &factory);

    // The fill is deferred until the runtime gets a turn.
    assert_eq!(pool.status().total, 0);
    settle().await;

    let status = pool.status();
    assert_eq!(status.total, 2);
    assert_eq!(status.available, 2);
    assert_eq!(status.in_use, 0);
    assert_eq!(factory.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_default_min_is_clamped_by_max() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().max_connections(3), &factory);
    settle().await;

    assert_eq!(pool.config().min_connections, Some(3));
    assert_eq!(pool.status().total, 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_min_is_demand_driven() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(0).max_connections(5), &factory);
    settle().await;
    assert_eq!(pool.status().total, 0);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.status().total, 1);
    assert_eq!(factory.connect_attempts(), 1);
    drop(conn);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let factory = MockFactory::builder().build();
    let result = Pool::new(PoolConfig::new().max_connections(0), factory);
    assert!(matches!(result, Err(PoolError::Configuration(_))));
}

#[tokio::test]
async fn test_builder_requires_factory() {
    let result = Pool::<MockFactory>::builder().max_connections(5).build();
    assert!(matches!(result, Err(PoolError::Configuration(_))));
}

#[test]
fn test_new_outside_runtime_is_rejected() {
    let factory = MockFactory::builder().build();
    let result = Pool::new(PoolConfig::new(), factory);
    assert!(matches!(result, Err(PoolError::Configuration(_))));
}

// =============================================================================
// Acquire
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_acquire_free_connection_does_not_connect() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(5), &factory);
    settle().await;

    let conn = pool.acquire().await.unwrap();
    assert_eq!(factory.connect_attempts(), 1);

    let status = pool.status();
    assert_eq!(status.in_use, 1);
    assert_eq!(status.available, 0);
    assert_eq!(status.total, 1);
    drop(conn);
}

#[tokio::test(start_paused = true)]
async fn test_try_acquire() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(1), &factory);
    settle().await;

    let conn = pool.try_acquire().unwrap().expect("idle connection");
    assert!(pool.try_acquire().unwrap().is_none());
    assert_eq!(pool.status().waiting, 0);
    drop(conn);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_grow_pool_up_to_max() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(2).max_connections(5), &factory);
    settle().await;
    assert_eq!(pool.status().total, 2);

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }
    let status = pool.status();
    assert_eq!(status.total, 5);
    assert_eq!(status.in_use, 5);

    // The sixth request has to wait; the pool is at its ceiling.
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    let status = pool.status();
    assert_eq!(status.waiting, 1);
    assert_eq!(status.total, 5);
    assert!(status.is_saturated());

    // Releasing one hands that exact connection to the waiter.
    let released = held.remove(0);
    let released_id = released.id();
    drop(released);

    let served = waiter.await.unwrap().unwrap();
    assert_eq!(served.id(), released_id);
    assert_eq!(factory.connect_attempts(), 5);
    assert_eq!(pool.status().waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_waiters_grow_pool_up_to_max() {
    let connect = Duration::from_millis(50);
    let factory = MockFactory::builder().connect_delay(connect).build();
    let pool = pool_with(PoolConfig::new().min_connections(2).max_connections(5), &factory);
    settle_for(connect).await;
    assert_eq!(pool.status().available, 2);

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        })
        .collect();
    settle().await;

    // Two taken from the free set; one new connection per remaining waiter,
    // counting the ones already opening.
    let status = pool.status();
    assert_eq!(status.in_use, 2);
    assert_eq!(status.pending, 3);
    assert_eq!(status.waiting, 3);
    assert_eq!(status.total, 5);

    settle_for(connect).await;
    let mut held = Vec::new();
    for task in tasks {
        held.push(task.await.unwrap().unwrap());
    }
    assert_eq!(pool.status().in_use, 5);
    assert_eq!(factory.connect_attempts(), 5);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    let status = pool.status();
    assert_eq!(status.waiting, 1);
    assert_eq!(status.total, 5);

    let first = held.iter().position(|conn| conn.id() == 1).unwrap();
    drop(held.remove(first));

    let served = waiter.await.unwrap().unwrap();
    assert_eq!(served.id(), 1);
    assert_eq!(factory.connect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_order() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(
        PoolConfig::new()
            .min_connections(1)
            .max_connections(1)
            .acquire_timeout(None),
        &factory,
    );
    settle().await;
    let held = pool.acquire().await.unwrap();

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    assert_eq!(pool.status().waiting, 2);

    drop(held);
    settle().await;
    assert!(first.is_finished());
    assert!(!second.is_finished());

    let conn = first.await.unwrap().unwrap();
    drop(conn);
    let conn = second.await.unwrap().unwrap();
    assert_eq!(conn.id(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_connection_goes_to_oldest_waiter() {
    let factory = MockFactory::builder()
        .connect_delay(Duration::from_millis(50))
        .build();
    let pool = pool_with(PoolConfig::new().min_connections(0).max_connections(2), &factory);

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 2);
    assert_eq!(pool.status().available, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_acquire_leaves_queue() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(1), &factory);
    settle().await;
    let held = pool.acquire().await.unwrap();

    let mut pending = tokio_test::task::spawn(pool.acquire());
    tokio_test::assert_pending!(pending.poll());
    assert_eq!(pool.status().waiting, 1);

    drop(pending);
    assert_eq!(pool.status().waiting, 0);

    // The connection comes back to the free set instead of a dead waiter.
    drop(held);
    settle().await;
    assert_eq!(pool.status().available, 1);
}

// =============================================================================
// Release
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_release_resets_and_reuses() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(1), &factory);
    settle().await;

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    pool.release(conn);

    // No timers in between: the acquire queues behind the in-flight reset.
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), id);

    let mock = factory.connections()[0].clone();
    assert_eq!(mock.reset_count(), 1);
    assert_eq!(pool.status().total, 1);
    assert_eq!(factory.connect_attempts(), 1);

    let meta = conn.metadata().expect("tracked");
    assert_eq!(meta.checkout_count, 2);
    drop(conn);
}

#[tokio::test(start_paused = true)]
async fn test_release_returns_to_free_set() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(3), &factory);
    settle().await;

    let conn = pool.acquire().await.unwrap();
    conn.release();
    settle().await;

    let status = pool.status();
    assert_eq!(status.available, 1);
    assert_eq!(status.in_use, 0);
    assert_eq!(factory.connections()[0].reset_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_derefs_to_handle() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(1), &factory);
    settle().await;

    let conn = pool.acquire().await.unwrap();
    // Methods of the factory's connection type are reachable directly.
    assert_eq!(conn.reset_count(), 0);
    assert!(!conn.is_closed());
}

// =============================================================================
// Status, Metrics, and Logging
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_metrics_track_checkouts() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(2), &factory);
    settle().await;

    for _ in 0..5 {
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        settle().await;
    }

    let metrics = pool.metrics();
    assert_eq!(metrics.connections_created, 1);
    assert_eq!(metrics.checkouts_successful, 5);
    assert_eq!(metrics.checkouts_failed, 0);
    assert!((metrics.checkout_success_rate() - 1.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_log_sink_receives_lifecycle_messages() {
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = lines.clone();

    let factory = MockFactory::builder().build();
    let pool = Pool::builder()
        .factory(factory)
        .min_connections(1)
        .max_connections(1)
        .log_sink(move |line| sink.lock().push(line.to_string()))
        .build()
        .unwrap();
    settle().await;
    pool.drain().await;

    let lines = lines.lock();
    assert!(lines.iter().any(|l| l == "connection 1: opening connection"));
    assert!(lines.iter().any(|l| l.starts_with("connection 1: connection established")));
    assert!(lines.iter().any(|l| l == "pool drained"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_log_sink_can_inspect_pool() {
    let slot = Arc::new(OnceLock::<Pool<MockFactory>>::new());
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let (sink_slot, sink_seen) = (slot.clone(), seen.clone());

    let pool = Pool::builder()
        .factory(MockFactory::builder().build())
        .min_connections(2)
        .max_connections(3)
        .log_sink(move |line| {
            if let Some(pool) = sink_slot.get() {
                let status = pool.status();
                assert!(status.total <= status.max);
                assert!(!line.is_empty());
                sink_seen.lock().push(line.to_string());
            }
        })
        .build()
        .unwrap();
    slot.set(pool.clone()).expect("slot is empty");

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while pool.status().available < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The third checkout opens a connection from inside acquire.
        let held = [
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        drop(held);
        pool.drain().await;
    })
    .await;
    assert!(finished.is_ok(), "pool stalled while its log sink inspected it");

    let seen = seen.lock();
    assert!(seen.iter().any(|l| l == "connection 3: opening connection"));
    assert!(seen.iter().any(|l| l.starts_with("connection 3: connection established")));
    assert!(seen.iter().any(|l| l == "pool drained"));
}

// =============================================================================
// Concurrent Access
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_concurrent_access() {
    let factory = MockFactory::builder().build();
    let pool = pool_with(PoolConfig::new().min_connections(1).max_connections(5), &factory);

    let success_count = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();

    for _ in 0..50 {
        let pool = pool.clone();
        let success_count = success_count.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..3 {
                let conn = pool.acquire().await.expect("Failed to get connection");
                assert!(pool.status().total <= 5);
                tokio::task::yield_now().await;
                drop(conn);
            }
            success_count.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for handle in handles {
        handle.await.expect("Task panicked");
    }

    assert_eq!(success_count.load(Ordering::Relaxed), 50);
    assert!(factory.connect_attempts() <= 5);
    assert_eq!(pool.metrics().checkouts_successful, 150);

    pool.drain().await;
}
