//! Connection pooling with metrics example.
//!
//! This example drives a pool backed by the mock factory from
//! `tds-pool-testing`, so it runs without a server. It shows checkouts under
//! load, reconnection after a connection error, status and metrics
//! reporting, and a graceful drain.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=tds_pool=debug cargo run -p tds-pool --example connection_pool
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use tds_pool::{Pool, PoolConfig, PoolError};
use tds_pool_testing::MockFactory;
use tokio::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Connection Pool with Metrics Example ===\n");

    let factory = MockFactory::builder()
        .connect_delay(Duration::from_millis(20))
        .reset_delay(Duration::from_millis(2))
        .build();

    let pool_config = PoolConfig::new()
        .min_connections(2)
        .max_connections(8)
        .idle_timeout(Duration::from_secs(300))
        .retry_delay(Duration::from_millis(500))
        .acquire_timeout(Duration::from_secs(10));

    println!("Pool configuration:");
    println!("  Min connections: {:?}", pool_config.min_connections);
    println!("  Max connections: {}", pool_config.max_connections);
    println!("  Idle timeout: {:?}", pool_config.idle_timeout);
    println!("  Retry delay: {:?}", pool_config.retry_delay);
    println!();

    let pool = Pool::new(pool_config, factory.clone())?;
    let mut errors = pool.subscribe_errors();

    println!("Pool created, waiting for minimum connections...\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_pool_status(&pool);

    // Example 1: Basic checkout
    println!("\n1. Basic pool usage:");
    {
        let conn = pool.acquire().await?;
        println!("  Checked out connection {}", conn.id());
        // Returned (and reset) when dropped
    }

    // Example 2: Concurrent usage grows the pool toward its maximum
    println!("\n2. Concurrent pool usage (20 parallel tasks):");
    let start = Instant::now();
    let mut handles = vec![];

    for i in 0..20u32 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            conn.start_work();
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.finish_work();
            Ok::<_, PoolError>(i)
        }));
    }

    let mut completed = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            completed += 1;
        }
    }
    println!("  Completed {} tasks in {:?}", completed, start.elapsed());
    print_pool_status(&pool);

    // Example 3: A connection error takes the connection out of rotation
    // until it reconnects.
    println!("\n3. Connection failure and reconnect:");
    if let Some(victim) = factory.open_connections().first() {
        victim.fail("connection reset by peer");
    }
    if let Ok(err) = errors.recv().await {
        println!("  Pool reported: {err}");
    }
    print_pool_status(&pool);
    tokio::time::sleep(Duration::from_millis(600)).await;
    println!("  After retry delay:");
    print_pool_status(&pool);

    // Example 4: Health summary
    println!("\n4. Pool health monitoring:");
    let status = pool.status();
    let utilization = status.utilization() * 100.0;
    let health_status = if utilization < 70.0 {
        "HEALTHY"
    } else if utilization < 90.0 {
        "WARNING"
    } else {
        "CRITICAL"
    };
    println!("  Pool health: {}", health_status);
    println!("  Utilization: {:.1}%", utilization);

    println!("\n5. Final pool metrics:");
    print_pool_metrics(&pool);

    // Graceful shutdown
    println!("\n6. Graceful shutdown:");
    println!("  Draining pool...");
    pool.drain().await;
    println!(
        "  Pool drained, {} connections still open.",
        factory.open_connections().len()
    );

    Ok(())
}

fn print_pool_status(pool: &Pool<MockFactory>) {
    let status = pool.status();
    println!(
        "  Status: {} in use, {} free, {} retrying, {}/{} total ({:.1}% utilization)",
        status.in_use,
        status.available,
        status.retrying,
        status.total,
        status.max,
        status.utilization() * 100.0
    );
}

fn print_pool_metrics(pool: &Pool<MockFactory>) {
    let metrics = pool.metrics();
    println!("  Metrics:");
    println!("    Connections created: {}", metrics.connections_created);
    println!("    Connections closed: {}", metrics.connections_closed);
    println!("    Connect failures: {}", metrics.connect_failures);
    println!(
        "    Checkout success rate: {:.2}%",
        metrics.checkout_success_rate() * 100.0
    );
    println!("    Failed resets: {}", metrics.resets_failed);
}
