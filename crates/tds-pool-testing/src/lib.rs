//! # tds-pool-testing
//!
//! Test infrastructure for `tds-pool`.
//!
//! This crate provides a mock [`ConnectionFactory`](tds_pool::ConnectionFactory)
//! whose behavior can be scripted from a test, so pool behavior can be
//! exercised without a database.
//!
//! ## Features
//!
//! - Configurable connect and reset latency
//! - Scripted connect and reset failures
//! - Per-connection control: inject errors, end from the "server" side,
//!   simulate in-flight work
//! - Counters for connects, resets, closes, and cancellations
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_pool::{Pool, PoolConfig};
//! use tds_pool_testing::{MockFactory, settle};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_with_mock_factory() {
//!     let factory = MockFactory::builder().build();
//!     let pool = Pool::new(PoolConfig::new().min_connections(2), factory.clone()).unwrap();
//!     settle().await;
//!
//!     assert_eq!(factory.connect_attempts(), 2);
//!     factory.connections()[0].fail("broken pipe");
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_factory;

pub use fixtures::{init_tracing, settle, settle_for};
pub use mock_factory::{MockConnection, MockError, MockFactory, MockFactoryBuilder};
