//! # tds-pool
//!
//! Managed pool of long-lived connections to a single backend service.
//!
//! The pool orchestrates connection lifecycles and nothing else: opening,
//! authenticating, and talking to the server is delegated to a
//! [`ConnectionFactory`]. The pool never inspects protocol bytes.
//!
//! ## Features
//!
//! - Warm floor (`min_connections`) and hard ceiling (`max_connections`)
//! - FIFO waiting queue with per-acquire timeout
//! - Session reset (e.g. `sp_reset_connection`) on every return
//! - Automatic reconnection with a fixed delay after connection failures
//! - Idle connection eviction
//! - Drain that cancels in-flight work and closes every connection
//! - Out-of-band error channel for background connection failures
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tds_pool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::new()
//!     .min_connections(2)
//!     .max_connections(20)
//!     .idle_timeout(Duration::from_secs(300))
//!     .acquire_timeout(Duration::from_secs(10));
//!
//! let pool = Pool::new(config, factory)?;
//! let mut errors = pool.subscribe_errors();
//!
//! let conn = pool.acquire().await?;
//! // Use connection...
//! drop(conn); // reset and returned to the pool
//!
//! pool.drain().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod pool;

// Configuration
pub use config::{LogSink, PoolConfig};

// Error types
pub use error::{PoolError, SharedError};

// Factory contract
pub use factory::{ConnectionEvent, ConnectionEvents, ConnectionFactory, ManagedConnection};

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};

// Lifecycle tracking
pub use lifecycle::{ConnectionMetadata, ConnectionState};
