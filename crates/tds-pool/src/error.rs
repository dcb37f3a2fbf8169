//! Pool error types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error reported by a connection factory or a connection.
///
/// Shared so the same failure can be logged, broadcast to every error
/// subscriber, and kept in [`PoolError`] without cloning the underlying error.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pool operations.
///
/// `PoolError` is `Clone` so it can be delivered over the pool's error
/// channel (see [`Pool::subscribe_errors`](crate::Pool::subscribe_errors)).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No connection became available within the acquire timeout.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// The pool has been drained and no longer hands out connections.
    #[error("pool is drained")]
    PoolDrained,

    /// Opening a connection failed.
    #[error("failed to create connection {id}: {source}")]
    ConnectionCreation {
        /// Record the attempt was made for.
        id: u64,
        /// Failure reported by the factory.
        #[source]
        source: SharedError,
    },

    /// An established connection reported an error and was taken out of rotation.
    #[error("connection {id} failed: {source}")]
    ConnectionLost {
        /// Record that owned the connection.
        id: u64,
        /// Failure reported by the connection.
        #[source]
        source: SharedError,
    },

    /// Session reset on release failed; the connection is discarded.
    #[error("connection {id} reset failed: {source}")]
    ResetFailed {
        /// Record that owned the connection.
        id: u64,
        /// Failure reported by the reset.
        #[source]
        source: SharedError,
    },

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Check if this error reflects connection health rather than a caller's request.
    ///
    /// Creation and lost-connection errors are published on the pool's error
    /// channel. Reset failures are only logged.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionCreation { .. } | Self::ConnectionLost { .. } | Self::ResetFailed { .. }
        )
    }

    /// Record id the error relates to, if any.
    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        match self {
            Self::ConnectionCreation { id, .. }
            | Self::ConnectionLost { id, .. }
            | Self::ResetFailed { id, .. } => Some(*id),
            _ => None,
        }
    }
}
