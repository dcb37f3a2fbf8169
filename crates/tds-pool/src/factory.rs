//! Connection factory contract.
//!
//! The pool never speaks the backend's wire protocol. A [`ConnectionFactory`]
//! opens connections and each [`ManagedConnection`] exposes the handful of
//! lifecycle operations the pool needs: reset between uses, close, and the
//! in-flight work signal used while draining.
//!
//! Connections report asynchronous failures through the [`ConnectionEvents`]
//! handed to [`ConnectionFactory::connect`]:
//!
//! - [`ConnectionEvent::Error`] takes the connection out of rotation and
//!   schedules a reconnect.
//! - [`ConnectionEvent::Ended`] removes the connection from the pool and
//!   lets the pool open a replacement.
//!
//! Closing a connection (via [`ManagedConnection::close`]) must eventually
//! report `Ended`; the pool relies on it to drop the record.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SharedError;

/// Interval used by the default [`ManagedConnection::wait_idle`].
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Opens connections to the backend.
///
/// The factory value carries the connection configuration; the pool passes it
/// through untouched.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type produced by this factory.
    type Connection: ManagedConnection;

    /// Open a new connection.
    ///
    /// Returning `Ok` means the connection is established and usable.
    /// `events` must be kept by the connection to report failures that
    /// happen after this call returns.
    async fn connect(&self, events: ConnectionEvents) -> Result<Self::Connection, SharedError>;
}

/// Operations the pool performs on an open connection.
///
/// Connections are shared between the pool and the caller holding them,
/// so every method takes `&self`.
#[async_trait]
pub trait ManagedConnection: Send + Sync + 'static {
    /// Reset session state so the connection can be handed to another caller.
    ///
    /// For SQL Server this is `sp_reset_connection`. An error means the
    /// connection is unsafe to reuse and the pool will close it.
    async fn reset(&self) -> Result<(), SharedError>;

    /// Ask the connection to close. Must not wait for the close to finish.
    fn close(&self);

    /// Whether a unit of work is currently running on the connection.
    fn is_busy(&self) -> bool {
        false
    }

    /// Request cancellation of the running unit of work, if any.
    fn cancel(&self) {}

    /// Wait until no work is running on the connection.
    ///
    /// The default polls [`is_busy`](Self::is_busy) every
    /// [`DRAIN_POLL_INTERVAL`]. Connections with a completion signal should
    /// override this to wake as soon as the work ends.
    async fn wait_idle(&self) {
        while self.is_busy() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Asynchronous notification from a connection to its pool.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection failed and should not be used again.
    Error(SharedError),
    /// The connection closed, either on request or from the server side.
    Ended,
}

/// Sender half a connection uses to notify its pool.
///
/// Sending never blocks and never fails; events sent after the pool has
/// lost interest in the connection are dropped.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEvents {
    /// Create a linked sender and receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a connection failure.
    pub fn error(&self, error: SharedError) {
        let _ = self.tx.send(ConnectionEvent::Error(error));
    }

    /// Report that the connection has closed.
    pub fn ended(&self) {
        let _ = self.tx.send(ConnectionEvent::Ended);
    }

    /// Whether the pool is still listening.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
