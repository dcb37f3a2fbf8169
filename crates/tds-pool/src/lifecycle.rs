//! Connection lifecycle tracking.
//!
//! Every connection the pool manages is represented by a record whose
//! [`ConnectionState`] moves through:
//!
//! ```text
//! Pending -> Free | Used          (connect succeeded; Used if a waiter was queued)
//! Pending -> Retry                (connect failed)
//! Free <-> Used                   (acquire / release)
//! Free | Used -> Retry            (connection reported an error)
//! Retry -> Pending                (reconnect timer fired)
//! Free | Used -> Closing          (idle eviction / failed reset)
//! any -> removed                  (connection reported Ended, or drain)
//! ```

use std::time::Instant;

/// Connection state tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection attempt in progress.
    Pending,
    /// Connection is idle and available for use.
    Free,
    /// Connection is checked out (or being reset after release).
    Used,
    /// Connection failed; waiting to reconnect.
    Retry,
    /// Close requested; the record goes away once the connection ends.
    Closing,
}

impl ConnectionState {
    /// Check if the connection can be handed out right now.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// Check if the record will be able to serve a waiter without the pool
    /// opening anything new.
    ///
    /// Pending and retrying records count: each will either connect and
    /// serve the oldest waiter or stay a slot the pool cannot reuse.
    #[must_use]
    pub fn can_serve_waiter(&self) -> bool {
        matches!(self, Self::Pending | Self::Free | Self::Retry)
    }
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection record.
    pub id: u64,
    /// When the record was created.
    pub created_at: Instant,
    /// When the current connection was established, if it is connected.
    pub connected_at: Option<Instant>,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
    /// Number of connect attempts made for this record.
    pub connect_attempts: u64,
    /// Current state of the connection.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    /// Create metadata for a record that is about to connect.
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            connected_at: None,
            last_used_at: now,
            checkout_count: 0,
            connect_attempts: 0,
            state: ConnectionState::Pending,
        }
    }

    /// Mark a new connect attempt.
    pub fn mark_connecting(&mut self) {
        self.connect_attempts += 1;
        self.connected_at = None;
        self.state = ConnectionState::Pending;
    }

    /// Mark the connection as established.
    pub fn mark_connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
        self.state = ConnectionState::Used;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
        self.state = ConnectionState::Free;
    }

    /// Mark the connection as failed.
    pub fn mark_retry(&mut self) {
        self.connected_at = None;
        self.state = ConnectionState::Retry;
    }

    /// Mark the connection as closing.
    pub fn mark_closing(&mut self) {
        self.state = ConnectionState::Closing;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_availability() {
        assert!(ConnectionState::Free.is_available());
        assert!(!ConnectionState::Used.is_available());
        assert!(!ConnectionState::Pending.is_available());
        assert!(!ConnectionState::Closing.is_available());
    }

    #[test]
    fn test_connection_state_can_serve_waiter() {
        assert!(ConnectionState::Pending.can_serve_waiter());
        assert!(ConnectionState::Free.can_serve_waiter());
        assert!(ConnectionState::Retry.can_serve_waiter());
        assert!(!ConnectionState::Used.can_serve_waiter());
        assert!(!ConnectionState::Closing.can_serve_waiter());
    }

    #[test]
    fn test_connection_metadata_new() {
        let meta = ConnectionMetadata::new(1);
        assert_eq!(meta.id, 1);
        assert_eq!(meta.checkout_count, 0);
        assert_eq!(meta.connect_attempts, 0);
        assert_eq!(meta.state, ConnectionState::Pending);
        assert!(meta.connected_at.is_none());
    }

    #[test]
    fn test_connection_metadata_checkout_checkin() {
        let mut meta = ConnectionMetadata::new(1);
        meta.mark_connecting();
        meta.mark_connected();
        meta.mark_checkout();
        assert_eq!(meta.checkout_count, 1);
        assert_eq!(meta.state, ConnectionState::Used);

        meta.mark_checkin();
        assert_eq!(meta.state, ConnectionState::Free);
        assert_eq!(meta.connect_attempts, 1);
    }

    #[test]
    fn test_connection_metadata_retry_clears_connected_at() {
        let mut meta = ConnectionMetadata::new(3);
        meta.mark_connecting();
        meta.mark_connected();
        meta.mark_retry();
        assert_eq!(meta.state, ConnectionState::Retry);
        assert!(meta.connected_at.is_none());

        meta.mark_connecting();
        assert_eq!(meta.connect_attempts, 2);
        assert_eq!(meta.state, ConnectionState::Pending);
    }
}
