//! Mock connection factory for pool tests.
//!
//! [`MockFactory`] hands out [`MockConnection`]s and keeps a clone of every
//! one it created, so a test can reach into the pool's connections and
//! script what happens to them.
//!
//! ## Example
//!
//! ```rust,ignore
//! let factory = MockFactory::builder()
//!     .connect_delay(Duration::from_millis(50))
//!     .build();
//!
//! // The next two connect attempts fail, the third succeeds.
//! factory.fail_next_connects(2);
//!
//! // Later: make the server drop connection 1.
//! factory.connection(1).unwrap().end();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tds_pool::{ConnectionEvents, ConnectionFactory, ManagedConnection, SharedError};
use thiserror::Error;
use tokio::sync::watch;

/// Errors produced by the mock.
#[derive(Debug, Clone, Error)]
pub enum MockError {
    /// A scripted connect failure.
    #[error("connection refused (attempt {0})")]
    ConnectRefused(u64),

    /// A scripted reset failure.
    #[error("sp_reset_connection failed on connection {0}")]
    ResetFailed(u64),

    /// An error injected with [`MockConnection::fail`].
    #[error("{0}")]
    Injected(String),
}

/// Builder for [`MockFactory`].
#[derive(Debug, Clone)]
pub struct MockFactoryBuilder {
    connect_delay: Duration,
    reset_delay: Duration,
    cancel_finishes_work: bool,
}

impl Default for MockFactoryBuilder {
    fn default() -> Self {
        Self {
            connect_delay: Duration::ZERO,
            reset_delay: Duration::ZERO,
            cancel_finishes_work: true,
        }
    }
}

impl MockFactoryBuilder {
    /// Time each connect attempt takes.
    #[must_use]
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Time each reset takes.
    #[must_use]
    pub fn reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Whether cancelling in-flight work stops it immediately (default) or
    /// only once the test calls [`MockConnection::finish_work`].
    #[must_use]
    pub fn cancel_finishes_work(mut self, enabled: bool) -> Self {
        self.cancel_finishes_work = enabled;
        self
    }

    /// Build the factory.
    #[must_use]
    pub fn build(self) -> MockFactory {
        MockFactory {
            shared: Arc::new(FactoryShared {
                settings: self,
                next_id: AtomicU64::new(1),
                connect_attempts: AtomicU64::new(0),
                connect_failures: AtomicU32::new(0),
                fail_all_connects: AtomicBool::new(false),
                reset_failures: Arc::new(AtomicU32::new(0)),
                connections: Mutex::new(VecDeque::new()),
            }),
        }
    }
}

struct FactoryShared {
    settings: MockFactoryBuilder,
    next_id: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU32,
    fail_all_connects: AtomicBool,
    reset_failures: Arc<AtomicU32>,
    connections: Mutex<VecDeque<MockConnection>>,
}

impl FactoryShared {
    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Scriptable connection factory.
///
/// Clones share state, so a test can keep one clone and give another to
/// the pool.
#[derive(Clone)]
pub struct MockFactory {
    shared: Arc<FactoryShared>,
}

impl MockFactory {
    /// Start building a factory.
    #[must_use]
    pub fn builder() -> MockFactoryBuilder {
        MockFactoryBuilder::default()
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared
            .connect_failures
            .fetch_add(count, Ordering::SeqCst);
    }

    /// Make every connect attempt fail until turned off again.
    pub fn fail_all_connects(&self, enabled: bool) {
        self.shared
            .fail_all_connects
            .store(enabled, Ordering::SeqCst);
    }

    /// Make the next `count` resets fail.
    pub fn fail_next_resets(&self, count: u32) {
        self.shared.reset_failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Number of connect attempts made so far, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every connection this factory has opened, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<MockConnection> {
        self.shared.connections.lock().iter().cloned().collect()
    }

    /// Connection with the given mock id.
    #[must_use]
    pub fn connection(&self, id: u64) -> Option<MockConnection> {
        self.shared
            .connections
            .lock()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Connections that have not been closed or ended.
    #[must_use]
    pub fn open_connections(&self) -> Vec<MockConnection> {
        self.shared
            .connections
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }
}

impl fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFactory")
            .field("connect_attempts", &self.connect_attempts())
            .field("connections", &self.shared.connections.lock().len())
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn connect(&self, events: ConnectionEvents) -> Result<MockConnection, SharedError> {
        let attempt = self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.shared.settings.connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.shared.fail_all_connects.load(Ordering::SeqCst)
            || FactoryShared::take_one(&self.shared.connect_failures)
        {
            tracing::debug!(attempt, "mock connect refused");
            return Err(Arc::new(MockError::ConnectRefused(attempt)));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (busy, _) = watch::channel(false);
        let conn = MockConnection {
            state: Arc::new(ConnectionShared {
                id,
                settings: self.shared.settings.clone(),
                reset_failures: Arc::clone(&self.shared.reset_failures),
                events,
                closed: AtomicBool::new(false),
                close_calls: AtomicU32::new(0),
                resets: AtomicU32::new(0),
                cancels: AtomicU32::new(0),
                busy,
            }),
        };
        self.shared.connections.lock().push_back(conn.clone());
        tracing::debug!(mock_id = id, attempt, "mock connection opened");
        Ok(conn)
    }
}

struct ConnectionShared {
    id: u64,
    settings: MockFactoryBuilder,
    reset_failures: Arc<AtomicU32>,
    events: ConnectionEvents,
    closed: AtomicBool,
    close_calls: AtomicU32,
    resets: AtomicU32,
    cancels: AtomicU32,
    busy: watch::Sender<bool>,
}

/// Connection produced by [`MockFactory`].
///
/// Clones refer to the same connection.
#[derive(Clone)]
pub struct MockConnection {
    state: Arc<ConnectionShared>,
}

impl MockConnection {
    /// Mock-assigned id, in opening order starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Number of resets performed, failed ones included.
    #[must_use]
    pub fn reset_count(&self) -> u32 {
        self.state.resets.load(Ordering::SeqCst)
    }

    /// Number of times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Number of times in-flight work was cancelled.
    #[must_use]
    pub fn cancel_count(&self) -> u32 {
        self.state.cancels.load(Ordering::SeqCst)
    }

    /// Whether the connection has closed or ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Simulate a unit of work starting on the connection.
    pub fn start_work(&self) {
        self.state.busy.send_replace(true);
    }

    /// Simulate the running unit of work completing.
    pub fn finish_work(&self) {
        self.state.busy.send_replace(false);
    }

    /// Report a connection error to the pool.
    pub fn fail(&self, message: impl Into<String>) {
        self.state
            .events
            .error(Arc::new(MockError::Injected(message.into())));
    }

    /// Simulate the server closing the connection.
    pub fn end(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.state.events.ended();
        }
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .field("resets", &self.reset_count())
            .finish()
    }
}

#[async_trait]
impl ManagedConnection for MockConnection {
    async fn reset(&self) -> Result<(), SharedError> {
        let delay = self.state.settings.reset_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        if FactoryShared::take_one(&self.state.reset_failures) {
            return Err(Arc::new(MockError::ResetFailed(self.id())));
        }
        Ok(())
    }

    fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.end();
    }

    fn is_busy(&self) -> bool {
        *self.state.busy.borrow()
    }

    fn cancel(&self) {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        if self.state.settings.cancel_finishes_work {
            self.finish_work();
        }
    }

    async fn wait_idle(&self) {
        let mut rx = self.state.busy.subscribe();
        let _ = rx.wait_for(|busy| !busy).await;
    }
}
