//! Pool configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PoolError;

/// Default maximum number of connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;

/// Minimum used when none is configured (clamped to the maximum).
pub const DEFAULT_MIN_CONNECTIONS: u32 = 10;

/// Default time a free connection may sit idle before it is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Default delay before a failed connection is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5_000);

/// Default time an acquire waits for a connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Callback receiving one line per pool lifecycle message.
///
/// Messages are emitted through `tracing` regardless; the sink is for
/// applications that want the pool's log without installing a subscriber.
/// It is never called with the pool's lock held, so it may query the pool.
#[derive(Clone)]
pub struct LogSink(Arc<dyn Fn(&str) + Send + Sync>);

impl LogSink {
    /// Wrap a callback.
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn emit(&self, message: &str) {
        (self.0)(message);
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink(<fn>)")
    }
}

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
///
/// The configuration is read once when the pool is created and never
/// changes afterwards.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections allowed. Must be at least 1.
    pub max_connections: u32,

    /// Number of connections kept open even without demand.
    ///
    /// `None` means `min(max_connections, 10)`. Values above
    /// `max_connections` are clamped.
    pub min_connections: Option<u32>,

    /// Time a free connection can be idle before being closed.
    ///
    /// `None` keeps idle connections open indefinitely.
    pub idle_timeout: Option<Duration>,

    /// Delay before reconnecting a connection that failed.
    ///
    /// `None` disables reconnection: a failed connection stays in the
    /// retry state and keeps its slot, so the pool does not replace it.
    /// Use this only when the application runs its own recovery policy.
    pub retry_delay: Option<Duration>,

    /// Time to wait for a connection before timing out.
    ///
    /// `None` waits until a connection is available or the pool is drained.
    pub acquire_timeout: Option<Duration>,

    /// Optional sink for pool lifecycle messages.
    pub log_sink: Option<LogSink>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            retry_delay: Some(DEFAULT_RETRY_DELAY),
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
            log_sink: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = Some(count);
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the idle connection timeout. `None` disables idle eviction.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = timeout.into();
        self
    }

    /// Set the reconnect delay. `None` disables reconnection.
    #[must_use]
    pub fn retry_delay(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.retry_delay = delay.into();
        self
    }

    /// Set the connection acquisition timeout. `None` waits indefinitely.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.acquire_timeout = timeout.into();
        self
    }

    /// Send pool lifecycle messages to `sink` in addition to `tracing`.
    #[must_use]
    pub fn log_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log_sink = Some(LogSink::new(sink));
        self
    }

    /// The minimum the pool will actually maintain.
    #[must_use]
    pub fn effective_min(&self) -> u32 {
        self.min_connections
            .unwrap_or(DEFAULT_MIN_CONNECTIONS)
            .min(self.max_connections)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(PoolError::Configuration(
                "idle_timeout must be non-zero; use None to disable it".into(),
            ));
        }
        Ok(())
    }

    /// Validate, then resolve `min_connections` against `max_connections`.
    pub(crate) fn normalized(mut self) -> Result<Self, PoolError> {
        self.validate()?;
        if let Some(min) = self.min_connections.filter(|&min| min > self.max_connections) {
            tracing::warn!(
                min_connections = min,
                max_connections = self.max_connections,
                "min_connections exceeds max_connections, clamping"
            );
        }
        self.min_connections = Some(self.effective_min());
        Ok(self)
    }
}
