//! Connection pool implementation.
//!
//! All pool state lives behind a single mutex. Every transition (connect
//! completion, event from a connection, timer, reset completion, acquire,
//! release) is a short critical section; the lock is never held across an
//! `.await`. Work that suspends (connecting, resetting, draining) runs with
//! the lock released and re-validates the record when it comes back.
//!
//! Stale completions are filtered two ways:
//!
//! - every connect attempt on a record gets a new attempt number, and events
//!   or completions carrying an older number are ignored;
//! - every timer gets a pool-unique sequence number, and a timer that fires
//!   after being cancelled or replaced finds a different number on its record.
//!
//! Log sink lines produced inside a critical section are queued and handed
//! to the sink once the lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::config::PoolConfig;
use crate::error::{PoolError, SharedError};
use crate::factory::{ConnectionEvent, ConnectionEvents, ConnectionFactory, ManagedConnection};
use crate::lifecycle::{ConnectionMetadata, ConnectionState};

/// Capacity of the error channel before slow subscribers start lagging.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Emit a lifecycle message to `tracing` and queue it for the log sink.
///
/// Queued lines reach the sink from [`PoolInner::flush_log`], after the state
/// lock is released, so a sink may call back into the pool.
macro_rules! pool_log {
    ($inner:expr, $level:ident, id = $id:expr, $($arg:tt)+) => {{
        tracing::$level!(connection_id = $id, $($arg)+);
        if $inner.config.log_sink.is_some() {
            $inner.queue_log(format!("connection {}: {}", $id, format_args!($($arg)+)));
        }
    }};
    ($inner:expr, $level:ident, $($arg:tt)+) => {{
        tracing::$level!($($arg)+);
        if $inner.config.log_sink.is_some() {
            $inner.queue_log(format!($($arg)+));
        }
    }};
}

/// A pool of connections to a single backend.
///
/// The pool keeps at least `min_connections` open, opens more on demand up to
/// `max_connections`, resets connections when they are returned, reconnects
/// connections that fail, and closes connections that stay idle too long.
///
/// `Pool` is a cheap handle; clones share the same pool.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

struct PoolInner<F: ConnectionFactory> {
    config: PoolConfig,
    min: u32,
    max: u32,
    factory: F,
    runtime: Handle,
    state: Mutex<PoolState<F>>,
    sink_lines: Mutex<Vec<String>>,
    drain_done: watch::Sender<bool>,
    errors: broadcast::Sender<PoolError>,
    metrics: MetricsCounters,
}

struct PoolState<F: ConnectionFactory> {
    connections: Vec<Record<F::Connection>>,
    waiting: VecDeque<Waiter<F>>,
    drained: bool,
    next_id: u64,
    next_waiter_id: u64,
    next_timer_seq: u64,
}

/// The pool's bookkeeping for one connection slot.
struct Record<C> {
    meta: ConnectionMetadata,
    handle: Option<Arc<C>>,
    timer: Option<Timer>,
}

struct Timer {
    seq: u64,
    task: AbortHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Idle,
    Retry,
}

struct Waiter<F: ConnectionFactory> {
    id: u64,
    tx: oneshot::Sender<PooledConnection<F>>,
}

#[derive(Default)]
struct MetricsCounters {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    connect_failures: AtomicU64,
    checkouts_successful: AtomicU64,
    checkouts_failed: AtomicU64,
    resets_failed: AtomicU64,
}

impl<C> Record<C> {
    fn id(&self) -> u64 {
        self.meta.id
    }

    fn attempt(&self) -> u64 {
        self.meta.connect_attempts
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
    }

    fn holds(&self, conn: &Arc<C>) -> bool {
        self.handle.as_ref().is_some_and(|h| Arc::ptr_eq(h, conn))
    }
}

impl<F: ConnectionFactory> PoolState<F> {
    fn position(&self, id: u64) -> Option<usize> {
        self.connections.iter().position(|r| r.id() == id)
    }

    fn remove_waiter(&mut self, id: u64) -> Option<Waiter<F>> {
        let index = self.waiting.iter().position(|w| w.id == id)?;
        self.waiting.remove(index)
    }
}

/// Number of connections to open so that queued demand is met without
/// exceeding `max`, and the pool never sits below `min`.
///
/// `available` counts records that are, or will become, able to serve a
/// waiter without opening anything new.
pub(crate) fn connections_to_create(
    min: u32,
    max: u32,
    total: usize,
    available: usize,
    waiting: usize,
) -> usize {
    let total = total as i64;
    let room = i64::from(max) - total;
    let demand = waiting as i64 - available as i64;
    let amount = room.min(demand).max(i64::from(min) - total);
    usize::try_from(amount).unwrap_or(0)
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a new pool.
    ///
    /// The initial fill is scheduled on the current tokio runtime rather than
    /// run inline, so a caller can subscribe to [`errors`](Self::subscribe_errors)
    /// before the first connect attempt can fail.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Configuration`] if the configuration is invalid
    /// or if called outside a tokio runtime.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        let config = config.normalized()?;
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::Configuration("pool must be created within a tokio runtime".into())
        })?;
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let inner = Arc::new(PoolInner {
            min: config.effective_min(),
            max: config.max_connections,
            config,
            factory,
            runtime,
            state: Mutex::new(PoolState {
                connections: Vec::new(),
                waiting: VecDeque::new(),
                drained: false,
                next_id: 1,
                next_waiter_id: 1,
                next_timer_seq: 1,
            }),
            sink_lines: Mutex::new(Vec::new()),
            drain_done: watch::channel(false).0,
            errors,
            metrics: MetricsCounters::default(),
        });

        tracing::debug!(
            min_connections = inner.min,
            max_connections = inner.max,
            "connection pool created"
        );

        let initial = Arc::clone(&inner);
        inner.runtime.spawn(async move {
            let mut state = initial.lock();
            initial.fill(&mut state);
        });

        Ok(Self { inner })
    }

    /// Start building a pool.
    #[must_use]
    pub fn builder() -> PoolBuilder<F> {
        PoolBuilder::new()
    }

    /// Get a connection from the pool.
    ///
    /// Returns a free connection immediately if one exists. Otherwise the
    /// request joins the back of the waiting queue, the pool opens more
    /// connections if it has room, and the oldest waiter is served first
    /// whenever a connection becomes available.
    ///
    /// # Errors
    ///
    /// - [`PoolError::AcquisitionTimeout`] if no connection became available
    ///   within the configured acquire timeout.
    /// - [`PoolError::PoolDrained`] if the pool is, or gets, drained.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        let (waiter_id, mut rx) = {
            let mut state = self.inner.lock();
            if state.drained {
                return Err(PoolError::PoolDrained);
            }
            if let Some(conn) = self.inner.checkout_free(&mut state) {
                return Ok(conn);
            }

            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(Waiter { id: waiter_id, tx });
            tracing::trace!(waiting = state.waiting.len(), "queued for connection");
            self.inner.fill(&mut state);
            (waiter_id, rx)
        };

        let mut guard = WaiterGuard {
            inner: &self.inner,
            id: waiter_id,
            armed: true,
        };

        let result = match self.inner.config.acquire_timeout {
            None => (&mut rx).await.map_err(|_| PoolError::PoolDrained),
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(received) => received.map_err(|_| PoolError::PoolDrained),
                Err(_) => {
                    let removed = self.inner.state.lock().remove_waiter(waiter_id);
                    if removed.is_some() {
                        self.inner
                            .metrics
                            .checkouts_failed
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(?timeout, "connection acquisition timed out");
                        Err(PoolError::AcquisitionTimeout(timeout))
                    } else {
                        // Handed off between the timer firing and the queue lock.
                        rx.try_recv().map_err(|_| PoolError::PoolDrained)
                    }
                }
            },
        };
        guard.armed = false;
        result
    }

    /// Get a free connection without waiting.
    ///
    /// Returns `Ok(None)` if no connection is free. Never queues a request
    /// and never opens a connection.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PoolDrained`] if the pool has been drained.
    pub fn try_acquire(&self) -> Result<Option<PooledConnection<F>>, PoolError> {
        let mut state = self.inner.state.lock();
        if state.drained {
            return Err(PoolError::PoolDrained);
        }
        Ok(self.inner.checkout_free(&mut state))
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping it. The connection is reset in the background
    /// and then handed to the oldest waiter or marked free. Reset failures
    /// are not reported to the caller; the connection is closed instead.
    pub fn release(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Shut the pool down.
    ///
    /// Queued acquires resolve with [`PoolError::PoolDrained`], timers are
    /// cancelled, running work on every connection is cancelled and awaited,
    /// and every connection is asked to close. Completes once all in-flight
    /// work has stopped; it does not wait for the closes themselves.
    ///
    /// Draining is permanent. Teardown runs on the pool's runtime, so it
    /// finishes even if this future is dropped, and every call, including
    /// ones made while a drain is in progress, resolves when it ends.
    pub async fn drain(&self) {
        let mut done = self.inner.drain_done.subscribe();
        let taken = {
            let mut state = self.inner.lock();
            if state.drained {
                None
            } else {
                state.drained = true;
                Some((
                    std::mem::take(&mut state.waiting),
                    std::mem::take(&mut state.connections),
                ))
            }
        };

        if let Some((waiters, records)) = taken {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(async move {
                inner.teardown(waiters, records).await;
                inner.drain_done.send_replace(true);
            });
        }

        // The sender lives as long as the pool, so this only ends on `true`.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Whether [`drain`](Self::drain) has been called.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.state.lock().drained
    }

    /// Subscribe to background connection errors.
    ///
    /// Every failed connect attempt and every error reported by an open
    /// connection is published here exactly once. These errors never fail
    /// the pool itself.
    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<PoolError> {
        self.inner.errors.subscribe()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let mut status = PoolStatus {
            available: 0,
            in_use: 0,
            pending: 0,
            retrying: 0,
            closing: 0,
            total: state.connections.len() as u32,
            waiting: state.waiting.len() as u32,
            min: self.inner.min,
            max: self.inner.max,
        };
        for record in &state.connections {
            match record.meta.state {
                ConnectionState::Free => status.available += 1,
                ConnectionState::Used => status.in_use += 1,
                ConnectionState::Pending => status.pending += 1,
                ConnectionState::Retry => status.retrying += 1,
                ConnectionState::Closing => status.closing += 1,
            }
        }
        status
    }

    /// Get a snapshot of the pool's counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let m = &self.inner.metrics;
        PoolMetrics {
            connections_created: m.connections_created.load(Ordering::Relaxed),
            connections_closed: m.connections_closed.load(Ordering::Relaxed),
            connect_failures: m.connect_failures.load(Ordering::Relaxed),
            checkouts_successful: m.checkouts_successful.load(Ordering::Relaxed),
            checkouts_failed: m.checkouts_failed.load(Ordering::Relaxed),
            resets_failed: m.resets_failed.load(Ordering::Relaxed),
        }
    }

    /// Get the pool configuration, with `min_connections` resolved.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("drained", &self.is_drained())
            .finish()
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Open as many connections as demand and the floor require.
    fn fill(self: &Arc<Self>, state: &mut PoolState<F>) {
        if state.drained {
            return;
        }
        let available = state
            .connections
            .iter()
            .filter(|r| r.meta.state.can_serve_waiter())
            .count();
        let amount = connections_to_create(
            self.min,
            self.max,
            state.connections.len(),
            available,
            state.waiting.len(),
        );
        for _ in 0..amount {
            self.create_record(state);
        }
    }

    fn create_record(self: &Arc<Self>, state: &mut PoolState<F>) {
        let id = state.next_id;
        state.next_id += 1;

        let mut meta = ConnectionMetadata::new(id);
        meta.mark_connecting();
        let attempt = meta.connect_attempts;
        state.connections.push(Record {
            meta,
            handle: None,
            timer: None,
        });

        pool_log!(self, debug, id = id, "opening connection");
        self.spawn_connect(id, attempt);
    }

    fn spawn_connect(self: &Arc<Self>, id: u64, attempt: u64) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let (events, rx) = ConnectionEvents::channel();
            let result = inner.factory.connect(events).await;
            inner.on_connected(id, attempt, result, rx);
        });
    }

    fn on_connected(
        self: &Arc<Self>,
        id: u64,
        attempt: u64,
        result: Result<F::Connection, SharedError>,
        rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let mut state = self.lock();
        let current = state
            .position(id)
            .filter(|&idx| state.connections[idx].attempt() == attempt);

        let (idx, result) = match (state.drained, current) {
            (false, Some(idx)) => (idx, result),
            _ => {
                // Drained or superseded while connecting.
                if let Ok(conn) = result {
                    conn.close();
                }
                return;
            }
        };

        match result {
            Err(source) => {
                self.metrics
                    .connect_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.enter_retry(
                    &mut state,
                    idx,
                    PoolError::ConnectionCreation { id, source },
                );
            }
            Ok(conn) => {
                let record = &mut state.connections[idx];
                record.handle = Some(Arc::new(conn));
                record.meta.mark_connected();
                self.metrics
                    .connections_created
                    .fetch_add(1, Ordering::Relaxed);
                pool_log!(self, debug, id = id, "connection established (attempt {})", attempt);

                self.spawn_event_listener(id, attempt, rx);
                self.hand_off(&mut state, idx);
            }
        }
    }

    /// Forward the first event a connection reports back into the pool.
    ///
    /// Either event detaches the connection from its record, so anything
    /// after the first is stale.
    fn spawn_event_listener(
        self: &Arc<Self>,
        id: u64,
        attempt: u64,
        mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let pool = Arc::downgrade(self);
        self.runtime.spawn(async move {
            if let Some(event) = rx.recv().await {
                if let Some(inner) = pool.upgrade() {
                    inner.on_event(id, attempt, event);
                }
            }
        });
    }

    fn on_event(self: &Arc<Self>, id: u64, attempt: u64, event: ConnectionEvent) {
        let mut state = self.lock();
        if state.drained {
            return;
        }
        let Some(idx) = state.position(id) else {
            return;
        };
        let record = &state.connections[idx];
        if record.attempt() != attempt || record.handle.is_none() {
            return;
        }

        match event {
            ConnectionEvent::Error(source) => {
                self.enter_retry(&mut state, idx, PoolError::ConnectionLost { id, source });
            }
            ConnectionEvent::Ended => {
                let mut record = state.connections.remove(idx);
                record.cancel_timer();
                self.metrics
                    .connections_closed
                    .fetch_add(1, Ordering::Relaxed);
                pool_log!(
                    self,
                    debug,
                    id = id,
                    "connection ended while {:?}, removed from pool",
                    record.meta.state
                );
                self.fill(&mut state);
            }
        }
    }

    /// Take a failed record out of rotation and schedule its reconnect.
    fn enter_retry(self: &Arc<Self>, state: &mut PoolState<F>, idx: usize, error: PoolError) {
        let record = &mut state.connections[idx];
        let id = record.id();
        record.handle = None;
        record.cancel_timer();
        record.meta.mark_retry();

        match self.config.retry_delay {
            Some(delay) => {
                pool_log!(self, warn, id = id, "{}; retrying in {:?}", error, delay);
                self.arm_timer(state, idx, TimerKind::Retry, delay);
            }
            None => {
                pool_log!(self, warn, id = id, "{}; retry disabled", error);
            }
        }

        let _ = self.errors.send(error);
    }

    /// Give an established connection to the oldest live waiter, or mark it free.
    fn hand_off(self: &Arc<Self>, state: &mut PoolState<F>, idx: usize) {
        let record = &mut state.connections[idx];
        let Some(conn) = record.handle.clone() else {
            return;
        };
        let id = record.id();

        while let Some(waiter) = state.waiting.pop_front() {
            let pooled = PooledConnection::new(Arc::clone(self), id, Arc::clone(&conn));
            match waiter.tx.send(pooled) {
                Ok(()) => {
                    record.meta.mark_checkout();
                    self.metrics
                        .checkouts_successful
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(connection_id = id, "handed connection to waiter");
                    return;
                }
                // That waiter gave up; its connection never left the pool.
                Err(unclaimed) => unclaimed.disarm(),
            }
        }

        record.meta.mark_checkin();
        if let Some(timeout) = self.config.idle_timeout {
            self.arm_timer(state, idx, TimerKind::Idle, timeout);
        }
    }

    fn checkout_free(self: &Arc<Self>, state: &mut PoolState<F>) -> Option<PooledConnection<F>> {
        let record = state
            .connections
            .iter_mut()
            .find(|r| r.meta.state.is_available() && r.handle.is_some())?;
        let conn = record.handle.clone()?;
        record.cancel_timer();
        record.meta.mark_checkout();
        self.metrics
            .checkouts_successful
            .fetch_add(1, Ordering::Relaxed);
        tracing::trace!(connection_id = record.id(), "checked out free connection");
        Some(PooledConnection::new(Arc::clone(self), record.id(), conn))
    }

    fn arm_timer(
        self: &Arc<Self>,
        state: &mut PoolState<F>,
        idx: usize,
        kind: TimerKind,
        delay: Duration,
    ) {
        let seq = state.next_timer_seq;
        state.next_timer_seq += 1;

        let record = &mut state.connections[idx];
        record.cancel_timer();
        let id = record.id();
        let pool = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = pool.upgrade() {
                inner.on_timer(id, seq, kind);
            }
        });
        record.timer = Some(Timer {
            seq,
            task: task.abort_handle(),
        });
    }

    fn on_timer(self: &Arc<Self>, id: u64, seq: u64, kind: TimerKind) {
        let mut state = self.lock();
        if state.drained {
            return;
        }
        let Some(idx) = state.position(id) else {
            return;
        };
        let record = &mut state.connections[idx];
        if record.timer.as_ref().map(|t| t.seq) != Some(seq) {
            return;
        }
        record.timer = None;

        match kind {
            TimerKind::Idle => {
                if record.meta.state != ConnectionState::Free {
                    return;
                }
                // The Ended event removes the record and refills.
                record.meta.mark_closing();
                if let Some(handle) = &record.handle {
                    handle.close();
                }
                pool_log!(self, debug, id = id, "closing idle connection");
            }
            TimerKind::Retry => {
                if record.meta.state != ConnectionState::Retry {
                    return;
                }
                record.meta.mark_connecting();
                let attempt = record.attempt();
                pool_log!(self, debug, id = id, "reconnecting (attempt {})", attempt);
                self.spawn_connect(id, attempt);
            }
        }
    }

    fn release(self: &Arc<Self>, id: u64, conn: Arc<F::Connection>) {
        {
            let state = self.lock();
            if state.drained {
                return;
            }
            let current = state
                .position(id)
                .map(|idx| &state.connections[idx])
                .filter(|r| r.meta.state == ConnectionState::Used && r.holds(&conn));
            if current.is_none() {
                tracing::trace!(connection_id = id, "released connection no longer pooled");
                return;
            }
        }

        tracing::trace!(connection_id = id, "resetting released connection");
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = conn.reset().await;
            inner.on_reset(id, conn, result);
        });
    }

    fn on_reset(
        self: &Arc<Self>,
        id: u64,
        conn: Arc<F::Connection>,
        result: Result<(), SharedError>,
    ) {
        let mut state = self.lock();
        if state.drained {
            return;
        }
        let Some(idx) = state.position(id) else {
            return;
        };
        // Failed while resetting; the record belongs to the retry path now.
        if !state.connections[idx].holds(&conn)
            || state.connections[idx].meta.state != ConnectionState::Used
        {
            return;
        }

        match result {
            Ok(()) => self.hand_off(&mut state, idx),
            Err(source) => {
                self.metrics.resets_failed.fetch_add(1, Ordering::Relaxed);
                let error = PoolError::ResetFailed { id, source };
                pool_log!(self, warn, id = id, "{}; closing connection", error);
                state.connections[idx].meta.mark_closing();
                conn.close();
            }
        }
    }

    async fn teardown(
        &self,
        waiters: VecDeque<Waiter<F>>,
        mut records: Vec<Record<F::Connection>>,
    ) {
        pool_log!(
            self,
            debug,
            "draining pool: {} connections, {} waiters",
            records.len(),
            waiters.len()
        );
        self.flush_log();
        drop(waiters);

        for record in &mut records {
            record.cancel_timer();
        }

        let busy: Vec<_> = records
            .iter()
            .filter_map(|r| r.handle.as_ref())
            .filter(|h| h.is_busy())
            .collect();
        for handle in &busy {
            handle.cancel();
        }
        join_all(busy.iter().map(|h| h.wait_idle())).await;

        let mut closed = 0;
        for record in &records {
            // Closing records were already asked to close.
            if record.meta.state == ConnectionState::Closing {
                continue;
            }
            if let Some(handle) = &record.handle {
                handle.close();
                closed += 1;
            }
        }
        self.metrics
            .connections_closed
            .fetch_add(closed, Ordering::Relaxed);

        pool_log!(self, debug, "pool drained");
        self.flush_log();
    }

    /// Lock the pool state. Log lines queued while it is held go to the
    /// sink when the guard is dropped.
    fn lock(&self) -> StateGuard<'_, F> {
        StateGuard {
            inner: self,
            state: self.state.lock(),
        }
    }

    fn queue_log(&self, line: String) {
        self.sink_lines.lock().push(line);
    }

    /// Deliver queued lines to the log sink. Must not be called with the
    /// state lock held.
    fn flush_log(&self) {
        let Some(sink) = &self.config.log_sink else {
            return;
        };
        let lines = std::mem::take(&mut *self.sink_lines.lock());
        for line in &lines {
            sink.emit(line);
        }
    }

    fn metadata(&self, id: u64) -> Option<ConnectionMetadata> {
        let state = self.lock();
        state
            .position(id)
            .map(|idx| state.connections[idx].meta.clone())
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.drained {
            return;
        }
        for record in &mut state.connections {
            record.cancel_timer();
            if let Some(handle) = record.handle.take() {
                handle.close();
            }
        }
    }
}

/// Pool state guard that hands queued log lines to the sink once released.
struct StateGuard<'a, F: ConnectionFactory> {
    inner: &'a PoolInner<F>,
    state: MutexGuard<'a, PoolState<F>>,
}

impl<F: ConnectionFactory> Deref for StateGuard<'_, F> {
    type Target = PoolState<F>;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl<F: ConnectionFactory> DerefMut for StateGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl<F: ConnectionFactory> Drop for StateGuard<'_, F> {
    fn drop(&mut self) {
        if self.inner.config.log_sink.is_none() || self.inner.sink_lines.lock().is_empty() {
            return;
        }
        let inner = self.inner;
        MutexGuard::unlocked(&mut self.state, || inner.flush_log());
    }
}

/// Removes an acquire's queue entry if its future is dropped while waiting.
struct WaiterGuard<'a, F: ConnectionFactory> {
    inner: &'a Arc<PoolInner<F>>,
    id: u64,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for WaiterGuard<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            let removed = self.inner.state.lock().remove_waiter(self.id);
            drop(removed);
        }
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to the underlying connection. When dropped (or passed to
/// [`release`](Self::release)), the connection is reset and returned to
/// the pool.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    id: u64,
    conn: Arc<F::Connection>,
    returned: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(pool: Arc<PoolInner<F>>, id: u64, conn: Arc<F::Connection>) -> Self {
        Self {
            pool,
            id,
            conn,
            returned: false,
        }
    }

    /// Pool record id of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current metadata for this connection.
    ///
    /// Returns `None` if the pool no longer tracks the connection (it
    /// failed, ended, or the pool was drained).
    #[must_use]
    pub fn metadata(&self) -> Option<ConnectionMetadata> {
        self.pool.metadata(self.id)
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Drop without returning to the pool; the pool still owns the record.
    fn disarm(mut self) {
        self.returned = true;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if !self.returned {
            self.returned = true;
            self.pool.release(self.id, Arc::clone(&self.conn));
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pool`].
pub struct PoolBuilder<F: ConnectionFactory> {
    config: PoolConfig,
    factory: Option<F>,
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            factory: None,
        }
    }

    /// Set the factory that opens connections.
    #[must_use]
    pub fn factory(mut self, factory: F) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.config = self.config.min_connections(count);
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config = self.config.max_connections(count);
        self
    }

    /// Set the idle connection timeout. `None` disables idle eviction.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config = self.config.idle_timeout(timeout);
        self
    }

    /// Set the reconnect delay. `None` disables reconnection.
    #[must_use]
    pub fn retry_delay(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.config = self.config.retry_delay(delay);
        self
    }

    /// Set the connection acquisition timeout. `None` waits indefinitely.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config = self.config.acquire_timeout(timeout);
        self
    }

    /// Send pool lifecycle messages to `sink` in addition to `tracing`.
    #[must_use]
    pub fn log_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.config = self.config.log_sink(sink);
        self
    }

    /// Build the pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Configuration`] if no factory was set or the
    /// configuration is invalid.
    pub fn build(self) -> Result<Pool<F>, PoolError> {
        let factory = self
            .factory
            .ok_or_else(|| PoolError::Configuration("a connection factory is required".into()))?;
        Pool::new(self.config, factory)
    }
}

impl<F: ConnectionFactory> Default for PoolBuilder<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently checked out or being reset.
    pub in_use: u32,
    /// Number of connection attempts in progress.
    pub pending: u32,
    /// Number of failed connections waiting to reconnect.
    pub retrying: u32,
    /// Number of connections asked to close that have not ended yet.
    pub closing: u32,
    /// Total number of connection records.
    pub total: u32,
    /// Number of acquires waiting for a connection.
    pub waiting: u32,
    /// Minimum maintained connections.
    pub min: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Fraction of the maximum currently checked out, from 0.0 to 1.0.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        f64::from(self.in_use) / f64::from(self.max)
    }

    /// Whether every slot is taken and requests are queued.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.total >= self.max && self.available == 0 && self.waiting > 0
    }
}

/// Counters accumulated over the pool's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Connections successfully established (including reconnects).
    pub connections_created: u64,
    /// Connections that ended or were closed by drain.
    pub connections_closed: u64,
    /// Failed connect attempts.
    pub connect_failures: u64,
    /// Acquires that received a connection.
    pub checkouts_successful: u64,
    /// Acquires that timed out.
    pub checkouts_failed: u64,
    /// Resets that failed on release.
    pub resets_failed: u64,
}

impl PoolMetrics {
    /// Fraction of finished acquires that got a connection.
    ///
    /// Returns 1.0 when no acquire has finished yet.
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}
