//! Breaker-guarded connection pool
//!
//! This module provides a fixed-size pool of database connections with:
//! - Blocking checkout: callers wait for a free connection, bounding
//!   concurrent work to the pool size
//! - A rate-based circuit breaker that marks the pool unavailable when too
//!   many connection attempts fail
//! - Lazy regeneration: once the breaker has been open long enough, the next
//!   failing caller rebuilds the whole connection set

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::circuit::{BreakerStats, CallError, RateBreaker};
use super::slots::{Checkout, SlotQueue};
use super::state::{spawn_listener, PoolState, StateCell};
use crate::client::{ClientError, Connector, MySqlConnector};
use crate::config::{ConfigError, PoolConfig, PoolSettings};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to database: {0}")]
    Connect(#[source] ClientError),

    #[error("failed to create connection pool: {failed} of {pool_size} connections failed")]
    BuildFailed { failed: u64, pool_size: usize },

    #[error("unavailable service")]
    Unavailable,

    #[error("empty connection")]
    EmptyConnection,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection pool is closed")]
    Closed,
}

impl PoolError {
    /// True for failures to open connections while (re)building the pool
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, PoolError::Connect(_) | PoolError::BuildFailed { .. })
    }
}

/// Error returned by [`ConnectionPool::new`]
#[derive(thiserror::Error)]
pub enum InitError<C: Connector> {
    /// The configuration has no usable connection target; no pool was created
    #[error("{0}")]
    Config(#[source] ConfigError),

    /// The initial build failed. The pool exists in the `Fail` state and will
    /// try to regenerate on use.
    #[error("{source}")]
    Degraded {
        pool: Box<ConnectionPool<C>>,
        #[source]
        source: PoolError,
    },
}

impl<C: Connector> InitError<C> {
    /// The degraded pool, if one was created
    pub fn into_pool(self) -> Option<ConnectionPool<C>> {
        match self {
            InitError::Config(_) => None,
            InitError::Degraded { pool, .. } => Some(*pool),
        }
    }

    /// Split into the degraded pool (if any) and the underlying error
    pub fn into_parts(self) -> (Option<ConnectionPool<C>>, PoolError) {
        match self {
            InitError::Config(e) => (None, PoolError::Config(e)),
            InitError::Degraded { pool, source } => (Some(*pool), source),
        }
    }
}

impl<C: Connector> fmt::Debug for InitError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Config(e) => f.debug_tuple("Config").field(e).finish(),
            InitError::Degraded { pool, source } => f
                .debug_struct("Degraded")
                .field("pool", pool)
                .field("source", source)
                .finish(),
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Current availability state
    pub state: PoolState,

    /// Fixed number of slots
    pub capacity: usize,

    /// Entries waiting in the queue (including empty placeholders)
    pub idle: usize,

    /// Entries currently held by callers
    pub checked_out: usize,

    /// Connections that failed to open during the last build
    pub failed_opens: u64,

    /// Consecutive failed regeneration attempts
    pub regen_tries: u64,

    /// Epoch seconds of the most recent trip, 0 if none
    pub tripped_at: i64,

    /// Circuit breaker statistics
    pub breaker: BreakerStats,
}

/// Fixed-size connection pool guarded by a circuit breaker
pub struct ConnectionPool<C: Connector = MySqlConnector> {
    connector: C,
    settings: PoolSettings,
    breaker: Arc<RateBreaker>,
    slots: SlotQueue<C::Connection>,
    state: Arc<StateCell>,

    /// Connections that failed to open during the last build
    fail_count: AtomicU64,

    /// Consecutive failed regeneration attempts since the last successful reset
    regen_tries: AtomicU64,

    /// Held for the whole of a regeneration attempt
    regenerating: Mutex<()>,

    closed: AtomicBool,
    listener: JoinHandle<()>,
}

impl ConnectionPool<MySqlConnector> {
    /// Create a MySQL connection pool
    pub async fn connect(config: &PoolConfig) -> Result<Self, InitError<MySqlConnector>> {
        Self::new(MySqlConnector::new(), config).await
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool and open its connections
    ///
    /// Connections that fail to open are replaced by empty placeholders. If
    /// the breaker trips during this first build the pool is still returned,
    /// in the `Fail` state, inside [`InitError::Degraded`].
    pub async fn new(connector: C, config: &PoolConfig) -> Result<Self, InitError<C>> {
        let settings = config.normalize().map_err(InitError::Config)?;
        Self::with_settings(connector, settings).await
    }

    /// Create a pool from already normalized settings
    pub async fn with_settings(connector: C, settings: PoolSettings) -> Result<Self, InitError<C>> {
        let breaker = Arc::new(RateBreaker::new(settings.fail_rate, settings.universe));
        let state = Arc::new(StateCell::new(PoolState::Success));
        let listener = spawn_listener(breaker.subscribe(), Arc::clone(&state));

        info!(
            pool_size = settings.pool_size,
            fail_rate = settings.fail_rate,
            universe = settings.universe,
            timeout_ms = settings.timeout.as_millis() as u64,
            regenerate_secs = settings.regenerate_interval.as_secs(),
            "Creating connection pool"
        );

        let pool = Self {
            connector,
            slots: SlotQueue::new(settings.pool_size),
            settings,
            breaker,
            state,
            fail_count: AtomicU64::new(0),
            regen_tries: AtomicU64::new(0),
            regenerating: Mutex::new(()),
            closed: AtomicBool::new(false),
            listener,
        };

        match pool.build(false).await {
            Ok(()) => Ok(pool),
            Err(source) => {
                warn!(error = %source, "Initial pool build failed, pool is degraded");
                pool.state.force(PoolState::Fail, pool.breaker.last_seq());
                Err(InitError::Degraded {
                    pool: Box::new(pool),
                    source,
                })
            }
        }
    }

    /// Run `callback` with a pooled connection
    ///
    /// Waits for a free connection if all are in use. The callback's own
    /// error is returned unchanged; pool failures are converted into `E`.
    ///
    /// ```rust,no_run
    /// use breakerpool::{ConnectionPool, PoolConfig, PoolError};
    /// use mysql_async::prelude::*;
    ///
    /// # async fn example(pool: ConnectionPool) -> anyhow::Result<()> {
    /// let count: Option<u64> = pool
    ///     .execute(|conn| {
    ///         Box::pin(async move {
    ///             let count = conn.query_first("SELECT COUNT(*) FROM orders").await?;
    ///             Ok::<_, anyhow::Error>(count)
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute<T, E, F>(&self, callback: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut C::Connection) -> BoxFuture<'c, Result<T, E>>,
        E: From<PoolError>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed.into());
        }

        match self.state() {
            PoolState::Fail => {
                self.regenerate().await;
                return Err(PoolError::Unavailable.into());
            }
            PoolState::Regenerate => return Err(PoolError::Unavailable.into()),
            PoolState::Success => {}
        }

        // Dropping the checkout returns the entry, including when this future
        // is cancelled mid-callback
        let mut checkout = self.slots.acquire().await.map_err(|_| PoolError::Closed)?;
        let Some(conn) = checkout.get_mut() else {
            debug!("Acquired empty connection slot");
            self.breaker.fail();
            self.release(checkout).await;
            return Err(PoolError::EmptyConnection.into());
        };

        // The breaker only sees whether the callback finished in time; the
        // callback's own result is passed through untouched.
        let outcome = self
            .breaker
            .call(
                async { Ok::<_, Infallible>(callback(conn).await) },
                self.settings.timeout,
            )
            .await;

        self.release(checkout).await;

        match outcome {
            Ok(result) => result,
            Err(CallError::Open) => Err(PoolError::Unavailable.into()),
            Err(CallError::Timeout(timeout)) => Err(PoolError::Timeout(timeout).into()),
            Err(CallError::Inner(never)) => match never {},
        }
    }

    /// Connection target the pool opens connections to
    pub fn target(&self) -> &str {
        &self.settings.target
    }

    pub fn state(&self) -> PoolState {
        self.state.get()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn breaker(&self) -> &RateBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            state: self.state(),
            capacity: self.slots.capacity(),
            idle: self.slots.idle(),
            checked_out: self.slots.checked_out(),
            failed_opens: self.fail_count.load(Ordering::Acquire),
            regen_tries: self.regen_tries.load(Ordering::Acquire),
            tripped_at: self.state.tripped_at(),
            breaker: self.breaker.stats(),
        }
    }

    /// Close every connection and shut the pool down
    ///
    /// Waits for checked-out connections to be returned. Later calls to
    /// `execute` fail with [`PoolError::Closed`]. Calling `close` again is a
    /// no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained = self.slots.drain().await;
        let count = drained.len();
        for conn in drained.into_iter().flatten() {
            self.close_connection(conn).await;
        }
        self.slots.close();
        self.listener.abort();

        info!(drained = count, "Connection pool closed");
    }

    /// Fill the queue with `pool_size` entries
    ///
    /// With `fail_first`, the first connection failure aborts the build.
    /// Otherwise failed slots get an empty placeholder and the build goes on.
    async fn build(&self, fail_first: bool) -> Result<(), PoolError> {
        for slot in 0..self.settings.pool_size {
            match self.open_connection().await {
                Ok(conn) => self.push(Some(conn)).await,
                Err(e) if fail_first => {
                    warn!(slot = slot, error = %e, "Pool rebuild aborted");
                    self.state.mark_tripped();
                    return Err(e);
                }
                Err(e) => {
                    self.fail_count.fetch_add(1, Ordering::AcqRel);
                    warn!(slot = slot, error = %e, "Failed to open connection, keeping empty slot");
                    self.push(None).await;
                }
            }
        }

        if self.breaker.tripped() {
            self.state.mark_tripped();
            return Err(PoolError::BuildFailed {
                failed: self.fail_count.load(Ordering::Acquire),
                pool_size: self.settings.pool_size,
            });
        }

        self.state.force(PoolState::Success, self.breaker.last_seq());
        info!(
            pool_size = self.settings.pool_size,
            failed = self.fail_count.load(Ordering::Acquire),
            "Connection pool built"
        );
        Ok(())
    }

    /// Open and ping one connection under the breaker
    async fn open_connection(&self) -> Result<C::Connection, PoolError> {
        if self.breaker.tripped() {
            return Err(PoolError::Unavailable);
        }

        let connector = &self.connector;
        let target = self.settings.target.as_str();
        let result = self
            .breaker
            .call(
                async move {
                    let mut conn = connector.open(target).await?;
                    if let Err(e) = connector.ping(&mut conn).await {
                        if let Err(close_err) = connector.close(conn).await {
                            debug!(error = %close_err, "Error while closing unresponsive connection");
                        }
                        return Err(e);
                    }
                    Ok::<_, ClientError>(conn)
                },
                self.settings.timeout,
            )
            .await;

        match result {
            Ok(conn) => Ok(conn),
            Err(CallError::Open) => Err(PoolError::Unavailable),
            Err(CallError::Timeout(timeout)) => Err(PoolError::Connect(
                format!("connection attempt timed out after {:?}", timeout).into(),
            )),
            Err(CallError::Inner(e)) => Err(PoolError::Connect(e)),
        }
    }

    /// Rebuild the pool if the breaker has been open long enough
    async fn regenerate(&self) {
        let Ok(_guard) = self.regenerating.try_lock() else {
            debug!("Regeneration already in progress");
            return;
        };

        if self.state() != PoolState::Fail {
            return;
        }

        let now = chrono::Utc::now().timestamp();
        let elapsed = now - self.state.tripped_at();
        let interval = self.settings.regenerate_interval.as_secs() as i64;
        if elapsed < interval {
            debug!(elapsed = elapsed, interval = interval, "Too early to regenerate");
            return;
        }

        let previous_tries = self.regen_tries.fetch_add(1, Ordering::AcqRel);
        info!(attempt = previous_tries + 1, "Regenerating connection pool");

        // Re-trips on drop, which also covers a caller cancelled mid-rebuild
        let mut attempt = RegenAttempt {
            pool: self,
            finished: false,
        };

        self.reset(previous_tries == 0).await;

        match self.build(true).await {
            Ok(()) => {
                attempt.finished = true;
                self.regen_tries.store(0, Ordering::Release);
                info!("Connection pool regenerated");
            }
            Err(e) => {
                warn!(error = %e, attempt = previous_tries + 1, "Connection pool regeneration failed");
            }
        }
    }

    /// Put the pool back into `Fail` and restart the regeneration interval
    fn retrip(&self) {
        self.breaker.trip();
        self.state.mark_tripped();
        self.state.force(PoolState::Fail, self.breaker.last_seq());
    }

    /// Empty the pool and close the breaker
    ///
    /// With `wait_for_all`, waits for checked-out connections and closes
    /// every connection; otherwise only idle entries are removed.
    async fn reset(&self, wait_for_all: bool) {
        let drained = if wait_for_all {
            self.slots.drain().await
        } else {
            self.slots.drain_idle()
        };
        debug!(drained = drained.len(), wait_for_all = wait_for_all, "Resetting pool");

        for conn in drained.into_iter().flatten() {
            self.close_connection(conn).await;
        }

        self.breaker.reset();
        self.fail_count.store(0, Ordering::Release);
        self.state.clear_tripped();
    }

    async fn push(&self, entry: Option<C::Connection>) {
        if let Err(Some(conn)) = self.slots.push(entry) {
            warn!("Connection pool is full, closing surplus connection");
            self.close_connection(conn).await;
        }
    }

    async fn release(&self, checkout: Checkout<'_, C::Connection>) {
        if let Err(Some(conn)) = checkout.release() {
            warn!("Connection pool is full, closing returned connection");
            self.close_connection(conn).await;
        }
    }

    async fn close_connection(&self, conn: C::Connection) {
        if let Err(e) = self.connector.close(conn).await {
            debug!(error = %e, "Error while closing connection");
        }
    }
}

/// One regeneration attempt; the pool is re-tripped unless it finishes
struct RegenAttempt<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    finished: bool,
}

impl<C: Connector> Drop for RegenAttempt<'_, C> {
    fn drop(&mut self) {
        if !self.finished {
            self.pool.retrip();
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("state", &self.state())
            .field("pool_size", &self.settings.pool_size)
            .field("idle", &self.slots.idle())
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingConnector {
        reachable: AtomicBool,
        ping_fails: AtomicBool,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl CountingConnector {
        fn up() -> Self {
            let connector = Self::default();
            connector.reachable.store(true, Ordering::SeqCst);
            connector
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Connection = usize;

        async fn open(&self, _target: &str) -> Result<usize, ClientError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err("connection refused".into());
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn ping(&self, _conn: &mut usize) -> Result<(), ClientError> {
            if self.ping_fails.load(Ordering::SeqCst) {
                return Err("server has gone away".into());
            }
            Ok(())
        }

        async fn close(&self, _conn: usize) -> Result<(), ClientError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.ping_fails.load(Ordering::SeqCst) {
                return Err("broken pipe".into());
            }
            Ok(())
        }
    }

    fn config(pool_size: i64) -> PoolConfig {
        PoolConfig {
            pool_size,
            fail_rate: 0.5,
            ..PoolConfig::with_url("mysql://test/db")
        }
    }

    #[test]
    fn test_connect_failure_kinds() {
        assert!(PoolError::Connect("refused".into()).is_connect_failure());
        assert!(PoolError::BuildFailed { failed: 1, pool_size: 2 }.is_connect_failure());
        assert!(!PoolError::Unavailable.is_connect_failure());
        assert_eq!(PoolError::Unavailable.to_string(), "unavailable service");
        assert_eq!(PoolError::EmptyConnection.to_string(), "empty connection");
    }

    #[tokio::test]
    async fn test_init_error_messages() {
        use std::error::Error;

        let config_err: InitError<CountingConnector> = InitError::Config(ConfigError::MissingTarget);
        assert_eq!(config_err.to_string(), ConfigError::MissingTarget.to_string());
        assert!(config_err.source().is_some());

        let degraded = ConnectionPool::new(CountingConnector::default(), &config(2))
            .await
            .unwrap_err();
        assert_eq!(
            degraded.to_string(),
            "failed to create connection pool: 2 of 2 connections failed"
        );
        assert!(degraded.source().is_some());

        let (pool, source) = degraded.into_parts();
        assert!(pool.is_some());
        assert!(source.is_connect_failure());
    }

    #[tokio::test]
    async fn test_unresponsive_connections_are_closed() {
        let connector = CountingConnector::up();
        connector.ping_fails.store(true, Ordering::SeqCst);
        let settings = PoolSettings {
            target: "mysql://test/db".to_string(),
            pool_size: 2,
            fail_rate: 1.0,
            universe: 10,
            timeout: Duration::ZERO,
            regenerate_interval: Duration::from_secs(3),
        };

        let pool = ConnectionPool::with_settings(connector, settings).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.failed_opens, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(pool.connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.connector.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(CountingConnector::up(), &config(3))
            .await
            .unwrap();

        let stats = pool.stats();
        assert_eq!(stats.state, PoolState::Success);
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.failed_opens, 0);
        assert_eq!(pool.target(), "mysql://test/db");
    }

    #[tokio::test]
    async fn test_empty_slot_is_reported_and_kept() {
        let connector = CountingConnector::default();
        let settings = PoolSettings {
            target: "mysql://test/db".to_string(),
            pool_size: 2,
            fail_rate: 1.0,
            universe: 10,
            timeout: Duration::ZERO,
            regenerate_interval: Duration::from_secs(3),
        };

        let pool = ConnectionPool::with_settings(connector, settings).await.unwrap();
        assert_eq!(pool.stats().failed_opens, 2);

        let result: Result<(), PoolError> = pool.execute(|_| Box::pin(async { Ok(()) })).await;
        assert!(matches!(result, Err(PoolError::EmptyConnection)));
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_callback_timeout() {
        let pool = ConnectionPool::new(
            CountingConnector::up(),
            &PoolConfig {
                timeout_ms: 20,
                ..config(1)
            },
        )
        .await
        .unwrap();

        let result: Result<(), PoolError> = pool
            .execute(|_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(PoolError::Timeout(_))));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_close_drains_connections() {
        let pool = ConnectionPool::new(CountingConnector::up(), &config(3))
            .await
            .unwrap();

        pool.close().await;
        pool.close().await;

        assert_eq!(pool.connector.closed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().idle, 0);

        let result: Result<(), PoolError> = pool.execute(|_| Box::pin(async { Ok(()) })).await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }
}
