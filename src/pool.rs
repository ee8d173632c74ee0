//! Connection pool.
//!
//! Capacity is `base_size + max_overflow` outstanding connections. Up to
//! `base_size` released connections are kept idle; overflow connections are
//! closed on release. Connections older than the recycle interval are closed
//! on release, and pinged before reuse when `pre_validate` is set.
//!
//! The pool is generic over a [`Connector`] so the scheduler can be driven
//! by something other than a live database.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{BenchError, BenchResult};

/// Opens and pings connections of one kind.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Open a fresh connection.
    async fn connect(&self) -> BenchResult<Self::Conn>;

    /// Issue a no-op round trip. Returns false if the connection is unusable.
    async fn ping(&self, conn: &mut Self::Conn) -> bool;
}

/// TLS requirement for target connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Prefer,
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(BenchError::Config(format!("unknown ssl mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub base_size: usize,
    pub max_overflow: usize,
    pub acquire_timeout: Duration,
    pub idle_recycle_interval: Duration,
    pub pre_validate: bool,
    pub ssl_mode: SslMode,
}

impl PoolConfig {
    /// Defaults derived from the concurrency level: `base_size` is
    /// `max(1, concurrency / 4)` and `max_overflow` is `concurrency`.
    pub fn for_concurrency(concurrency_level: usize) -> Self {
        Self {
            base_size: (concurrency_level / 4).max(1),
            max_overflow: concurrency_level,
            acquire_timeout: Duration::from_secs(10),
            idle_recycle_interval: Duration::from_secs(3600),
            pre_validate: false,
            ssl_mode: SslMode::Require,
        }
    }

    pub fn base_size(mut self, size: usize) -> Self {
        self.base_size = size;
        self
    }

    pub fn max_overflow(mut self, overflow: usize) -> Self {
        self.max_overflow = overflow;
        self
    }

    /// Set acquire timeout (max wait time when getting a connection).
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the age after which connections are recycled.
    pub fn idle_recycle_interval(mut self, interval: Duration) -> Self {
        self.idle_recycle_interval = interval;
        self
    }

    /// Probe over-age connections before handing them out.
    pub fn pre_validate(mut self, enabled: bool) -> Self {
        self.pre_validate = enabled;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Maximum outstanding connections.
    pub fn capacity(&self) -> usize {
        self.base_size + self.max_overflow
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub capacity: usize,
    /// Highest number of simultaneously outstanding connections seen.
    pub peak_active: usize,
    pub total_created: usize,
    pub total_recycled: usize,
    pub total_discarded: usize,
}

struct IdleConn<T> {
    conn: T,
    created_at: Instant,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    idle: Mutex<Vec<IdleConn<C::Conn>>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    total_created: AtomicUsize,
    total_recycled: AtomicUsize,
    total_discarded: AtomicUsize,
}

impl<C: Connector> PoolInner<C> {
    fn return_connection(&self, conn: C::Conn, created_at: Instant) {
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if created_at.elapsed() > self.config.idle_recycle_interval {
            self.total_recycled.fetch_add(1, Ordering::Relaxed);
            debug!("Pool: closing connection past recycle age");
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.config.base_size {
            idle.push(IdleConn { conn, created_at });
        }
        // Overflow connections are dropped here.
    }

    fn discard(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.total_discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_idle(&self) -> Option<IdleConn<C::Conn>> {
        self.idle.lock().pop()
    }
}

fn connect_timed_out(timeout: Duration) -> BenchError {
    BenchError::Connection(format!("connection not established within {:?}", timeout))
}

/// A connection checked out of the pool.
///
/// Dropping it returns the connection; [`PooledConnection::discard`] closes
/// it instead. The admission permit is released only after the connection
/// has been returned or closed.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Conn>,
    created_at: Instant,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Close this connection rather than returning it to the idle set.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.discard();
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.created_at);
        }
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("Connection should always be present")
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("Connection should always be present")
    }
}

/// # Example
/// ```ignore
/// let config = PoolConfig::for_concurrency(40).pre_validate(true);
/// let pool = Pool::connect(PgConnector::new(target), config).await?;
/// let mut conn = pool.acquire().await?;
/// ```
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool without opening any connection.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.capacity()));
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                idle: Mutex::new(Vec::new()),
                semaphore,
                closed: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
                total_created: AtomicUsize::new(0),
                total_recycled: AtomicUsize::new(0),
                total_discarded: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a pool and open one connection to prove the target is reachable.
    ///
    /// The first connection must be established within the acquire timeout.
    pub async fn connect(connector: C, config: PoolConfig) -> BenchResult<Self> {
        let pool = Self::new(connector, config);
        let timeout = pool.inner.config.acquire_timeout;
        let conn = tokio::time::timeout(timeout, pool.inner.connector.connect())
            .await
            .map_err(|_| connect_timed_out(timeout))??;
        pool.inner.total_created.fetch_add(1, Ordering::Relaxed);
        pool.inner.idle.lock().push(IdleConn {
            conn,
            created_at: Instant::now(),
        });
        info!(
            "Pool ready: base_size={}, max_overflow={}, acquire_timeout={:?}",
            pool.inner.config.base_size,
            pool.inner.config.max_overflow,
            pool.inner.config.acquire_timeout
        );
        Ok(pool)
    }

    /// Acquire a connection, waiting up to the acquire timeout.
    ///
    /// The timeout covers the whole checkout: waiting for capacity, validating
    /// an idle connection and opening a new one. Running out of time while
    /// waiting for capacity is [`BenchError::PoolExhausted`]; running out while
    /// connecting is a [`BenchError::Connection`].
    pub async fn acquire(&self) -> BenchResult<PooledConnection<C>> {
        if self.is_closed() {
            return Err(BenchError::PoolClosed);
        }

        let timeout = self.inner.config.acquire_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let permit =
            tokio::time::timeout_at(deadline, Arc::clone(&self.inner.semaphore).acquire_owned())
                .await
                .map_err(|_| BenchError::PoolExhausted {
                    waited_ms: timeout.as_millis() as u64,
                })?
                .map_err(|_| BenchError::PoolClosed)?;

        let (conn, created_at) = match self.take_usable_idle(deadline).await {
            Some(idle) => (idle.conn, idle.created_at),
            None => {
                let conn = tokio::time::timeout_at(deadline, self.inner.connector.connect())
                    .await
                    .map_err(|_| connect_timed_out(timeout))??;
                self.inner.total_created.fetch_add(1, Ordering::Relaxed);
                (conn, Instant::now())
            }
        };

        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_active.fetch_max(active, Ordering::SeqCst);

        Ok(PooledConnection {
            conn: Some(conn),
            created_at,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Pop idle connections until one is usable.
    async fn take_usable_idle(
        &self,
        deadline: tokio::time::Instant,
    ) -> Option<IdleConn<C::Conn>> {
        let config = &self.inner.config;
        while let Some(mut idle) = self.inner.pop_idle() {
            if idle.created_at.elapsed() <= config.idle_recycle_interval {
                return Some(idle);
            }
            if !config.pre_validate {
                return Some(idle);
            }
            let alive = tokio::time::timeout_at(deadline, self.inner.connector.ping(&mut idle.conn))
                .await
                .unwrap_or(false);
            if alive {
                return Some(idle);
            }
            warn!("Pool: idle connection failed validation ping, closing");
            self.inner.total_recycled.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the number of connections currently in use.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active_count(),
            idle: self.idle_count(),
            capacity: self.inner.config.capacity(),
            peak_active: self.inner.peak_active.load(Ordering::SeqCst),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_recycled: self.inner.total_recycled.load(Ordering::Relaxed),
            total_discarded: self.inner.total_discarded.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Close the pool. Outstanding connections are closed on release.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.semaphore.close();
        self.inner.idle.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingConnector {
        opened: AtomicU32,
        healthy: AtomicBool,
    }

    impl CountingConnector {
        fn new() -> Self {
            Self {
                opened: AtomicU32::new(0),
                healthy: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Conn = u32;

        async fn connect(&self) -> BenchResult<u32> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn ping(&self, _conn: &mut u32) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::for_concurrency(40);
        assert_eq!(config.base_size, 10);
        assert_eq!(config.max_overflow, 40);
        assert_eq!(config.capacity(), 50);

        let config = PoolConfig::for_concurrency(2);
        assert_eq!(config.base_size, 1);
        assert_eq!(config.max_overflow, 2);
    }

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!("verify-full".parse::<SslMode>().unwrap(), SslMode::VerifyFull);
        assert_eq!("REQUIRE".parse::<SslMode>().unwrap(), SslMode::Require);
        assert!("sometimes".parse::<SslMode>().is_err());
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let pool = Pool::connect(CountingConnector::new(), PoolConfig::for_concurrency(4))
            .await
            .unwrap();
        let first = *pool.acquire().await.unwrap();
        let second = *pool.acquire().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.stats().total_created, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let config = PoolConfig::for_concurrency(1)
            .base_size(1)
            .max_overflow(1)
            .acquire_timeout(Duration::from_millis(20));
        let pool = Pool::new(CountingConnector::new(), config);
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, BenchError::PoolExhausted { .. }));
        assert_eq!(pool.stats().peak_active, 2);
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let config = PoolConfig::for_concurrency(1)
            .base_size(1)
            .max_overflow(0)
            .acquire_timeout(Duration::from_secs(5));
        let pool = Pool::new(CountingConnector::new(), config);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overflow_not_kept_idle() {
        let config = PoolConfig::for_concurrency(4).base_size(1).max_overflow(3);
        let pool = Pool::new(CountingConnector::new(), config);
        let conns = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        assert_eq!(pool.active_count(), 3);
        drop(conns);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_over_age_connection_closed_on_release() {
        let config = PoolConfig::for_concurrency(4).idle_recycle_interval(Duration::ZERO);
        let pool = Pool::new(CountingConnector::new(), config);
        let conn = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().total_recycled, 1);
        let next = pool.acquire().await.unwrap();
        assert_eq!(*next, 2);
    }

    #[tokio::test]
    async fn test_pre_validate_drops_failed_ping() {
        let connector = CountingConnector::new();
        connector.healthy.store(false, Ordering::SeqCst);
        let config = PoolConfig::for_concurrency(4)
            .idle_recycle_interval(Duration::from_millis(1))
            .pre_validate(true);
        let pool = Pool::connect(connector, config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 2);
    }

    #[tokio::test]
    async fn test_discard_does_not_return() {
        let pool = Pool::new(CountingConnector::new(), PoolConfig::for_concurrency(4));
        let conn = pool.acquire().await.unwrap();
        conn.discard();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.stats().total_discarded, 1);
    }

    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        type Conn = u32;

        async fn connect(&self) -> BenchResult<u32> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(1)
        }

        async fn ping(&self, _conn: &mut u32) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_acquire_timeout_covers_connect() {
        let config = PoolConfig::for_concurrency(1).acquire_timeout(Duration::from_millis(50));
        let pool = Pool::new(StalledConnector, config);

        let started = Instant::now();
        let err = pool.acquire().await.err().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, BenchError::Connection(_)));
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.stats().total_created, 0);
    }

    #[tokio::test]
    async fn test_initial_connect_is_bounded() {
        let config = PoolConfig::for_concurrency(1).acquire_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let result = Pool::connect(StalledConnector, config).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(result, Err(BenchError::Connection(_))));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = Pool::new(CountingConnector::new(), PoolConfig::for_concurrency(4));
        pool.close();
        assert!(matches!(pool.acquire().await, Err(BenchError::PoolClosed)));
    }
}
