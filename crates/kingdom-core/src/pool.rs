//! Database connection pool
//!
//! Fixed set of SQLite connections opened up front and leased through RAII
//! guards. A lease always returns its connection on drop, including when the
//! holder fails or panics.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::{Error, Result};

/// Opens new database connections for the pool
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> rusqlite::Result<Connection>;
}

/// Opens SQLite connections to a file, or to private in-memory databases
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: Option<String>,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path == ":memory:" { None } else { Some(path) };
        Self {
            path,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Each connection gets its own in-memory database
    pub fn in_memory() -> Self {
        Self {
            path: None,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

impl ConnectionFactory for SqliteConnector {
    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = match &self.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections held by the pool, leased or not
    pub capacity: usize,
    /// Connections ready to be leased
    pub available: usize,
    pub connections_created: u64,
    /// Total number of leases handed out
    pub connections_used: u64,
}

struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    created: AtomicU64,
    used: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed-size pool of database connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open `size` connections with `factory`
    ///
    /// Fails on the first connection error unless `allow_partial` is set, in
    /// which case the pool keeps the connections that did open (at least one).
    pub fn new(factory: &dyn ConnectionFactory, size: usize, allow_partial: bool) -> Result<Self> {
        if size == 0 {
            return Err(Error::PoolInit("pool size must be at least 1".to_string()));
        }

        let mut connections = Vec::with_capacity(size);
        for index in 0..size {
            match factory.connect() {
                Ok(conn) => connections.push(conn),
                Err(e) if allow_partial => {
                    warn!(index, error = %e, "Failed to open pooled connection, continuing with partial pool");
                }
                Err(e) => {
                    return Err(Error::PoolInit(format!(
                        "connection {} of {} failed: {}",
                        index + 1,
                        size,
                        e
                    )));
                }
            }
        }

        if connections.is_empty() {
            return Err(Error::PoolInit("no connection could be opened".to_string()));
        }

        let capacity = connections.len();
        info!(capacity, requested = size, "Connection pool initialized");

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(connections),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                created: AtomicU64::new(capacity as u64),
                used: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Pool over the SQLite database named in `config`
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        if config.path != ":memory:" {
            if let Some(parent) = Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let connector = SqliteConnector::new(config.path.clone());
        Self::new(&connector, config.pool_size, config.allow_partial_pool)
    }

    /// Lease a connection, waiting up to `timeout` for one to be returned
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => return Err(Error::PoolExhausted { waited: timeout }),
        };

        // A permit guarantees an idle connection
        let conn = self.inner.lock_idle().pop().ok_or(Error::PoolClosed)?;
        self.inner.used.fetch_add(1, Ordering::Relaxed);
        debug!("Connection leased");

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Refuse new leases and drop idle connections
    ///
    /// Outstanding leases close their connection when dropped.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let dropped = self.inner.lock_idle().drain(..).count();
        info!(closed = dropped, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            available: self.inner.lock_idle().len(),
            connections_created: self.inner.created.load(Ordering::Relaxed),
            connections_used: self.inner.used.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Leased connection, returned to the pool on drop
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in Drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.pool.closed.load(Ordering::Acquire) {
                self.pool.lock_idle().push(conn);
                debug!("Connection returned");
            }
        }
        // The permit is released after the connection is back in place
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FlakyConnector {
        calls: AtomicUsize,
        fail_on: usize,
    }

    impl ConnectionFactory for FlakyConnector {
        fn connect(&self) -> rusqlite::Result<Connection> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                return Err(rusqlite::Error::InvalidQuery);
            }
            Connection::open_in_memory()
        }
    }

    #[tokio::test]
    async fn test_acquire_and_return() {
        let pool = ConnectionPool::new(&SqliteConnector::in_memory(), 2, false).unwrap();
        {
            let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
            let value: i64 = conn.query_row("SELECT 1 + 1", [], |row| row.get(0)).unwrap();
            assert_eq!(value, 2);
            assert_eq!(pool.stats().available, 1);
        }

        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.connections_created, 2);
        assert_eq!(stats.connections_used, 1);
    }

    #[tokio::test]
    async fn test_exhausted_times_out() {
        let pool = ConnectionPool::new(&SqliteConnector::in_memory(), 1, false).unwrap();
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let result = pool.acquire(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(Error::PoolExhausted { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_conservation_under_concurrency() {
        let pool = ConnectionPool::new(&SqliteConnector::in_memory(), 3, false).unwrap();
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let conn = pool.acquire(Duration::from_secs(5)).await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.connections_used, 20);
    }

    #[tokio::test]
    async fn test_lease_returned_after_panic() {
        let pool = ConnectionPool::new(&SqliteConnector::in_memory(), 1, false).unwrap();
        let cloned = pool.clone();

        let result = tokio::spawn(async move {
            let _conn = cloned.acquire(Duration::from_secs(1)).await.unwrap();
            panic!("handler blew up");
        })
        .await;
        assert!(result.is_err());

        assert_eq!(pool.stats().available, 1);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[test]
    fn test_strict_init_fails_fast() {
        let factory = FlakyConnector {
            calls: AtomicUsize::new(0),
            fail_on: 1,
        };
        let result = ConnectionPool::new(&factory, 3, false);
        assert!(matches!(result, Err(Error::PoolInit(_))));
    }

    #[test]
    fn test_partial_pool_allowed() {
        let factory = FlakyConnector {
            calls: AtomicUsize::new(0),
            fail_on: 1,
        };
        let pool = ConnectionPool::new(&factory, 3, true).unwrap();
        assert_eq!(pool.stats().capacity, 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = ConnectionPool::new(&SqliteConnector::in_memory(), 1, false).unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(Error::PoolClosed)
        ));
        assert_eq!(pool.stats().available, 0);
    }

    #[test]
    fn test_from_config_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kingdom.db");
        let config = DatabaseConfig {
            path: path.to_string_lossy().into_owned(),
            pool_size: 2,
            ..Default::default()
        };

        let pool = ConnectionPool::from_config(&config).unwrap();
        assert_eq!(pool.stats().capacity, 2);
        assert!(path.exists());
    }
}
