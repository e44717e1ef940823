//! Bounded SQLite connection pool.
//!
//! At most `max` connections exist at once; callers past that wait for a free
//! slot up to the acquire deadline and then fail with
//! [`StoreError::PoolTimeout`].

use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{Result, StoreError};
use crate::config::StoreConfig;

struct PoolInner {
    path: PathBuf,
    busy_timeout: Duration,
    acquire_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

impl PoolInner {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared handle to the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open the database and eagerly create `pool_min` connections.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let inner = Arc::new(PoolInner {
            path: config.path.clone(),
            busy_timeout: config.busy_timeout(),
            acquire_timeout: config.acquire_timeout(),
            idle: Mutex::new(Vec::with_capacity(config.pool_max)),
            permits: Arc::new(Semaphore::new(config.pool_max)),
        });

        let mut warm = Vec::with_capacity(config.pool_min);
        for _ in 0..config.pool_min.max(1) {
            warm.push(open_connection(&inner.path, inner.busy_timeout)?);
        }
        inner.idle().extend(warm);

        Ok(Self { inner })
    }

    /// Wait for a free connection, bounded by the acquire deadline.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let wait = self.inner.acquire_timeout;
        let permit =
            match tokio::time::timeout(wait, self.inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(StoreError::Closed),
                Err(_) => return Err(StoreError::PoolTimeout(wait)),
            };

        let idle = self.inner.idle().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => open_connection(&self.inner.path, self.inner.busy_timeout)?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Run `f` synchronously on a parked connection, outside the permit
    /// accounting. Only meant for setup before the pool is shared.
    pub(crate) fn with_idle<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let parked = self.inner.idle().pop();
        let conn = match parked {
            Some(conn) => conn,
            None => open_connection(&self.inner.path, self.inner.busy_timeout)?,
        };
        let result = f(&conn);
        self.inner.idle().push(conn);
        result
    }

    /// Stop handing out connections and drop the idle ones.
    ///
    /// Connections currently checked out are closed when returned.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Connections currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }
}

fn open_connection(path: &std::path::Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // WAL mode lets readers proceed while a writer holds the lock
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// A checked-out connection, returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    // Released after `conn` is parked again (field drop order).
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.pool.permits.is_closed() {
                self.pool.idle().push(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &tempfile::TempDir, max: usize) -> StoreConfig {
        StoreConfig {
            pool_max: max,
            acquire_timeout_ms: 50,
            ..StoreConfig::at(dir.path().join("pool.db"))
        }
    }

    #[tokio::test]
    async fn warms_min_connections() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(&StoreConfig {
            pool_min: 3,
            ..config(&dir, 5)
        })
        .unwrap();
        assert_eq!(pool.idle_count(), 3);
    }

    #[tokio::test]
    async fn connections_are_reused() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(&config(&dir, 2)).unwrap();
        {
            let conn = pool.acquire().await.unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
        let conn = pool.acquire().await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(&config(&dir, 1)).unwrap();
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, StoreError::PoolTimeout(_)));
    }

    #[tokio::test]
    async fn waiter_gets_released_slot() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(&StoreConfig {
            acquire_timeout_ms: 2000,
            ..config(&dir, 1)
        })
        .unwrap();
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(&config(&dir, 2)).unwrap();
        let held = pool.acquire().await.unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(StoreError::Closed)));
        drop(held);
        assert_eq!(pool.idle_count(), 0);
    }
}
