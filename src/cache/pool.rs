use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use crate::error::Result;

/// A bounded pool of SQLite connections to a single database file, each opened with
/// WAL journaling so readers never block the sync worker's writes.
///
/// Grounded on the teacher's `storage::message_persistence::ConnectionPool`: a
/// semaphore-bounded vec of connections, created lazily up to `max_connections` and
/// recycled via `PooledConnection`'s `Drop`.
pub struct ConnectionPool {
    connections: Mutex<Vec<Arc<Mutex<Connection>>>>,
    semaphore: Arc<Semaphore>,
    db_path: std::path::PathBuf,
    max_connections: usize,
}

impl ConnectionPool {
    pub fn open(db_path: impl AsRef<Path>, max_connections: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Prime the pool with one connection so callers fail fast on an unopenable path.
        let first = Arc::new(Mutex::new(Self::create_connection(&db_path)?));
        Ok(Self {
            connections: Mutex::new(vec![first]),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            db_path,
            max_connections,
        })
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(conn)
    }

    /// Acquires a connection, growing the pool lazily up to `max_connections`.
    pub async fn acquire(&self) -> Result<PooledConnection<'_>> {
        let permit = self.semaphore.acquire().await.expect("semaphore closed");

        let conn = {
            let mut guard = self.connections.lock().expect("pool mutex poisoned");
            guard.pop()
        };
        let conn = match conn {
            Some(conn) => conn,
            None => {
                debug!(path = %self.db_path.display(), "opening new pooled connection");
                Arc::new(Mutex::new(Self::create_connection(&self.db_path)?))
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
            _permit: permit,
        })
    }
}

/// A leased connection. Returns itself to the pool on drop instead of closing.
pub struct PooledConnection<'a> {
    conn: Option<Arc<Mutex<Connection>>>,
    pool: &'a ConnectionPool,
    _permit: SemaphorePermit<'a>,
}

impl PooledConnection<'_> {
    /// Runs a synchronous closure against the held connection.
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R>,
    {
        let conn = self.conn.as_ref().expect("connection taken");
        let guard = conn.lock().expect("connection mutex poisoned");
        Ok(f(&guard)?)
    }

    /// Runs a closure inside a transaction, committing on `Ok` and rolling back on `Err`.
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<R>,
    {
        let conn = self.conn.as_ref().expect("connection taken");
        let mut guard = conn.lock().expect("connection mutex poisoned");
        let tx = guard.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut guard = self
                .pool
                .connections
                .lock()
                .expect("pool mutex poisoned");
            if guard.len() < self.pool.max_connections {
                guard.push(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_execute_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("test.db"), 4).unwrap();

        let conn = pool.acquire().await.unwrap();
        conn.execute(|c| c.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)"))
            .unwrap();
        conn.execute(|c| c.execute("INSERT INTO t (v) VALUES (?1)", ["hello"]))
            .unwrap();

        let count: i64 = conn
            .execute(|c| c.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("test.db"), 4).unwrap();
        let conn = pool.acquire().await.unwrap();
        conn.execute(|c| c.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT UNIQUE)"))
            .unwrap();

        let result = conn.transaction(|tx| {
            tx.execute("INSERT INTO t (v) VALUES ('a')", [])?;
            tx.execute("INSERT INTO t (v) VALUES ('a')", [])?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = conn
            .execute(|c| c.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn pool_reuses_connections_across_acquires() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("test.db"), 2).unwrap();

        for _ in 0..5 {
            let conn = pool.acquire().await.unwrap();
            conn.execute(|c| c.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
                .unwrap();
        }
    }
}
