//! Bounded SQLite connection pool
//!
//! A checkout holds a semaphore permit and one connection; dropping the
//! [`PooledConnection`] returns both, whichever way the execution ended.

use rusqlite::{Connection, OpenFlags};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::BackendError;

pub struct ConnectionPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl ConnectionPool {
    pub fn new(path: impl Into<PathBuf>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            path: path.into(),
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections currently available without waiting
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Connections opened and parked in the pool
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Wait for a free slot, then reuse an idle connection or open a new one
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledConnection, BackendError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Unreachable("connection pool closed".to_string()))?;

        let cached = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let conn = match cached {
            Some(conn) => conn,
            None => self.open()?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn open(&self) -> Result<Connection, BackendError> {
        debug!("Opening SQLite connection to {}", self.path.display());
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| BackendError::Unreachable(format!("{}: {e}", self.path.display())))
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

/// A connection checked out of a [`ConnectionPool`]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in Drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}
