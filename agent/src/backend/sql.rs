//! SQL backend: parameterized SQLite queries returning JSON rows
//!
//! The driver is blocking, so each query runs on the blocking pool. When the
//! deadline passes first the query is interrupted through the connection's
//! interrupt handle and its late result is dropped; the pooled connection
//! is checked back in once the blocking call unwinds.

use base64::Engine as _;
use dashmap::DashMap;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::pool::{ConnectionPool, PooledConnection};
use crate::error::BackendError;

pub struct SqlBackend {
    pools: DashMap<PathBuf, Arc<ConnectionPool>>,
    pool_size: usize,
    max_databases: usize,
}

impl SqlBackend {
    pub fn new(pool_size: usize, max_databases: usize) -> Self {
        Self {
            pools: DashMap::new(),
            pool_size,
            max_databases: max_databases.max(1),
        }
    }

    /// Databases with a cached pool
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Check out from the cached pool, or from a fresh one that is only
    /// cached once it has opened a connection
    async fn checkout(
        &self,
        database: &Path,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledConnection, BackendError> {
        let cached = self.pools.get(database).map(|pool| Arc::clone(pool.value()));
        if let Some(pool) = cached {
            return tokio::time::timeout_at(deadline, pool.checkout())
                .await
                .map_err(|_| BackendError::Timeout(timeout))?;
        }

        let pool = Arc::new(ConnectionPool::new(database, self.pool_size));
        let conn = tokio::time::timeout_at(deadline, pool.checkout())
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;
        self.remember(database, pool);
        Ok(conn)
    }

    fn remember(&self, database: &Path, pool: Arc<ConnectionPool>) {
        if self.pools.len() >= self.max_databases {
            // Drop pools with nothing checked out
            self.pools.retain(|_, p| p.available() < p.size());
        }
        if self.pools.len() < self.max_databases {
            self.pools.entry(database.to_path_buf()).or_insert(pool);
        } else {
            debug!(
                "SQL pool cache full ({} databases), not caching {}",
                self.max_databases,
                database.display()
            );
        }
    }

    pub async fn execute(
        &self,
        database: &Path,
        query: String,
        params: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BackendError> {
        let deadline = Instant::now() + timeout;
        let conn = self.checkout(database, deadline, timeout).await?;

        let mut interrupt = InterruptOnDrop::new(conn.get_interrupt_handle());
        debug!("SQL query on {}: {}", database.display(), query);

        let task = tokio::task::spawn_blocking(move || run_query(&conn, &query, &params));

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => {
                interrupt.disarm();
                result
            }
            Ok(Err(join_error)) => {
                interrupt.disarm();
                Err(BackendError::QueryFailed(format!("query task failed: {join_error}")))
            }
            Err(_) => {
                warn!("SQL query on {} exceeded {:?}, interrupting", database.display(), timeout);
                Err(BackendError::Timeout(timeout))
            }
        }
    }
}

/// Interrupts the in-flight statement unless disarmed
struct InterruptOnDrop {
    handle: Option<InterruptHandle>,
}

impl InterruptOnDrop {
    fn new(handle: InterruptHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.interrupt();
        }
    }
}

fn query_failed(err: rusqlite::Error) -> BackendError {
    BackendError::QueryFailed(err.to_string())
}

/// Run one statement and serialize every row as a JSON object
fn run_query(conn: &Connection, query: &str, params: &[String]) -> Result<Vec<u8>, BackendError> {
    let mut stmt = conn.prepare(query).map_err(query_failed)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .map_err(query_failed)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_failed)? {
        let mut object = Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(query_failed)?;
            object.insert(name.clone(), to_json(value));
        }
        out.push(Value::Object(object));
    }

    serde_json::to_vec(&out).map_err(|e| BackendError::QueryFailed(e.to_string()))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE alerts (host TEXT, severity INTEGER, load REAL, raw BLOB);
             INSERT INTO alerts VALUES ('hana01', 2, 0.5, x'0102');
             INSERT INTO alerts VALUES ('hana02', 3, NULL, NULL);
             INSERT INTO alerts VALUES ('hana01', 1, 1.25, NULL);",
        )
        .unwrap();
        (dir, path)
    }

    fn rows(bytes: &[u8]) -> Vec<Value> {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_parameterized_query() {
        let (_dir, path) = fixture();
        let backend = SqlBackend::new(2, 16);
        let out = backend
            .execute(
                &path,
                "SELECT host, severity, load, raw FROM alerts WHERE host = ?1 ORDER BY severity DESC"
                    .into(),
                vec!["hana01".into()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let rows = rows(&out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["severity"], 2);
        assert_eq!(rows[0]["raw"], "AQI=");
        assert_eq!(rows[1]["load"], 1.25);
        assert_eq!(rows[1]["raw"], Value::Null);
    }

    #[tokio::test]
    async fn test_bound_values_are_not_spliced() {
        let (_dir, path) = fixture();
        let backend = SqlBackend::new(1, 16);
        let out = backend
            .execute(
                &path,
                "SELECT host FROM alerts WHERE host = ?1".into(),
                vec!["hana01' OR '1'='1".into()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(rows(&out).is_empty());
    }

    #[tokio::test]
    async fn test_query_error() {
        let (_dir, path) = fixture();
        let backend = SqlBackend::new(1, 16);
        let err = backend
            .execute(&path, "SELECT * FROM missing_table".into(), vec![], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::QueryFailed(_)));
    }

    #[tokio::test]
    async fn test_read_only_connection_rejects_writes() {
        let (_dir, path) = fixture();
        let backend = SqlBackend::new(1, 16);
        let err = backend
            .execute(&path, "DELETE FROM alerts".into(), vec![], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::QueryFailed(_)));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_and_releases_connection() {
        let (_dir, path) = fixture();
        let backend = SqlBackend::new(1, 16);
        // Unbounded recursive CTE never finishes on its own
        let runaway = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                       SELECT count(*) FROM n";

        let start = std::time::Instant::now();
        let err = backend
            .execute(&path, runaway.into(), vec![], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_secs(1));

        // The interrupted connection comes back and serves the next query
        let out = backend
            .execute(&path, "SELECT count(*) AS n FROM alerts".into(), vec![], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(rows(&out)[0]["n"], 3);
    }

    #[tokio::test]
    async fn test_missing_database() {
        let backend = SqlBackend::new(1, 16);
        let err = backend
            .execute(
                Path::new("/nonexistent/mon.db"),
                "SELECT 1".into(),
                vec![],
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_failed_opens_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqlBackend::new(1, 16);
        for i in 0..200 {
            let path = dir.path().join(format!("missing/mon{i}.db"));
            let err = backend
                .execute(&path, "SELECT 1".into(), vec![], Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, BackendError::Unreachable(_)));
        }
        assert_eq!(backend.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_reused_per_database() {
        let (_dir, path) = fixture();
        let backend = SqlBackend::new(1, 16);
        for _ in 0..3 {
            backend
                .execute(&path, "SELECT 1".into(), vec![], Duration::from_secs(5))
                .await
                .unwrap();
        }
        assert_eq!(backend.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_pool_cache_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqlBackend::new(1, 2);
        for i in 0..5 {
            let path = dir.path().join(format!("host{i}.db"));
            Connection::open(&path)
                .unwrap()
                .execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")
                .unwrap();

            let out = backend
                .execute(&path, "SELECT v FROM t".into(), vec![], Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(rows(&out)[0]["v"], 7);
            assert!(backend.pool_count() <= 2);
        }
        assert!(backend.pool_count() >= 1);
    }
}
