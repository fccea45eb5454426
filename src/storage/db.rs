/// Async handle over the backing SQLite store
///
/// Every SQL touch goes through [`Db::call`]: the closure runs on a blocking
/// worker under a per-call deadline, so request handlers suspend at I/O
/// boundaries and never hold the connection across await points.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::task;
use tokio::time::timeout;

use crate::error::{AqeError, AqeResult};

/// Deadline for a user query execution.
pub const QUERY_DEADLINE: Duration = Duration::from_secs(120);
/// Deadline for materializing a uniform sample.
pub const SAMPLE_BUILD_DEADLINE: Duration = Duration::from_secs(300);
/// Deadline for materializing a stratified sample.
pub const STRATIFIED_BUILD_DEADLINE: Duration = Duration::from_secs(600);
/// Deadline for building a sketch from a base table.
pub const SKETCH_BUILD_DEADLINE: Duration = Duration::from_secs(600);
/// Deadline for a learning-history lookup.
pub const HISTORY_LOOKUP_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for a learning-history write.
pub const HISTORY_WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for the table-size probe during feature extraction.
pub const SIZE_PROBE_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for a background maintenance pass.
pub const MAINTENANCE_DEADLINE: Duration = Duration::from_secs(30);

/// Shared handle to the backing store.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> AqeResult<Self> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> AqeResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    /// Run `op` against the connection on a blocking worker, failing with
    /// [`AqeError::Timeout`] once `deadline` elapses.
    ///
    /// The deadline bounds how long the caller waits; a statement already
    /// running on the worker is left to finish on its own. Single-statement
    /// writes mean a timed-out call never commits partial results.
    pub async fn call<T, F>(&self, deadline: Duration, operation: &str, op: F) -> AqeResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let handle = task::spawn_blocking(move || {
            let guard = conn.lock();
            op(&guard)
        });

        match timeout(deadline, handle).await {
            Err(_) => Err(AqeError::timeout(operation)),
            Ok(Err(join_err)) => Err(AqeError::internal(format!(
                "database worker failed during {operation}: {join_err}"
            ))),
            Ok(Ok(result)) => result.map_err(AqeError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let value: i64 = db
            .call(Duration::from_secs(1), "probe", |conn| {
                conn.query_row("SELECT 41 + 1", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_sql_error_maps_to_sql_variant() {
        let db = Db::open_in_memory().unwrap();
        let err = db
            .call(Duration::from_secs(1), "bad", |conn| {
                conn.query_row("SELECT * FROM missing_table", [], |row| row.get::<_, i64>(0))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AqeError::Sql { .. }));
    }
}
