/// Metadata tables owned by the engine: table statistics, sample
/// descriptors, sketch blobs, strata records, learning history, and the
/// maintenance claim row. All DDL is idempotent and runs at startup.
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Create every metadata table and index this engine relies on.
pub fn ensure_meta_tables(conn: &Connection) -> rusqlite::Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS aqe_table_stats (
            table_name TEXT PRIMARY KEY,
            row_count INTEGER DEFAULT 0,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        "CREATE TABLE IF NOT EXISTS aqe_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            sample_table TEXT NOT NULL,
            sample_fraction REAL NOT NULL,
            strata_column TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        "CREATE TABLE IF NOT EXISTS aqe_sketches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            column_name TEXT,
            sketch_type TEXT NOT NULL,
            sketch_data BLOB NOT NULL,
            parameters TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(table_name, column_name, sketch_type)
        )",
        "CREATE TABLE IF NOT EXISTS aqe_strata_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sample_table TEXT NOT NULL,
            strata_key TEXT NOT NULL,
            strata_value TEXT NOT NULL,
            pop_size INTEGER NOT NULL,
            sample_size INTEGER NOT NULL,
            fraction REAL NOT NULL,
            weight REAL NOT NULL,
            variance REAL NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        "CREATE TABLE IF NOT EXISTS aqe_query_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query_pattern TEXT NOT NULL,
            table_size INTEGER NOT NULL,
            strategy TEXT NOT NULL,
            actual_speedup REAL NOT NULL,
            actual_error REAL NOT NULL,
            predicted_speedup REAL NOT NULL,
            predicted_error REAL NOT NULL,
            execution_time_ms INTEGER NOT NULL,
            error_tolerance REAL NOT NULL,
            user_satisfaction INTEGER DEFAULT 0,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
            query_features TEXT,
            importance_score REAL DEFAULT 1.0,
            aggregated BOOLEAN DEFAULT FALSE
        )",
        "CREATE TABLE IF NOT EXISTS aqe_history_rollup (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query_pattern TEXT NOT NULL,
            table_size_range TEXT NOT NULL,
            strategy TEXT NOT NULL,
            avg_speedup REAL NOT NULL,
            avg_error REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            last_updated DATETIME DEFAULT CURRENT_TIMESTAMP,
            confidence_level REAL DEFAULT 0.8
        )",
        "CREATE TABLE IF NOT EXISTS aqe_maintenance (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            last_run_at DATETIME
        )",
        "CREATE INDEX IF NOT EXISTS idx_history_pattern
            ON aqe_query_history(query_pattern)",
        "CREATE INDEX IF NOT EXISTS idx_history_table_size
            ON aqe_query_history(table_size)",
        "CREATE INDEX IF NOT EXISTS idx_history_strategy
            ON aqe_query_history(strategy)",
        "CREATE INDEX IF NOT EXISTS idx_history_timestamp
            ON aqe_query_history(timestamp DESC)",
        "CREATE INDEX IF NOT EXISTS idx_history_importance
            ON aqe_query_history(importance_score DESC)",
        "CREATE INDEX IF NOT EXISTS idx_history_aggregated
            ON aqe_query_history(aggregated, timestamp)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_rollup_key
            ON aqe_history_rollup(query_pattern, table_size_range, strategy)",
        "CREATE INDEX IF NOT EXISTS idx_rollup_updated
            ON aqe_history_rollup(last_updated DESC)",
        "INSERT OR IGNORE INTO aqe_maintenance(id, last_run_at) VALUES(1, NULL)",
    ];
    for statement in statements {
        conn.execute(statement, [])?;
    }
    Ok(())
}

/// Set the cached row count for a base table.
pub fn upsert_table_row_count(conn: &Connection, table: &str, count: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO aqe_table_stats(table_name, row_count, updated_at)
         VALUES(?1, ?2, CURRENT_TIMESTAMP)
         ON CONFLICT(table_name) DO UPDATE SET
             row_count = excluded.row_count,
             updated_at = CURRENT_TIMESTAMP",
        params![table, count],
    )?;
    Ok(())
}

/// Cached row count for a base table, if the statistic exists.
pub fn table_row_count(conn: &Connection, table: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT row_count FROM aqe_table_stats WHERE table_name = ?1",
        params![table],
        |row| row.get(0),
    )
    .optional()
}

/// Record a materialized sample.
pub fn insert_sample_meta(
    conn: &Connection,
    table: &str,
    sample_table: &str,
    fraction: f64,
    strata_column: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO aqe_samples(table_name, sample_table, sample_fraction, strata_column, created_at)
         VALUES(?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)",
        params![table, sample_table, fraction, strata_column],
    )?;
    Ok(())
}

/// Smallest materialized sample fraction available for a base table.
pub fn best_sample_fraction(conn: &Connection, table: &str) -> rusqlite::Result<Option<f64>> {
    conn.query_row(
        "SELECT sample_fraction FROM aqe_samples
         WHERE table_name = ?1
         ORDER BY sample_fraction ASC LIMIT 1",
        params![table],
        |row| row.get(0),
    )
    .optional()
}

/// Whether a table with this exact name exists in the catalog.
pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// List user tables, excluding the SQLite internals.
pub fn list_user_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY 1",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Store or replace a sketch blob for `(table, column, kind)`.
pub fn upsert_sketch(
    conn: &Connection,
    table: &str,
    column: &str,
    kind: &str,
    data: &[u8],
    parameters: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO aqe_sketches(table_name, column_name, sketch_type, sketch_data, parameters, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
         ON CONFLICT(table_name, column_name, sketch_type) DO UPDATE SET
             sketch_data = excluded.sketch_data,
             parameters = excluded.parameters,
             created_at = CURRENT_TIMESTAMP",
        params![table, column, kind, data, parameters],
    )?;
    Ok(())
}

/// Fetch a sketch blob and its parameter JSON.
pub fn get_sketch(
    conn: &Connection,
    table: &str,
    column: &str,
    kind: &str,
) -> rusqlite::Result<Option<(Vec<u8>, String)>> {
    conn.query_row(
        "SELECT sketch_data, COALESCE(parameters, '{}')
         FROM aqe_sketches
         WHERE table_name = ?1 AND column_name = ?2 AND sketch_type = ?3",
        params![table, column, kind],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

/// Sketch metadata surfaced by the sketch listing API.
#[derive(Clone, Debug, Serialize)]
pub struct SketchRecord {
    pub table: String,
    pub column: String,
    pub kind: String,
    pub parameters: serde_json::Value,
    pub created_at: i64,
}

/// All sketches registered for a table, newest first.
pub fn list_sketches(conn: &Connection, table: &str) -> rusqlite::Result<Vec<SketchRecord>> {
    let mut stmt = conn.prepare(
        "SELECT column_name, sketch_type, COALESCE(parameters, '{}'),
                CAST(strftime('%s', created_at) AS INTEGER)
         FROM aqe_sketches
         WHERE table_name = ?1
         ORDER BY created_at DESC",
    )?;
    let table_name = table.to_string();
    let rows = stmt.query_map(params![table], move |row| {
        let parameters: String = row.get(2)?;
        Ok(SketchRecord {
            table: table_name.clone(),
            column: row.get(0)?,
            kind: row.get(1)?,
            parameters: serde_json::from_str(&parameters)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            created_at: row.get(3)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_meta_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn test_ensure_meta_tables_idempotent() {
        let conn = test_conn();
        ensure_meta_tables(&conn).unwrap();
        assert!(table_exists(&conn, "aqe_table_stats").unwrap());
        assert!(table_exists(&conn, "aqe_query_history").unwrap());
    }

    #[test]
    fn test_row_count_upsert() {
        let conn = test_conn();
        upsert_table_row_count(&conn, "orders", 100).unwrap();
        upsert_table_row_count(&conn, "orders", 250).unwrap();
        assert_eq!(table_row_count(&conn, "orders").unwrap(), Some(250));
        assert_eq!(table_row_count(&conn, "missing").unwrap(), None);
    }

    #[test]
    fn test_best_sample_fraction_picks_smallest() {
        let conn = test_conn();
        insert_sample_meta(&conn, "orders", "orders__sample_0_05", 0.05, None).unwrap();
        insert_sample_meta(&conn, "orders", "orders__sample_0_01", 0.01, None).unwrap();
        assert_eq!(best_sample_fraction(&conn, "orders").unwrap(), Some(0.01));
    }

    #[test]
    fn test_sketch_upsert_replaces() {
        let conn = test_conn();
        upsert_sketch(&conn, "orders", "country", "hyperloglog", &[1, 2], "{\"b\":12}").unwrap();
        upsert_sketch(&conn, "orders", "country", "hyperloglog", &[3, 4], "{\"b\":10}").unwrap();
        let (data, parameters) = get_sketch(&conn, "orders", "country", "hyperloglog")
            .unwrap()
            .unwrap();
        assert_eq!(data, vec![3, 4]);
        assert_eq!(parameters, "{\"b\":10}");
        assert_eq!(list_sketches(&conn, "orders").unwrap().len(), 1);
    }
}
