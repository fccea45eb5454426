/// Background maintenance of the learning history
///
/// Aggregates detailed records older than 30 days into the rollup table,
/// hard-deletes aggregated records older than 90 days, and keeps only the
/// top 10,000 most important records from the last week. A claim row
/// serializes passes so two compactions never run concurrently. Failures
/// are logged and never propagate to the request path.
use rusqlite::Connection;
use serde::Serialize;

use crate::error::AqeResult;
use crate::storage::db::{Db, MAINTENANCE_DEADLINE};

/// Records younger than this many days stay detailed.
const AGGREGATE_AFTER_DAYS: u32 = 30;
/// Aggregated records older than this many days are deleted.
const DELETE_AFTER_DAYS: u32 = 90;
/// Last-week retention cap, ranked by importance.
const RECENT_KEEP_LIMIT: i64 = 10_000;

/// What a maintenance pass did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MaintenanceReport {
    /// True when another pass held the claim and this one did nothing.
    pub skipped: bool,
    pub aggregated_rows: usize,
    pub deleted_rows: usize,
    pub trimmed_rows: usize,
}

/// Run one maintenance pass under its own deadline.
pub async fn run_maintenance(db: &Db) -> AqeResult<MaintenanceReport> {
    let report = db
        .call(MAINTENANCE_DEADLINE, "history maintenance", |conn| {
            if !claim_maintenance(conn)? {
                return Ok(MaintenanceReport {
                    skipped: true,
                    ..Default::default()
                });
            }

            let mut report = MaintenanceReport::default();
            // Steps are independent; one failing is logged and the rest
            // still run.
            match aggregate_old_records(conn) {
                Ok(rows) => report.aggregated_rows = rows,
                Err(err) => tracing::warn!(error = %err, "history aggregation failed"),
            }
            match delete_expired_records(conn) {
                Ok(rows) => report.deleted_rows = rows,
                Err(err) => tracing::warn!(error = %err, "history cleanup failed"),
            }
            match trim_to_important_records(conn) {
                Ok(rows) => report.trimmed_rows = rows,
                Err(err) => tracing::warn!(error = %err, "history trim failed"),
            }
            Ok(report)
        })
        .await?;

    if !report.skipped {
        tracing::info!(
            aggregated = report.aggregated_rows,
            deleted = report.deleted_rows,
            trimmed = report.trimmed_rows,
            "history maintenance pass complete"
        );
    }
    Ok(report)
}

/// Take the claim row. Passes are spaced at least 60 seconds apart; a
/// concurrent or too-recent pass leaves zero rows updated.
fn claim_maintenance(conn: &Connection) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE aqe_maintenance
         SET last_run_at = datetime('now')
         WHERE id = 1
           AND (last_run_at IS NULL OR last_run_at < datetime('now', '-60 seconds'))",
        [],
    )?;
    Ok(updated > 0)
}

/// Fold old detailed records into the rollup table (needs at least 3
/// samples per key) and mark them aggregated.
fn aggregate_old_records(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO aqe_history_rollup
                 (query_pattern, table_size_range, strategy, avg_speedup, avg_error,
                  sample_count, last_updated, confidence_level)
             SELECT query_pattern,
                    CASE
                        WHEN table_size < 1000 THEN 'small'
                        WHEN table_size < 100000 THEN 'medium'
                        WHEN table_size < 1000000 THEN 'large'
                        ELSE 'xlarge'
                    END AS table_size_range,
                    strategy,
                    AVG(actual_speedup),
                    AVG(actual_error),
                    COUNT(*),
                    datetime('now'),
                    CASE
                        WHEN COUNT(*) >= 10 THEN 0.9
                        WHEN COUNT(*) >= 5 THEN 0.7
                        ELSE 0.5
                    END
             FROM aqe_query_history
             WHERE timestamp < datetime('now', '-{AGGREGATE_AFTER_DAYS} days')
               AND aggregated = 0
             GROUP BY query_pattern, table_size_range, strategy
             HAVING COUNT(*) >= 3
             ON CONFLICT(query_pattern, table_size_range, strategy) DO UPDATE SET
                 avg_speedup = excluded.avg_speedup,
                 avg_error = excluded.avg_error,
                 sample_count = excluded.sample_count,
                 last_updated = excluded.last_updated,
                 confidence_level = excluded.confidence_level"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "UPDATE aqe_query_history
             SET aggregated = 1
             WHERE timestamp < datetime('now', '-{AGGREGATE_AFTER_DAYS} days')
               AND aggregated = 0"
        ),
        [],
    )
}

/// Delete aggregated records past the hard retention horizon.
fn delete_expired_records(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "DELETE FROM aqe_query_history
             WHERE timestamp < datetime('now', '-{DELETE_AFTER_DAYS} days')
               AND aggregated = 1"
        ),
        [],
    )
}

/// Recompute last-week importance and keep only the top-ranked records.
///
/// Importance = 2 * |actual - predicted speedup| + 1 / (1 + age in days)
/// + satisfaction / 5.
fn trim_to_important_records(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE aqe_query_history
         SET importance_score =
             (ABS(actual_speedup - predicted_speedup) * 2)
             + (1.0 / (1 + (julianday('now') - julianday(timestamp))))
             + (CASE WHEN user_satisfaction > 0
                     THEN user_satisfaction / 5.0 ELSE 0 END)
         WHERE aggregated = 0
           AND timestamp > datetime('now', '-7 days')",
        [],
    )?;

    conn.execute(
        &format!(
            "DELETE FROM aqe_query_history
             WHERE id NOT IN (
                 SELECT id FROM aqe_query_history
                 WHERE aggregated = 0
                   AND timestamp > datetime('now', '-7 days')
                 ORDER BY importance_score DESC, timestamp DESC
                 LIMIT {RECENT_KEEP_LIMIT}
             )
             AND aggregated = 0
             AND timestamp > datetime('now', '-7 days')"
        ),
        [],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::meta;

    async fn history_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.call(MAINTENANCE_DEADLINE, "seed", |conn| {
            meta::ensure_meta_tables(conn)
        })
        .await
        .unwrap();
        db
    }

    fn insert_record(conn: &Connection, pattern: &str, age_days: i64, aggregated: bool) {
        conn.execute(
            "INSERT INTO aqe_query_history
                 (query_pattern, table_size, strategy, actual_speedup, actual_error,
                  predicted_speedup, predicted_error, execution_time_ms,
                  error_tolerance, timestamp, aggregated)
             VALUES (?1, 20000, 'sample', 5.0, 0.02, 10.0, 0.03, 12, 0.05,
                     datetime('now', ?2), ?3)",
            rusqlite::params![pattern, format!("-{age_days} days"), aggregated],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_old_records_are_aggregated_and_marked() {
        let db = history_db().await;
        db.call(MAINTENANCE_DEADLINE, "seed rows", |conn| {
            for _ in 0..4 {
                insert_record(conn, "SELECT COUNT(*) FROM t WHERE x = ?", 40, false);
            }
            Ok(())
        })
        .await
        .unwrap();

        let report = run_maintenance(&db).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.aggregated_rows, 4);

        let (rollups, confidence, unaggregated): (i64, f64, i64) = db
            .call(MAINTENANCE_DEADLINE, "check", |conn| {
                let rollups = conn.query_row(
                    "SELECT COUNT(*) FROM aqe_history_rollup",
                    [],
                    |r| r.get(0),
                )?;
                let confidence = conn.query_row(
                    "SELECT confidence_level FROM aqe_history_rollup LIMIT 1",
                    [],
                    |r| r.get(0),
                )?;
                let unaggregated = conn.query_row(
                    "SELECT COUNT(*) FROM aqe_query_history WHERE aggregated = 0",
                    [],
                    |r| r.get(0),
                )?;
                Ok((rollups, confidence, unaggregated))
            })
            .await
            .unwrap();
        assert_eq!(rollups, 1);
        // 4 samples: below the 5-sample threshold, confidence 0.5.
        assert_eq!(confidence, 0.5);
        assert_eq!(unaggregated, 0);
    }

    #[tokio::test]
    async fn test_expired_aggregated_records_are_deleted() {
        let db = history_db().await;
        db.call(MAINTENANCE_DEADLINE, "seed rows", |conn| {
            insert_record(conn, "old", 120, true);
            insert_record(conn, "recent", 2, false);
            Ok(())
        })
        .await
        .unwrap();

        let report = run_maintenance(&db).await.unwrap();
        assert_eq!(report.deleted_rows, 1);

        let remaining: i64 = db
            .call(MAINTENANCE_DEADLINE, "check", |conn| {
                conn.query_row("SELECT COUNT(*) FROM aqe_query_history", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_skipped_by_claim() {
        let db = history_db().await;
        let first = run_maintenance(&db).await.unwrap();
        assert!(!first.skipped);
        let second = run_maintenance(&db).await.unwrap();
        assert!(second.skipped);
    }

    #[tokio::test]
    async fn test_importance_recomputed_for_recent_records() {
        let db = history_db().await;
        db.call(MAINTENANCE_DEADLINE, "seed rows", |conn| {
            insert_record(conn, "recent", 1, false);
            Ok(())
        })
        .await
        .unwrap();

        run_maintenance(&db).await.unwrap();

        let importance: f64 = db
            .call(MAINTENANCE_DEADLINE, "check", |conn| {
                conn.query_row(
                    "SELECT importance_score FROM aqe_query_history",
                    [],
                    |r| r.get(0),
                )
            })
            .await
            .unwrap();
        // 2 * |5 - 10| = 10 plus a recency term.
        assert!(importance > 10.0 && importance < 11.5, "importance {importance}");
    }
}
