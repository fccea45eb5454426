/// Performance-history store
///
/// Every optimized execution appends (predicted vs observed) performance,
/// subsampled to keep volume down. The selector reads recent records
/// matching a query's shape, supplemented from the rollup table when
/// recent data is thin.
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::AqeResult;
use crate::query::plan::{QueryOptimization, Strategy};
use crate::query::QueryFeatures;
use crate::storage::db::{Db, HISTORY_LOOKUP_DEADLINE, HISTORY_WRITE_DEADLINE};

/// One persisted execution outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub id: i64,
    pub query_pattern: String,
    pub table_size: i64,
    pub strategy: Strategy,
    pub actual_speedup: f64,
    pub actual_error: f64,
    pub predicted_speedup: f64,
    pub predicted_error: f64,
    pub execution_time_ms: i64,
    pub error_tolerance: f64,
    pub user_satisfaction: i64,
}

/// Canonicalize a query into its learning key: integer literals and
/// quoted strings collapse to a placeholder.
pub fn normalize_pattern(sql: &str) -> String {
    static INT_RE: OnceLock<Regex> = OnceLock::new();
    static SINGLE_RE: OnceLock<Regex> = OnceLock::new();
    static DOUBLE_RE: OnceLock<Regex> = OnceLock::new();

    let ints = INT_RE.get_or_init(|| Regex::new(r"\b\d+\b").expect("static regex"));
    let singles = SINGLE_RE.get_or_init(|| Regex::new(r"'[^']*'").expect("static regex"));
    let doubles = DOUBLE_RE.get_or_init(|| Regex::new(r#""[^"]*""#).expect("static regex"));

    let pattern = ints.replace_all(sql, "?");
    let pattern = singles.replace_all(&pattern, "?");
    doubles.replace_all(&pattern, "?").into_owned()
}

/// Rollup size bucket for a table size.
pub fn size_bucket(table_size: i64) -> &'static str {
    match table_size {
        s if s < 1_000 => "small",
        s if s < 100_000 => "medium",
        s if s < 1_000_000 => "large",
        _ => "xlarge",
    }
}

/// Representative table size for a bucket, used when a rollup row stands
/// in for detailed records.
fn bucket_midpoint(bucket: &str) -> i64 {
    match bucket {
        "small" => 500,
        "medium" => 50_000,
        "large" => 500_000,
        _ => 5_000_000,
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Handle over the history and rollup tables.
#[derive(Clone)]
pub struct HistoryStore {
    db: Db,
}

impl HistoryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append one execution outcome, subsampled.
    ///
    /// Large prediction misses (speedup off by > 0.5 or error by > 0.1)
    /// are always written; the rest pass a 1-in-5 clock-derived filter.
    /// NaN/Inf predictions are coerced before the write. Returns whether
    /// a row was written. Roughly every 100th write also schedules a
    /// maintenance pass on a detached task.
    pub async fn record(
        &self,
        optimization: &QueryOptimization,
        features: &QueryFeatures,
        elapsed_ms: f64,
        actual_error: f64,
        baseline_ms: f64,
    ) -> AqeResult<bool> {
        let actual_speedup = if elapsed_ms > 0.0 {
            (baseline_ms / elapsed_ms).max(0.1)
        } else {
            0.1
        };

        let speedup_deviation = (actual_speedup - optimization.estimated_speedup).abs();
        let error_deviation = (actual_error - optimization.estimated_error).abs();
        let now = now_unix_secs();
        let should_record =
            speedup_deviation > 0.5 || error_deviation > 0.1 || now % 5 == 0;
        if !should_record {
            return Ok(false);
        }

        let mut predicted_speedup = optimization.estimated_speedup;
        if !predicted_speedup.is_finite() || predicted_speedup <= 0.0 {
            predicted_speedup = 1.0;
        }
        let mut predicted_error = optimization.estimated_error;
        if !predicted_error.is_finite() || predicted_error < 0.0 {
            predicted_error = 0.0;
        }

        let pattern = normalize_pattern(&optimization.original_sql);
        let strategy = optimization.strategy.as_str();
        let features_json = serde_json::to_string(features).unwrap_or_default();
        let table_size = features.table_size;
        let error_tolerance = features.error_tolerance;
        let execution_ms = elapsed_ms as i64;

        self.db
            .call(HISTORY_WRITE_DEADLINE, "history append", move |conn| {
                conn.execute(
                    "INSERT INTO aqe_query_history
                         (query_pattern, table_size, strategy, actual_speedup, actual_error,
                          predicted_speedup, predicted_error, execution_time_ms,
                          error_tolerance, user_satisfaction, query_features)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
                    params![
                        pattern,
                        table_size,
                        strategy,
                        actual_speedup,
                        actual_error,
                        predicted_speedup,
                        predicted_error,
                        execution_ms,
                        error_tolerance,
                        features_json,
                    ],
                )?;
                Ok(())
            })
            .await?;

        if now % 100 == 0 {
            let db = self.db.clone();
            tokio::spawn(async move {
                if let Err(err) = crate::learning::maintenance::run_maintenance(&db).await {
                    tracing::warn!(error = %err, "history maintenance failed");
                }
            });
        }

        Ok(true)
    }

    /// Recent records matching the query's shape: within +/-50% of the
    /// table size and error tolerance, last 7 days, not yet aggregated,
    /// most important first. Fewer than 10 hits are supplemented from the
    /// rollup table.
    pub async fn matching_history(
        &self,
        features: &QueryFeatures,
    ) -> AqeResult<Vec<PerformanceRecord>> {
        let table_size = features.table_size;
        let size_margin = table_size as f64 * 0.5;
        let tolerance = features.error_tolerance;
        let tolerance_margin = tolerance * 0.5;
        let bucket = size_bucket(table_size).to_string();

        self.db
            .call(HISTORY_LOOKUP_DEADLINE, "history lookup", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, query_pattern, table_size, strategy, actual_speedup,
                            actual_error, predicted_speedup, predicted_error,
                            execution_time_ms, error_tolerance, user_satisfaction
                     FROM aqe_query_history
                     WHERE table_size BETWEEN ?1 AND ?2
                       AND error_tolerance BETWEEN ?3 AND ?4
                       AND timestamp > datetime('now', '-7 days')
                       AND aggregated = 0
                     ORDER BY importance_score DESC, timestamp DESC
                     LIMIT 20",
                )?;
                let mut records: Vec<PerformanceRecord> = stmt
                    .query_map(
                        params![
                            (table_size as f64 - size_margin) as i64,
                            (table_size as f64 + size_margin) as i64,
                            tolerance - tolerance_margin,
                            tolerance + tolerance_margin,
                        ],
                        |row| {
                            let strategy: String = row.get(3)?;
                            Ok(PerformanceRecord {
                                id: row.get(0)?,
                                query_pattern: row.get(1)?,
                                table_size: row.get(2)?,
                                strategy: Strategy::parse(&strategy).unwrap_or(Strategy::Exact),
                                actual_speedup: row.get(4)?,
                                actual_error: row.get(5)?,
                                predicted_speedup: row.get(6)?,
                                predicted_error: row.get(7)?,
                                execution_time_ms: row.get(8)?,
                                error_tolerance: row.get(9)?,
                                user_satisfaction: row.get(10)?,
                            })
                        },
                    )?
                    .filter_map(Result::ok)
                    .collect();

                if records.len() < 10 {
                    let mut stmt = conn.prepare(
                        "SELECT query_pattern, strategy, avg_speedup, avg_error
                         FROM aqe_history_rollup
                         WHERE table_size_range = ?1 AND confidence_level >= 0.7
                         ORDER BY sample_count DESC, last_updated DESC
                         LIMIT ?2",
                    )?;
                    let midpoint = bucket_midpoint(&bucket);
                    let supplements = stmt
                        .query_map(params![bucket, 10 - records.len() as i64], move |row| {
                            let strategy: String = row.get(1)?;
                            let avg_speedup: f64 = row.get(2)?;
                            let avg_error: f64 = row.get(3)?;
                            Ok(PerformanceRecord {
                                id: 0,
                                query_pattern: row.get(0)?,
                                table_size: midpoint,
                                strategy: Strategy::parse(&strategy).unwrap_or(Strategy::Exact),
                                actual_speedup: avg_speedup,
                                actual_error: avg_error,
                                // Rollups carry no per-run predictions;
                                // the averages stand in for them.
                                predicted_speedup: avg_speedup,
                                predicted_error: avg_error,
                                execution_time_ms: 0,
                                error_tolerance: tolerance,
                                user_satisfaction: 0,
                            })
                        })?
                        .filter_map(Result::ok);
                    records.extend(supplements);
                }

                Ok(records)
            })
            .await
    }

    /// Last-30-day per-strategy aggregates plus the total record count,
    /// served by the learning-stats endpoint.
    pub async fn learning_stats(&self) -> AqeResult<serde_json::Value> {
        self.db
            .call(HISTORY_LOOKUP_DEADLINE, "learning stats", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT strategy,
                            COUNT(*),
                            AVG(actual_speedup),
                            AVG(actual_error),
                            AVG(ABS(actual_speedup - predicted_speedup)
                                / MAX(predicted_speedup, 0.01)),
                            AVG(ABS(actual_error - predicted_error)
                                / MAX(predicted_error, 0.01))
                     FROM aqe_query_history
                     WHERE timestamp > datetime('now', '-30 days')
                     GROUP BY strategy",
                )?;
                let mut strategies = serde_json::Map::new();
                let rows = stmt.query_map([], |row| {
                    let strategy: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    let avg_speedup: f64 = row.get(2)?;
                    let avg_error: f64 = row.get(3)?;
                    let speedup_miss: f64 = row.get(4)?;
                    let error_miss: f64 = row.get(5)?;
                    Ok((strategy, count, avg_speedup, avg_error, speedup_miss, error_miss))
                })?;
                for row in rows {
                    let (strategy, count, avg_speedup, avg_error, speedup_miss, error_miss) = row?;
                    strategies.insert(
                        strategy,
                        serde_json::json!({
                            "query_count": count,
                            "avg_speedup": avg_speedup,
                            "avg_error": avg_error,
                            "speedup_prediction_accuracy": 1.0 - speedup_miss,
                            "error_prediction_accuracy": 1.0 - error_miss,
                        }),
                    );
                }

                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM aqe_query_history",
                    [],
                    |row| row.get(0),
                )?;

                Ok(serde_json::json!({
                    "strategies": strategies,
                    "total_historical_queries": total,
                    "learning_enabled": true,
                }))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pattern_replaces_literals() {
        assert_eq!(
            normalize_pattern("SELECT * FROM t WHERE a = 42 AND b = 'x' AND c = \"y\""),
            "SELECT * FROM t WHERE a = ? AND b = ? AND c = ?"
        );
    }

    #[test]
    fn test_normalize_pattern_keeps_identifiers() {
        assert_eq!(
            normalize_pattern("SELECT col2tag FROM table3x WHERE n = 10"),
            "SELECT col2tag FROM table3x WHERE n = ?"
        );
    }

    #[test]
    fn test_size_buckets() {
        assert_eq!(size_bucket(999), "small");
        assert_eq!(size_bucket(1_000), "medium");
        assert_eq!(size_bucket(99_999), "medium");
        assert_eq!(size_bucket(100_000), "large");
        assert_eq!(size_bucket(1_000_000), "xlarge");
    }
}
