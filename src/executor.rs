/// Plan execution with aggregate scaling and confidence intervals
///
/// Streams the plan's SQL into JSON row maps. Sample plans additionally
/// accumulate per-column numeric vectors, scale the aggregate columns by
/// the inverse sample fraction, and attach bootstrap intervals per
/// numeric column.
use std::collections::HashMap;

use rusqlite::types::ValueRef;
use serde_json::{Map, Value};

use crate::error::AqeResult;
use crate::estimator;
use crate::query::plan::{Plan, PlanKind};
use crate::storage::db::{Db, QUERY_DEADLINE};

/// One result row as returned to the client.
pub type Row = Map<String, Value>;

/// Bootstrap iterations per numeric column.
const BOOTSTRAP_ITERATIONS: usize = 300;
/// Confidence level for attached intervals.
const BOOTSTRAP_CONFIDENCE: f64 = 0.95;

/// Execute a plan and return the result rows plus a metadata envelope.
pub async fn execute(db: &Db, plan: &Plan) -> AqeResult<(Vec<Row>, Row)> {
    let sql = plan.sql.clone();
    let capture_samples = plan.kind == PlanKind::Sample;

    let (mut rows, sample_vectors) = db
        .call(QUERY_DEADLINE, "query execution", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();

            let mut rows: Vec<Row> = Vec::new();
            let mut sample_vectors: HashMap<String, Vec<f64>> = HashMap::new();

            let mut raw = stmt.query([])?;
            while let Some(raw_row) = raw.next()? {
                let mut row = Row::new();
                for (index, column) in columns.iter().enumerate() {
                    let value = raw_row.get_ref(index)?;
                    if capture_samples {
                        if let Some(number) = value_to_f64(value) {
                            sample_vectors
                                .entry(column.clone())
                                .or_default()
                                .push(number);
                        }
                    }
                    row.insert(column.clone(), value_to_json(value));
                }
                rows.push(row);
            }
            Ok((rows, sample_vectors))
        })
        .await?;

    let mut meta = Row::new();
    meta.insert("plan_type".to_string(), json_kind(plan.kind));
    meta.insert("reason".to_string(), Value::String(plan.reason.clone()));
    meta.insert("rows".to_string(), Value::from(rows.len()));
    meta.insert("sql_executed".to_string(), Value::String(plan.sql.clone()));

    if plan.kind == PlanKind::Sample {
        if let Some(fraction) = plan.sample_fraction {
            meta.insert("sample_fraction".to_string(), Value::from(fraction));
            if let Some(sample_table) = &plan.sample_table {
                meta.insert(
                    "sample_table".to_string(),
                    Value::String(sample_table.clone()),
                );
            }
            if !rows.is_empty() && fraction > 0.0 {
                scale_sample_results(&mut rows, fraction);
                attach_bootstrap_intervals(&mut rows, &sample_vectors, fraction, None);
            }
        }
    }

    Ok((rows, meta))
}

fn json_kind(kind: PlanKind) -> Value {
    serde_json::to_value(kind).unwrap_or(Value::Null)
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn value_to_f64(value: ValueRef<'_>) -> Option<f64> {
    match value {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.parse().ok(),
        _ => None,
    }
}

fn json_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Whether a result column holds an extensive aggregate that must scale
/// with the sample fraction.
///
/// Substring matching on the column name is a known weakness of this
/// surface: a proper fix parses the SELECT list and scales by aggregate
/// kind. It matches the behavior clients already depend on, so it stays
/// until the SELECT-list parser lands.
fn needs_scaling(column: &str) -> bool {
    let upper = column.to_ascii_uppercase();
    ["COUNT", "SUM", "TOTAL", "REVENUE", "ORDERS"]
        .iter()
        .any(|marker| upper.contains(marker))
}

/// Multiply extensive aggregate columns by `1/fraction`. AVG columns are
/// intensive and stay unscaled.
pub fn scale_sample_results(rows: &mut [Row], fraction: f64) {
    if fraction <= 0.0 {
        return;
    }
    let scale = 1.0 / fraction;
    for row in rows.iter_mut() {
        for (column, value) in row.iter_mut() {
            if !needs_scaling(column) {
                continue;
            }
            if let Some(number) = json_to_f64(value) {
                *value = Value::from(number * scale);
            }
        }
    }
}

/// Attach `<col>_ci_low`, `<col>_ci_high`, and `<col>_rel_error` for each
/// numeric column with captured sample values. SUM-like columns bootstrap
/// the scaled sum, everything else the mean.
pub fn attach_bootstrap_intervals(
    rows: &mut [Row],
    sample_vectors: &HashMap<String, Vec<f64>>,
    fraction: f64,
    seed: Option<u64>,
) {
    if fraction <= 0.0 {
        return;
    }
    let scale = 1.0 / fraction;

    for (column, values) in sample_vectors {
        if values.is_empty() {
            continue;
        }

        let upper = column.to_ascii_uppercase();
        let sums = upper.contains("SUM") || upper.contains("TOTAL") || upper.contains("REVENUE");
        let ci = if sums {
            estimator::bootstrap_ci(
                values,
                estimator::sum,
                scale,
                BOOTSTRAP_ITERATIONS,
                BOOTSTRAP_CONFIDENCE,
                seed,
            )
        } else {
            estimator::bootstrap_ci(
                values,
                estimator::mean,
                scale,
                BOOTSTRAP_ITERATIONS,
                BOOTSTRAP_CONFIDENCE,
                seed,
            )
        };

        for row in rows.iter_mut() {
            if !row.contains_key(column) {
                continue;
            }
            row.insert(format!("{column}_ci_low"), Value::from(ci.ci_low));
            row.insert(format!("{column}_ci_high"), Value::from(ci.ci_high));
            row.insert(format!("{column}_rel_error"), Value::from(ci.relative_error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::meta;

    async fn seeded_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.call(QUERY_DEADLINE, "seed", |conn| {
            meta::ensure_meta_tables(conn)?;
            conn.execute(
                "CREATE TABLE purchases (id INTEGER, country TEXT, amount REAL)",
                [],
            )?;
            conn.execute(
                "WITH RECURSIVE seq(x) AS (
                     SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < 1000
                 )
                 INSERT INTO purchases SELECT x, 'c' || (x % 4), (x % 20) * 1.0 FROM seq",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[test]
    fn test_scaling_heuristic_targets_extensive_columns() {
        assert!(needs_scaling("COUNT(*)"));
        assert!(needs_scaling("sum_amount"));
        assert!(needs_scaling("total_revenue"));
        assert!(needs_scaling("orders"));
        assert!(!needs_scaling("avg_amount"));
        assert!(!needs_scaling("country"));
    }

    #[test]
    fn test_scale_sample_results() {
        let mut rows = vec![{
            let mut row = Row::new();
            row.insert("sum_amount".to_string(), Value::from(50.0));
            row.insert("avg_amount".to_string(), Value::from(10.0));
            row.insert("country".to_string(), Value::String("US".to_string()));
            row
        }];
        scale_sample_results(&mut rows, 0.05);
        assert_eq!(rows[0]["sum_amount"], Value::from(1000.0));
        assert_eq!(rows[0]["avg_amount"], Value::from(10.0));
        assert_eq!(rows[0]["country"], Value::String("US".to_string()));
    }

    #[tokio::test]
    async fn test_exact_plan_has_no_ci_columns() {
        let db = seeded_db().await;
        let plan = Plan::exact("SELECT COUNT(*) AS n FROM purchases", Some("purchases"), "exact");
        let (rows, meta) = execute(&db, &plan).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], Value::from(1000));
        assert!(!rows[0].contains_key("n_ci_low"));
        assert_eq!(meta["plan_type"], Value::String("exact".to_string()));
    }

    #[tokio::test]
    async fn test_sample_plan_scales_and_attaches_intervals() {
        let db = seeded_db().await;
        // Frame the base table as a 10% sample so scaling is exercised
        // deterministically.
        let plan = Plan {
            kind: PlanKind::Sample,
            sql: "SELECT country, SUM(amount) AS sum_amount FROM purchases GROUP BY country"
                .to_string(),
            original_sql: String::new(),
            table: Some("purchases".to_string()),
            sample_table: Some("purchases".to_string()),
            sample_fraction: Some(0.1),
            sketch_kind: None,
            sketch_column: None,
            estimated_cost: 0.0,
            estimated_error: 0.0,
            reason: "test".to_string(),
        };
        let (rows, meta) = execute(&db, &plan).await.unwrap();
        assert_eq!(rows.len(), 4);

        // Each group's sum is multiplied by 1/f = 10.
        let group_sum: f64 = db
            .call(QUERY_DEADLINE, "expected", |conn| {
                conn.query_row(
                    "SELECT SUM(amount) FROM purchases WHERE country = 'c0'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        let scaled = rows
            .iter()
            .find(|row| row["country"] == Value::String("c0".to_string()))
            .and_then(|row| json_to_f64(&row["sum_amount"]))
            .unwrap();
        assert!((scaled - group_sum * 10.0).abs() < 1e-6);

        for row in &rows {
            assert!(row.contains_key("sum_amount_ci_low"));
            assert!(row.contains_key("sum_amount_ci_high"));
            assert!(row.contains_key("sum_amount_rel_error"));
        }
        assert_eq!(meta["sample_fraction"], Value::from(0.1));
    }

    #[tokio::test]
    async fn test_sql_failure_surfaces() {
        let db = seeded_db().await;
        let plan = Plan::exact("SELECT * FROM missing", None, "exact");
        assert!(execute(&db, &plan).await.is_err());
    }
}
