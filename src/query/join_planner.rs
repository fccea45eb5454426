/// JOIN-specialized strategy selection
///
/// When a query contains a JOIN, this path preempts scalar selection. The
/// decision table keys on the two table sizes, the join type, and an
/// estimated selectivity; the rewrites wrap one or both tables in
/// `ORDER BY random() LIMIT k` subqueries. Speedup and error estimates
/// are constants per strategy.
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AqeResult;
use crate::query::features::clause_text;
use crate::query::plan::Strategy;
use crate::query::rewrite::{replace_table_ref, sample_subquery};
use crate::storage::db::{Db, SIZE_PROBE_DEADLINE};

/// Outcome of analyzing a JOIN query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinAnalysis {
    pub join_type: String,
    pub left_table: String,
    pub right_table: String,
    pub join_condition: String,
    pub left_table_size: i64,
    pub right_table_size: i64,
    pub selectivity: f64,
    pub strategy: Strategy,
    pub optimized_sql: String,
    pub reasoning: String,
    pub estimated_speedup: f64,
    pub estimated_error: f64,
}

struct JoinInfo {
    join_type: String,
    left_table: String,
    right_table: String,
    condition: String,
}

fn join_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\bFROM\s+([A-Za-z_][A-Za-z0-9_]*)\s+((?:INNER\s+|LEFT\s+|RIGHT\s+|FULL\s+)?JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("static regex")
    })
}

/// Whether the query contains a JOIN at all.
pub fn contains_join(sql: &str) -> bool {
    sql.to_ascii_uppercase().contains(" JOIN ")
}

fn extract_join_info(sql: &str) -> Option<JoinInfo> {
    let captures = join_regex().captures(sql)?;
    let condition = clause_text(sql, "ON", &["WHERE", "GROUP", "ORDER", "LIMIT"])
        .unwrap_or("")
        .to_string();
    Some(JoinInfo {
        left_table: captures[1].to_string(),
        join_type: captures[2].trim().to_ascii_uppercase(),
        right_table: captures[3].to_string(),
        condition,
    })
}

/// Analyze a JOIN query and pick a specialized strategy. Returns `None`
/// for non-JOIN queries or JOIN shapes the extractor cannot read.
pub async fn analyze_join_query(db: &Db, sql: &str) -> AqeResult<Option<JoinAnalysis>> {
    if !contains_join(sql) {
        return Ok(None);
    }
    let info = match extract_join_info(sql) {
        Some(info) => info,
        None => return Ok(None),
    };

    let left_size = table_size_or_default(db, &info.left_table).await;
    let right_size = table_size_or_default(db, &info.right_table).await;

    let selectivity = estimate_join_selectivity(&info.join_type, left_size, right_size);
    let strategy = choose_join_strategy(
        &info.join_type,
        left_size,
        right_size,
        selectivity,
        &info.condition,
    );

    let optimized_sql = optimized_join_sql(sql, &info, left_size, right_size, strategy);
    let estimated_speedup = join_speedup(strategy);
    let estimated_error = join_error(strategy);

    let mut analysis = JoinAnalysis {
        join_type: info.join_type,
        left_table: info.left_table,
        right_table: info.right_table,
        join_condition: info.condition,
        left_table_size: left_size,
        right_table_size: right_size,
        selectivity,
        strategy,
        optimized_sql,
        reasoning: String::new(),
        estimated_speedup,
        estimated_error,
    };
    analysis.reasoning = join_reasoning(&analysis);
    Ok(Some(analysis))
}

async fn table_size_or_default(db: &Db, table: &str) -> i64 {
    let name = table.to_string();
    db.call(SIZE_PROBE_DEADLINE, "join size probe", move |conn| {
        conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| row.get(0))
    })
    .await
    .unwrap_or(1000)
}

/// Heuristic result-size selectivity by join type. Column statistics
/// would do better; this only has to separate sparse inner joins from the
/// rest.
fn estimate_join_selectivity(join_type: &str, left_size: i64, right_size: i64) -> f64 {
    let product = (left_size.max(1) as f64) * (right_size.max(1) as f64);
    match join_type {
        "LEFT JOIN" => left_size.max(1) as f64 / product,
        "RIGHT JOIN" => right_size.max(1) as f64 / product,
        "FULL JOIN" => 0.5,
        _ => 0.1,
    }
}

/// The JOIN decision table.
pub fn choose_join_strategy(
    join_type: &str,
    left_size: i64,
    right_size: i64,
    selectivity: f64,
    condition: &str,
) -> Strategy {
    let total = left_size + right_size;
    let larger = left_size.max(right_size);
    let smaller = total - larger;

    if total < 10_000 {
        return Strategy::Exact;
    }

    if larger > 100_000 && smaller > 0 && (larger as f64 / smaller as f64) > 10.0 {
        return Strategy::SampleLarger;
    }

    if left_size > 50_000 && right_size > 50_000 {
        return Strategy::SampleBoth;
    }

    if join_type.contains("INNER") && selectivity < 0.05 {
        return Strategy::BloomFilter;
    }

    let condition_upper = condition.to_ascii_uppercase();
    if condition_upper.contains("EXISTS") || condition_upper.contains("IN") {
        return Strategy::HashSemi;
    }

    Strategy::SampleLarger
}

fn sample_rows(table_size: i64, fraction: f64) -> i64 {
    ((table_size as f64 * fraction) as i64)
        .max(100)
        .min(table_size.max(100))
}

fn optimized_join_sql(
    sql: &str,
    info: &JoinInfo,
    left_size: i64,
    right_size: i64,
    strategy: Strategy,
) -> String {
    match strategy {
        Strategy::SampleBoth | Strategy::SketchJoin => {
            sample_both(sql, info, left_size, right_size)
        }
        Strategy::SampleLarger => sample_larger(sql, info, left_size, right_size),
        Strategy::BloomFilter => {
            // Realized as sampling plus an annotation; a true bloom-filter
            // pass would build the filter from the smaller side.
            let smaller = if right_size < left_size {
                &info.right_table
            } else {
                &info.left_table
            };
            format!(
                "-- bloom filter approximation: filtering on {smaller}\n{}",
                sample_larger(sql, info, left_size, right_size)
            )
        }
        Strategy::HashSemi => format!("-- hash semi-join\n{sql}"),
        _ => sql.to_string(),
    }
}

fn sample_both(sql: &str, info: &JoinInfo, left_size: i64, right_size: i64) -> String {
    let left_rows = sample_rows(left_size, 0.02);
    let right_rows = sample_rows(right_size, 0.02);

    let rewritten = replace_table_ref(
        sql,
        "FROM",
        &info.left_table,
        &sample_subquery(&info.left_table, left_rows, &format!("{}_sample", info.left_table)),
    );
    replace_table_ref(
        &rewritten,
        "JOIN",
        &info.right_table,
        &sample_subquery(&info.right_table, right_rows, &format!("{}_sample", info.right_table)),
    )
}

fn sample_larger(sql: &str, info: &JoinInfo, left_size: i64, right_size: i64) -> String {
    if left_size > right_size {
        let rows = sample_rows(left_size, 0.05);
        replace_table_ref(
            sql,
            "FROM",
            &info.left_table,
            &sample_subquery(&info.left_table, rows, &format!("{}_sample", info.left_table)),
        )
    } else {
        let rows = sample_rows(right_size, 0.05);
        replace_table_ref(
            sql,
            "JOIN",
            &info.right_table,
            &sample_subquery(&info.right_table, rows, &format!("{}_sample", info.right_table)),
        )
    }
}

/// Constant speedup estimates per JOIN strategy.
fn join_speedup(strategy: Strategy) -> f64 {
    match strategy {
        Strategy::SampleBoth => 2500.0,
        Strategy::SampleLarger => 20.0,
        Strategy::BloomFilter => 50.0,
        Strategy::HashSemi => 10.0,
        Strategy::SketchJoin => 100.0,
        _ => 1.0,
    }
}

/// Constant error estimates per JOIN strategy.
fn join_error(strategy: Strategy) -> f64 {
    match strategy {
        Strategy::SampleBoth => 0.05,
        Strategy::SampleLarger => 0.03,
        Strategy::BloomFilter => 0.02,
        Strategy::HashSemi => 0.01,
        Strategy::SketchJoin => 0.08,
        _ => 0.0,
    }
}

fn join_reasoning(analysis: &JoinAnalysis) -> String {
    match analysis.strategy {
        Strategy::Exact => format!(
            "Small tables ({} + {} rows) - exact JOIN is efficient",
            analysis.left_table_size, analysis.right_table_size
        ),
        Strategy::SampleBoth => format!(
            "Large tables on both sides ({}, {} rows) - dual sampling gives {:.0}x speedup \
             with {:.1}% error",
            analysis.left_table_size,
            analysis.right_table_size,
            analysis.estimated_speedup,
            analysis.estimated_error * 100.0
        ),
        Strategy::SampleLarger => format!(
            "Asymmetric table sizes ({} vs {}) - sampling the larger side",
            analysis.left_table_size, analysis.right_table_size
        ),
        Strategy::BloomFilter => format!(
            "Selective {} with estimated selectivity {:.2}% - bloom-filter approximation",
            analysis.join_type,
            analysis.selectivity * 100.0
        ),
        Strategy::HashSemi => "Semi-join pattern - hash-based existence check".to_string(),
        Strategy::SketchJoin => {
            "Very large JOIN with loose tolerance - sketch-based approximation".to_string()
        }
        _ => "Standard JOIN handling".to_string(),
    }
}
