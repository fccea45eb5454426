/// Strategy selection and plan construction
///
/// Two cooperating layers, matching the request flow: the static rule
/// ladder with per-strategy SQL transforms (consulted directly and by the
/// learning-augmented selector), and the cost-based [`Planner`] that picks
/// among exact execution, registered sketches, and materialized sample
/// tables.
use serde::{Deserialize, Serialize};

use crate::error::AqeResult;
use crate::query::features::{
    distinct_count_column, extract_features, extract_table_name, first_group_by_column,
};
use crate::query::plan::{Plan, PlanKind, Strategy};
use crate::query::rewrite::{replace_all_table_refs, replace_table_ref, sample_subquery};
use crate::query::QueryFeatures;
use crate::sample::{parse_sample_table_name, stratified_sample_table_name,
    uniform_sample_table_name};
use crate::storage::db::{Db, HISTORY_LOOKUP_DEADLINE};
use crate::storage::meta;

/// Static strategy selection from query features alone. Returns the
/// strategy and a rule confidence.
pub fn choose_strategy(features: &QueryFeatures) -> (Strategy, f64) {
    if features.table_size < 100 {
        return (Strategy::Exact, 0.95);
    }

    if features.has_distinct && features.has_count && features.error_tolerance > 0.01 {
        return (Strategy::Sketch, 0.90);
    }

    if features.table_size > 1000
        && (features.has_count || features.has_sum || features.has_avg)
        && features.error_tolerance > 0.05
    {
        return (Strategy::Sample, 0.80);
    }

    if features.has_group_by && features.error_tolerance > 0.03 {
        if features.table_size > 10_000 {
            return (Strategy::Sample, 0.80);
        }
        return (Strategy::Sketch, 0.75);
    }

    if features.table_size > 500
        && (features.has_count || features.has_sum)
        && features.error_tolerance > 0.02
    {
        return (Strategy::Sample, 0.70);
    }

    (Strategy::Exact, 0.60)
}

/// Sample fraction schedule: 1% above 100k rows, 2% above 50k, else 5%,
/// halved again when the tolerance is loose.
pub fn sample_fraction_for(features: &QueryFeatures) -> f64 {
    let mut fraction = if features.table_size > 100_000 {
        0.01
    } else if features.table_size > 50_000 {
        0.02
    } else {
        0.05
    };
    if features.error_tolerance > 0.1 {
        fraction *= 0.5;
    }
    fraction
}

/// Minimum rows any sampling rewrite will read.
pub const MIN_SAMPLE_ROWS: i64 = 100;

/// Result of applying a strategy's SQL transform.
#[derive(Clone, Debug)]
pub struct TransformOutcome {
    pub modified_sql: String,
    pub transformations: Vec<String>,
    pub estimated_speedup: f64,
    pub estimated_error: f64,
    pub sample_fraction: Option<f64>,
}

/// Rewrite the query for the chosen strategy and predict its performance.
pub fn apply_transformations(
    sql: &str,
    strategy: Strategy,
    features: &QueryFeatures,
) -> TransformOutcome {
    match strategy {
        Strategy::Sample => apply_sample_transformation(sql, features),
        Strategy::Sketch => apply_sketch_transformation(sql, features),
        Strategy::Stratified => apply_stratified_transformation(sql, features),
        _ => TransformOutcome {
            modified_sql: sql.to_string(),
            transformations: Vec::new(),
            estimated_speedup: 1.0,
            estimated_error: 0.0,
            sample_fraction: None,
        },
    }
}

fn apply_sample_transformation(sql: &str, features: &QueryFeatures) -> TransformOutcome {
    let fraction = sample_fraction_for(features);
    let rows = ((features.table_size as f64 * fraction) as i64).max(MIN_SAMPLE_ROWS);

    let modified_sql = replace_table_ref(
        sql,
        "FROM",
        &features.table_name,
        &sample_subquery(&features.table_name, rows, "sample_data"),
    );

    let sample_size = (features.table_size as f64 * fraction).max(30.0);
    let estimated_error = (1.0 / sample_size.sqrt()).clamp(0.01, 0.50);

    TransformOutcome {
        modified_sql,
        transformations: vec![format!("Applied uniform sampling (fraction: {fraction:.3})")],
        estimated_speedup: 1.0 / fraction,
        estimated_error,
        sample_fraction: Some(fraction),
    }
}

fn apply_sketch_transformation(sql: &str, features: &QueryFeatures) -> TransformOutcome {
    let mut modified_sql = None;

    if features.has_group_by && features.table_size > 5000 {
        let rows = (features.table_size as f64 * 0.3) as i64;
        modified_sql = Some(replace_table_ref(
            sql,
            "FROM",
            &features.table_name,
            &sample_subquery(&features.table_name, rows, "sketch_sample"),
        ));
    } else if features.has_distinct && features.has_count {
        let rows = (features.table_size as f64 * 0.2) as i64;
        modified_sql = Some(replace_table_ref(
            sql,
            "FROM",
            &features.table_name,
            &sample_subquery(&features.table_name, rows, "sketch_sample"),
        ));
    }

    let (estimated_speedup, estimated_error) = if features.table_size > 5000 {
        let sketch_rows = features.table_size as f64 * 0.3;
        (features.table_size as f64 / sketch_rows, 1.0 / sketch_rows.sqrt())
    } else {
        (3.0, 0.05)
    };

    TransformOutcome {
        modified_sql: modified_sql
            .unwrap_or_else(|| format!("-- probabilistic approximation\n{sql}")),
        transformations: vec!["Applied probabilistic sketches for DISTINCT/GROUP BY".to_string()],
        estimated_speedup,
        estimated_error: estimated_error.clamp(0.02, 0.30),
        sample_fraction: None,
    }
}

fn apply_stratified_transformation(sql: &str, features: &QueryFeatures) -> TransformOutcome {
    let strata_column =
        first_group_by_column(sql).unwrap_or_else(|| "id".to_string());
    let sample_table = stratified_sample_table_name(&features.table_name, &strata_column, 0.6);
    let modified_sql = replace_all_table_refs(sql, &features.table_name, &sample_table);

    TransformOutcome {
        modified_sql,
        transformations: vec![format!("Applied stratified sampling on column: {strata_column}")],
        estimated_speedup: 8.0,
        estimated_error: 0.02,
        sample_fraction: None,
    }
}

/// Human-readable explanation of a static strategy choice.
pub fn reasoning(strategy: Strategy, features: &QueryFeatures) -> String {
    match strategy {
        Strategy::Exact => {
            if features.table_size < 1000 {
                "Small table - exact computation is fast and exact".to_string()
            } else {
                "No clear optimization applies - using exact computation".to_string()
            }
        }
        Strategy::Sample => format!(
            "Large table ({} rows) with aggregations - uniform sampling gives {:.1}x speedup \
             with controlled error",
            features.table_size,
            1.0 / sample_fraction_for(features)
        ),
        Strategy::Sketch => {
            if features.has_distinct {
                "DISTINCT query - HyperLogLog sketch answers with a few percent error".to_string()
            } else {
                "GROUP BY with low cardinality - probabilistic sketches fit this shape".to_string()
            }
        }
        Strategy::Stratified => {
            "GROUP BY query - stratified sampling reduces per-group variance".to_string()
        }
        _ => "Using exact computation".to_string(),
    }
}

/// Per-operation cost constants for plan comparison.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CostModel {
    pub scan_cost_per_row: f64,
    pub hash_cost_per_group: f64,
    pub sketch_query_cost: f64,
    pub sample_setup_cost: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            scan_cost_per_row: 1.0,
            hash_cost_per_group: 2.0,
            sketch_query_cost: 10.0,
            sample_setup_cost: 5.0,
        }
    }
}

/// Table context gathered in one metadata pass.
struct TableContext {
    row_count: i64,
    sketch_precision: Option<u8>,
    sample: Option<(String, f64)>,
}

/// Cost-based planner over exact execution, registered sketches, and
/// materialized sample tables.
pub struct Planner {
    cost_model: CostModel,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            cost_model: CostModel::default(),
        }
    }

    /// Produce an execution plan for `sql` under the given error budget.
    ///
    /// Queries that already name a sample table short-circuit to a sample
    /// plan; the name is the only signal. Missing statistics or metadata
    /// fall back to exact execution, never to an error.
    pub async fn plan(
        &self,
        db: &Db,
        sql: &str,
        max_rel_error: f64,
        prefer_exact: bool,
    ) -> AqeResult<Plan> {
        let features = extract_features(sql, max_rel_error);

        let table = match extract_table_name(sql) {
            Some(table) => table,
            None => return Ok(Plan::exact(sql, None, "no table found")),
        };

        if let Some((base, fraction)) = parse_sample_table_name(&table) {
            return Ok(Plan {
                kind: PlanKind::Sample,
                sql: sql.to_string(),
                original_sql: sql.to_string(),
                table: Some(base),
                sample_table: Some(table),
                sample_fraction: Some(fraction),
                sketch_kind: None,
                sketch_column: None,
                estimated_cost: 0.0,
                estimated_error: 0.0,
                reason: format!("direct query on sample table (fraction: {fraction:.4})"),
            });
        }

        if prefer_exact {
            return Ok(Plan::exact(sql, Some(&table), "user prefers exact"));
        }

        let distinct_column = if features.has_distinct {
            distinct_count_column(sql)
        } else {
            None
        };
        let context = match self.table_context(db, &table, distinct_column).await {
            Ok(context) => context,
            Err(err) => {
                tracing::debug!(table = %table, error = %err, "table stats unavailable");
                return Ok(Plan::exact(sql, Some(&table), "no table stats available"));
            }
        };

        let candidates = self.evaluate_strategies(sql, &table, &features, &context);
        Ok(choose_best_plan(candidates, max_rel_error))
    }

    async fn table_context(
        &self,
        db: &Db,
        table: &str,
        distinct_column: Option<String>,
    ) -> AqeResult<TableContext> {
        let table_name = table.to_string();

        db.call(HISTORY_LOOKUP_DEADLINE, "plan metadata lookup", move |conn| {
            let row_count = match meta::table_row_count(conn, &table_name)? {
                Some(count) => count,
                None => conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table_name}"),
                    [],
                    |row| row.get(0),
                )?,
            };

            let sketch_precision = match &distinct_column {
                Some(column) => meta::get_sketch(conn, &table_name, column, "hyperloglog")?
                    .and_then(|(blob, _)| blob.first().copied()),
                None => None,
            };

            let sample = match meta::best_sample_fraction(conn, &table_name)? {
                Some(fraction) => {
                    let sample_table = uniform_sample_table_name(&table_name, fraction);
                    if meta::table_exists(conn, &sample_table)? {
                        Some((sample_table, fraction))
                    } else {
                        None
                    }
                }
                None => None,
            };

            Ok(TableContext {
                row_count,
                sketch_precision,
                sample,
            })
        })
        .await
    }

    fn evaluate_strategies(
        &self,
        sql: &str,
        table: &str,
        features: &QueryFeatures,
        context: &TableContext,
    ) -> Vec<Plan> {
        let mut candidates = Vec::new();

        let mut exact_cost = context.row_count as f64 * self.cost_model.scan_cost_per_row;
        if features.has_group_by {
            let estimated_groups = (context.row_count as f64).min(10_000.0);
            exact_cost += estimated_groups * self.cost_model.hash_cost_per_group;
        }
        let mut exact = Plan::exact(sql, Some(table), "exact execution");
        exact.estimated_cost = exact_cost;
        candidates.push(exact);

        if features.has_distinct {
            if let (Some(column), Some(precision)) =
                (distinct_count_column(sql), context.sketch_precision)
            {
                let registers = 1u64 << precision.min(16);
                candidates.push(Plan {
                    kind: PlanKind::Sketch,
                    sql: sql.to_string(),
                    original_sql: sql.to_string(),
                    table: Some(table.to_string()),
                    sample_table: None,
                    sample_fraction: None,
                    sketch_kind: Some("hyperloglog".to_string()),
                    sketch_column: Some(column),
                    estimated_cost: self.cost_model.sketch_query_cost,
                    estimated_error: 1.04 / (registers as f64).sqrt(),
                    reason: "using HyperLogLog sketch for DISTINCT".to_string(),
                });
            }
        }

        if let Some((sample_table, fraction)) = &context.sample {
            let estimated_error = (1.0 / (fraction * context.row_count as f64)).sqrt();
            candidates.push(Plan {
                kind: PlanKind::Sample,
                sql: replace_all_table_refs(sql, table, sample_table),
                original_sql: sql.to_string(),
                table: Some(table.to_string()),
                sample_table: Some(sample_table.clone()),
                sample_fraction: Some(*fraction),
                sketch_kind: None,
                sketch_column: None,
                estimated_cost: context.row_count as f64 * fraction
                    * self.cost_model.scan_cost_per_row
                    + self.cost_model.sample_setup_cost,
                estimated_error,
                reason: format!("using {:.1}% sample", fraction * 100.0),
            });
        }

        candidates
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the cheapest candidate that meets the error budget; the exact
/// plan (always first) is the fallback.
fn choose_best_plan(mut candidates: Vec<Plan>, max_rel_error: f64) -> Plan {
    let mut best: Option<usize> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.estimated_error > max_rel_error {
            continue;
        }
        match best {
            Some(current) if candidates[current].estimated_cost <= candidate.estimated_cost => {}
            _ => best = Some(index),
        }
    }
    match best {
        Some(index) => candidates.swap_remove(index),
        None => {
            if candidates.is_empty() {
                Plan::exact("", None, "no strategies available")
            } else {
                candidates.swap_remove(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(size: i64, tolerance: f64) -> QueryFeatures {
        QueryFeatures {
            table_name: "purchases".to_string(),
            table_size: size,
            error_tolerance: tolerance,
            ..Default::default()
        }
    }

    #[test]
    fn test_small_tables_stay_exact() {
        let (strategy, confidence) = choose_strategy(&features(50, 0.05));
        assert_eq!(strategy, Strategy::Exact);
        assert_eq!(confidence, 0.95);
    }

    #[test]
    fn test_distinct_count_selects_sketch() {
        let mut f = features(200_000, 0.05);
        f.has_distinct = true;
        f.has_count = true;
        let (strategy, confidence) = choose_strategy(&f);
        assert_eq!(strategy, Strategy::Sketch);
        assert_eq!(confidence, 0.90);
    }

    #[test]
    fn test_large_aggregate_selects_sample() {
        let mut f = features(200_000, 0.06);
        f.has_sum = true;
        let (strategy, confidence) = choose_strategy(&f);
        assert_eq!(strategy, Strategy::Sample);
        assert_eq!(confidence, 0.80);
    }

    #[test]
    fn test_group_by_paths() {
        let mut f = features(50_000, 0.05);
        f.has_group_by = true;
        assert_eq!(choose_strategy(&f).0, Strategy::Sample);

        let mut f = features(5_000, 0.05);
        f.has_group_by = true;
        assert_eq!(choose_strategy(&f), (Strategy::Sketch, 0.75));
    }

    #[test]
    fn test_mid_size_count_selects_sample_with_lower_confidence() {
        let mut f = features(800, 0.03);
        f.has_count = true;
        assert_eq!(choose_strategy(&f), (Strategy::Sample, 0.70));
    }

    #[test]
    fn test_default_is_exact() {
        assert_eq!(choose_strategy(&features(800, 0.001)), (Strategy::Exact, 0.60));
    }

    #[test]
    fn test_fraction_schedule() {
        assert_eq!(sample_fraction_for(&features(200_000, 0.05)), 0.01);
        assert_eq!(sample_fraction_for(&features(60_000, 0.05)), 0.02);
        assert_eq!(sample_fraction_for(&features(10_000, 0.05)), 0.05);
        // Loose tolerance halves the fraction.
        assert_eq!(sample_fraction_for(&features(200_000, 0.2)), 0.005);
    }

    #[test]
    fn test_sample_transform_wraps_from_clause() {
        let mut f = features(200_000, 0.05);
        f.has_sum = true;
        let outcome = apply_transformations(
            "SELECT country, SUM(amount) FROM purchases GROUP BY country",
            Strategy::Sample,
            &f,
        );
        assert!(outcome
            .modified_sql
            .contains("FROM (SELECT * FROM purchases ORDER BY random() LIMIT 2000) AS sample_data"));
        assert_eq!(outcome.sample_fraction, Some(0.01));
        assert_eq!(outcome.estimated_speedup, 100.0);
    }

    #[test]
    fn test_sample_transform_floors_row_count() {
        let f = features(500, 0.05);
        let outcome = apply_transformations("SELECT COUNT(*) FROM purchases", Strategy::Sample, &f);
        assert!(outcome.modified_sql.contains("LIMIT 100"), "{}", outcome.modified_sql);
    }

    #[test]
    fn test_sketch_transform_uses_sketch_sample_alias() {
        let mut f = features(100_000, 0.05);
        f.has_distinct = true;
        f.has_count = true;
        let outcome = apply_transformations(
            "SELECT COUNT(DISTINCT country) FROM purchases",
            Strategy::Sketch,
            &f,
        );
        assert!(outcome.modified_sql.contains("AS sketch_sample"));
        assert!(outcome.estimated_error >= 0.02 && outcome.estimated_error <= 0.30);
    }

    #[test]
    fn test_stratified_transform_substitutes_sample_table() {
        let mut f = features(100_000, 0.05);
        f.has_group_by = true;
        let outcome = apply_transformations(
            "SELECT country, AVG(amount) FROM purchases GROUP BY country",
            Strategy::Stratified,
            &f,
        );
        assert!(outcome
            .modified_sql
            .contains("purchases__strat_sample_country_0_6"));
        assert_eq!(outcome.estimated_speedup, 8.0);
    }

    #[tokio::test]
    async fn test_plan_without_table_is_exact() {
        let db = Db::open_in_memory().unwrap();
        let plan = Planner::new().plan(&db, "SELECT 1 + 1", 0.05, false).await.unwrap();
        assert_eq!(plan.kind, PlanKind::Exact);
        assert_eq!(plan.reason, "no table found");
    }

    #[tokio::test]
    async fn test_plan_shortcircuits_on_sample_table_name() {
        let db = Db::open_in_memory().unwrap();
        let plan = Planner::new()
            .plan(&db, "SELECT COUNT(*) FROM purchases__sample_0_05", 0.05, false)
            .await
            .unwrap();
        assert_eq!(plan.kind, PlanKind::Sample);
        assert_eq!(plan.table.as_deref(), Some("purchases"));
        assert_eq!(plan.sample_fraction, Some(0.05));
    }

    #[tokio::test]
    async fn test_prefer_exact_wins() {
        let db = Db::open_in_memory().unwrap();
        let plan = Planner::new()
            .plan(&db, "SELECT COUNT(*) FROM purchases", 0.05, true)
            .await
            .unwrap();
        assert_eq!(plan.kind, PlanKind::Exact);
        assert_eq!(plan.reason, "user prefers exact");
    }
}
