/// Learning-augmented strategy selection
///
/// Wraps the static rule ladder: when recent history matches the query's
/// shape, strategies are re-ranked by a composite of observed speedup,
/// observed error, and prediction accuracy, and the chosen strategy's
/// predicted parameters are pulled toward what history actually measured.
use std::collections::HashMap;

use crate::learning::history::{HistoryStore, PerformanceRecord};
use crate::query::features::extract_features_sized;
use crate::query::join_planner::analyze_join_query;
use crate::query::plan::{QueryOptimization, Strategy};
use crate::query::planner::{apply_transformations, choose_strategy, reasoning, TransformOutcome};
use crate::query::QueryFeatures;
use crate::storage::db::Db;

/// Composite-score weights: observed speedup, observed error, speedup
/// prediction accuracy, error prediction accuracy.
const SCORE_WEIGHTS: (f64, f64, f64, f64) = (0.4, 0.3, 0.2, 0.1);
/// A winning strategy may exceed the tolerance by this buffer.
const TOLERANCE_BUFFER: f64 = 1.2;
/// Dampening applied to the history actual/predicted ratio.
const ADJUSTMENT_DAMPENING: f64 = 0.3;
/// Floor for predicted values in accuracy denominators.
const PREDICTION_FLOOR: f64 = 0.01;

/// Select a strategy for `sql` and rewrite it, consulting the learning
/// store. Never fails: every fallback lands on an exact passthrough.
/// Returns the optimization and the extracted features (the caller feeds
/// both back into the learning store after execution).
pub async fn optimize_with_learning(
    db: &Db,
    history: &HistoryStore,
    sql: &str,
    error_tolerance: f64,
) -> (QueryOptimization, QueryFeatures) {
    if sql.trim().is_empty() {
        return (
            QueryOptimization::exact(sql, "feature extraction failed: empty query", 0.95),
            QueryFeatures::default(),
        );
    }

    let mut features = extract_features_sized(db, sql, error_tolerance).await;

    // The JOIN path preempts scalar selection.
    match analyze_join_query(db, sql).await {
        Ok(Some(analysis)) => {
            features.table_size = analysis.left_table_size + analysis.right_table_size;
            let mut optimization = QueryOptimization {
                strategy: analysis.strategy,
                modified_sql: analysis.optimized_sql.clone(),
                original_sql: sql.to_string(),
                confidence: 0.85,
                estimated_speedup: analysis.estimated_speedup,
                estimated_error: analysis.estimated_error,
                reasoning: analysis.reasoning.clone(),
                transformations: vec![format!(
                    "Applied {} JOIN optimization",
                    analysis.strategy.as_str()
                )],
                sample_fraction: None,
                join_analysis: Some(analysis),
            };
            optimization.sanitize();
            return (optimization, features);
        }
        Ok(None) => {}
        Err(err) => {
            tracing::debug!(error = %err, "join analysis failed, falling through");
        }
    }

    let records = match history.matching_history(&features).await {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!(error = %err, "history lookup failed, using static rules");
            Vec::new()
        }
    };

    let (strategy, confidence) = choose_strategy_with_learning(&features, &records);
    let mut outcome = apply_transformations(sql, strategy, &features);
    adjust_with_history(&mut outcome, strategy, &records);

    let mut optimization = QueryOptimization {
        strategy,
        modified_sql: outcome.modified_sql,
        original_sql: sql.to_string(),
        confidence,
        estimated_speedup: outcome.estimated_speedup,
        estimated_error: outcome.estimated_error,
        reasoning: learning_reasoning(strategy, &features, &records),
        transformations: outcome.transformations,
        sample_fraction: outcome.sample_fraction,
        join_analysis: None,
    };
    optimization.sanitize();
    (optimization, features)
}

struct StrategyStats {
    count: usize,
    speedup_miss: f64,
    error_miss: f64,
    total_speedup: f64,
    total_error: f64,
}

fn accumulate(records: &[PerformanceRecord]) -> HashMap<Strategy, StrategyStats> {
    let mut by_strategy: HashMap<Strategy, StrategyStats> = HashMap::new();
    for record in records {
        let stats = by_strategy.entry(record.strategy).or_insert(StrategyStats {
            count: 0,
            speedup_miss: 0.0,
            error_miss: 0.0,
            total_speedup: 0.0,
            total_error: 0.0,
        });
        stats.count += 1;
        stats.speedup_miss += (record.actual_speedup - record.predicted_speedup).abs()
            / record.predicted_speedup.abs().max(PREDICTION_FLOOR);
        stats.error_miss += (record.actual_error - record.predicted_error).abs()
            / record.predicted_error.abs().max(PREDICTION_FLOOR);
        stats.total_speedup += record.actual_speedup;
        stats.total_error += record.actual_error;
    }
    by_strategy
}

/// Re-rank strategies by history. With no matching records this is the
/// static rule ladder; otherwise the best-scoring strategy whose observed
/// error stays inside 1.2x the tolerance wins. Same features and same
/// history always produce the same choice.
pub fn choose_strategy_with_learning(
    features: &QueryFeatures,
    records: &[PerformanceRecord],
) -> (Strategy, f64) {
    if records.is_empty() {
        return choose_strategy(features);
    }

    let by_strategy = accumulate(records);
    let (w_speedup, w_error, w_speedup_acc, w_error_acc) = SCORE_WEIGHTS;

    // Stable iteration order keeps selection deterministic for the same
    // features and history, ties included.
    let mut entries: Vec<(&Strategy, &StrategyStats)> = by_strategy.iter().collect();
    entries.sort_by_key(|(strategy, _)| strategy.as_str());

    let mut best_strategy = Strategy::Exact;
    let mut best_score = 0.0;
    for (strategy, stats) in entries {
        if stats.count == 0 {
            continue;
        }
        let count = stats.count as f64;
        let avg_speedup = stats.total_speedup / count;
        let avg_error = stats.total_error / count;
        let speedup_accuracy = 1.0 - stats.speedup_miss / count;
        let error_accuracy = 1.0 - stats.error_miss / count;

        let score = w_speedup * avg_speedup
            + w_error * (1.0 - avg_error)
            + w_speedup_acc * speedup_accuracy
            + w_error_acc * error_accuracy;

        if score > best_score && avg_error <= features.error_tolerance * TOLERANCE_BUFFER {
            best_score = score;
            best_strategy = *strategy;
        }
    }

    let confidence = match by_strategy.get(&best_strategy) {
        Some(stats) if stats.count > 0 => {
            let count = stats.count as f64;
            let speedup_accuracy = 1.0 - stats.speedup_miss / count;
            let error_accuracy = 1.0 - stats.error_miss / count;
            0.3 + 0.7 * (speedup_accuracy + error_accuracy) / 2.0
        }
        _ => 0.6,
    };

    (best_strategy, confidence.min(0.95))
}

/// Pull predicted speedup and error toward history by a dampened ratio:
/// `adjusted = predicted * (1 + 0.3 * (mean_ratio - 1))`.
///
/// Exact plans are skipped outright: their predicted error is
/// structurally zero, and a floored ratio would only distort learning.
pub fn adjust_with_history(
    outcome: &mut TransformOutcome,
    strategy: Strategy,
    records: &[PerformanceRecord],
) {
    if strategy == Strategy::Exact {
        return;
    }

    let matching: Vec<&PerformanceRecord> = records
        .iter()
        .filter(|record| record.strategy == strategy)
        .collect();
    if matching.is_empty() {
        return;
    }

    let count = matching.len() as f64;
    let mut speedup_ratio = matching
        .iter()
        .map(|record| {
            if record.predicted_speedup > 0.0 {
                record.actual_speedup / record.predicted_speedup
            } else {
                1.0
            }
        })
        .sum::<f64>()
        / count;
    let mut error_ratio = matching
        .iter()
        .map(|record| {
            if record.predicted_error > 0.0 {
                record.actual_error / record.predicted_error
            } else {
                1.0
            }
        })
        .sum::<f64>()
        / count;

    if !speedup_ratio.is_finite() {
        speedup_ratio = 1.0;
    }
    if !error_ratio.is_finite() {
        error_ratio = 1.0;
    }

    outcome.estimated_speedup *= 1.0 + (speedup_ratio - 1.0) * ADJUSTMENT_DAMPENING;
    outcome.estimated_error *= 1.0 + (error_ratio - 1.0) * ADJUSTMENT_DAMPENING;

    if !outcome.estimated_speedup.is_finite() || outcome.estimated_speedup <= 0.0 {
        outcome.estimated_speedup = 1.0;
    }
    if !outcome.estimated_error.is_finite() || outcome.estimated_error < 0.0 {
        outcome.estimated_error = 0.01;
    }

    outcome.transformations.push(format!(
        "Applied learning adjustments (speedup ratio: {speedup_ratio:.2}, error ratio: {error_ratio:.2})"
    ));
}

fn learning_reasoning(
    strategy: Strategy,
    features: &QueryFeatures,
    records: &[PerformanceRecord],
) -> String {
    let base = reasoning(strategy, features);
    if records.is_empty() {
        return format!("{base} (no historical data available)");
    }

    let matching: Vec<&PerformanceRecord> = records
        .iter()
        .filter(|record| record.strategy == strategy)
        .collect();
    if matching.is_empty() {
        return format!("{base} (analyzed {} historical queries)", records.len());
    }

    let count = matching.len() as f64;
    let avg_speedup = matching.iter().map(|r| r.actual_speedup).sum::<f64>() / count;
    let avg_error = matching.iter().map(|r| r.actual_error).sum::<f64>() / count;
    format!(
        "{base} (learned from {} similar queries: avg {avg_speedup:.1}x speedup, {:.1}% error)",
        matching.len(),
        avg_error * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(size: i64, tolerance: f64) -> QueryFeatures {
        QueryFeatures {
            table_name: "purchases".to_string(),
            table_size: size,
            has_sum: true,
            error_tolerance: tolerance,
            ..Default::default()
        }
    }

    fn record(strategy: Strategy, actual: f64, predicted: f64) -> PerformanceRecord {
        PerformanceRecord {
            id: 0,
            query_pattern: "SELECT SUM(amount) FROM purchases WHERE x = ?".to_string(),
            table_size: 20_000,
            strategy,
            actual_speedup: actual,
            actual_error: 0.02,
            predicted_speedup: predicted,
            predicted_error: 0.03,
            execution_time_ms: 10,
            error_tolerance: 0.05,
            user_satisfaction: 0,
        }
    }

    #[test]
    fn test_empty_history_uses_static_rules() {
        let f = features(200_000, 0.06);
        let (strategy, confidence) = choose_strategy_with_learning(&f, &[]);
        assert_eq!((strategy, confidence), choose_strategy(&f));
    }

    #[test]
    fn test_history_rerank_prefers_observed_winner() {
        // Sample history shows strong speedup with accurate predictions;
        // sketch history shows poor speedup.
        let records = vec![
            record(Strategy::Sample, 10.0, 10.0),
            record(Strategy::Sample, 9.5, 10.0),
            record(Strategy::Sketch, 1.2, 5.0),
        ];
        let (strategy, confidence) = choose_strategy_with_learning(&features(20_000, 0.05), &records);
        assert_eq!(strategy, Strategy::Sample);
        assert!(confidence > 0.8 && confidence <= 0.95);
    }

    #[test]
    fn test_error_budget_disqualifies_strategies() {
        // Strategy with great speedup but error far past 1.2x tolerance.
        let mut bad = record(Strategy::Sample, 50.0, 50.0);
        bad.actual_error = 0.5;
        let (strategy, _) = choose_strategy_with_learning(&features(20_000, 0.05), &[bad]);
        assert_eq!(strategy, Strategy::Exact);
    }

    #[test]
    fn test_dampened_adjustment_ratio() {
        // History reports actuals at half the prediction: the dampened
        // adjustment lands at 0.85x.
        let records: Vec<PerformanceRecord> = (0..20)
            .map(|_| record(Strategy::Sample, 5.0, 10.0))
            .collect();
        let mut outcome = TransformOutcome {
            modified_sql: String::new(),
            transformations: Vec::new(),
            estimated_speedup: 20.0,
            estimated_error: 0.04,
            sample_fraction: Some(0.05),
        };
        adjust_with_history(&mut outcome, Strategy::Sample, &records);
        assert!((outcome.estimated_speedup - 17.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_strategy_skips_adjustment() {
        let records = vec![record(Strategy::Exact, 0.5, 1.0)];
        let mut outcome = TransformOutcome {
            modified_sql: String::new(),
            transformations: Vec::new(),
            estimated_speedup: 1.0,
            estimated_error: 0.0,
            sample_fraction: None,
        };
        adjust_with_history(&mut outcome, Strategy::Exact, &records);
        assert_eq!(outcome.estimated_speedup, 1.0);
        assert!(outcome.transformations.is_empty());
    }

    #[test]
    fn test_adjustment_coerces_pathological_ratios() {
        let mut bad = record(Strategy::Sample, f64::NAN, 10.0);
        bad.actual_error = f64::NAN;
        let mut outcome = TransformOutcome {
            modified_sql: String::new(),
            transformations: Vec::new(),
            estimated_speedup: 20.0,
            estimated_error: 0.04,
            sample_fraction: Some(0.05),
        };
        adjust_with_history(&mut outcome, Strategy::Sample, &[bad]);
        assert!(outcome.estimated_speedup.is_finite() && outcome.estimated_speedup > 0.0);
        assert!(outcome.estimated_error.is_finite() && outcome.estimated_error >= 0.0);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let records = vec![
            record(Strategy::Sample, 10.0, 10.0),
            record(Strategy::Sketch, 3.0, 3.0),
        ];
        let f = features(20_000, 0.05);
        let first = choose_strategy_with_learning(&f, &records);
        for _ in 0..10 {
            assert_eq!(choose_strategy_with_learning(&f, &records), first);
        }
    }
}
