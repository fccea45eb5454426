/// Plan and optimization wire types
use serde::{Deserialize, Serialize};

use crate::query::join_planner::JoinAnalysis;

/// Execution path chosen by the planner. Drives executor behavior: sample
/// plans get aggregate scaling and bootstrap intervals attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Exact,
    Sample,
    Sketch,
}

/// Optimization strategy, covering both scalar and JOIN-specialized
/// variants. Stored as text in the learning history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Exact,
    Sample,
    Sketch,
    Stratified,
    SampleBoth,
    SampleLarger,
    BloomFilter,
    HashSemi,
    SketchJoin,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Exact => "exact",
            Strategy::Sample => "sample",
            Strategy::Sketch => "sketch",
            Strategy::Stratified => "stratified",
            Strategy::SampleBoth => "sample_both",
            Strategy::SampleLarger => "sample_larger",
            Strategy::BloomFilter => "bloom_filter",
            Strategy::HashSemi => "hash_semi",
            Strategy::SketchJoin => "sketch_join",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Strategy::Exact),
            "sample" => Some(Strategy::Sample),
            "sketch" => Some(Strategy::Sketch),
            "stratified" => Some(Strategy::Stratified),
            "sample_both" => Some(Strategy::SampleBoth),
            "sample_larger" => Some(Strategy::SampleLarger),
            "bloom_filter" => Some(Strategy::BloomFilter),
            "hash_semi" => Some(Strategy::HashSemi),
            "sketch_join" => Some(Strategy::SketchJoin),
            _ => None,
        }
    }
}

/// Execution plan produced by the planner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "type")]
    pub kind: PlanKind,
    pub sql: String,
    pub original_sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sketch_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sketch_column: Option<String>,
    pub estimated_cost: f64,
    pub estimated_error: f64,
    pub reason: String,
}

impl Plan {
    /// Exact passthrough plan with a reason.
    pub fn exact(sql: &str, table: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            kind: PlanKind::Exact,
            sql: sql.to_string(),
            original_sql: sql.to_string(),
            table: table.map(str::to_string),
            sample_table: None,
            sample_fraction: None,
            sketch_kind: None,
            sketch_column: None,
            estimated_cost: 0.0,
            estimated_error: 0.0,
            reason: reason.into(),
        }
    }
}

/// Strategy-selection outcome with the rewritten SQL and its predicted
/// performance. Attached to the query response when learned optimization
/// is enabled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryOptimization {
    pub strategy: Strategy,
    pub modified_sql: String,
    pub original_sql: String,
    pub confidence: f64,
    pub estimated_speedup: f64,
    pub estimated_error: f64,
    pub reasoning: String,
    pub transformations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_analysis: Option<JoinAnalysis>,
}

impl QueryOptimization {
    /// Exact passthrough optimization.
    pub fn exact(sql: &str, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self {
            strategy: Strategy::Exact,
            modified_sql: sql.to_string(),
            original_sql: sql.to_string(),
            confidence,
            estimated_speedup: 1.0,
            estimated_error: 0.0,
            reasoning: reasoning.into(),
            transformations: Vec::new(),
            sample_fraction: None,
            join_analysis: None,
        }
    }

    /// Coerce NaN/Inf fields to safe defaults before the struct reaches
    /// JSON serialization or the learning store.
    pub fn sanitize(&mut self) {
        if !self.estimated_speedup.is_finite() || self.estimated_speedup <= 0.0 {
            self.estimated_speedup = 1.0;
        }
        if !self.estimated_error.is_finite() || self.estimated_error < 0.0 {
            self.estimated_error = 0.01;
        }
        if !self.confidence.is_finite() {
            self.confidence = 0.95;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_string_roundtrip() {
        for strategy in [
            Strategy::Exact,
            Strategy::Sample,
            Strategy::Sketch,
            Strategy::Stratified,
            Strategy::SampleBoth,
            Strategy::SampleLarger,
            Strategy::BloomFilter,
            Strategy::HashSemi,
            Strategy::SketchJoin,
        ] {
            assert_eq!(Strategy::parse(strategy.as_str()), Some(strategy));
        }
        assert_eq!(Strategy::parse("unknown"), None);
    }

    #[test]
    fn test_sanitize_coerces_pathological_values() {
        let mut opt = QueryOptimization::exact("SELECT 1", "test", 0.9);
        opt.estimated_speedup = f64::NAN;
        opt.estimated_error = f64::INFINITY;
        opt.confidence = f64::NAN;
        opt.sanitize();
        assert_eq!(opt.estimated_speedup, 1.0);
        assert_eq!(opt.estimated_error, 0.01);
        assert_eq!(opt.confidence, 0.95);
    }
}
