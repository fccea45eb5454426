/// Query analysis and planning: lexical feature extraction, strategy
/// selection, JOIN specialization, and plan rewriting.
pub mod features;
pub mod join_planner;
pub mod plan;
pub mod planner;
pub mod rewrite;

pub use features::QueryFeatures;
pub use join_planner::JoinAnalysis;
pub use plan::{Plan, PlanKind, QueryOptimization, Strategy};
pub use planner::Planner;
