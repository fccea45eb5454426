/// Learning store: performance history, learning-augmented strategy
/// selection, and background maintenance of the history tables.
pub mod history;
pub mod maintenance;
pub mod selector;

pub use history::{normalize_pattern, size_bucket, HistoryStore, PerformanceRecord};
pub use selector::optimize_with_learning;
