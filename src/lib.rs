//! # Approximate Query Engine
//!
//! A query-optimization and execution layer over a row-oriented SQL store
//! that answers aggregate queries (COUNT, SUM, AVG, DISTINCT, GROUP BY,
//! JOIN) from uniform or stratified samples and probabilistic sketches
//! whenever the caller's relative-error budget allows, attaching
//! per-value confidence intervals to every approximate result.
//!
//! The pipeline for a query:
//!
//! 1. Lexical feature extraction from the SQL string.
//! 2. Strategy selection from static rules plus a learned history of
//!    predicted-vs-observed performance.
//! 3. Plan rewriting onto sample tables or sampling subqueries.
//! 4. Execution with aggregate scaling and bootstrap intervals.
//! 5. An asynchronous learning-store append feeding future selections.
//!
//! Sketches (HyperLogLog, Count-Min) and sample tables are materialized
//! out-of-band through their own endpoints and consulted via metadata.

pub mod config;
pub mod error;
pub mod estimator;
pub mod executor;
pub mod learning;
pub mod query;
pub mod sample;
pub mod sketch;
pub mod storage;
pub mod web;

pub use config::ServerConfig;
pub use error::{AqeError, AqeResult};
pub use query::{Plan, PlanKind, Planner, QueryFeatures, QueryOptimization, Strategy};
pub use storage::Db;
