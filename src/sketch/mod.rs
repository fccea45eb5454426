/// Probabilistic sketch engines for approximate aggregates
///
/// Two sketches are supported: HyperLogLog for distinct counts and
/// Count-Min for per-key frequencies. Both are mergeable, serialize to
/// self-describing little-endian blobs, and publish analytic error bounds.
use std::fmt;
use std::hash::Hasher;

use fxhash::FxHasher;
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};

use crate::error::AqeResult;
use crate::storage::db::{Db, SKETCH_BUILD_DEADLINE};

pub mod countmin;
pub mod hyperloglog;

pub use countmin::CountMinSketch;
pub use hyperloglog::HyperLogLog;

/// Values drawn into a single sketch build are capped at this many rows.
const SKETCH_BUILD_ROW_CAP: usize = 1_000_000;

/// Sketch family tag, stored alongside each blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SketchKind {
    HyperLogLog,
    CountMin,
}

impl SketchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SketchKind::HyperLogLog => "hyperloglog",
            SketchKind::CountMin => "countmin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hyperloglog" => Some(SketchKind::HyperLogLog),
            "countmin" => Some(SketchKind::CountMin),
            _ => None,
        }
    }
}

impl fmt::Display for SketchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 64-bit non-cryptographic hash shared by both sketches.
pub(crate) fn hash64(data: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(data);
    hasher.finish()
}

fn value_to_key(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => None,
    }
}

/// Build a HyperLogLog over the distinct values of `table.column` and
/// return the serialized blob.
pub async fn build_hll_from_table(
    db: &Db,
    table: &str,
    column: &str,
    b: u8,
) -> AqeResult<Vec<u8>> {
    let query = format!(
        "SELECT DISTINCT {column} FROM {table} WHERE {column} IS NOT NULL"
    );
    db.call(SKETCH_BUILD_DEADLINE, "sketch build", move |conn| {
        let mut hll = HyperLogLog::new(b);
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query([])?;
        let mut seen = 0usize;
        while let Some(row) = rows.next()? {
            if let Some(key) = value_to_key(row.get_ref(0)?) {
                hll.insert_str(&key);
            }
            seen += 1;
            if seen >= SKETCH_BUILD_ROW_CAP {
                break;
            }
        }
        Ok(hll.to_bytes())
    })
    .await
}

/// Build a Count-Min sketch over per-value frequencies of `table.column`
/// and return the serialized blob.
pub async fn build_cm_from_table(
    db: &Db,
    table: &str,
    column: &str,
    epsilon: f64,
    delta: f64,
) -> AqeResult<Vec<u8>> {
    let query = format!(
        "SELECT {column}, COUNT(*) FROM {table}
         WHERE {column} IS NOT NULL GROUP BY {column}"
    );
    db.call(SKETCH_BUILD_DEADLINE, "sketch build", move |conn| {
        let mut cm = CountMinSketch::new(epsilon, delta);
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let count: i64 = row.get(1)?;
            if let Some(key) = value_to_key(row.get_ref(0)?) {
                cm.add_str(&key, count.max(0) as u64);
            }
        }
        Ok(cm.to_bytes())
    })
    .await
}

/// Estimate the cardinality of a column from its stored HLL blob.
pub fn hll_estimate_from_blob(data: &[u8], confidence: f64) -> AqeResult<HllEstimate> {
    let hll = HyperLogLog::from_bytes(data)?;
    let (lower, upper) = hll.confidence_interval(confidence);
    Ok(HllEstimate {
        estimate: hll.estimate(),
        standard_error: hll.standard_error(),
        confidence,
        ci_low: lower,
        ci_high: upper,
    })
}

/// Cardinality estimate served by the sketch API.
#[derive(Clone, Debug, Serialize)]
pub struct HllEstimate {
    pub estimate: u64,
    pub standard_error: f64,
    pub confidence: f64,
    pub ci_low: u64,
    pub ci_high: u64,
}
