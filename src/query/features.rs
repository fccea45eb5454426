/// Lexical query feature extraction
///
/// Deliberately a scanner, not a parser: aggregate flags come from
/// case-folded substring checks and clause bodies from a terminator scan.
/// Good enough for the aggregate shapes this engine optimizes; anything
/// it cannot read falls through to an exact plan.
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::storage::db::{Db, SIZE_PROBE_DEADLINE};

/// Structural features of one query, the input to strategy selection.
/// Serialized as the `query_features` blob in the learning history.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryFeatures {
    pub table_name: String,
    pub table_size: i64,
    pub has_count: bool,
    pub has_sum: bool,
    pub has_avg: bool,
    pub has_distinct: bool,
    pub has_group_by: bool,
    pub group_by_cardinality: usize,
    pub where_complexity: usize,
    pub query_length: usize,
    pub error_tolerance: f64,
}

fn from_table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bfrom\s+([A-Za-z_][A-Za-z0-9_]*)").expect("static regex")
    })
}

fn distinct_count_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)count\s*\(\s*distinct\s+([A-Za-z_][A-Za-z0-9_]*)").expect("static regex")
    })
}

fn group_by_column_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)group\s+by\s+([A-Za-z_][A-Za-z0-9_]*)").expect("static regex")
    })
}

/// First table named after FROM, if any.
pub fn extract_table_name(sql: &str) -> Option<String> {
    from_table_regex()
        .captures(sql)
        .map(|captures| captures[1].to_string())
}

/// Column inside `COUNT(DISTINCT <col>)`, if present.
pub fn distinct_count_column(sql: &str) -> Option<String> {
    distinct_count_regex()
        .captures(sql)
        .map(|captures| captures[1].to_string())
}

/// First identifier after GROUP BY, if present.
pub fn first_group_by_column(sql: &str) -> Option<String> {
    group_by_column_regex()
        .captures(sql)
        .map(|captures| captures[1].to_string())
}

/// Text following `keyword` up to the next clause keyword in
/// `terminators` (or a statement terminator, or end of input).
///
/// Keyword and terminator matches are whole-word, so a terminator like
/// `ORDER` does not fire inside an identifier such as `orders`. This
/// replaces a character-class construct in an earlier incarnation of this
/// scanner that only accidentally worked; the intent is "everything up to
/// the next clause keyword", so that is what gets scanned.
pub fn clause_text<'a>(sql: &'a str, keyword: &str, terminators: &[&str]) -> Option<&'a str> {
    let upper = sql.to_ascii_uppercase();
    let start = find_word(&upper, keyword)? + keyword.len();
    let rest = &upper[start..];

    let mut end = rest.len();
    for terminator in terminators {
        if let Some(pos) = find_word(rest, terminator) {
            end = end.min(pos);
        }
    }
    if let Some(pos) = rest.find(';') {
        end = end.min(pos);
    }
    Some(sql[start..start + end].trim())
}

/// First whole-word occurrence of `needle` in already-uppercased text.
fn find_word(upper: &str, needle: &str) -> Option<usize> {
    let bytes = upper.as_bytes();
    let mut from = 0;
    while let Some(pos) = upper[from..].find(needle) {
        let at = from + pos;
        let end = at + needle.len();
        let before_ok = at == 0 || !is_word_byte(bytes[at - 1]);
        let after_ok = end >= bytes.len() || !is_word_byte(bytes[end]);
        if before_ok && after_ok {
            return Some(at);
        }
        from = at + 1;
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Extract structural features without touching the store. Table size is
/// left at zero.
pub fn extract_features(sql: &str, error_tolerance: f64) -> QueryFeatures {
    let upper = sql.to_ascii_uppercase();

    let mut features = QueryFeatures {
        table_name: extract_table_name(sql).unwrap_or_default(),
        error_tolerance,
        query_length: sql.len(),
        has_count: upper.contains("COUNT"),
        has_sum: upper.contains("SUM"),
        has_avg: upper.contains("AVG"),
        has_distinct: upper.contains("DISTINCT"),
        has_group_by: upper.contains("GROUP BY"),
        ..Default::default()
    };

    if features.has_group_by {
        features.group_by_cardinality =
            clause_text(sql, "GROUP BY", &["HAVING", "ORDER", "LIMIT"])
                .map(|clause| {
                    clause
                        .split(',')
                        .filter(|column| !column.trim().is_empty())
                        .count()
                })
                .unwrap_or(0);
    }

    if let Some(where_clause) = clause_text(sql, "WHERE", &["GROUP", "ORDER", "LIMIT"]) {
        let upper_clause = where_clause.to_ascii_uppercase();
        features.where_complexity =
            upper_clause.matches(" AND ").count() + upper_clause.matches(" OR ").count();
    }

    features
}

/// Extract features and probe the table size with a short deadline. A
/// failed probe leaves the size at zero, which steers selection toward
/// the exact path.
pub async fn extract_features_sized(db: &Db, sql: &str, error_tolerance: f64) -> QueryFeatures {
    let mut features = extract_features(sql, error_tolerance);

    if !features.table_name.is_empty() {
        let table = features.table_name.clone();
        let probe = db
            .call(SIZE_PROBE_DEADLINE, "table size probe", move |conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .await;
        match probe {
            Ok(size) => features.table_size = size,
            Err(err) => {
                tracing::debug!(table = %features.table_name, error = %err, "size probe failed");
            }
        }
    }

    features
}
