/// SQL rewriting helpers shared by the planner and the JOIN specializer
use regex::Regex;

/// Subquery that stands in for a table reference under sampling:
/// `(SELECT * FROM <table> ORDER BY random() LIMIT <k>) AS <alias>`.
pub fn sample_subquery(table: &str, limit: i64, alias: &str) -> String {
    format!("(SELECT * FROM {table} ORDER BY random() LIMIT {limit}) AS {alias}")
}

/// Replace the first `<keyword> <table>` reference (case-insensitive,
/// whole word) with `<keyword> <replacement>`.
pub fn replace_table_ref(sql: &str, keyword: &str, table: &str, replacement: &str) -> String {
    let pattern = format!(r"(?i)\b{}\s+{}\b", regex::escape(keyword), regex::escape(table));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return sql.to_string(),
    };
    match re.find(sql) {
        Some(found) => format!(
            "{}{} {}{}",
            &sql[..found.start()],
            keyword,
            replacement,
            &sql[found.end()..]
        ),
        None => sql.to_string(),
    }
}

/// Replace every whole-word occurrence of `table` with `replacement`.
/// Used when pointing a query at a materialized sample table.
pub fn replace_all_table_refs(sql: &str, table: &str, replacement: &str) -> String {
    let pattern = format!(r"\b{}\b", regex::escape(table));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(sql, replacement).into_owned(),
        Err(_) => sql.to_string(),
    }
}
