/// Sample materialization: uniform and stratified builders plus the
/// fraction-name encoding shared with the plan rewriter.
///
/// Sample tables are named `<base>__sample_<fraction>` (uniform) or
/// `<base>__strat_sample_<column>_<fraction>` (stratified). The name is the
/// only way a later query is recognized as targeting a sample, so the
/// encoding has to round-trip.
pub mod stratified;
pub mod uniform;

pub use stratified::{create_stratified_sample, StratumAllocation};
pub use uniform::create_uniform_sample;

/// Marker between the base-table name and a uniform sample fraction.
pub const UNIFORM_MARKER: &str = "__sample_";
/// Marker between the base-table name and a stratified column + fraction.
pub const STRATIFIED_MARKER: &str = "__strat_sample_";

/// Encode a fraction as a table-name-safe suffix.
///
/// Decimal form with 3 digits (6 when the fraction is below 0.001),
/// `.` becomes `_`, trailing zeros are stripped keeping at least one, and
/// the `0_` prefix is guaranteed. Should the result ever exceed 12
/// characters, a mantissa-exponent form is used with `+` -> `p`, `-` ->
/// `m`, `.` -> `_`.
pub fn fraction_name(fraction: f64) -> String {
    if fraction <= 0.0 {
        return "0_000".to_string();
    }

    let precision = if fraction < 0.001 { 6 } else { 3 };
    let mut name = format!("{fraction:.precision$}").replacen('.', "_", 1);
    name = name.trim_end_matches('0').to_string();
    if name.ends_with('_') {
        name.push('0');
    }

    if name.len() > 12 {
        let exponent = fraction.log10().trunc() as i32;
        let mantissa = fraction / 10f64.powi(exponent);
        name = format!("{mantissa:.2}E{exponent}")
            .replace('.', "_")
            .replace('+', "p")
            .replace('-', "m");
    }

    if !name.starts_with("0_") {
        name = format!("0_{name}");
    }
    name
}

/// Decode a fraction suffix produced by [`fraction_name`].
pub fn decode_fraction(name: &str) -> Option<f64> {
    if name.contains('E') {
        return decode_mantissa_form(name).or_else(|| {
            // A mantissa form at or above 1.0 gets double-prefixed by the
            // encoder; strip the extra "0_" and retry.
            name.strip_prefix("0_").and_then(decode_mantissa_form)
        });
    }
    let decimal = name.replacen('_', ".", 1);
    decimal.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn decode_mantissa_form(name: &str) -> Option<f64> {
    let (mantissa_part, exponent_part) = name.split_once('E')?;
    let mantissa: f64 = mantissa_part.replacen('_', ".", 1).parse().ok()?;
    let exponent: i32 = exponent_part
        .replace('p', "+")
        .replace('m', "-")
        .parse()
        .ok()?;
    Some(mantissa * 10f64.powi(exponent))
}

/// Recognize a sample-table name, returning the base table and the decoded
/// fraction.
pub fn parse_sample_table_name(table: &str) -> Option<(String, f64)> {
    if let Some(idx) = table.find(STRATIFIED_MARKER) {
        let base = &table[..idx];
        let rest = &table[idx + STRATIFIED_MARKER.len()..];
        // The suffix is "<column>_<fraction>"; the fraction always starts
        // with "0_", so split at the rightmost "_0_".
        let split = rest.rfind("_0_")?;
        let fraction = decode_fraction(&rest[split + 1..])?;
        return Some((base.to_string(), fraction));
    }

    if let Some(idx) = table.find(UNIFORM_MARKER) {
        let base = &table[..idx];
        let fraction = decode_fraction(&table[idx + UNIFORM_MARKER.len()..])?;
        return Some((base.to_string(), fraction));
    }

    None
}

/// Name of the uniform sample table for a base table and fraction.
pub fn uniform_sample_table_name(table: &str, fraction: f64) -> String {
    format!("{table}{UNIFORM_MARKER}{}", fraction_name(fraction))
}

/// Name of the stratified sample table for a base table, strata column,
/// and total fraction.
pub fn stratified_sample_table_name(table: &str, strata_column: &str, fraction: f64) -> String {
    format!(
        "{table}{STRATIFIED_MARKER}{strata_column}_{}",
        fraction_name(fraction)
    )
}

/// SQLite expression producing a uniform value in [0, 1).
pub(crate) const RANDOM_UNIFORM: &str = "(abs(random()) / 9223372036854775807.0)";
