/// Confidence-interval estimators for scaled sample aggregates
///
/// Analytic intervals for COUNT and SUM, percentile-bootstrap intervals
/// from raw sample values, and the statistical-bounds surface attached to
/// query responses.
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Confidence-interval result for a single scaled estimate.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CiResult {
    pub estimate: f64,
    pub std_error: f64,
    pub confidence_level: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub sample_fraction: f64,
    pub relative_error: f64,
}

/// Two-sided z-score for a confidence level. The three standard levels
/// are mapped exactly; anything else defaults to 95%.
pub fn z_score(confidence: f64) -> f64 {
    if (confidence - 0.90).abs() < 1e-9 {
        1.6448536269514722
    } else if (confidence - 0.99).abs() < 1e-9 {
        2.5758293035489004
    } else {
        1.959963984540054
    }
}

/// Analytic CI for a COUNT(*) scaled from a uniform sample.
///
/// `count_hat = count_sample / f`; the sample count is approximately
/// binomial, `Var ~= N*f*(1-f)`, with the scaled estimate standing in for
/// the unknown N.
pub fn count_ci(count_sample: i64, fraction: f64, confidence: f64) -> CiResult {
    let estimate = count_sample as f64 / fraction;
    let variance = estimate * fraction * (1.0 - fraction);
    let std_error = variance.sqrt() / fraction;
    interval(estimate, std_error, fraction, confidence)
}

/// Analytic CI for a SUM scaled from a uniform sample.
///
/// Treats `Var(sum_sample)` as `s^2 * n`, which assumes independent,
/// equal-variance contributions. A known simplification: prefer
/// [`bootstrap_ci`] when the raw sample values are available.
pub fn sum_ci(
    sum_sample: f64,
    sample_variance: f64,
    sample_size: usize,
    fraction: f64,
    confidence: f64,
) -> CiResult {
    let variance_of_sum = sample_variance * sample_size as f64;
    let estimate = sum_sample / fraction;
    let std_error = variance_of_sum.sqrt() / fraction;
    interval(estimate, std_error, fraction, confidence)
}

fn interval(estimate: f64, std_error: f64, fraction: f64, confidence: f64) -> CiResult {
    let z = z_score(confidence);
    let relative_error = if estimate != 0.0 {
        std_error / estimate.abs()
    } else {
        0.0
    };
    CiResult {
        estimate,
        std_error,
        confidence_level: confidence,
        ci_low: estimate - z * std_error,
        ci_high: estimate + z * std_error,
        sample_fraction: fraction,
        relative_error,
    }
}

/// Percentile-bootstrap CI for a scaled aggregate.
///
/// Draws `iterations` resamples with replacement of the full sample size,
/// applies `aggregate` and `scale` to each, and takes the `alpha/2`
/// percentile bounds. Standard error is the standard deviation of the
/// bootstrap distribution. The seed defaults to a clock-derived value;
/// tests inject one for determinism. An empty input yields a zero-width
/// result.
pub fn bootstrap_ci<F>(
    values: &[f64],
    aggregate: F,
    scale: f64,
    iterations: usize,
    confidence: f64,
    seed: Option<u64>,
) -> CiResult
where
    F: Fn(&[f64]) -> f64,
{
    if values.is_empty() || iterations == 0 {
        return CiResult::default();
    }

    let seed = seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });
    let mut rng = StdRng::seed_from_u64(seed);

    let n = values.len();
    let original = aggregate(values) * scale;

    let mut estimates = Vec::with_capacity(iterations);
    let mut resample = vec![0.0; n];
    for _ in 0..iterations {
        for slot in resample.iter_mut() {
            *slot = values[rng.gen_range(0..n)];
        }
        estimates.push(aggregate(&resample) * scale);
    }
    estimates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let alpha = 1.0 - confidence;
    let lower_idx = ((iterations as f64 * alpha / 2.0).floor() as usize).min(iterations - 1);
    let upper_idx = ((iterations as f64 * (1.0 - alpha / 2.0)).ceil() as usize)
        .saturating_sub(1)
        .min(iterations - 1);

    let mean = estimates.iter().sum::<f64>() / iterations as f64;
    let variance = if iterations > 1 {
        estimates.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / (iterations - 1) as f64
    } else {
        0.0
    };
    let std_error = variance.sqrt();
    let relative_error = if original != 0.0 {
        std_error / original.abs()
    } else {
        0.0
    };

    CiResult {
        estimate: original,
        std_error,
        confidence_level: confidence,
        ci_low: estimates[lower_idx],
        ci_high: estimates[upper_idx],
        sample_fraction: if scale != 0.0 { 1.0 / scale } else { 0.0 },
        relative_error,
    }
}

/// Sum aggregator for bootstrap input.
pub fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

/// Mean aggregator for bootstrap input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Statistical bounds attached to approximate query responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatisticalBounds {
    pub relative_error: f64,
    pub absolute_error: f64,
    pub confidence_interval: CiResult,
    pub sample_size: i64,
    pub population_size: i64,
    pub sampling_method: String,
    pub variance_estimate: f64,
}

/// Analytic error bounds for an aggregate computed over a uniform sample,
/// used when raw sample vectors are not available for the bootstrap.
pub fn estimate_error_bounds(
    sample_value: f64,
    sample_size: i64,
    population_size: i64,
    sampling_fraction: f64,
    aggregation: &str,
    confidence: f64,
) -> StatisticalBounds {
    let mut relative_error = sampling_relative_error(sample_size, sampling_fraction);
    let mut variance = aggregate_variance(sample_value, sample_size, aggregation);

    // Finite-population correction once the sample covers a visible share.
    if population_size > 0 && sampling_fraction > 0.05 && population_size > 1 {
        let fpc = ((population_size - sample_size.max(0)) as f64 / (population_size - 1) as f64)
            .max(0.0)
            .sqrt();
        variance *= fpc * fpc;
        relative_error *= fpc;
    }

    let std_error = variance.sqrt();
    let margin = z_score(confidence) * std_error;
    let confidence_interval = CiResult {
        estimate: sample_value,
        std_error,
        confidence_level: confidence,
        ci_low: (sample_value - margin).max(0.0),
        ci_high: sample_value + margin,
        sample_fraction: sampling_fraction,
        relative_error,
    };

    StatisticalBounds {
        relative_error,
        absolute_error: sample_value * relative_error,
        confidence_interval,
        sample_size,
        population_size,
        sampling_method: "uniform_random".to_string(),
        variance_estimate: variance,
    }
}

/// Relative error from sample size and fraction, clamped to
/// `[0.005, 0.50]`.
fn sampling_relative_error(sample_size: i64, sampling_fraction: f64) -> f64 {
    if sample_size <= 1 {
        return 0.5;
    }
    let effective = (sample_size as f64).max(30.0);
    let mut error = 1.0 / effective.sqrt();
    if sampling_fraction > 0.0 && sampling_fraction < 1.0 {
        error *= 1.0 + (1.0 - sampling_fraction) * 0.5;
    }
    error.clamp(0.005, 0.50)
}

/// Variance estimate shaped by the aggregation kind.
fn aggregate_variance(sample_value: f64, sample_size: i64, aggregation: &str) -> f64 {
    if sample_size <= 1 {
        return sample_value * sample_value;
    }
    let base = sample_value * sample_value / sample_size as f64;
    match aggregation {
        "COUNT" => sample_value.max(1.0) / sample_size as f64,
        "SUM" => base * 2.0,
        "AVG" => base * 0.5,
        "DISTINCT" => base * 3.0,
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_score_levels() {
        assert!((z_score(0.90) - 1.645).abs() < 1e-3);
        assert!((z_score(0.95) - 1.960).abs() < 1e-3);
        assert!((z_score(0.99) - 2.576).abs() < 1e-3);
        // Unknown levels default to 95%.
        assert_eq!(z_score(0.42), z_score(0.95));
    }

    #[test]
    fn test_count_ci_scales_and_brackets() {
        let ci = count_ci(500, 0.05, 0.95);
        assert!((ci.estimate - 10_000.0).abs() < 1e-9);
        assert!(ci.ci_low < ci.estimate && ci.estimate < ci.ci_high);
        assert!(ci.relative_error > 0.0);
    }

    #[test]
    fn test_sum_ci_scales() {
        let ci = sum_ci(1_000.0, 25.0, 400, 0.1, 0.95);
        assert!((ci.estimate - 10_000.0).abs() < 1e-9);
        // SE = sqrt(25 * 400) / 0.1 = 1000.
        assert!((ci.std_error - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_bootstrap_deterministic_with_seed() {
        let values: Vec<f64> = (0..200).map(|i| (i % 17) as f64).collect();
        let a = bootstrap_ci(&values, sum, 20.0, 300, 0.95, Some(7));
        let b = bootstrap_ci(&values, sum, 20.0, 300, 0.95, Some(7));
        assert_eq!(a.ci_low, b.ci_low);
        assert_eq!(a.ci_high, b.ci_high);
    }

    #[test]
    fn test_bootstrap_brackets_estimate() {
        let values: Vec<f64> = (0..500).map(|i| ((i * 31) % 100) as f64).collect();
        let ci = bootstrap_ci(&values, sum, 10.0, 300, 0.95, Some(42));
        assert!((ci.estimate - sum(&values) * 10.0).abs() < 1e-9);
        assert!(ci.ci_low <= ci.estimate && ci.estimate <= ci.ci_high);
        assert!(ci.relative_error > 0.0 && ci.relative_error < 0.5);
    }

    #[test]
    fn test_bootstrap_empty_input_is_zero_width() {
        let ci = bootstrap_ci(&[], sum, 10.0, 300, 0.95, Some(1));
        assert_eq!(ci.estimate, 0.0);
        assert_eq!(ci.ci_low, ci.ci_high);
    }

    #[test]
    fn test_bootstrap_covers_population_sum() {
        // A 10% systematic sample whose per-residue coverage matches the
        // population, so the scaled estimate is unbiased and the 95%
        // interval must cover the true sum.
        let population: Vec<f64> = (0..10_000).map(|i| (i % 10) as f64).collect();
        let true_sum: f64 = population.iter().sum();
        let sample: Vec<f64> = (0..1_000).map(|j| (j % 10) as f64).collect();
        let ci = bootstrap_ci(&sample, sum, 10.0, 300, 0.95, Some(99));
        assert!(
            ci.ci_low <= true_sum && true_sum <= ci.ci_high,
            "interval [{}, {}] misses {}",
            ci.ci_low,
            ci.ci_high,
            true_sum
        );
    }

    #[test]
    fn test_error_bounds_shrink_with_sample_size() {
        let small = estimate_error_bounds(1_000.0, 50, 100_000, 0.0005, "SUM", 0.95);
        let large = estimate_error_bounds(1_000.0, 5_000, 100_000, 0.05, "SUM", 0.95);
        assert!(large.relative_error < small.relative_error);
        assert!(small.relative_error <= 0.50);
        assert!(large.relative_error >= 0.005);
    }
}
