/// HyperLogLog cardinality sketch
///
/// Parameterized by `b` bits of register selection, giving `m = 2^b`
/// one-byte registers. The relative standard error is `1.04/sqrt(m)`.
use crate::error::{AqeError, AqeResult};
use crate::sketch::hash64;

/// Smallest accepted precision.
const MIN_B: u8 = 4;
/// Largest accepted precision.
const MAX_B: u8 = 16;
/// Precision used when the requested value is out of range.
const FALLBACK_B: u8 = 10;
/// Default precision for sketches built through the API (4096 registers).
pub const DEFAULT_B: u8 = 12;

/// HyperLogLog sketch over 64-bit hashed values.
#[derive(Clone, Debug, PartialEq)]
pub struct HyperLogLog {
    registers: Vec<u8>,
    b: u8,
    m: u32,
    alpha: f64,
}

impl HyperLogLog {
    /// Create a sketch with `2^b` registers. Out-of-range precision falls
    /// back to `b = 10`.
    pub fn new(b: u8) -> Self {
        let b = if (MIN_B..=MAX_B).contains(&b) {
            b
        } else {
            FALLBACK_B
        };
        let m = 1u32 << b;
        Self {
            registers: vec![0; m as usize],
            b,
            m,
            alpha: alpha_for(m),
        }
    }

    /// Register-selection precision.
    pub fn precision(&self) -> u8 {
        self.b
    }

    /// Number of registers.
    pub fn register_count(&self) -> u32 {
        self.m
    }

    /// Insert a value.
    pub fn insert(&mut self, value: &[u8]) {
        let hash = hash64(value);

        // Low b bits select the register; the remaining 64-b bits feed the
        // rank. A zero window ranks 64-b+1.
        let index = (hash & ((1u64 << self.b) - 1)) as usize;
        let window = hash >> self.b;
        let rank = (window.leading_zeros() as u8).saturating_sub(self.b) + 1;

        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Insert a string value.
    pub fn insert_str(&mut self, value: &str) {
        self.insert(value.as_bytes());
    }

    /// Estimate the number of distinct values inserted so far.
    pub fn estimate(&self) -> u64 {
        let m = self.m as f64;
        let raw = self.alpha * m * m / self.harmonic_denominator();

        // Small-range correction: linear counting while registers are
        // mostly empty.
        if raw <= 2.5 * m {
            let zeros = self.zero_register_count();
            if zeros > 0 {
                return (m * (m / zeros as f64).ln()) as u64;
            }
        }

        // Large-range correction for a 32-bit hash space, kept for
        // completeness.
        let two_pow_32 = (1u64 << 32) as f64;
        if raw <= two_pow_32 / 30.0 {
            raw as u64
        } else {
            (-two_pow_32 * (1.0 - raw / two_pow_32).ln()) as u64
        }
    }

    /// Theoretical relative standard error, `1.04/sqrt(m)`.
    pub fn standard_error(&self) -> f64 {
        1.04 / (self.m as f64).sqrt()
    }

    /// Normal-approximation confidence bounds around the estimate. The
    /// lower bound is clamped to zero.
    pub fn confidence_interval(&self, confidence: f64) -> (u64, u64) {
        let estimate = self.estimate() as f64;
        let std_err = self.standard_error() * estimate;

        let z = if (confidence - 0.90).abs() < 1e-9 {
            1.645
        } else if (confidence - 0.99).abs() < 1e-9 {
            2.576
        } else {
            1.96
        };

        let margin = z * std_err;
        let lower = (estimate - margin).max(0.0);
        (lower as u64, (estimate + margin) as u64)
    }

    /// Merge another sketch into this one by taking the element-wise
    /// register maximum. Fails when precisions differ.
    pub fn merge(&mut self, other: &HyperLogLog) -> AqeResult<()> {
        if self.b != other.b {
            return Err(AqeError::sketch(format!(
                "cannot merge HyperLogLog sketches with different precision ({} vs {})",
                self.b, other.b
            )));
        }
        for (register, &theirs) in self.registers.iter_mut().zip(&other.registers) {
            if theirs > *register {
                *register = theirs;
            }
        }
        Ok(())
    }

    /// Serialize as `[b:1][m:4 LE][registers:m]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(5 + self.registers.len());
        data.push(self.b);
        data.extend_from_slice(&self.m.to_le_bytes());
        data.extend_from_slice(&self.registers);
        data
    }

    /// Deserialize, validating the framed length.
    pub fn from_bytes(data: &[u8]) -> AqeResult<Self> {
        if data.len() < 5 {
            return Err(AqeError::sketch("insufficient data for HyperLogLog"));
        }
        let b = data[0];
        let m = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        if data.len() != 5 + m as usize {
            return Err(AqeError::sketch(format!(
                "HyperLogLog length mismatch: expected {}, got {}",
                5 + m,
                data.len()
            )));
        }
        let mut hll = HyperLogLog::new(b);
        if hll.m != m {
            return Err(AqeError::sketch("HyperLogLog header is inconsistent"));
        }
        hll.registers.copy_from_slice(&data[5..]);
        Ok(hll)
    }

    fn harmonic_denominator(&self) -> f64 {
        self.registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum()
    }

    fn zero_register_count(&self) -> u32 {
        self.registers.iter().filter(|&&r| r == 0).count() as u32
    }
}

fn alpha_for(m: u32) -> f64 {
    match m {
        m if m >= 128 => 0.7213 / (1.0 + 1.079 / m as f64),
        m if m >= 64 => 0.709,
        m if m >= 32 => 0.697,
        m if m >= 16 => 0.673,
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_precision_falls_back() {
        assert_eq!(HyperLogLog::new(3).precision(), 10);
        assert_eq!(HyperLogLog::new(17).precision(), 10);
        assert_eq!(HyperLogLog::new(4).precision(), 4);
        assert_eq!(HyperLogLog::new(16).precision(), 16);
    }

    #[test]
    fn test_small_cardinality_is_near_exact() {
        let mut hll = HyperLogLog::new(DEFAULT_B);
        for i in 0..20 {
            hll.insert_str(&format!("value-{i}"));
        }
        let estimate = hll.estimate();
        assert!((18..=22).contains(&estimate), "estimate {estimate}");
    }

    #[test]
    fn test_estimate_within_error_bound() {
        let mut hll = HyperLogLog::new(DEFAULT_B);
        let n = 50_000u64;
        for i in 0..n {
            hll.insert_str(&format!("user-{i}"));
        }
        let estimate = hll.estimate() as f64;
        let rel_error = (estimate - n as f64).abs() / n as f64;
        // 3 sigma of the theoretical standard error.
        assert!(
            rel_error <= 3.0 * hll.standard_error(),
            "relative error {rel_error}"
        );
    }

    #[test]
    fn test_duplicates_do_not_inflate() {
        let mut hll = HyperLogLog::new(DEFAULT_B);
        for _ in 0..1000 {
            hll.insert_str("same");
        }
        assert_eq!(hll.estimate(), 1);
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let mut a = HyperLogLog::new(10);
        let mut b = HyperLogLog::new(10);
        for i in 0..500 {
            a.insert_str(&format!("a-{i}"));
        }
        for i in 0..500 {
            b.insert_str(&format!("b-{i}"));
        }

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab, ba);

        // Merging a sketch into itself leaves the registers unchanged.
        let mut aa = a.clone();
        aa.merge(&a).unwrap();
        assert_eq!(aa, a);
    }

    #[test]
    fn test_merge_rejects_mismatched_precision() {
        let mut a = HyperLogLog::new(10);
        let b = HyperLogLog::new(12);
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut hll = HyperLogLog::new(DEFAULT_B);
        for i in 0..10_000 {
            hll.insert_str(&format!("key-{i}"));
        }
        let restored = HyperLogLog::from_bytes(&hll.to_bytes()).unwrap();
        assert_eq!(restored, hll);
    }

    #[test]
    fn test_deserialize_rejects_bad_lengths() {
        assert!(HyperLogLog::from_bytes(&[12, 0]).is_err());
        let mut data = HyperLogLog::new(10).to_bytes();
        data.pop();
        assert!(HyperLogLog::from_bytes(&data).is_err());
    }

    #[test]
    fn test_confidence_interval_brackets_estimate() {
        let mut hll = HyperLogLog::new(DEFAULT_B);
        for i in 0..10_000 {
            hll.insert_str(&format!("key-{i}"));
        }
        let estimate = hll.estimate();
        for confidence in [0.90, 0.95, 0.99] {
            let (lower, upper) = hll.confidence_interval(confidence);
            assert!(lower <= estimate && estimate <= upper);
        }
    }
}
