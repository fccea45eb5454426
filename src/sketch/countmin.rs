/// Count-Min frequency sketch
///
/// Parameterized by `(epsilon, delta)`: estimates overcount by at most
/// `epsilon * total_count` with probability `1 - delta`. Width is
/// `ceil(e/epsilon)`, depth `ceil(ln(1/delta))`.
use std::hash::Hasher;

use fxhash::FxHasher;

use crate::error::{AqeError, AqeResult};

/// Value used for either parameter when the requested one is outside (0,1).
const FALLBACK_PARAMETER: f64 = 0.01;

/// Count-Min sketch with `d x w` unsigned counters, stored row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct CountMinSketch {
    counters: Vec<u64>,
    d: u32,
    w: u32,
    epsilon: f64,
    delta: f64,
    total: u64,
}

impl CountMinSketch {
    /// Create a sketch for the given error bound and failure probability.
    /// Parameters outside `(0, 1)` are replaced with 0.01.
    pub fn new(epsilon: f64, delta: f64) -> Self {
        let epsilon = if epsilon > 0.0 && epsilon < 1.0 {
            epsilon
        } else {
            FALLBACK_PARAMETER
        };
        let delta = if delta > 0.0 && delta < 1.0 {
            delta
        } else {
            FALLBACK_PARAMETER
        };

        let w = (std::f64::consts::E / epsilon).ceil() as u32;
        let d = (1.0 / delta).ln().ceil() as u32;

        Self {
            counters: vec![0; (d as usize) * (w as usize)],
            d,
            w,
            epsilon,
            delta,
            total: 0,
        }
    }

    /// Depth (number of hash rows).
    pub fn depth(&self) -> u32 {
        self.d
    }

    /// Width (counters per row).
    pub fn width(&self) -> u32 {
        self.w
    }

    /// Increment the count for `key` by `delta`.
    pub fn add(&mut self, key: &[u8], delta: u64) {
        for row in 0..self.d {
            let column = self.column_for(key, row);
            self.counters[(row * self.w + column) as usize] += delta;
        }
        self.total += delta;
    }

    /// Increment the count for a string key.
    pub fn add_str(&mut self, key: &str, delta: u64) {
        self.add(key.as_bytes(), delta);
    }

    /// Estimate the count for `key`: the minimum over the d candidate
    /// cells. Never underestimates.
    pub fn query(&self, key: &[u8]) -> u64 {
        (0..self.d)
            .map(|row| {
                let column = self.column_for(key, row);
                self.counters[(row * self.w + column) as usize]
            })
            .min()
            .unwrap_or(0)
    }

    /// Estimate the count for a string key.
    pub fn query_str(&self, key: &str) -> u64 {
        self.query(key.as_bytes())
    }

    /// Total count of all additions.
    pub fn total_count(&self) -> u64 {
        self.total
    }

    /// Additive error bound: `epsilon * total_count`.
    pub fn error_bound(&self) -> u64 {
        (self.epsilon * self.total as f64) as u64
    }

    /// Probability the error bound holds: `1 - delta`.
    pub fn confidence(&self) -> f64 {
        1.0 - self.delta
    }

    /// Counter values above `threshold`. Cells are candidates only; the
    /// sketch does not track which keys produced them.
    pub fn heavy_cells(&self, threshold: u64) -> Vec<u64> {
        let mut cells: Vec<u64> = self
            .counters
            .iter()
            .copied()
            .filter(|&count| count > threshold)
            .collect();
        cells.sort_unstable();
        cells.dedup();
        cells
    }

    /// Merge another sketch into this one by cell-wise addition. Fails
    /// when dimensions differ.
    pub fn merge(&mut self, other: &CountMinSketch) -> AqeResult<()> {
        if self.d != other.d || self.w != other.w {
            return Err(AqeError::sketch(format!(
                "cannot merge Count-Min sketches with different dimensions ({}x{} vs {}x{})",
                self.d, self.w, other.d, other.w
            )));
        }
        for (cell, &theirs) in self.counters.iter_mut().zip(&other.counters) {
            *cell += theirs;
        }
        self.total += other.total;
        Ok(())
    }

    /// Serialize as
    /// `[d:4][w:4][epsilon:8 f64 bits][delta:8][total:8][counters d*w*8]`,
    /// all little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + self.counters.len() * 8);
        data.extend_from_slice(&self.d.to_le_bytes());
        data.extend_from_slice(&self.w.to_le_bytes());
        data.extend_from_slice(&self.epsilon.to_bits().to_le_bytes());
        data.extend_from_slice(&self.delta.to_bits().to_le_bytes());
        data.extend_from_slice(&self.total.to_le_bytes());
        for counter in &self.counters {
            data.extend_from_slice(&counter.to_le_bytes());
        }
        data
    }

    /// Deserialize, validating the framed length.
    pub fn from_bytes(data: &[u8]) -> AqeResult<Self> {
        if data.len() < 32 {
            return Err(AqeError::sketch("insufficient data for Count-Min sketch"));
        }

        let d = u32::from_le_bytes(data[0..4].try_into().expect("sized slice"));
        let w = u32::from_le_bytes(data[4..8].try_into().expect("sized slice"));
        let epsilon = f64::from_bits(u64::from_le_bytes(
            data[8..16].try_into().expect("sized slice"),
        ));
        let delta = f64::from_bits(u64::from_le_bytes(
            data[16..24].try_into().expect("sized slice"),
        ));
        let total = u64::from_le_bytes(data[24..32].try_into().expect("sized slice"));

        let cell_count = (d as usize) * (w as usize);
        let expected = 32 + cell_count * 8;
        if data.len() != expected {
            return Err(AqeError::sketch(format!(
                "Count-Min length mismatch: expected {expected}, got {}",
                data.len()
            )));
        }

        let mut counters = Vec::with_capacity(cell_count);
        for chunk in data[32..].chunks_exact(8) {
            counters.push(u64::from_le_bytes(chunk.try_into().expect("sized chunk")));
        }

        Ok(Self {
            counters,
            d,
            w,
            epsilon,
            delta,
            total,
        })
    }

    /// Row hashes are derived by salting the base hash with the row index.
    fn column_for(&self, key: &[u8], row: u32) -> u32 {
        let mut hasher = FxHasher::default();
        hasher.write(key);
        hasher.write_u32(row);
        (hasher.finish() % self.w as u64) as u32
    }
}
