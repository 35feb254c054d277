//! Approximate distinct counting for unique viewers.
//!
//! The Redis tier uses `PFADD`/`PFCOUNT`; the in-memory tier uses this
//! HyperLogLog. Both only promise an estimate.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Registers are `2^DEFAULT_PRECISION` bytes per product.
pub const DEFAULT_PRECISION: u8 = 12;

/// A probabilistic set: `add` members, read an approximate count.
#[derive(Debug, Clone)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
    alpha: f64,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION)
    }
}

impl HyperLogLog {
    /// `precision` is clamped to `4..=16`.
    #[must_use]
    pub fn new(precision: u8) -> Self {
        let precision = precision.clamp(4, 16);
        let m = 1usize << precision;
        let alpha = match m {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m as f64),
        };
        Self {
            precision,
            registers: vec![0; m],
            alpha,
        }
    }

    /// Returns true if a register changed (mirrors `PFADD`'s reply).
    pub fn add<T: Hash + ?Sized>(&mut self, member: &T) -> bool {
        let mut hasher = DefaultHasher::new();
        member.hash(&mut hasher);
        let hash = hasher.finish();

        let index = (hash >> (64 - self.precision)) as usize;
        let rank = ((hash << self.precision) | (1 << (self.precision - 1))).leading_zeros() as u8 + 1;

        if rank > self.registers[index] {
            self.registers[index] = rank;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn approximate_count(&self) -> u64 {
        let m = self.registers.len() as f64;
        let sum: f64 = self.registers.iter().map(|&r| 2.0_f64.powi(-(r as i32))).sum();
        let raw = self.alpha * m * m / sum;

        let estimate = if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                m * (m / zeros as f64).ln()
            } else {
                raw
            }
        } else {
            raw
        };

        estimate.round() as u64
    }

    pub fn merge(&mut self, other: &HyperLogLog) {
        if self.precision != other.precision {
            return;
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            *mine = (*mine).max(*theirs);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }
}
