use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed per-transaction overhead (version, locktime, counters).
pub const BASE_SIZE: u64 = 10;
/// Serialized size of a signed P2PKH input.
pub const INPUT_SIZE: u64 = 148;
/// Serialized size of a P2PKH output.
pub const OUTPUT_SIZE: u64 = 34;

/// Planning estimate of the serialized size of a transaction. Only used to gate
/// input selection, the exact size is known after signing.
pub fn estimated_size(input_count: usize, output_count: usize) -> u64 {
    BASE_SIZE + INPUT_SIZE * input_count as u64 + OUTPUT_SIZE * output_count as u64
}

/// Fee rate kept as smallest units per kilobyte, so the per-byte rate
/// `sat_per_kb / 1000` stays an exact rational.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate {
    sat_per_kb: u64,
}

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate { sat_per_kb: 0 };

    pub fn from_sat_per_kb(sat_per_kb: u64) -> Self {
        Self { sat_per_kb }
    }

    pub fn from_sat_per_byte(sat_per_byte: u64) -> Self {
        Self {
            sat_per_kb: sat_per_byte.saturating_mul(1000),
        }
    }

    pub fn sat_per_kb(&self) -> u64 {
        self.sat_per_kb
    }

    /// `ceil(size * sat_per_kb / 1000)`.
    ///
    /// Rounding up is lossless for funding checks: with integer amounts,
    /// `total >= payment + fee_for_size(size)` holds exactly when
    /// `total >= payment + size * sat_per_kb / 1000` holds over the rationals.
    pub fn fee_for_size(&self, size: u64) -> u64 {
        let scaled = size as u128 * self.sat_per_kb as u128;
        let fee = (scaled + 999) / 1000;
        u64::try_from(fee).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/kB", self.sat_per_kb)
    }
}
