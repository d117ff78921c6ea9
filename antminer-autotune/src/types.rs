//! Measurement types shared across the daemon.

use std::fmt;

/// Hashrate measurement in hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct HashRate(pub u64);

impl HashRate {
    /// Create from gigahashes per second, the unit cgminer reports in.
    pub fn from_gigahashes(gh: f64) -> Self {
        Self((gh.max(0.0) * 1e9) as u64)
    }

    /// Create from terahashes per second
    pub fn from_terahashes(th: f64) -> Self {
        Self((th.max(0.0) * 1e12) as u64)
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Format with the largest unit that keeps the value at or above one.
    pub fn to_human_readable(&self) -> String {
        const UNITS: [(u64, &str); 4] = [
            (1_000_000_000_000_000, "PH/s"),
            (1_000_000_000_000, "TH/s"),
            (1_000_000_000, "GH/s"),
            (1_000_000, "MH/s"),
        ];

        UNITS
            .iter()
            .find(|(scale, _)| self.0 >= *scale)
            .map(|(scale, unit)| format!("{:.2} {}", self.0 as f64 / *scale as f64, unit))
            .unwrap_or_else(|| format!("{} H/s", self.0))
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}
