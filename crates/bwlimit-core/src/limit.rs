//! Bandwidth limit value type (bytes per second, always positive).

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::{BwError, Result};

/// Bytes in one KiB, the unit administrators historically typed limits in.
pub const BYTES_PER_KIB: u64 = 1024;

/// Positive bytes-per-second ceiling.
///
/// A zero limit is unrepresentable; "unlimited" only exists for the read
/// direction and is modelled there as a plain `0` on the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct BandwidthLimit(NonZeroU64);

impl BandwidthLimit {
    /// 512 KiB/s.
    pub const DEFAULT: Self = Self(NonZeroU64::MIN.saturating_add(512 * BYTES_PER_KIB - 1));

    pub fn from_bps(bps: u64) -> Result<Self> {
        NonZeroU64::new(bps)
            .map(Self)
            .ok_or_else(|| BwError::InvalidArgument("bandwidth limit must be greater than 0".into()))
    }

    pub fn from_kbps(kbps: u64) -> Result<Self> {
        let bps = kbps
            .checked_mul(BYTES_PER_KIB)
            .ok_or_else(|| BwError::InvalidArgument(format!("bandwidth limit too large: {kbps} KiB/s")))?;
        Self::from_bps(bps)
    }

    pub fn bytes_per_sec(self) -> u64 {
        self.0.get()
    }

    /// Limit expressed in KiB/s (fractional).
    pub fn kbps(self) -> f64 {
        self.0.get() as f64 / BYTES_PER_KIB as f64
    }
}

impl TryFrom<u64> for BandwidthLimit {
    type Error = BwError;

    fn try_from(v: u64) -> Result<Self> {
        Self::from_bps(v)
    }
}

impl From<BandwidthLimit> for u64 {
    fn from(l: BandwidthLimit) -> u64 {
        l.bytes_per_sec()
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} B/s", self.0)
    }
}
