//! Rate validation and kernel capability detection.
//!
//! Rates are kilobits per second. Zero means "unlimited" and is rewritten to
//! the maximum rate the kernel can express, which depends on whether the tc
//! rate tables are 64-bit on this system.

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::info;

use crate::tc::TcRunner;

/// Maximum rate expressible with 32-bit rate tables, in Kb/s.
pub const MAX_RATE_32: i64 = 4_194_303;

/// Maximum rate used when 64-bit rate tables are available, in Kb/s.
pub const MAX_RATE_64: i64 = 4_194_303;

/// Snapshot of what the local traffic-control stack supports.
#[derive(Debug, Clone, Serialize)]
pub struct SystemCapabilities {
    pub supports_64bit_rates: bool,
    pub maximum_rate_kbps: i64,
    pub scheduler_type: String,
}

/// Returns the rate ceiling for the detected feature level.
pub fn max_rate(supports_64bit: bool) -> i64 {
    if supports_64bit {
        MAX_RATE_64
    } else {
        MAX_RATE_32
    }
}

/// Bounds-checks a requested rate and rewrites 0 to the ceiling.
pub fn validate_rate(rate_kbps: i64, supports_64bit: bool) -> Result<i64> {
    if rate_kbps < 0 {
        bail!("rate cannot be negative");
    }

    let ceiling = max_rate(supports_64bit);

    if rate_kbps == 0 {
        return Ok(ceiling);
    }
    if rate_kbps > ceiling {
        bail!("rate {rate_kbps} exceeds maximum supported rate {ceiling}");
    }

    Ok(rate_kbps)
}

/// Probes whether the kernel accepts rates beyond the 32-bit ceiling.
///
/// A throwaway HTB class is added on the loopback device with a rate one
/// step past the 32-bit maximum. Any non-zero exit means the rate tables are
/// 32-bit; error-message sniffing is too fragile to rely on.
pub async fn detect_64bit_support(tc: &TcRunner) -> bool {
    let test_rate_bits = (MAX_RATE_32 + 1) * 1000;
    let rate = format!("{test_rate_bits}bit");

    let probe = tc
        .tc(&[
            "class", "add", "dev", "lo", "parent", "1:", "classid", "1:999", "htb", "rate", &rate,
        ])
        .await;

    // Remove the test class no matter how the probe went.
    let _ = tc
        .tc(&["class", "del", "dev", "lo", "classid", "1:999"])
        .await;

    let supported = matches!(probe, Ok(output) if output.success);
    if supported {
        info!("detected 64-bit rate limit support");
    } else {
        info!("detected 32-bit rate limit support");
    }

    supported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_rate_rejected() {
        assert!(validate_rate(-1, false).is_err());
        assert!(validate_rate(i64::MIN, true).is_err());
    }

    #[test]
    fn test_zero_becomes_ceiling() {
        assert_eq!(validate_rate(0, false).unwrap(), MAX_RATE_32);
        assert_eq!(validate_rate(0, true).unwrap(), MAX_RATE_64);
    }

    #[test]
    fn test_in_range_rates_pass_through() {
        for rate in [1, 1000, 50_000, MAX_RATE_32] {
            assert_eq!(validate_rate(rate, false).unwrap(), rate);
        }
    }

    #[test]
    fn test_over_ceiling_rejected() {
        assert!(validate_rate(MAX_RATE_32 + 1, false).is_err());
        assert!(validate_rate(MAX_RATE_64 + 1, true).is_err());
    }

    #[test]
    fn test_capabilities_serialize() {
        let caps = SystemCapabilities {
            supports_64bit_rates: false,
            maximum_rate_kbps: MAX_RATE_32,
            scheduler_type: "htb".into(),
        };
        let json = serde_json::to_string(&caps).unwrap();
        assert!(json.contains("\"supports_64bit_rates\":false"));
        assert!(json.contains("\"maximum_rate_kbps\":4194303"));
    }
}
