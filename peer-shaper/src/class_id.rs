//! Stable TC class identifiers derived from peer identities.
//!
//! A class ID in TC is a 16-bit hexadecimal number under the root handle.
//! The first three hex digits come from an FNV-1a hash of the peer identity
//! (so the same peer always lands in the same class) and the last digit
//! disambiguates direction: 1 for upload, 2 for download.

use std::hash::Hasher;

use anyhow::{bail, Context, Result};
use fnv::FnvHasher;

/// Shaping direction for a peer class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn suffix(self) -> char {
        match self {
            Direction::Upload => '1',
            Direction::Download => '2',
        }
    }
}

/// Hashes a peer identity into a 12-bit class base.
pub fn peer_class_base(peer: &str) -> u16 {
    let mut hasher = FnvHasher::default();
    hasher.write(peer.as_bytes());
    (hasher.finish() % 0xfff) as u16
}

/// Renders the class ID for a peer and direction, e.g. `1:a3c1`.
pub fn class_id(peer: &str, direction: Direction) -> Result<String> {
    let rendered = format!("1:{:x}{}", peer_class_base(peer), direction.suffix());
    normalize_class_id(&rendered)
}

/// Normalizes a `handle:number` class ID to a 4-hex-digit class number.
///
/// The rendered form can come out with fewer digits when the hashed base is
/// small; tc compares class IDs numerically, so everything is reparsed as hex
/// and reformatted before a command is issued.
pub fn normalize_class_id(class_id: &str) -> Result<String> {
    let Some((handle, number)) = class_id.split_once(':') else {
        bail!("invalid class ID format: must be in format 'handle:number'");
    };

    let number = u32::from_str_radix(number, 16)
        .with_context(|| format!("invalid class number in {class_id}"))?;
    if number > 0xffff {
        bail!("class number in {class_id} exceeds 16 bits");
    }

    Ok(format!("{handle}:{number:04x}"))
}

/// The form tc itself prints in `class show` output: hex without leading
/// zeros. Needed when scanning command output for a class.
pub fn display_form(class_id: &str) -> Result<String> {
    let Some((handle, number)) = class_id.split_once(':') else {
        bail!("invalid class ID format: must be in format 'handle:number'");
    };
    let number = u32::from_str_radix(number, 16)
        .with_context(|| format!("invalid class number in {class_id}"))?;
    Ok(format!("{handle}:{number:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let peer = "hIzP1Pd8U0Bw6BGPhLKYN5oBGzkRg3Av3TXrP2C1CH4=";
        let first = peer_class_base(peer);
        for _ in 0..10 {
            assert_eq!(peer_class_base(peer), first);
        }
        assert_eq!(
            class_id(peer, Direction::Upload).unwrap(),
            class_id(peer, Direction::Upload).unwrap()
        );
    }

    #[test]
    fn test_base_stays_within_12_bits() {
        for i in 0..500 {
            let base = peer_class_base(&format!("peer-{i}"));
            assert!(base < 0xfff, "base {base:#x} out of range");
        }
    }

    #[test]
    fn test_directions_differ_only_in_suffix() {
        let up = class_id("some-peer", Direction::Upload).unwrap();
        let down = class_id("some-peer", Direction::Download).unwrap();
        assert_ne!(up, down);
        assert_eq!(up[..up.len() - 1], down[..down.len() - 1]);
        assert!(up.ends_with('1'));
        assert!(down.ends_with('2'));
    }

    #[test]
    fn test_normalized_format() {
        for i in 0..200 {
            let peer = format!("test-peer-{i}");
            for direction in [Direction::Upload, Direction::Download] {
                let id = class_id(&peer, direction).unwrap();
                assert!(id.starts_with("1:"));
                let digits = &id[2..];
                assert_eq!(digits.len(), 4, "{id} should have a 4-digit class number");
                assert!(digits.chars().all(|c| c.is_ascii_hexdigit()));
                assert_eq!(digits, digits.to_lowercase());
            }
        }
    }

    #[test]
    fn test_normalize_pads_short_numbers() {
        assert_eq!(normalize_class_id("1:12").unwrap(), "1:0012");
        assert_eq!(normalize_class_id("1:a3c1").unwrap(), "1:a3c1");
        assert_eq!(normalize_class_id("1:99").unwrap(), "1:0099");
    }

    #[test]
    fn test_display_form_strips_padding() {
        assert_eq!(display_form("1:0a32").unwrap(), "1:a32");
        assert_eq!(display_form("1:a3c1").unwrap(), "1:a3c1");
        assert_eq!(display_form("1:0099").unwrap(), "1:99");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_class_id("nocolon").is_err());
        assert!(normalize_class_id("1:zzzz").is_err());
        assert!(normalize_class_id("1:fffff").is_err());
    }
}
