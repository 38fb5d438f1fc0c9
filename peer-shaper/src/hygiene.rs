//! Input validation for values that end up in external command lines.
//!
//! Every tc/ip/modprobe invocation is made with a pre-tokenized argument
//! vector, never through a shell. These checks reject values that would only
//! make sense as an injection attempt anyway: shell metacharacters,
//! whitespace, and path traversal sequences.

use anyhow::{bail, Result};

/// Characters that never appear in a legitimate interface name, peer key, or
/// address, but do appear in injection payloads.
const SHELL_META: &[char] = &[
    ';', '|', '&', '$', '(', ')', '{', '}', '<', '>', '`', '\'', '"', '\\', '*', '?', '~', '!',
    '#', '\n', '\r', '\t', ' ',
];

/// Validates a network interface name.
pub fn validate_interface(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("interface name is empty");
    }
    if name.len() > 15 {
        bail!("interface name {name} exceeds 15 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!("interface name {name} contains invalid characters");
    }
    if name.contains("..") {
        bail!("interface name {name} contains a path traversal sequence");
    }
    Ok(())
}

/// Validates an opaque peer identity (typically a WireGuard public key).
pub fn validate_peer(peer: &str) -> Result<()> {
    if peer.is_empty() {
        bail!("peer identity is empty");
    }
    if peer.len() > 256 {
        bail!("peer identity is too long");
    }
    if peer.chars().any(|c| SHELL_META.contains(&c) || c.is_control()) {
        bail!("peer identity contains invalid characters");
    }
    if peer.contains("../") || peer.starts_with("..") {
        bail!("peer identity contains a path traversal sequence");
    }
    Ok(())
}

/// Validates a textual CIDR or bare address before it reaches a filter match.
pub fn validate_allowed_ip(ip: &str) -> Result<()> {
    if ip.is_empty() {
        bail!("allowed IP is empty");
    }
    if !ip
        .chars()
        .all(|c| c.is_ascii_hexdigit() || matches!(c, '.' | ':' | '/'))
    {
        bail!("allowed IP {ip} contains invalid characters");
    }

    let ip_only = ip.split('/').next().unwrap_or(ip);
    if ip_only.parse::<std::net::IpAddr>().is_err() {
        bail!("allowed IP {ip} is not a valid address");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_interfaces() {
        for name in ["eth0", "wg0", "awg-main", "veth_1", "ifb-wg0"] {
            assert!(validate_interface(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_interface_injection_rejected() {
        for name in [
            "eth0; rm -rf /",
            "eth0 && reboot",
            "$(whoami)",
            "eth0|cat",
            "../../etc",
            "",
            "averylonginterfacename",
        ] {
            assert!(validate_interface(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_valid_peers() {
        for peer in [
            "hIzP1Pd8U0Bw6BGPhLKYN5oBGzkRg3Av3TXrP2C1CH4=",
            "peer-01",
            "dGVzdA==",
            "a/b+c=",
        ] {
            assert!(validate_peer(peer).is_ok(), "{peer} should be valid");
        }
    }

    #[test]
    fn test_peer_injection_rejected() {
        for peer in [
            "key; tc qdisc del dev eth0 root",
            "key`id`",
            "key$(id)",
            "key\nnewline",
            "key with spaces",
            "../secret",
            "",
        ] {
            assert!(validate_peer(peer).is_err(), "{peer:?} should be rejected");
        }
    }

    #[test]
    fn test_valid_allowed_ips() {
        for ip in ["10.0.0.5/32", "192.168.1.1", "::1/128", "fd00::1", "2001:db8::/64"] {
            assert!(validate_allowed_ip(ip).is_ok(), "{ip} should be valid");
        }
    }

    #[test]
    fn test_allowed_ip_injection_rejected() {
        for ip in ["10.0.0.5; ls", "10.0.0.5 -j DROP", "$(ip)", "", "nonsense", "10.0.0.999/32"] {
            assert!(validate_allowed_ip(ip).is_err(), "{ip:?} should be rejected");
        }
    }
}
