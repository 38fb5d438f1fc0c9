//! Scheduler strategies and their command shapes.
//!
//! HTB and HFSC are classful: each peer gets a class holding its rate plus a
//! u32 filter steering the peer's traffic into it. CAKE has no classes at
//! all; per-peer limits are expressed as policing filters and the qdisc
//! itself handles queue management.

use anyhow::{bail, Result};
use clap::ValueEnum;

/// Which queueing discipline shapes an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scheduler {
    Htb,
    Hfsc,
    Cake,
}

impl Scheduler {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheduler::Htb => "htb",
            Scheduler::Hfsc => "hfsc",
            Scheduler::Cake => "cake",
        }
    }

    /// Maps a qdisc name from `tc qdisc show` back to a strategy.
    pub fn from_qdisc_name(name: &str) -> Option<Self> {
        match name {
            "htb" => Some(Scheduler::Htb),
            "hfsc" => Some(Scheduler::Hfsc),
            "cake" => Some(Scheduler::Cake),
            _ => None,
        }
    }

    /// Arguments after `tc qdisc add dev X root handle 1:` for this qdisc.
    pub fn root_qdisc_args(self) -> Vec<String> {
        match self {
            Scheduler::Htb => to_args(&["htb", "default", "99"]),
            Scheduler::Hfsc => to_args(&["hfsc", "default", "99"]),
            Scheduler::Cake => to_args(&["cake", "bandwidth", "1Gbit", "besteffort"]),
        }
    }

    /// Class parameters for a peer class at `rate_kbps`, or None for CAKE.
    pub fn class_args(self, rate_kbps: i64) -> Option<Vec<String>> {
        let rate_bits = rate_kbps * 1000;
        match self {
            Scheduler::Htb => Some(to_args(&[
                "htb",
                "rate",
                &format!("{rate_bits}bit"),
                "burst",
                "15k",
                "ceil",
                &format!("{rate_bits}bit"),
            ])),
            Scheduler::Hfsc => Some(to_args(&[
                "hfsc",
                "sc",
                "rate",
                &format!("{rate_bits}bit"),
                "ul",
                "rate",
                &format!("{rate_bits}bit"),
            ])),
            Scheduler::Cake => None,
        }
    }

    /// Trailing filter arguments: flowid steering for classful schedulers,
    /// a policing action for CAKE.
    pub fn filter_action_args(self, class_id: &str, rate_kbps: i64) -> Vec<String> {
        match self {
            Scheduler::Htb | Scheduler::Hfsc => to_args(&["flowid", class_id]),
            Scheduler::Cake => {
                let rate_bits = rate_kbps * 1000;
                let burst = rate_kbps * 125; // roughly 1 ms of traffic, in bytes
                to_args(&[
                    "police",
                    "rate",
                    &format!("{rate_bits}bit"),
                    "burst",
                    &burst.to_string(),
                    "drop",
                    "flowid",
                    ":1",
                ])
            }
        }
    }
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// Match parameters derived from an allowed IP, split by address family.
///
/// IPv4 and IPv6 filters must live at distinct priorities; sharing one
/// priority across protocols makes the kernel reject the second family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpMatch {
    pub ip_only: String,
    pub protocol: &'static str,
    pub match_type: &'static str,
    pub priority: &'static str,
}

impl IpMatch {
    pub fn new(allowed_ip: &str) -> Result<Self> {
        let ip_only = allowed_ip.split('/').next().unwrap_or(allowed_ip).to_string();
        if ip_only.is_empty() {
            bail!("allowed IP is empty");
        }

        Ok(if ip_only.contains(':') {
            Self {
                ip_only,
                protocol: "ipv6",
                match_type: "ip6",
                priority: "2",
            }
        } else {
            Self {
                ip_only,
                protocol: "ip",
                match_type: "ip",
                priority: "1",
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_qdisc_args_per_strategy() {
        assert_eq!(Scheduler::Htb.root_qdisc_args(), ["htb", "default", "99"]);
        assert_eq!(Scheduler::Hfsc.root_qdisc_args(), ["hfsc", "default", "99"]);
        assert_eq!(
            Scheduler::Cake.root_qdisc_args(),
            ["cake", "bandwidth", "1Gbit", "besteffort"]
        );
    }

    #[test]
    fn test_htb_class_args() {
        let args = Scheduler::Htb.class_args(2000).unwrap();
        assert_eq!(
            args,
            ["htb", "rate", "2000000bit", "burst", "15k", "ceil", "2000000bit"]
        );
    }

    #[test]
    fn test_hfsc_class_args() {
        let args = Scheduler::Hfsc.class_args(1000).unwrap();
        assert_eq!(
            args,
            ["hfsc", "sc", "rate", "1000000bit", "ul", "rate", "1000000bit"]
        );
    }

    #[test]
    fn test_cake_has_no_classes() {
        assert!(Scheduler::Cake.class_args(1000).is_none());
    }

    #[test]
    fn test_filter_actions() {
        assert_eq!(
            Scheduler::Htb.filter_action_args("1:a3c2", 2000),
            ["flowid", "1:a3c2"]
        );
        assert_eq!(
            Scheduler::Cake.filter_action_args("1:a3c2", 1000),
            ["police", "rate", "1000000bit", "burst", "125000", "drop", "flowid", ":1"]
        );
    }

    #[test]
    fn test_ip_match_families() {
        let v4 = IpMatch::new("10.0.0.5/32").unwrap();
        assert_eq!(v4.ip_only, "10.0.0.5");
        assert_eq!(v4.protocol, "ip");
        assert_eq!(v4.match_type, "ip");
        assert_eq!(v4.priority, "1");

        let v6 = IpMatch::new("::1/128").unwrap();
        assert_eq!(v6.ip_only, "::1");
        assert_eq!(v6.protocol, "ipv6");
        assert_eq!(v6.match_type, "ip6");
        assert_eq!(v6.priority, "2");

        let bare = IpMatch::new("192.168.1.1").unwrap();
        assert_eq!(bare.ip_only, "192.168.1.1");
    }
}
