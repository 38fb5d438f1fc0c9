//! Peer introspection through the WireGuard and AmneziaWG tools.
//!
//! When the caller does not pass allowed IPs explicitly, they are discovered
//! by running `wg show <iface>` (or the AmneziaWG equivalent) and parsing the
//! peer block out of the textual output.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::ValueEnum;
use tokio::process::Command;
use tracing::{info, warn};

/// Which tool names the peers on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Wg,
    Awg,
}

impl Protocol {
    fn binary_names(self) -> &'static [&'static str] {
        match self {
            Protocol::Wg => &["wg", "wireguard-go"],
            Protocol::Awg => &["awg", "amneziawg"],
        }
    }
}

/// Directories searched for the tools besides PATH.
const COMMON_PATHS: &[&str] = &[
    "/usr/bin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/local/sbin",
    "/opt/bin",
    "/opt/local/bin",
];

/// A peer and the networks routed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

/// Locates one of `names` in PATH or the common install locations.
pub async fn find_executable(names: &[&str]) -> Option<PathBuf> {
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for name in names {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }

    for base in COMMON_PATHS {
        for name in names {
            let candidate = Path::new(base).join(name);
            if candidate.is_file() && runs_version(&candidate).await {
                return Some(candidate);
            }
        }
    }

    None
}

async fn runs_version(path: &Path) -> bool {
    matches!(
        Command::new(path).arg("--version").output().await,
        Ok(output) if output.status.success()
    )
}

/// Discovers a peer's allowed IPs by running the protocol's `show` command.
pub async fn peer_info(protocol: Protocol, iface: &str, peer_key: &str) -> Result<PeerInfo> {
    let Some(binary) = find_executable(protocol.binary_names()).await else {
        warn!("{:?} executable not found", protocol);
        bail!("{:?} executable not found in PATH or common locations", protocol);
    };

    info!("executing: {} show {iface}", binary.display());
    let output = Command::new(&binary)
        .args(["show", iface])
        .output()
        .await
        .with_context(|| format!("failed to execute {} show", binary.display()))?;

    if !output.status.success() {
        bail!(
            "{} show {iface} failed: {}",
            binary.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_peer_info(&String::from_utf8_lossy(&output.stdout), peer_key)
}

/// Parses a peer block out of `wg show` style output.
///
/// A line containing the peer key opens the block; subsequent
/// `allowed ip[s]:` lines contribute a comma-separated address list.
pub fn parse_peer_info(output: &str, target_peer_key: &str) -> Result<PeerInfo> {
    let mut found = false;
    let mut allowed_ips = Vec::new();

    for line in output.lines() {
        let line = line.trim();

        if line.contains(target_peer_key) {
            found = true;
            continue;
        }

        // A new peer header closes the target's block.
        if found && line.starts_with("peer:") {
            break;
        }

        if found && (line.contains("allowed ip") || line.contains("allowed_ip")) {
            if let Some((_, list)) = line.split_once(':') {
                for ip in list.split(',') {
                    let ip = ip.trim();
                    if !ip.is_empty() {
                        allowed_ips.push(ip.to_string());
                    }
                }
            }
        }
    }

    if !found {
        bail!("peer {target_peer_key} not found in output");
    }

    Ok(PeerInfo {
        public_key: target_peer_key.to_string(),
        allowed_ips,
    })
}
