//! Driver for the external traffic-control utilities.
//!
//! All kernel state is manipulated through `tc`, `ip`, and `modprobe`.
//! Invocations use pre-tokenized argument vectors (nothing is ever expanded
//! by a shell) and are bounded by an overall timeout. The textual output of
//! `show` subcommands is parsed here as well.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Fixed location of the tc binary from iproute2.
pub const TC_PATH: &str = "/sbin/tc";

/// Upper bound for any single external command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one external command, with stdout and stderr combined the way
/// the kernel utilities interleave diagnostics.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub text: String,
}

impl CommandOutput {
    /// True when the output mentions a qdisc exclusivity conflict.
    pub fn is_exclusivity_error(&self) -> bool {
        self.text.contains("Exclusivity flag on") || self.text.contains("File exists")
    }
}

/// Runs tc and friends with bounded latency.
#[derive(Debug, Clone)]
pub struct TcRunner {
    tc_path: PathBuf,
}

impl Default for TcRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TcRunner {
    pub fn new() -> Self {
        Self {
            tc_path: PathBuf::from(TC_PATH),
        }
    }

    /// Fails fast when iproute2 is not installed.
    pub async fn ensure_available(&self) -> Result<()> {
        tokio::fs::metadata(&self.tc_path).await.with_context(|| {
            format!(
                "tc command not found at {}, please install iproute2",
                self.tc_path.display()
            )
        })?;
        Ok(())
    }

    async fn run_program(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("executing: {program} {}", args.join(" "));

        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(program).args(args).output(),
        )
        .await
        .with_context(|| format!("{program} {} timed out", args.join(" ")))?
        .with_context(|| format!("failed to execute {program}"))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            text,
        })
    }

    /// Runs a tc subcommand, returning its combined output.
    pub async fn tc(&self, args: &[&str]) -> Result<CommandOutput> {
        let tc = self.tc_path.to_string_lossy().into_owned();
        self.run_program(&tc, args).await
    }

    /// Runs a tc subcommand that is expected to succeed.
    pub async fn tc_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.tc(args).await?;
        if !output.success {
            bail!("tc {} failed: {}", args.join(" "), output.text.trim());
        }
        Ok(output.text)
    }

    /// Runs an `ip` subcommand.
    pub async fn ip(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run_program("ip", args).await
    }

    /// Loads a kernel module.
    pub async fn modprobe(&self, module: &str) -> Result<CommandOutput> {
        self.run_program("modprobe", &[module]).await
    }
}

/// Extracts the handles of `tc filter show` entries that match an IP.
///
/// Handle lines (`filter ... fh 800::800 ...`) precede the match detail
/// lines, so the parser carries the last seen handle forward until a line
/// mentions the target address.
pub fn parse_filter_handles(output: &str, target_ip: &str) -> Vec<String> {
    let mut handles = Vec::new();
    let mut current_handle: Option<String> = None;

    for line in output.lines() {
        if line.starts_with("filter") {
            let fields: Vec<&str> = line.split_whitespace().collect();
            current_handle = fields
                .windows(2)
                .find(|pair| pair[0] == "fh" || pair[0] == "handle")
                .map(|pair| pair[1].to_string());
        }

        if let Some(handle) = &current_handle {
            if line.contains(&format!("match {target_ip}"))
                || line.contains(&format!("src {target_ip}"))
                || line.contains(&format!("dst {target_ip}"))
            {
                handles.push(handle.clone());
                current_handle = None;
            }
        }
    }

    handles
}

/// Finds the root qdisc type in `tc qdisc show dev X` output, skipping the
/// default noqueue discipline.
pub fn parse_root_qdisc(output: &str) -> Option<String> {
    for line in output.lines() {
        if line.contains("qdisc") && line.contains("root") && !line.contains("qdisc noqueue") {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("qdisc") {
                return fields.next().map(|kind| kind.to_string());
            }
        }
    }
    None
}

/// True when `tc class show dev X` output lists any class other than the
/// default `1:99` and the implicit root class.
pub fn has_peer_classes(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next()? != "class" {
                return None;
            }
            let _kind = fields.next()?;
            fields.next().map(|handle| handle.to_string())
        })
        .any(|handle| handle != "1:99" && handle != "1:0099" && handle != "1:")
}
