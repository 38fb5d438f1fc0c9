//! IFB mirror interfaces for upload shaping.
//!
//! Classful qdiscs can only shape egress. Upload (ingress) traffic is
//! redirected through an Intermediate Functional Block device, where it
//! becomes egress and can be shaped like anything else. Each real interface
//! gets its own mirror named `ifb-{iface}`.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::context::ShaperContext;
use crate::qdisc;
use crate::strategy::{IpMatch, Scheduler};
use crate::tc::parse_filter_handles;

/// Attempts for the mirred-redirect filter installation.
const REDIRECT_ATTEMPTS: usize = 3;
const REDIRECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Name of the IFB mirror for a real interface.
pub fn ifb_name(iface: &str) -> String {
    format!("ifb-{iface}")
}

/// Checks whether this system can use IFB at all.
///
/// Tries, in order: the module sysfs entry, loading the module, and a
/// create-and-delete probe of a test link.
pub async fn check_ifb_support(ctx: &ShaperContext) -> bool {
    if tokio::fs::metadata("/sys/module/ifb").await.is_ok() {
        return true;
    }

    if matches!(ctx.tc.modprobe("ifb").await, Ok(output) if output.success) {
        return true;
    }

    let probe = ctx
        .tc
        .ip(&["link", "add", "test_ifb", "type", "ifb"])
        .await;
    if matches!(probe, Ok(output) if output.success) {
        let _ = ctx.tc.ip(&["link", "del", "test_ifb"]).await;
        return true;
    }

    false
}

/// Creates and brings up the IFB mirror, attaches the ingress qdisc on the
/// real interface, and ensures the mirror's root qdisc.
///
/// Returns the effective scheduler installed on the mirror.
pub async fn setup_ifb(
    ctx: &ShaperContext,
    real_dev: &str,
    scheduler: Scheduler,
) -> Result<Scheduler> {
    let ifb_dev = ifb_name(real_dev);
    info!("setting up IFB device {ifb_dev} for interface {real_dev}");

    let exists = ctx.tc.ip(&["link", "show", &ifb_dev]).await?;
    if !exists.success {
        info!("IFB device {ifb_dev} does not exist, creating...");
        let added = ctx
            .tc
            .ip(&["link", "add", &ifb_dev, "type", "ifb"])
            .await?;
        if !added.success {
            bail!(
                "failed to create IFB device {ifb_dev}: {}",
                added.text.trim()
            );
        }
    }

    let up = ctx.tc.ip(&["link", "set", "dev", &ifb_dev, "up"]).await?;
    if !up.success {
        bail!("failed to set IFB device {ifb_dev} up: {}", up.text.trim());
    }

    ensure_ingress_qdisc(ctx, real_dev).await?;

    qdisc::ensure_root_qdisc(ctx, &ifb_dev, scheduler).await
}

/// Attaches the `ffff:` ingress qdisc on `dev` if not present, verifying the
/// attachment afterwards.
pub async fn ensure_ingress_qdisc(ctx: &ShaperContext, dev: &str) -> Result<()> {
    let shown = ctx
        .tc
        .tc(&["qdisc", "show", "dev", dev, "ingress"])
        .await?;
    if shown.success && shown.text.contains("ingress") {
        return Ok(());
    }

    info!("adding ingress qdisc to {dev}");
    let added = ctx
        .tc
        .tc(&["qdisc", "add", "dev", dev, "handle", "ffff:", "ingress"])
        .await?;
    if !added.success {
        bail!(
            "failed to add ingress qdisc on {dev}: {}",
            added.text.trim()
        );
    }

    sleep(Duration::from_millis(100)).await;
    let verify = ctx
        .tc
        .tc(&["qdisc", "show", "dev", dev, "ingress"])
        .await?;
    if !verify.success || !verify.text.contains("ingress") {
        bail!("failed to verify ingress qdisc creation on {dev}");
    }

    Ok(())
}

/// Installs the mirred filter that turns `allowed_ip`'s ingress traffic on
/// the real interface into egress on the IFB mirror.
///
/// Any stale redirect for the same address is deleted first so re-applies do
/// not stack filters.
pub async fn add_ingress_redirect(
    ctx: &ShaperContext,
    real_dev: &str,
    allowed_ip: &str,
    ifb_dev: &str,
) -> Result<()> {
    info!("adding ingress redirect from {real_dev} to {ifb_dev} for IP {allowed_ip}");

    let shown = ctx
        .tc
        .tc(&["qdisc", "show", "dev", real_dev, "ingress"])
        .await?;
    if !shown.success || !shown.text.contains("ingress") {
        bail!("ingress qdisc not found on {real_dev}");
    }

    let ip = IpMatch::new(allowed_ip)?;

    let listed = ctx
        .tc
        .tc(&["filter", "show", "dev", real_dev, "parent", "ffff:"])
        .await?;
    for handle in parse_filter_handles(&listed.text, &ip.ip_only) {
        let removed = ctx
            .tc
            .tc(&[
                "filter", "del", "dev", real_dev, "parent", "ffff:", "handle", &handle, "prio",
                "1",
            ])
            .await?;
        if !removed.success {
            debug!(
                "stale redirect removal (handle {handle}) returned: {}",
                removed.text.trim()
            );
        }
    }

    let mut last_failure = String::new();
    for attempt in 1..=REDIRECT_ATTEMPTS {
        let added = ctx
            .tc
            .tc(&[
                "filter", "add", "dev", real_dev, "parent", "ffff:", "protocol", ip.protocol,
                "prio", "1", "u32", "match", ip.match_type, "src", &ip.ip_only, "action",
                "mirred", "egress", "redirect", "dev", ifb_dev,
            ])
            .await?;
        if added.success {
            info!("successfully added ingress redirect");
            return Ok(());
        }

        last_failure = added.text.trim().to_string();
        if attempt < REDIRECT_ATTEMPTS {
            sleep(REDIRECT_RETRY_DELAY).await;
        }
    }

    bail!("failed to add ingress redirect filter after retries: {last_failure}")
}

/// Fallback shaping for systems without IFB: a policing filter at the
/// ingress hook of the real interface.
pub async fn setup_basic_police(
    ctx: &ShaperContext,
    dev: &str,
    allowed_ip: &str,
    rate_kbps: i64,
) -> Result<()> {
    info!("setting up basic policing on {dev} for IP {allowed_ip} at {rate_kbps} Kbps");

    let ingress = ctx.tc.tc(&["qdisc", "add", "dev", dev, "ingress"]).await?;
    if !ingress.success {
        debug!(
            "adding ingress qdisc returned: {} (may already exist)",
            ingress.text.trim()
        );
    }

    let ip = IpMatch::new(allowed_ip)?;
    let rate_bits = rate_kbps * 1000;
    let burst = rate_kbps * 125;

    let rate = format!("{rate_bits}bit");
    let burst = burst.to_string();
    let added = ctx
        .tc
        .tc(&[
            "filter", "add", "dev", dev, "parent", "ffff:", "protocol", ip.protocol, "prio",
            "1", "u32", "match", ip.match_type, "src", &ip.ip_only, "police", "rate", &rate,
            "burst", &burst, "drop", "flowid", ":1",
        ])
        .await?;
    if !added.success {
        bail!("failed to add policing filter: {}", added.text.trim());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifb_naming() {
        assert_eq!(ifb_name("wg0"), "ifb-wg0");
        assert_eq!(ifb_name("eth0"), "ifb-eth0");
    }
}
