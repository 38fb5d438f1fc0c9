//! Root qdisc lifecycle per interface.
//!
//! An interface is only ever reshaped when it is safe: a root qdisc of a
//! different type is preserved while it still holds peer classes (the
//! requested scheduler is overridden to match), and swapped out only when
//! empty. Installation conflicts from stale state are retried after a forced
//! cleanup.

use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::context::ShaperContext;
use crate::ifb::ifb_name;
use crate::strategy::Scheduler;
use crate::tc::{has_peer_classes, parse_root_qdisc};

/// Retry delays after an exclusivity conflict on qdisc installation.
const EXCLUSIVITY_RETRY_DELAYS: [Duration; 2] =
    [Duration::from_millis(250), Duration::from_millis(500)];

/// Ensures `dev` has a usable root qdisc and returns the effective scheduler.
///
/// The result can differ from `desired` in two cases: an existing foreign
/// qdisc with live peer classes is preserved, and CAKE falls back to HTB on
/// kernels without it.
pub async fn ensure_root_qdisc(
    ctx: &ShaperContext,
    dev: &str,
    desired: Scheduler,
) -> Result<Scheduler> {
    let lock = ctx.iface_lock(dev);
    let _guard = lock.lock().await;
    debug!("acquired lock for interface {dev}");

    let output = ctx
        .tc
        .tc_ok(&["qdisc", "show", "dev", dev])
        .await
        .with_context(|| format!("failed to check qdisc on {dev}"))?;

    if output.contains(&format!("qdisc {}", desired.as_str())) {
        info!(
            "desired {} qdisc already exists on {dev}, preserving existing setup",
            desired.as_str()
        );
        return Ok(desired);
    }

    if let Some(existing) = parse_root_qdisc(&output) {
        let class_output = ctx.tc.tc(&["class", "show", "dev", dev]).await?;
        let active = class_output.success && has_peer_classes(&class_output.text);

        if active {
            warn!(
                "interface {dev} has {existing} qdisc but scheduler {} was requested",
                desired.as_str()
            );
            let Some(preserved) = Scheduler::from_qdisc_name(&existing) else {
                bail!(
                    "interface {dev} has a {existing} qdisc with active classes; \
                     remove all peer rate limits first or use --nuke to switch scheduler types"
                );
            };
            info!("preserving existing {existing} qdisc (has active peer rate limits)");
            info!("using existing {existing} qdisc for rate limiting operations");
            return Ok(preserved);
        }

        info!("found existing {existing} qdisc on {dev} with no active classes");
        info!("swapping to {} qdisc as requested", desired.as_str());

        let deleted = ctx.tc.tc(&["qdisc", "del", "dev", dev, "root"]).await?;
        if !deleted.success {
            warn!(
                "could not remove existing qdisc on {dev}: {}",
                deleted.text.trim()
            );
        }
        sleep(Duration::from_millis(100)).await;
    }

    info!("setting up {} qdisc on {dev}...", desired.as_str());
    setup_root_qdisc(ctx, dev, desired).await
}

/// Installs the root qdisc, retrying after exclusivity conflicts.
pub async fn setup_root_qdisc(
    ctx: &ShaperContext,
    dev: &str,
    scheduler: Scheduler,
) -> Result<Scheduler> {
    match try_install_root(ctx, dev, scheduler).await? {
        Ok(effective) => return finish_install(ctx, dev, effective).await,
        Err(first_failure) if first_failure.contains("Exclusivity flag on")
            || first_failure.contains("File exists") =>
        {
            warn!("exclusivity flag detected on {dev}, attempting forced cleanup and retry");
        }
        Err(failure) => bail!("failed to set up root qdisc on {dev}: {failure}"),
    }

    for delay in EXCLUSIVITY_RETRY_DELAYS {
        let _ = ctx.tc.tc(&["qdisc", "del", "dev", dev, "root"]).await;
        let _ = ctx.tc.tc(&["qdisc", "del", "dev", dev, "ingress"]).await;
        sleep(delay).await;

        if let Ok(effective) = try_install_root(ctx, dev, scheduler).await? {
            return finish_install(ctx, dev, effective).await;
        }
    }

    bail!("failed to set up qdisc on {dev} after exclusivity retries")
}

/// One installation attempt; Ok(Err(text)) is a failed tc invocation.
async fn try_install_root(
    ctx: &ShaperContext,
    dev: &str,
    scheduler: Scheduler,
) -> Result<std::result::Result<Scheduler, String>> {
    let mut attempt = scheduler;

    loop {
        let mut args: Vec<String> = ["qdisc", "add", "dev", dev, "root", "handle", "1:"]
            .iter()
            .map(|part| part.to_string())
            .collect();
        args.extend(attempt.root_qdisc_args());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = ctx.tc.tc(&arg_refs).await?;

        if output.success {
            return Ok(Ok(attempt));
        }

        // CAKE is the one scheduler old kernels may not ship.
        if attempt == Scheduler::Cake {
            warn!(
                "CAKE not available, falling back to HTB: {}",
                output.text.trim()
            );
            attempt = Scheduler::Htb;
            continue;
        }

        return Ok(Err(output.text.trim().to_string()));
    }
}

async fn finish_install(
    ctx: &ShaperContext,
    dev: &str,
    effective: Scheduler,
) -> Result<Scheduler> {
    add_dual_stack_filters(ctx, dev).await;
    info!("successfully set up root qdisc on {dev}");
    Ok(effective)
}

/// Installs the base filters that open the IPv4 and IPv6 filter chains.
///
/// IPv4 sits at priority 1 and IPv6 at priority 2; the two families cannot
/// share a priority level. Both steer to the default class `1:99`.
pub async fn add_dual_stack_filters(ctx: &ShaperContext, dev: &str) {
    let ipv4 = ctx
        .tc
        .tc(&[
            "filter", "add", "dev", dev, "protocol", "ip", "parent", "1:", "prio", "1", "u32",
            "match", "u32", "0", "0", "flowid", "1:99",
        ])
        .await;
    if let Ok(output) = &ipv4 {
        if !output.success {
            warn!(
                "could not add IPv4 base filter on {dev}: {}",
                output.text.trim()
            );
        }
    }

    let ipv6 = ctx
        .tc
        .tc(&[
            "filter", "add", "dev", dev, "protocol", "ipv6", "parent", "1:", "prio", "2", "u32",
            "match", "ip6", "src", "::/0", "flowid", "1:99",
        ])
        .await;
    if let Ok(output) = &ipv6 {
        if !output.success {
            // IPv6 may simply be disabled on this system.
            warn!(
                "could not add IPv6 base filter on {dev}: {}",
                output.text.trim()
            );
        }
    }

    debug!("dual-stack base filters installed on {dev}");
}

/// Removes every piece of traffic control state from an interface.
///
/// Deletes the ingress qdisc, the root qdisc, the IFB mirror's root qdisc,
/// and finally the IFB link itself. Each step is best-effort; nuking an
/// already-clean interface is a no-op.
pub async fn nuke_interface(ctx: &ShaperContext, dev: &str) -> Result<()> {
    let lock = ctx.iface_lock(dev);
    let _guard = lock.lock().await;
    debug!("acquired lock for nuking interface {dev}");
    info!("nuking all traffic control on interface {dev}...");

    let ifb_dev = ifb_name(dev);

    let steps: [(&str, Vec<&str>); 3] = [
        ("ingress qdisc", vec!["qdisc", "del", "dev", dev, "ingress"]),
        ("root qdisc", vec!["qdisc", "del", "dev", dev, "root"]),
        (
            "IFB root qdisc",
            vec!["qdisc", "del", "dev", ifb_dev.as_str(), "root"],
        ),
    ];

    for (what, args) in steps {
        match ctx.tc.tc(&args).await {
            Ok(output) if output.success => info!("removed {what} from {dev}"),
            Ok(output) => debug!("removing {what} returned: {} (may not exist)", output.text.trim()),
            Err(err) => warn!("removing {what} failed: {err:#}"),
        }
    }

    match ctx.tc.ip(&["link", "del", &ifb_dev]).await {
        Ok(output) if output.success => info!("removed IFB device {ifb_dev}"),
        Ok(output) => debug!(
            "removing IFB device returned: {} (may not exist)",
            output.text.trim()
        ),
        Err(err) => warn!("removing IFB device failed: {err:#}"),
    }

    Ok(())
}
