//! The outer control plane: installing and removing per-peer rate limits.
//!
//! `apply` is idempotent: classes are changed in place when they exist and
//! filters for the same address are replaced rather than stacked. `remove`
//! is best-effort and keeps going past individual failures, so a half-torn
//! interface converges instead of wedging.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::class_id::{class_id, display_form, Direction};
use crate::context::ShaperContext;
use crate::ifb::{self, ifb_name};
use crate::qdisc;
use crate::rate::{self, max_rate};
use crate::strategy::{IpMatch, Scheduler};
use crate::tc::parse_filter_handles;

/// Attempts for per-peer filter installation.
const FILTER_ATTEMPTS: usize = 3;
const FILTER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Attempts for the filter + class removal sequence.
const REMOVAL_ATTEMPTS: usize = 3;

/// Installs (or updates) rate limits for one peer.
///
/// A rate of zero means unlimited for that direction: the direction's filter
/// is removed so the peer's traffic flows through the default class, and the
/// class itself is left alone.
pub async fn apply(
    ctx: &ShaperContext,
    iface: &str,
    peer: &str,
    allowed_ip: &str,
    upload_kbps: i64,
    download_kbps: i64,
) -> Result<()> {
    let upload = validated_or_unlimited(ctx, upload_kbps)?;
    let download = validated_or_unlimited(ctx, download_kbps)?;

    let effective = qdisc::ensure_root_qdisc(ctx, iface, ctx.scheduler).await?;

    let _guard = ctx.lock_scheduler().await;
    debug!("acquired scheduler lock for {iface}");

    if effective == Scheduler::Cake {
        setup_cake_limits(ctx, iface, allowed_ip, download, upload).await?;
        info!("successfully configured CAKE rate limiting for peer {peer} on interface {iface}");
        return Ok(());
    }

    // Download side first: class and filter live on the real interface.
    if download > 0 {
        let download_class = class_id(peer, Direction::Download)?;
        create_class(ctx, iface, &download_class, download, effective).await?;
        add_peer_filter(ctx, iface, &download_class, allowed_ip, "dst", effective, download)
            .await?;
    } else {
        remove_filter(ctx, iface, allowed_ip).await?;
    }

    // Upload side: ingress traffic is shaped on the IFB mirror.
    if upload > 0 {
        if !ifb::check_ifb_support(ctx).await {
            warn!("IFB not supported, falling back to basic tc shaping");
            ifb::setup_basic_police(ctx, iface, allowed_ip, upload).await?;
        } else {
            let ifb_dev = ifb_name(iface);
            let ifb_scheduler = ifb::setup_ifb(ctx, iface, effective).await?;
            ifb::add_ingress_redirect(ctx, iface, allowed_ip, &ifb_dev).await?;

            let upload_class = class_id(peer, Direction::Upload)?;
            create_class(ctx, &ifb_dev, &upload_class, upload, ifb_scheduler).await?;
            add_peer_filter(
                ctx,
                &ifb_dev,
                &upload_class,
                allowed_ip,
                "src",
                ifb_scheduler,
                upload,
            )
            .await?;
        }
    } else {
        let ifb_dev = ifb_name(iface);
        let exists = ctx.tc.ip(&["link", "show", &ifb_dev]).await?;
        if exists.success {
            remove_filter(ctx, &ifb_dev, allowed_ip).await?;
        }
    }

    info!("successfully configured rate limiting for peer {peer} on interface {iface}");

    Ok(())
}

/// Bounds-checks a rate but keeps zero as the "unlimited" marker.
fn validated_or_unlimited(ctx: &ShaperContext, rate_kbps: i64) -> Result<i64> {
    if rate_kbps == 0 {
        return Ok(0);
    }
    rate::validate_rate(rate_kbps, ctx.supports_64bit)
}

/// Removes one peer's rate limits, leaving the qdisc tree in place.
pub async fn remove(
    ctx: &ShaperContext,
    iface: &str,
    peer: &str,
    allowed_ip: &str,
) -> Result<()> {
    info!("removing rate limits for peer {peer} on interface {iface}...");

    let _guard = ctx.lock_scheduler().await;

    if ctx.scheduler == Scheduler::Cake {
        remove_cake_limits(ctx, iface, allowed_ip).await?;
        return Ok(());
    }

    remove_peer_on_device(ctx, iface, allowed_ip, peer).await?;

    let ifb_dev = ifb_name(iface);
    let ifb_exists = ctx.tc.ip(&["link", "show", &ifb_dev]).await?;
    if ifb_exists.success {
        remove_peer_on_device(ctx, &ifb_dev, allowed_ip, peer).await?;
        add_default_filters_on_device(ctx, &ifb_dev, allowed_ip).await?;
    }

    add_default_filters_on_device(ctx, iface, allowed_ip).await?;

    info!("successfully removed rate limits for peer {peer} on interface {iface}");

    Ok(())
}

/// Wipes all traffic control state from an interface and its IFB mirror.
pub async fn nuke(ctx: &ShaperContext, iface: &str) -> Result<()> {
    qdisc::nuke_interface(ctx, iface).await
}

/// Creates a peer class, or changes it in place when it already exists.
///
/// Caller holds the scheduler lock.
async fn create_class(
    ctx: &ShaperContext,
    dev: &str,
    class_id: &str,
    rate_kbps: i64,
    scheduler: Scheduler,
) -> Result<()> {
    let Some(class_args) = scheduler.class_args(rate_kbps) else {
        debug!("{} scheduler does not use classes", scheduler.as_str());
        return Ok(());
    };

    info!("creating class on device {dev} with classid {class_id} and rate {rate_kbps} Kbps");

    let base: Vec<String> = ["class", "change", "dev", dev, "parent", "1:", "classid", class_id]
        .iter()
        .map(|part| part.to_string())
        .collect();

    let mut change_args = base.clone();
    change_args.extend(class_args.iter().cloned());
    let change_refs: Vec<&str> = change_args.iter().map(String::as_str).collect();

    let changed = ctx.tc.tc(&change_refs).await?;
    if changed.success {
        info!("successfully created class {class_id} on device {dev}");
        return Ok(());
    }

    let mut add_args = change_args;
    add_args[1] = "add".to_string();
    let add_refs: Vec<&str> = add_args.iter().map(String::as_str).collect();

    let added = ctx.tc.tc(&add_refs).await?;
    if !added.success {
        bail!(
            "failed to add {} traffic class on {dev}: {}",
            scheduler.as_str(),
            added.text.trim()
        );
    }

    info!("successfully created class {class_id} on device {dev}");
    Ok(())
}

/// Adds the u32 filter steering one direction of a peer's traffic.
///
/// `match_kind` is `src` for upload and `dst` for download. Caller holds the
/// scheduler lock.
async fn add_peer_filter(
    ctx: &ShaperContext,
    dev: &str,
    class_id: &str,
    allowed_ip: &str,
    match_kind: &str,
    scheduler: Scheduler,
    rate_kbps: i64,
) -> Result<()> {
    let ip = IpMatch::new(allowed_ip)?;
    info!("adding {match_kind} filter for {} on {dev}", ip.ip_only);

    let mut args: Vec<String> = [
        "filter", "add", "dev", dev, "protocol", ip.protocol, "parent", "1:", "prio",
        ip.priority, "u32", "match", ip.match_type, match_kind, ip.ip_only.as_str(),
    ]
    .iter()
    .map(|part| part.to_string())
    .collect();
    args.extend(scheduler.filter_action_args(class_id, rate_kbps));

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let mut last_failure = String::new();
    for attempt in 1..=FILTER_ATTEMPTS {
        let output = ctx.tc.tc(&arg_refs).await?;
        if output.success {
            info!("successfully added {match_kind} filter for {} on {dev}", ip.ip_only);
            return Ok(());
        }
        last_failure = output.text.trim().to_string();
        if attempt < FILTER_ATTEMPTS {
            sleep(FILTER_RETRY_DELAY).await;
        }
    }

    bail!("failed to add {match_kind} filter on {dev}: {last_failure}")
}

/// Removes every filter on `dev` matching the peer's address, then does the
/// same for the interface's IFB mirror when one exists.
pub async fn remove_filter(ctx: &ShaperContext, dev: &str, allowed_ip: &str) -> Result<()> {
    let ip = IpMatch::new(allowed_ip)?;

    remove_filter_on_device(ctx, dev, &ip).await?;

    if !dev.starts_with("ifb-") {
        let ifb_dev = ifb_name(dev);
        let exists = ctx.tc.ip(&["link", "show", &ifb_dev]).await?;
        if exists.success {
            if let Err(err) = remove_filter_on_device(ctx, &ifb_dev, &ip).await {
                debug!("error removing filter on IFB device {ifb_dev}: {err:#} (usually safe to ignore)");
            }
        }
    }

    Ok(())
}

async fn remove_filter_on_device(ctx: &ShaperContext, dev: &str, ip: &IpMatch) -> Result<()> {
    let listed = ctx
        .tc
        .tc(&["filter", "show", "dev", dev, "parent", "1:"])
        .await?;
    if !listed.success {
        bail!("failed to list filters on {dev}: {}", listed.text.trim());
    }

    let handles = parse_filter_handles(&listed.text, &ip.ip_only);
    info!("found {} filters to remove on {dev} for IP {}", handles.len(), ip.ip_only);

    for handle in handles {
        let removed = ctx
            .tc
            .tc(&[
                "filter",
                "del",
                "dev",
                dev,
                "parent",
                "1:",
                "handle",
                &handle,
                "prio",
                ip.priority,
                "protocol",
                ip.protocol,
            ])
            .await?;
        if removed.success {
            info!("successfully removed filter handle {handle} on {dev}");
        } else {
            debug!(
                "filter removal (handle {handle}) on {dev} returned: {} (usually safe to ignore)",
                removed.text.trim()
            );
        }
    }

    Ok(())
}

/// Removes the filters and the class for one direction of a peer on `dev`.
///
/// The direction is implied by the device: the real interface holds the
/// download side (dst match), the IFB mirror holds the upload side (src
/// match). Filters are deleted before the class; a class reported "in use"
/// gets one more filter sweep and a retry. After the final attempt the
/// removal logs and proceeds rather than failing the whole operation.
async fn remove_peer_on_device(
    ctx: &ShaperContext,
    dev: &str,
    allowed_ip: &str,
    peer: &str,
) -> Result<()> {
    info!("removing rate limits on device {dev} for peer {peer} (IP: {allowed_ip})");

    let is_ifb = dev.starts_with("ifb-");
    let (direction, match_kind) = if is_ifb {
        (Direction::Upload, "src")
    } else {
        (Direction::Download, "dst")
    };
    let peer_class = class_id(peer, direction)?;
    // tc prints class IDs unpadded, so output scans use the short form.
    let peer_class_shown = display_form(&peer_class)?;
    let ip = IpMatch::new(allowed_ip)?;

    debug!("calculated class ID {peer_class} for {match_kind} on {dev}");

    for attempt in 1..=REMOVAL_ATTEMPTS {
        if attempt > 1 {
            info!("attempt {attempt} of {REMOVAL_ATTEMPTS} to remove filters and classes");
        }

        // All filter deletions must land before the class deletion, or the
        // class is still referenced and the kernel refuses to drop it.
        let listed = ctx
            .tc
            .tc(&["filter", "show", "dev", dev, "parent", "1:"])
            .await?;
        let handles = parse_filter_handles(&listed.text, &ip.ip_only);
        info!("found {} filters to remove on {dev} for IP {}", handles.len(), ip.ip_only);

        for handle in handles {
            let removed = ctx
                .tc
                .tc(&[
                    "filter",
                    "del",
                    "dev",
                    dev,
                    "parent",
                    "1:",
                    "handle",
                    &handle,
                    "prio",
                    ip.priority,
                    "protocol",
                    ip.protocol,
                ])
                .await?;
            if !removed.success {
                warn!(
                    "error removing filter handle {handle}: {}",
                    removed.text.trim()
                );
            }
        }

        // Fallback sweep by match criteria for filters the handle parse missed.
        let by_match = ctx
            .tc
            .tc(&[
                "filter",
                "del",
                "dev",
                dev,
                "parent",
                "1:",
                "protocol",
                ip.protocol,
                "prio",
                ip.priority,
                "u32",
                "match",
                ip.match_type,
                match_kind,
                &ip.ip_only,
            ])
            .await?;
        if by_match.success {
            info!("successfully removed filters by match criteria");
        } else {
            debug!(
                "filter removal by match criteria returned: {} (may not exist)",
                by_match.text.trim()
            );
        }

        let classes = ctx.tc.tc(&["class", "show", "dev", dev]).await?;
        if !classes.text.contains(&peer_class_shown) {
            info!("class {peer_class} does not exist on {dev}, skipping removal");
            break;
        }

        sleep(Duration::from_millis(200)).await;

        info!("removing class {peer_class} on {dev}");
        let deleted = ctx
            .tc
            .tc(&["class", "del", "dev", dev, "classid", &peer_class])
            .await?;
        if !deleted.success {
            warn!("error removing class {peer_class}: {}", deleted.text.trim());

            if deleted.text.contains("in use") {
                info!("class {peer_class} is in use, attempting to remove remaining filters");
                let _ = ctx
                    .tc
                    .tc(&[
                        "filter",
                        "del",
                        "dev",
                        dev,
                        "parent",
                        "1:",
                        "protocol",
                        ip.protocol,
                        "prio",
                        ip.priority,
                        "u32",
                        "match",
                        ip.match_type,
                        match_kind,
                        &ip.ip_only,
                    ])
                    .await;

                sleep(Duration::from_millis(100)).await;
                let retried = ctx
                    .tc
                    .tc(&["class", "del", "dev", dev, "classid", &peer_class])
                    .await?;
                if retried.success {
                    info!("successfully removed class {peer_class} on second attempt");
                } else {
                    warn!(
                        "still unable to remove class {peer_class}: {}",
                        retried.text.trim()
                    );
                }
            }
        } else {
            info!("successfully removed class {peer_class}");
        }

        if is_ifb {
            cleanup_ingress_redirect(ctx, dev, &ip).await;
        }

        let verify = ctx.tc.tc(&["class", "show", "dev", dev]).await?;
        if verify.text.contains(&peer_class_shown) {
            if attempt == REMOVAL_ATTEMPTS {
                warn!("class {peer_class} still exists after removal attempts, but continuing");
            } else {
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        }

        break;
    }

    // Keep unclassified traffic flowing through the default class.
    ensure_default_class(ctx, dev).await;

    info!("completed removal of rate limits on device {dev} for peer {peer}");
    Ok(())
}

/// Deletes the mirred redirects on the real interface behind an IFB mirror.
async fn cleanup_ingress_redirect(ctx: &ShaperContext, ifb_dev: &str, ip: &IpMatch) {
    let real_dev = ifb_dev.trim_start_matches("ifb-");
    info!("cleaning up ingress redirect on {real_dev}");

    let Ok(listed) = ctx
        .tc
        .tc(&["filter", "show", "dev", real_dev, "parent", "ffff:"])
        .await
    else {
        return;
    };

    for handle in parse_filter_handles(&listed.text, &ip.ip_only) {
        let _ = ctx
            .tc
            .tc(&[
                "filter", "del", "dev", real_dev, "parent", "ffff:", "handle", &handle, "prio",
                "1",
            ])
            .await;
    }
}

/// Reasserts the default class `1:99` at the maximum rate.
async fn ensure_default_class(ctx: &ShaperContext, dev: &str) {
    debug!("ensuring default class exists on {dev}");

    let Some(class_args) = ctx.scheduler.class_args(max_rate(ctx.supports_64bit)) else {
        return;
    };

    let mut args: Vec<String> = ["class", "replace", "dev", dev, "parent", "1:", "classid", "1:99"]
        .iter()
        .map(|part| part.to_string())
        .collect();
    args.extend(class_args);

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let _ = ctx.tc.tc(&arg_refs).await;

    debug!("default class verified on {dev}");
}

/// Re-adds low-priority per-address filters steering the peer's traffic to
/// the default class, so a de-limited peer keeps passing traffic.
async fn add_default_filters_on_device(
    ctx: &ShaperContext,
    dev: &str,
    allowed_ip: &str,
) -> Result<()> {
    let ip = IpMatch::new(allowed_ip)?;

    for match_kind in ["src", "dst"] {
        let added = ctx
            .tc
            .tc(&[
                "filter",
                "add",
                "dev",
                dev,
                "parent",
                "1:",
                "protocol",
                ip.protocol,
                "prio",
                "9999",
                "u32",
                "match",
                ip.match_type,
                match_kind,
                &ip.ip_only,
                "flowid",
                "1:99",
            ])
            .await?;
        if !added.success {
            bail!(
                "failed to add default {match_kind} filter on {dev}: {}",
                added.text.trim()
            );
        }
    }

    Ok(())
}

/// Per-peer limits on a CAKE interface: policing filters, no classes.
async fn setup_cake_limits(
    ctx: &ShaperContext,
    iface: &str,
    allowed_ip: &str,
    download_kbps: i64,
    upload_kbps: i64,
) -> Result<()> {
    let ip = IpMatch::new(allowed_ip)?;

    if download_kbps > 0 {
        // Download is policed at the ingress hook.
        let ingress = ctx.tc.tc(&["qdisc", "add", "dev", iface, "ingress"]).await?;
        if !ingress.success {
            debug!(
                "adding ingress qdisc returned: {} (may already exist)",
                ingress.text.trim()
            );
        }

        let mut args: Vec<String> = [
            "filter", "add", "dev", iface, "parent", "ffff:", "protocol", ip.protocol, "prio",
            ip.priority, "u32", "match", ip.match_type, "dst", ip.ip_only.as_str(),
        ]
        .iter()
        .map(|part| part.to_string())
        .collect();
        args.extend(Scheduler::Cake.filter_action_args("", download_kbps));

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let added = ctx.tc.tc(&arg_refs).await?;
        if !added.success {
            bail!("failed to add CAKE download filter: {}", added.text.trim());
        }
        info!("successfully added CAKE download filter for {}", ip.ip_only);
    }

    if upload_kbps > 0 {
        // Upload is policed on the egress side of the CAKE root.
        let mut args: Vec<String> = [
            "filter", "add", "dev", iface, "parent", "1:", "protocol", ip.protocol, "prio",
            ip.priority, "u32", "match", ip.match_type, "src", ip.ip_only.as_str(),
        ]
        .iter()
        .map(|part| part.to_string())
        .collect();
        args.extend(Scheduler::Cake.filter_action_args("", upload_kbps));

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let added = ctx.tc.tc(&arg_refs).await?;
        if !added.success {
            bail!("failed to add CAKE upload filter: {}", added.text.trim());
        }
        info!("successfully added CAKE upload filter for {}", ip.ip_only);
    }

    Ok(())
}

/// Removes a peer's CAKE policing filters. The CAKE qdisc itself stays: it
/// still serves every other peer on the interface.
async fn remove_cake_limits(ctx: &ShaperContext, iface: &str, allowed_ip: &str) -> Result<()> {
    info!("removing CAKE rate limiting for IP {allowed_ip}");

    let ip = IpMatch::new(allowed_ip)?;

    let _ = ctx
        .tc
        .tc(&[
            "filter", "del", "dev", iface, "parent", "ffff:", "protocol", ip.protocol, "prio",
            ip.priority, "u32", "match", ip.match_type, "dst", &ip.ip_only,
        ])
        .await;

    let _ = ctx
        .tc
        .tc(&[
            "filter", "del", "dev", iface, "parent", "1:", "protocol", ip.protocol, "prio",
            ip.priority, "u32", "match", ip.match_type, "src", &ip.ip_only,
        ])
        .await;

    info!("successfully removed CAKE rate limiting for {}", ip.ip_only);
    Ok(())
}
