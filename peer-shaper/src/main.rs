//! Command-line entry point for the peer shaper.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use peer_shaper::peers::{self, Protocol};
use peer_shaper::{apply, hygiene, Scheduler, ShaperContext};

#[derive(Parser, Debug)]
#[command(name = "peer-shaper")]
#[command(version)]
#[command(about = "Per-peer upload/download rate limits over Linux traffic control")]
struct Args {
    /// Interface name.
    #[arg(short, long)]
    interface: String,

    /// Peer ID (required for apply and remove).
    #[arg(short, long)]
    peer: Option<String>,

    /// Upload rate limit in Kb/s (0 for unlimited).
    #[arg(long, default_value_t = 0)]
    upload_rate: i64,

    /// Download rate limit in Kb/s (0 for unlimited).
    #[arg(long, default_value_t = 0)]
    download_rate: i64,

    /// Protocol whose tooling names the peer's allowed IPs.
    #[arg(long, value_enum, default_value = "wg")]
    protocol: Protocol,

    /// Comma-separated list of allowed IPs; the first one is shaped. When
    /// omitted, they are discovered through the protocol tooling.
    #[arg(long)]
    allowed_ips: Option<String>,

    /// Traffic scheduler type.
    #[arg(long, value_enum, default_value = "htb")]
    scheduler: Scheduler,

    /// Remove this peer's rate limits.
    #[arg(long)]
    remove: bool,

    /// Remove all traffic control qdiscs from the interface.
    #[arg(long)]
    nuke: bool,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

/// Emergency cleanup run when an apply panics halfway: drop the root qdisc
/// and the IFB mirror's qdisc so the interface is not left wedged.
///
/// Runs inside a panic hook, so plain synchronous process spawns only.
fn cleanup_on_panic(iface: &str) {
    use std::process::Command;

    eprintln!("performing emergency cleanup on {iface}...");

    let _ = Command::new(peer_shaper::tc::TC_PATH)
        .args(["filter", "del", "dev", iface, "parent", "1:"])
        .status();
    let _ = Command::new(peer_shaper::tc::TC_PATH)
        .args(["qdisc", "del", "dev", iface, "root"])
        .status();

    let ifb_dev = peer_shaper::ifb::ifb_name(iface);
    let _ = Command::new(peer_shaper::tc::TC_PATH)
        .args(["qdisc", "del", "dev", &ifb_dev, "root"])
        .status();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting peer-shaper...");

    if let Err(err) = run(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    hygiene::validate_interface(&args.interface)?;

    // Nuke stands alone: no peer, no rates, no capability probing needed.
    if args.nuke {
        let ctx = ShaperContext::new(args.scheduler).await?;
        apply::nuke(&ctx, &args.interface).await?;
        info!(
            "successfully nuked all traffic control on interface {}",
            args.interface
        );
        return Ok(());
    }

    let Some(peer) = args.peer.as_deref() else {
        anyhow::bail!("the --peer flag is required for apply and remove operations");
    };
    hygiene::validate_peer(peer)?;

    let allowed_ip = resolve_allowed_ip(&args, peer).await?;
    hygiene::validate_allowed_ip(&allowed_ip)?;

    let ctx = ShaperContext::new(args.scheduler).await?;

    info!(
        "configuration: interface={}, peer={}, upload-rate={}, download-rate={}, remove={}",
        args.interface, peer, args.upload_rate, args.download_rate, args.remove
    );

    if args.remove {
        apply::remove(&ctx, &args.interface, peer, &allowed_ip).await?;
        return Ok(());
    }

    // Half-applied TC state is worse than none: tear the qdiscs down if the
    // apply path panics.
    let panic_iface = args.interface.clone();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        cleanup_on_panic(&panic_iface);
        default_hook(panic_info);
    }));

    let result = apply::apply(
        &ctx,
        &args.interface,
        peer,
        &allowed_ip,
        args.upload_rate,
        args.download_rate,
    )
    .await;

    let _ = std::panic::take_hook();

    result
}

/// The shaped address: first of --allowed-ips, or discovered via wg/awg.
async fn resolve_allowed_ip(args: &Args, peer: &str) -> Result<String> {
    if let Some(list) = args.allowed_ips.as_deref() {
        let ips: Vec<&str> = list.split(',').map(str::trim).filter(|ip| !ip.is_empty()).collect();
        if ips.is_empty() {
            anyhow::bail!("--allowed-ips does not contain any addresses");
        }
        info!("using provided allowed IPs: {ips:?}");
        return Ok(ips[0].to_string());
    }

    let info = peers::peer_info(args.protocol, &args.interface, peer).await?;
    let Some(first) = info.allowed_ips.first() else {
        anyhow::bail!("peer {peer} has no allowed IPs on {}", args.interface);
    };
    info!("discovered allowed IPs for {peer}: {:?}", info.allowed_ips);
    Ok(first.clone())
}
