//! Integration tests against the real TC stack on the loopback device.
//!
//! These need root and iproute2; without them every test skips. All
//! scenarios share `lo`, so a process-wide lock keeps them from interleaving
//! and each scenario nukes the interface when it is done.

use std::sync::Mutex;

use peer_shaper::class_id::{class_id, display_form, Direction};
use peer_shaper::ifb::{check_ifb_support, ifb_name};
use peer_shaper::tc::TcRunner;
use peer_shaper::{apply, Scheduler, ShaperContext};

static LO_LOCK: Mutex<()> = Mutex::new(());

fn have_root_and_tc() -> bool {
    let is_root = unsafe { libc::geteuid() == 0 };
    is_root && std::path::Path::new(peer_shaper::tc::TC_PATH).exists()
}

macro_rules! require_root {
    () => {
        if !have_root_and_tc() {
            eprintln!("skipping: requires root and /sbin/tc");
            return;
        }
    };
}

async fn tc_text(tc: &TcRunner, args: &[&str]) -> String {
    tc.tc(args).await.map(|out| out.text).unwrap_or_default()
}

async fn nuke_lo(ctx: &ShaperContext) {
    let _ = apply::nuke(ctx, "lo").await;
}

#[tokio::test]
async fn test_htb_apply_and_remove_on_loopback() {
    require_root!();
    let _lock = LO_LOCK.lock().unwrap();

    let peer = "integration-test-peer-htb";
    let ip = "127.0.0.1/32";

    let ctx = ShaperContext::new(Scheduler::Htb).await.unwrap();
    nuke_lo(&ctx).await;

    // Apply: 1 Mbit up, 2 Mbit down.
    apply::apply(&ctx, "lo", peer, ip, 1000, 2000).await.unwrap();

    let qdiscs = tc_text(&ctx.tc, &["qdisc", "show", "dev", "lo"]).await;
    assert!(qdiscs.contains("qdisc htb"), "expected htb root, got: {qdiscs}");

    let download_class = display_form(&class_id(peer, Direction::Download).unwrap()).unwrap();
    let classes = tc_text(&ctx.tc, &["class", "show", "dev", "lo"]).await;
    assert!(
        classes.contains(&download_class),
        "download class {download_class} missing from: {classes}"
    );
    assert!(
        classes.contains("2Mbit"),
        "download rate missing from: {classes}"
    );

    if check_ifb_support(&ctx).await {
        let ifb_dev = ifb_name("lo");
        let link = ctx.tc.ip(&["link", "show", &ifb_dev]).await.unwrap();
        assert!(link.success, "IFB mirror {ifb_dev} should exist");

        let upload_class = display_form(&class_id(peer, Direction::Upload).unwrap()).unwrap();
        let ifb_classes = tc_text(&ctx.tc, &["class", "show", "dev", &ifb_dev]).await;
        assert!(
            ifb_classes.contains(&upload_class),
            "upload class {upload_class} missing from: {ifb_classes}"
        );
        assert!(
            ifb_classes.contains("1Mbit"),
            "upload rate missing from: {ifb_classes}"
        );
    } else {
        eprintln!("IFB unsupported here, upload side fell back to policing");
    }

    // Remove: the peer's class goes away, the default class stays.
    apply::remove(&ctx, "lo", peer, ip).await.unwrap();

    let classes = tc_text(&ctx.tc, &["class", "show", "dev", "lo"]).await;
    assert!(
        !classes.contains(&download_class),
        "download class {download_class} should be gone, got: {classes}"
    );
    assert!(
        classes.contains("1:99"),
        "default class should survive removal, got: {classes}"
    );

    // Nuke: both the root qdisc and the IFB mirror disappear.
    apply::nuke(&ctx, "lo").await.unwrap();

    let qdiscs = tc_text(&ctx.tc, &["qdisc", "show", "dev", "lo"]).await;
    assert!(!qdiscs.contains("qdisc htb"), "htb should be gone, got: {qdiscs}");

    let link = ctx.tc.ip(&["link", "show", &ifb_name("lo")]).await.unwrap();
    assert!(!link.success, "IFB mirror should be gone after nuke");
}

#[tokio::test]
async fn test_cake_uses_policing_filters() {
    require_root!();
    let _lock = LO_LOCK.lock().unwrap();

    let peer = "integration-test-peer-cake";
    let ip = "127.0.0.1/32";

    let ctx = ShaperContext::new(Scheduler::Cake).await.unwrap();
    nuke_lo(&ctx).await;

    apply::apply(&ctx, "lo", peer, ip, 1000, 2000).await.unwrap();

    let qdiscs = tc_text(&ctx.tc, &["qdisc", "show", "dev", "lo"]).await;
    if !qdiscs.contains("qdisc cake") {
        eprintln!("kernel lacks CAKE, fell back to HTB; skipping CAKE assertions");
        nuke_lo(&ctx).await;
        return;
    }

    // No peer classes under CAKE.
    let classes = tc_text(&ctx.tc, &["class", "show", "dev", "lo"]).await;
    let download_class = display_form(&class_id(peer, Direction::Download).unwrap()).unwrap();
    assert!(
        !classes.contains(&download_class),
        "CAKE must not create classes, got: {classes}"
    );

    // Download policing at the ingress hook, upload at the CAKE root.
    let ingress_filters =
        tc_text(&ctx.tc, &["filter", "show", "dev", "lo", "parent", "ffff:"]).await;
    assert!(
        ingress_filters.contains("police"),
        "expected ingress policing filter, got: {ingress_filters}"
    );

    let egress_filters =
        tc_text(&ctx.tc, &["filter", "show", "dev", "lo", "parent", "1:"]).await;
    assert!(
        egress_filters.contains("police"),
        "expected egress policing filter, got: {egress_filters}"
    );

    // Removal deletes the filters but keeps the CAKE qdisc for other peers.
    apply::remove(&ctx, "lo", peer, ip).await.unwrap();
    let qdiscs = tc_text(&ctx.tc, &["qdisc", "show", "dev", "lo"]).await;
    assert!(
        qdiscs.contains("qdisc cake"),
        "CAKE qdisc must survive peer removal, got: {qdiscs}"
    );

    nuke_lo(&ctx).await;
}

#[tokio::test]
async fn test_ipv6_filter_gets_its_own_priority() {
    require_root!();
    let _lock = LO_LOCK.lock().unwrap();

    let peer = "integration-test-peer-v6";
    let ip = "::1/128";

    let ctx = ShaperContext::new(Scheduler::Htb).await.unwrap();
    nuke_lo(&ctx).await;

    // Download-only apply keeps the scenario off the IFB path.
    apply::apply(&ctx, "lo", peer, ip, 0, 2000).await.unwrap();

    let filters = tc_text(&ctx.tc, &["filter", "show", "dev", "lo", "parent", "1:"]).await;
    assert!(
        filters.contains("protocol ipv6 pref 2"),
        "IPv6 filter must sit at priority 2, got: {filters}"
    );

    nuke_lo(&ctx).await;
}
