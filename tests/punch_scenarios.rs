//! End-to-end punch scenarios across three simulated nodes.
//!
//! Layout used throughout: `A` is the target behind NAT (10.0.0.1:6881 mapped
//! to port 40001), `B` the reachable rendezvous, `C` the originator behind its
//! own NAT (mapped to port 40003).

use rendezvous_core::{Contact, FailureKind, MessageKind, NoClientData, Puncher, RendezvousPhase};
use rendezvous_integration_tests::{
    Cluster, RecordingAdapter, SETTLE, addr, contact, destroy_all, payload, wait_until,
};
use std::net::IpAddr;
use std::sync::Arc;

struct Trio {
    cluster: Cluster,
    a: Puncher,
    b: Puncher,
    c: Puncher,
    adapter: RecordingAdapter,
}

async fn trio() -> Trio {
    let cluster = Cluster::new();
    let b = cluster.reachable("10.0.0.2:6881");
    let adapter = RecordingAdapter::replying(payload("k2", "v2"));
    let a = cluster.behind_nat("10.0.0.1:6881", 40001, Arc::new(adapter.clone()));
    let c = cluster.behind_nat("10.0.0.3:6881", 40003, Arc::new(NoClientData));

    assert!(
        wait_until(SETTLE, || a.operational() && c.operational()).await,
        "both NAT nodes should bind to B"
    );

    Trio {
        cluster,
        a,
        b,
        c,
        adapter,
    }
}

#[tokio::test]
async fn test_punch_through_published_rendezvous() {
    let t = trio().await;
    assert_eq!(t.a.rendezvous().unwrap().address(), addr("10.0.0.2:6881"));
    assert_eq!(t.a.phase(), RendezvousPhase::Operational);

    let target = Contact::from_address(addr("10.0.0.1:6881"));
    let mut via = None;
    let reply = t
        .c
        .punch("test", &target, &mut via, Some(payload("k1", "v1")))
        .await;

    assert_eq!(reply, Some(payload("k2", "v2")));
    assert_eq!(via.unwrap().address(), addr("10.0.0.2:6881"));

    // The NAT remapping of A's port was learned from the punch reply
    assert_eq!(target.transport_port(), 40001);
    assert_eq!(target.address().port(), 6881);

    // A saw C as B observed it, and got C's payload
    let seen = t.adapter.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, addr("10.0.0.3:40003"));
    assert_eq!(seen[0].1, payload("k1", "v1"));

    let c_stats = t.c.stats();
    assert_eq!(c_stats.punch_send_ok, 1);
    assert_eq!(c_stats.punch_send_fail, 0);
    assert_eq!(c_stats.message_count(MessageKind::PunchRequest), 1);

    let b_stats = t.b.stats();
    assert_eq!(b_stats.punch_recv_ok, 1);
    assert_eq!(b_stats.punch_recv_fail, 0);
    assert_eq!(b_stats.message_count(MessageKind::ConnectRequest), 1);
    assert_eq!(b_stats.bindings.len(), 2);

    assert_eq!(t.a.stats().message_count(MessageKind::ConnectRequest), 1);

    destroy_all(&[&t.c, &t.a, &t.b]).await;
}

#[tokio::test]
async fn test_tunnel_probes_cross_both_nats() {
    let t = trio().await;
    let target = Contact::from_address(addr("10.0.0.1:6881"));

    assert!(t.c.punch("test", &target, &mut None, None).await.is_some());

    // Each side only counts the other's kind of probe on receipt
    assert!(
        wait_until(SETTLE, || {
            t.a.stats().message_count(MessageKind::TunnelOutbound) > 0
                && t.c.stats().message_count(MessageKind::TunnelInbound) > 0
        })
        .await,
        "each side should have received the other's probe"
    );

    destroy_all(&[&t.c, &t.a, &t.b]).await;
}

#[tokio::test]
async fn test_lookup_is_cached_between_punches() {
    let t = trio().await;
    let target = Contact::from_address(addr("10.0.0.1:6881"));

    assert!(t.c.punch("first", &target, &mut None, None).await.is_some());
    let gets = t.cluster.network.dht_gets();
    assert!(gets >= 1);

    assert!(t.c.punch("second", &target, &mut None, None).await.is_some());
    assert_eq!(t.cluster.network.dht_gets(), gets);
    assert_eq!(t.c.stats().punch_send_ok, 2);

    destroy_all(&[&t.c, &t.a, &t.b]).await;
}

#[tokio::test]
async fn test_punch_address_writes_back_transport_address() {
    let t = trio().await;

    let mut target = addr("10.0.0.1:6881");
    let reply = t.c.punch_address("by-address", &mut target, None).await;

    assert_eq!(reply, Some(payload("k2", "v2")));
    assert_eq!(target, addr("10.0.0.1:40001"));

    destroy_all(&[&t.c, &t.a, &t.b]).await;
}

#[tokio::test]
async fn test_message_only_send_skips_tunnel() {
    let t = trio().await;

    let reply = t
        .c
        .send_message(
            addr("10.0.0.2:6881"),
            addr("10.0.0.1:6881"),
            payload("msg", "hello"),
        )
        .await;
    assert_eq!(reply, Some(payload("k2", "v2")));
    assert_eq!(t.adapter.seen()[0].1, payload("msg", "hello"));

    // Give any stray probe time to show up before asserting there were none
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    for node in [&t.a, &t.c] {
        let stats = node.stats();
        assert_eq!(stats.message_count(MessageKind::TunnelInbound), 0);
        assert_eq!(stats.message_count(MessageKind::TunnelOutbound), 0);
    }
    assert_eq!(t.b.stats().punch_recv_ok, 1);

    // Relayed messages are not punches
    let c_stats = t.c.stats();
    assert_eq!(c_stats.punch_send_ok, 0);
    assert_eq!(c_stats.punch_send_fail, 0);

    destroy_all(&[&t.c, &t.a, &t.b]).await;
}

#[tokio::test]
async fn test_inbound_probe_corrects_stale_reported_port() {
    let cluster = Cluster::new();
    let b = cluster.reachable("10.0.0.2:6881");
    let (a, a_nat) = cluster.behind_nat_node(
        "10.0.0.1:6881",
        40001,
        Arc::new(RecordingAdapter::replying(payload("k2", "v2"))),
    );
    let (c, c_nat) = cluster.behind_nat_node("10.0.0.3:6881", 40003, Arc::new(NoClientData));

    // A's NAT gives flows towards C their own port, so the port B saw A bind
    // from is stale for C. C's NAT filters by host only.
    cluster
        .network
        .map_port_for_peer(&a_nat, IpAddr::from([10, 0, 0, 3]), 40011);
    c_nat.set_address_restricted(true);
    assert!(wait_until(SETTLE, || a.operational()).await);

    let target = contact("10.0.0.1:6881");
    let mut via = None;
    let reply = c.punch("stale port", &target, &mut via, None).await;

    assert_eq!(reply, Some(payload("k2", "v2")));
    assert_eq!(via.unwrap().address(), addr("10.0.0.2:6881"));
    assert_eq!(target.transport_port(), 40011);
    assert_eq!(target.transport_addr(), addr("10.0.0.1:40011"));
    assert!(c.stats().message_count(MessageKind::TunnelInbound) >= 1);

    destroy_all(&[&c, &a, &b]).await;
}

#[tokio::test]
async fn test_unbound_target_is_denied() {
    let t = trio().await;

    // D is behind NAT but never started, so B holds no binding for it
    let (d, _) = t.cluster.idle_behind_nat("10.0.0.4:6881", 40004);
    assert!(d.local_contact().is_none());
    let target = contact("10.0.0.4:6881");
    let mut via = Some(contact("10.0.0.2:6881"));

    assert!(t.c.punch("test", &target, &mut via, None).await.is_none());

    let c_stats = t.c.stats();
    assert_eq!(c_stats.punch_send_fail, 1);
    assert_eq!(c_stats.failure_count(FailureKind::Denied), 1);
    assert_eq!(t.b.stats().punch_recv_fail, 1);

    destroy_all(&[&t.c, &t.a, &t.b]).await;
}

#[tokio::test]
async fn test_explicit_rendezvous_for_target() {
    let cluster = Cluster::new();
    let b = cluster.reachable("10.0.0.2:6881");
    let a = cluster.behind_nat("10.0.0.1:6881", 40001, Arc::new(RecordingAdapter::replying(payload("k", "v"))));
    let (c, _) = cluster.idle_behind_nat("10.0.0.3:6881", 40003);
    assert!(wait_until(SETTLE, || a.operational()).await);

    let target = Contact::from_address(addr("10.0.0.1:6881"));
    c.set_rendezvous(&target, contact("10.0.0.2:6881"));

    let mut via = None;
    assert!(c.punch("explicit", &target, &mut via, None).await.is_some());
    assert_eq!(via, Some(contact("10.0.0.2:6881")));
    assert_eq!(cluster.network.dht_gets(), 0);

    destroy_all(&[&c, &a, &b]).await;
}

#[tokio::test]
async fn test_stats_line_describes_bindings() {
    let t = trio().await;

    let line = t.b.stats().to_string();
    assert!(line.starts_with("ok="));
    assert!(line.contains("bindings="));
    assert!(line.contains("10.0.0.1:6881->"));
    assert!(line.contains("messages="));

    let line = t.a.stats().to_string();
    assert!(line.contains("rendezvous=10.0.0.2"));

    destroy_all(&[&t.c, &t.a, &t.b]).await;
}
