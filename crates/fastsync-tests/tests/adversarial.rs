//! Catch-up in the presence of misbehaving or vanishing peers.
//!
//! Attack vectors tested:
//! - A peer serving blocks whose hash does not match the signed commit
//! - A peer that advertises a height and then never answers
//! - A peer disconnecting mid-sync, and every peer disconnecting
//! - Garbage on the sync channel

use std::time::Duration;

use bytes::Bytes;
use fastsync_core::traits::Transport;
use fastsync_core::types::PeerId;
use fastsync_network::{MemoryNetwork, SyncMessage};
use fastsync_node::Validators;
use fastsync_tests::helpers::*;

const LIMIT: Duration = Duration::from_secs(120);

#[tokio::test(start_paused = true)]
async fn forging_peer_is_evicted_and_sync_completes() {
    let validators = Validators::deterministic(4);
    let chain = build_chain(&validators, 50);
    let forged = forge_chain(&chain);
    let net = MemoryNetwork::new();

    // Sorts first, so it is preferred on ties and gets work right away.
    let forger = TestNode::serving(&net, "a-forger", &forged, &validators);
    let honest: Vec<TestNode> = ["b", "c"]
        .iter()
        .map(|id| TestNode::serving(&net, id, &chain, &validators))
        .collect();
    let mut node = TestNode::spawn(&net, "lagging", store_with(&chain, 0), test_config(), &validators);
    net.connect(&node.id, &forger.id);
    for server in &honest {
        net.connect(&node.id, &server.id);
    }

    node.start_sync();
    let switch = node.wait_for_switch(LIMIT).await.expect("node never caught up");
    assert_eq!(switch.height, 50);
    assert_synced_to(&node.store, &chain, 49);

    let linked = node.linked_peers();
    assert!(!linked.contains(&forger.id), "forger still connected: {linked:?}");
    assert_eq!(linked.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn only_forging_peers_means_no_progress() {
    let validators = Validators::deterministic(4);
    let chain = build_chain(&validators, 20);
    let forged = forge_chain(&chain);
    let net = MemoryNetwork::new();

    let forger = TestNode::serving(&net, "forger", &forged, &validators);
    let mut node = TestNode::spawn(&net, "victim", store_with(&chain, 0), test_config(), &validators);
    net.connect(&node.id, &forger.id);

    node.start_sync();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!node.switched());
    assert_eq!(node.height(), 0);
    assert!(node.linked_peers().is_empty());
    assert_eq!(node.reactor.pool().num_peers(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_and_work_moves_on() {
    let validators = Validators::deterministic(1);
    let chain = build_chain(&validators, 30);
    let net = MemoryNetwork::new();

    // Joins without a reactor: it never answers anything.
    let (silent, _silent_events) = net.join("a-silent");
    let server = TestNode::serving(&net, "server", &chain, &validators);
    let mut node = TestNode::spawn(&net, "lagging", store_with(&chain, 0), test_config(), &validators);
    let silent_id = PeerId::from("a-silent");
    net.connect(&node.id, &silent_id);
    net.connect(&node.id, &server.id);

    let status = SyncMessage::StatusResponse { height: 30 }.encode().unwrap();
    assert!(silent.try_send(&node.id, 0x40, status));

    node.start_sync();
    let switch = node.wait_for_switch(LIMIT).await.expect("node never caught up");
    assert_eq!(switch.height, 30);
    assert_synced_to(&node.store, &chain, 29);
    assert_eq!(node.linked_peers(), vec![PeerId::from("server")]);
}

#[tokio::test(start_paused = true)]
async fn peer_loss_mid_sync_reassigns_work() {
    let validators = Validators::deterministic(1);
    let chain = build_chain(&validators, 200);
    let net = MemoryNetwork::new();

    let a = TestNode::serving(&net, "a", &chain, &validators);
    let b = TestNode::serving(&net, "b", &chain, &validators);
    let mut node = TestNode::spawn(&net, "lagging", store_with(&chain, 0), test_config(), &validators);
    net.connect(&node.id, &a.id);
    net.connect(&node.id, &b.id);

    node.start_sync();
    assert!(wait_until(LIMIT, || node.height() >= 20).await);
    assert!(net.disconnect(&node.id, &a.id, "test"));

    let switch = node.wait_for_switch(LIMIT).await.expect("node never caught up");
    assert_eq!(switch.height, 200);
    assert_synced_to(&node.store, &chain, 199);
    assert_eq!(node.reactor.pool().num_peers(), 1);
}

#[tokio::test(start_paused = true)]
async fn losing_every_peer_stalls_until_one_returns() {
    let validators = Validators::deterministic(1);
    let chain = build_chain(&validators, 200);
    let net = MemoryNetwork::new();

    let server = TestNode::serving(&net, "server", &chain, &validators);
    let mut node = TestNode::spawn(&net, "lagging", store_with(&chain, 0), test_config(), &validators);
    net.connect(&node.id, &server.id);

    node.start_sync();
    assert!(wait_until(LIMIT, || node.height() >= 10).await);
    net.disconnect(&node.id, &server.id, "test");

    tokio::time::sleep(Duration::from_secs(5)).await;
    let stalled_at = node.height();
    assert!(stalled_at < 199);
    assert!(!node.switched());
    assert_eq!(node.reactor.pool().num_peers(), 0);

    // Reconnecting registers a fresh peer record and sync resumes.
    assert!(net.connect(&node.id, &server.id));
    let switch = node.wait_for_switch(LIMIT).await.expect("node never caught up");
    assert_eq!(switch.height, 200);
    assert_synced_to(&node.store, &chain, 199);
}

#[tokio::test(start_paused = true)]
async fn garbage_on_the_sync_channel_is_ignored() {
    let validators = Validators::deterministic(1);
    let chain = build_chain(&validators, 15);
    let net = MemoryNetwork::new();

    let (noisy, _noisy_events) = net.join("noisy");
    let server = TestNode::serving(&net, "server", &chain, &validators);
    let mut node = TestNode::spawn(&net, "lagging", store_with(&chain, 0), test_config(), &validators);
    let noisy_id = PeerId::from("noisy");
    net.connect(&node.id, &noisy_id);
    net.connect(&node.id, &server.id);

    for junk in [&b""[..], &b"\xff\xff\xff"[..], &[0x11, 0x02, 0x00, 0x01][..]] {
        assert!(noisy.try_send(&node.id, 0x40, Bytes::copy_from_slice(junk)));
    }
    // Other channels are not ours to read.
    assert!(noisy.try_send(&node.id, 0x41, Bytes::from_static(b"hello")));

    node.start_sync();
    let switch = node.wait_for_switch(LIMIT).await.expect("node never caught up");
    assert_eq!(switch.height, 15);
    assert_synced_to(&node.store, &chain, 14);
    assert!(node.linked_peers().contains(&noisy_id));
}
