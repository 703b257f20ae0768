//! Property-style tests that don't fit naturally as `#[cfg(test)]` unit
//! tests because they need real UDP sockets and multiple running services.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use agentmesh_directory::config::GossipConfig;
use agentmesh_directory::dht::node_id::NodeId;
use agentmesh_directory::gossip::message::GossipMessage;
use agentmesh_directory::gossip::presence::AgentPresenceService;
use agentmesh_directory::gossip::protocol::{GossipEvent, GossipService};
use proptest::prelude::*;
use tokio::net::UdpSocket;

fn fast_gossip_config() -> GossipConfig {
    GossipConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        seed_nodes: Vec::new(),
        gossip_interval: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(60),
        suspicion_timeout: Duration::from_secs(60),
        dead_timeout: Duration::from_secs(60),
        max_ttl: 3,
    }
}

proptest! {
    #[test]
    fn xor_distance_is_symmetric_and_reflexive(a_seed in any::<[u8; 20]>(), b_seed in any::<[u8; 20]>()) {
        let a = NodeId(a_seed);
        let b = NodeId(b_seed);
        prop_assert_eq!(a.distance(&b), b.distance(&a));
        prop_assert!(a.distance(&a).is_zero());
    }
}

#[tokio::test]
async fn dedup_fires_handlers_exactly_once() {
    let config = fast_gossip_config();
    let id_a = NodeId::random();
    let gossip_a = GossipService::bind(id_a, config).await.unwrap();
    let addr_a = gossip_a.local_addr().unwrap();
    let mut events = gossip_a.subscribe();

    let sender_id = NodeId::random();
    let msg = GossipMessage::new(
        sender_id.to_hex(),
        "agent_active",
        serde_json::json!({ "presence": null }),
        1234.0,
        3,
    );
    let bytes = serde_json::to_vec(&msg).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&bytes, addr_a).await.unwrap();
    client.send_to(&bytes, addr_a).await.unwrap();

    let mut seen = 0;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        if let GossipEvent::Message(m) = event {
            if m.id == msg.id {
                seen += 1;
            }
        }
    }
    assert_eq!(seen, 1);
}

#[tokio::test]
async fn ping_to_a_live_peer_always_yields_an_ack_addressed_back() {
    let config = fast_gossip_config();
    let id_a = NodeId::random();
    let id_b = NodeId::random();
    let gossip_a = GossipService::bind(id_a, config.clone()).await.unwrap();
    let gossip_b = GossipService::bind(id_b, config).await.unwrap();

    let addr_a = gossip_a.local_addr().unwrap();
    let addr_b = gossip_b.local_addr().unwrap();
    gossip_a.add_peer(id_b, addr_b.ip(), addr_b.port()).await;
    gossip_b.add_peer(id_a, addr_a.ip(), addr_a.port()).await;

    let mut events_a = gossip_a.subscribe();
    gossip_a
        .send_direct(id_b, agentmesh_directory::gossip::message::PING, serde_json::json!({}))
        .await;

    let event = tokio::time::timeout(Duration::from_millis(500), events_a.recv())
        .await
        .expect("ack should arrive before timeout")
        .unwrap();
    match event {
        GossipEvent::Acknowledged { peer_id } => assert_eq!(peer_id, id_b),
        other => panic!("expected an Acknowledged event, got {other:?}"),
    }
}

#[tokio::test]
async fn ttl_decay_bounds_propagation_to_three_hops() {
    // A chain N0 - N1 - N2 - N3 - N4 where each node only knows its
    // immediate neighbors. A message with TTL=3 originating at N0 should
    // reach N1, N2, N3 but never N4.
    let config = fast_gossip_config();
    let mut ids = Vec::new();
    let mut services = Vec::new();
    for _ in 0..5 {
        let id = NodeId::random();
        let svc = GossipService::bind(id, config.clone()).await.unwrap();
        ids.push(id);
        services.push(svc);
    }

    for i in 0..services.len() {
        if i > 0 {
            let addr = services[i - 1].local_addr().unwrap();
            services[i].add_peer(ids[i - 1], addr.ip(), addr.port()).await;
        }
        if i + 1 < services.len() {
            let addr = services[i + 1].local_addr().unwrap();
            services[i].add_peer(ids[i + 1], addr.ip(), addr.port()).await;
        }
    }

    let presences: Vec<_> = services
        .iter()
        .map(|s| {
            let p = AgentPresenceService::new(s.clone());
            p.start();
            p
        })
        .collect();

    presences[0].register_agent("g1", vec!["relay-test".to_string()]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for (i, presence) in presences.iter().enumerate().take(4) {
        assert!(
            presence.get_by_capability("relay-test").await.iter().any(|p| p.agent_id == "g1"),
            "node {i} should have received the propagated agent record within 3 hops"
        );
    }
    assert!(
        presences[4].get_by_capability("relay-test").await.is_empty(),
        "node 4 hops away should not receive a TTL=3 message"
    );
}
