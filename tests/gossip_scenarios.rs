//! End-to-end scenarios for gossip membership and agent presence (S3, S4, S5, S6).

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use agentmesh_directory::config::GossipConfig;
use agentmesh_directory::dht::node_id::NodeId;
use agentmesh_directory::gossip::peer::PeerState;
use agentmesh_directory::gossip::presence::AgentPresenceService;
use agentmesh_directory::gossip::protocol::GossipService;

fn fast_gossip_config() -> GossipConfig {
    GossipConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        seed_nodes: Vec::new(),
        gossip_interval: Duration::from_secs(60),
        cleanup_interval: Duration::from_millis(50),
        suspicion_timeout: Duration::from_millis(120),
        dead_timeout: Duration::from_millis(150),
        max_ttl: 3,
    }
}

#[tokio::test]
async fn s3_discover_and_s5_presence_inactive() {
    let config = fast_gossip_config();
    let id_a = NodeId::random();
    let id_b = NodeId::random();

    let gossip_a = GossipService::bind(id_a, config.clone()).await.unwrap();
    let gossip_b = GossipService::bind(id_b, config.clone()).await.unwrap();
    gossip_a.start();
    gossip_b.start();

    let addr_a = gossip_a.local_addr().unwrap();
    let addr_b = gossip_b.local_addr().unwrap();
    gossip_a.add_peer(id_b, addr_b.ip(), addr_b.port()).await;
    gossip_b.add_peer(id_a, addr_a.ip(), addr_a.port()).await;

    let presence_a = AgentPresenceService::new(gossip_a.clone());
    let presence_b = AgentPresenceService::new(gossip_b.clone());
    presence_a.start();
    presence_b.start();

    presence_a.register_agent("g1", vec!["text".to_string()]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let matches = presence_b.get_by_capability("text").await;
    assert!(matches.iter().any(|p| p.agent_id == "g1"));

    // S5: A unregisters g1; B should observe agent_inactive and drop it.
    presence_a.unregister_agent("g1").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let matches = presence_b.get_by_capability("text").await;
    assert!(!matches.iter().any(|p| p.agent_id == "g1"));
}

#[tokio::test]
async fn s4_gossip_failure_detection() {
    let config = fast_gossip_config();
    let id_a = NodeId::random();
    let gossip_a = GossipService::bind(id_a, config).await.unwrap();
    gossip_a.start();

    // An unreachable peer that will never send a reply.
    let silent_peer = NodeId::random();
    gossip_a
        .add_peer(silent_peer, IpAddr::V4(Ipv4Addr::LOCALHOST), 1)
        .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    let peers = gossip_a.peers_snapshot().await;
    assert_eq!(peers.get(&silent_peer).unwrap().state, PeerState::Suspect);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let peers = gossip_a.peers_snapshot().await;
    assert_eq!(peers.get(&silent_peer).unwrap().state, PeerState::Dead);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let peers = gossip_a.peers_snapshot().await;
    assert!(!peers.contains_key(&silent_peer));
}

#[tokio::test]
async fn s6_query_without_prior_knowledge() {
    let config = fast_gossip_config();
    let id_a = NodeId::random();
    let id_c = NodeId::random();

    let gossip_a = GossipService::bind(id_a, config.clone()).await.unwrap();
    let gossip_c = GossipService::bind(id_c, config.clone()).await.unwrap();
    gossip_a.start();
    gossip_c.start();

    let presence_a = AgentPresenceService::new(gossip_a.clone());
    let presence_c = AgentPresenceService::new(gossip_c.clone());
    presence_a.start();
    presence_c.start();

    // A registers g1 while C isn't yet peered with it, so the agent_active
    // broadcast (direct, not periodic) never reaches C — matching S6's
    // "C joins after S3 with no gossip state about g1".
    presence_a.register_agent("g1", vec!["text".to_string()]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // C joins A's overlay only now.
    let addr_a = gossip_a.local_addr().unwrap();
    let addr_c = gossip_c.local_addr().unwrap();
    gossip_a.add_peer(id_c, addr_c.ip(), addr_c.port()).await;
    gossip_c.add_peer(id_a, addr_a.ip(), addr_a.port()).await;

    // C has no prior gossip state about g1: query returns nothing synchronously.
    let immediate = presence_c.query_agent("g1").await;
    assert!(immediate.is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let resolved = presence_c.query_agent("g1").await;
    assert!(resolved.is_some());
}
