//! End-to-end scenarios for the DHT-backed agent directory (S1, S2).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use agentmesh_directory::config::DhtConfig;
use agentmesh_directory::dht::client::DhtClient;
use agentmesh_directory::dht::directory::{AgentDirectory, BootstrapNode, DhtAgentRegistryService};
use agentmesh_directory::dht::node_id::NodeId;
use agentmesh_directory::dht::protocol::DhtProtocol;
use agentmesh_directory::dht::DhtNode;
use agentmesh_directory::error::Error;
use serde_json::json;

fn test_dht_config() -> DhtConfig {
    DhtConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        k: 20,
        request_timeout: Duration::from_secs(2),
        contact_staleness: Duration::from_secs(3600),
        replication_factor: 3,
    }
}

async fn start_node(config: &DhtConfig) -> (NodeId, Arc<DhtNode>, Arc<DhtProtocol>, Arc<AgentDirectory>) {
    let node_id = NodeId::random();
    let dht_node = Arc::new(DhtNode::new(
        node_id,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        config.port,
        config.k,
    ));
    let protocol = DhtProtocol::bind(
        node_id,
        &config.host,
        config.port,
        dht_node.routing_table(),
        dht_node.store(),
        config.request_timeout,
    )
    .await
    .unwrap();
    let client = Arc::new(DhtClient::new(protocol.clone(), dht_node.routing_table()));
    let directory = Arc::new(AgentDirectory::new(dht_node.clone(), client, config));
    (node_id, dht_node, protocol, directory)
}

#[tokio::test]
async fn s1_register_then_local_find() {
    let config = test_dht_config();
    let (node_id, _dht, _protocol, directory) = start_node(&config).await;

    let record = directory.register_agent("a1", json!({ "k": "v" })).await;
    assert_eq!(record.get("node_id").unwrap().as_str().unwrap(), node_id.to_hex());
    assert!(record.get("last_update").is_some());

    let found = directory.find_agent("a1").await.expect("a1 should be found locally");
    assert_eq!(found.get("k").unwrap().as_str().unwrap(), "v");
}

#[tokio::test]
async fn s2_dht_cross_node_find_via_ping_handshake_and_replication() {
    let config = test_dht_config();
    let (_id_a, _dht_a, protocol_a, directory_a) = start_node(&config).await;
    let (_id_b, _dht_b, protocol_b, directory_b) = start_node(&config).await;

    let addr_a = protocol_a.local_addr().unwrap();
    let addr_b = protocol_b.local_addr().unwrap();

    let client_b = DhtClient::new(protocol_b.clone(), _dht_b.routing_table());
    let contact_a = agentmesh_directory::dht::kbucket::Contact::new(_id_a, addr_a.ip(), addr_a.port());

    // B pings A: A's reply causes both sides to learn each other's contact.
    assert!(client_b.ping(&contact_a).await);
    let _ = addr_b; // addr_b only needed to confirm the bind succeeded above.

    directory_a.register_agent("a2", json!({ "k": "v2" })).await;
    // Replication to the closest contacts (which now includes B) runs in a
    // spawned task; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let found = directory_b
        .find_agent("a2")
        .await
        .expect("a2 should be discoverable on B after replication");
    assert_eq!(found.get("k").unwrap().as_str().unwrap(), "v2");
}

#[tokio::test]
async fn registry_service_refuses_before_start_and_bootstraps_on_start() {
    let config = test_dht_config();
    let (_id_a, _dht_a, protocol_a, directory_a) = start_node(&config).await;
    let (_id_b, dht_b, protocol_b, directory_b) = start_node(&config).await;

    let addr_a = protocol_a.local_addr().unwrap();
    let client_b = Arc::new(DhtClient::new(protocol_b.clone(), dht_b.routing_table()));
    let bootstrap = vec![BootstrapNode { ip: addr_a.ip(), port: addr_a.port() }];
    let registry_b = DhtAgentRegistryService::new(directory_b.clone(), client_b, dht_b.local_id(), bootstrap);

    // Before start(), every operation is refused.
    match registry_b.find_agent("anything").await {
        Err(Error::NotRunning) => {}
        other => panic!("expected NotRunning before start, got {other:?}"),
    }

    // start() pings the bootstrap node (A), which causes A to learn B too.
    registry_b.start().await;
    assert!(registry_b.is_running());

    directory_a.register_agent("a3", json!({ "k": "v3" })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let found = registry_b
        .find_agent("a3")
        .await
        .expect("running registry should answer find_agent")
        .expect("a3 should be discoverable on B via the bootstrap-learned contact");
    assert_eq!(found.get("k").unwrap().as_str().unwrap(), "v3");

    registry_b.stop();
    match registry_b.find_agent("a3").await {
        Err(Error::NotRunning) => {}
        other => panic!("expected NotRunning after stop, got {other:?}"),
    }
}
