//! Config-driven integration facade: wires the DHT and gossip overlays
//! into a single running node and owns their lifecycle.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::config::Config;
use crate::dht::client::DhtClient;
use crate::dht::directory::{AgentDirectory, BootstrapNode, DhtAgentRegistryService};
use crate::dht::node_id::NodeId;
use crate::dht::protocol::DhtProtocol;
use crate::dht::DhtNode;
use crate::error::Result;
use crate::gossip::presence::AgentPresenceService;
use crate::gossip::protocol::GossipService;

pub struct AgentMeshNode {
    pub node_id: NodeId,
    pub dht: Arc<DhtNode>,
    pub dht_protocol: Arc<DhtProtocol>,
    pub registry: Arc<DhtAgentRegistryService>,
    pub gossip: Arc<GossipService>,
    pub presence: Arc<AgentPresenceService>,
}

impl AgentMeshNode {
    pub async fn start(config: &Config) -> Result<Arc<Self>> {
        let node_id = if config.p2p.node_id.is_empty() {
            NodeId::random()
        } else {
            NodeId::from_string(&config.p2p.node_id)
        };
        log::info!("starting agent mesh node {node_id}");

        let dht_ip: IpAddr = config
            .p2p
            .dht
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let dht_node = Arc::new(DhtNode::new(node_id, dht_ip, config.p2p.dht.port, config.p2p.dht.k));
        let dht_protocol = DhtProtocol::bind(
            node_id,
            &config.p2p.dht.host,
            config.p2p.dht.port,
            dht_node.routing_table(),
            dht_node.store(),
            config.p2p.dht.request_timeout,
        )
        .await?;
        let dht_client = Arc::new(DhtClient::new(dht_protocol.clone(), dht_node.routing_table()));
        let directory = Arc::new(AgentDirectory::new(dht_node.clone(), dht_client.clone(), &config.p2p.dht));

        // The DHT and gossip overlays bootstrap from the same seed-node
        // list (§6 only names one `seed_nodes` key); each overlay derives
        // its own bootstrap NodeID from the (host, port) pair independently.
        let dht_bootstrap: Vec<BootstrapNode> = config
            .p2p
            .gossip
            .seed_nodes
            .iter()
            .filter_map(|seed| {
                seed.host.parse::<IpAddr>().ok().map(|ip| BootstrapNode { ip, port: seed.port })
            })
            .collect();
        let registry = Arc::new(DhtAgentRegistryService::new(directory, dht_client, node_id, dht_bootstrap));
        registry.start().await;

        let gossip = GossipService::bind(node_id, config.p2p.gossip.clone()).await?;
        gossip.start();
        let presence = AgentPresenceService::new(gossip.clone());
        presence.start();

        for seed in &config.p2p.gossip.seed_nodes {
            match (NodeId::from_hex(&seed.node_id), seed.host.parse::<IpAddr>()) {
                (Some(seed_id), Ok(ip)) => gossip.add_peer(seed_id, ip, seed.port).await,
                _ => log::warn!("skipping malformed seed node entry: {}@{}:{}", seed.node_id, seed.host, seed.port),
            }
        }

        Ok(Arc::new(Self {
            node_id,
            dht: dht_node,
            dht_protocol,
            registry,
            gossip,
            presence,
        }))
    }

    pub fn stop(&self) {
        self.gossip.stop();
        self.dht_protocol.stop();
        self.registry.stop();
    }
}
