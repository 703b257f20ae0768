//! DHT-backed agent registration and discovery, replicated to the k
//! closest contacts.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::callbacks::CallbackRegistry;
use crate::config::DhtConfig;

use super::client::DhtClient;
use super::kbucket::{Contact, RoutingTable};
use super::node_id::NodeId;
use super::store::agent_key;
use super::DhtNode;

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Clone, Debug)]
pub enum AgentEvent {
    Registered { agent_id: String, metadata: Value },
    Updated { agent_id: String, metadata: Value },
    Discovered { agent_id: String, metadata: Value },
}

pub type AgentEventHandler = crate::callbacks::Handler<AgentEvent>;

/// Publishes and discovers agent records, backed by the DHT. Replication is
/// best-effort broadcast to the `replication_factor` closest contacts; no
/// quorum is required and per-contact failures are ignored.
pub struct AgentDirectory {
    dht: Arc<DhtNode>,
    client: Arc<DhtClient>,
    routing_table: Arc<RoutingTable>,
    local_agents: RwLock<std::collections::HashMap<String, Value>>,
    callbacks: CallbackRegistry<AgentEvent>,
    replication_factor: usize,
}

impl AgentDirectory {
    pub fn new(dht: Arc<DhtNode>, client: Arc<DhtClient>, config: &DhtConfig) -> Self {
        Self {
            routing_table: dht.routing_table(),
            dht,
            client,
            local_agents: RwLock::new(std::collections::HashMap::new()),
            callbacks: CallbackRegistry::new(),
            replication_factor: config.replication_factor,
        }
    }

    pub async fn on(&self, event: &str, handler: AgentEventHandler) {
        self.callbacks.register(event, handler).await;
    }

    pub async fn register_agent(&self, agent_id: &str, mut metadata: Value) -> Value {
        stamp(&mut metadata, "registered_at");
        stamp(&mut metadata, "last_updated");
        let record = self.dht.register_agent(agent_id, metadata).await;
        self.local_agents
            .write()
            .await
            .insert(agent_id.to_string(), record.clone());
        self.callbacks
            .fire(
                "registered",
                AgentEvent::Registered {
                    agent_id: agent_id.to_string(),
                    metadata: record.clone(),
                },
            )
            .await;
        self.replicate(agent_id, record.clone()).await;
        record
    }

    pub async fn update_agent(&self, agent_id: &str, mut metadata: Value) -> Value {
        let registered_at = self
            .local_agents
            .read()
            .await
            .get(agent_id)
            .and_then(|v| v.get("registered_at").cloned());
        stamp(&mut metadata, "last_updated");
        if let (Value::Object(map), Some(registered_at)) = (&mut metadata, registered_at) {
            map.entry("registered_at").or_insert(registered_at);
        }
        let record = self.dht.register_agent(agent_id, metadata).await;
        self.local_agents
            .write()
            .await
            .insert(agent_id.to_string(), record.clone());
        self.callbacks
            .fire(
                "updated",
                AgentEvent::Updated {
                    agent_id: agent_id.to_string(),
                    metadata: record.clone(),
                },
            )
            .await;
        self.replicate(agent_id, record.clone()).await;
        record
    }

    /// Local cache, then the local DHT store, then a one-hop network
    /// search against the 3 contacts closest to the agent's key. No
    /// iterative deepening is performed.
    pub async fn find_agent(&self, agent_id: &str) -> Option<Value> {
        if let Some(v) = self.local_agents.read().await.get(agent_id).cloned() {
            return Some(v);
        }
        if let Some(v) = self.dht.find_agent(agent_id).await {
            return Some(v);
        }

        let key = agent_key(agent_id);
        let target = NodeId::from_string(&key);
        let contacts = self.routing_table.closest(&target, self.replication_factor).await;
        for contact in contacts {
            if contact.node_id == self.dht.local_id() {
                continue;
            }
            let (value, _) = self.client.find_value(&key, &contact).await;
            if let Some(value) = value {
                self.local_agents
                    .write()
                    .await
                    .insert(agent_id.to_string(), value.clone());
                self.callbacks
                    .fire(
                        "discovered",
                        AgentEvent::Discovered {
                            agent_id: agent_id.to_string(),
                            metadata: value.clone(),
                        },
                    )
                    .await;
                return Some(value);
            }
        }
        None
    }

    pub async fn snapshot(&self) -> std::collections::HashMap<String, Value> {
        self.local_agents.read().await.clone()
    }

    async fn replicate(&self, agent_id: &str, record: Value) {
        let key = agent_key(agent_id);
        let target = NodeId::from_string(&key);
        let contacts = self.routing_table.closest(&target, self.replication_factor).await;
        let local_id = self.dht.local_id();
        let client = self.client.clone();
        tokio::spawn(async move {
            for contact in contacts {
                if contact.node_id == local_id {
                    continue;
                }
                client.store(&key, record.clone(), &contact).await;
            }
        });
    }
}

/// A `(host, port)` seed used to bootstrap the routing table at startup.
#[derive(Clone, Debug)]
pub struct BootstrapNode {
    pub ip: IpAddr,
    pub port: u16,
}

/// Thin lifecycle wrapper around [`AgentDirectory`]: adds `start`/`stop` and
/// bootstrap-node discovery, mirroring `DHTAgentRegistryService` /
/// `AgentDirectory._bootstrap` in the Python original this overlay was
/// distilled from. Registration/update/find are delegated straight through;
/// `start`/`stop` are idempotent and `register_agent`/`update_agent`/
/// `find_agent` are refused with [`crate::error::Error::NotRunning`] before
/// `start` or after `stop`, matching that original's `if not self.running`
/// guards.
pub struct DhtAgentRegistryService {
    directory: Arc<AgentDirectory>,
    client: Arc<DhtClient>,
    local_id: NodeId,
    bootstrap_nodes: Vec<BootstrapNode>,
    running: AtomicBool,
}

impl DhtAgentRegistryService {
    pub fn new(directory: Arc<AgentDirectory>, client: Arc<DhtClient>, local_id: NodeId, bootstrap_nodes: Vec<BootstrapNode>) -> Self {
        Self {
            directory,
            client,
            local_id,
            bootstrap_nodes,
            running: AtomicBool::new(false),
        }
    }

    /// Pings each bootstrap node and, for ones that reply, runs a
    /// `find_node(local_id, ...)` against it to seed the routing table with
    /// its neighbors — exactly the original's `_bootstrap` sequence.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("dht agent registry service starting, {} bootstrap nodes", self.bootstrap_nodes.len());
        for seed in &self.bootstrap_nodes {
            let bootstrap_id = NodeId::from_string(&format!("{}:{}", seed.ip, seed.port));
            let contact = Contact::new(bootstrap_id, seed.ip, seed.port);
            if self.client.ping(&contact).await {
                log::info!("connected to bootstrap node {}:{}", seed.ip, seed.port);
                let discovered = self.client.find_node(&self.local_id, &contact).await;
                log::info!("discovered {} nodes from bootstrap", discovered.len());
            } else {
                log::warn!("bootstrap node {}:{} did not respond to ping", seed.ip, seed.port);
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn register_agent(&self, agent_id: &str, metadata: Value) -> crate::error::Result<Value> {
        if !self.is_running() {
            return Err(crate::error::Error::NotRunning);
        }
        Ok(self.directory.register_agent(agent_id, metadata).await)
    }

    pub async fn update_agent(&self, agent_id: &str, metadata: Value) -> crate::error::Result<Value> {
        if !self.is_running() {
            return Err(crate::error::Error::NotRunning);
        }
        Ok(self.directory.update_agent(agent_id, metadata).await)
    }

    pub async fn find_agent(&self, agent_id: &str) -> crate::error::Result<Option<Value>> {
        if !self.is_running() {
            return Err(crate::error::Error::NotRunning);
        }
        Ok(self.directory.find_agent(agent_id).await)
    }

    pub async fn list_agents(&self) -> std::collections::HashMap<String, Value> {
        self.directory.snapshot().await
    }

    pub async fn on(&self, event: &str, handler: AgentEventHandler) {
        self.directory.on(event, handler).await;
    }
}

fn stamp(metadata: &mut Value, field: &str) {
    if let Value::Object(map) = metadata {
        map.insert(field.to_string(), Value::from(now_unix()));
    } else {
        let mut map = serde_json::Map::new();
        map.insert(field.to_string(), Value::from(now_unix()));
        *metadata = Value::Object(map);
    }
}
