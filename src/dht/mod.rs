//! Kademlia-style DHT: routing table, wire protocol, one-hop client, and
//! the DHT-backed agent directory.

pub mod client;
pub mod directory;
pub mod kbucket;
pub mod node_id;
pub mod protocol;
pub mod store;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::callbacks::CallbackRegistry;

use self::kbucket::RoutingTable;
use self::node_id::NodeId;
use self::store::{agent_key, LocalDataStore};

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Owns the local node's identity, routing table, and data store; provides
/// the local-only register/find/store/lookup primitives and a generic
/// callback registry. Network replication and multi-contact search live one
/// layer up, in [`directory`].
pub struct DhtNode {
    local_id: NodeId,
    local_ip: IpAddr,
    local_port: u16,
    routing_table: Arc<RoutingTable>,
    store: Arc<LocalDataStore>,
    callbacks: CallbackRegistry<Value>,
}

impl DhtNode {
    pub fn new(local_id: NodeId, local_ip: IpAddr, local_port: u16, k: usize) -> Self {
        Self {
            local_id,
            local_ip,
            local_port,
            routing_table: Arc::new(RoutingTable::new(local_id, k)),
            store: Arc::new(LocalDataStore::new()),
            callbacks: CallbackRegistry::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.routing_table.clone()
    }

    pub fn store(&self) -> Arc<LocalDataStore> {
        self.store.clone()
    }

    pub async fn put(&self, key: String, value: Value) {
        self.store.put(key, value).await;
    }

    pub async fn lookup(&self, key: &str) -> Option<Value> {
        self.store.get(key).await
    }

    /// Stamps `last_update`, `node_id`, `node_ip`, `node_port` into a copy
    /// of `metadata` and stores it under `agent:<agent_id>`. Returns the
    /// stamped record.
    pub async fn register_agent(&self, agent_id: &str, metadata: Value) -> Value {
        let mut record = match metadata {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        record.insert("last_update".to_string(), json!(now_unix()));
        record.insert("node_id".to_string(), json!(self.local_id.to_hex()));
        record.insert("node_ip".to_string(), json!(self.local_ip.to_string()));
        record.insert("node_port".to_string(), json!(self.local_port));
        let record = Value::Object(record);
        self.store.put(agent_key(agent_id), record.clone()).await;
        record
    }

    pub async fn find_agent(&self, agent_id: &str) -> Option<Value> {
        self.store.get(&agent_key(agent_id)).await
    }

    pub async fn register_callback(&self, event: impl Into<String>, handler: self::callback_handler::Handler) {
        self.callbacks.register(event, handler).await;
    }

    pub async fn trigger_callbacks(&self, event: &str, data: Value) {
        self.callbacks.fire(event, data).await;
    }
}

/// Re-exported alias so callers don't need to name `CallbackRegistry`'s
/// generic handler type directly.
pub mod callback_handler {
    use crate::callbacks::Handler as GenericHandler;
    use serde_json::Value;
    pub type Handler = GenericHandler<Value>;
}

pub const DEFAULT_CONTACT_STALENESS: Duration = Duration::from_secs(3600);
