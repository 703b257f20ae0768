//! Local key-value store backing the DHT and the agent directory.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

#[derive(Default)]
pub struct LocalDataStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl LocalDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: String, value: Value) {
        self.entries.write().await.insert(key, value);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.entries.write().await.remove(key)
    }

    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.read().await.clone()
    }
}
