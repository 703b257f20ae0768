//! Agent presence over gossip: local/remote agent maps, capability index,
//! and the active/inactive/query/info propagation rules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};

use crate::callbacks::CallbackRegistry;
use crate::dht::node_id::NodeId;

use super::message::{self};
use super::protocol::{GossipEvent, GossipService};

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPresence {
    pub agent_id: String,
    pub node_id: String,
    pub capabilities: HashSet<String>,
    pub last_updated: f64,
    pub status: String,
}

impl AgentPresence {
    fn new(agent_id: &str, node_id: &str, capabilities: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            node_id: node_id.to_string(),
            capabilities: capabilities.into_iter().collect(),
            last_updated: now_unix(),
            status: "active".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PresenceEvent {
    Active(AgentPresence),
    Inactive { agent_id: String, node_id: String },
    Updated(AgentPresence),
    Discovered(AgentPresence),
}

pub type PresenceEventHandler = crate::callbacks::Handler<PresenceEvent>;

pub struct AgentPresenceService {
    node_id: NodeId,
    gossip: Arc<GossipService>,
    local_agents: RwLock<HashMap<String, AgentPresence>>,
    remote_agents: RwLock<HashMap<String, AgentPresence>>,
    callbacks: CallbackRegistry<PresenceEvent>,
}

impl AgentPresenceService {
    pub fn new(gossip: Arc<GossipService>) -> Arc<Self> {
        let node_id = gossip.local_id();
        Arc::new(Self {
            node_id,
            gossip,
            local_agents: RwLock::new(HashMap::new()),
            remote_agents: RwLock::new(HashMap::new()),
            callbacks: CallbackRegistry::new(),
        })
    }

    pub async fn on(&self, event: &str, handler: PresenceEventHandler) {
        self.callbacks.register(event, handler).await;
    }

    /// Subscribes to the underlying gossip event stream and applies the
    /// agent_active/agent_inactive/agent_query/agent_info merge rules.
    /// Must be called once per running service instance.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut rx = self.gossip.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(GossipEvent::Message(msg)) => this.handle_gossip_message(msg).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("presence dispatch lagged, skipped {skipped} gossip events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_gossip_message(&self, msg: message::GossipMessage) {
        match msg.msg_type.as_str() {
            message::AGENT_ACTIVE => {
                if let Some(presence) = parse_presence(&msg.data) {
                    self.merge_remote(presence).await;
                }
            }
            message::AGENT_INACTIVE => {
                let (Some(agent_id), Some(node_id)) = (
                    msg.data.get("agent_id").and_then(Value::as_str),
                    msg.data.get("node_id").and_then(Value::as_str),
                ) else {
                    return;
                };
                self.remove_remote(agent_id, node_id).await;
            }
            message::AGENT_QUERY => {
                let (Some(agent_id), Some(requester)) = (
                    msg.data.get("agent_id").and_then(Value::as_str),
                    msg.data.get("requester").and_then(Value::as_str),
                ) else {
                    return;
                };
                if let Some(presence) = self.lookup_known(agent_id).await {
                    if let Some(requester_id) = NodeId::from_hex(requester) {
                        let data = json!({ "presence": presence, "target": requester });
                        self.gossip.send_direct(requester_id, message::AGENT_INFO, data).await;
                    }
                }
            }
            message::AGENT_INFO => {
                let target_matches = msg
                    .data
                    .get("target")
                    .and_then(Value::as_str)
                    .map(|t| t == self.node_id.to_hex())
                    .unwrap_or(false);
                if !target_matches {
                    return;
                }
                if let Some(presence) = parse_presence(&msg.data) {
                    self.merge_remote(presence).await;
                }
            }
            _ => {}
        }
    }

    async fn lookup_known(&self, agent_id: &str) -> Option<AgentPresence> {
        if let Some(p) = self.local_agents.read().await.get(agent_id) {
            return Some(p.clone());
        }
        self.remote_agents.read().await.get(agent_id).cloned()
    }

    /// Applies the "accept only strictly newer" merge rule shared by
    /// agent_active and agent_info.
    async fn merge_remote(&self, presence: AgentPresence) {
        if presence.node_id == self.node_id.to_hex() {
            return;
        }
        let mut remote = self.remote_agents.write().await;
        match remote.get(&presence.agent_id) {
            Some(existing) if presence.last_updated <= existing.last_updated => {}
            Some(_) => {
                remote.insert(presence.agent_id.clone(), presence.clone());
                drop(remote);
                self.callbacks.fire("agent_updated", PresenceEvent::Updated(presence)).await;
            }
            None => {
                remote.insert(presence.agent_id.clone(), presence.clone());
                drop(remote);
                self.callbacks
                    .fire("agent_discovered", PresenceEvent::Discovered(presence))
                    .await;
            }
        }
    }

    async fn remove_remote(&self, agent_id: &str, node_id: &str) {
        let removed = {
            let mut remote = self.remote_agents.write().await;
            match remote.get(agent_id) {
                Some(existing) if existing.node_id == node_id => {
                    remote.remove(agent_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.callbacks
                .fire(
                    "agent_inactive",
                    PresenceEvent::Inactive {
                        agent_id: agent_id.to_string(),
                        node_id: node_id.to_string(),
                    },
                )
                .await;
        }
    }

    pub async fn register_agent(&self, agent_id: &str, capabilities: Vec<String>) -> AgentPresence {
        let presence = AgentPresence::new(agent_id, &self.node_id.to_hex(), capabilities);
        self.local_agents
            .write()
            .await
            .insert(agent_id.to_string(), presence.clone());
        self.callbacks.fire("agent_active", PresenceEvent::Active(presence.clone())).await;
        self.gossip
            .broadcast_direct_all(message::AGENT_ACTIVE, json!({ "presence": presence }))
            .await;
        presence
    }

    pub async fn unregister_agent(&self, agent_id: &str) {
        let existed = self.local_agents.write().await.remove(agent_id).is_some();
        if !existed {
            return;
        }
        let node_id = self.node_id.to_hex();
        self.callbacks
            .fire(
                "agent_inactive",
                PresenceEvent::Inactive {
                    agent_id: agent_id.to_string(),
                    node_id: node_id.clone(),
                },
            )
            .await;
        self.gossip
            .broadcast_direct_all(
                message::AGENT_INACTIVE,
                json!({ "agent_id": agent_id, "node_id": node_id }),
            )
            .await;
    }

    pub async fn update_capabilities(&self, agent_id: &str, capabilities: Vec<String>) -> Option<AgentPresence> {
        let updated = {
            let mut local = self.local_agents.write().await;
            let entry = local.get_mut(agent_id)?;
            entry.capabilities = capabilities.into_iter().collect();
            entry.last_updated = now_unix();
            entry.clone()
        };
        self.callbacks.fire("agent_active", PresenceEvent::Active(updated.clone())).await;
        self.gossip
            .broadcast_direct_all(message::AGENT_ACTIVE, json!({ "presence": updated }))
            .await;
        Some(updated)
    }

    /// Local cache, then remote cache, else broadcasts `agent_query` and
    /// returns `None` synchronously — the answer (if any) arrives later via
    /// `agent_info` and the `agent_discovered` callback.
    pub async fn query_agent(&self, agent_id: &str) -> Option<AgentPresence> {
        if let Some(p) = self.lookup_known(agent_id).await {
            return Some(p);
        }
        self.gossip
            .broadcast_direct_all(
                message::AGENT_QUERY,
                json!({ "agent_id": agent_id, "requester": self.node_id.to_hex() }),
            )
            .await;
        None
    }

    pub async fn get_by_capability(&self, capability: &str) -> Vec<AgentPresence> {
        let mut out = Vec::new();
        for p in self.local_agents.read().await.values() {
            if p.capabilities.contains(capability) {
                out.push(p.clone());
            }
        }
        for p in self.remote_agents.read().await.values() {
            if p.capabilities.contains(capability) {
                out.push(p.clone());
            }
        }
        out
    }

    pub async fn get_all_agents(&self) -> Vec<AgentPresence> {
        let mut out: Vec<AgentPresence> = self.local_agents.read().await.values().cloned().collect();
        out.extend(self.remote_agents.read().await.values().cloned());
        out
    }
}

fn parse_presence(data: &Value) -> Option<AgentPresence> {
    data.get("presence")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
