//! Gossip message envelope and its stable id derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `{sender_id, type, data, timestamp, ttl, id}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub sender_id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: Value,
    pub timestamp: f64,
    pub ttl: i32,
    pub id: String,
}

impl GossipMessage {
    /// Builds a message with its id derived from `(sender_id, timestamp,
    /// data)` — a SHA-256 digest substituted for the original's
    /// non-cryptographic hash, per the spec's design notes; the id is
    /// carried unchanged through every hop.
    pub fn new(sender_id: String, msg_type: impl Into<String>, data: Value, timestamp: f64, ttl: i32) -> Self {
        let msg_type = msg_type.into();
        let id = derive_message_id(&sender_id, timestamp, &data);
        Self {
            sender_id,
            msg_type,
            data,
            timestamp,
            ttl,
            id,
        }
    }

    pub fn with_ttl_decremented(&self) -> Self {
        let mut clone = self.clone();
        clone.ttl -= 1;
        clone
    }
}

pub fn derive_message_id(sender_id: &str, timestamp: f64, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update(timestamp.to_bits().to_le_bytes());
    hasher.update(data.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub const PING: &str = "ping";
pub const ACK: &str = "ack";
pub const SYNC: &str = "sync";
pub const STATE: &str = "state";
pub const SUSPECT: &str = "suspect";
pub const DEAD: &str = "dead";
pub const AGENT_ACTIVE: &str = "agent_active";
pub const AGENT_INACTIVE: &str = "agent_inactive";
pub const AGENT_QUERY: &str = "agent_query";
pub const AGENT_INFO: &str = "agent_info";

/// Messages originating locally (`suspect`/`dead`) broadcast to every live
/// peer; everything else dispatchable is fanned out to a sampled subset.
pub fn is_epidemic(msg_type: &str) -> bool {
    matches!(
        msg_type,
        SUSPECT | DEAD | AGENT_ACTIVE | AGENT_INACTIVE | AGENT_QUERY | AGENT_INFO
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_for_identical_inputs() {
        let data = serde_json::json!({"a": 1});
        let a = derive_message_id("node1", 123.0, &data);
        let b = derive_message_id("node1", 123.0, &data);
        assert_eq!(a, b);
    }
}
