//! One-hop typed operations over the DHT wire protocol.
//!
//! Deliberately does not perform iterative multi-hop lookups: each
//! operation queries exactly the contact it is given. Iterative lookup is
//! an open extension, not part of this layer.

use serde_json::{json, Value};

use super::kbucket::{Contact, RoutingTable};
use super::protocol::{contact_wires_to_contacts, ContactWire, DhtProtocol};

pub struct DhtClient {
    protocol: std::sync::Arc<DhtProtocol>,
    routing_table: std::sync::Arc<RoutingTable>,
}

impl DhtClient {
    pub fn new(protocol: std::sync::Arc<DhtProtocol>, routing_table: std::sync::Arc<RoutingTable>) -> Self {
        Self {
            protocol,
            routing_table,
        }
    }

    async fn remember(&self, contacts: Vec<Contact>) -> Vec<Contact> {
        for c in &contacts {
            self.routing_table.add(c.clone()).await;
        }
        contacts
    }

    pub async fn ping(&self, contact: &Contact) -> bool {
        self.protocol.send_request(contact, "ping", json!({})).await.is_ok()
    }

    pub async fn find_node(&self, target_id: &super::node_id::NodeId, contact: &Contact) -> Vec<Contact> {
        let data = json!({ "target_id": target_id.to_hex() });
        match self.protocol.send_request(contact, "find_node", data).await {
            Ok(reply) => {
                let nodes: Vec<ContactWire> = reply
                    .get("nodes")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                self.remember(contact_wires_to_contacts(&nodes)).await
            }
            Err(_) => Vec::new(),
        }
    }

    /// Returns `(value, closer_contacts)` — exactly one of which is
    /// populated: a hit carries the value with no contacts, a miss carries
    /// candidate contacts with no value.
    pub async fn find_value(&self, key: &str, contact: &Contact) -> (Option<Value>, Vec<Contact>) {
        let data = json!({ "key": key });
        match self.protocol.send_request(contact, "find_value", data).await {
            Ok(reply) => {
                if let Some(value) = reply.get("value") {
                    return (Some(value.clone()), Vec::new());
                }
                let nodes: Vec<ContactWire> = reply
                    .get("nodes")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                (None, self.remember(contact_wires_to_contacts(&nodes)).await)
            }
            Err(_) => (None, Vec::new()),
        }
    }

    pub async fn store(&self, key: &str, value: Value, contact: &Contact) -> bool {
        let data = json!({ "key": key, "value": value });
        self.protocol.send_request(contact, "store", data).await.is_ok()
    }
}
