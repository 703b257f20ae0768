//! UDP wire protocol: envelope codec, request/response correlation, and the
//! message handlers for ping/find_node/find_value/store.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, RwLock};

use crate::error::{Error, Result};

use super::kbucket::{Contact, RoutingTable};
use super::node_id::NodeId;
use super::store::LocalDataStore;

const MAX_DATAGRAM: usize = 16 * 1024;
const MAX_CONTACTS_RETURNED: usize = 20;

/// `{"type": ..., "sender": ..., "data": ..., "id": ...}` — the
/// self-describing text envelope every DHT datagram carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub sender: String,
    pub data: Value,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactWire {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

impl ContactWire {
    fn from_contact(c: &Contact) -> Self {
        Self {
            id: c.node_id.to_hex(),
            ip: c.ip.to_string(),
            port: c.port,
        }
    }

    fn to_contact(&self) -> Option<Contact> {
        let node_id = NodeId::from_hex(&self.id)?;
        let ip = self.ip.parse().ok()?;
        Some(Contact::new(node_id, ip, self.port))
    }
}

pub struct DhtProtocol {
    local_id: NodeId,
    socket: Arc<UdpSocket>,
    routing_table: Arc<RoutingTable>,
    store: Arc<LocalDataStore>,
    pending: Arc<RwLock<HashMap<String, oneshot::Sender<Value>>>>,
    request_timeout: Duration,
    counter: AtomicU64,
    running: Arc<AtomicBool>,
}

impl DhtProtocol {
    pub async fn bind(
        local_id: NodeId,
        host: &str,
        port: u16,
        routing_table: Arc<RoutingTable>,
        store: Arc<LocalDataStore>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((host, port)).await?;
        let protocol = Arc::new(Self {
            local_id,
            socket: Arc::new(socket),
            routing_table,
            store,
            pending: Arc::new(RwLock::new(HashMap::new())),
            request_timeout,
            counter: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(true)),
        });
        protocol.clone().spawn_receive_loop();
        Ok(protocol)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the receive loop and makes subsequent `send_request` calls
    /// fail fast with [`Error::NotRunning`] instead of timing out.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn spawn_receive_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                let (len, src) = match self.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("dht socket recv error: {e}");
                        continue;
                    }
                };
                let envelope: Envelope = match serde_json::from_slice(&buf[..len]) {
                    Ok(e) => e,
                    Err(e) => {
                        log::warn!("dropping malformed dht datagram from {src}: {e}");
                        continue;
                    }
                };
                self.handle_envelope(envelope, src).await;
            }
        });
    }

    fn next_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let nonce: u64 = rand::random();
        let mut hasher = Sha256::new();
        hasher.update(self.local_id.to_hex().as_bytes());
        hasher.update(counter.to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    async fn send_envelope(&self, msg_type: &str, data: Value, id: &str, addr: SocketAddr) {
        let envelope = Envelope {
            msg_type: msg_type.to_string(),
            sender: self.local_id.to_hex(),
            data,
            id: id.to_string(),
        };
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    log::warn!("dht send to {addr} failed: {e}");
                }
            }
            Err(e) => log::warn!("failed to encode dht envelope: {e}"),
        }
    }

    /// Sends a request to `contact` and awaits its reply, correlated by
    /// message id, up to `request_timeout`.
    pub async fn send_request(&self, contact: &Contact, msg_type: &str, data: Value) -> Result<Value> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id.clone(), tx);

        let addr = SocketAddr::new(contact.ip, contact.port);
        self.send_envelope(msg_type, data, &id, addr).await;

        let result = tokio::time::timeout(self.request_timeout, rx).await;
        self.pending.write().await.remove(&id);
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }

    async fn handle_envelope(&self, envelope: Envelope, src: SocketAddr) {
        // The sender_id is always re-hashed to a NodeID, never parsed as an
        // authoritative hex id — see the open-question resolution in
        // DESIGN.md.
        let sender_id = NodeId::from_string(&envelope.sender);
        self.routing_table
            .add(Contact::new(sender_id, src.ip(), src.port()))
            .await;

        match envelope.msg_type.as_str() {
            "ping" => self.handle_ping(&envelope, src).await,
            "find_node" => self.handle_find_node(&envelope, src).await,
            "find_value" => self.handle_find_value(&envelope, src).await,
            "store" => self.handle_store(&envelope, src).await,
            "pong" | "found_nodes" | "found_value" => self.handle_reply(&envelope).await,
            other => log::warn!("dropping dht message of unknown type {other} from {src}"),
        }
    }

    async fn handle_ping(&self, envelope: &Envelope, src: SocketAddr) {
        let data = json!({ "request_id": envelope.id });
        self.send_envelope("pong", data, &self.next_id(), src).await;
    }

    async fn handle_find_node(&self, envelope: &Envelope, src: SocketAddr) {
        let Some(target_id) = envelope
            .data
            .get("target_id")
            .and_then(Value::as_str)
            .and_then(NodeId::from_hex)
        else {
            log::warn!("malformed find_node from {src}");
            return;
        };
        let contacts = self
            .routing_table
            .closest(&target_id, MAX_CONTACTS_RETURNED)
            .await;
        let nodes: Vec<ContactWire> = contacts.iter().map(ContactWire::from_contact).collect();
        let data = json!({ "request_id": envelope.id, "nodes": nodes });
        self.send_envelope("found_nodes", data, &self.next_id(), src).await;
    }

    async fn handle_find_value(&self, envelope: &Envelope, src: SocketAddr) {
        let Some(key) = envelope.data.get("key").and_then(Value::as_str) else {
            log::warn!("malformed find_value from {src}");
            return;
        };
        if let Some(value) = self.store.get(key).await {
            let data = json!({ "request_id": envelope.id, "key": key, "value": value });
            self.send_envelope("found_value", data, &self.next_id(), src).await;
            return;
        }
        let target_id = NodeId::from_string(key);
        let contacts = self
            .routing_table
            .closest(&target_id, MAX_CONTACTS_RETURNED)
            .await;
        let nodes: Vec<ContactWire> = contacts.iter().map(ContactWire::from_contact).collect();
        let data = json!({ "request_id": envelope.id, "key": key, "nodes": nodes });
        self.send_envelope("found_nodes", data, &self.next_id(), src).await;
    }

    async fn handle_store(&self, envelope: &Envelope, src: SocketAddr) {
        let (Some(key), Some(value)) = (
            envelope.data.get("key").and_then(Value::as_str),
            envelope.data.get("value"),
        ) else {
            log::warn!("malformed store from {src}");
            return;
        };
        self.store.put(key.to_string(), value.clone()).await;
        let data = json!({ "request_id": envelope.id, "status": "ok" });
        self.send_envelope("pong", data, &self.next_id(), src).await;
    }

    async fn handle_reply(&self, envelope: &Envelope) {
        let Some(request_id) = envelope.data.get("request_id").and_then(Value::as_str) else {
            log::warn!("dht reply missing request_id");
            return;
        };
        let resolver = self.pending.write().await.remove(request_id);
        if let Some(tx) = resolver {
            // Duplicate/late replies for an already-resolved id find nothing
            // left to send to; a send failure here is silently dropped.
            let _ = tx.send(envelope.data.clone());
        }
    }
}

pub(super) fn contact_wires_to_contacts(nodes: &[ContactWire]) -> Vec<Contact> {
    nodes.iter().filter_map(ContactWire::to_contact).collect()
}
