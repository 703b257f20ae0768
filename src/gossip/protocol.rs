//! The gossip service: peer table, dedup cache, periodic gossip/cleanup
//! loops, and epidemic/direct message dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};

use crate::config::GossipConfig;
use crate::dht::node_id::NodeId;

use super::message::{self, GossipMessage};
use super::peer::{CleanupAction, PeerEntry, PeerState};

const MAX_DATAGRAM: usize = 16 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerStateWire {
    ip: String,
    port: u16,
    state: String,
    incarnation: u64,
}

#[derive(Debug, Clone)]
pub enum GossipEvent {
    PeerStateChanged { peer_id: NodeId, state: PeerState },
    PeerRemoved { peer_id: NodeId },
    Acknowledged { peer_id: NodeId },
    Message(GossipMessage),
}

pub struct GossipService {
    local_id: NodeId,
    socket: Arc<UdpSocket>,
    peers: Arc<RwLock<HashMap<NodeId, PeerEntry>>>,
    dedup: Arc<RwLock<HashMap<String, Instant>>>,
    event_tx: broadcast::Sender<GossipEvent>,
    config: GossipConfig,
    running: Arc<AtomicBool>,
}

impl GossipService {
    pub async fn bind(local_id: NodeId, config: GossipConfig) -> crate::error::Result<Arc<Self>> {
        let socket = UdpSocket::bind((config.host.as_str(), config.port)).await?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let service = Arc::new(Self {
            local_id,
            socket: Arc::new(socket),
            peers: Arc::new(RwLock::new(HashMap::new())),
            dedup: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            config,
            running: Arc::new(AtomicBool::new(true)),
        });
        service.clone().spawn_receive_loop();
        Ok(service)
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the periodic gossip (anti-entropy) and cleanup loops. Both
    /// are cancellable via [`Self::stop`].
    pub fn start(self: &Arc<Self>) {
        self.clone().spawn_gossip_loop();
        self.clone().spawn_cleanup_loop();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn add_peer(&self, peer_id: NodeId, ip: std::net::IpAddr, port: u16) {
        if peer_id == self.local_id {
            return;
        }
        let mut peers = self.peers.write().await;
        peers.entry(peer_id).or_insert_with(|| PeerEntry::new(ip, port));
    }

    pub async fn live_peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, p)| p.is_live())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn peers_snapshot(&self) -> HashMap<NodeId, PeerEntry> {
        self.peers.read().await.clone()
    }

    fn next_message_id_data(&self, data: &Value) -> (f64, String) {
        let timestamp = now_unix();
        let id = message::derive_message_id(&self.local_id.to_hex(), timestamp, data);
        (timestamp, id)
    }

    fn build_message(&self, msg_type: &str, data: Value, ttl: i32) -> GossipMessage {
        let (timestamp, id) = self.next_message_id_data(&data);
        GossipMessage {
            sender_id: self.local_id.to_hex(),
            msg_type: msg_type.to_string(),
            data,
            timestamp,
            ttl,
            id,
        }
    }

    async fn send_wire(&self, msg: &GossipMessage, addr: SocketAddr) {
        match serde_json::to_vec(msg) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    log::warn!("gossip send to {addr} failed: {e}");
                }
            }
            Err(e) => log::warn!("failed to encode gossip message: {e}"),
        }
    }

    /// Direct, single-hop send to a specific known peer. Used for
    /// ping/ack/sync/state and for agent_info replies, none of which are
    /// ever relayed further.
    pub async fn send_direct(&self, peer_id: NodeId, msg_type: &str, data: Value) {
        if !self.running.load(Ordering::SeqCst) {
            log::warn!("send_direct called after stop(); dropping");
            return;
        }
        let addr = {
            let peers = self.peers.read().await;
            peers.get(&peer_id).map(|p| SocketAddr::new(p.ip, p.port))
        };
        let Some(addr) = addr else {
            log::warn!("send_direct to unknown peer {peer_id}");
            return;
        };
        let msg = self.build_message(msg_type, data, 1);
        self.mark_seen_locally(&msg).await;
        self.send_wire(&msg, addr).await;
    }

    /// Broadcast to every currently-live peer directly, bypassing the
    /// sampled TTL-decrement relay mechanism — used for locally-originated
    /// suspect/dead events and for presence propagation (agent_active,
    /// agent_inactive, agent_query).
    pub async fn broadcast_direct_all(&self, msg_type: &str, data: Value) {
        if !self.running.load(Ordering::SeqCst) {
            log::warn!("broadcast_direct_all called after stop(); dropping");
            return;
        }
        let msg = self.build_message(msg_type, data, self.config.max_ttl as i32);
        self.mark_seen_locally(&msg).await;
        let targets: Vec<SocketAddr> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|p| p.is_live())
                .map(|p| SocketAddr::new(p.ip, p.port))
                .collect()
        };
        for addr in targets {
            self.send_wire(&msg, addr).await;
        }
    }

    /// Records a locally-originated message's id in the dedup cache so a
    /// copy that loops back to us (e.g. relayed by a peer) is dropped.
    async fn mark_seen_locally(&self, msg: &GossipMessage) {
        self.dedup.write().await.insert(msg.id.clone(), Instant::now());
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
                        log::warn!("gossip socket recv error: {e}");
                        continue;
                    }
                };
                let msg: GossipMessage = match serde_json::from_slice(&buf[..len]) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("dropping malformed gossip datagram from {src}: {e}");
                        continue;
                    }
                };
                self.handle_message(msg, src).await;
            }
        });
    }

    fn spawn_gossip_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.gossip_interval);
            loop {
                ticker.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.gossip_tick().await;
            }
        });
    }

    fn spawn_cleanup_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.cleanup_interval);
            loop {
                ticker.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.cleanup_tick().await;
            }
        });
    }

    async fn gossip_tick(&self) {
        let target = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(_, p)| p.is_live())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
                .choose(&mut rand::thread_rng())
                .copied()
        };
        if let Some(peer_id) = target {
            self.send_direct(peer_id, message::SYNC, json!({})).await;
        }
    }

    async fn cleanup_tick(&self) {
        let mut to_remove = Vec::new();
        let mut to_broadcast: Vec<(NodeId, &'static str)> = Vec::new();
        let mut changed = Vec::new();

        {
            let mut peers = self.peers.write().await;
            for (id, entry) in peers.iter_mut() {
                match entry.cleanup_tick(self.config.suspicion_timeout, self.config.dead_timeout) {
                    CleanupAction::None => {}
                    CleanupAction::BecameSuspect => {
                        changed.push((*id, PeerState::Suspect));
                        to_broadcast.push((*id, message::SUSPECT));
                    }
                    CleanupAction::BecameDead => {
                        changed.push((*id, PeerState::Dead));
                        to_broadcast.push((*id, message::DEAD));
                    }
                    CleanupAction::ShouldRemove => to_remove.push(*id),
                }
            }
            for id in &to_remove {
                peers.remove(id);
            }
        }

        for (peer_id, state) in changed {
            let _ = self.event_tx.send(GossipEvent::PeerStateChanged { peer_id, state });
        }
        for peer_id in &to_remove {
            let _ = self.event_tx.send(GossipEvent::PeerRemoved { peer_id: *peer_id });
        }
        for (peer_id, msg_type) in &to_broadcast {
            if *msg_type == message::SUSPECT {
                self.send_direct(*peer_id, message::PING, json!({})).await;
            }
            self.broadcast_direct_all(msg_type, json!({ "peer_id": peer_id.to_hex() }))
                .await;
        }

        let cutoff = self.config.cleanup_interval * 2;
        self.dedup.write().await.retain(|_, seen_at| seen_at.elapsed() <= cutoff);
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) {
        let Some(sender_id) = NodeId::from_hex(&msg.sender_id) else {
            log::warn!("dropping gossip message with malformed sender id from {src}");
            return;
        };
        if sender_id == self.local_id {
            return;
        }

        {
            let mut dedup = self.dedup.write().await;
            if dedup.contains_key(&msg.id) {
                return;
            }
            dedup.insert(msg.id.clone(), Instant::now());
        }

        {
            let mut peers = self.peers.write().await;
            let entry = peers
                .entry(sender_id)
                .or_insert_with(|| PeerEntry::new(src.ip(), src.port()));
            entry.touch();
        }

        match msg.msg_type.as_str() {
            message::PING => self.handle_ping(sender_id).await,
            message::ACK => self.handle_ack(&msg, sender_id).await,
            message::SYNC => self.handle_sync(sender_id).await,
            message::STATE => self.handle_state(&msg).await,
            message::SUSPECT => self.handle_suspect(&msg, sender_id).await,
            message::DEAD => self.handle_dead(&msg, sender_id).await,
            message::AGENT_ACTIVE
            | message::AGENT_INACTIVE
            | message::AGENT_QUERY
            | message::AGENT_INFO => {
                let _ = self.event_tx.send(GossipEvent::Message(msg.clone()));
                self.maybe_relay(&msg, sender_id).await;
            }
            other => log::warn!("dropping gossip message of unknown type {other} from {src}"),
        }
    }

    async fn handle_ping(&self, sender_id: NodeId) {
        self.send_direct(sender_id, message::ACK, json!({ "target": sender_id.to_hex() }))
            .await;
    }

    async fn handle_ack(&self, msg: &GossipMessage, sender_id: NodeId) {
        let addressed_to_us = msg
            .data
            .get("target")
            .and_then(Value::as_str)
            .map(|t| t == self.local_id.to_hex())
            .unwrap_or(false);
        if addressed_to_us {
            let mut peers = self.peers.write().await;
            if let Some(entry) = peers.get_mut(&sender_id) {
                entry.recover();
            }
            drop(peers);
            let _ = self.event_tx.send(GossipEvent::Acknowledged { peer_id: sender_id });
        }
    }

    async fn handle_sync(&self, sender_id: NodeId) {
        let snapshot = self.peers.read().await;
        let mut wire = HashMap::new();
        for (id, entry) in snapshot.iter() {
            wire.insert(
                id.to_hex(),
                PeerStateWire {
                    ip: entry.ip.to_string(),
                    port: entry.port,
                    state: state_name(entry.state).to_string(),
                    incarnation: entry.incarnation,
                },
            );
        }
        drop(snapshot);
        self.send_direct(sender_id, message::STATE, json!({ "peers": wire })).await;
    }

    async fn handle_state(&self, msg: &GossipMessage) {
        let Some(peers_value) = msg.data.get("peers") else {
            return;
        };
        let Ok(incoming): Result<HashMap<String, PeerStateWire>, _> =
            serde_json::from_value(peers_value.clone())
        else {
            log::warn!("malformed state sync payload");
            return;
        };
        let mut peers = self.peers.write().await;
        for (id_hex, wire) in incoming {
            let Some(id) = NodeId::from_hex(&id_hex) else { continue };
            if id == self.local_id {
                continue;
            }
            let entry = peers
                .entry(id)
                .or_insert_with(|| PeerEntry::new(wire.ip.parse().unwrap_or(src_fallback_ip()), wire.port));
            entry.merge_incarnation(wire.incarnation, wire.state == state_name(PeerState::Alive));
        }
    }

    async fn handle_suspect(&self, msg: &GossipMessage, sender_id: NodeId) {
        if let Some(peer_id) = msg.data.get("peer_id").and_then(Value::as_str).and_then(NodeId::from_hex) {
            if peer_id != self.local_id {
                let mut peers = self.peers.write().await;
                if let Some(entry) = peers.get_mut(&peer_id) {
                    entry.mark_suspect_external();
                }
            }
        }
        self.maybe_relay(msg, sender_id).await;
    }

    async fn handle_dead(&self, msg: &GossipMessage, sender_id: NodeId) {
        if let Some(peer_id) = msg.data.get("peer_id").and_then(Value::as_str).and_then(NodeId::from_hex) {
            if peer_id != self.local_id {
                let mut peers = self.peers.write().await;
                if let Some(entry) = peers.get_mut(&peer_id) {
                    entry.mark_dead_external();
                }
            }
        }
        self.maybe_relay(msg, sender_id).await;
    }

    /// Epidemic relay for a received dispatchable message: forward to a
    /// random sample of `max(3, ceil(sqrt(N)))` live peers with TTL-1,
    /// skipping the sender and ourselves. Only runs if TTL > 1.
    async fn maybe_relay(&self, msg: &GossipMessage, sender_id: NodeId) {
        if msg.ttl <= 1 {
            return;
        }
        let relayed = msg.with_ttl_decremented();
        let candidates: Vec<(NodeId, SocketAddr)> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(id, p)| **id != sender_id && **id != self.local_id && p.is_live())
                .map(|(id, p)| (*id, SocketAddr::new(p.ip, p.port)))
                .collect()
        };
        let n = candidates.len();
        let fanout = (3usize).max((n as f64).sqrt().ceil() as usize);
        let mut rng = rand::thread_rng();
        let sample: Vec<&(NodeId, SocketAddr)> = candidates
            .choose_multiple(&mut rng, fanout.min(candidates.len()))
            .collect();
        for (_, addr) in sample {
            self.send_wire(&relayed, *addr).await;
        }
    }
}

fn state_name(state: PeerState) -> &'static str {
    match state {
        PeerState::Alive => "alive",
        PeerState::Suspect => "suspect",
        PeerState::Dead => "dead",
    }
}

fn src_fallback_ip() -> std::net::IpAddr {
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}
