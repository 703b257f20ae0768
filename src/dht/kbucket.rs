//! K-buckets and the routing table.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::node_id::{NodeId, NUM_BUCKETS};

#[derive(Debug, Clone)]
pub struct Contact {
    pub node_id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(node_id: NodeId, ip: IpAddr, port: u16) -> Self {
        Self {
            node_id,
            ip,
            port,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_active(&self, staleness: Duration) -> bool {
        self.last_seen.elapsed() <= staleness
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.ip == other.ip && self.port == other.port
    }
}

/// A capacity-`k` LRU list of contacts. Re-seen contacts move to the tail;
/// a bucket that is full refuses new, unseen contacts — the "refuse on
/// full" policy rather than an evict-oldest-after-probe refinement.
#[derive(Debug, Default)]
pub struct KBucket {
    k: usize,
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            contacts: Vec::with_capacity(k),
        }
    }

    /// Returns true if the contact was inserted or refreshed.
    pub fn add(&mut self, contact: Contact) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.node_id == contact.node_id) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            return true;
        }
        if self.contacts.len() < self.k {
            self.contacts.push(contact);
            return true;
        }
        false
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// `NUM_BUCKETS` k-buckets indexed by the position of the highest set bit of
/// the XOR distance from the local node. The local node is never a member
/// of its own routing table.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<RwLock<KBucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            buckets.push(RwLock::new(KBucket::new(k)));
        }
        Self {
            local_id,
            k,
            buckets,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Refuses contacts whose node_id equals the local node_id.
    pub async fn add(&self, contact: Contact) -> bool {
        if contact.node_id == self.local_id {
            return false;
        }
        let idx = self.local_id.distance(&contact.node_id).bucket_index();
        let mut bucket = self.buckets[idx].write().await;
        bucket.add(contact)
    }

    /// Alternating-expansion closest-contacts query: start at the bucket
    /// matching the target's distance, then widen outward on both sides
    /// until `count` contacts are gathered or both directions are
    /// exhausted, then sort by distance ascending (ties broken
    /// lexicographically by node id bytes).
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let start = self.local_id.distance(target).bucket_index();
        let mut collected: Vec<Contact> = Vec::new();

        {
            let bucket = self.buckets[start].read().await;
            collected.extend(bucket.contacts().iter().cloned());
        }

        let mut lower = start as isize - 1;
        let mut upper = start as isize + 1;
        while collected.len() < count && (lower >= 0 || (upper as usize) < NUM_BUCKETS) {
            if lower >= 0 {
                let bucket = self.buckets[lower as usize].read().await;
                collected.extend(bucket.contacts().iter().cloned());
                lower -= 1;
            }
            if (upper as usize) < NUM_BUCKETS {
                let bucket = self.buckets[upper as usize].read().await;
                collected.extend(bucket.contacts().iter().cloned());
                upper += 1;
            }
        }

        collected.sort_by(|a, b| {
            let da = target.distance(&a.node_id);
            let db = target.distance(&b.node_id);
            da.cmp(&db).then_with(|| a.node_id.cmp(&b.node_id))
        });
        collected.truncate(count);
        collected
    }

    pub async fn all_contacts(&self) -> Vec<Contact> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            out.extend(bucket.read().await.contacts().iter().cloned());
        }
        out
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn contact(id: NodeId) -> Contact {
        Contact::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[tokio::test]
    async fn bucket_refuses_after_k_distinct_insertions() {
        let mut bucket = KBucket::new(2);
        assert!(bucket.add(contact(NodeId::random())));
        assert!(bucket.add(contact(NodeId::random())));
        assert!(!bucket.add(contact(NodeId::random())));
        assert_eq!(bucket.len(), 2);
    }

    #[tokio::test]
    async fn bucket_reinsertion_moves_to_tail_without_growing() {
        let mut bucket = KBucket::new(2);
        let a = NodeId::random();
        let b = NodeId::random();
        bucket.add(contact(a));
        bucket.add(contact(b));
        bucket.add(contact(a));
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.contacts().last().unwrap().node_id, a);
    }

    #[tokio::test]
    async fn routing_table_refuses_self() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, 20);
        assert!(!table.add(contact(local)).await);
    }

    /// `closest` only expands outward from the bucket matching the target
    /// until it has collected `count` contacts (per spec §4.2) — it does
    /// not visit every bucket, so with contacts spread thinly across the
    /// 160-bucket space the true global top-`count` can sit in a bucket
    /// that was never examined (spec §9 notes convergence isn't
    /// guaranteed). So this only checks what the alternating-expansion
    /// contract actually promises: the returned set is sorted ascending by
    /// distance to the target (ties broken lexicographically by node id),
    /// contains no duplicates, and every entry is a real contact from the
    /// table — not that it's the brute-force-global closest set.
    #[tokio::test]
    async fn closest_is_sorted_ascending_and_drawn_from_the_table() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, 20);
        for _ in 0..50 {
            table.add(contact(NodeId::random())).await;
        }
        let target = NodeId::random();
        let got = table.closest(&target, 5).await;
        let all = table.all_contacts().await;

        assert!(got.len() <= 5);
        assert!(!got.is_empty(), "50 contacts scattered over 160 buckets should yield at least one hit");

        for w in got.windows(2) {
            let da = target.distance(&w[0].node_id);
            let db = target.distance(&w[1].node_id);
            assert!(
                da < db || (da == db && w[0].node_id <= w[1].node_id),
                "results must be sorted ascending by distance, ties broken by node id"
            );
        }

        let mut seen = std::collections::HashSet::new();
        for c in &got {
            assert!(all.iter().any(|a| a.node_id == c.node_id), "returned contact must come from the table");
            assert!(seen.insert(c.node_id), "no duplicate node ids in the result");
        }
    }
}
