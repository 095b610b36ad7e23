//! Static membership table and liveness tracking.
//!
//! Membership is loaded once at startup and never mutated. Liveness is
//! inferred purely from inbound contact: any heartbeat or peer RPC
//! refreshes `last_seen`, and a peer is alive while its entry is younger
//! than `leader_timeout`. Stale entries are swept lazily on read, so the
//! table needs no dedicated cleaner.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::config::NodeSpec;
use crate::error::{Error, Result};
use crate::job::NodeId;

/// The configured peer table, self included.
#[derive(Debug)]
pub struct Membership {
    self_id: NodeId,
    peers: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn new(self_id: NodeId, nodes: &[NodeSpec]) -> Result<Self> {
        let peers: BTreeMap<NodeId, String> =
            nodes.iter().map(|n| (n.id, n.base_url())).collect();
        if !peers.contains_key(&self_id) {
            return Err(Error::UnknownNode(self_id));
        }
        Ok(Self { self_id, peers })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn peer_address(&self, id: NodeId) -> Option<String> {
        self.peers.get(&id).cloned()
    }

    /// Peers with an id strictly greater than self, ascending.
    pub fn higher_peers(&self) -> Vec<NodeId> {
        self.peers
            .keys()
            .copied()
            .filter(|id| *id > self.self_id)
            .collect()
    }

    /// Every peer except self, with its address.
    pub fn others(&self) -> Vec<(NodeId, String)> {
        self.peers
            .iter()
            .filter(|(id, _)| **id != self.self_id)
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// `peer id -> last seen` table. Self is always alive.
#[derive(Debug)]
pub struct Liveness {
    self_id: NodeId,
    leader_timeout: Duration,
    seen: Mutex<HashMap<NodeId, Instant>>,
}

impl Liveness {
    pub fn new(self_id: NodeId, leader_timeout: Duration) -> Self {
        Self {
            self_id,
            leader_timeout,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record inbound contact from `peer`. Idempotent; later calls only
    /// move `last_seen` forward.
    pub fn record_seen(&self, peer: NodeId) {
        if peer == self.self_id {
            return;
        }
        self.seen.lock().insert(peer, Instant::now());
    }

    pub fn is_alive(&self, peer: NodeId) -> bool {
        if peer == self.self_id {
            return true;
        }
        match self.seen.lock().get(&peer) {
            Some(last) => last.elapsed() <= self.leader_timeout,
            None => false,
        }
    }

    /// Sweep out stale entries, then return the alive set (self included).
    pub fn alive(&self) -> BTreeSet<NodeId> {
        let mut seen = self.seen.lock();
        let timeout = self.leader_timeout;
        seen.retain(|id, last| {
            let keep = last.elapsed() <= timeout;
            if !keep {
                warn!(peer = *id, "peer marked dead, no contact within timeout");
            }
            keep
        });
        let mut alive: BTreeSet<NodeId> = seen.keys().copied().collect();
        alive.insert(self.self_id);
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<NodeSpec> {
        vec![
            NodeSpec { id: 1, ip: "127.0.0.1".into(), port: 8001 },
            NodeSpec { id: 2, ip: "127.0.0.1".into(), port: 8002 },
            NodeSpec { id: 3, ip: "127.0.0.1".into(), port: 8003 },
        ]
    }

    #[test]
    fn higher_peers_are_strictly_greater() {
        let members = Membership::new(2, &nodes()).unwrap();
        assert_eq!(members.higher_peers(), vec![3]);
        let top = Membership::new(3, &nodes()).unwrap();
        assert!(top.higher_peers().is_empty());
    }

    #[test]
    fn rejects_self_id_outside_table() {
        assert!(matches!(
            Membership::new(9, &nodes()),
            Err(Error::UnknownNode(9))
        ));
    }

    #[test]
    fn peer_address_resolves() {
        let members = Membership::new(1, &nodes()).unwrap();
        assert_eq!(
            members.peer_address(3).as_deref(),
            Some("http://127.0.0.1:8003")
        );
        assert!(members.peer_address(9).is_none());
    }

    #[test]
    fn self_is_always_alive() {
        let liveness = Liveness::new(1, Duration::from_millis(50));
        assert!(liveness.is_alive(1));
        assert!(liveness.alive().contains(&1));
    }

    #[test]
    fn stale_peers_are_swept_on_read() {
        let liveness = Liveness::new(1, Duration::from_millis(20));
        liveness.record_seen(2);
        assert!(liveness.is_alive(2));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!liveness.is_alive(2));
        let alive = liveness.alive();
        assert_eq!(alive.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn repeated_heartbeats_are_idempotent() {
        let liveness = Liveness::new(1, Duration::from_millis(100));
        liveness.record_seen(2);
        liveness.record_seen(2);
        assert!(liveness.is_alive(2));
        assert_eq!(liveness.alive().len(), 2);
    }
}
