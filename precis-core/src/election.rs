//! Bully leader election.
//!
//! The live node with the highest id always wins. An initiator probes every
//! higher-id peer; a 2xx reply to the election call (or an inbound `/ok`
//! RPC) means a higher peer is alive and will take over, so the initiator
//! waits passively for its announcement. Silence for the whole election
//! window means the initiator is the highest survivor and assumes
//! leadership. Election RPC failures are expected and never retried;
//! silence is the signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use crate::job::NodeId;
use crate::membership::Membership;
use crate::node::ClusterView;
use crate::rpc::{ElectionCall, PeerClient};

pub struct Election {
    self_id: NodeId,
    membership: Arc<Membership>,
    cluster: Arc<ClusterView>,
    rpc: Arc<PeerClient>,
    election_timeout: Duration,
    /// At most one election runs on a node at a time.
    in_progress: AtomicBool,
    current_id: Mutex<Option<String>>,
    /// Set when any higher peer acknowledged the current election.
    ok_seen: AtomicBool,
    /// Bumped per election so a superseded run cannot apply its outcome.
    generation: AtomicU64,
}

impl Election {
    pub fn new(
        self_id: NodeId,
        membership: Arc<Membership>,
        cluster: Arc<ClusterView>,
        rpc: Arc<PeerClient>,
        election_timeout: Duration,
    ) -> Self {
        Self {
            self_id,
            membership,
            cluster,
            rpc,
            election_timeout,
            in_progress: AtomicBool::new(false),
            current_id: Mutex::new(None),
            ok_seen: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn current_election_id(&self) -> Option<String> {
        self.current_id.lock().clone()
    }

    /// Begin an election unless one is already running.
    pub fn start_election(self: &Arc<Self>) {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("election already in progress");
            return;
        }
        let election_id = Uuid::new_v4().to_string();
        *self.current_id.lock() = Some(election_id.clone());
        self.ok_seen.store(false, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cluster.set_candidate();
        info!(node = self.self_id, %election_id, "starting election");

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run(election_id, generation).await });
    }

    async fn run(self: Arc<Self>, election_id: String, generation: u64) {
        let higher = self.membership.higher_peers();
        if higher.is_empty() {
            // highest id in the membership, nothing to ask
            self.win().await;
            return;
        }

        let started = Instant::now();
        let probes = higher.into_iter().filter_map(|peer| {
            let addr = self.membership.peer_address(peer)?;
            let call = ElectionCall {
                node_id: self.self_id,
                election_id: election_id.clone(),
            };
            let rpc = Arc::clone(&self.rpc);
            Some(async move {
                match rpc.send_election(peer, &addr, &call).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(peer, error = %e, "higher peer silent");
                        false
                    }
                }
            })
        });
        if join_all(probes).await.into_iter().any(|ok| ok) {
            self.ok_seen.store(true, Ordering::SeqCst);
        }

        // Hold the window open for stray /ok calls before deciding.
        if let Some(rest) = self.election_timeout.checked_sub(started.elapsed()) {
            sleep(rest).await;
        }

        if self.generation.load(Ordering::SeqCst) != generation
            || !self.in_progress.load(Ordering::SeqCst)
        {
            // superseded, or resolved by a leader announcement
            return;
        }
        if self.ok_seen.load(Ordering::SeqCst) {
            info!("higher peer acknowledged, awaiting leader announcement");
            self.finish();
            return;
        }
        self.win().await;
    }

    /// Assume leadership and announce it to every peer, best effort.
    async fn win(&self) {
        info!(node = self.self_id, "election won, assuming leadership");
        self.cluster.set_leader(self.self_id);
        self.finish();

        let announcements = self.membership.others().into_iter().map(|(peer, addr)| async move {
            if let Err(e) = self.rpc.announce_leader(peer, &addr, self.self_id).await {
                debug!(peer, error = %e, "leader announcement not delivered");
            }
        });
        join_all(announcements).await;
    }

    /// Inbound election call. Any such call comes from a lower id, so
    /// acknowledge it and contest the election ourselves.
    pub fn on_election_message(self: &Arc<Self>, sender: NodeId, election_id: &str) {
        if self.current_id.lock().as_deref() == Some(election_id) {
            return;
        }
        info!(sender, "election message received");
        if let Some(addr) = self.membership.peer_address(sender) {
            let rpc = Arc::clone(&self.rpc);
            let self_id = self.self_id;
            tokio::spawn(async move {
                if let Err(e) = rpc.send_ok(sender, &addr, self_id).await {
                    debug!(peer = sender, error = %e, "ok reply not delivered");
                }
            });
        }
        self.start_election();
    }

    /// Inbound `/ok` from a higher peer.
    pub fn on_ok_message(&self, sender: NodeId) {
        debug!(sender, "ok received from higher peer");
        self.ok_seen.store(true, Ordering::SeqCst);
    }

    /// Inbound leader announcement.
    pub fn on_leader_announcement(&self, leader_id: NodeId) {
        if leader_id == self.self_id {
            // echo of our own victory
            self.cluster.set_leader(leader_id);
            return;
        }
        info!(leader_id, "leader announced");
        self.cluster.set_leader(leader_id);
        self.finish();
    }

    fn finish(&self) {
        self.in_progress.store(false, Ordering::SeqCst);
        *self.current_id.lock() = None;
    }
}
