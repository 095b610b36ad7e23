//! Heartbeat emission and leader liveness watching.
//!
//! Two cooperative loops: one sends a small ping to every other peer on
//! `heartbeat_interval`, one inspects the known leader every two seconds
//! and starts an election when the leader has gone quiet. Liveness is
//! inferred from successful inbound heartbeats only; a failed send is
//! logged at debug and forgotten.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::election::Election;
use crate::job::NodeId;
use crate::membership::{Liveness, Membership};
use crate::node::{ClusterView, Shutdown};
use crate::rpc::{unix_timestamp, HeartbeatPing, PeerClient};

/// How often the watcher re-checks the current leader.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

pub struct Heartbeat {
    self_id: NodeId,
    membership: Arc<Membership>,
    liveness: Arc<Liveness>,
    cluster: Arc<ClusterView>,
    election: Arc<Election>,
    rpc: Arc<PeerClient>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(
        self_id: NodeId,
        membership: Arc<Membership>,
        liveness: Arc<Liveness>,
        cluster: Arc<ClusterView>,
        election: Arc<Election>,
        rpc: Arc<PeerClient>,
        interval: Duration,
    ) -> Self {
        Self {
            self_id,
            membership,
            liveness,
            cluster,
            election,
            rpc,
            interval,
        }
    }

    pub fn spawn(self: &Arc<Self>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::emit_loop(Arc::clone(self), shutdown.subscribe())),
            tokio::spawn(Self::watch_loop(Arc::clone(self), shutdown.subscribe())),
        ]
    }

    async fn emit_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(this.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => this.emit_once().await,
                _ = stop.changed() => break,
            }
        }
    }

    async fn emit_once(&self) {
        let ping = HeartbeatPing {
            node_id: self.self_id,
            timestamp: unix_timestamp(),
        };
        let sends = self.membership.others().into_iter().map(|(peer, addr)| {
            let ping = ping.clone();
            async move {
                if let Err(e) = self.rpc.send_heartbeat(peer, &addr, &ping).await {
                    debug!(peer, error = %e, "heartbeat not delivered");
                }
            }
        });
        join_all(sends).await;
    }

    async fn watch_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(WATCH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => this.check_leader(),
                _ = stop.changed() => break,
            }
        }
    }

    fn check_leader(&self) {
        match self.cluster.leader() {
            Some(leader) if leader == self.self_id => {}
            Some(leader) => {
                if !self.liveness.is_alive(leader) {
                    warn!(leader, "leader appears dead, starting election");
                    self.election.start_election();
                }
            }
            // an earlier election ended without an announcement reaching us
            None if !self.election.in_progress() => self.election.start_election(),
            None => {}
        }
    }
}
