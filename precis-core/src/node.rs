//! Node context: one value owning every subsystem of a running node.
//!
//! Request handlers and background loops share the context through an
//! `Arc` instead of module-level globals; the server injects it per
//! request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::ai::AiClient;
use crate::config::Config;
use crate::election::Election;
use crate::error::{Error, Result};
use crate::executor::StepExecutor;
use crate::heartbeat::Heartbeat;
use crate::job::NodeId;
use crate::membership::{Liveness, Membership};
use crate::rpc::PeerClient;
use crate::scheduler::{QueueCounts, Scheduler, SchedulerConfig};

/// Bound on how long each background loop gets to wind down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

/// This node's view of the cluster: its role and the leader it knows of.
/// Views may temporarily disagree across nodes.
#[derive(Debug)]
pub struct ClusterView {
    self_id: NodeId,
    inner: RwLock<ViewInner>,
}

#[derive(Debug)]
struct ViewInner {
    role: Role,
    leader: Option<NodeId>,
}

impl ClusterView {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            inner: RwLock::new(ViewInner {
                role: Role::Follower,
                leader: None,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.read().role
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.inner.read().leader
    }

    pub fn is_leader(&self) -> bool {
        self.inner.read().role == Role::Leader
    }

    /// Record `leader` as the cluster leader; the role follows from
    /// whether that is us.
    pub fn set_leader(&self, leader: NodeId) {
        let mut view = self.inner.write();
        let role = if leader == self.self_id {
            Role::Leader
        } else {
            Role::Follower
        };
        if view.role != role || view.leader != Some(leader) {
            info!(node = self.self_id, leader, ?role, "cluster view updated");
        }
        view.leader = Some(leader);
        view.role = role;
    }

    /// Enter candidacy. A sitting leader keeps its role until an
    /// announcement settles the election.
    pub fn set_candidate(&self) {
        let mut view = self.inner.write();
        if view.role != Role::Leader {
            view.role = Role::Candidate;
        }
    }
}

/// Process-wide cooperative stop flag for all background loops.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct NodeContext {
    pub self_id: NodeId,
    pub config: Config,
    pub membership: Arc<Membership>,
    pub liveness: Arc<Liveness>,
    pub cluster: Arc<ClusterView>,
    pub rpc: Arc<PeerClient>,
    pub election: Arc<Election>,
    pub heartbeat: Arc<Heartbeat>,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<StepExecutor>,
    pub shutdown: Shutdown,
}

impl NodeContext {
    pub fn new(self_id: NodeId, config: Config) -> Result<Arc<Self>> {
        let membership = Arc::new(Membership::new(self_id, &config.nodes)?);
        let liveness = Arc::new(Liveness::new(self_id, config.network.leader_timeout()));
        let cluster = Arc::new(ClusterView::new(self_id));
        let rpc = Arc::new(PeerClient::new());
        let election = Arc::new(Election::new(
            self_id,
            Arc::clone(&membership),
            Arc::clone(&cluster),
            Arc::clone(&rpc),
            config.network.election_timeout(),
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            self_id,
            Arc::clone(&membership),
            Arc::clone(&liveness),
            Arc::clone(&cluster),
            Arc::clone(&election),
            Arc::clone(&rpc),
            config.network.heartbeat_interval(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            self_id,
            SchedulerConfig::from_tasks(&config.tasks),
            Arc::clone(&membership),
            Arc::clone(&liveness),
            Arc::clone(&cluster),
            Arc::clone(&rpc),
        ));
        let executor = Arc::new(StepExecutor::new(AiClient::new(config.api.clone())));

        Ok(Arc::new(Self {
            self_id,
            config,
            membership,
            liveness,
            cluster,
            rpc,
            election,
            heartbeat,
            scheduler,
            executor,
            shutdown: Shutdown::new(),
        }))
    }

    /// Spawn every background loop and begin the startup election.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.heartbeat.spawn(&self.shutdown);
        handles.extend(self.scheduler.spawn(&self.shutdown));
        self.election.start_election();
        handles
    }

    /// Stop all loops cooperatively; each gets a bounded grace period.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.trigger();
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }

    pub fn bind_address(&self) -> Result<SocketAddr> {
        let spec = self
            .config
            .node(self.self_id)
            .ok_or(Error::UnknownNode(self.self_id))?;
        format!("{}:{}", spec.ip, spec.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {e}")))
    }

    /// Read-only snapshot for the status surface.
    pub fn status(&self) -> StatusReport {
        let address = self
            .config
            .node(self.self_id)
            .map(|spec| format!("{}:{}", spec.ip, spec.port))
            .unwrap_or_default();
        StatusReport {
            node_id: self.self_id,
            role: self.cluster.role(),
            leader_id: self.cluster.leader(),
            address,
            alive_nodes: self.liveness.alive().into_iter().collect(),
            tasks: self.scheduler.counts(),
            tasks_processed: self.executor.tasks_processed(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub node_id: NodeId,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub address: String,
    pub alive_nodes: Vec<NodeId>,
    pub tasks: QueueCounts,
    pub tasks_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_starts_as_follower_without_leader() {
        let view = ClusterView::new(1);
        assert_eq!(view.role(), Role::Follower);
        assert_eq!(view.leader(), None);
        assert!(!view.is_leader());
    }

    #[test]
    fn leader_role_implies_self_leader_id() {
        let view = ClusterView::new(2);
        view.set_leader(2);
        assert_eq!(view.role(), Role::Leader);
        assert_eq!(view.leader(), Some(2));

        view.set_leader(3);
        assert_eq!(view.role(), Role::Follower);
        assert_eq!(view.leader(), Some(3));
    }

    #[test]
    fn candidacy_does_not_demote_a_sitting_leader() {
        let view = ClusterView::new(2);
        view.set_candidate();
        assert_eq!(view.role(), Role::Candidate);

        view.set_leader(2);
        view.set_candidate();
        assert_eq!(view.role(), Role::Leader);
    }
}
