//! Peer RPC wire types and outbound client.
//!
//! All peer-to-peer traffic is HTTP with JSON bodies. Every call carries a
//! bounded deadline; silence within the deadline is semantic for
//! heartbeats and elections, so transport failures are surfaced to the
//! caller and never retried here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{JobId, JobPayload, NodeId, StepInput, StepOutput};

pub const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(3);
pub const ELECTION_DEADLINE: Duration = Duration::from_secs(5);
pub const STEP_DEADLINE: Duration = Duration::from_secs(10);
pub const FORWARD_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub node_id: NodeId,
    /// Sender wall clock, diagnostic only; liveness uses the receiver's
    /// monotonic clock.
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionCall {
    pub node_id: NodeId,
    pub election_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderAnnouncement {
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkCall {
    pub node_id: NodeId,
}

/// A step dispatched to a worker: `{task_id, task_type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAssignment {
    pub task_id: JobId,
    #[serde(flatten)]
    pub input: StepInput,
}

/// Worker reply: `{task_id, status, result?|error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReply {
    pub task_id: JobId,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome {
    Completed { result: StepOutput },
    Failed { error: String },
}

/// Client job submission body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub project_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl From<SubmitRequest> for JobPayload {
    fn from(req: SubmitRequest) -> Self {
        JobPayload {
            project_description: req.project_description,
            user_email: req.user_email,
        }
    }
}

/// Current Unix time in seconds, as carried in heartbeat pings.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Outbound HTTP client for every peer RPC.
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn post_ack<B: Serialize>(
        &self,
        peer: NodeId,
        url: String,
        body: &B,
        deadline: Duration,
    ) -> Result<()> {
        self.http
            .post(url)
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|source| Error::PeerUnreachable { peer, source })?;
        Ok(())
    }

    pub async fn send_heartbeat(&self, peer: NodeId, base: &str, ping: &HeartbeatPing) -> Result<()> {
        self.post_ack(peer, format!("{base}/heartbeat"), ping, HEARTBEAT_DEADLINE)
            .await
    }

    /// Send an election call to a higher peer. A 2xx reply is the peer's OK.
    pub async fn send_election(&self, peer: NodeId, base: &str, call: &ElectionCall) -> Result<()> {
        self.post_ack(peer, format!("{base}/election"), call, ELECTION_DEADLINE)
            .await
    }

    pub async fn send_ok(&self, peer: NodeId, base: &str, self_id: NodeId) -> Result<()> {
        self.post_ack(
            peer,
            format!("{base}/ok"),
            &OkCall { node_id: self_id },
            ELECTION_DEADLINE,
        )
        .await
    }

    pub async fn announce_leader(&self, peer: NodeId, base: &str, leader_id: NodeId) -> Result<()> {
        self.post_ack(
            peer,
            format!("{base}/leader"),
            &LeaderAnnouncement { leader_id },
            ELECTION_DEADLINE,
        )
        .await
    }

    /// Dispatch a step to a worker and wait for its synchronous reply.
    pub async fn execute_step(
        &self,
        peer: NodeId,
        base: &str,
        assignment: &StepAssignment,
    ) -> Result<StepReply> {
        let reply = self
            .http
            .post(format!("{base}/execute_task"))
            .timeout(STEP_DEADLINE)
            .json(assignment)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|source| Error::PeerUnreachable { peer, source })?
            .json::<StepReply>()
            .await
            .map_err(|source| Error::PeerUnreachable { peer, source })?;
        Ok(reply)
    }

    /// Proxy a client submission to the leader, returning its reply verbatim.
    pub async fn forward_submission(
        &self,
        leader: NodeId,
        base: &str,
        request: &SubmitRequest,
    ) -> Result<serde_json::Value> {
        let reply = self
            .http
            .post(format!("{base}/submit_task"))
            .timeout(FORWARD_DEADLINE)
            .json(request)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|source| Error::PeerUnreachable { peer: leader, source })?
            .json::<serde_json::Value>()
            .await
            .map_err(|source| Error::PeerUnreachable { peer: leader, source })?;
        Ok(reply)
    }
}
