//! Leader-side step scheduling.
//!
//! Runs on every node but only acts while this node is the leader. Holds
//! the pending FIFO plus the in-progress, completed and failed maps under
//! one lock. Assignment collects work under the lock, releases it, then
//! performs the step RPC from a spawned task; the outcome is applied by
//! retaking the lock. The timeout sweep is the authoritative retry
//! trigger: every assignment carries a sequence number and replies with a
//! stale sequence are dropped, so a late answer cannot corrupt a step
//! that was already retried elsewhere.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TasksConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobPayload, NodeId, StepInput, StepKind, StepOutput};
use crate::membership::{Liveness, Membership};
use crate::node::{ClusterView, Shutdown};
use crate::render;
use crate::rpc::{PeerClient, StepAssignment, StepOutcome, StepReply};

/// A worker never holds more than this many steps at once.
pub const MAX_WORKER_LOAD: usize = 3;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Completed jobs are kept for an hour for status reporting.
const COMPLETED_RETENTION_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_retries: u32,
    pub task_timeout: Duration,
    pub max_pending: usize,
    pub output_dir: PathBuf,
}

impl SchedulerConfig {
    pub fn from_tasks(tasks: &TasksConfig) -> Self {
        Self {
            max_retries: tasks.max_retries,
            task_timeout: tasks.task_timeout(),
            max_pending: tasks.max_pending,
            output_dir: tasks.output_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct SchedState {
    pending: VecDeque<Job>,
    in_progress: HashMap<JobId, Job>,
    completed: HashMap<JobId, Job>,
    failed: HashMap<JobId, Job>,
    rr_cursor: usize,
}

/// One planned step dispatch, carried out of the lock.
struct Dispatch {
    job_id: JobId,
    seq: u64,
    worker: NodeId,
    addr: String,
    assignment: StepAssignment,
}

pub struct Scheduler {
    self_id: NodeId,
    cfg: SchedulerConfig,
    membership: Arc<Membership>,
    liveness: Arc<Liveness>,
    cluster: Arc<ClusterView>,
    rpc: Arc<PeerClient>,
    state: Mutex<SchedState>,
    /// Wakes the assignment loop immediately on submission.
    kick: Notify,
    next_seq: AtomicU64,
}

impl Scheduler {
    pub fn new(
        self_id: NodeId,
        cfg: SchedulerConfig,
        membership: Arc<Membership>,
        liveness: Arc<Liveness>,
        cluster: Arc<ClusterView>,
        rpc: Arc<PeerClient>,
    ) -> Self {
        Self {
            self_id,
            cfg,
            membership,
            liveness,
            cluster,
            rpc,
            state: Mutex::new(SchedState::default()),
            kick: Notify::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Queue a new job. Rejects when the pending FIFO is at capacity.
    pub fn submit(&self, payload: JobPayload) -> Result<JobId> {
        let job = Job::new(payload);
        let id = job.id.clone();
        {
            let mut st = self.state.lock();
            if st.pending.len() >= self.cfg.max_pending {
                return Err(Error::QueueFull);
            }
            st.pending.push_back(job);
        }
        info!(job = %id, "job queued");
        self.kick.notify_one();
        Ok(id)
    }

    pub fn counts(&self) -> QueueCounts {
        let st = self.state.lock();
        QueueCounts {
            pending: st.pending.len(),
            in_progress: st.in_progress.len(),
            completed: st.completed.len(),
            failed: st.failed.len(),
        }
    }

    pub fn spawn(self: &Arc<Self>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::assignment_loop(Arc::clone(self), shutdown.subscribe())),
            tokio::spawn(Self::timeout_loop(Arc::clone(self), shutdown.subscribe())),
            tokio::spawn(Self::cleanup_loop(Arc::clone(self), shutdown.subscribe())),
        ]
    }

    async fn assignment_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = this.kick.notified() => {}
                _ = stop.changed() => break,
            }
            if !this.cluster.is_leader() {
                continue;
            }
            for dispatch in this.plan_assignments() {
                tokio::spawn(Arc::clone(&this).dispatch(dispatch));
            }
        }
    }

    async fn timeout_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if this.cluster.is_leader() {
                this.sweep_timeouts();
            }
        }
    }

    async fn cleanup_loop(this: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if this.cluster.is_leader() {
                this.sweep_completed();
            }
        }
    }

    /// Pair pending jobs with live workers, round-robin, respecting the
    /// per-worker load cap. Jobs move to in-progress under the lock; the
    /// RPCs happen after it is released.
    fn plan_assignments(&self) -> Vec<Dispatch> {
        let alive = self.liveness.alive();
        let mut st = self.state.lock();

        // worker id, address, remaining capacity
        let mut workers: Vec<(NodeId, String, usize)> = alive
            .into_iter()
            .filter(|peer| *peer != self.self_id)
            .filter_map(|peer| {
                let addr = self.membership.peer_address(peer)?;
                let load = st
                    .in_progress
                    .values()
                    .filter(|job| job.assigned_to == Some(peer))
                    .count();
                let capacity = MAX_WORKER_LOAD.saturating_sub(load);
                (capacity > 0).then_some((peer, addr, capacity))
            })
            .collect();

        let mut dispatches = Vec::new();
        while !st.pending.is_empty() && !workers.is_empty() {
            let len = workers.len();
            let Some(offset) = (0..len).find(|i| workers[(st.rr_cursor + i) % len].2 > 0) else {
                break;
            };
            let idx = (st.rr_cursor + offset) % len;
            st.rr_cursor = (idx + 1) % len;
            let (worker, addr, _) = workers[idx].clone();
            workers[idx].2 -= 1;

            let Some(mut job) = st.pending.pop_front() else {
                break;
            };
            let Some(input) = step_input_for(&job) else {
                // prerequisite result missing; count it as a failed attempt
                warn!(job = %job.id, "cannot build step input");
                let job_id = job.id.clone();
                st.in_progress.insert(job_id.clone(), job);
                self.fail_locked(&mut st, &job_id, "missing step input");
                continue;
            };

            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
            job.assign(worker, seq);
            info!(job = %job.id, step = %input.kind(), worker, "step assigned");
            dispatches.push(Dispatch {
                job_id: job.id.clone(),
                seq,
                worker,
                addr,
                assignment: StepAssignment {
                    task_id: job.id.clone(),
                    input,
                },
            });
            st.in_progress.insert(job.id.clone(), job);
        }
        dispatches
    }

    /// Carry one planned assignment over the wire and apply its outcome.
    async fn dispatch(self: Arc<Self>, dispatch: Dispatch) {
        let reply = self
            .rpc
            .execute_step(dispatch.worker, &dispatch.addr, &dispatch.assignment)
            .await;
        let completed = match reply {
            Ok(reply) => self.apply_reply(&dispatch.job_id, dispatch.seq, reply),
            Err(e) => {
                warn!(job = %dispatch.job_id, worker = dispatch.worker, error = %e,
                      "step dispatch failed");
                self.apply_failure(&dispatch.job_id, dispatch.seq, "worker unreachable");
                None
            }
        };
        if let Some(job) = completed {
            self.render_completed(job).await;
        }
    }

    /// Apply a worker reply. Returns the job when its last step just
    /// completed, so the caller can trigger rendering outside the lock.
    pub fn apply_reply(&self, job_id: &str, seq: u64, reply: StepReply) -> Option<Job> {
        match reply.outcome {
            StepOutcome::Completed { result } => self.apply_completion(job_id, seq, result),
            StepOutcome::Failed { error } => {
                warn!(job = %job_id, error = %error, "worker reported step failure");
                self.apply_failure(job_id, seq, &error);
                None
            }
        }
    }

    pub fn apply_completion(&self, job_id: &str, seq: u64, result: StepOutput) -> Option<Job> {
        let mut st = self.state.lock();
        let Some(mut job) = st.in_progress.remove(job_id) else {
            debug!(job = %job_id, "reply for unknown job dropped");
            return None;
        };
        if job.assignment_seq != seq {
            debug!(job = %job_id, "stale reply dropped");
            st.in_progress.insert(job_id.to_string(), job);
            return None;
        }
        if job.complete_current_step(result) {
            info!(job = %job_id, retries = job.retry_count, "job completed");
            st.completed.insert(job_id.to_string(), job.clone());
            Some(job)
        } else {
            debug!(job = %job_id, step = job.current_step, "step completed, job re-queued");
            st.pending.push_back(job);
            None
        }
    }

    pub fn apply_failure(&self, job_id: &str, seq: u64, reason: &str) {
        let mut st = self.state.lock();
        let current_seq = st.in_progress.get(job_id).map(|job| job.assignment_seq);
        match current_seq {
            Some(current) if current == seq => self.fail_locked(&mut st, job_id, reason),
            Some(_) => debug!(job = %job_id, "stale failure dropped"),
            None => debug!(job = %job_id, "failure for unknown job dropped"),
        }
    }

    fn fail_locked(&self, st: &mut SchedState, job_id: &str, reason: &str) {
        let Some(mut job) = st.in_progress.remove(job_id) else {
            return;
        };
        job.retry_count += 1;
        if job.retry_count >= self.cfg.max_retries {
            job.mark_failed();
            error!(job = %job_id, retries = job.retry_count, reason,
                   "job failed permanently");
            st.failed.insert(job_id.to_string(), job);
        } else {
            info!(job = %job_id, retry = job.retry_count, max = self.cfg.max_retries,
                  reason, "step re-queued for retry");
            job.reset_current_step();
            st.pending.push_back(job);
        }
    }

    /// Treat overdue assignments as lost workers.
    fn sweep_timeouts(&self) {
        let mut st = self.state.lock();
        let overdue: Vec<JobId> = st
            .in_progress
            .values()
            .filter(|job| {
                job.assigned_at
                    .map_or(false, |at| at.elapsed() > self.cfg.task_timeout)
            })
            .map(|job| job.id.clone())
            .collect();
        for job_id in overdue {
            warn!(job = %job_id, "step timed out, worker assumed lost");
            self.fail_locked(&mut st, &job_id, "step timeout");
        }
    }

    fn sweep_completed(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(COMPLETED_RETENTION_SECS);
        let mut st = self.state.lock();
        st.completed
            .retain(|_, job| job.completed_at.map_or(true, |at| at > cutoff));
    }

    async fn render_completed(&self, job: Job) {
        let dir = self.cfg.output_dir.clone();
        let job_id = job.id.clone();
        let outcome = tokio::task::spawn_blocking(move || render::write_report(&dir, &job)).await;
        match outcome {
            Ok(Ok(path)) => info!(job = %job_id, path = %path.display(), "report rendered"),
            // a render failure leaves the job completed; only the artifact is missing
            Ok(Err(e)) => warn!(job = %job_id, error = %e, "report rendering failed"),
            Err(e) => warn!(job = %job_id, error = %e, "render task aborted"),
        }
    }
}

fn step_input_for(job: &Job) -> Option<StepInput> {
    match job.current_kind()? {
        StepKind::Summarize => Some(StepInput::Summarize {
            project_description: job.payload.project_description.clone(),
        }),
        StepKind::Structure => job.summary().map(|summary| StepInput::Structure {
            summary: summary.to_string(),
        }),
        StepKind::Render => Some(StepInput::Render {
            job_id: job.id.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSpec;
    use crate::job::{JobStatus, RenderAck, StepStatus, StructuredSummary};

    fn specs(ids: &[NodeId]) -> Vec<NodeSpec> {
        ids.iter()
            .map(|id| NodeSpec {
                id: *id,
                ip: "127.0.0.1".into(),
                port: 18100 + *id as u16,
            })
            .collect()
    }

    fn scheduler(self_id: NodeId, ids: &[NodeId], max_retries: u32) -> Scheduler {
        let membership = Arc::new(Membership::new(self_id, &specs(ids)).unwrap());
        let liveness = Arc::new(Liveness::new(self_id, Duration::from_secs(5)));
        let cluster = Arc::new(ClusterView::new(self_id));
        cluster.set_leader(self_id);
        Scheduler::new(
            self_id,
            SchedulerConfig {
                max_retries,
                task_timeout: Duration::from_secs(60),
                max_pending: 8,
                output_dir: PathBuf::from("outputs"),
            },
            membership,
            liveness,
            cluster,
            Arc::new(PeerClient::new()),
        )
    }

    fn payload() -> JobPayload {
        JobPayload {
            project_description: "Build a weather station".into(),
            user_email: None,
        }
    }

    fn structured() -> StructuredSummary {
        StructuredSummary {
            r#abstract: "a".into(),
            objectives: "o".into(),
            methodology: "m".into(),
            outcome: "r".into(),
        }
    }

    #[test]
    fn assigns_round_robin_across_live_workers() {
        let sched = scheduler(3, &[1, 2, 3], 3);
        sched.liveness.record_seen(1);
        sched.liveness.record_seen(2);
        sched.submit(payload()).unwrap();
        sched.submit(payload()).unwrap();

        let dispatches = sched.plan_assignments();
        assert_eq!(dispatches.len(), 2);
        let mut workers: Vec<NodeId> = dispatches.iter().map(|d| d.worker).collect();
        workers.sort();
        assert_eq!(workers, vec![1, 2]);

        let st = sched.state.lock();
        assert_eq!(st.pending.len(), 0);
        assert_eq!(st.in_progress.len(), 2);
        for job in st.in_progress.values() {
            assert_eq!(job.status, JobStatus::InProgress);
            assert_eq!(job.steps[0].status, StepStatus::Assigned);
            assert!(job.assigned_at.is_some());
        }
    }

    #[test]
    fn single_node_cluster_has_no_workers() {
        // worker selection excludes self, so a lone leader never assigns
        let sched = scheduler(1, &[1], 3);
        sched.submit(payload()).unwrap();
        assert!(sched.plan_assignments().is_empty());
        assert_eq!(sched.counts().pending, 1);
    }

    #[test]
    fn respects_worker_load_cap() {
        let sched = scheduler(1, &[1, 2], 3);
        sched.liveness.record_seen(2);
        for _ in 0..5 {
            sched.submit(payload()).unwrap();
        }
        let dispatches = sched.plan_assignments();
        assert_eq!(dispatches.len(), MAX_WORKER_LOAD);
        assert_eq!(sched.counts().pending, 2);
        // the saturated worker takes nothing more
        assert!(sched.plan_assignments().is_empty());
    }

    #[test]
    fn completion_requeues_for_next_step() {
        let sched = scheduler(1, &[1, 2], 3);
        sched.liveness.record_seen(2);
        let id = sched.submit(payload()).unwrap();
        let dispatch = sched.plan_assignments().remove(0);

        let done = sched.apply_completion(&id, dispatch.seq, StepOutput::Summary("sum".into()));
        assert!(done.is_none());
        let st = sched.state.lock();
        let job = st.pending.front().unwrap();
        assert_eq!(job.current_step, 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.assigned_to.is_none());
    }

    #[test]
    fn final_step_completion_finishes_job() {
        let sched = scheduler(1, &[1, 2], 3);
        sched.liveness.record_seen(2);
        let id = sched.submit(payload()).unwrap();

        let d1 = sched.plan_assignments().remove(0);
        assert!(matches!(d1.assignment.input, StepInput::Summarize { .. }));
        sched.apply_completion(&id, d1.seq, StepOutput::Summary("sum".into()));

        let d2 = sched.plan_assignments().remove(0);
        assert_eq!(
            d2.assignment.input,
            StepInput::Structure { summary: "sum".into() }
        );
        sched.apply_completion(&id, d2.seq, StepOutput::Structured(structured()));

        let d3 = sched.plan_assignments().remove(0);
        assert!(matches!(d3.assignment.input, StepInput::Render { .. }));
        let done = sched.apply_completion(
            &id,
            d3.seq,
            StepOutput::Rendered(RenderAck { message: "ok".into() }),
        );

        let job = done.expect("last step completes the job");
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Completed));
        let counts = sched.counts();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.in_progress, 0);
    }

    #[test]
    fn failures_retry_until_cap_then_fail_permanently() {
        let sched = scheduler(1, &[1, 2], 3);
        sched.liveness.record_seen(2);
        let id = sched.submit(payload()).unwrap();

        for attempt in 1..=2 {
            let d = sched.plan_assignments().remove(0);
            sched.apply_failure(&id, d.seq, "worker crashed");
            let st = sched.state.lock();
            let job = st.pending.front().expect("requeued");
            assert_eq!(job.retry_count, attempt);
            assert_eq!(job.steps[0].status, StepStatus::Pending);
        }

        // third failure reaches max_retries
        let d = sched.plan_assignments().remove(0);
        sched.apply_failure(&id, d.seq, "worker crashed");
        let counts = sched.counts();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 0);
        let st = sched.state.lock();
        let job = st.failed.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.retry_count >= 3);
        assert!(job.failed_at.is_some());
    }

    #[test]
    fn stale_replies_are_dropped() {
        let sched = scheduler(1, &[1, 2], 3);
        sched.liveness.record_seen(2);
        let id = sched.submit(payload()).unwrap();

        let first = sched.plan_assignments().remove(0);
        sched.apply_failure(&id, first.seq, "timeout");
        let second = sched.plan_assignments().remove(0);
        assert_ne!(first.seq, second.seq);

        // the first attempt answers late; it must not touch the new attempt
        let done = sched.apply_completion(&id, first.seq, StepOutput::Summary("late".into()));
        assert!(done.is_none());
        let st = sched.state.lock();
        let job = st.in_progress.get(&id).unwrap();
        assert_eq!(job.assignment_seq, second.seq);
        assert_eq!(job.steps[0].status, StepStatus::Assigned);
        assert_eq!(job.current_step, 0);
    }

    #[test]
    fn stale_failure_does_not_double_retry() {
        let sched = scheduler(1, &[1, 2], 5);
        sched.liveness.record_seen(2);
        let id = sched.submit(payload()).unwrap();

        let first = sched.plan_assignments().remove(0);
        sched.apply_failure(&id, first.seq, "timeout");
        let second = sched.plan_assignments().remove(0);
        sched.apply_failure(&id, first.seq, "late transport error");

        let st = sched.state.lock();
        let job = st.in_progress.get(&id).unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.assignment_seq, second.seq);
    }

    #[test]
    fn timeout_sweep_retries_overdue_steps() {
        let mut sched = scheduler(1, &[1, 2], 3);
        sched.cfg.task_timeout = Duration::from_millis(10);
        sched.liveness.record_seen(2);
        let id = sched.submit(payload()).unwrap();
        sched.plan_assignments();

        std::thread::sleep(Duration::from_millis(30));
        sched.sweep_timeouts();

        let st = sched.state.lock();
        let job = st.pending.front().expect("timed-out job requeued");
        assert_eq!(job.id, id);
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn submit_rejects_when_pending_full() {
        let mut sched = scheduler(1, &[1, 2], 3);
        sched.cfg.max_pending = 1;
        sched.submit(payload()).unwrap();
        assert!(matches!(sched.submit(payload()), Err(Error::QueueFull)));
    }

    #[test]
    fn identical_payloads_get_distinct_job_ids() {
        // submission is intentionally non-idempotent
        let sched = scheduler(1, &[1, 2], 3);
        let a = sched.submit(payload()).unwrap();
        let b = sched.submit(payload()).unwrap();
        assert_ne!(a, b);
        assert_eq!(sched.counts().pending, 2);
    }

    #[test]
    fn completed_jobs_are_pruned_after_retention() {
        let sched = scheduler(1, &[1, 2], 3);
        let mut job = Job::new(payload());
        job.complete_current_step(StepOutput::Summary("s".into()));
        job.complete_current_step(StepOutput::Structured(structured()));
        job.complete_current_step(StepOutput::Rendered(RenderAck { message: "ok".into() }));
        job.completed_at = Some(Utc::now() - chrono::Duration::seconds(COMPLETED_RETENTION_SECS + 60));
        sched.state.lock().completed.insert(job.id.clone(), job);

        sched.sweep_completed();
        assert_eq!(sched.counts().completed, 0);
    }
}
