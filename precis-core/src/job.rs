//! Job and step data model.
//!
//! A job is an ordered sequence of three steps (summarize, structure,
//! render), each dispatched to exactly one worker at a time. Step inputs
//! and outputs are tagged variants so each step's payload shape is checked
//! at compile time while serializing to the shared wire JSON.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer node identifier; id order is the election tiebreaker.
pub type NodeId = u32;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Summarize,
    Structure,
    Render,
}

impl StepKind {
    /// The fixed step schema every job is created with, in execution order.
    pub const SCHEMA: [StepKind; 3] = [StepKind::Summarize, StepKind::Structure, StepKind::Render];
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Summarize => write!(f, "summarize"),
            StepKind::Structure => write!(f, "structure"),
            StepKind::Render => write!(f, "render"),
        }
    }
}

/// Client-supplied job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub project_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

/// Step input, dispatched to a worker as `{task_id, task_type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "data", rename_all = "snake_case")]
pub enum StepInput {
    Summarize { project_description: String },
    Structure { summary: String },
    Render { job_id: JobId },
}

impl StepInput {
    pub fn kind(&self) -> StepKind {
        match self {
            StepInput::Summarize { .. } => StepKind::Summarize,
            StepInput::Structure { .. } => StepKind::Structure,
            StepInput::Render { .. } => StepKind::Render,
        }
    }
}

/// The four sections the structuring step produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredSummary {
    pub r#abstract: String,
    pub objectives: String,
    pub methodology: String,
    pub outcome: String,
}

/// Sentinel reply for the render step; actual rendering happens on the
/// leader once the job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderAck {
    pub message: String,
}

/// Step result, one shape per step kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepOutput {
    Summary(String),
    Structured(StructuredSummary),
    Rendered(RenderAck),
}

impl StepOutput {
    pub fn as_summary(&self) -> Option<&str> {
        match self {
            StepOutput::Summary(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&StructuredSummary> {
        match self {
            StepOutput::Structured(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub kind: StepKind,
    pub status: StepStatus,
    pub result: Option<StepOutput>,
}

impl Step {
    fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
    /// Index of the first step that is not yet completed.
    pub current_step: usize,
    pub assigned_to: Option<NodeId>,
    pub retry_count: u32,
    /// Monotonic timestamp of the moment the current step was assigned.
    #[serde(skip)]
    pub assigned_at: Option<Instant>,
    /// Sequence number of the current assignment; replies carrying a stale
    /// sequence are dropped by the scheduler.
    #[serde(skip)]
    pub assignment_seq: u64,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        let id = Uuid::new_v4().to_string()[..8].to_string();
        Self {
            id,
            status: JobStatus::Pending,
            payload,
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            steps: StepKind::SCHEMA.iter().copied().map(Step::new).collect(),
            current_step: 0,
            assigned_to: None,
            retry_count: 0,
            assigned_at: None,
            assignment_seq: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    pub fn current_kind(&self) -> Option<StepKind> {
        self.steps.get(self.current_step).map(|s| s.kind)
    }

    /// Index of the first non-completed step, or the step count when all
    /// are done. `current_step` must always equal this.
    pub fn first_incomplete(&self) -> usize {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Completed)
            .unwrap_or(self.steps.len())
    }

    /// Transition the current step to assigned.
    pub fn assign(&mut self, worker: NodeId, seq: u64) {
        if let Some(step) = self.steps.get_mut(self.current_step) {
            step.status = StepStatus::Assigned;
        }
        self.status = JobStatus::InProgress;
        self.assigned_to = Some(worker);
        self.assigned_at = Some(Instant::now());
        self.assignment_seq = seq;
    }

    /// Mark the current step completed and advance. Returns true when the
    /// last step just finished.
    pub fn complete_current_step(&mut self, result: StepOutput) -> bool {
        if let Some(step) = self.steps.get_mut(self.current_step) {
            step.status = StepStatus::Completed;
            step.result = Some(result);
        }
        self.current_step += 1;
        self.assigned_to = None;
        self.assigned_at = None;
        if self.is_complete() {
            self.status = JobStatus::Completed;
            self.completed_at = Some(Utc::now());
            true
        } else {
            self.status = JobStatus::Pending;
            false
        }
    }

    /// Put the current step back to pending after a failed attempt.
    pub fn reset_current_step(&mut self) {
        if let Some(step) = self.steps.get_mut(self.current_step) {
            step.status = StepStatus::Pending;
            step.result = None;
        }
        self.status = JobStatus::Pending;
        self.assigned_to = None;
        self.assigned_at = None;
    }

    /// Mark the job permanently failed.
    pub fn mark_failed(&mut self) {
        if let Some(step) = self.steps.get_mut(self.current_step) {
            step.status = StepStatus::Failed;
        }
        self.status = JobStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.assigned_to = None;
        self.assigned_at = None;
    }

    /// Result of the summarization step, once completed.
    pub fn summary(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.kind == StepKind::Summarize)
            .and_then(|s| s.result.as_ref())
            .and_then(|r| r.as_summary())
    }

    /// Result of the structuring step, once completed.
    pub fn structured(&self) -> Option<&StructuredSummary> {
        self.steps
            .iter()
            .find(|s| s.kind == StepKind::Structure)
            .and_then(|s| s.result.as_ref())
            .and_then(|r| r.as_structured())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        JobPayload {
            project_description: "Build X".to_string(),
            user_email: None,
        }
    }

    #[test]
    fn new_job_follows_step_schema() {
        let job = Job::new(payload());
        assert_eq!(job.id.len(), 8);
        assert_eq!(job.status, JobStatus::Pending);
        let kinds: Vec<_> = job.steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StepKind::SCHEMA.to_vec());
        assert_eq!(job.current_step, job.first_incomplete());
    }

    #[test]
    fn step_advancement_tracks_first_incomplete() {
        let mut job = Job::new(payload());
        job.assign(2, 1);
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.assigned_at.is_some());

        let done = job.complete_current_step(StepOutput::Summary("sum".into()));
        assert!(!done);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_step, 1);
        assert_eq!(job.current_step, job.first_incomplete());
        assert!(job.assigned_to.is_none());
    }

    #[test]
    fn completing_last_step_completes_job() {
        let mut job = Job::new(payload());
        job.complete_current_step(StepOutput::Summary("sum".into()));
        job.complete_current_step(StepOutput::Structured(StructuredSummary {
            r#abstract: "a".into(),
            objectives: "o".into(),
            methodology: "m".into(),
            outcome: "r".into(),
        }));
        let done = job.complete_current_step(StepOutput::Rendered(RenderAck {
            message: "ok".into(),
        }));
        assert!(done);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(job.first_incomplete(), job.steps.len());
    }

    #[test]
    fn reset_clears_assignment_state() {
        let mut job = Job::new(payload());
        job.assign(3, 7);
        job.reset_current_step();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.steps[0].status, StepStatus::Pending);
        assert!(job.assigned_to.is_none());
        assert!(job.assigned_at.is_none());
    }

    #[test]
    fn step_input_serializes_to_wire_shape() {
        let input = StepInput::Summarize {
            project_description: "Build X".into(),
        };
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["task_type"], "summarize");
        assert_eq!(value["data"]["project_description"], "Build X");
    }

    #[test]
    fn step_output_roundtrips_per_variant() {
        let summary = StepOutput::Summary("short".into());
        let json = serde_json::to_string(&summary).unwrap();
        assert_eq!(serde_json::from_str::<StepOutput>(&json).unwrap(), summary);

        let structured = StepOutput::Structured(StructuredSummary {
            r#abstract: "a".into(),
            objectives: "o".into(),
            methodology: "m".into(),
            outcome: "r".into(),
        });
        let json = serde_json::to_string(&structured).unwrap();
        assert_eq!(
            serde_json::from_str::<StepOutput>(&json).unwrap(),
            structured
        );
    }
}
