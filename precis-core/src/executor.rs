//! Worker-side step execution.
//!
//! Workers are stateless across requests apart from a processed-steps
//! counter. Summarization and structuring call the AI collaborator and
//! fall back to locally computed results when it is unavailable, so those
//! steps never fail for collaborator reasons. Rendering is acknowledged
//! with a sentinel; the leader produces the artifact when the job
//! completes.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, info};

use crate::ai::AiClient;
use crate::error::{Error, Result};
use crate::job::{RenderAck, StepInput, StepOutput, StructuredSummary};
use crate::rpc::{StepAssignment, StepOutcome, StepReply};

const FIELD_DEFAULT: &str = "Not specified";

pub struct StepExecutor {
    ai: AiClient,
    tasks_processed: AtomicU64,
}

impl StepExecutor {
    pub fn new(ai: AiClient) -> Self {
        Self {
            ai,
            tasks_processed: AtomicU64::new(0),
        }
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::Relaxed)
    }

    pub async fn execute(&self, assignment: StepAssignment) -> StepReply {
        let task_id = assignment.task_id;
        info!(task = %task_id, step = %assignment.input.kind(), "executing step");

        let result = match assignment.input {
            StepInput::Summarize {
                project_description,
            } => self.summarize(&project_description).await.map(StepOutput::Summary),
            StepInput::Structure { summary } => {
                self.structure(&summary).await.map(StepOutput::Structured)
            }
            StepInput::Render { .. } => Ok(StepOutput::Rendered(RenderAck {
                message: "render deferred to leader".into(),
            })),
        };

        match result {
            Ok(output) => {
                self.tasks_processed.fetch_add(1, Ordering::Relaxed);
                StepReply {
                    task_id,
                    outcome: StepOutcome::Completed { result: output },
                }
            }
            Err(e) => {
                error!(task = %task_id, error = %e, "step execution failed");
                StepReply {
                    task_id,
                    outcome: StepOutcome::Failed {
                        error: e.to_string(),
                    },
                }
            }
        }
    }

    async fn summarize(&self, description: &str) -> Result<String> {
        if description.trim().is_empty() {
            return Err(Error::StepFailed("no project description provided".into()));
        }
        let prompt = format!(
            "Please provide a concise summary of the following project description:\n\n\
             {description}\n\nSummary:"
        );
        Ok(match self.ai.complete(&prompt).await {
            Some(reply) => reply,
            None => truncated_summary(description),
        })
    }

    async fn structure(&self, summary: &str) -> Result<StructuredSummary> {
        if summary.trim().is_empty() {
            return Err(Error::StepFailed("no summary available for structuring".into()));
        }
        let prompt = format!(
            "Based on the following project summary, extract or create the following sections:\n\n\
             Summary: {summary}\n\n\
             Please provide:\n\
             1. Abstract: A brief overview\n\
             2. Objectives: Key goals and objectives\n\
             3. Methodology: Approach and methods used\n\
             4. Outcome: Expected or achieved results\n\n\
             Format the response as a JSON object with keys: abstract, objectives, methodology, outcome."
        );
        Ok(match self.ai.complete(&prompt).await {
            Some(reply) => parse_structured(&reply).unwrap_or_else(|| fallback_structure(summary)),
            None => fallback_structure(summary),
        })
    }
}

/// Collaborator-free summary: the description itself, truncated past 500
/// characters to the first 497 plus an ellipsis.
pub fn truncated_summary(description: &str) -> String {
    const LIMIT: usize = 500;
    if description.chars().count() > LIMIT {
        let head: String = description.chars().take(LIMIT - 3).collect();
        format!("{head}...")
    } else {
        description.to_string()
    }
}

/// Parse the collaborator reply as the structured object, filling missing
/// fields with a default. Returns None when the reply is not JSON.
pub fn parse_structured(reply: &str) -> Option<StructuredSummary> {
    let trimmed = reply.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let object = value.as_object()?;
    let field = |name: &str| {
        object
            .get(name)
            .and_then(|v| v.as_str())
            .unwrap_or(FIELD_DEFAULT)
            .to_string()
    };
    Some(StructuredSummary {
        r#abstract: field("abstract"),
        objectives: field("objectives"),
        methodology: field("methodology"),
        outcome: field("outcome"),
    })
}

/// Locally computed structure for when the collaborator reply is unusable.
pub fn fallback_structure(summary: &str) -> StructuredSummary {
    let r#abstract = if summary.chars().count() > 200 {
        let head: String = summary.chars().take(200).collect();
        format!("{head}...")
    } else {
        summary.to_string()
    };
    StructuredSummary {
        r#abstract,
        objectives: "Extracted from project description".into(),
        methodology: "To be determined based on project scope".into(),
        outcome: "Expected successful completion".into(),
    }
}
