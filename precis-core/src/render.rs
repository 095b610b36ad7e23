//! Final report rendering.
//!
//! Once a job's last step completes, the leader assembles the summary and
//! the structured sections into a Markdown report under the configured
//! output directory. A rendering failure leaves the job completed; only
//! the downloadable artifact is missing.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::job::Job;

pub fn artifact_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("{job_id}_summary.md"))
}

pub fn write_report(dir: &Path, job: &Job) -> Result<PathBuf> {
    let summary = job
        .summary()
        .ok_or_else(|| Error::StepFailed("summarization result missing".into()))?;
    let sections = job
        .structured()
        .ok_or_else(|| Error::StepFailed("structuring result missing".into()))?;

    let mut report = String::new();
    report.push_str("# Project Summary Report\n\n");
    report.push_str("## Summary\n\n");
    report.push_str(summary);
    report.push_str("\n\n");
    for (title, body) in [
        ("Abstract", &sections.r#abstract),
        ("Objectives", &sections.objectives),
        ("Methodology", &sections.methodology),
        ("Outcome", &sections.outcome),
    ] {
        report.push_str(&format!("## {title}\n\n{body}\n\n"));
    }
    if let Some(email) = &job.payload.user_email {
        report.push_str(&format!("---\nRequested by {email}\n"));
    }

    std::fs::create_dir_all(dir)?;
    let path = artifact_path(dir, &job.id);
    std::fs::write(&path, report)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, RenderAck, StepOutput, StructuredSummary};

    fn completed_job() -> Job {
        let mut job = Job::new(JobPayload {
            project_description: "Build X".into(),
            user_email: Some("dev@example.com".into()),
        });
        job.complete_current_step(StepOutput::Summary("a tidy summary".into()));
        job.complete_current_step(StepOutput::Structured(StructuredSummary {
            r#abstract: "overview".into(),
            objectives: "goals".into(),
            methodology: "approach".into(),
            outcome: "results".into(),
        }));
        job.complete_current_step(StepOutput::Rendered(RenderAck {
            message: "ok".into(),
        }));
        job
    }

    #[test]
    fn artifact_path_uses_job_id() {
        let path = artifact_path(Path::new("outputs"), "ab12cd34");
        assert_eq!(path, PathBuf::from("outputs/ab12cd34_summary.md"));
    }

    #[test]
    fn writes_report_with_all_sections() {
        let dir = tempfile::tempdir().unwrap();
        let job = completed_job();
        let path = write_report(dir.path(), &job).unwrap();
        let report = std::fs::read_to_string(path).unwrap();
        assert!(report.starts_with("# Project Summary Report"));
        assert!(report.contains("a tidy summary"));
        for section in ["Abstract", "Objectives", "Methodology", "Outcome"] {
            assert!(report.contains(&format!("## {section}")));
        }
        assert!(report.contains("dev@example.com"));
    }

    #[test]
    fn incomplete_job_cannot_be_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(JobPayload {
            project_description: "Build X".into(),
            user_email: None,
        });
        assert!(write_report(dir.path(), &job).is_err());
    }
}
