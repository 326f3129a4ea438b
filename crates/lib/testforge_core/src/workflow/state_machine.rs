//! Job state transitions.

use chrono::Utc;

use super::WorkflowError;
use crate::models::job::{GenerationJob, JobState};

/// States reachable from `from` in one step.
pub fn allowed_transitions(from: JobState) -> &'static [JobState] {
    use JobState::*;
    match from {
        Created => &[FetchingFiles, Failed],
        FetchingFiles => &[Generating, Failed],
        Generating => &[ReadyForReview, Failed],
        ReadyForReview => &[Saved, Failed],
        Saved => &[Saved, Publishing, Failed],
        Publishing => &[Published, Failed],
        Published => &[],
        Failed => &[Retrying],
        Retrying => &[FetchingFiles, Generating, Publishing, Failed],
    }
}

pub fn can_transition(from: JobState, to: JobState) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Move `job` to `to`, stamping `updated_at`.
pub fn transition(job: &mut GenerationJob, to: JobState) -> Result<(), WorkflowError> {
    if !can_transition(job.state, to) {
        return Err(WorkflowError::InvalidState {
            state: job.state,
            action: target_action(to),
        });
    }
    job.state = to;
    job.updated_at = Utc::now();
    Ok(())
}

fn target_action(to: JobState) -> &'static str {
    match to {
        JobState::FetchingFiles => "fetch files for",
        JobState::Generating => "generate tests for",
        JobState::ReadyForReview => "complete generation of",
        JobState::Saved => "save edits to",
        JobState::Publishing | JobState::Published => "publish",
        JobState::Retrying => "retry",
        JobState::Failed => "fail",
        JobState::Created => "create",
    }
}

/// Where a retry re-enters the pipeline for a job that failed in `step`.
pub fn resume_state(step: JobState) -> Option<JobState> {
    match step {
        JobState::Created | JobState::FetchingFiles => Some(JobState::FetchingFiles),
        JobState::Generating => Some(JobState::Generating),
        JobState::Publishing => Some(JobState::Publishing),
        _ => None,
    }
}
