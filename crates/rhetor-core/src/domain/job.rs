//! Job record and status view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, StageError};
use super::fingerprint::Fingerprint;
use super::ids::{JobId, TaskId};
use super::request::JobRequest;
use super::stage::StageKind;
use super::state::JobState;

/// Why a job ended in FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub stage: StageKind,
    pub kind: ErrorKind,
    pub error: StageError,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for {job_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Job record: owned by the coordinator, mutated only through [`JobRecord::transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub request: JobRequest,
    pub state: JobState,

    /// Stage tasks in creation order (never more than one per stage).
    pub task_ids: Vec<TaskId>,
    pub current_task: Option<TaskId>,

    /// Fingerprint of the final stage's output once DONE.
    pub result: Option<Fingerprint>,
    pub failure: Option<FailureReason>,
    pub cancel_detail: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_id: JobId, request: JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            request,
            state: JobState::Queued,
            task_ids: Vec::new(),
            current_task: None,
            result: None,
            failure: None,
            cancel_detail: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn add_task(&mut self, task_id: TaskId, now: DateTime<Utc>) {
        self.task_ids.push(task_id);
        self.current_task = Some(task_id);
        self.updated_at = now;
    }

    /// Apply a state change after checking the transition table.
    pub fn transition(&mut self, to: JobState, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                job_id: self.job_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn complete(&mut self, result: Fingerprint, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Done, now)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Failed, now)?;
        self.failure = Some(reason);
        Ok(())
    }

    pub fn cancel(&mut self, detail: String, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Cancelled, now)?;
        self.cancel_detail = Some(detail);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed_stages: usize,
    pub total_stages: usize,
    /// Attempt number of the current stage task (0 before the first lease).
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Read-only view returned by `get-status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub stage: Option<StageKind>,
    pub label: Option<String>,
    pub progress: Progress,
    pub result: Option<Fingerprint>,
    pub error: Option<FailureReason>,
    /// Most specific human-readable reason for the current state.
    pub detail: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
