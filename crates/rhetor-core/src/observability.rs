use serde::{Deserialize, Serialize};

use crate::domain::{JobState, TaskStatus};

/// Per-state counters over the jobs and tasks the coordinator holds in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounts {
    pub queued: usize,
    pub ingesting: usize,
    pub transcribing: usize,
    pub analyzing: usize,
    pub retry_wait: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,

    pub tasks_pending: usize,
    pub tasks_running: usize,
    pub tasks_retrying: usize,
}

impl PipelineCounts {
    pub fn add_job(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Ingesting => self.ingesting += 1,
            JobState::Transcribing => self.transcribing += 1,
            JobState::Analyzing => self.analyzing += 1,
            JobState::RetryWait { .. } => self.retry_wait += 1,
            JobState::Done => self.done += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn add_task(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.tasks_pending += 1,
            TaskStatus::Running => self.tasks_running += 1,
            TaskStatus::Retrying => self.tasks_retrying += 1,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled => {}
        }
    }

    /// Tasks waiting for a worker or a backoff; what `max_queue_depth` bounds.
    pub fn backlog(&self) -> usize {
        self.tasks_pending + self.tasks_retrying
    }

    pub fn active_jobs(&self) -> usize {
        self.queued + self.ingesting + self.transcribing + self.analyzing + self.retry_wait
    }
}
