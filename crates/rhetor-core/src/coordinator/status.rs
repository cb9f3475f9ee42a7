//! JobStatus の組み立て（coordinator の状態ボードと CLI の両方で使う）。

use crate::domain::{JobRecord, JobState, JobStatus, Progress, StageTaskRecord, TaskStatus};

/// Builds the read-only status view from a job and its stage tasks.
///
/// `tasks` may come in any order; the job's `task_ids` order is used.
pub fn job_status(job: &JobRecord, tasks: &[StageTaskRecord]) -> JobStatus {
    let ordered: Vec<&StageTaskRecord> = job
        .task_ids
        .iter()
        .filter_map(|id| tasks.iter().find(|t| t.task_id == *id))
        .collect();
    let current = job
        .current_task
        .and_then(|id| ordered.iter().copied().find(|t| t.task_id == id))
        .or_else(|| ordered.last().copied());

    let completed_stages = ordered
        .iter()
        .filter(|t| t.status == TaskStatus::Succeeded)
        .count();

    let stage = job
        .state
        .stage()
        .or_else(|| job.failure.as_ref().map(|f| f.stage))
        .or_else(|| current.map(|t| t.stage));

    let detail = match job.state {
        JobState::Failed => job.failure.as_ref().map(|f| f.message.clone()),
        JobState::Cancelled => job.cancel_detail.clone(),
        JobState::RetryWait { stage } => current.and_then(|t| {
            t.last_error
                .as_ref()
                .map(|err| format!("{stage} attempt {}/{} failed: {err}", t.attempts, t.max_attempts))
        }),
        _ => None,
    };

    JobStatus {
        job_id: job.job_id,
        state: job.state,
        stage,
        label: job.request.options.label.clone(),
        progress: Progress {
            completed_stages,
            total_stages: job.request.final_stage().position() + 1,
            attempt: current.map(|t| t.attempts).unwrap_or(0),
            max_attempts: current.map(|t| t.max_attempts).unwrap_or(0),
        },
        result: job.result.clone(),
        error: job.failure.clone(),
        detail,
        next_retry_at: current
            .filter(|t| t.status == TaskStatus::Retrying)
            .and_then(|t| t.next_run_at),
        created_at: job.created_at,
        updated_at: job.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Fingerprint, IdempotencyKey, JobId, JobRequest, StageError, StageKind, TaskId,
    };
    use chrono::{Duration, Utc};
    use ulid::Ulid;

    fn job_and_task(stage: StageKind) -> (JobRecord, StageTaskRecord) {
        let now = Utc::now();
        let mut job = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            JobRequest::subject("x").with_label("debate night"),
            now,
        );
        let input = Fingerprint::of_bytes(b"in");
        let task = StageTaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            job.job_id,
            stage,
            input.clone(),
            IdempotencyKey::derive(stage, "v1", &input),
            3,
            now,
        );
        job.add_task(task.task_id, now);
        (job, task)
    }

    #[test]
    fn queued_job_reports_no_stage_and_full_plan() {
        let (job, task) = job_and_task(StageKind::Ingest);
        let status = job_status(&job, &[task]);
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.stage, Some(StageKind::Ingest));
        assert_eq!(status.label.as_deref(), Some("debate night"));
        assert_eq!(status.progress.total_stages, 3);
        assert_eq!(status.progress.completed_stages, 0);
        assert_eq!(status.progress.attempt, 0);
        assert_eq!(status.detail, None);
    }

    #[test]
    fn retry_wait_explains_the_last_error() {
        let (mut job, mut task) = job_and_task(StageKind::Ingest);
        let now = Utc::now();
        job.transition(JobState::Ingesting, now).unwrap();
        task.start_attempt(now);
        task.schedule_retry(
            now + Duration::seconds(2),
            StageError::Transient("503 from media host".into()),
            now,
        );
        job.transition(JobState::RetryWait { stage: StageKind::Ingest }, now)
            .unwrap();

        let status = job_status(&job, &[task]);
        assert_eq!(status.stage, Some(StageKind::Ingest));
        assert_eq!(status.next_retry_at, Some(now + Duration::seconds(2)));
        assert_eq!(
            status.detail.as_deref(),
            Some("ingest attempt 1/3 failed: transient failure: 503 from media host")
        );
    }
}
