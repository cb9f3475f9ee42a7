//! Stage task record: one stage of one job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::DecisionRecord;
use super::errors::StageError;
use super::fingerprint::{Fingerprint, IdempotencyKey};
use super::ids::{JobId, TaskId};
use super::stage::StageKind;
use super::state::TaskStatus;

/// Single source of truth for a stage task.
///
/// - Scheduler structures (ready queue, retry heap) hold `TaskId` only.
/// - All status changes go through the methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTaskRecord {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub stage: StageKind,
    pub status: TaskStatus,

    /// Attempts started so far (including the current one while running).
    pub attempts: u32,
    pub max_attempts: u32,

    pub input: Fingerprint,
    pub idempotency_key: IdempotencyKey,
    pub output: Option<Fingerprint>,
    /// Output came from the idempotency cache instead of running the engine.
    pub cache_hit: bool,

    pub last_error: Option<StageError>,
    pub next_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
}

impl StageTaskRecord {
    pub fn new(
        task_id: TaskId,
        job_id: JobId,
        stage: StageKind,
        input: Fingerprint,
        idempotency_key: IdempotencyKey,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            job_id,
            stage,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            input,
            idempotency_key,
            output: None,
            cache_hit: false,
            last_error: None,
            next_run_at: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            decisions: Vec::new(),
        }
    }

    /// Mark as running (increment attempts).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.next_run_at = None;
        self.started_at.get_or_insert(now);
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, output: Fingerprint, cache_hit: bool, now: DateTime<Utc>) {
        self.status = TaskStatus::Succeeded;
        self.output = Some(output);
        self.cache_hit = cache_hit;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: StageError, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error);
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Schedule retry with backoff.
    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, error: StageError, now: DateTime<Utc>) {
        self.status = TaskStatus::Retrying;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// A running attempt was lost (process restart). The attempt still counts.
    pub fn interrupt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.next_run_at = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ulid::Ulid;

    fn record(now: DateTime<Utc>) -> StageTaskRecord {
        let input = Fingerprint::of_bytes(b"in");
        StageTaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            JobId::from_ulid(Ulid::new()),
            StageKind::Ingest,
            input.clone(),
            IdempotencyKey::derive(StageKind::Ingest, "v1", &input),
            3,
            now,
        )
    }

    #[test]
    fn retry_cycle_keeps_attempt_count_and_first_start() {
        let t0 = Utc::now();
        let mut task = record(t0);
        task.start_attempt(t0 + Duration::milliseconds(1));
        task.schedule_retry(
            t0 + Duration::seconds(2),
            StageError::Transient("flaky".into()),
            t0 + Duration::milliseconds(2),
        );
        assert_eq!(task.status, TaskStatus::Retrying);

        task.start_attempt(t0 + Duration::seconds(3));
        assert_eq!(task.attempts, 2);
        assert_eq!(task.started_at, Some(t0 + Duration::milliseconds(1)));
        assert_eq!(task.next_run_at, None);
    }

    #[test]
    fn success_records_output_and_finish_time() {
        let t0 = Utc::now();
        let mut task = record(t0);
        task.start_attempt(t0);
        let out = Fingerprint::of_bytes(b"out");
        task.mark_succeeded(out.clone(), true, t0 + Duration::seconds(1));
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.output, Some(out));
        assert!(task.cache_hit);
        assert_eq!(task.finished_at, Some(t0 + Duration::seconds(1)));
    }
}
