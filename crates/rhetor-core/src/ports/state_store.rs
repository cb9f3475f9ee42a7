//! StateStore port - ジョブ / タスク / 冪等性レコードの永続化
//!
//! coordinator は 1 回の遷移で変わったレコードを `ChangeSet` にまとめて commit する。
//! 実装は ChangeSet をトランザクションとして扱うこと（全部反映 or 何も反映しない）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Fingerprint, IdempotencyKey, JobId, JobRecord, StageKind, StageTaskRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Records touched by one coordinator transition.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub jobs: Vec<JobRecord>,
    pub tasks: Vec<StageTaskRecord>,
}

impl ChangeSet {
    pub fn job(mut self, job: &JobRecord) -> Self {
        self.jobs.push(job.clone());
        self
    }

    pub fn task(mut self, task: &StageTaskRecord) -> Self {
        self.tasks.push(task.clone());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.tasks.is_empty()
    }
}

/// A completed idempotency record. In-progress locks are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub stage: StageKind,
    pub output: Fingerprint,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;

    /// Jobs (and their tasks) that have not been archived.
    async fn load_active(&self) -> Result<(Vec<JobRecord>, Vec<StageTaskRecord>), StoreError>;

    /// Any job, archived or not.
    async fn load_job(&self, job_id: JobId) -> Result<Option<(JobRecord, Vec<StageTaskRecord>)>, StoreError>;

    async fn archive_jobs(&self, job_ids: &[JobId]) -> Result<(), StoreError>;

    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError>;

    async fn delete_idempotency(&self, key: &IdempotencyKey) -> Result<(), StoreError>;

    async fn load_idempotency(&self) -> Result<Vec<IdempotencyRecord>, StoreError>;
}
