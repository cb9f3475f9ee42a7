//! In-memory store (default backend and tests).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::{Artifact, Fingerprint, IdempotencyKey, JobId, JobRecord, StageTaskRecord, TaskId};
use crate::ports::{ArtifactStore, ChangeSet, IdempotencyRecord, StateStore, StoreError};

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, StoredJob>,
    tasks: HashMap<TaskId, StageTaskRecord>,
    artifacts: HashMap<Fingerprint, Artifact>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
}

struct StoredJob {
    record: JobRecord,
    archived: bool,
}

/// Every method takes the lock once and never awaits while holding it.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn artifact_count(&self) -> usize {
        self.tables().artifacts.len()
    }

    pub fn is_archived(&self, job_id: JobId) -> bool {
        self.tables()
            .jobs
            .get(&job_id)
            .is_some_and(|job| job.archived)
    }

    /// Drops an artifact behind the pipeline's back.
    #[cfg(test)]
    pub(crate) fn remove_artifact(&self, fingerprint: &Fingerprint) {
        self.tables().artifacts.remove(fingerprint);
    }
}

fn tasks_of(tables: &Tables, job: &JobRecord) -> Vec<StageTaskRecord> {
    job.task_ids
        .iter()
        .filter_map(|id| tables.tasks.get(id).cloned())
        .collect()
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut tables = self.tables();
        for job in changes.jobs {
            let archived = tables.jobs.get(&job.job_id).is_some_and(|j| j.archived);
            tables.jobs.insert(
                job.job_id,
                StoredJob {
                    record: job,
                    archived,
                },
            );
        }
        for task in changes.tasks {
            tables.tasks.insert(task.task_id, task);
        }
        Ok(())
    }

    async fn load_active(&self) -> Result<(Vec<JobRecord>, Vec<StageTaskRecord>), StoreError> {
        let tables = self.tables();
        let mut jobs: Vec<JobRecord> = tables
            .jobs
            .values()
            .filter(|job| !job.archived)
            .map(|job| job.record.clone())
            .collect();
        jobs.sort_by_key(|job| job.job_id);
        let tasks = jobs.iter().flat_map(|job| tasks_of(&tables, job)).collect();
        Ok((jobs, tasks))
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<(JobRecord, Vec<StageTaskRecord>)>, StoreError> {
        let tables = self.tables();
        Ok(tables
            .jobs
            .get(&job_id)
            .map(|job| (job.record.clone(), tasks_of(&tables, &job.record))))
    }

    async fn archive_jobs(&self, job_ids: &[JobId]) -> Result<(), StoreError> {
        let mut tables = self.tables();
        for job_id in job_ids {
            if let Some(job) = tables.jobs.get_mut(job_id) {
                job.archived = true;
            }
        }
        Ok(())
    }

    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        self.tables()
            .idempotency
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn delete_idempotency(&self, key: &IdempotencyKey) -> Result<(), StoreError> {
        self.tables().idempotency.remove(key);
        Ok(())
    }

    async fn load_idempotency(&self) -> Result<Vec<IdempotencyRecord>, StoreError> {
        let mut records: Vec<_> = self.tables().idempotency.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn put(&self, artifact: &Artifact) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        if tables.artifacts.contains_key(&artifact.fingerprint) {
            return Ok(false);
        }
        tables
            .artifacts
            .insert(artifact.fingerprint.clone(), artifact.clone());
        Ok(true)
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>, StoreError> {
        Ok(self.tables().artifacts.get(fingerprint).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactContent, JobRequest, MediaInput, StageKind};
    use chrono::Utc;
    use ulid::Ulid;

    fn job_with_task() -> (JobRecord, StageTaskRecord) {
        let now = Utc::now();
        let mut job = JobRecord::new(JobId::from_ulid(Ulid::new()), JobRequest::subject("x"), now);
        let input = Fingerprint::of_bytes(b"in");
        let task = StageTaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            job.job_id,
            StageKind::Ingest,
            input.clone(),
            IdempotencyKey::derive(StageKind::Ingest, "v1", &input),
            3,
            now,
        );
        job.add_task(task.task_id, now);
        (job, task)
    }

    #[tokio::test]
    async fn archived_jobs_leave_the_active_set_but_stay_loadable() {
        let store = InMemoryStore::new();
        let (job, task) = job_with_task();
        store
            .commit(ChangeSet::default().job(&job).task(&task))
            .await
            .unwrap();

        let (jobs, tasks) = store.load_active().await.unwrap();
        assert_eq!(jobs, vec![job.clone()]);
        assert_eq!(tasks, vec![task.clone()]);

        store.archive_jobs(&[job.job_id]).await.unwrap();
        let (jobs, tasks) = store.load_active().await.unwrap();
        assert!(jobs.is_empty() && tasks.is_empty());
        assert!(store.is_archived(job.job_id));

        let (loaded, loaded_tasks) = store.load_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded_tasks, vec![task]);
    }

    #[tokio::test]
    async fn artifacts_are_written_once() {
        let store = InMemoryStore::new();
        let artifact = Artifact::new(
            ArtifactContent::MediaRequest(MediaInput::Subject { name: "x".into() }),
            Utc::now(),
        )
        .unwrap();

        assert!(store.put(&artifact).await.unwrap());
        assert!(!store.put(&artifact).await.unwrap());
        assert_eq!(store.get(&artifact.fingerprint).await.unwrap(), Some(artifact));
        assert_eq!(store.artifact_count(), 1);
    }
}
