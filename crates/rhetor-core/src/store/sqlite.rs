//! SQLite store (sqlx).
//!
//! Records are kept as JSON bodies next to the columns used for lookups.
//! Timestamps are RFC 3339 text.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use crate::domain::{
    Artifact, ArtifactContent, Fingerprint, IdempotencyKey, JobId, JobRecord, PatternMatch,
    StageTaskRecord,
};
use crate::ports::{ArtifactStore, ChangeSet, IdempotencyRecord, StateStore, StoreError};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url`, e.g. `sqlite://rhetor.db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database; a single connection so every query sees it.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stage_tasks (
                task_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(job_id),
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                fingerprint TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_records (
                key TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                output TEXT NOT NULL,
                completed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_matches (
                artifact TEXT NOT NULL REFERENCES artifacts(fingerprint),
                match_id TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                span_start INTEGER NOT NULL,
                span_end INTEGER NOT NULL,
                confidence REAL NOT NULL,
                source TEXT NOT NULL,
                suppressed INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (artifact, match_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_archived ON jobs(archived)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_stage_tasks_job_id ON stage_tasks(job_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pattern_matches_type ON pattern_matches(pattern_type)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Matches stored for an analysis artifact, in span order.
    pub async fn matches_for(&self, analysis: &Fingerprint) -> Result<Vec<PatternMatch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM pattern_matches
            WHERE artifact = ?
            ORDER BY span_start ASC, confidence DESC, pattern_type ASC
            "#,
        )
        .bind(analysis.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| decode(row.try_get("body")?)).collect()
    }
}

/// Fixed-width UTC timestamps sort lexically.
fn timestamp(at: &chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn decode<T: serde::de::DeserializeOwned>(body: String) -> Result<T, StoreError> {
    Ok(serde_json::from_str(&body)?)
}

async fn upsert_job(tx: &mut Transaction<'_, Sqlite>, job: &JobRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO jobs (job_id, state, created_at, updated_at, body)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET
            state = excluded.state,
            updated_at = excluded.updated_at,
            body = excluded.body
        "#,
    )
    .bind(job.job_id.to_string())
    .bind(job.state.label())
    .bind(timestamp(&job.created_at))
    .bind(timestamp(&job.updated_at))
    .bind(serde_json::to_string(job)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_task(tx: &mut Transaction<'_, Sqlite>, task: &StageTaskRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO stage_tasks (task_id, job_id, stage, status, idempotency_key, created_at, body)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_id) DO UPDATE SET
            status = excluded.status,
            body = excluded.body
        "#,
    )
    .bind(task.task_id.to_string())
    .bind(task.job_id.to_string())
    .bind(task.stage.as_str())
    .bind(task.status.as_str())
    .bind(task.idempotency_key.as_str())
    .bind(timestamp(&task.created_at))
    .bind(serde_json::to_string(task)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl SqliteStore {
    async fn tasks_of(&self, job_id: JobId) -> Result<Vec<StageTaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM stage_tasks WHERE job_id = ? ORDER BY created_at ASC, task_id ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode(row.try_get("body")?)).collect()
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for job in &changes.jobs {
            upsert_job(&mut tx, job).await?;
        }
        for task in &changes.tasks {
            upsert_task(&mut tx, task).await?;
        }
        tx.commit().await?;
        debug!(jobs = changes.jobs.len(), tasks = changes.tasks.len(), "change set committed");
        Ok(())
    }

    async fn load_active(&self) -> Result<(Vec<JobRecord>, Vec<StageTaskRecord>), StoreError> {
        let job_rows = sqlx::query("SELECT body FROM jobs WHERE archived = 0 ORDER BY job_id ASC")
            .fetch_all(&self.pool)
            .await?;
        let jobs = job_rows
            .iter()
            .map(|row| decode(row.try_get("body")?))
            .collect::<Result<Vec<JobRecord>, _>>()?;

        let task_rows = sqlx::query(
            r#"
            SELECT t.body FROM stage_tasks t
            JOIN jobs j ON j.job_id = t.job_id
            WHERE j.archived = 0
            ORDER BY t.job_id ASC, t.created_at ASC, t.task_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let tasks = task_rows
            .iter()
            .map(|row| decode(row.try_get("body")?))
            .collect::<Result<Vec<StageTaskRecord>, _>>()?;

        Ok((jobs, tasks))
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<(JobRecord, Vec<StageTaskRecord>)>, StoreError> {
        let row = sqlx::query("SELECT body FROM jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job: JobRecord = decode(row.try_get("body")?)?;
        let tasks = self.tasks_of(job_id).await?;
        Ok(Some((job, tasks)))
    }

    async fn archive_jobs(&self, job_ids: &[JobId]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for job_id in job_ids {
            sqlx::query("UPDATE jobs SET archived = 1 WHERE job_id = ?")
                .bind(job_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, stage, output, completed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                output = excluded.output,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(record.key.as_str())
        .bind(record.stage.as_str())
        .bind(record.output.as_str())
        .bind(timestamp(&record.completed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_idempotency(&self, key: &IdempotencyKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM idempotency_records WHERE key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_idempotency(&self) -> Result<Vec<IdempotencyRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT key, stage, output, completed_at FROM idempotency_records ORDER BY key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let key: String = row.try_get("key")?;
                let stage: String = row.try_get("stage")?;
                let output: String = row.try_get("output")?;
                let completed_at: String = row.try_get("completed_at")?;
                Ok(IdempotencyRecord {
                    key: IdempotencyKey::from_hex(key.clone())
                        .ok_or_else(|| StoreError::Corrupt(format!("bad idempotency key {key}")))?,
                    stage: stage
                        .parse()
                        .map_err(|e| StoreError::Corrupt(format!("idempotency record: {e}")))?,
                    output: Fingerprint::from_hex(output.clone())
                        .ok_or_else(|| StoreError::Corrupt(format!("bad fingerprint {output}")))?,
                    completed_at: chrono::DateTime::parse_from_rfc3339(&completed_at)
                        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {completed_at}: {e}")))?
                        .with_timezone(&chrono::Utc),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn put(&self, artifact: &Artifact) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO artifacts (fingerprint, kind, created_at, body)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(artifact.fingerprint.as_str())
        .bind(artifact.kind.as_str())
        .bind(timestamp(&artifact.created_at))
        .bind(serde_json::to_string(artifact)?)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted && let ArtifactContent::Analysis(report) = &artifact.content {
            for m in &report.matches {
                sqlx::query(
                    r#"
                    INSERT INTO pattern_matches
                        (artifact, match_id, pattern_type, span_start, span_end,
                         confidence, source, suppressed, body)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(artifact.fingerprint.as_str())
                .bind(&m.match_id)
                .bind(m.pattern_type.as_str())
                .bind(m.span.start as i64)
                .bind(m.span.end as i64)
                .bind(m.confidence)
                .bind(m.source.as_str())
                .bind(m.suppressed)
                .bind(serde_json::to_string(m)?)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query("SELECT body FROM artifacts WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode(row.try_get("body")?)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AnalysisReport, JobRequest, JobState, MatchSource, PatternType, Span, StageKind, TaskId,
        Transcript, TranscriptSegment,
    };
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn records() -> (JobRecord, StageTaskRecord) {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let mut job = JobRecord::new(JobId::from_ulid(Ulid::new()), JobRequest::subject("mayor"), now);
        let input = Fingerprint::of_bytes(b"request");
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
    async fn change_sets_round_trip_and_update_in_place() {
        let store = SqliteStore::in_memory().await.unwrap();
        let (mut job, mut task) = records();
        store
            .commit(ChangeSet::default().job(&job).task(&task))
            .await
            .unwrap();

        let now = job.created_at + chrono::Duration::seconds(1);
        job.transition(JobState::Ingesting, now).unwrap();
        task.start_attempt(now);
        store
            .commit(ChangeSet::default().job(&job).task(&task))
            .await
            .unwrap();

        let (jobs, tasks) = store.load_active().await.unwrap();
        assert_eq!(jobs, vec![job.clone()]);
        assert_eq!(tasks, vec![task.clone()]);

        store.archive_jobs(&[job.job_id]).await.unwrap();
        let (jobs, _) = store.load_active().await.unwrap();
        assert!(jobs.is_empty());
        assert_eq!(store.load_job(job.job_id).await.unwrap(), Some((job, vec![task])));
    }

    #[tokio::test]
    async fn idempotency_records_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let record = IdempotencyRecord {
            key: IdempotencyKey::derive(StageKind::Transcribe, "v1", &Fingerprint::of_bytes(b"m")),
            stage: StageKind::Transcribe,
            output: Fingerprint::of_bytes(b"t"),
            completed_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
        };
        store.put_idempotency(&record).await.unwrap();
        assert_eq!(store.load_idempotency().await.unwrap(), vec![record.clone()]);

        store.delete_idempotency(&record.key).await.unwrap();
        assert!(store.load_idempotency().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn analysis_artifact_writes_its_matches() {
        let store = SqliteStore::in_memory().await.unwrap();
        let span = Span::new(0, 10);
        let pattern_type = PatternType::new("personal_attack");
        let report = AnalysisReport {
            engine_version: "rhetor-engine/1#abc".into(),
            transcript: Transcript::new("t", vec![TranscriptSegment::new(0.0, 1.0, "He is a liar")]),
            span_count: 1,
            matches: vec![PatternMatch {
                match_id: PatternMatch::make_id(span, &pattern_type),
                span,
                text: "He is a li".into(),
                start_time: 0.0,
                end_time: 1.0,
                pattern_type,
                confidence: 0.6,
                source: MatchSource::Rule,
                rationale: None,
                suppressed: false,
                suppressed_by: None,
                rule_ids: vec!["personal_attack.insults".into()],
                exemplar_ids: vec![],
                evidence: vec![Span::new(6, 10)],
            }],
            disagreements: vec![],
            partial_failures: vec![],
        };
        let artifact = Artifact::new(ArtifactContent::Analysis(report.clone()), Utc::now()).unwrap();

        assert!(store.put(&artifact).await.unwrap());
        assert!(!store.put(&artifact).await.unwrap());
        assert_eq!(store.get(&artifact.fingerprint).await.unwrap(), Some(artifact.clone()));
        assert_eq!(store.matches_for(&artifact.fingerprint).await.unwrap(), report.matches);
    }
}
