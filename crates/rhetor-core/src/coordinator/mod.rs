//! Job Pipeline Coordinator.
//!
//! ジョブの状態遷移とステージタスクのスケジューリングを一手に引き受ける。
//!
//! ```text
//! submit ──▶ [QUEUED] ── lease ──▶ [INGESTING] ── succeed ──▶ [TRANSCRIBING] ─ ... ─▶ [DONE]
//!                                      │ fail (transient, attempts < max)
//!                                      ▼
//!                              [RETRY_WAIT(ingest)] ── backoff elapsed ── lease ──▶ [INGESTING]
//!                                      │ fail (permanent / exhausted)
//!                                      ▼
//!                                  [FAILED]
//! ```
//!
//! - 状態を書き換えるのは coordinator だけ（scheduler lock の中で直列化）
//! - 1 回の遷移で変わったレコードは `ChangeSet` として store に commit してから
//!   メモリに反映する
//! - `status()` は lock を取らずに status board を読む

mod builder;
mod pool;
mod retry;
mod scheduler;
mod status;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregateError, JobOutput, ResultAggregator};
use crate::config::PipelineConfig;
use crate::domain::{
    Artifact, ArtifactContent, Decider, Decision, DecisionRecord, ErrorKind, FailureReason,
    Fingerprint, IdempotencyKey, InvalidTransition, JobId, JobRecord, JobRequest, JobState,
    JobStatus, RequestError, StageError, StageKind, StageTaskRecord, TaskId, TaskStatus,
};
use crate::observability::PipelineCounts;
use crate::ports::{ArtifactStore, ChangeSet, Clock, IdGenerator, StateStore, StoreError};
use crate::worker::{StageOutput, StageRegistry};

use scheduler::{ScheduledTask, SchedulerState};

pub use builder::{BuildError, CoordinatorBuilder};
pub use pool::WorkerPool;
pub use retry::RetryPolicy;
pub use status::job_status;

const RETRY_POLICY: &str = "retry_policy";
const STORE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("backlog is full ({backlog}/{max_queue_depth} tasks waiting)")]
    Capacity {
        backlog: usize,
        max_queue_depth: usize,
    },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job_id} is not finished: {state}")]
    NotFinished {
        job_id: JobId,
        state: JobState,
        detail: Option<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("timed out waiting for job {0}")]
    WaitTimeout(JobId),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Capacity { .. } => ErrorKind::Capacity,
            CoordinatorError::Store(_) | CoordinatorError::WaitTimeout(_) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

impl From<AggregateError> for CoordinatorError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::Store(e) => CoordinatorError::Store(e),
            other => CoordinatorError::Artifact(other.to_string()),
        }
    }
}

/// One leased stage attempt. Handed back through [`Coordinator::succeed`] or
/// [`Coordinator::fail`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageLease {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub stage: StageKind,
    pub attempt: u32,
    pub input: Fingerprint,
}

pub struct Coordinator {
    config: PipelineConfig,
    state: Mutex<SchedulerState>,
    /// Ready / capacity changes.
    notify: Notify,
    board: RwLock<HashMap<JobId, JobStatus>>,
    board_changed: Notify,
    registry: StageRegistry,
    decider: Arc<dyn Decider>,
    state_store: Arc<dyn StateStore>,
    artifacts: Arc<dyn ArtifactStore>,
    aggregator: ResultAggregator,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Coordinator {
    pub fn builder(config: PipelineConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        config: PipelineConfig,
        registry: StageRegistry,
        decider: Arc<dyn Decider>,
        state_store: Arc<dyn StateStore>,
        artifacts: Arc<dyn ArtifactStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let aggregator = ResultAggregator::new(artifacts.clone(), config.config_version.clone());
        Self {
            config,
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
            board: RwLock::new(HashMap::new()),
            board_changed: Notify::new(),
            registry,
            decider,
            state_store,
            artifacts,
            aggregator,
            clock,
            ids,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========================================
    // Public contract
    // ========================================

    /// Validates the request and queues its Ingest task. Never waits for stage work.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, CoordinatorError> {
        let request = request.validate()?;
        let now = self.clock.now();
        let input = Artifact::new(ArtifactContent::MediaRequest(request.input.clone()), now)
            .map_err(|e| CoordinatorError::Artifact(e.to_string()))?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let backlog = state.backlog();
        if backlog >= self.config.max_queue_depth {
            warn!(backlog, max_queue_depth = self.config.max_queue_depth, "submit rejected: backlog full");
            return Err(CoordinatorError::Capacity {
                backlog,
                max_queue_depth: self.config.max_queue_depth,
            });
        }

        self.artifacts.put(&input).await?;

        let mut job = JobRecord::new(self.ids.generate_job_id(), request, now);
        let task = self.new_task(&job, StageKind::Ingest, input.fingerprint, now);
        job.add_task(task.task_id, now);
        let task_id = task.task_id;

        self.persist(state, ChangeSet::default().job(&job).task(&task))
            .await?;
        state.ready.push_back(task_id);
        drop(guard);
        self.notify.notify_waiters();

        info!(job_id = %job.job_id, %task_id, label = job.request.options.label.as_deref(), "job queued");
        Ok(job.job_id)
    }

    /// Read-only; never waits on the scheduler.
    pub fn status(&self, job_id: JobId) -> Result<JobStatus, CoordinatorError> {
        self.board
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .ok_or(CoordinatorError::JobNotFound(job_id))
    }

    /// Cooperative cancel. Pending and retrying tasks are cancelled; a running
    /// attempt finishes but its result moves nothing. No-op on terminal jobs.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, CoordinatorError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(CoordinatorError::JobNotFound(job_id))?;
        if job.state.is_terminal() {
            drop(guard);
            return self.status(job_id);
        }

        let now = self.clock.now();
        let detail = format!("cancelled by request while {}", job.state);
        job.cancel(detail, now)?;

        let mut changes = ChangeSet::default().job(&job);
        for mut task in state.tasks_of(&job) {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
                task.mark_cancelled(now);
                changes = changes.task(&task);
            }
        }
        self.persist(state, changes).await?;
        drop(guard);
        self.notify.notify_waiters();

        info!(%job_id, "job cancelled");
        self.status(job_id)
    }

    /// Aggregated output of a DONE job.
    pub async fn result(&self, job_id: JobId) -> Result<JobOutput, CoordinatorError> {
        let (job, tasks) = self.records(job_id).await?;
        if job.state != JobState::Done {
            let status = job_status(&job, &tasks);
            return Err(CoordinatorError::NotFinished {
                job_id,
                state: job.state,
                detail: status.detail,
            });
        }
        Ok(self.aggregator.assemble(&job, &tasks).await?)
    }

    pub async fn counts(&self) -> PipelineCounts {
        self.state.lock().await.counts()
    }

    /// Waits until the job's status satisfies `done`.
    pub async fn wait_until(
        &self,
        job_id: JobId,
        timeout: Duration,
        done: impl Fn(&JobStatus) -> bool,
    ) -> Result<JobStatus, CoordinatorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.board_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let status = self.status(job_id)?;
            if done(&status) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(CoordinatorError::WaitTimeout(job_id));
            }
            tokio::select! {
                _ = &mut changed => {},
                _ = tokio::time::sleep_until(deadline) => {},
            }
        }
    }

    pub async fn wait_for_terminal(&self, job_id: JobId, timeout: Duration) -> Result<JobStatus, CoordinatorError> {
        self.wait_until(job_id, timeout, |s| s.state.is_terminal()).await
    }

    // ========================================
    // Worker side
    // ========================================

    /// Waits for a ready task whose stage has a free slot and marks it running.
    pub async fn lease(&self) -> StageLease {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                match self.try_lease(&mut state).await {
                    Ok(Some(lease)) => return lease,
                    Ok(None) => state.scheduled.peek().map(|entry| entry.run_at),
                    Err(err) => {
                        error!(error = %err, "cannot start stage attempt");
                        Some(Instant::now() + STORE_BACKOFF)
                    }
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Runs a leased attempt through its stage worker and reports the outcome.
    pub async fn run_lease(&self, lease: StageLease) {
        let outcome = match self.execute(&lease).await {
            Ok(output) => self.succeed(&lease, output).await,
            Err(err) => self.fail(&lease, err).await,
        };
        if let Err(err) = outcome {
            error!(job_id = %lease.job_id, task_id = %lease.task_id, stage = %lease.stage, error = %err, "cannot record stage outcome");
        }
    }

    async fn execute(&self, lease: &StageLease) -> Result<StageOutput, StageError> {
        let worker = self
            .registry
            .get(lease.stage)
            .ok_or_else(|| StageError::Configuration(format!("no worker registered for {}", lease.stage)))?;
        let input = self
            .artifacts
            .get(&lease.input)
            .await
            .map_err(|e| StageError::Storage(e.to_string()))?
            .ok_or_else(|| StageError::Integrity(format!("input artifact {} is missing", lease.input.short())))?;
        worker.execute(&input).await
    }

    /// Records a successful attempt and queues the next stage (or finishes the job).
    pub async fn succeed(&self, lease: &StageLease, output: StageOutput) -> Result<(), CoordinatorError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.release_slot(lease.stage);
        let result = self.succeed_locked(state, lease, output).await;
        drop(guard);
        self.notify.notify_waiters();
        result
    }

    /// Records a failed attempt; the decider picks retry or fail.
    pub async fn fail(&self, lease: &StageLease, error: StageError) -> Result<(), CoordinatorError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.release_slot(lease.stage);
        let result = match snapshot(state, lease) {
            Ok((job, task)) => self.fail_locked(state, job, task, error).await,
            Err(err) => Err(err),
        };
        drop(guard);
        self.notify.notify_waiters();
        result
    }

    /// Archives terminal jobs older than the retention window.
    pub async fn archive_expired(&self) -> Result<Vec<JobId>, CoordinatorError> {
        let cutoff = self.clock.now() - chrono::Duration::seconds(self.config.retention_secs as i64);
        let mut state = self.state.lock().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.finished_at.is_some_and(|at| at <= cutoff))
            .map(|job| job.job_id)
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        self.state_store.archive_jobs(&expired).await?;
        {
            let mut board = self.board.write().unwrap_or_else(PoisonError::into_inner);
            for job_id in &expired {
                if let Some(job) = state.jobs.remove(job_id) {
                    for task_id in &job.task_ids {
                        state.tasks.remove(task_id);
                    }
                }
                board.remove(job_id);
            }
        }
        info!(archived = expired.len(), "expired jobs archived");
        Ok(expired)
    }

    // ========================================
    // Internals (scheduler lock held)
    // ========================================

    async fn try_lease(&self, state: &mut SchedulerState) -> Result<Option<StageLease>, CoordinatorError> {
        let now = self.clock.now();
        state.promote_due(Instant::now());
        let Some(task_id) = state.pop_ready(&self.config.stages) else {
            return Ok(None);
        };
        let Some(mut task) = state.tasks.get(&task_id).cloned() else {
            return Ok(None);
        };
        let Some(mut job) = state.jobs.get(&task.job_id).cloned() else {
            return Ok(None);
        };

        task.start_attempt(now);
        let running = JobState::running(task.stage);
        if job.state != running {
            job.transition(running, now)?;
        }
        job.current_task = Some(task_id);

        if let Err(err) = self
            .persist(state, ChangeSet::default().job(&job).task(&task))
            .await
        {
            state.ready.push_front(task_id);
            return Err(err);
        }
        state.occupy_slot(task.stage);

        info!(job_id = %job.job_id, %task_id, stage = %task.stage, attempt = task.attempts, max_attempts = task.max_attempts, "stage attempt started");
        Ok(Some(StageLease {
            task_id,
            job_id: job.job_id,
            stage: task.stage,
            attempt: task.attempts,
            input: task.input,
        }))
    }

    async fn succeed_locked(
        &self,
        state: &mut SchedulerState,
        lease: &StageLease,
        output: StageOutput,
    ) -> Result<(), CoordinatorError> {
        let (mut job, mut task) = snapshot(state, lease)?;
        let final_stage = job.request.final_stage();
        let next = task.stage.next().filter(|_| task.stage < final_stage);

        if !job.state.is_terminal()
            && let Some(next) = next
            && let Err(err) = output.artifact.content.check_ready_for(next)
        {
            warn!(job_id = %job.job_id, stage = %task.stage, error = %err, "stage output failed the integrity gate");
            return self.fail_locked(state, job, task, err).await;
        }

        let now = self.clock.now();
        let fingerprint = output.artifact.fingerprint.clone();
        task.mark_succeeded(fingerprint.clone(), output.cache_hit, now);

        if job.state.is_terminal() {
            // cancel 後に終わった試行: 結果は記録するが遷移はしない
            info!(job_id = %job.job_id, stage = %task.stage, state = %job.state, "attempt finished after the job ended");
            return self.persist(state, ChangeSet::default().task(&task)).await;
        }

        match next {
            None => {
                job.complete(fingerprint, now)?;
                self.persist(state, ChangeSet::default().job(&job).task(&task))
                    .await?;
                info!(job_id = %job.job_id, stage = %task.stage, cache_hit = output.cache_hit, "job done");
            }
            Some(next) => {
                // 後続タスクの作成時刻は前段の完了時刻より必ず後
                let created_at = now + chrono::Duration::microseconds(1);
                let successor = self.new_task(&job, next, fingerprint, created_at);
                job.add_task(successor.task_id, created_at);
                job.transition(JobState::running(next), created_at)?;
                self.persist(
                    state,
                    ChangeSet::default().job(&job).task(&task).task(&successor),
                )
                .await?;
                state.ready.push_back(successor.task_id);
                info!(job_id = %job.job_id, stage = %task.stage, cache_hit = output.cache_hit, next = %next, "stage succeeded");
            }
        }
        Ok(())
    }

    async fn fail_locked(
        &self,
        state: &mut SchedulerState,
        mut job: JobRecord,
        mut task: StageTaskRecord,
        error: StageError,
    ) -> Result<(), CoordinatorError> {
        let now = self.clock.now();
        if job.state.is_terminal() {
            task.mark_failed(error, now);
            return self.persist(state, ChangeSet::default().task(&task)).await;
        }

        let trigger = serde_json::json!({
            "error": error,
            "attempts": task.attempts,
            "max_attempts": task.max_attempts,
        });

        match self.decider.decide(&task, &error) {
            Decision::Retry { delay, reason } => {
                let next_run_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                task.decisions.push(DecisionRecord::new(
                    task.task_id,
                    trigger,
                    RETRY_POLICY,
                    "schedule_retry",
                    Some(serde_json::json!({
                        "reason": reason,
                        "delay_ms": delay.as_millis() as u64,
                        "next_run_at": next_run_at,
                    })),
                    now,
                ));
                task.schedule_retry(next_run_at, error.clone(), now);
                job.transition(JobState::RetryWait { stage: task.stage }, now)?;
                self.persist(state, ChangeSet::default().job(&job).task(&task))
                    .await?;
                state.scheduled.push(ScheduledTask {
                    run_at: Instant::now() + delay,
                    task_id: task.task_id,
                });
                warn!(job_id = %job.job_id, stage = %task.stage, attempt = task.attempts, ?delay, error = %error, "stage attempt failed, retry scheduled");
            }
            Decision::Fail { reason } => {
                task.decisions.push(DecisionRecord::new(
                    task.task_id,
                    trigger,
                    RETRY_POLICY,
                    "fail",
                    Some(serde_json::json!({ "reason": reason })),
                    now,
                ));
                task.mark_failed(error.clone(), now);
                let failure = FailureReason {
                    stage: task.stage,
                    kind: error.kind(),
                    message: format!(
                        "{} failed after {} attempt(s): {error}",
                        task.stage, task.attempts
                    ),
                    error,
                    attempts: task.attempts,
                };
                job.fail(failure, now)?;
                self.persist(state, ChangeSet::default().job(&job).task(&task))
                    .await?;
                warn!(job_id = %job.job_id, stage = %task.stage, attempts = task.attempts, %reason, "job failed");
            }
        }
        Ok(())
    }

    /// Commits the change set, then installs it in memory and refreshes the board.
    async fn persist(&self, state: &mut SchedulerState, changes: ChangeSet) -> Result<(), CoordinatorError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.state_store.commit(changes.clone()).await?;

        let mut touched: Vec<JobId> = changes
            .jobs
            .iter()
            .map(|j| j.job_id)
            .chain(changes.tasks.iter().map(|t| t.job_id))
            .collect();
        touched.sort();
        touched.dedup();

        for job in changes.jobs {
            state.jobs.insert(job.job_id, job);
        }
        for task in changes.tasks {
            state.tasks.insert(task.task_id, task);
        }
        for job_id in touched {
            self.refresh_status(state, job_id);
        }
        Ok(())
    }

    fn refresh_status(&self, state: &SchedulerState, job_id: JobId) {
        let Some(job) = state.jobs.get(&job_id) else {
            return;
        };
        let status = job_status(job, &state.tasks_of(job));
        debug!(%job_id, state = %status.state, "status updated");
        self.board
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, status);
        self.board_changed.notify_waiters();
    }

    fn new_task(
        &self,
        job: &JobRecord,
        stage: StageKind,
        input: Fingerprint,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StageTaskRecord {
        let key = self.key_for(stage, &input);
        StageTaskRecord::new(
            self.ids.generate_task_id(),
            job.job_id,
            stage,
            input,
            key,
            self.config.stages.get(stage).max_attempts,
            now,
        )
    }

    fn key_for(&self, stage: StageKind, input: &Fingerprint) -> IdempotencyKey {
        match self.registry.get(stage) {
            Some(worker) => worker.key_for(input),
            None => IdempotencyKey::derive(stage, &self.config.config_version, input),
        }
    }

    async fn records(&self, job_id: JobId) -> Result<(JobRecord, Vec<StageTaskRecord>), CoordinatorError> {
        {
            let state = self.state.lock().await;
            if let Some(job) = state.jobs.get(&job_id) {
                return Ok((job.clone(), state.tasks_of(job)));
            }
        }
        // archived jobs stay readable from the store
        self.state_store
            .load_job(job_id)
            .await?
            .ok_or(CoordinatorError::JobNotFound(job_id))
    }

    /// Reloads non-archived jobs. Running tasks were interrupted and go back
    /// to pending; retrying tasks keep their `next_run_at`.
    async fn recover(&self) -> Result<(), CoordinatorError> {
        let (jobs, tasks) = self.state_store.load_active().await?;
        if jobs.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        for job in jobs {
            state.jobs.insert(job.job_id, job);
        }

        let mut changes = ChangeSet::default();
        let mut pending = Vec::new();
        let mut exhausted = Vec::new();
        for mut task in tasks {
            let job_terminal = state
                .jobs
                .get(&task.job_id)
                .is_none_or(|job| job.state.is_terminal());
            match task.status {
                TaskStatus::Running if job_terminal => {
                    task.mark_cancelled(now);
                    changes.tasks.push(task.clone());
                }
                // the lost attempt used up the last one; fail through the decider
                TaskStatus::Running if task.attempts >= task.max_attempts => exhausted.push(task.task_id),
                TaskStatus::Running => {
                    task.interrupt(now);
                    changes.tasks.push(task.clone());
                    pending.push((task.created_at, task.task_id));
                }
                TaskStatus::Pending if !job_terminal => pending.push((task.created_at, task.task_id)),
                TaskStatus::Retrying if !job_terminal => {
                    let remaining = task
                        .next_run_at
                        .and_then(|at| (at - now).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    state.scheduled.push(ScheduledTask {
                        run_at: Instant::now() + remaining,
                        task_id: task.task_id,
                    });
                }
                _ => {}
            }
            state.tasks.insert(task.task_id, task);
        }

        pending.sort();
        state.ready.extend(pending.into_iter().map(|(_, id)| id));
        let job_ids: Vec<JobId> = state.jobs.keys().copied().collect();
        for job_id in &job_ids {
            self.refresh_status(state, *job_id);
        }
        let interrupted = changes.tasks.len();
        self.persist(state, changes).await?;

        for task_id in &exhausted {
            let Some(task) = state.tasks.get(task_id).cloned() else {
                continue;
            };
            let Some(job) = state.jobs.get(&task.job_id).cloned() else {
                continue;
            };
            let error = StageError::Transient(format!("attempt {} interrupted by restart", task.attempts));
            self.fail_locked(state, job, task, error).await?;
        }

        info!(
            jobs = job_ids.len(),
            ready = state.ready.len(),
            scheduled = state.scheduled.len(),
            interrupted,
            exhausted = exhausted.len(),
            "coordinator state recovered"
        );
        Ok(())
    }
}

fn snapshot(state: &SchedulerState, lease: &StageLease) -> Result<(JobRecord, StageTaskRecord), CoordinatorError> {
    let job = state
        .jobs
        .get(&lease.job_id)
        .cloned()
        .ok_or(CoordinatorError::JobNotFound(lease.job_id))?;
    let task = state
        .tasks
        .get(&lease.task_id)
        .cloned()
        .ok_or(CoordinatorError::JobNotFound(lease.job_id))?;
    Ok((job, task))
}
