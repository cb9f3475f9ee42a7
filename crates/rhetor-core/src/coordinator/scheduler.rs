//! Scheduler state: the coordinator's in-memory view of jobs and tasks.
//!
//! - `jobs` / `tasks` are the single source of truth (mirrors of the store).
//! - `ready` and `scheduled` hold `TaskId` only; stale entries (cancelled or
//!   already-leased tasks) are dropped lazily when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use tokio::time::Instant;

use crate::config::StagesConfig;
use crate::domain::{JobId, JobRecord, StageKind, StageTaskRecord, TaskId, TaskStatus};
use crate::observability::PipelineCounts;

/// Retry backoff entry. Reverse ordering turns `BinaryHeap` into a min-heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ScheduledTask {
    pub run_at: Instant,
    pub task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // 早い時刻ほど優先
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Default)]
pub(super) struct SchedulerState {
    pub jobs: HashMap<JobId, JobRecord>,
    pub tasks: HashMap<TaskId, StageTaskRecord>,
    pub ready: VecDeque<TaskId>,
    pub scheduled: BinaryHeap<ScheduledTask>,
    /// Leased tasks per stage.
    pub running: HashMap<StageKind, usize>,
}

impl SchedulerState {
    /// Moves retrying tasks whose backoff has elapsed to the ready queue.
    /// They stay `Retrying` (in memory and in the store) until leased.
    pub fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.run_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if self
                .tasks
                .get(&entry.task_id)
                .is_some_and(|task| task.status == TaskStatus::Retrying)
            {
                self.ready.push_back(entry.task_id);
            }
        }
    }

    /// Pops the first ready task whose stage is below its running limit.
    pub fn pop_ready(&mut self, limits: &StagesConfig) -> Option<TaskId> {
        let SchedulerState {
            ready,
            tasks,
            running,
            ..
        } = self;
        ready.retain(|id| {
            tasks
                .get(id)
                .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying))
        });
        let position = ready.iter().position(|id| {
            tasks.get(id).is_some_and(|task| {
                running.get(&task.stage).copied().unwrap_or(0) < limits.get(task.stage).max_running
            })
        })?;
        ready.remove(position)
    }

    pub fn occupy_slot(&mut self, stage: StageKind) {
        *self.running.entry(stage).or_default() += 1;
    }

    pub fn release_slot(&mut self, stage: StageKind) {
        if let Some(count) = self.running.get_mut(&stage) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn tasks_of(&self, job: &JobRecord) -> Vec<StageTaskRecord> {
        job.task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    pub fn counts(&self) -> PipelineCounts {
        let mut counts = PipelineCounts::default();
        for job in self.jobs.values() {
            counts.add_job(job.state);
        }
        for task in self.tasks.values() {
            counts.add_task(task.status);
        }
        counts
    }

    /// Pending + retrying tasks.
    pub fn backlog(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying))
            .count()
    }
}
