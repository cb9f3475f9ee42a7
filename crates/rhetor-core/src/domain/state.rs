//! State - ジョブとステージタスクの状態
//!
//! ジョブの状態遷移:
//! ```text
//! QUEUED → INGESTING → TRANSCRIBING → ANALYZING → DONE
//!              ↕              ↕             ↕
//!         RETRY_WAIT     RETRY_WAIT    RETRY_WAIT
//! (non-terminal) → FAILED | CANCELLED
//! ```
//! `stop_after` を指定したジョブは INGESTING / TRANSCRIBING から直接 DONE になれる。

use serde::{Deserialize, Serialize};

use super::stage::StageKind;

/// JobState はジョブの状態を表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Ingesting,
    Transcribing,
    Analyzing,
    /// A stage attempt failed transiently and a retry is scheduled.
    RetryWait { stage: StageKind },
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    /// The "working on it" state for a stage.
    pub fn running(stage: StageKind) -> Self {
        match stage {
            StageKind::Ingest => JobState::Ingesting,
            StageKind::Transcribe => JobState::Transcribing,
            StageKind::Analyze => JobState::Analyzing,
        }
    }

    /// Stage the job is currently in, if any.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            JobState::Ingesting => Some(StageKind::Ingest),
            JobState::Transcribing => Some(StageKind::Transcribe),
            JobState::Analyzing => Some(StageKind::Analyze),
            JobState::RetryWait { stage } => Some(*stage),
            JobState::Queued | JobState::Done | JobState::Failed | JobState::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Ingesting => "INGESTING",
            JobState::Transcribing => "TRANSCRIBING",
            JobState::Analyzing => "ANALYZING",
            JobState::RetryWait { .. } => "RETRY_WAIT",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    /// 遷移表。coordinator はこれ以外の遷移を行わない。
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        match (*self, next) {
            (Queued, Ingesting) => true,
            (Ingesting, Transcribing) | (Transcribing, Analyzing) => true,
            (Ingesting | Transcribing | Analyzing, Done) => true,
            (current, RetryWait { stage }) => current.stage() == Some(stage),
            (RetryWait { stage }, next) => next == JobState::running(stage),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::RetryWait { stage } => write!(f, "RETRY_WAIT({stage})"),
            other => f.write_str(other.label()),
        }
    }
}

/// TaskStatus はステージタスクの状態
///
/// - pending: lease 待ち
/// - running: worker が実行中
/// - retrying: backoff 待ち（`next_run_at` まで）
/// - succeeded / failed / cancelled: 終端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(JobState::Queued, JobState::Ingesting, true)]
    #[case(JobState::Queued, JobState::Transcribing, false)]
    #[case(JobState::Ingesting, JobState::Transcribing, true)]
    #[case(JobState::Ingesting, JobState::Analyzing, false)]
    #[case(JobState::Transcribing, JobState::Analyzing, true)]
    #[case(JobState::Analyzing, JobState::Done, true)]
    #[case(JobState::Ingesting, JobState::Done, true)]
    #[case(JobState::Queued, JobState::Done, false)]
    #[case(JobState::Transcribing, JobState::RetryWait { stage: StageKind::Transcribe }, true)]
    #[case(JobState::Transcribing, JobState::RetryWait { stage: StageKind::Ingest }, false)]
    #[case(JobState::RetryWait { stage: StageKind::Transcribe }, JobState::Transcribing, true)]
    #[case(JobState::RetryWait { stage: StageKind::Transcribe }, JobState::Analyzing, false)]
    #[case(JobState::Analyzing, JobState::Failed, true)]
    #[case(JobState::Queued, JobState::Cancelled, true)]
    #[case(JobState::Done, JobState::Failed, false)]
    #[case(JobState::Cancelled, JobState::Ingesting, false)]
    #[case(JobState::Failed, JobState::Cancelled, false)]
    fn transition_table(#[case] from: JobState, #[case] to: JobState, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
    }

    #[test]
    fn retry_wait_serializes_with_stage() {
        let json = serde_json::to_value(JobState::RetryWait {
            stage: StageKind::Analyze,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"retry_wait": {"stage": "analyze"}}));
        assert_eq!(serde_json::to_value(JobState::Done).unwrap(), "done");
    }
}
