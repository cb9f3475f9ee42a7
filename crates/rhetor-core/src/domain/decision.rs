//! Decision model: what happens after a stage attempt fails.
//!
//! Decider は純粋関数（task 状態 + エラー → 次のアクション）。
//! 実際の状態更新（retry のスケジュール、ジョブの FAILED 化）は coordinator が行う。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, StageError};
use super::ids::TaskId;
use super::task::StageTaskRecord;
use crate::coordinator::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Retry the stage after `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up: the job fails.
    Fail { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &StageTaskRecord, error: &StageError) -> Decision;
}

/// Attempt-bounded retries with exponential backoff.
///
/// - permanent error → Fail (no retry, whatever the budget)
/// - attempts >= max_attempts → Fail
/// - otherwise → Retry after `RetryPolicy::next_delay(attempts)`
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &StageTaskRecord, error: &StageError) -> Decision {
        if error.kind() == ErrorKind::Permanent {
            return Decision::Fail {
                reason: format!("permanent {} error: {error}", error.code()),
            };
        }
        if task.attempts >= task.max_attempts {
            return Decision::Fail {
                reason: format!(
                    "max attempts reached: {}/{}",
                    task.attempts, task.max_attempts
                ),
            };
        }
        let delay = self.retry_policy.next_delay(task.attempts);
        Decision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                task.attempts + 1,
                task.max_attempts,
                delay
            ),
        }
    }
}

/// A decision taken for a task, kept for "why did this happen" queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub task_id: TaskId,
    /// What led to the decision (error, attempts, budget).
    pub trigger: serde_json::Value,
    pub policy: String,
    /// `"schedule_retry"` or `"fail"`.
    pub decision: String,
    pub context: Option<serde_json::Value>,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        task_id: TaskId,
        trigger: serde_json::Value,
        policy: impl Into<String>,
        decision: impl Into<String>,
        context: Option<serde_json::Value>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            trigger,
            policy: policy.into(),
            decision: decision.into(),
            context,
            decided_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fingerprint::{Fingerprint, IdempotencyKey};
    use crate::domain::ids::JobId;
    use crate::domain::stage::StageKind;
    use ulid::Ulid;

    fn task(attempts: u32, max_attempts: u32) -> StageTaskRecord {
        let input = Fingerprint::of_bytes(b"in");
        let mut task = StageTaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            JobId::from_ulid(Ulid::new()),
            StageKind::Transcribe,
            input.clone(),
            IdempotencyKey::derive(StageKind::Transcribe, "v1", &input),
            max_attempts,
            Utc::now(),
        );
        task.attempts = attempts;
        task
    }

    fn decider() -> DefaultDecider {
        DefaultDecider::new(RetryPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        })
    }

    #[test]
    fn transient_error_below_budget_retries_with_backoff() {
        let decision = decider().decide(&task(2, 3), &StageError::Transient("503".into()));
        assert_eq!(
            decision,
            Decision::Retry {
                delay: Duration::from_secs(4),
                reason: "retry attempt 3/3 after 4s".into(),
            }
        );
    }

    #[test]
    fn exhausted_budget_fails() {
        let decision = decider().decide(&task(3, 3), &StageError::Timeout(100));
        assert!(matches!(decision, Decision::Fail { reason } if reason == "max attempts reached: 3/3"));
    }

    #[test]
    fn permanent_error_fails_on_first_attempt() {
        let decision = decider().decide(&task(1, 3), &StageError::UnsupportedFormat("xyz".into()));
        assert!(matches!(decision, Decision::Fail { .. }));
    }
}
