//! Errors - エラー型と分類
//!
//! ErrorKind は運用上の分類:
//! - Transient: リトライする
//! - Permanent: 即座に失敗させる
//! - PartialFailure: 劣化したが成功扱い（分析の補助レイヤー）
//! - Capacity: submit を拒否する

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    PartialFailure,
    Capacity,
}

/// Failure of one stage attempt. Stored on the stage task and surfaced by status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum StageError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("stage timed out after {0} ms")]
    Timeout(u64),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Transient(_) | StageError::Timeout(_) | StageError::Storage(_) => {
                ErrorKind::Transient
            }
            StageError::NotFound(_)
            | StageError::UnsupportedFormat(_)
            | StageError::MalformedInput(_)
            | StageError::Configuration(_)
            | StageError::Integrity(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Short machine-readable name, e.g. `"unsupported_format"`.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Transient(_) => "transient",
            StageError::Timeout(_) => "timeout",
            StageError::Storage(_) => "storage",
            StageError::NotFound(_) => "not_found",
            StageError::UnsupportedFormat(_) => "unsupported_format",
            StageError::MalformedInput(_) => "malformed_input",
            StageError::Configuration(_) => "configuration",
            StageError::Integrity(_) => "integrity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StageError::Transient("503".into()), ErrorKind::Transient)]
    #[case(StageError::Timeout(1000), ErrorKind::Transient)]
    #[case(StageError::Storage("disk full".into()), ErrorKind::Transient)]
    #[case(StageError::NotFound("abc".into()), ErrorKind::Permanent)]
    #[case(StageError::UnsupportedFormat("flac".into()), ErrorKind::Permanent)]
    #[case(StageError::Configuration("bad rule".into()), ErrorKind::Permanent)]
    #[case(StageError::Integrity("empty transcript".into()), ErrorKind::Permanent)]
    fn classification(#[case] error: StageError, #[case] kind: ErrorKind) {
        assert_eq!(error.kind(), kind);
    }

    #[test]
    fn stage_error_serializes_tagged() {
        let json = serde_json::to_value(StageError::NotFound("video 42".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "not_found", "message": "video 42"}));
    }
}
