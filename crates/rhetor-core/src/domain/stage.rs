//! Stage kinds and their fixed order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the three processing stages every job walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Ingest,
    Transcribe,
    Analyze,
}

impl StageKind {
    /// Pipeline order.
    pub const ALL: [StageKind; 3] = [StageKind::Ingest, StageKind::Transcribe, StageKind::Analyze];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Ingest => "ingest",
            StageKind::Transcribe => "transcribe",
            StageKind::Analyze => "analyze",
        }
    }

    /// The stage that consumes this stage's output, if any.
    pub fn next(&self) -> Option<StageKind> {
        match self {
            StageKind::Ingest => Some(StageKind::Transcribe),
            StageKind::Transcribe => Some(StageKind::Analyze),
            StageKind::Analyze => None,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            StageKind::Ingest => 0,
            StageKind::Transcribe => 1,
            StageKind::Analyze => 2,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for StageKind {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingest" => Ok(StageKind::Ingest),
            "transcribe" => Ok(StageKind::Transcribe),
            "analyze" => Ok(StageKind::Analyze),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}
