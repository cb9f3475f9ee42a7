//! Domain model (IDs, requests, artifacts, records, states, decisions).

pub mod artifact;
pub mod decision;
pub mod errors;
pub mod fingerprint;
pub mod ids;
pub mod job;
pub mod pattern;
pub mod request;
pub mod stage;
pub mod state;
pub mod task;
pub mod transcript;

pub use artifact::{Artifact, ArtifactContent, ArtifactKind, MediaFormat, RawMedia};
pub use decision::{Decider, Decision, DecisionRecord, DefaultDecider};
pub use errors::{ErrorKind, StageError};
pub use fingerprint::{Fingerprint, IdempotencyKey};
pub use ids::{JobId, TaskId};
pub use job::{FailureReason, InvalidTransition, JobRecord, JobStatus, Progress};
pub use pattern::{
    AnalysisReport, Disagreement, EngineLayer, MatchSource, PartialFailure, PatternMatch,
    PatternType, Span,
};
pub use request::{JobOptions, JobRequest, MediaInput, MediaReference, RequestError};
pub use stage::StageKind;
pub use state::{JobState, TaskStatus};
pub use task::StageTaskRecord;
pub use transcript::{Transcript, TranscriptSegment};
