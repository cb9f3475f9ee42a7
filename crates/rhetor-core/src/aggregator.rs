//! Result Aggregator: assembles the read API view of a finished job.
//!
//! Pulls the transcript and analysis artifacts a job produced and lays the
//! stage tasks out as provenance (which key, which input/output, cache or not,
//! and every retry decision).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AnalysisReport, ArtifactContent, DecisionRecord, Disagreement, Fingerprint, IdempotencyKey,
    JobId, JobRecord, JobRequest, JobState, PartialFailure, PatternMatch, StageKind,
    StageTaskRecord, TaskId, TaskStatus, Transcript,
};
use crate::ports::{ArtifactStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("artifact {0} is missing")]
    MissingArtifact(Fingerprint),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Active (unsuppressed) matches.
    pub total: usize,
    pub suppressed: usize,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProvenance {
    pub stage: StageKind,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub idempotency_key: IdempotencyKey,
    pub input: Fingerprint,
    pub output: Option<Fingerprint>,
    pub cache_hit: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub decisions: Vec<DecisionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub config_version: String,
    pub engine_version: Option<String>,
    /// Engine/model that produced the transcript.
    pub transcriber: Option<String>,
    pub stages: Vec<StageProvenance>,
    pub partial_failures: Vec<PartialFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub job_id: JobId,
    pub request: JobRequest,
    pub state: JobState,
    pub transcript: Option<Transcript>,
    pub pattern_matches: Vec<PatternMatch>,
    pub disagreements: Vec<Disagreement>,
    pub summary: Summary,
    pub provenance: Provenance,
}

pub struct ResultAggregator {
    artifacts: Arc<dyn ArtifactStore>,
    config_version: String,
}

impl ResultAggregator {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, config_version: impl Into<String>) -> Self {
        Self {
            artifacts,
            config_version: config_version.into(),
        }
    }

    pub async fn assemble(
        &self,
        job: &JobRecord,
        tasks: &[StageTaskRecord],
    ) -> Result<JobOutput, AggregateError> {
        let mut stages: Vec<&StageTaskRecord> = tasks.iter().filter(|t| t.job_id == job.job_id).collect();
        stages.sort_by_key(|t| t.stage);

        let mut transcript = None;
        let mut report: Option<AnalysisReport> = None;
        for task in &stages {
            let Some(output) = &task.output else {
                continue;
            };
            let artifact = self
                .artifacts
                .get(output)
                .await?
                .ok_or_else(|| AggregateError::MissingArtifact(output.clone()))?;
            match artifact.content {
                ArtifactContent::Transcript(t) => transcript = Some(t),
                ArtifactContent::Analysis(r) => report = Some(r),
                ArtifactContent::MediaRequest(_) | ArtifactContent::RawMedia(_) => {}
            }
        }

        let (pattern_matches, disagreements, partial_failures, engine_version) = match report {
            Some(report) => {
                // analysis は自分が見た transcript を持っている
                transcript.get_or_insert(report.transcript);
                (
                    report.matches,
                    report.disagreements,
                    report.partial_failures,
                    Some(report.engine_version),
                )
            }
            None => (Vec::new(), Vec::new(), Vec::new(), None),
        };

        Ok(JobOutput {
            job_id: job.job_id,
            request: job.request.clone(),
            state: job.state,
            summary: summarize(&pattern_matches),
            provenance: Provenance {
                config_version: self.config_version.clone(),
                engine_version,
                transcriber: transcript.as_ref().map(|t| t.engine.clone()),
                stages: stages.into_iter().map(stage_provenance).collect(),
                partial_failures,
            },
            transcript,
            pattern_matches,
            disagreements,
        })
    }
}

fn stage_provenance(task: &StageTaskRecord) -> StageProvenance {
    StageProvenance {
        stage: task.stage,
        task_id: task.task_id,
        status: task.status,
        attempts: task.attempts,
        idempotency_key: task.idempotency_key.clone(),
        input: task.input.clone(),
        output: task.output.clone(),
        cache_hit: task.cache_hit,
        started_at: task.started_at,
        finished_at: task.finished_at,
        decisions: task.decisions.clone(),
    }
}

/// Per-type counts over active matches.
pub fn summarize(matches: &[PatternMatch]) -> Summary {
    let mut summary = Summary::default();
    for m in matches {
        if m.suppressed {
            summary.suppressed += 1;
            continue;
        }
        summary.total += 1;
        *summary
            .by_type
            .entry(m.pattern_type.as_str().to_string())
            .or_default() += 1;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Artifact, MatchSource, PatternType, Span, TranscriptSegment};
    use crate::store::InMemoryStore;
    use ulid::Ulid;

    fn pattern_match(slug: &str, start: usize, suppressed: bool) -> PatternMatch {
        let span = Span::new(start, start + 4);
        let pattern_type = PatternType::new(slug);
        PatternMatch {
            match_id: PatternMatch::make_id(span, &pattern_type),
            span,
            text: "liar".into(),
            start_time: 0.0,
            end_time: 1.0,
            pattern_type,
            confidence: 0.7,
            source: MatchSource::Rule,
            rationale: None,
            suppressed,
            suppressed_by: None,
            rule_ids: Vec::new(),
            exemplar_ids: Vec::new(),
            evidence: Vec::new(),
        }
    }

    #[test]
    fn summary_counts_active_matches_by_type() {
        let summary = summarize(&[
            pattern_match("personal_attack", 0, false),
            pattern_match("personal_attack", 10, false),
            pattern_match("hyperbole", 20, false),
            pattern_match("labeling", 0, true),
        ]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.suppressed, 1);
        assert_eq!(summary.by_type.get("personal_attack"), Some(&2));
        assert_eq!(summary.by_type.get("labeling"), None);
    }

    #[tokio::test]
    async fn transcript_only_job_has_no_matches_or_engine_version() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let transcript = Transcript::new("fake", vec![TranscriptSegment::new(0.0, 2.0, "hello")]);
        let artifact = Artifact::new(ArtifactContent::Transcript(transcript.clone()), now).unwrap();
        store.put(&artifact).await.unwrap();

        let mut job = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            JobRequest::subject("x").with_stop_after(StageKind::Transcribe),
            now,
        );
        let input = Fingerprint::of_bytes(b"media");
        let mut task = StageTaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            job.job_id,
            StageKind::Transcribe,
            input.clone(),
            IdempotencyKey::derive(StageKind::Transcribe, "v1", &input),
            3,
            now,
        );
        task.start_attempt(now);
        task.mark_succeeded(artifact.fingerprint.clone(), false, now);
        job.add_task(task.task_id, now);

        let output = ResultAggregator::new(store, "v1")
            .assemble(&job, &[task])
            .await
            .unwrap();
        assert_eq!(output.transcript, Some(transcript));
        assert!(output.pattern_matches.is_empty());
        assert_eq!(output.provenance.engine_version, None);
        assert_eq!(output.provenance.transcriber.as_deref(), Some("fake"));
        assert_eq!(output.provenance.stages.len(), 1);
    }

    #[tokio::test]
    async fn missing_output_artifact_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let job = JobRecord::new(JobId::from_ulid(Ulid::new()), JobRequest::subject("x"), now);
        let input = Fingerprint::of_bytes(b"media");
        let mut task = StageTaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            job.job_id,
            StageKind::Ingest,
            input.clone(),
            IdempotencyKey::derive(StageKind::Ingest, "v1", &input),
            3,
            now,
        );
        task.mark_succeeded(Fingerprint::of_bytes(b"gone"), false, now);

        let err = ResultAggregator::new(store, "v1")
            .assemble(&job, &[task])
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::MissingArtifact(_)));
    }
}
