//! Analyze: transcript → analysis report (runs the pattern engine).

use std::sync::Arc;

use async_trait::async_trait;

use super::StageHandler;
use crate::domain::{ArtifactContent, StageError, StageKind};
use crate::engine::PatternEngine;

pub struct AnalyzeHandler {
    engine: Arc<PatternEngine>,
}

impl AnalyzeHandler {
    pub fn new(engine: Arc<PatternEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StageHandler for AnalyzeHandler {
    fn kind(&self) -> StageKind {
        StageKind::Analyze
    }

    /// Engine version plus a hash of its configuration, so a rule or threshold
    /// change never serves a stale analysis.
    fn version_tag(&self) -> String {
        self.engine.version_tag().to_string()
    }

    /// A report from a degraded engine (index down, explainer failing) is
    /// recomputed next time.
    fn cacheable(&self, output: &ArtifactContent) -> bool {
        output
            .as_analysis()
            .is_none_or(|report| report.partial_failures.is_empty())
    }

    async fn run(&self, input: &ArtifactContent) -> Result<ArtifactContent, StageError> {
        let transcript = input.as_transcript().ok_or_else(|| {
            StageError::MalformedInput(format!(
                "analyze expects a transcript, got {}",
                input.kind().as_str()
            ))
        })?;
        let report = self.engine.analyze(transcript).await?;
        Ok(ArtifactContent::Analysis(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageSettings;
    use crate::domain::{Artifact, Transcript, TranscriptSegment};
    use crate::engine::{EngineConfig, HashingEmbedder};
    use crate::idempotency::{IdempotencyConfig, IdempotencyStore};
    use crate::ports::SystemClock;
    use crate::store::InMemoryStore;
    use crate::testing::ToggleIndex;
    use crate::worker::StageWorker;

    #[tokio::test]
    async fn broken_rules_fail_permanently() {
        let mut config = EngineConfig::default();
        config.rules[0].confidence = 0.0;
        let handler = AnalyzeHandler::new(Arc::new(PatternEngine::new(
            config,
            Arc::new(HashingEmbedder::new(64)),
        )));

        let input = ArtifactContent::Transcript(Transcript::new(
            "t",
            vec![TranscriptSegment::new(0.0, 1.0, "He is a liar.")],
        ));
        let err = handler.run(&input).await.unwrap_err();
        assert!(matches!(err, StageError::Configuration(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn version_tag_follows_engine_configuration() {
        let embedder = Arc::new(HashingEmbedder::new(64));
        let a = AnalyzeHandler::new(Arc::new(PatternEngine::new(EngineConfig::default(), embedder.clone())));
        let mut changed = EngineConfig::default();
        changed.scoring.min_confidence = 0.25;
        let b = AnalyzeHandler::new(Arc::new(PatternEngine::new(changed, embedder)));

        assert!(a.version_tag().starts_with("rhetor-engine/1#"));
        assert_ne!(a.version_tag(), b.version_tag());
    }

    #[tokio::test]
    async fn degraded_analysis_is_recomputed_once_the_index_is_back() {
        let store = Arc::new(InMemoryStore::new());
        let idempotency = Arc::new(IdempotencyStore::new(
            IdempotencyConfig::default(),
            store.clone(),
            Arc::new(SystemClock),
        ));
        let index = Arc::new(ToggleIndex::down());
        let engine = PatternEngine::new(EngineConfig::default(), Arc::new(HashingEmbedder::new(64)))
            .with_index(index.clone());
        let worker = StageWorker::new(
            Arc::new(AnalyzeHandler::new(Arc::new(engine))),
            &StageSettings::default(),
            "v1",
            idempotency,
            store.clone(),
            Arc::new(SystemClock),
        );
        let input = Artifact::new(
            ArtifactContent::Transcript(Transcript::new(
                "t",
                vec![TranscriptSegment::new(0.0, 4.0, "My opponent is clearly a liar and a fool.")],
            )),
            chrono::Utc::now(),
        )
        .unwrap();

        let degraded = worker.execute(&input).await.unwrap();
        assert!(!degraded.cache_hit);
        assert_eq!(degraded.artifact.content.as_analysis().unwrap().partial_failures.len(), 1);

        index.recover();
        let full = worker.execute(&input).await.unwrap();
        assert!(!full.cache_hit);
        assert!(full.artifact.content.as_analysis().unwrap().partial_failures.is_empty());

        // a complete report is cached as usual
        let again = worker.execute(&input).await.unwrap();
        assert!(again.cache_hit);
        assert_eq!(again.artifact.fingerprint, full.artifact.fingerprint);
    }
}
