//! Stage workers.
//!
//! ```text
//! execute(input artifact)
//!   ├─ integrity gate (input kind / non-empty / supported format)
//!   ├─ key = sha256(stage | stage version | input fingerprint)
//!   ├─ Cached(output)  → read artifact, return (engine not called)
//!   └─ Locked(token)   → handler under timeout → put artifact → complete(token)
//!                        (release(token) instead when the handler marks the output uncacheable)
//! ```
//!
//! [`StageHandler`] は stage ごとの処理本体。冪等性・タイムアウト・保存は
//! [`StageWorker`] が共通で面倒を見る。

mod analyze;
mod ingest;
mod registry;
mod transcribe;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::StageSettings;
use crate::domain::{
    Artifact, ArtifactContent, ArtifactKind, Fingerprint, IdempotencyKey, StageError, StageKind,
};
use crate::idempotency::{Acquired, IdempotencyError, IdempotencyStore};
use crate::ports::{ArtifactStore, Clock};

pub use analyze::AnalyzeHandler;
pub use ingest::IngestHandler;
pub use registry::{RegistryError, StageRegistry};
pub use transcribe::TranscribeHandler;

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Version material of the engine behind this stage (model name, engine
    /// configuration hash). Part of the idempotency key.
    fn version_tag(&self) -> String {
        String::new()
    }

    /// Whether `output` may be served to later executions with the same key.
    fn cacheable(&self, _output: &ArtifactContent) -> bool {
        true
    }

    /// Must not mutate anything reachable from `input`.
    async fn run(&self, input: &ArtifactContent) -> Result<ArtifactContent, StageError>;
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub artifact: Artifact,
    /// Served from the idempotency cache; the handler was not called.
    pub cache_hit: bool,
    pub key: IdempotencyKey,
}

pub struct StageWorker {
    handler: Arc<dyn StageHandler>,
    idempotency: Arc<IdempotencyStore>,
    artifacts: Arc<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    stage_version: String,
}

impl StageWorker {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        settings: &StageSettings,
        config_version: &str,
        idempotency: Arc<IdempotencyStore>,
        artifacts: Arc<dyn ArtifactStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tag = handler.version_tag();
        let stage_version = if tag.is_empty() {
            config_version.to_string()
        } else {
            format!("{config_version}/{tag}")
        };
        Self {
            handler,
            idempotency,
            artifacts,
            clock,
            timeout: Duration::from_millis(settings.timeout_ms),
            stage_version,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.handler.kind()
    }

    /// Configuration version this worker keys its results under.
    pub fn stage_version(&self) -> &str {
        &self.stage_version
    }

    pub fn key_for(&self, input: &Fingerprint) -> IdempotencyKey {
        IdempotencyKey::derive(self.kind(), &self.stage_version, input)
    }

    pub async fn execute(&self, input: &Artifact) -> Result<StageOutput, StageError> {
        let stage = self.kind();
        input.content.check_ready_for(stage)?;
        let key = self.key_for(&input.fingerprint);

        let token = loop {
            match self.idempotency.acquire_or_get(&key, stage).await? {
                Acquired::Locked(token) => break token,
                Acquired::Cached(output) => {
                    let cached = self
                        .artifacts
                        .get(&output)
                        .await
                        .map_err(|e| StageError::Storage(e.to_string()))?;
                    match cached {
                        Some(artifact) => {
                            debug!(%stage, key = key.short(), output = output.short(), "idempotency cache hit");
                            return Ok(StageOutput {
                                artifact,
                                cache_hit: true,
                                key,
                            });
                        }
                        None => {
                            warn!(%stage, key = key.short(), output = output.short(), "cached artifact is missing, recomputing");
                            self.idempotency.forget(&key).await?;
                        }
                    }
                }
            }
        };

        match self.compute(input).await {
            Ok(artifact) if !self.handler.cacheable(&artifact.content) => {
                if let Err(release) = self.idempotency.release(token).await {
                    debug!(%stage, key = key.short(), error = %release, "lock already gone");
                }
                info!(%stage, key = key.short(), output = artifact.fingerprint.short(), "stage output stored, not cached");
                Ok(StageOutput {
                    artifact,
                    cache_hit: false,
                    key,
                })
            }
            Ok(artifact) => {
                match self.idempotency.complete(token, artifact.fingerprint.clone()).await {
                    Ok(()) => {}
                    Err(IdempotencyError::StaleToken(_)) => {
                        warn!(%stage, key = key.short(), "lease expired before completion; result is still valid")
                    }
                    Err(err) => warn!(%stage, key = key.short(), error = %err, "cannot persist idempotency record"),
                }
                info!(%stage, key = key.short(), output = artifact.fingerprint.short(), "stage output stored");
                Ok(StageOutput {
                    artifact,
                    cache_hit: false,
                    key,
                })
            }
            Err(err) => {
                if let Err(release) = self.idempotency.release(token).await {
                    debug!(%stage, key = key.short(), error = %release, "lock already gone");
                }
                Err(err)
            }
        }
    }

    async fn compute(&self, input: &Artifact) -> Result<Artifact, StageError> {
        let stage = self.kind();
        let content = tokio::time::timeout(self.timeout, self.handler.run(&input.content))
            .await
            .map_err(|_| StageError::Timeout(self.timeout.as_millis() as u64))??;

        let expected = ArtifactKind::output_of(stage);
        if content.kind() != expected {
            return Err(StageError::Integrity(format!(
                "{stage} produced {} instead of {}",
                content.kind().as_str(),
                expected.as_str()
            )));
        }

        let artifact = Artifact::new(content, self.clock.now())
            .map_err(|e| StageError::Integrity(format!("cannot fingerprint {stage} output: {e}")))?;
        self.artifacts
            .put(&artifact)
            .await
            .map_err(|e| StageError::Storage(e.to_string()))?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::domain::{MediaFormat, MediaInput, MediaReference, RawMedia, Transcript, TranscriptSegment};
    use crate::idempotency::IdempotencyConfig;
    use crate::ports::SystemClock;
    use crate::store::InMemoryStore;

    /// Turns any media request into the same raw media, counting calls.
    struct EchoHandler {
        calls: AtomicUsize,
        delay: Duration,
        output_kind_ok: bool,
    }

    impl EchoHandler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                output_kind_ok: true,
            }
        }
    }

    #[async_trait]
    impl StageHandler for EchoHandler {
        fn kind(&self) -> StageKind {
            StageKind::Ingest
        }

        fn version_tag(&self) -> String {
            "echo/1".to_string()
        }

        async fn run(&self, input: &ArtifactContent) -> Result<ArtifactContent, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if !self.output_kind_ok {
                return Ok(input.clone());
            }
            Ok(ArtifactContent::RawMedia(RawMedia {
                reference: MediaReference::parse("clips/echo.wav").unwrap(),
                title: None,
                content_hash: Fingerprint::of_bytes(b"echo"),
                format: MediaFormat::Wav,
                size_bytes: 4,
                location: "clips/echo.wav".into(),
                duration_secs: None,
            }))
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        idempotency: Arc<IdempotencyStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let idempotency = Arc::new(IdempotencyStore::new(
                IdempotencyConfig::default(),
                store.clone(),
                Arc::new(SystemClock),
            ));
            Self { store, idempotency }
        }

        fn worker(&self, handler: Arc<dyn StageHandler>, timeout_ms: u64) -> StageWorker {
            StageWorker::new(
                handler,
                &StageSettings {
                    timeout_ms,
                    ..StageSettings::default()
                },
                "v1",
                self.idempotency.clone(),
                self.store.clone(),
                Arc::new(SystemClock),
            )
        }
    }

    fn request(name: &str) -> Artifact {
        Artifact::new(
            ArtifactContent::MediaRequest(MediaInput::Subject { name: name.into() }),
            chrono::Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn second_execution_is_served_from_cache() {
        let fixture = Fixture::new();
        let handler = Arc::new(EchoHandler::new());
        let worker = fixture.worker(handler.clone(), 1_000);
        let input = request("senator");

        let first = worker.execute(&input).await.unwrap();
        let second = worker.execute(&input).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.artifact.fingerprint, second.artifact.fingerprint);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_cached_artifact_is_recomputed() {
        let fixture = Fixture::new();
        let handler = Arc::new(EchoHandler::new());
        let worker = fixture.worker(handler.clone(), 1_000);
        let input = request("mayor");

        let first = worker.execute(&input).await.unwrap();
        fixture.store.remove_artifact(&first.artifact.fingerprint);

        let second = worker.execute(&input).await.unwrap();
        assert!(!second.cache_hit);
        assert_eq!(second.artifact.fingerprint, first.artifact.fingerprint);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        // stored again and cached under the same key
        let third = worker.execute(&input).await.unwrap();
        assert!(third.cache_hit);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_executions_share_one_engine_call() {
        let fixture = Fixture::new();
        let handler = Arc::new(EchoHandler {
            delay: Duration::from_millis(50),
            ..EchoHandler::new()
        });
        let worker = Arc::new(fixture.worker(handler.clone(), 1_000));
        let input = request("governor");

        let (a, b) = tokio::join!(worker.execute(&input), worker.execute(&input));

        assert_eq!(a.unwrap().artifact.fingerprint, b.unwrap().artifact.fingerprint);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn key_depends_on_input_and_version_not_on_job() {
        let fixture = Fixture::new();
        let worker = fixture.worker(Arc::new(EchoHandler::new()), 1_000);
        assert_eq!(worker.stage_version(), "v1/echo/1");

        let a = request("a").fingerprint;
        let b = request("b").fingerprint;
        assert_eq!(worker.key_for(&a), worker.key_for(&a));
        assert_ne!(worker.key_for(&a), worker.key_for(&b));
        assert_ne!(
            worker.key_for(&a),
            IdempotencyKey::derive(StageKind::Ingest, "v2/echo/1", &a)
        );
    }

    #[tokio::test]
    async fn timeout_is_transient_and_releases_the_lock() {
        let fixture = Fixture::new();
        let handler = Arc::new(EchoHandler {
            delay: Duration::from_millis(200),
            ..EchoHandler::new()
        });
        let worker = fixture.worker(handler.clone(), 10);
        let input = request("slow");

        let err = worker.execute(&input).await.unwrap_err();
        assert_eq!(err, StageError::Timeout(10));
        assert!(err.is_transient());

        // the lock is free again: a retry runs the handler instead of waiting
        let _ = worker.execute(&input).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wrong_input_kind_fails_the_integrity_gate() {
        let fixture = Fixture::new();
        let handler = Arc::new(EchoHandler::new());
        let worker = fixture.worker(handler.clone(), 1_000);
        let transcript = Artifact::new(
            ArtifactContent::Transcript(Transcript::new("t", vec![TranscriptSegment::new(0.0, 1.0, "x")])),
            chrono::Utc::now(),
        )
        .unwrap();

        let err = worker.execute(&transcript).await.unwrap_err();
        assert!(matches!(err, StageError::Integrity(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_output_kind_is_rejected() {
        let fixture = Fixture::new();
        let worker = fixture.worker(
            Arc::new(EchoHandler {
                output_kind_ok: false,
                ..EchoHandler::new()
            }),
            1_000,
        );
        let err = worker.execute(&request("x")).await.unwrap_err();
        assert!(matches!(err, StageError::Integrity(_)));
    }
}
