//! CoordinatorBuilder - 配線と起動時検証
//!
//! # Fail-fast
//! - 設定の検証（`PipelineConfig::validate`）
//! - stage kind ごとにちょうど 1 つの handler（不足・重複は BuildError）
//! - 冪等性レコードの再読み込みと、未完了ジョブの復旧

use std::sync::Arc;

use tracing::info;

use super::{Coordinator, CoordinatorError, RetryPolicy};
use crate::config::{ConfigError, PipelineConfig};
use crate::domain::{Decider, DefaultDecider, StageKind};
use crate::engine::PatternEngine;
use crate::idempotency::IdempotencyStore;
use crate::ports::{
    ArtifactStore, Clock, IdGenerator, MediaSource, StateStore, StoreError, SystemClock,
    Transcriber, UlidGenerator,
};
use crate::store::InMemoryStore;
use crate::worker::{
    AnalyzeHandler, IngestHandler, RegistryError, StageHandler, StageRegistry, StageWorker,
    TranscribeHandler,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no handler registered for stages: {0:?}")]
    MissingStages(Vec<StageKind>),

    #[error("more than one handler registered for stage '{0}'")]
    DuplicateStage(StageKind),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot load state: {0}")]
    Store(#[from] StoreError),

    #[error("cannot recover jobs: {0}")]
    Recovery(#[from] CoordinatorError),
}

impl From<RegistryError> for BuildError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered(kind) => BuildError::DuplicateStage(kind),
        }
    }
}

/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new(config)
///     .store(Arc::new(SqliteStore::connect("sqlite://rhetor.db").await?))
///     .standard_stages(media, transcriber, engine)
///     .build()
///     .await?;
/// ```
pub struct CoordinatorBuilder {
    config: PipelineConfig,
    handlers: Vec<Arc<dyn StageHandler>>,
    state_store: Option<Arc<dyn StateStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

impl CoordinatorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            state_store: None,
            artifacts: None,
            clock: None,
            ids: None,
            decider: None,
        }
    }

    /// One backend for both job state and artifacts.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: StateStore + ArtifactStore + 'static,
    {
        self.state_store = Some(store.clone());
        self.artifacts = Some(store);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Replaces the default attempt-bounded backoff decider.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Registers the ingest, transcribe and analyze handlers.
    pub fn standard_stages(
        self,
        media: Arc<dyn MediaSource>,
        transcriber: Arc<dyn Transcriber>,
        engine: Arc<PatternEngine>,
    ) -> Self {
        self.handler(Arc::new(IngestHandler::new(media)))
            .handler(Arc::new(TranscribeHandler::new(transcriber)))
            .handler(Arc::new(AnalyzeHandler::new(engine)))
    }

    pub async fn build(self) -> Result<Arc<Coordinator>, BuildError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (state_store, artifacts) = match (self.state_store, self.artifacts) {
            (Some(state), Some(artifacts)) => (state, artifacts),
            (state, artifacts) => {
                let memory = Arc::new(InMemoryStore::new());
                (
                    state.unwrap_or_else(|| memory.clone()),
                    artifacts.unwrap_or(memory),
                )
            }
        };
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(DefaultDecider::new(RetryPolicy::from_config(&self.config.retry)))
        });

        let idempotency = Arc::new(
            IdempotencyStore::load(self.config.idempotency, state_store.clone(), clock.clone())
                .await?,
        );

        let mut registry = StageRegistry::new();
        for handler in self.handlers {
            let settings = self.config.stages.get(handler.kind());
            registry.register(StageWorker::new(
                handler,
                settings,
                &self.config.config_version,
                idempotency.clone(),
                artifacts.clone(),
                clock.clone(),
            ))?;
        }
        let missing = registry.missing();
        if !missing.is_empty() {
            return Err(BuildError::MissingStages(missing));
        }
        for stage in registry.registered_stages() {
            if let Some(worker) = registry.get(stage) {
                info!(%stage, version = worker.stage_version(), "stage worker ready");
            }
        }

        let coordinator = Coordinator::new(
            self.config,
            registry,
            decider,
            state_store,
            artifacts,
            clock,
            ids,
        );
        coordinator.recover().await?;
        Ok(Arc::new(coordinator))
    }
}
