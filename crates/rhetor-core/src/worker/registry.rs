//! StageRegistry - exactly one worker per stage kind.

use std::collections::HashMap;
use std::sync::Arc;

use super::StageWorker;
use crate::domain::StageKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a worker for stage '{0}' is already registered")]
    AlreadyRegistered(StageKind),
}

#[derive(Default)]
pub struct StageRegistry {
    workers: HashMap<StageKind, Arc<StageWorker>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: StageWorker) -> Result<(), RegistryError> {
        let kind = worker.kind();
        if self.workers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.workers.insert(kind, Arc::new(worker));
        Ok(())
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<StageWorker>> {
        self.workers.get(&kind).cloned()
    }

    /// Stage kinds without a worker, in pipeline order.
    pub fn missing(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| !self.workers.contains_key(kind))
            .collect()
    }

    pub fn registered_stages(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| self.workers.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageSettings;
    use crate::idempotency::{IdempotencyConfig, IdempotencyStore};
    use crate::ports::SystemClock;
    use crate::store::InMemoryStore;
    use crate::testing::{FakeMediaSource, FakeTranscriber};
    use crate::worker::{IngestHandler, StageHandler, TranscribeHandler};

    fn worker(handler: Arc<dyn StageHandler>) -> StageWorker {
        let store = Arc::new(InMemoryStore::new());
        let idempotency = Arc::new(IdempotencyStore::new(
            IdempotencyConfig::default(),
            store.clone(),
            Arc::new(SystemClock),
        ));
        StageWorker::new(
            handler,
            &StageSettings::default(),
            "v1",
            idempotency,
            store,
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn register_and_report_missing_stages() {
        let mut registry = StageRegistry::new();
        registry
            .register(worker(Arc::new(IngestHandler::new(Arc::new(FakeMediaSource::new())))))
            .unwrap();
        registry
            .register(worker(Arc::new(TranscribeHandler::new(Arc::new(FakeTranscriber::new("x"))))))
            .unwrap();

        assert!(registry.get(StageKind::Ingest).is_some());
        assert!(registry.get(StageKind::Analyze).is_none());
        assert_eq!(registry.missing(), vec![StageKind::Analyze]);
        assert_eq!(
            registry.registered_stages(),
            vec![StageKind::Ingest, StageKind::Transcribe]
        );
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = StageRegistry::new();
        let source = Arc::new(FakeMediaSource::new());
        registry
            .register(worker(Arc::new(IngestHandler::new(source.clone()))))
            .unwrap();
        let result = registry.register(worker(Arc::new(IngestHandler::new(source))));
        assert_eq!(result, Err(RegistryError::AlreadyRegistered(StageKind::Ingest)));
    }
}
