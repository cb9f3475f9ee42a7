//! Scripted collaborators for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::domain::{
    Fingerprint, MediaFormat, MediaReference, PatternType, RawMedia, Transcript, TranscriptSegment,
};
use crate::ports::{
    Embedding, ExemplarHit, ExplainError, ExplainRequest, Explainer, IndexError, MediaCandidate,
    MediaError, MediaSource, SemanticIndex, TranscribeError, Transcriber,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns the same hits for every query.
pub struct ScriptedIndex {
    hits: Vec<ExemplarHit>,
    calls: AtomicUsize,
}

impl ScriptedIndex {
    pub fn new(hits: Vec<(&str, &str, f64)>) -> Self {
        Self {
            hits: hits
                .into_iter()
                .map(|(id, slug, similarity)| ExemplarHit {
                    exemplar_id: id.to_string(),
                    pattern_type: PatternType::new(slug),
                    similarity,
                })
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticIndex for ScriptedIndex {
    async fn query(&self, _embedding: &Embedding, top_k: usize) -> Result<Vec<ExemplarHit>, IndexError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.iter().take(top_k).cloned().collect())
    }
}

pub struct SlowIndex(pub Duration);

#[async_trait]
impl SemanticIndex for SlowIndex {
    async fn query(&self, _embedding: &Embedding, _top_k: usize) -> Result<Vec<ExemplarHit>, IndexError> {
        tokio::time::sleep(self.0).await;
        Ok(Vec::new())
    }
}

pub struct UnavailableIndex;

#[async_trait]
impl SemanticIndex for UnavailableIndex {
    async fn query(&self, _embedding: &Embedding, _top_k: usize) -> Result<Vec<ExemplarHit>, IndexError> {
        Err(IndexError::Unavailable("connection refused".to_string()))
    }
}

/// Unavailable until [`ToggleIndex::recover`]; then returns no hits.
#[derive(Default)]
pub struct ToggleIndex {
    up: AtomicBool,
}

impl ToggleIndex {
    pub fn down() -> Self {
        Self::default()
    }

    pub fn recover(&self) {
        self.up.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SemanticIndex for ToggleIndex {
    async fn query(&self, _embedding: &Embedding, _top_k: usize) -> Result<Vec<ExemplarHit>, IndexError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(Vec::new())
        } else {
            Err(IndexError::Unavailable("connection refused".to_string()))
        }
    }
}

pub struct ScriptedExplainer {
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedExplainer {
    pub fn always_ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Explainer for ScriptedExplainer {
    async fn explain(&self, request: &ExplainRequest) -> Result<String, ExplainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ExplainError::Transient("rate limited".to_string()));
        }
        Ok(format!(
            "\"{}\" is an instance of {}",
            request.span_text, request.pattern_name
        ))
    }
}

/// Media source backed by a map of references; fetches are counted.
#[derive(Default)]
pub struct FakeMediaSource {
    media: HashMap<String, RawMedia>,
    candidates: Vec<MediaCandidate>,
    failures: Mutex<VecDeque<MediaError>>,
    fetches: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `reference` (parsed like a job request) with content `bytes`.
    pub fn with_media(mut self, reference: &str, bytes: &[u8]) -> Self {
        let reference = MediaReference::parse(reference).unwrap();
        let media = RawMedia {
            reference: reference.clone(),
            title: None,
            content_hash: Fingerprint::of_bytes(bytes),
            format: MediaFormat::Wav,
            size_bytes: bytes.len() as u64,
            location: format!("/fake/{}", reference.as_str().replace([':', '/'], "_")),
            duration_secs: None,
        };
        self.media.insert(reference.as_str().to_string(), media);
        self
    }

    pub fn with_candidate(mut self, title: &str, reference: &str) -> Self {
        self.candidates.push(MediaCandidate {
            reference: MediaReference::parse(reference).unwrap(),
            title: title.to_string(),
        });
        self
    }

    /// The next fetches fail with these errors, in order.
    pub fn failing_with(self, errors: Vec<MediaError>) -> Self {
        *lock(&self.failures) = errors.into();
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MediaCandidate>, MediaError> {
        lock(&self.queries).push(query.to_string());
        Ok(self.candidates.iter().take(limit).cloned().collect())
    }

    async fn fetch(&self, reference: &MediaReference) -> Result<RawMedia, MediaError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        self.media
            .get(reference.as_str())
            .cloned()
            .ok_or_else(|| MediaError::NotFound(reference.to_string()))
    }
}

/// Transcriber that returns a fixed text, optionally failing or gated.
pub struct FakeTranscriber {
    text: String,
    failures: Mutex<VecDeque<TranscribeError>>,
    always_fail: Option<TranscribeError>,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing(error: TranscribeError) -> Self {
        Self {
            always_fail: Some(error),
            ..Self::new("")
        }
    }

    pub fn failing_with(self, errors: Vec<TranscribeError>) -> Self {
        *lock(&self.failures) = errors.into();
        self
    }

    /// Every call blocks until [`FakeTranscriber::open_gate`].
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    fn model(&self) -> &str {
        "fake/1"
    }

    async fn transcribe(&self, _media: &RawMedia) -> Result<Transcript, TranscribeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| TranscribeError::Transient("gate closed".to_string()))?;
        }
        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        Ok(Transcript::new(
            "fake",
            vec![TranscriptSegment::new(0.0, 4.0, self.text.clone())],
        ))
    }
}
