//! External collaborators: media source, transcriber, embedder, semantic index, explainer.
//!
//! Each error type converts into [`StageError`] so the stage handlers can use `?`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{MediaReference, PatternType, RawMedia, StageError, Transcript};

// ========================================
// Media acquisition
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCandidate {
    pub reference: MediaReference,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("media not found: {0}")]
    NotFound(String),
    #[error("media source temporarily unavailable: {0}")]
    Transient(String),
    #[error("media cannot be handled: {0}")]
    Unsupported(String),
}

impl From<MediaError> for StageError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NotFound(what) => StageError::NotFound(what),
            MediaError::Transient(msg) => StageError::Transient(msg),
            MediaError::Unsupported(msg) => StageError::UnsupportedFormat(msg),
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Ranked candidates for a free-text query.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MediaCandidate>, MediaError>;

    async fn fetch(&self, reference: &MediaReference) -> Result<RawMedia, MediaError>;
}

// ========================================
// Transcription
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscribeError {
    #[error("transcriber temporarily unavailable: {0}")]
    Transient(String),
    #[error("unsupported media format: {0}")]
    UnsupportedFormat(String),
}

impl From<TranscribeError> for StageError {
    fn from(err: TranscribeError) -> Self {
        match err {
            TranscribeError::Transient(msg) => StageError::Transient(msg),
            TranscribeError::UnsupportedFormat(msg) => StageError::UnsupportedFormat(msg),
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Engine/model name; part of the transcribe stage's configuration version.
    fn model(&self) -> &str;

    async fn transcribe(&self, media: &RawMedia) -> Result<Transcript, TranscribeError>;
}

// ========================================
// Semantic retrieval
// ========================================

/// Dense vector, L2-normalised by the embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    pub fn cosine(&self, other: &Embedding) -> f64 {
        let dot: f64 = self
            .0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| f64::from(*a) * f64::from(*b))
            .sum();
        let norm = |v: &[f32]| v.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
        let denom = norm(&self.0) * norm(&other.0);
        if denom == 0.0 { 0.0 } else { dot / denom }
    }
}

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Embedding;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExemplarHit {
    pub exemplar_id: String,
    pub pattern_type: PatternType,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("semantic index unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// Up to `top_k` hits, best first.
    async fn query(&self, embedding: &Embedding, top_k: usize) -> Result<Vec<ExemplarHit>, IndexError>;
}

// ========================================
// Explanation
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainRequest {
    pub pattern_type: PatternType,
    pub pattern_name: String,
    pub pattern_description: String,
    pub span_text: String,
    /// Surrounding text (the sentence unit and its neighbours).
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExplainError {
    #[error("explainer temporarily unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(&self, request: &ExplainRequest) -> Result<String, ExplainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_errors_map_to_stage_errors() {
        assert!(StageError::from(MediaError::Transient("429".into())).is_transient());
        assert!(!StageError::from(MediaError::NotFound("x".into())).is_transient());
        assert_eq!(
            StageError::from(TranscribeError::UnsupportedFormat("flac".into())),
            StageError::UnsupportedFormat("flac".into())
        );
    }

    #[test]
    fn cosine_of_orthogonal_and_parallel_vectors() {
        let a = Embedding(vec![1.0, 0.0]);
        let b = Embedding(vec![0.0, 2.0]);
        assert_eq!(a.cosine(&b), 0.0);
        assert!((a.cosine(&Embedding(vec![3.0, 0.0])) - 1.0).abs() < 1e-9);
        assert_eq!(a.cosine(&Embedding(vec![0.0, 0.0])), 0.0);
    }
}
