//! Retrieval layer: nearest labelled exemplars per sentence unit.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::segment::SpanUnit;
use crate::domain::PatternType;
use crate::ports::{Embedder, IndexError, SemanticIndex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExemplarDefinition {
    pub id: String,
    pub pattern_type: PatternType,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub enabled: bool,
    pub top_k: usize,
    /// Hits below this cosine similarity are ignored.
    pub min_similarity: f64,
    /// Similarity-derived confidences are clamped to this.
    pub max_confidence: f64,
    /// Units with fewer words are not embedded.
    pub min_span_words: usize,
    pub query_timeout_ms: u64,
    pub dimensions: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
            min_similarity: 0.55,
            max_confidence: 0.95,
            min_span_words: 4,
            query_timeout_ms: 2_000,
            dimensions: 512,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.top_k == 0 {
            errors.push("engine.retrieval.top_k must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.min_similarity) {
            errors.push("engine.retrieval.min_similarity must be within [0, 1]".into());
        }
        if !(self.max_confidence > 0.0 && self.max_confidence <= 1.0) {
            errors.push("engine.retrieval.max_confidence must be within (0, 1]".into());
        }
        if self.query_timeout_ms == 0 {
            errors.push("engine.retrieval.query_timeout_ms must be positive".into());
        }
        if self.dimensions == 0 {
            errors.push("engine.retrieval.dimensions must be positive".into());
        }
    }
}

/// Retrieval output for one (unit, pattern type).
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub unit_index: usize,
    pub pattern_type: PatternType,
    pub similarity: f64,
    pub confidence: f64,
    pub exemplar_ids: Vec<String>,
}

/// Queries the index for every eligible unit.
///
/// Any `Unavailable` (including a query timeout) aborts the whole layer; the
/// caller falls back to rule-only output.
pub async fn retrieve(
    units: &[SpanUnit],
    embedder: &dyn Embedder,
    index: &dyn SemanticIndex,
    config: &RetrievalConfig,
) -> Result<Vec<RetrievalHit>, IndexError> {
    let timeout = Duration::from_millis(config.query_timeout_ms);
    let mut out = Vec::new();
    for unit in units.iter().filter(|u| u.word_count >= config.min_span_words) {
        let embedding = embedder.embed(&unit.text);
        let hits = tokio::time::timeout(timeout, index.query(&embedding, config.top_k))
            .await
            .map_err(|_| {
                IndexError::Unavailable(format!(
                    "query timed out after {} ms",
                    config.query_timeout_ms
                ))
            })??;

        let mut by_type: BTreeMap<PatternType, (f64, Vec<String>)> = BTreeMap::new();
        for hit in hits.into_iter().take(config.top_k) {
            if !(hit.similarity >= config.min_similarity) {
                continue;
            }
            let entry = by_type
                .entry(hit.pattern_type)
                .or_insert((f64::MIN, Vec::new()));
            entry.0 = entry.0.max(hit.similarity);
            entry.1.push(hit.exemplar_id);
        }
        for (pattern_type, (similarity, mut exemplar_ids)) in by_type {
            exemplar_ids.sort();
            exemplar_ids.dedup();
            out.push(RetrievalHit {
                unit_index: unit.index,
                pattern_type,
                similarity,
                confidence: similarity.clamp(0.0, config.max_confidence),
                exemplar_ids,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Transcript, TranscriptSegment};
    use crate::engine::embedding::HashingEmbedder;
    use crate::engine::segment::segment;
    use crate::testing::{ScriptedIndex, SlowIndex};

    fn units(text: &str) -> Vec<SpanUnit> {
        segment(&Transcript::new("t", vec![TranscriptSegment::new(0.0, 5.0, text)]))
    }

    #[tokio::test]
    async fn best_hit_per_type_above_threshold() {
        let index = ScriptedIndex::new(vec![
            ("ex-1", "straw_man", 0.97),
            ("ex-2", "straw_man", 0.6),
            ("ex-3", "hyperbole", 0.3),
        ]);
        let hits = retrieve(
            &units("So you want to ban every car. Ok."),
            &HashingEmbedder::new(64),
            &index,
            &RetrievalConfig::default(),
        )
        .await
        .unwrap();

        // "Ok." has too few words to be embedded
        assert_eq!(index.calls(), 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern_type, PatternType::new("straw_man"));
        assert_eq!(hits[0].similarity, 0.97);
        assert_eq!(hits[0].confidence, 0.95);
        assert_eq!(hits[0].exemplar_ids, vec!["ex-1".to_string(), "ex-2".to_string()]);
    }

    #[tokio::test]
    async fn slow_index_counts_as_unavailable() {
        let config = RetrievalConfig {
            query_timeout_ms: 10,
            ..RetrievalConfig::default()
        };
        let result = retrieve(
            &units("So you want to ban every car."),
            &HashingEmbedder::new(64),
            &SlowIndex(Duration::from_millis(200)),
            &config,
        )
        .await;
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }
}
