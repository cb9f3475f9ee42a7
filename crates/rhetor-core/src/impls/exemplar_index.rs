//! InMemoryExemplarIndex - brute-force cosine search over labelled exemplars.

use async_trait::async_trait;

use crate::domain::PatternType;
use crate::engine::ExemplarDefinition;
use crate::ports::{Embedder, Embedding, ExemplarHit, IndexError, SemanticIndex};

struct Entry {
    id: String,
    pattern_type: PatternType,
    embedding: Embedding,
}

pub struct InMemoryExemplarIndex {
    entries: Vec<Entry>,
}

impl InMemoryExemplarIndex {
    /// Embeds every exemplar once, up front.
    pub fn from_exemplars(exemplars: &[ExemplarDefinition], embedder: &dyn Embedder) -> Self {
        let entries = exemplars
            .iter()
            .map(|ex| Entry {
                id: ex.id.clone(),
                pattern_type: ex.pattern_type.clone(),
                embedding: embedder.embed(&ex.text),
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SemanticIndex for InMemoryExemplarIndex {
    async fn query(&self, embedding: &Embedding, top_k: usize) -> Result<Vec<ExemplarHit>, IndexError> {
        let mut hits: Vec<ExemplarHit> = self
            .entries
            .iter()
            .map(|e| ExemplarHit {
                exemplar_id: e.id.clone(),
                pattern_type: e.pattern_type.clone(),
                similarity: (embedding.cosine(&e.embedding) * 10_000.0).round() / 10_000.0,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.exemplar_id.cmp(&b.exemplar_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HashingEmbedder;
    use crate::engine::catalog::default_exemplars;

    #[tokio::test]
    async fn nearest_exemplar_comes_first() {
        let embedder = HashingEmbedder::new(512);
        let index = InMemoryExemplarIndex::from_exemplars(&default_exemplars(), &embedder);
        assert_eq!(index.len(), default_exemplars().len());

        let hits = index
            .query(&embedder.embed("This is the worst deal in the history of the world!"), 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].exemplar_id, "ex-hy-1");
        assert_eq!(hits[0].similarity, 1.0);
        assert!(hits[0].similarity >= hits[1].similarity);
    }
}
