//! CatalogExplainer - deterministic rationale from the catalog entry.
//!
//! Stands in for a generative backend; the text is built from the pattern
//! name and description plus the quoted span.

use async_trait::async_trait;

use crate::ports::{ExplainError, ExplainRequest, Explainer};

const MAX_QUOTE_CHARS: usize = 160;

#[derive(Debug, Clone, Default)]
pub struct CatalogExplainer;

#[async_trait]
impl Explainer for CatalogExplainer {
    async fn explain(&self, request: &ExplainRequest) -> Result<String, ExplainError> {
        let mut quote: String = request.span_text.chars().take(MAX_QUOTE_CHARS).collect();
        if request.span_text.chars().count() > MAX_QUOTE_CHARS {
            quote.push('…');
        }
        Ok(format!(
            "\"{quote}\" reads as {}: {}",
            request.pattern_name,
            request.pattern_description.trim_end_matches('.')
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PatternType;

    #[tokio::test]
    async fn rationale_names_the_pattern() {
        let rationale = CatalogExplainer
            .explain(&ExplainRequest {
                pattern_type: PatternType::new("personal_attack"),
                pattern_name: "personal attack".into(),
                pattern_description: "Attacks the person instead of the argument.".into(),
                span_text: "He is a liar.".into(),
                context: "He is a liar.".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            rationale,
            "\"He is a liar.\" reads as personal attack: Attacks the person instead of the argument"
        );
    }
}
