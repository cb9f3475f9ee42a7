//! Pattern detection engine.
//!
//! transcript → sentence units → rule layer + retrieval layer → merge → explanations
//!
//! A rule-layer failure (bad configuration) fails the analysis. Retrieval and
//! explanation failures degrade the output and are reported as partial failures.

pub mod catalog;
pub mod embedding;
pub mod explain;
pub mod retrieval;
pub mod rules;
pub mod scorer;
pub mod segment;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    AnalysisReport, EngineLayer, Fingerprint, PartialFailure, StageError, Transcript,
};
use crate::ports::{Embedder, Explainer, SemanticIndex};

pub use catalog::{Catalog, PatternDefinition};
pub use embedding::HashingEmbedder;
pub use explain::ExplanationConfig;
pub use retrieval::{ExemplarDefinition, RetrievalConfig};
pub use rules::{RuleDefinition, RuleMatcher, RuleSet};
pub use scorer::ScoringConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid rule {rule_id}: {reason}")]
    RuleConfig { rule_id: String, reason: String },

    #[error("invalid catalog: {0}")]
    Catalog(String),
}

impl From<EngineError> for StageError {
    fn from(err: EngineError) -> Self {
        StageError::Configuration(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine_version: String,
    pub catalog: Vec<PatternDefinition>,
    pub rules: Vec<RuleDefinition>,
    pub exemplars: Vec<ExemplarDefinition>,
    pub retrieval: RetrievalConfig,
    pub scoring: ScoringConfig,
    pub explanation: ExplanationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_version: "rhetor-engine/1".to_string(),
            catalog: catalog::default_patterns(),
            rules: catalog::default_rules(),
            exemplars: catalog::default_exemplars(),
            retrieval: RetrievalConfig::default(),
            scoring: ScoringConfig::default(),
            explanation: ExplanationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Numeric settings only; rules and catalog are checked by [`EngineConfig::compile`].
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.engine_version.trim().is_empty() {
            errors.push("engine.engine_version must not be empty".into());
        }
        self.retrieval.validate(errors);
        self.scoring.validate(errors);
        self.explanation.validate(errors);

        // a rule-only match is capped at single_layer_cap by the scorer
        for rule in &self.rules {
            if rule.confidence > self.scoring.single_layer_cap {
                errors.push(format!(
                    "engine.rules.{}: confidence {} exceeds scoring.single_layer_cap {}",
                    rule.id, rule.confidence, self.scoring.single_layer_cap
                ));
            }
        }
    }

    pub fn compile(&self) -> Result<(Catalog, RuleSet), EngineError> {
        let catalog = Catalog::new(&self.catalog)?;
        let rules = RuleSet::compile(&self.rules, &catalog)?;
        Ok((catalog, rules))
    }

    /// `<engine_version>#<first 12 hex of the config hash>`; any change to rules,
    /// catalog or thresholds yields a new tag.
    pub fn version_tag(&self) -> String {
        let hash = Fingerprint::of_json(self)
            .map(|fp| fp.short().to_string())
            .unwrap_or_else(|_| "unhashable".to_string());
        format!("{}#{}", self.engine_version, hash)
    }
}

pub struct PatternEngine {
    config: EngineConfig,
    compiled: Result<(Catalog, RuleSet), EngineError>,
    embedder: Arc<dyn Embedder>,
    index: Option<Arc<dyn SemanticIndex>>,
    explainer: Option<Arc<dyn Explainer>>,
    version_tag: String,
}

impl PatternEngine {
    /// Never fails: a broken rule set surfaces on every `analyze` call as a
    /// configuration error.
    pub fn new(config: EngineConfig, embedder: Arc<dyn Embedder>) -> Self {
        let compiled = config.compile();
        if let Err(err) = &compiled {
            warn!(error = %err, "pattern engine configuration is invalid");
        }
        let version_tag = config.version_tag();
        Self {
            config,
            compiled,
            embedder,
            index: None,
            explainer: None,
            version_tag,
        }
    }

    pub fn with_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_explainer(mut self, explainer: Arc<dyn Explainer>) -> Self {
        self.explainer = Some(explainer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn version_tag(&self) -> &str {
        &self.version_tag
    }

    pub async fn analyze(&self, transcript: &Transcript) -> Result<AnalysisReport, EngineError> {
        let (catalog, rules) = self.compiled.as_ref().map_err(Clone::clone)?;
        let units = segment::segment(transcript);
        let rule_hits = rules.scan(&units);
        let mut partial_failures = Vec::new();

        let retrieval_hits = match (&self.index, self.config.retrieval.enabled) {
            (Some(index), true) => {
                match retrieval::retrieve(
                    &units,
                    self.embedder.as_ref(),
                    index.as_ref(),
                    &self.config.retrieval,
                )
                .await
                {
                    Ok(hits) => hits,
                    Err(err) => {
                        warn!(error = %err, "retrieval layer unavailable, falling back to rules only");
                        partial_failures.push(PartialFailure {
                            layer: EngineLayer::Retrieval,
                            message: err.to_string(),
                        });
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };
        debug!(
            units = units.len(),
            rule_hits = rule_hits.len(),
            retrieval_hits = retrieval_hits.len(),
            "layers scanned"
        );

        let (mut matches, disagreements) =
            scorer::merge(&units, rule_hits, retrieval_hits, &self.config.scoring);

        if let (Some(explainer), true) = (&self.explainer, self.config.explanation.enabled) {
            if let Some(failure) = explain::explain_matches(
                &mut matches,
                &units,
                catalog,
                explainer.as_ref(),
                &self.config.explanation,
            )
            .await
            {
                partial_failures.push(failure);
            }
        }

        info!(
            matches = matches.len(),
            suppressed = disagreements.len(),
            partial_failures = partial_failures.len(),
            "analysis complete"
        );
        Ok(AnalysisReport {
            engine_version: self.version_tag.clone(),
            transcript: transcript.clone(),
            span_count: units.len(),
            matches,
            disagreements,
            partial_failures,
        })
    }
}
