//! Explanation layer: one rationale per surviving match above a floor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::catalog::Catalog;
use super::segment::{SpanUnit, context_around};
use crate::domain::{EngineLayer, PartialFailure, PatternMatch};
use crate::ports::{ExplainRequest, Explainer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplanationConfig {
    pub enabled: bool,
    /// Matches below this confidence get no rationale.
    pub min_confidence: f64,
    pub timeout_ms: u64,
    /// After this many failures in a row the remaining matches are skipped.
    pub max_consecutive_failures: u32,
    /// Neighbouring sentence units sent along as context.
    pub context_units: usize,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.3,
            timeout_ms: 10_000,
            max_consecutive_failures: 5,
            context_units: 1,
        }
    }
}

impl ExplanationConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            errors.push("engine.explanation.min_confidence must be within [0, 1]".into());
        }
        if self.timeout_ms == 0 {
            errors.push("engine.explanation.timeout_ms must be positive".into());
        }
        if self.max_consecutive_failures == 0 {
            errors.push("engine.explanation.max_consecutive_failures must be at least 1".into());
        }
    }
}

/// Fills `rationale` in place. Failures leave it `None` and are summarised in
/// a single partial failure.
pub async fn explain_matches(
    matches: &mut [PatternMatch],
    units: &[SpanUnit],
    catalog: &Catalog,
    explainer: &dyn Explainer,
    config: &ExplanationConfig,
) -> Option<PartialFailure> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut requested = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    let mut consecutive = 0u32;
    let mut last_error = None;

    for m in matches
        .iter_mut()
        .filter(|m| !m.suppressed && m.confidence >= config.min_confidence)
    {
        if consecutive >= config.max_consecutive_failures {
            skipped += 1;
            continue;
        }
        let Some(definition) = catalog.get(&m.pattern_type) else {
            continue;
        };
        let context = units
            .iter()
            .position(|u| u.span == m.span)
            .map(|i| context_around(units, i, config.context_units))
            .unwrap_or_else(|| m.text.clone());
        let request = ExplainRequest {
            pattern_type: m.pattern_type.clone(),
            pattern_name: definition.name.clone(),
            pattern_description: definition.description.clone(),
            span_text: m.text.clone(),
            context,
        };

        requested += 1;
        match tokio::time::timeout(timeout, explainer.explain(&request)).await {
            Ok(Ok(rationale)) if !rationale.trim().is_empty() => {
                m.rationale = Some(rationale.trim().to_string());
                consecutive = 0;
            }
            Ok(Ok(_)) => {
                failed += 1;
                consecutive += 1;
                last_error = Some("empty rationale".to_string());
            }
            Ok(Err(err)) => {
                debug!(match_id = %m.match_id, error = %err, "explanation failed");
                failed += 1;
                consecutive += 1;
                last_error = Some(err.to_string());
            }
            Err(_) => {
                debug!(match_id = %m.match_id, timeout_ms = config.timeout_ms, "explanation timed out");
                failed += 1;
                consecutive += 1;
                last_error = Some(format!("timed out after {} ms", config.timeout_ms));
            }
        }
    }

    if failed == 0 && skipped == 0 {
        return None;
    }
    let mut message = format!("{failed} of {requested} rationale requests failed");
    if let Some(err) = last_error {
        message.push_str(&format!(" (last error: {err})"));
    }
    if skipped > 0 {
        message.push_str(&format!(
            "; {skipped} skipped after {} consecutive failures",
            config.max_consecutive_failures
        ));
    }
    warn!(failed, requested, skipped, "explanation layer degraded");
    Some(PartialFailure {
        layer: EngineLayer::Explanation,
        message,
    })
}
