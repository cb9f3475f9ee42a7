//! Merge layer: combine rule and retrieval hits, then resolve overlaps.
//!
//! # Confidence
//! - both layers agree on (unit, type): `1 - (1 - r)(1 - s)`, capped at `confirmation_cap`
//! - one layer only: its confidence, capped at `single_layer_cap`
//!   (strictly below `high_confidence_threshold`)
//!
//! # Overlap policy
//! Candidates are ranked (confidence desc, ensemble > rule > retrieval, earlier
//! start, longer span, type slug). A candidate overlapping an already kept match
//! of another type by more than `max_overlap_fraction` of the shorter span is
//! kept in the output but flagged `suppressed`, and a [`Disagreement`] is recorded.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::retrieval::RetrievalHit;
use super::rules::RuleHit;
use super::segment::SpanUnit;
use crate::domain::{Disagreement, MatchSource, PatternMatch, PatternType, Span};

pub const SUPPRESSION_POLICY: &str = "highest_ranked_wins";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub high_confidence_threshold: f64,
    pub single_layer_cap: f64,
    pub confirmation_cap: f64,
    /// Merged matches below this are dropped.
    pub min_confidence: f64,
    pub max_overlap_fraction: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: 0.8,
            single_layer_cap: 0.79,
            confirmation_cap: 0.99,
            min_confidence: 0.2,
            max_overlap_fraction: 0.5,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if !(self.single_layer_cap > 0.0 && self.single_layer_cap < self.high_confidence_threshold) {
            errors.push(
                "engine.scoring.single_layer_cap must be positive and below high_confidence_threshold"
                    .into(),
            );
        }
        if !(self.confirmation_cap >= self.high_confidence_threshold && self.confirmation_cap <= 1.0) {
            errors.push(
                "engine.scoring.confirmation_cap must be within [high_confidence_threshold, 1]".into(),
            );
        }
        if !(0.0..1.0).contains(&self.min_confidence) {
            errors.push("engine.scoring.min_confidence must be within [0, 1)".into());
        }
        if !(self.max_overlap_fraction > 0.0 && self.max_overlap_fraction <= 1.0) {
            errors.push("engine.scoring.max_overlap_fraction must be within (0, 1]".into());
        }
    }
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Noisy-OR of two independent confirmations.
pub fn combine(rule: f64, retrieval: f64, cap: f64) -> f64 {
    (1.0 - (1.0 - rule) * (1.0 - retrieval)).min(cap)
}

fn rank(a: &PatternMatch, b: &PatternMatch) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(a.source.rank().cmp(&b.source.rank()))
        .then(a.span.start.cmp(&b.span.start))
        .then(b.span.len().cmp(&a.span.len()))
        .then(a.pattern_type.cmp(&b.pattern_type))
}

pub fn merge(
    units: &[SpanUnit],
    rule_hits: Vec<RuleHit>,
    retrieval_hits: Vec<RetrievalHit>,
    config: &ScoringConfig,
) -> (Vec<PatternMatch>, Vec<Disagreement>) {
    let mut joined: BTreeMap<(usize, PatternType), (Option<RuleHit>, Option<RetrievalHit>)> =
        BTreeMap::new();
    for hit in rule_hits {
        let key = (hit.unit_index, hit.pattern_type.clone());
        joined.entry(key).or_default().0 = Some(hit);
    }
    for hit in retrieval_hits {
        let key = (hit.unit_index, hit.pattern_type.clone());
        joined.entry(key).or_default().1 = Some(hit);
    }

    let mut candidates: Vec<PatternMatch> = Vec::with_capacity(joined.len());
    for ((unit_index, pattern_type), (rule, retrieval)) in joined {
        let Some(unit) = units.get(unit_index) else {
            continue;
        };
        let (confidence, source) = match (&rule, &retrieval) {
            (Some(r), Some(s)) => (
                combine(r.confidence, s.confidence, config.confirmation_cap),
                MatchSource::Ensemble,
            ),
            (Some(r), None) => (r.confidence.min(config.single_layer_cap), MatchSource::Rule),
            (None, Some(s)) => (s.confidence.min(config.single_layer_cap), MatchSource::Retrieval),
            (None, None) => continue,
        };
        let confidence = round4(confidence);
        if confidence < config.min_confidence {
            continue;
        }
        let span = unit.span;
        candidates.push(PatternMatch {
            match_id: PatternMatch::make_id(span, &pattern_type),
            span,
            text: unit.text.clone(),
            start_time: unit.start_time,
            end_time: unit.end_time,
            pattern_type,
            confidence,
            source,
            rationale: None,
            suppressed: false,
            suppressed_by: None,
            rule_ids: rule.as_ref().map(|r| r.rule_ids.clone()).unwrap_or_default(),
            exemplar_ids: retrieval
                .as_ref()
                .map(|s| s.exemplar_ids.clone())
                .unwrap_or_default(),
            evidence: rule.map(|r| r.evidence).unwrap_or_default(),
        });
    }

    candidates.sort_by(rank);

    let mut resolved: Vec<PatternMatch> = Vec::with_capacity(candidates.len());
    let mut disagreements = Vec::new();
    for mut candidate in candidates {
        let winner = resolved.iter().find(|kept| {
            !kept.suppressed
                && kept.pattern_type != candidate.pattern_type
                && kept.span.overlap_fraction(&candidate.span) > config.max_overlap_fraction
        });
        if let Some(winner) = winner {
            disagreements.push(Disagreement {
                kept_match_id: winner.match_id.clone(),
                kept_type: winner.pattern_type.clone(),
                kept_confidence: winner.confidence,
                suppressed_match_id: candidate.match_id.clone(),
                suppressed_type: candidate.pattern_type.clone(),
                suppressed_confidence: candidate.confidence,
                overlap_fraction: round4(winner.span.overlap_fraction(&candidate.span)),
                policy: SUPPRESSION_POLICY.to_string(),
            });
            candidate.suppressed = true;
            candidate.suppressed_by = Some(winner.match_id.clone());
        }
        resolved.push(candidate);
    }

    resolved.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then(b.confidence.total_cmp(&a.confidence))
            .then(a.pattern_type.cmp(&b.pattern_type))
    });
    (resolved, disagreements)
}

/// Spans only; handy for determinism checks.
pub fn signature(matches: &[PatternMatch]) -> Vec<(Span, PatternType, f64)> {
    matches
        .iter()
        .map(|m| (m.span, m.pattern_type.clone(), m.confidence))
        .collect()
}
