//! Rule layer: deterministic lexical / structural matching.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::EngineError;
use super::catalog::Catalog;
use super::segment::SpanUnit;
use crate::domain::{PatternType, Span};

/// Rule confidences are fixed and never exceed this.
pub const MAX_RULE_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub pattern_type: PatternType,
    pub confidence: f64,
    #[serde(flatten)]
    pub matcher: RuleMatcher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleMatcher {
    /// Any term occurs as a whole word sequence (case-insensitive).
    Lexicon { terms: Vec<String> },
    /// A `lead` term followed later in the same unit by a `follow` term.
    Sequence { lead: Vec<String>, follow: Vec<String> },
}

#[derive(Debug)]
enum CompiledMatcher {
    Lexicon(Regex),
    Sequence { lead: Regex, follow: Regex },
}

#[derive(Debug)]
struct CompiledRule {
    id: String,
    pattern_type: PatternType,
    confidence: f64,
    matcher: CompiledMatcher,
}

/// Rule layer output for one (unit, pattern type).
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    pub unit_index: usize,
    pub pattern_type: PatternType,
    pub confidence: f64,
    pub rule_ids: Vec<String>,
    pub evidence: Vec<Span>,
}

#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

fn term_regex(rule_id: &str, terms: &[String]) -> Result<Regex, EngineError> {
    let invalid = |reason: &str| EngineError::RuleConfig {
        rule_id: rule_id.to_string(),
        reason: reason.to_string(),
    };
    if terms.is_empty() {
        return Err(invalid("no terms"));
    }
    if terms.iter().any(|t| t.trim().is_empty()) {
        return Err(invalid("blank term"));
    }
    // 長い語を先に: "so what you're saying" が "so" より優先される
    let mut sorted: Vec<&str> = terms.iter().map(|t| t.trim()).collect();
    sorted.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    let alternatives = sorted
        .iter()
        .map(|t| regex::escape(t).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternatives})\b")).map_err(|e| invalid(&e.to_string()))
}

impl RuleSet {
    pub fn compile(definitions: &[RuleDefinition], catalog: &Catalog) -> Result<Self, EngineError> {
        let mut seen = BTreeSet::new();
        let mut rules = Vec::with_capacity(definitions.len());
        for def in definitions {
            let invalid = |reason: String| EngineError::RuleConfig {
                rule_id: def.id.clone(),
                reason,
            };
            if def.id.trim().is_empty() {
                return Err(invalid("empty rule id".to_string()));
            }
            if !seen.insert(def.id.as_str()) {
                return Err(invalid("duplicate rule id".to_string()));
            }
            if !(def.confidence > 0.0 && def.confidence <= MAX_RULE_CONFIDENCE) {
                return Err(invalid(format!(
                    "confidence {} outside (0, {MAX_RULE_CONFIDENCE}]",
                    def.confidence
                )));
            }
            if !catalog.contains(&def.pattern_type) {
                return Err(invalid(format!(
                    "pattern type {} is not in the catalog",
                    def.pattern_type
                )));
            }
            let matcher = match &def.matcher {
                RuleMatcher::Lexicon { terms } => CompiledMatcher::Lexicon(term_regex(&def.id, terms)?),
                RuleMatcher::Sequence { lead, follow } => CompiledMatcher::Sequence {
                    lead: term_regex(&def.id, lead)?,
                    follow: term_regex(&def.id, follow)?,
                },
            };
            rules.push(CompiledRule {
                id: def.id.clone(),
                pattern_type: def.pattern_type.clone(),
                confidence: def.confidence,
                matcher,
            });
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scans every unit. Several rules firing for the same (unit, type) fold into
    /// one hit: highest confidence, union of rule ids and evidence.
    pub fn scan(&self, units: &[SpanUnit]) -> Vec<RuleHit> {
        let mut hits: BTreeMap<(usize, PatternType), RuleHit> = BTreeMap::new();
        for unit in units {
            let to_span = |byte_start: usize, byte_end: usize| {
                let start = unit.text[..byte_start].chars().count();
                let len = unit.text[byte_start..byte_end].chars().count();
                Span::new(unit.span.start + start, unit.span.start + start + len)
            };
            for rule in &self.rules {
                let evidence: Vec<Span> = match &rule.matcher {
                    CompiledMatcher::Lexicon(re) => re
                        .find_iter(&unit.text)
                        .map(|m| to_span(m.start(), m.end()))
                        .collect(),
                    CompiledMatcher::Sequence { lead, follow } => lead
                        .find(&unit.text)
                        .and_then(|l| follow.find_at(&unit.text, l.end()).map(|f| (l, f)))
                        .map(|(l, f)| vec![to_span(l.start(), l.end()), to_span(f.start(), f.end())])
                        .unwrap_or_default(),
                };
                if evidence.is_empty() {
                    continue;
                }
                let hit = hits
                    .entry((unit.index, rule.pattern_type.clone()))
                    .or_insert_with(|| RuleHit {
                        unit_index: unit.index,
                        pattern_type: rule.pattern_type.clone(),
                        confidence: 0.0,
                        rule_ids: Vec::new(),
                        evidence: Vec::new(),
                    });
                hit.confidence = hit.confidence.max(rule.confidence);
                hit.rule_ids.push(rule.id.clone());
                hit.evidence.extend(evidence);
            }
        }
        hits.into_values()
            .map(|mut hit| {
                hit.rule_ids.sort();
                hit.rule_ids.dedup();
                hit.evidence.sort();
                hit.evidence.dedup();
                hit
            })
            .collect()
    }
}
