//! Pattern matches: the output contract of the detection engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::transcript::Transcript;

/// Catalog slug of a rhetorical pattern, e.g. `personal_attack`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternType(String);

impl PatternType {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open char range `[start, end)` into the canonical transcript text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn overlap(&self, other: &Span) -> usize {
        self.end.min(other.end).saturating_sub(self.start.max(other.start))
    }

    /// Overlap relative to the shorter of the two spans (0.0 ..= 1.0).
    pub fn overlap_fraction(&self, other: &Span) -> f64 {
        let shorter = self.len().min(other.len());
        if shorter == 0 {
            return 0.0;
        }
        self.overlap(other) as f64 / shorter as f64
    }
}

/// Which layer produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Rule,
    Retrieval,
    /// Rule and retrieval layers agreed.
    Ensemble,
}

impl MatchSource {
    /// Tie-break rank: ensemble before rule before retrieval.
    pub fn rank(&self) -> u8 {
        match self {
            MatchSource::Ensemble => 0,
            MatchSource::Rule => 1,
            MatchSource::Retrieval => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchSource::Rule => "rule",
            MatchSource::Retrieval => "retrieval",
            MatchSource::Ensemble => "ensemble",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    /// `m-<start>-<end>-<type>`; stable across runs.
    pub match_id: String,
    pub span: Span,
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub pattern_type: PatternType,
    pub confidence: f64,
    pub source: MatchSource,
    pub rationale: Option<String>,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_by: Option<String>,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    #[serde(default)]
    pub exemplar_ids: Vec<String>,
    /// Sub-spans that triggered rules (matched terms).
    #[serde(default)]
    pub evidence: Vec<Span>,
}

impl PatternMatch {
    pub fn make_id(span: Span, pattern_type: &PatternType) -> String {
        format!("m-{}-{}-{}", span.start, span.end, pattern_type)
    }
}

/// Two layers/types claimed overlapping text; the loser was suppressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disagreement {
    pub kept_match_id: String,
    pub kept_type: PatternType,
    pub kept_confidence: f64,
    pub suppressed_match_id: String,
    pub suppressed_type: PatternType,
    pub suppressed_confidence: f64,
    pub overlap_fraction: f64,
    pub policy: String,
}

/// Engine layer that can degrade without failing the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineLayer {
    Retrieval,
    Explanation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub layer: EngineLayer,
    pub message: String,
}

/// Output of the Analyze stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub engine_version: String,
    pub transcript: Transcript,
    /// Number of sentence units scanned.
    pub span_count: usize,
    pub matches: Vec<PatternMatch>,
    pub disagreements: Vec<Disagreement>,
    pub partial_failures: Vec<PartialFailure>,
}

impl AnalysisReport {
    pub fn active_matches(&self) -> impl Iterator<Item = &PatternMatch> {
        self.matches.iter().filter(|m| !m.suppressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Span::new(0, 10), Span::new(5, 15), 5, 0.5)]
    #[case(Span::new(0, 10), Span::new(2, 4), 2, 1.0)]
    #[case(Span::new(0, 10), Span::new(10, 20), 0, 0.0)]
    #[case(Span::new(0, 0), Span::new(0, 5), 0, 0.0)]
    fn overlap(#[case] a: Span, #[case] b: Span, #[case] chars: usize, #[case] fraction: f64) {
        assert_eq!(a.overlap(&b), chars);
        assert_eq!(a.overlap_fraction(&b), fraction);
        assert_eq!(b.overlap_fraction(&a), fraction);
    }

    #[test]
    fn match_ids_are_positional() {
        let id = PatternMatch::make_id(Span::new(3, 9), &PatternType::new("hyperbole"));
        assert_eq!(id, "m-3-9-hyperbole");
    }
}
