//! Sentence units: the spans every layer scores.

use crate::domain::{Span, Transcript};

#[derive(Debug, Clone, PartialEq)]
pub struct SpanUnit {
    pub index: usize,
    pub span: Span,
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub word_count: usize,
}

fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Splits each transcript segment at `.`, `!` or `?` followed by whitespace
/// (or the end of the segment). Units never cross segment boundaries.
///
/// Times are interpolated linearly by char position inside the segment.
pub fn segment(transcript: &Transcript) -> Vec<SpanUnit> {
    let mut units = Vec::new();
    for placed in transcript.placed_segments() {
        let chars: Vec<char> = placed.text.chars().collect();
        let n = chars.len();
        let seg = placed.segment;
        let duration = (seg.end - seg.start).max(0.0);

        let mut push = |from: usize, to: usize| {
            let (mut s, mut e) = (from, to);
            while s < e && chars[s].is_whitespace() {
                s += 1;
            }
            while e > s && chars[e - 1].is_whitespace() {
                e -= 1;
            }
            if s == e {
                return;
            }
            let text: String = chars[s..e].iter().collect();
            units.push(SpanUnit {
                index: units.len(),
                span: Span::new(placed.char_start + s, placed.char_start + e),
                word_count: text.split_whitespace().count(),
                text,
                start_time: round_ms(seg.start + duration * s as f64 / n as f64),
                end_time: round_ms(seg.start + duration * e as f64 / n as f64),
            });
        };

        let mut unit_start = 0;
        for i in 0..n {
            let terminal = matches!(chars[i], '.' | '!' | '?')
                && (i + 1 == n || chars[i + 1].is_whitespace());
            if terminal || i + 1 == n {
                push(unit_start, i + 1);
                unit_start = i + 1;
            }
        }
    }
    units
}

/// Text of the unit at `index` plus `radius` neighbours on each side.
pub fn context_around(units: &[SpanUnit], index: usize, radius: usize) -> String {
    let from = index.saturating_sub(radius);
    let to = (index + radius + 1).min(units.len());
    units
        .get(from..to)
        .unwrap_or_default()
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
