//! Transcripts and their canonical text.
//!
//! Pattern spans are char ranges into [`Transcript::canonical_text`]: segment
//! texts trimmed, empty ones dropped, joined by a single space.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Seconds from the start of the media.
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            confidence: None,
            speaker: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Name of the engine that produced it.
    #[serde(default)]
    pub engine: String,
    pub segments: Vec<TranscriptSegment>,
}

/// Where a segment landed in the canonical text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedSegment<'a> {
    pub segment: &'a TranscriptSegment,
    /// Trimmed text as it appears in the canonical text.
    pub text: &'a str,
    /// Char offset of `text` in the canonical text.
    pub char_start: usize,
    pub char_end: usize,
}

impl Transcript {
    pub fn new(engine: impl Into<String>, segments: Vec<TranscriptSegment>) -> Self {
        Self {
            language: None,
            engine: engine.into(),
            segments,
        }
    }

    /// Non-empty segments with their char offsets, in order.
    pub fn placed_segments(&self) -> Vec<PlacedSegment<'_>> {
        let mut placed = Vec::with_capacity(self.segments.len());
        let mut cursor = 0usize;
        for segment in &self.segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            if !placed.is_empty() {
                cursor += 1; // separator
            }
            let len = text.chars().count();
            placed.push(PlacedSegment {
                segment,
                text,
                char_start: cursor,
                char_end: cursor + len,
            });
            cursor += len;
        }
        placed
    }

    pub fn canonical_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_blank(&self) -> bool {
        self.segments.iter().all(|s| s.text.trim().is_empty())
    }

    pub fn word_count(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.text.split_whitespace().count())
            .sum()
    }

    pub fn duration_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.end).fold(0.0, f64::max)
    }
}

/// Substring by char range; out-of-range ends are clamped.
pub fn char_slice(text: &str, start: usize, end: usize) -> &str {
    let byte_at = |idx: usize| {
        text.char_indices()
            .nth(idx)
            .map(|(b, _)| b)
            .unwrap_or(text.len())
    };
    let (s, e) = (byte_at(start), byte_at(end.max(start)));
    &text[s..e]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transcript {
        Transcript::new(
            "test",
            vec![
                TranscriptSegment::new(0.0, 2.0, "  Hello there. "),
                TranscriptSegment::new(2.0, 3.0, "   "),
                TranscriptSegment::new(3.0, 6.5, "Ça va bien?"),
            ],
        )
    }

    #[test]
    fn canonical_text_joins_trimmed_segments() {
        assert_eq!(sample().canonical_text(), "Hello there. Ça va bien?");
    }

    #[test]
    fn placed_segments_use_char_offsets() {
        let transcript = sample();
        let text = transcript.canonical_text();
        let placed = transcript.placed_segments();
        assert_eq!(placed.len(), 2);
        assert_eq!((placed[0].char_start, placed[0].char_end), (0, 12));
        assert_eq!((placed[1].char_start, placed[1].char_end), (13, 24));
        assert_eq!(char_slice(&text, placed[1].char_start, placed[1].char_end), "Ça va bien?");
    }

    #[test]
    fn blank_and_duration() {
        assert!(!sample().is_blank());
        assert_eq!(sample().duration_secs(), 6.5);
        assert_eq!(sample().word_count(), 5);
        assert!(Transcript::new("x", vec![TranscriptSegment::new(0.0, 1.0, " ")]).is_blank());
    }
}
