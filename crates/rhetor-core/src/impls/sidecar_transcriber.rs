//! SidecarTranscriber - reads transcripts stored next to the media file.
//!
//! Looked up in order:
//! 1. `<media>.transcript.json` - a serialized [`Transcript`]
//! 2. `<media stem>.txt` - timestamped lines (`[12.0s - 15.5s] text`) or plain
//!    paragraphs separated by blank lines

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::domain::{RawMedia, Transcript, TranscriptSegment};
use crate::ports::{TranscribeError, Transcriber};

const TIMESTAMPED_LINE: &str = r"^\[\s*(\d+(?:\.\d+)?)s?\s*-\s*(\d+(?:\.\d+)?)s?\s*\]\s*(.*)$";

/// Speaking rate used to estimate times for untimed paragraphs.
const WORDS_PER_SECOND: f64 = 2.5;

pub const SIDECAR_MODEL: &str = "sidecar/1";

#[derive(Debug, Clone, Default)]
pub struct SidecarTranscriber;

impl SidecarTranscriber {
    pub fn new() -> Self {
        Self
    }

    fn candidates(location: &Path) -> [PathBuf; 2] {
        let mut json = location.as_os_str().to_owned();
        json.push(".transcript.json");
        [PathBuf::from(json), location.with_extension("txt")]
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, TranscribeError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TranscribeError::Transient(format!("{}: {e}", path.display()))),
    }
}

/// Parses the plain-text sidecar format.
pub fn parse_text_transcript(text: &str) -> Vec<TranscriptSegment> {
    let timestamped = Regex::new(TIMESTAMPED_LINE).ok();
    let timed: Vec<TranscriptSegment> = text
        .lines()
        .filter_map(|line| {
            let caps = timestamped.as_ref()?.captures(line.trim())?;
            let start: f64 = caps[1].parse().ok()?;
            let end: f64 = caps[2].parse().ok()?;
            Some(TranscriptSegment::new(start, end.max(start), caps[3].trim()))
        })
        .collect();
    if !timed.is_empty() {
        return timed;
    }

    let mut cursor = 0.0;
    text.split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .map(|paragraph| {
            let secs = paragraph.split_whitespace().count() as f64 / WORDS_PER_SECOND;
            let start = cursor;
            cursor += secs;
            TranscriptSegment::new(start, (cursor * 10.0).round() / 10.0, paragraph)
        })
        .collect()
}

#[async_trait]
impl Transcriber for SidecarTranscriber {
    fn model(&self) -> &str {
        SIDECAR_MODEL
    }

    async fn transcribe(&self, media: &RawMedia) -> Result<Transcript, TranscribeError> {
        let [json_path, text_path] = Self::candidates(Path::new(&media.location));

        if let Some(raw) = read_optional(&json_path).await? {
            debug!(path = %json_path.display(), "using json transcript sidecar");
            let mut transcript: Transcript = serde_json::from_str(&raw).map_err(|e| {
                TranscribeError::UnsupportedFormat(format!("{}: {e}", json_path.display()))
            })?;
            if transcript.engine.is_empty() {
                transcript.engine = SIDECAR_MODEL.to_string();
            }
            return Ok(transcript);
        }

        if let Some(raw) = read_optional(&text_path).await? {
            debug!(path = %text_path.display(), "using text transcript sidecar");
            return Ok(Transcript::new(SIDECAR_MODEL, parse_text_transcript(&raw)));
        }

        Err(TranscribeError::UnsupportedFormat(format!(
            "no transcript sidecar for {}",
            media.location
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fingerprint, MediaFormat, MediaReference};

    fn media_at(path: &Path) -> RawMedia {
        RawMedia {
            reference: MediaReference::parse("clip.wav").unwrap(),
            title: None,
            content_hash: Fingerprint::of_bytes(b"x"),
            format: MediaFormat::Wav,
            size_bytes: 1,
            location: path.display().to_string(),
            duration_secs: None,
        }
    }

    #[test]
    fn parses_timestamped_lines() {
        let segments = parse_text_transcript("[0.0s - 5.2s] Hello there.\n\n[5.2s - 9.0s]  General Kenobi \n");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1], TranscriptSegment::new(5.2, 9.0, "General Kenobi"));
    }

    #[test]
    fn untimed_paragraphs_get_estimated_times() {
        let segments = parse_text_transcript("one two three four five\n\nsix seven\n");
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start, segments[0].end), (0.0, 2.0));
        assert_eq!((segments[1].start, segments[1].end), (2.0, 2.8));
    }

    #[tokio::test]
    async fn json_sidecar_wins_over_text() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("clip.wav");
        let json = serde_json::to_string(&Transcript::new(
            "whisper-large",
            vec![TranscriptSegment::new(0.0, 1.0, "from json")],
        ))
        .unwrap();
        tokio::fs::write(dir.path().join("clip.wav.transcript.json"), json).await.unwrap();
        tokio::fs::write(dir.path().join("clip.txt"), "from text").await.unwrap();

        let transcript = SidecarTranscriber::new().transcribe(&media_at(&media)).await.unwrap();
        assert_eq!(transcript.engine, "whisper-large");
        assert_eq!(transcript.canonical_text(), "from json");
    }

    #[tokio::test]
    async fn missing_sidecar_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = SidecarTranscriber::new()
            .transcribe(&media_at(&dir.path().join("clip.wav")))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::UnsupportedFormat(_)));
    }
}
