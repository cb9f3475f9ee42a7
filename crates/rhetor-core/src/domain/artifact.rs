//! Artifacts: immutable, content-addressed stage inputs and outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StageError;
use super::fingerprint::Fingerprint;
use super::pattern::AnalysisReport;
use super::request::{MediaInput, MediaReference};
use super::stage::StageKind;
use super::transcript::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    MediaRequest,
    RawMedia,
    Transcript,
    Analysis,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::MediaRequest => "media_request",
            ArtifactKind::RawMedia => "raw_media",
            ArtifactKind::Transcript => "transcript",
            ArtifactKind::Analysis => "analysis",
        }
    }

    /// Input kind a stage consumes.
    pub fn input_of(stage: StageKind) -> Self {
        match stage {
            StageKind::Ingest => ArtifactKind::MediaRequest,
            StageKind::Transcribe => ArtifactKind::RawMedia,
            StageKind::Analyze => ArtifactKind::Transcript,
        }
    }

    /// Output kind a stage produces.
    pub fn output_of(stage: StageKind) -> Self {
        match stage {
            StageKind::Ingest => ArtifactKind::RawMedia,
            StageKind::Transcribe => ArtifactKind::Transcript,
            StageKind::Analyze => ArtifactKind::Analysis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Wav,
    Mp3,
    M4a,
    Mp4,
    Webm,
    Ogg,
    Flac,
    Unknown,
}

impl MediaFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => MediaFormat::Wav,
            "mp3" => MediaFormat::Mp3,
            "m4a" => MediaFormat::M4a,
            "mp4" => MediaFormat::Mp4,
            "webm" => MediaFormat::Webm,
            "ogg" | "opus" => MediaFormat::Ogg,
            "flac" => MediaFormat::Flac,
            _ => MediaFormat::Unknown,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, MediaFormat::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFormat::Wav => "wav",
            MediaFormat::Mp3 => "mp3",
            MediaFormat::M4a => "m4a",
            MediaFormat::Mp4 => "mp4",
            MediaFormat::Webm => "webm",
            MediaFormat::Ogg => "ogg",
            MediaFormat::Flac => "flac",
            MediaFormat::Unknown => "unknown",
        }
    }
}

/// Reference to fetched media bytes. The bytes themselves stay where the
/// media source put them; `content_hash` pins them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMedia {
    pub reference: MediaReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content_hash: Fingerprint,
    pub format: MediaFormat,
    pub size_bytes: u64,
    /// Where the bytes live (a path for local sources).
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ArtifactContent {
    MediaRequest(MediaInput),
    RawMedia(RawMedia),
    Transcript(Transcript),
    Analysis(AnalysisReport),
}

impl ArtifactContent {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactContent::MediaRequest(_) => ArtifactKind::MediaRequest,
            ArtifactContent::RawMedia(_) => ArtifactKind::RawMedia,
            ArtifactContent::Transcript(_) => ArtifactKind::Transcript,
            ArtifactContent::Analysis(_) => ArtifactKind::Analysis,
        }
    }

    /// Content address. Raw media is addressed by its bytes, so two references
    /// to identical media share one artifact.
    pub fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
        match self {
            ArtifactContent::RawMedia(media) => Ok(Fingerprint::of_bytes(
                format!(
                    "raw_media|{}|{}",
                    media.format.as_str(),
                    media.content_hash
                )
                .as_bytes(),
            )),
            other => Fingerprint::of_json(other),
        }
    }

    /// Integrity gate between stages: `next` may only start on content that passes.
    pub fn check_ready_for(&self, next: StageKind) -> Result<(), StageError> {
        let expected = ArtifactKind::input_of(next);
        if self.kind() != expected {
            return Err(StageError::Integrity(format!(
                "{} expects {} input, got {}",
                next,
                expected.as_str(),
                self.kind().as_str()
            )));
        }
        match self {
            ArtifactContent::RawMedia(media) => {
                if media.size_bytes == 0 {
                    return Err(StageError::Integrity(format!(
                        "media {} is empty",
                        media.reference
                    )));
                }
                if !media.format.is_supported() {
                    return Err(StageError::UnsupportedFormat(format!(
                        "media {} has an unsupported format",
                        media.reference
                    )));
                }
                Ok(())
            }
            ArtifactContent::Transcript(transcript) => {
                if transcript.is_blank() {
                    return Err(StageError::Integrity("transcript is empty".to_string()));
                }
                Ok(())
            }
            ArtifactContent::MediaRequest(_) | ArtifactContent::Analysis(_) => Ok(()),
        }
    }

    pub fn as_raw_media(&self) -> Option<&RawMedia> {
        match self {
            ArtifactContent::RawMedia(media) => Some(media),
            _ => None,
        }
    }

    pub fn as_transcript(&self) -> Option<&Transcript> {
        match self {
            ArtifactContent::Transcript(transcript) => Some(transcript),
            _ => None,
        }
    }

    pub fn as_analysis(&self) -> Option<&AnalysisReport> {
        match self {
            ArtifactContent::Analysis(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub fingerprint: Fingerprint,
    pub kind: ArtifactKind,
    pub content: ArtifactContent,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(content: ArtifactContent, created_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            fingerprint: content.fingerprint()?,
            kind: content.kind(),
            content,
            created_at,
        })
    }
}
