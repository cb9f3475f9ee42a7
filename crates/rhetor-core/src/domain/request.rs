//! Job requests: what a caller hands to `submit`.

use serde::{Deserialize, Serialize};

use super::stage::StageKind;

/// Why a request was rejected at submit time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("subject name must not be empty")]
    EmptySubject,

    #[error("media reference must not be empty")]
    EmptyReference,

    #[error("media reference is not recognised: {0}")]
    UnrecognisedReference(String),

    #[error("label exceeds {max} characters")]
    LabelTooLong { max: usize },
}

/// A normalized pointer to one piece of media.
///
/// - `youtube:<id>` for video-platform URLs (watch, short link, shorts, embed)
///   and for bare 11-character video ids
/// - a local path for everything else (`file://` prefix stripped)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaReference(String);

const PLATFORM_PREFIX: &str = "youtube:";

impl MediaReference {
    pub fn parse(raw: &str) -> Result<Self, RequestError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RequestError::EmptyReference);
        }
        if let Some(id) = raw.strip_prefix(PLATFORM_PREFIX) {
            return valid_video_id(id)
                .then(|| Self(raw.to_string()))
                .ok_or_else(|| RequestError::UnrecognisedReference(raw.to_string()));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return extract_video_id(raw)
                .map(|id| Self(format!("{PLATFORM_PREFIX}{id}")))
                .ok_or_else(|| RequestError::UnrecognisedReference(raw.to_string()));
        }
        if valid_video_id(raw) {
            return Ok(Self(format!("{PLATFORM_PREFIX}{raw}")));
        }
        let path = raw.strip_prefix("file://").unwrap_or(raw);
        if path.is_empty() {
            return Err(RequestError::EmptyReference);
        }
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Platform video id when the reference points at the video platform.
    pub fn video_id(&self) -> Option<&str> {
        self.0.strip_prefix(PLATFORM_PREFIX)
    }
}

impl std::fmt::Display for MediaReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn valid_video_id(id: &str) -> bool {
    id.len() == 11
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn extract_video_id(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = host.trim_start_matches("www.").trim_start_matches("m.");

    let candidate = match host {
        "youtu.be" => path.split(['?', '&', '#']).next(),
        "youtube.com" => {
            if let Some(query) = path.strip_prefix("watch?") {
                query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("v="))
                    .map(|v| v.split('#').next().unwrap_or(v))
            } else {
                path.strip_prefix("shorts/")
                    .or_else(|| path.strip_prefix("embed/"))
                    .and_then(|p| p.split(['?', '&', '#', '/']).next())
            }
        }
        _ => None,
    }?;

    valid_video_id(candidate).then(|| candidate.to_string())
}

/// Input descriptor: a subject to search for, or a concrete media reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaInput {
    /// Search the media source for `"<name> speech"` and take the first hit.
    Subject { name: String },
    Reference { reference: MediaReference },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Free-form caller label, echoed in status and output.
    pub label: Option<String>,

    /// Finish the job (DONE) after this stage instead of running all three.
    pub stop_after: Option<StageKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub input: MediaInput,
    #[serde(default)]
    pub options: JobOptions,
}

pub const MAX_LABEL_CHARS: usize = 200;

impl JobRequest {
    pub fn subject(name: impl Into<String>) -> Self {
        Self {
            input: MediaInput::Subject { name: name.into() },
            options: JobOptions::default(),
        }
    }

    pub fn reference(raw: &str) -> Result<Self, RequestError> {
        Ok(Self {
            input: MediaInput::Reference {
                reference: MediaReference::parse(raw)?,
            },
            options: JobOptions::default(),
        })
    }

    pub fn with_stop_after(mut self, stage: StageKind) -> Self {
        self.options.stop_after = Some(stage);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.options.label = Some(label.into());
        self
    }

    /// Validates and normalizes the request (trimmed subject, re-parsed reference).
    pub fn validate(self) -> Result<Self, RequestError> {
        let input = match self.input {
            MediaInput::Subject { name } => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(RequestError::EmptySubject);
                }
                MediaInput::Subject { name }
            }
            MediaInput::Reference { reference } => MediaInput::Reference {
                reference: MediaReference::parse(reference.as_str())?,
            },
        };
        if let Some(label) = &self.options.label
            && label.chars().count() > MAX_LABEL_CHARS
        {
            return Err(RequestError::LabelTooLong {
                max: MAX_LABEL_CHARS,
            });
        }
        Ok(Self {
            input,
            options: self.options,
        })
    }

    /// Last stage this job runs.
    pub fn final_stage(&self) -> StageKind {
        self.options.stop_after.unwrap_or(StageKind::Analyze)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "youtube:dQw4w9WgXcQ")]
    #[case("https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ#t=3", "youtube:dQw4w9WgXcQ")]
    #[case("https://youtu.be/dQw4w9WgXcQ?t=42", "youtube:dQw4w9WgXcQ")]
    #[case("https://www.youtube.com/shorts/dQw4w9WgXcQ", "youtube:dQw4w9WgXcQ")]
    #[case("youtube:dQw4w9WgXcQ", "youtube:dQw4w9WgXcQ")]
    #[case("dQw4w9WgXcQ", "youtube:dQw4w9WgXcQ")]
    #[case("file:///srv/media/debate.wav", "/srv/media/debate.wav")]
    #[case("  debate.mp3 ", "debate.mp3")]
    fn references_are_normalized(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(MediaReference::parse(raw).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("", RequestError::EmptyReference)]
    #[case("file://", RequestError::EmptyReference)]
    #[case("https://example.com/video", RequestError::UnrecognisedReference("https://example.com/video".into()))]
    #[case("youtube:short", RequestError::UnrecognisedReference("youtube:short".into()))]
    fn bad_references_are_rejected(#[case] raw: &str, #[case] expected: RequestError) {
        assert_eq!(MediaReference::parse(raw).unwrap_err(), expected);
    }

    #[test]
    fn validate_trims_subject_and_rejects_blank() {
        let request = JobRequest::subject("  Jane Doe ").validate().unwrap();
        assert_eq!(
            request.input,
            MediaInput::Subject {
                name: "Jane Doe".into()
            }
        );
        assert_eq!(
            JobRequest::subject("   ").validate().unwrap_err(),
            RequestError::EmptySubject
        );
    }

    #[test]
    fn final_stage_defaults_to_analyze() {
        let request = JobRequest::subject("x");
        assert_eq!(request.final_stage(), StageKind::Analyze);
        assert_eq!(
            request.with_stop_after(StageKind::Transcribe).final_stage(),
            StageKind::Transcribe
        );
    }

    #[test]
    fn request_json_shape() {
        let request = JobRequest::reference("clips/debate.wav").unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["input"]["kind"], "reference");
        assert_eq!(json["input"]["reference"], "clips/debate.wav");
        assert_eq!(json["options"]["stop_after"], serde_json::Value::Null);
    }
}
