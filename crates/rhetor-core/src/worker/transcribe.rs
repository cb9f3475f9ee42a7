//! Transcribe: raw media → transcript.

use std::sync::Arc;

use async_trait::async_trait;

use super::StageHandler;
use crate::domain::{ArtifactContent, StageError, StageKind};
use crate::ports::Transcriber;

pub struct TranscribeHandler {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscribeHandler {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl StageHandler for TranscribeHandler {
    fn kind(&self) -> StageKind {
        StageKind::Transcribe
    }

    fn version_tag(&self) -> String {
        self.transcriber.model().to_string()
    }

    async fn run(&self, input: &ArtifactContent) -> Result<ArtifactContent, StageError> {
        let media = input.as_raw_media().ok_or_else(|| {
            StageError::MalformedInput(format!(
                "transcribe expects raw media, got {}",
                input.kind().as_str()
            ))
        })?;
        let transcript = self.transcriber.transcribe(media).await?;
        Ok(ArtifactContent::Transcript(transcript))
    }
}
