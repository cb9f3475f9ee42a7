//! Ingest: media request → raw media.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::StageHandler;
use crate::domain::{ArtifactContent, MediaInput, StageError, StageKind};
use crate::ports::MediaSource;

pub struct IngestHandler {
    source: Arc<dyn MediaSource>,
}

impl IngestHandler {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl StageHandler for IngestHandler {
    fn kind(&self) -> StageKind {
        StageKind::Ingest
    }

    async fn run(&self, input: &ArtifactContent) -> Result<ArtifactContent, StageError> {
        let ArtifactContent::MediaRequest(request) = input else {
            return Err(StageError::MalformedInput(format!(
                "ingest expects a media request, got {}",
                input.kind().as_str()
            )));
        };

        let media = match request {
            MediaInput::Reference { reference } => self.source.fetch(reference).await?,
            MediaInput::Subject { name } => {
                // 発言者名で検索して先頭の 1 件を使う
                let query = format!("{name} speech");
                let candidate = self
                    .source
                    .search(&query, 1)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| StageError::NotFound(format!("no media found for \"{query}\"")))?;
                debug!(%query, reference = %candidate.reference, "subject resolved");

                let mut media = self.source.fetch(&candidate.reference).await?;
                media.title.get_or_insert(candidate.title);
                media
            }
        };
        Ok(ArtifactContent::RawMedia(media))
    }
}
