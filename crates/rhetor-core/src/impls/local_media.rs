//! LocalMediaSource - media files under a root directory.
//!
//! - path references resolve relative to the root
//! - platform references (`youtube:<id>`) resolve to a downloaded `<id>.<ext>` in the root
//! - `search` ranks files by how many query words appear in the file name

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{Fingerprint, MediaFormat, MediaReference, RawMedia};
use crate::ports::{MediaCandidate, MediaError, MediaSource};

#[derive(Debug, Clone)]
pub struct LocalMediaSource {
    root: PathBuf,
}

fn io_error(path: &Path, err: std::io::Error) -> MediaError {
    match err.kind() {
        std::io::ErrorKind::NotFound => MediaError::NotFound(path.display().to_string()),
        _ => MediaError::Transient(format!("{}: {err}", path.display())),
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

impl LocalMediaSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Media files directly under the root (supported extensions only), sorted by name.
    async fn media_files(&self) -> Result<Vec<PathBuf>, MediaError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&self.root, e))? {
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| MediaFormat::from_extension(e).is_supported())
                .unwrap_or(false);
            if supported && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn resolve(&self, reference: &MediaReference) -> Result<PathBuf, MediaError> {
        if let Some(video_id) = reference.video_id() {
            return self
                .media_files()
                .await?
                .into_iter()
                .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(video_id))
                .ok_or_else(|| MediaError::NotFound(format!("no local download for {reference}")));
        }
        let path = Path::new(reference.as_str());
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }
}

#[async_trait]
impl MediaSource for LocalMediaSource {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MediaCandidate>, MediaError> {
        let wanted = words(query);
        let mut scored: Vec<(usize, PathBuf)> = self
            .media_files()
            .await?
            .into_iter()
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?.to_string();
                let have = words(&stem);
                let score = wanted.iter().filter(|w| have.contains(w)).count();
                (score > 0).then_some((score, path))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        debug!(query, hits = scored.len(), "local media search");

        scored
            .into_iter()
            .take(limit)
            .map(|(_, path)| {
                let relative = path.strip_prefix(&self.root).unwrap_or(&path);
                let title = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                MediaReference::parse(&relative.to_string_lossy())
                    .map(|reference| MediaCandidate { reference, title })
                    .map_err(|e| MediaError::Unsupported(e.to_string()))
            })
            .collect()
    }

    async fn fetch(&self, reference: &MediaReference) -> Result<RawMedia, MediaError> {
        let path = self.resolve(reference).await?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))?;
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .map(MediaFormat::from_extension)
            .unwrap_or(MediaFormat::Unknown);
        debug!(path = %path.display(), size = bytes.len(), "fetched local media");

        Ok(RawMedia {
            reference: reference.clone(),
            title: path.file_stem().and_then(|s| s.to_str()).map(str::to_string),
            content_hash: Fingerprint::of_bytes(&bytes),
            format,
            size_bytes: bytes.len() as u64,
            location: path.display().to_string(),
            duration_secs: None,
        })
    }
}
