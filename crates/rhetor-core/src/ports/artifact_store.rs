//! ArtifactStore port - content-addressed artifacts.
//!
//! Artifacts are immutable: a put for an existing fingerprint is a no-op.

use async_trait::async_trait;

use super::state_store::StoreError;
use crate::domain::{Artifact, Fingerprint};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Returns `true` if the artifact was newly written.
    async fn put(&self, artifact: &Artifact) -> Result<bool, StoreError>;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>, StoreError>;
}
