//! Implementations of the collaborator ports that run without network access.

pub mod catalog_explainer;
pub mod exemplar_index;
pub mod local_media;
pub mod sidecar_transcriber;

pub use catalog_explainer::CatalogExplainer;
pub use exemplar_index::InMemoryExemplarIndex;
pub use local_media::LocalMediaSource;
pub use sidecar_transcriber::SidecarTranscriber;
