//! Ports - 抽象化レイヤー
//!
//! 外部システム（メディア取得、音声認識、意味検索、文章生成、永続化）への
//! インターフェース。実装は `impls` と `store` にある。

pub mod artifact_store;
pub mod clock;
pub mod collaborators;
pub mod id_generator;
pub mod state_store;

pub use self::artifact_store::ArtifactStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::collaborators::{
    Embedder, Embedding, ExemplarHit, ExplainError, ExplainRequest, Explainer, IndexError,
    MediaCandidate, MediaError, MediaSource, SemanticIndex, TranscribeError, Transcriber,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::state_store::{ChangeSet, IdempotencyRecord, StateStore, StoreError};
