//! rhetor-core
//!
//! Spoken-media rhetoric pipeline: ingest → transcribe → analyze.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, request, artifact, job / task record, state, errors, decision）
//! - **ports**: 抽象化レイヤー（StateStore, ArtifactStore, MediaSource, Transcriber, SemanticIndex, Explainer, Clock）
//! - **coordinator**: ジョブ状態機械、スケジューラ、worker pool、builder
//! - **worker**: stage ごとの handler と共通の StageWorker（冪等性・タイムアウト・保存）
//! - **idempotency**: stage 結果のキャッシュとロック
//! - **engine**: パターン検出（ルール層 + 検索層 + マージ + 説明）
//! - **aggregator**: 読み出し API の組み立て
//! - **store**: InMemoryStore / SqliteStore
//! - **impls**: ネットワーク不要の collaborator 実装
//! - **config**: PipelineConfig（TOML + 環境変数）

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod idempotency;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{JobOutput, ResultAggregator};
pub use config::PipelineConfig;
pub use coordinator::{BuildError, Coordinator, CoordinatorBuilder, CoordinatorError, WorkerPool};
pub use domain::{JobId, JobRequest, JobState, JobStatus, StageKind};
pub use observability::PipelineCounts;
