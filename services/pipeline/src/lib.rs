//! Stage Pipeline - restart-safe staged object processing over S3
//!
//! Moves objects (images plus optional JSON sidecars) through an ordered
//! sequence of stages. Each stage reads from one bucket/prefix, transforms the
//! object with a pluggable stage body and writes the results to another
//! bucket/prefix. Completion is recorded as a marker in the manifest bucket, so
//! a restarted worker never skips unfinished work and never redoes finished work.
//!
//! ## Architecture
//!
//! ```text
//!  source bucket          stage worker                  destination bucket
//! ┌──────────────┐   ┌───────────────────────┐        ┌──────────────┐
//! │ images/      │──▶│ list ─▶ filter ─▶     │───────▶│ augmented/   │
//! └──────────────┘   │ stage ─▶ body ─▶      │        └──────────────┘
//!                    │ upload ─▶ mark        │
//!                    └──────────┬────────────┘
//!                               │
//!                ┌──────────────┴──────────────┐
//!                ▼                             ▼
//!        ┌──────────────┐              ┌──────────────┐
//!        │ staging area │              │ manifest     │
//!        │ /mnt/nvme    │              │ store        │
//!        └──────────────┘              └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use stage_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineStageConfig::load()?;
//!     let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.store).await?);
//!     let body = PassthroughStage::new("_aug");
//!
//!     let worker = StageWorker::new(&config, store, body, Arc::new(NoopMetrics))?;
//!     let report = worker.run_cycle(&CancellationToken::new()).await?;
//!     println!("processed {}", report.processed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod manifest;
pub mod metrics;
pub mod stage;
pub mod staging;
pub mod store;
pub mod worker;

// Re-export main types
pub use config::{
    BodyConfig, ConfigValidationError, PipelineStageConfig, ServiceConfig, StageConfig,
    StagingConfig, StoreBackend, StoreConfig,
};
pub use manifest::{Manifest, ManifestEntry, ManifestError, ManifestStore, OutputDescriptor};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use stage::{
    CommandStage, OutputFile, PassthroughStage, StageBody, StageBodyError, StageOutput,
    StagedInput,
};
pub use staging::{CapacityError, CapacitySnapshot, StagingArea, StagingError, StagingRole, StagingSlot};
pub use store::{
    MemoryObjectStore, ObjectInfo, ObjectRef, ObjectStore, RetryPolicy, S3ObjectStore, StoreError,
};
pub use worker::{
    CycleReport, ObjectOutcome, ObjectResult, ProcessError, StageWorker, WorkerError, WorkerState,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PipelineStageConfig;
    pub use crate::manifest::ManifestStore;
    pub use crate::metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
    pub use crate::stage::{CommandStage, PassthroughStage, StageBody, StagedInput, StageOutput};
    pub use crate::store::{MemoryObjectStore, ObjectStore, S3ObjectStore};
    pub use crate::worker::{CycleReport, ObjectResult, StageWorker};
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
