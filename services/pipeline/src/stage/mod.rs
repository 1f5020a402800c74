//! Stage bodies: the per-stage transformation the worker drives.
//!
//! The worker stages the source object locally, hands a [`StagedInput`] to the
//! body and uploads whatever files the returned [`StageOutput`] lists. Bodies
//! never talk to the object store themselves.

mod command;
mod passthrough;

pub use command::CommandStage;
pub use passthrough::PassthroughStage;

use crate::config::BodyConfig;
use crate::store::ObjectRef;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a stage body. Always isolated to one object.
#[derive(Error, Debug)]
pub enum StageBodyError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transformation failed: {0}")]
    Failed(String),

    #[error("Stage body timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error in stage body at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a body needs to process one object.
#[derive(Debug, Clone)]
pub struct StagedInput {
    /// Where the object came from
    pub source: ObjectRef,
    /// Local copy of the object in the `input` role
    pub local_path: PathBuf,
    /// Parsed sidecar annotation, if one accompanies the object
    pub sidecar: Option<Value>,
    /// Scratch directory (`work` role)
    pub work_dir: PathBuf,
    /// Directory for produced files (`output` role)
    pub output_dir: PathBuf,
}

/// One file produced by a body.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFile {
    /// Local file to upload
    pub local_path: PathBuf,
    /// Destination path relative to the stage's destination prefix
    pub relative_key: String,
    /// Attributes recorded in the manifest entry
    pub attributes: Map<String, Value>,
}

impl OutputFile {
    pub fn new(local_path: impl Into<PathBuf>, relative_key: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            relative_key: relative_key.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful body invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub outputs: Vec<OutputFile>,
    /// Free-form result metadata, merged into the manifest metadata
    pub metadata: Map<String, Value>,
}

/// A single stage's transformation.
#[async_trait]
pub trait StageBody: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    async fn process(&self, input: &StagedInput) -> Result<StageOutput, StageBodyError>;
}

#[async_trait]
impl<B: StageBody + ?Sized> StageBody for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn process(&self, input: &StagedInput) -> Result<StageOutput, StageBodyError> {
        (**self).process(input).await
    }
}

/// Build the body selected by configuration.
pub fn from_config(config: &BodyConfig) -> Arc<dyn StageBody> {
    match config {
        BodyConfig::Passthrough { suffix } => Arc::new(PassthroughStage::new(suffix.clone())),
        BodyConfig::Command {
            program,
            args,
            timeout_secs,
        } => Arc::new(CommandStage::new(
            program.clone(),
            args.clone(),
            Duration::from_secs(*timeout_secs),
        )),
    }
}

/// Insert `suffix` before the extension: `a.jpg` + `_aug` -> `a_aug.jpg`.
pub fn with_suffix(file_name: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return file_name.to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}{suffix}.{ext}"),
        _ => format!("{file_name}{suffix}"),
    }
}
