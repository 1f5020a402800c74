//! Configuration management for a pipeline stage worker.
//!
//! A stage worker is configured once at startup and the resulting
//! [`PipelineStageConfig`] is passed by reference into every component
//! constructor. Nothing below this module reads the process environment.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for one stage instance.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineStageConfig {
    /// Service-level configuration (logging, metrics exporter)
    #[serde(default)]
    pub service: ServiceConfig,

    /// Object store connection configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Local staging area configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Stage identity and source/destination locations
    pub stage: StageConfig,

    /// Stage body selection
    #[serde(default)]
    pub body: BodyConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Install the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which object store implementation backs the worker.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    S3,
    /// In-process store, useful for dry runs
    Memory,
}

/// Object store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Custom endpoint URL (MinIO, LocalStack, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Static access key; the default provider chain is used when unset
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Attempts per operation, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Per-operation timeout in seconds
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

/// Local staging area configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Root of the staging directory tree
    #[serde(default = "default_staging_root")]
    pub root: PathBuf,

    /// Minimum free space in GiB required to admit new work
    #[serde(default = "default_min_free_gb")]
    pub min_free_gb: f64,
}

/// Stage identity and data locations.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Position of this stage in the pipeline (1-based)
    pub number: u32,

    /// Human-readable stage name, used as the metrics label
    #[serde(default)]
    pub name: Option<String>,

    /// Dataset this worker processes
    #[serde(default = "default_dataset_id")]
    pub dataset_id: String,

    pub source_bucket: String,

    #[serde(default)]
    pub source_prefix: String,

    pub destination_bucket: String,

    #[serde(default)]
    pub destination_prefix: String,

    /// Bucket holding manifests and processed markers
    #[serde(default = "default_manifest_bucket")]
    pub manifest_bucket: String,

    /// Seconds to sleep between poll cycles
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// File extensions accepted as candidates (without the dot)
    #[serde(default = "default_accepted_extensions")]
    pub accepted_extensions: Vec<String>,

    /// Publish a manifest for every processed object
    #[serde(default = "default_true")]
    pub publish_manifest: bool,

    /// Extension of the optional sidecar annotation next to each object
    #[serde(default = "default_sidecar_extension")]
    pub sidecar_extension: Option<String>,

    /// Read candidates from this stage's latest manifest instead of listing
    #[serde(default)]
    pub upstream_manifest_stage: Option<u32>,
}

/// Which stage body the worker runs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyConfig {
    /// Copy the input to the output role unchanged
    Passthrough {
        #[serde(default)]
        suffix: String,
    },
    /// Run an external program per object
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_command_timeout_secs")]
        timeout_secs: u64,
    },
}

// Default value functions
fn default_service_name() -> String {
    "stage-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("/mnt/nvme")
}

fn default_min_free_gb() -> f64 {
    100.0
}

fn default_dataset_id() -> String {
    "default".to_string()
}

fn default_manifest_bucket() -> String {
    "manifest-store".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_accepted_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

fn default_sidecar_extension() -> Option<String> {
    Some("json".to_string())
}

fn default_command_timeout_secs() -> u64 {
    600
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoint_url: None,
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: default_staging_root(),
            min_free_gb: default_min_free_gb(),
        }
    }
}

impl Default for BodyConfig {
    fn default() -> Self {
        BodyConfig::Passthrough {
            suffix: String::new(),
        }
    }
}

fn environment() -> Environment {
    // PIPELINE__STAGE__SOURCE_BUCKET -> stage.source_bucket
    Environment::with_prefix("PIPELINE")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("stage.accepted_extensions")
        .with_list_parse_key("body.args")
}

impl PipelineStageConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/default.toml`
    /// 2. `config/{RUN_MODE}.toml`
    /// 3. `/etc/stage-pipeline/stage.toml`
    /// 4. Environment variables prefixed with `PIPELINE__`
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(File::with_name("/etc/stage-pipeline/stage").required(false))
            .add_source(environment())
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let stage = &self.stage;

        if stage.number == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stage.number".to_string(),
                message: "stage numbers start at 1".to_string(),
            });
        }

        for (field, value) in [
            ("stage.dataset_id", &stage.dataset_id),
            ("stage.source_bucket", &stage.source_bucket),
            ("stage.destination_bucket", &stage.destination_bucket),
            ("stage.manifest_bucket", &stage.manifest_bucket),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigValidationError::MissingField(field.to_string()));
            }
        }

        if stage.poll_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stage.poll_interval_secs".to_string(),
                message: "poll interval must be greater than 0".to_string(),
            });
        }

        if stage.accepted_extensions.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "stage.accepted_extensions".to_string(),
            ));
        }

        if !self.staging.min_free_gb.is_finite() || self.staging.min_free_gb < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "staging.min_free_gb".to_string(),
                message: "floor must be a non-negative number".to_string(),
            });
        }

        if self.store.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.max_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }

        if self.store.access_key_id.is_some() != self.store.secret_access_key.is_some() {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.access_key_id/secret_access_key".to_string(),
                message: "both or neither must be set".to_string(),
            });
        }

        if let BodyConfig::Command { program, .. } = &self.body {
            if program.trim().is_empty() {
                return Err(ConfigValidationError::MissingField("body.program".to_string()));
            }
        }

        Ok(())
    }
}

impl StageConfig {
    /// Label used for logs and metrics, e.g. `stage2`.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("stage{}", self.number))
    }

    /// Get poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Whether `key` carries one of the accepted extensions (case-insensitive).
    pub fn accepts(&self, key: &str) -> bool {
        let Some((_, ext)) = key.rsplit_once('.') else {
            return false;
        };
        if ext.contains('/') {
            return false;
        }
        self.accepted_extensions
            .iter()
            .any(|accepted| accepted.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

impl StoreConfig {
    /// Get base retry delay as Duration.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Get maximum retry delay as Duration.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Get operation timeout as Duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
