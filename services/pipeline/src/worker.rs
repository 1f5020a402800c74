//! Stage control loop.
//!
//! One [`StageWorker`] drives one stage: it lists candidate objects, filters
//! out those already marked processed, stages each survivor locally, runs the
//! stage body, uploads the outputs, publishes a manifest and finally writes the
//! processed marker. Per-object failures are logged, counted and left for the
//! next cycle; only loop-level failures (listing the source) propagate.
//!
//! The marker is always the last remote write of an attempt. A crash anywhere
//! before it leaves the object eligible, so it is reprocessed on the next run
//! and its outputs are overwritten.

use crate::config::{PipelineStageConfig, StageConfig};
use crate::manifest::{ManifestError, ManifestStore, OutputDescriptor};
use crate::metrics::{report_capacity, MetricsSink};
use crate::stage::{StageBody, StageBodyError, StagedInput};
use crate::staging::{CapacityError, StagingArea, StagingError, StagingRole};
use crate::store::{ObjectRef, ObjectStore, StoreError};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that end a cycle (and, in poll mode, the process).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to list source objects: {0}")]
    Listing(#[source] StoreError),

    #[error("Failed to read upstream manifest: {0}")]
    UpstreamManifest(#[source] ManifestError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),
}

/// Why a single object attempt failed. Never escapes the cycle.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("Failed to download source object: {0}")]
    Download(#[source] StoreError),

    #[error("Stage body failed: {0}")]
    StageBody(#[from] StageBodyError),

    #[error("Failed to upload output {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to check processed marker: {0}")]
    MarkerCheck(#[source] StoreError),

    #[error("Failed to publish manifest: {0}")]
    Manifest(#[source] ManifestError),

    #[error(transparent)]
    MarkerWrite(ManifestError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),
}

impl ProcessError {
    /// Low-cardinality label used for the failure counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Capacity(_) => "capacity",
            Self::Download(_) => "download",
            Self::StageBody(_) => "stage_body",
            Self::Upload { .. } => "upload",
            Self::MarkerCheck(_) | Self::Manifest(_) => "manifest",
            Self::MarkerWrite(_) => "marker_write",
            Self::Staging(_) => "staging",
        }
    }
}

/// Observable position of the worker in its cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Listing,
    Filtering,
    Processing(String),
    Marking(String),
    Done,
}

/// Outcome of one object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ObjectOutcome {
    Processed {
        outputs: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        manifest: Option<String>,
    },
    Skipped,
    Failed {
        reason: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectResult {
    pub key: String,
    #[serde(flatten)]
    pub outcome: ObjectOutcome,
}

impl ObjectResult {
    fn failed(key: &str, err: &ProcessError) -> Self {
        Self {
            key: key.to_string(),
            outcome: ObjectOutcome::Failed {
                reason: err.reason().to_string(),
                error: err.to_string(),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ObjectOutcome::Failed { .. })
    }
}

/// Per-cycle summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Keys returned by the listing (or upstream manifest)
    pub listed: usize,
    /// Keys that passed the extension and processed filters
    pub candidates: usize,
    pub processed: usize,
    pub failed: usize,
    /// Keys already marked processed
    pub skipped: usize,
}

struct Committed {
    outputs: Vec<String>,
    manifest: Option<String>,
}

/// Drives one stage over its source objects.
pub struct StageWorker<B: StageBody> {
    config: StageConfig,
    label: String,
    store: Arc<dyn ObjectStore>,
    manifests: ManifestStore,
    staging: StagingArea,
    metrics: Arc<dyn MetricsSink>,
    body: B,
    state: RwLock<WorkerState>,
}

impl<B: StageBody> StageWorker<B> {
    /// Build a worker; creates the staging directories.
    pub fn new(
        config: &PipelineStageConfig,
        store: Arc<dyn ObjectStore>,
        body: B,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, StagingError> {
        let staging = StagingArea::new(&config.staging)?;
        let manifests = ManifestStore::new(store.clone(), &config.stage.manifest_bucket);

        Ok(Self {
            label: config.stage.label(),
            config: config.stage.clone(),
            store,
            manifests,
            staging,
            metrics,
            body,
            state: RwLock::new(WorkerState::Idle),
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state.read().clone()
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    /// Run cycles until `cancel` fires. Returns early only on loop-level errors.
    pub async fn poll(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!(
            stage = %self.label,
            body = self.body.name(),
            source = %ObjectRef::new(&self.config.source_bucket, &self.config.source_prefix),
            interval_secs = self.config.poll_interval_secs,
            "Starting poll loop"
        );

        while !cancel.is_cancelled() {
            self.run_cycle(&cancel).await?;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.set_state(WorkerState::Done);
        info!(stage = %self.label, "Poll loop stopped");
        Ok(())
    }

    /// One list / filter / process pass over the source.
    #[instrument(skip(self, cancel), fields(stage = %self.label))]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, WorkerError> {
        let mut report = CycleReport::default();

        let stale = self.staging.cleanup_transient().await?;
        if stale > 0 {
            warn!(removed = stale, "Removed stale staging files");
        }

        self.set_state(WorkerState::Listing);
        let keys = match self.list_source().await {
            Ok(keys) => keys,
            Err(e) => {
                self.set_state(WorkerState::Idle);
                return Err(e);
            }
        };
        report.listed = keys.len();

        self.set_state(WorkerState::Filtering);
        // Seen in this cycle only; the marker decides across cycles.
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for key in keys {
            if !self.config.accepts(&key) || !seen.insert(key.clone()) {
                continue;
            }
            match self
                .manifests
                .is_processed(&self.config.dataset_id, self.config.number, &key)
                .await
            {
                Ok(true) => report.skipped += 1,
                Ok(false) => candidates.push(key),
                Err(e) => {
                    let err = ProcessError::MarkerCheck(e);
                    warn!(key = %key, error = %err, "Could not check processed marker");
                    self.metrics.record_failed(&self.label, err.reason());
                    report.failed += 1;
                }
            }
        }
        report.candidates = candidates.len();

        for key in candidates {
            if cancel.is_cancelled() {
                info!("Cancelled between objects");
                break;
            }
            match self.process_object(&key).await {
                Ok(_) => report.processed += 1,
                Err(_) => report.failed += 1,
            }
        }

        self.set_state(WorkerState::Idle);
        info!(
            listed = report.listed,
            candidates = report.candidates,
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Batch mode: process exactly `keys`, in order, and report every outcome.
    /// Keys already marked processed are reported as skipped.
    #[instrument(skip(self, keys), fields(stage = %self.label, keys = keys.len()))]
    pub async fn run_once(&self, keys: &[String]) -> Result<Vec<ObjectResult>, WorkerError> {
        self.staging.cleanup_transient().await?;
        self.set_state(WorkerState::Filtering);

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let processed = self
                .manifests
                .is_processed(&self.config.dataset_id, self.config.number, key)
                .await;

            let result = match processed {
                Ok(true) => {
                    debug!(key = %key, "Already processed");
                    ObjectResult {
                        key: key.clone(),
                        outcome: ObjectOutcome::Skipped,
                    }
                }
                Ok(false) => match self.process_object(key).await {
                    Ok(committed) => ObjectResult {
                        key: key.clone(),
                        outcome: ObjectOutcome::Processed {
                            outputs: committed.outputs,
                            manifest: committed.manifest,
                        },
                    },
                    Err(e) => ObjectResult::failed(key, &e),
                },
                Err(e) => {
                    let err = ProcessError::MarkerCheck(e);
                    self.metrics.record_failed(&self.label, err.reason());
                    ObjectResult::failed(key, &err)
                }
            };
            results.push(result);
        }

        self.set_state(WorkerState::Done);
        Ok(results)
    }

    /// Candidate keys in listing order, or in upstream manifest order when
    /// the stage is fed by another stage's manifests.
    async fn list_source(&self) -> Result<Vec<String>, WorkerError> {
        let Some(upstream) = self.config.upstream_manifest_stage else {
            let listing = self
                .store
                .list(&self.config.source_bucket, &self.config.source_prefix)
                .await
                .map_err(WorkerError::Listing)?;
            return Ok(listing.into_iter().map(|obj| obj.key).collect());
        };

        // Every upstream manifest, oldest first: each one may describe a
        // single object, so the newest alone is not the full picture.
        let history = self
            .manifests
            .history(&self.config.dataset_id, upstream)
            .await
            .map_err(WorkerError::UpstreamManifest)?;
        if history.is_empty() {
            debug!(upstream = upstream, "No upstream manifest yet");
        }

        let mut listed = HashSet::new();
        let mut keys = Vec::new();
        for entry in history {
            let manifest = match self.manifests.load(&entry.key).await {
                Ok(manifest) => manifest,
                Err(e @ (ManifestError::Malformed { .. } | ManifestError::UnsupportedVersion { .. })) => {
                    warn!(manifest = %entry.key, error = %e, "Skipping unreadable upstream manifest");
                    continue;
                }
                Err(e) => return Err(WorkerError::UpstreamManifest(e)),
            };

            for output in manifest.objects.iter().filter_map(OutputDescriptor::output_ref) {
                if output.bucket == self.config.source_bucket
                    && output.key.starts_with(&self.config.source_prefix)
                    && listed.insert(output.key.clone())
                {
                    keys.push(output.key);
                }
            }
        }
        Ok(keys)
    }

    /// One full attempt: metrics, logging and staging cleanup around
    /// [`Self::attempt`].
    async fn process_object(&self, key: &str) -> Result<Committed, ProcessError> {
        self.set_state(WorkerState::Processing(key.to_string()));
        let started = Instant::now();

        let result = self.attempt(key).await;

        if let Err(e) = self.staging.cleanup_transient().await {
            warn!(key = %key, error = %e, "Failed to clean staging after attempt");
        }

        let seconds = started.elapsed().as_secs_f64();
        match &result {
            Ok(committed) => {
                self.metrics.record_duration(&self.label, "success", seconds);
                self.metrics.record_processed(&self.label, "success");
                info!(
                    key = %key,
                    outputs = committed.outputs.len(),
                    duration_secs = seconds,
                    "Processed object"
                );
            }
            Err(e) => {
                self.metrics.record_duration(&self.label, "failure", seconds);
                self.metrics.record_failed(&self.label, e.reason());
                error!(key = %key, reason = e.reason(), error = %e, "Failed to process object");
            }
        }
        result
    }

    async fn attempt(&self, key: &str) -> Result<Committed, ProcessError> {
        let source = ObjectRef::new(&self.config.source_bucket, key);

        let snapshot = self.staging.usage().map_err(|e| {
            warn!(error = %e, "Could not sample staging capacity");
            CapacityError {
                free_gb: 0.0,
                min_free_gb: self.staging.min_free_gb(),
            }
        })?;
        report_capacity(self.metrics.as_ref(), &snapshot);
        self.staging.check_capacity(&snapshot)?;

        let input = self.staging.path_for(StagingRole::Input, source.file_name());
        self.store
            .download(&source.bucket, &source.key, input.path())
            .await
            .map_err(ProcessError::Download)?;

        let sidecar = self.fetch_sidecar(&source).await?;
        let staged = StagedInput {
            source: source.clone(),
            local_path: input.path().to_path_buf(),
            sidecar,
            work_dir: self.staging.role_dir(StagingRole::Work),
            output_dir: self.staging.role_dir(StagingRole::Output),
        };

        let output = self.body.process(&staged).await?;
        input.release().await?;
        self.set_state(WorkerState::Marking(key.to_string()));

        let mut descriptors = Vec::with_capacity(output.outputs.len());
        for file in &output.outputs {
            let dest = ObjectRef::new(
                &self.config.destination_bucket,
                join_key(&self.config.destination_prefix, &file.relative_key),
            );
            self.store
                .upload(&file.local_path, &dest.bucket, &dest.key)
                .await
                .map_err(|source| ProcessError::Upload {
                    key: dest.key.clone(),
                    source,
                })?;
            descriptors
                .push(OutputDescriptor::new(&source, &dest).with_attributes(file.attributes.clone()));
        }
        let outputs: Vec<String> = descriptors.iter().map(|d| d.output_uri.clone()).collect();

        let manifest = if self.config.publish_manifest {
            let mut metadata = output.metadata;
            metadata.insert("stage_name".to_string(), Value::from(self.label.clone()));
            metadata.insert("source_uri".to_string(), Value::from(source.uri()));
            let uri = self
                .manifests
                .publish(&self.config.dataset_id, self.config.number, descriptors, metadata)
                .await
                .map_err(ProcessError::Manifest)?;
            Some(uri)
        } else {
            None
        };

        self.manifests
            .mark_processed(&self.config.dataset_id, self.config.number, key)
            .await
            .map_err(ProcessError::MarkerWrite)?;

        Ok(Committed { outputs, manifest })
    }

    /// Download and parse the sidecar next to `source`, if there is one.
    async fn fetch_sidecar(&self, source: &ObjectRef) -> Result<Option<Value>, ProcessError> {
        let Some(extension) = self
            .config
            .sidecar_extension
            .as_deref()
            .filter(|ext| !ext.is_empty())
        else {
            return Ok(None);
        };

        let key = sidecar_key(&source.key, extension);
        if key == source.key {
            return Ok(None);
        }
        let exists = self
            .store
            .exists(&source.bucket, &key)
            .await
            .map_err(ProcessError::Download)?;
        if !exists {
            return Ok(None);
        }

        let sidecar = ObjectRef::new(&source.bucket, key);
        let slot = self.staging.path_for(StagingRole::Input, sidecar.file_name());
        self.store
            .download(&sidecar.bucket, &sidecar.key, slot.path())
            .await
            .map_err(ProcessError::Download)?;

        let raw = tokio::fs::read(slot.path())
            .await
            .map_err(|source| StagingError::Io {
                path: slot.path().to_path_buf(),
                source,
            })?;
        let value: Value = serde_json::from_slice(&raw).map_err(|e| {
            StageBodyError::InvalidInput(format!("malformed sidecar {}: {}", sidecar, e))
        })?;

        slot.release().await?;
        debug!(sidecar = %sidecar, "Loaded sidecar");
        Ok(Some(value))
    }
}

/// `images/a.jpg` + `json` -> `images/a.json`.
fn sidecar_key(key: &str, extension: &str) -> String {
    let file_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);
    let stem_end = match key[file_start..].rfind('.') {
        Some(dot) if dot > 0 => file_start + dot,
        _ => key.len(),
    };
    format!("{}.{}", &key[..stem_end], extension)
}

fn join_key(prefix: &str, relative: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        format!("{prefix}{relative}")
    } else {
        format!("{prefix}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::create_test_config;
    use crate::manifest::Manifest;
    use crate::metrics::{MockMetricsSink, NoopMetrics};
    use crate::stage::{with_suffix, OutputFile, StageOutput};
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    /// Copies its input with an `_out` suffix; fails on configured file names.
    #[derive(Default)]
    struct ScriptedBody {
        fail_on: HashSet<String>,
        calls: Mutex<Vec<String>>,
        sidecars: Mutex<Vec<Option<Value>>>,
        leftovers: Mutex<Vec<std::path::PathBuf>>,
    }

    impl ScriptedBody {
        fn failing_on(names: &[&str]) -> Self {
            Self {
                fail_on: names.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl StageBody for ScriptedBody {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn process(&self, input: &StagedInput) -> Result<StageOutput, StageBodyError> {
            let name = input.source.file_name().to_string();
            self.calls.lock().push(name.clone());
            self.sidecars.lock().push(input.sidecar.clone());

            // Scratch file in the work role, expected to be cleaned afterwards
            let scratch = input.work_dir.join(format!("{name}.tmp"));
            std::fs::write(&scratch, b"scratch").unwrap();
            self.leftovers.lock().push(scratch);

            if self.fail_on.contains(&name) {
                return Err(StageBodyError::Failed(format!("cannot decode {name}")));
            }

            let out_name = with_suffix(&name, "_out");
            let out_path = input.output_dir.join(&out_name);
            std::fs::copy(&input.local_path, &out_path).unwrap();
            Ok(StageOutput {
                outputs: vec![OutputFile::new(out_path, out_name).with_attribute("ok", true)],
                ..Default::default()
            })
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<MemoryObjectStore>,
        config: PipelineStageConfig,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = create_test_config();
            config.staging.root = dir.path().join("nvme");
            Self {
                _dir: dir,
                store: Arc::new(MemoryObjectStore::new()),
                config,
            }
        }

        fn worker<B: StageBody>(&self, body: B) -> StageWorker<B> {
            self.worker_with_metrics(body, Arc::new(NoopMetrics))
        }

        fn worker_with_metrics<B: StageBody>(
            &self,
            body: B,
            metrics: Arc<dyn MetricsSink>,
        ) -> StageWorker<B> {
            StageWorker::new(&self.config, self.store.clone(), body, metrics).unwrap()
        }

        async fn seed(&self, key: &str) {
            self.store
                .put("image-raw", key, Bytes::from(format!("bytes of {key}")))
                .await
                .unwrap();
        }

        async fn mark(&self, key: &str) {
            self.store
                .put(
                    "manifest-store",
                    &ManifestStore::marker_key("ds", 1, key),
                    Bytes::new(),
                )
                .await
                .unwrap();
        }

        async fn is_marked(&self, key: &str) -> bool {
            self.store
                .exists("manifest-store", &ManifestStore::marker_key("ds", 1, key))
                .await
                .unwrap()
        }

        fn manifest_keys(&self) -> Vec<String> {
            self.store
                .keys("manifest-store")
                .into_iter()
                .filter(|k| k.starts_with("manifests/"))
                .collect()
        }

        fn staged_files(&self) -> Vec<std::path::PathBuf> {
            let mut files = Vec::new();
            for role in StagingRole::TRANSIENT {
                let dir = self.config.staging.root.join(role.as_str());
                for entry in std::fs::read_dir(dir).unwrap() {
                    let path = entry.unwrap().path();
                    if path.is_file() {
                        files.push(path);
                    }
                }
            }
            files
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_prefix_writes_nothing() {
        let harness = Harness::new();
        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());

        let report = worker.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert!(body.calls().is_empty());
        assert_eq!(harness.store.call_count("put"), 0);
        assert_eq!(harness.store.call_count("upload"), 0);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_only_unprocessed_objects_are_processed() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        harness.seed("images/b.jpg").await;
        harness.mark("images/b.jpg").await;

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        let report = worker.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(body.calls(), vec!["a.jpg"]);
        assert_eq!(report.listed, 2);
        assert_eq!(report.candidates, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);

        assert!(harness.is_marked("images/a.jpg").await);
        assert_eq!(
            harness.store.get("image-augmented", "augmented/a_out.jpg").await.unwrap(),
            Bytes::from("bytes of images/a.jpg")
        );

        let manifest: Manifest = serde_json::from_slice(
            &harness
                .store
                .get("manifest-store", &harness.manifest_keys()[0])
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.dataset_id, "ds");
        assert_eq!(manifest.stage, 1);
        assert_eq!(manifest.object_count, 1);
        assert_eq!(manifest.objects[0].source_uri, "s3://image-raw/images/a.jpg");
        assert_eq!(
            manifest.objects[0].output_uri,
            "s3://image-augmented/augmented/a_out.jpg"
        );
        assert_eq!(manifest.objects[0].attributes["ok"], true);
        assert_eq!(manifest.metadata["stage_name"], "stage1");
    }

    #[tokio::test]
    async fn test_body_failure_is_isolated() {
        let harness = Harness::new();
        for key in ["images/a.jpg", "images/c.jpg", "images/d.jpg"] {
            harness.seed(key).await;
        }

        let mut metrics = MockMetricsSink::new();
        metrics
            .expect_record_failed()
            .withf(|stage, reason| stage == "stage1" && reason == "stage_body")
            .times(1)
            .return_const(());
        metrics
            .expect_record_processed()
            .withf(|stage, status| stage == "stage1" && status == "success")
            .times(2)
            .return_const(());
        metrics.expect_record_duration().times(3).return_const(());
        metrics.expect_update_disk_usage().return_const(());

        let body = Arc::new(ScriptedBody::failing_on(&["c.jpg"]));
        let worker = harness.worker_with_metrics(body.clone(), Arc::new(metrics));
        let report = worker.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(body.calls(), vec!["a.jpg", "c.jpg", "d.jpg"]);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert!(harness.is_marked("images/a.jpg").await);
        assert!(!harness.is_marked("images/c.jpg").await);
        assert!(harness.is_marked("images/d.jpg").await);
        assert_eq!(harness.manifest_keys().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_object_is_retried_next_cycle() {
        let harness = Harness::new();
        harness.seed("images/c.jpg").await;

        let worker = harness.worker(Arc::new(ScriptedBody::failing_on(&["c.jpg"])));
        let cancel = CancellationToken::new();
        assert_eq!(worker.run_cycle(&cancel).await.unwrap().failed, 1);
        assert_eq!(worker.run_cycle(&cancel).await.unwrap().candidates, 1);
    }

    #[tokio::test]
    async fn test_second_cycle_does_not_reinvoke_body() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        let cancel = CancellationToken::new();
        worker.run_cycle(&cancel).await.unwrap();
        let second = worker.run_cycle(&cancel).await.unwrap();

        assert_eq!(body.calls().len(), 1);
        assert_eq!(second.candidates, 0);
        assert_eq!(second.skipped, 1);

        // A fresh worker (a restart) relies on the marker alone.
        let restarted_body = Arc::new(ScriptedBody::default());
        let restarted = harness.worker(restarted_body.clone());
        let report = restarted.run_cycle(&cancel).await.unwrap();
        assert!(restarted_body.calls().is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_unwritten_marker_causes_reprocessing() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        harness.store.fail_writes_under("processed/");

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        let cancel = CancellationToken::new();

        let results = worker.run_once(&keys(&["images/a.jpg"])).await.unwrap();
        match &results[0].outcome {
            ObjectOutcome::Failed { reason, .. } => assert_eq!(reason, "marker_write"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Output landed but the object is still unprocessed
        assert!(harness
            .store
            .exists("image-augmented", "augmented/a_out.jpg")
            .await
            .unwrap());
        assert!(!harness.is_marked("images/a.jpg").await);

        harness.store.heal();
        let report = worker.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(body.calls(), vec!["a.jpg", "a.jpg"]);
        assert!(harness.is_marked("images/a.jpg").await);
    }

    #[tokio::test]
    async fn test_capacity_floor_blocks_staging() {
        let mut harness = Harness::new();
        harness.config.staging.min_free_gb = f64::MAX;
        harness.seed("images/a.jpg").await;

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        assert!(!worker.staging().admit());

        let results = worker.run_once(&keys(&["images/a.jpg"])).await.unwrap();

        match &results[0].outcome {
            ObjectOutcome::Failed { reason, .. } => assert_eq!(reason, "capacity"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(harness.store.call_count("download"), 0);
        assert!(body.calls().is_empty());
        assert!(harness.staged_files().is_empty());
    }

    #[tokio::test]
    async fn test_staging_is_empty_after_every_attempt() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        harness.seed("images/c.jpg").await;

        let body = Arc::new(ScriptedBody::failing_on(&["c.jpg"]));
        let worker = harness.worker(body.clone());
        worker.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(body.leftovers.lock().len(), 2);
        assert!(harness.staged_files().is_empty());
    }

    #[tokio::test]
    async fn test_stale_slots_are_removed_at_cycle_start() {
        let harness = Harness::new();
        let worker = harness.worker(Arc::new(ScriptedBody::default()));
        let stale = harness.config.staging.root.join("input").join("stale.jpg");
        std::fs::write(&stale, b"left by a crash").unwrap();
        let cached = harness.config.staging.root.join("cache").join("model.bin");
        std::fs::write(&cached, b"weights").unwrap();

        worker.run_cycle(&CancellationToken::new()).await.unwrap();

        assert!(!stale.exists());
        assert!(cached.exists());
    }

    #[tokio::test]
    async fn test_batch_reports_every_key() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        harness.seed("images/b.jpg").await;
        harness.mark("images/b.jpg").await;

        let worker = harness.worker(Arc::new(ScriptedBody::default()));
        let results = worker
            .run_once(&keys(&["images/a.jpg", "images/b.jpg", "images/missing.jpg"]))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        match &results[0].outcome {
            ObjectOutcome::Processed { outputs, manifest } => {
                assert_eq!(outputs, &vec!["s3://image-augmented/augmented/a_out.jpg".to_string()]);
                assert!(manifest.as_deref().unwrap().starts_with("s3://manifest-store/manifests/ds/stage_1/"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(results[1].outcome, ObjectOutcome::Skipped);
        assert!(results[2].is_failed());
        assert_eq!(worker.state(), WorkerState::Done);

        let rendered = serde_json::to_value(&results[1]).unwrap();
        assert_eq!(rendered, json!({"key": "images/b.jpg", "status": "skipped"}));
        let rendered = serde_json::to_value(&results[2]).unwrap();
        assert_eq!(rendered["status"], "failed");
        assert_eq!(rendered["reason"], "download");
    }

    #[tokio::test]
    async fn test_extension_filter_excludes_sidecars() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        harness
            .store
            .put("image-raw", "images/a.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        harness.seed("images/readme.txt").await;

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        let report = worker.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.listed, 3);
        assert_eq!(report.candidates, 1);
        assert_eq!(body.calls(), vec!["a.jpg"]);
    }

    #[tokio::test]
    async fn test_sidecar_is_passed_to_body() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        harness
            .store
            .put("image-raw", "images/a.json", Bytes::from(r#"{"boxes": [1, 2]}"#))
            .await
            .unwrap();
        harness.seed("images/b.jpg").await;

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        worker.run_cycle(&CancellationToken::new()).await.unwrap();

        let sidecars = body.sidecars.lock().clone();
        assert_eq!(sidecars, vec![Some(json!({"boxes": [1, 2]})), None]);
    }

    #[tokio::test]
    async fn test_malformed_sidecar_fails_attempt() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        harness
            .store
            .put("image-raw", "images/a.json", Bytes::from_static(b"{not json"))
            .await
            .unwrap();

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        let results = worker.run_once(&keys(&["images/a.jpg"])).await.unwrap();

        match &results[0].outcome {
            ObjectOutcome::Failed { reason, .. } => assert_eq!(reason, "stage_body"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(body.calls().is_empty());
        assert!(harness.staged_files().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_manifest_drives_candidates() {
        let mut harness = Harness::new();
        harness.config.stage.number = 2;
        harness.config.stage.upstream_manifest_stage = Some(1);
        harness.config.stage.source_bucket = "image-augmented".to_string();
        harness.config.stage.source_prefix = "augmented/".to_string();
        harness.config.stage.destination_bucket = "image-resized".to_string();
        harness.config.stage.destination_prefix = "resized/".to_string();

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        let cancel = CancellationToken::new();

        // Nothing published upstream yet
        assert_eq!(worker.run_cycle(&cancel).await.unwrap().listed, 0);

        for key in ["augmented/x_aug.jpg", "augmented/y_aug.jpg", "augmented/unlisted.jpg"] {
            harness.store.put("image-augmented", key, Bytes::from_static(b"px")).await.unwrap();
        }
        let objects = ["x_aug.jpg", "y_aug.jpg"]
            .iter()
            .map(|name| {
                OutputDescriptor::new(
                    &ObjectRef::new("image-raw", format!("images/{name}")),
                    &ObjectRef::new("image-augmented", format!("augmented/{name}")),
                )
            })
            .collect();
        worker
            .manifests()
            .publish("ds", 1, objects, Default::default())
            .await
            .unwrap();

        let report = worker.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.listed, 2);
        assert_eq!(body.calls(), vec!["x_aug.jpg", "y_aug.jpg"]);
        assert!(harness
            .store
            .exists("image-resized", "resized/x_aug_out.jpg")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_downstream_stage_sees_every_upstream_object() {
        let harness = Harness::new();
        for key in ["images/a.jpg", "images/b.jpg", "images/c.jpg"] {
            harness.seed(key).await;
        }
        let cancel = CancellationToken::new();

        let stage1 = harness.worker(Arc::new(ScriptedBody::default()));
        assert_eq!(stage1.run_cycle(&cancel).await.unwrap().processed, 3);

        // An unreadable manifest upstream does not hide the others
        harness
            .store
            .put(
                "manifest-store",
                "manifests/ds/stage_1/broken.json",
                Bytes::from_static(b"{not json"),
            )
            .await
            .unwrap();

        let mut config = harness.config.clone();
        config.stage.number = 2;
        config.stage.upstream_manifest_stage = Some(1);
        config.stage.source_bucket = "image-augmented".to_string();
        config.stage.source_prefix = "augmented/".to_string();
        config.stage.destination_bucket = "image-resized".to_string();
        config.stage.destination_prefix = "resized/".to_string();

        let body = Arc::new(ScriptedBody::default());
        let stage2 =
            StageWorker::new(&config, harness.store.clone(), body.clone(), Arc::new(NoopMetrics))
                .unwrap();

        let first = stage2.run_cycle(&cancel).await.unwrap();
        assert_eq!(first.listed, 3);
        assert_eq!(first.processed, 3);
        assert_eq!(body.calls(), vec!["a_out.jpg", "b_out.jpg", "c_out.jpg"]);

        let second = stage2.run_cycle(&cancel).await.unwrap();
        assert_eq!(second.listed, 3);
        assert_eq!(second.candidates, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(body.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_unmarked_object_is_reprocessed_by_running_worker() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;

        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());
        let cancel = CancellationToken::new();
        worker.run_cycle(&cancel).await.unwrap();

        worker.manifests().unmark("ds", 1, "images/a.jpg").await.unwrap();
        let report = worker.run_cycle(&cancel).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(body.calls(), vec!["a.jpg", "a.jpg"]);
        assert!(harness.is_marked("images/a.jpg").await);
    }

    #[tokio::test]
    async fn test_refused_admission_reports_disk_usage() {
        let mut harness = Harness::new();
        harness.config.staging.min_free_gb = f64::MAX;
        harness.seed("images/a.jpg").await;

        let mut metrics = MockMetricsSink::new();
        metrics.expect_update_disk_usage().times(1).return_const(());
        metrics
            .expect_record_failed()
            .withf(|stage, reason| stage == "stage1" && reason == "capacity")
            .times(1)
            .return_const(());
        metrics
            .expect_record_duration()
            .withf(|_, status, _| status == "failure")
            .times(1)
            .return_const(());
        metrics.expect_record_processed().never();

        let worker = harness.worker_with_metrics(Arc::new(ScriptedBody::default()), Arc::new(metrics));
        let results = worker.run_once(&keys(&["images/a.jpg"])).await.unwrap();

        assert!(results[0].is_failed());
        assert_eq!(harness.store.call_count("download"), 0);
    }

    /// Leaves a directory where the staged input was, so releasing it fails.
    struct PinnedInputBody;

    #[async_trait]
    impl StageBody for PinnedInputBody {
        fn name(&self) -> &str {
            "pinned-input"
        }

        async fn process(&self, input: &StagedInput) -> Result<StageOutput, StageBodyError> {
            std::fs::remove_file(&input.local_path).unwrap();
            std::fs::create_dir(&input.local_path).unwrap();
            std::fs::write(input.local_path.join("pinned"), b"x").unwrap();
            Ok(StageOutput::default())
        }
    }

    #[tokio::test]
    async fn test_release_failure_is_reported_before_marking() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;

        let worker = harness.worker(PinnedInputBody);
        let results = worker.run_once(&keys(&["images/a.jpg"])).await.unwrap();

        match &results[0].outcome {
            ObjectOutcome::Failed { reason, .. } => assert_eq!(reason, "staging"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!harness.is_marked("images/a.jpg").await);
        assert!(harness.manifest_keys().is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_ends_cycle() {
        let harness = Harness::new();
        harness.store.fail_listing(true);
        let worker = harness.worker(Arc::new(ScriptedBody::default()));

        let err = worker.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Listing(_)));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_processes_nothing() {
        let harness = Harness::new();
        harness.seed("images/a.jpg").await;
        let body = Arc::new(ScriptedBody::default());
        let worker = harness.worker(body.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = worker.run_cycle(&cancel).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.processed, 0);
        assert!(body.calls().is_empty());
    }

    #[tokio::test]
    async fn test_poll_stops_on_cancel() {
        let mut harness = Harness::new();
        harness.config.stage.poll_interval_secs = 3600;
        harness.seed("images/a.jpg").await;

        let body = Arc::new(ScriptedBody::default());
        let worker = Arc::new(harness.worker(body.clone()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.poll(cancel).await }
        });

        while !harness.is_marked("images/a.jpg").await {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
        assert_eq!(body.calls(), vec!["a.jpg"]);
    }

    #[tokio::test]
    async fn test_manifest_publishing_can_be_disabled() {
        let mut harness = Harness::new();
        harness.config.stage.publish_manifest = false;
        harness.seed("images/a.jpg").await;

        let worker = harness.worker(Arc::new(ScriptedBody::default()));
        let results = worker.run_once(&keys(&["images/a.jpg"])).await.unwrap();

        assert!(matches!(
            &results[0].outcome,
            ObjectOutcome::Processed { manifest: None, .. }
        ));
        assert!(harness.manifest_keys().is_empty());
        assert!(harness.is_marked("images/a.jpg").await);
    }

    #[test]
    fn test_sidecar_key() {
        assert_eq!(sidecar_key("images/a.jpg", "json"), "images/a.json");
        assert_eq!(sidecar_key("images/a.b.png", "json"), "images/a.b.json");
        assert_eq!(sidecar_key("images.v2/a", "json"), "images.v2/a.json");
        assert_eq!(sidecar_key("a.jpg", "txt"), "a.txt");
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("augmented/", "a.jpg"), "augmented/a.jpg");
        assert_eq!(join_key("augmented", "a.jpg"), "augmented/a.jpg");
        assert_eq!(join_key("", "a.jpg"), "a.jpg");
    }

    #[test]
    fn test_failure_reasons() {
        let err = ProcessError::StageBody(StageBodyError::Failed("x".to_string()));
        assert_eq!(err.reason(), "stage_body");
        let err = ProcessError::Download(StoreError::Timeout("t".to_string()));
        assert_eq!(err.reason(), "download");
        let err = ProcessError::Capacity(CapacityError {
            free_gb: 1.0,
            min_free_gb: 100.0,
        });
        assert_eq!(err.reason(), "capacity");
    }
}
