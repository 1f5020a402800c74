//! Manifest-backed idempotency and lineage store.
//!
//! Layout inside the manifest bucket:
//!
//! ```text
//! manifests/{dataset_id}/stage_{n}/{YYYYMMDD_HHMMSS_ffffff}_{suffix}.json   lineage records
//! processed/{dataset_id}/stage_{n}/{object_key}.done                        idempotency markers
//! ```
//!
//! Markers are existence-only; the body is empty. Manifests are written once
//! and never edited.

use crate::store::{ObjectRef, ObjectStore, StoreError};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Manifest schema version written by this crate.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Errors from the manifest store.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to write processed marker {key}: {source}")]
    MarkerWrite {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to publish manifest {key}: {source}")]
    Publish {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Manifest {key} is not valid JSON: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Manifest {key} has unsupported schema version {version}")]
    UnsupportedVersion { key: String, version: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One output produced for one source object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub source_uri: String,
    pub output_uri: String,
    /// Stage-specific attributes (variant name, dimensions, ...)
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl OutputDescriptor {
    pub fn new(source: &ObjectRef, output: &ObjectRef) -> Self {
        Self {
            source_uri: source.uri(),
            output_uri: output.uri(),
            attributes: Map::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn output_ref(&self) -> Option<ObjectRef> {
        ObjectRef::parse_uri(&self.output_uri)
    }
}

fn default_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

/// RFC 3339, or an ISO 8601 timestamp without offset taken as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(at) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {:?}: {}", raw, e)))
}

/// Immutable lineage record.
///
/// Fields this version does not know about are kept in `extra` and written
/// back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub dataset_id: String,
    pub stage: u32,
    #[serde(alias = "timestamp", deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub object_count: usize,
    #[serde(default)]
    pub objects: Vec<OutputDescriptor>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    pub fn new(
        dataset_id: &str,
        stage: u32,
        objects: Vec<OutputDescriptor>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            dataset_id: dataset_id.to_string(),
            stage,
            created_at: Utc::now(),
            object_count: objects.len(),
            objects,
            metadata,
            extra: Map::new(),
        }
    }
}

/// Manifest key plus its remote modification time.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Idempotency markers and lineage manifests for every (dataset, stage).
#[derive(Clone)]
pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ManifestStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn manifest_prefix(dataset_id: &str, stage: u32) -> String {
        format!("manifests/{}/stage_{}/", dataset_id, stage)
    }

    pub fn marker_key(dataset_id: &str, stage: u32, object_key: &str) -> String {
        format!("processed/{}/stage_{}/{}.done", dataset_id, stage, object_key)
    }

    /// Time-ordered manifest key: lexical order equals creation order down to
    /// the microsecond; the random suffix keeps same-instant publishes apart.
    pub fn manifest_key(dataset_id: &str, stage: u32, at: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}{}_{}.json",
            Self::manifest_prefix(dataset_id, stage),
            at.format("%Y%m%d_%H%M%S_%6f"),
            &suffix[..8]
        )
    }

    /// Serialize and write a new manifest; returns its `s3://` locator.
    #[instrument(skip(self, objects, metadata), fields(objects = objects.len()))]
    pub async fn publish(
        &self,
        dataset_id: &str,
        stage: u32,
        objects: Vec<OutputDescriptor>,
        metadata: Map<String, Value>,
    ) -> Result<String, ManifestError> {
        let manifest = Manifest::new(dataset_id, stage, objects, metadata);
        let key = Self::manifest_key(dataset_id, stage, manifest.created_at);
        let body = serde_json::to_vec_pretty(&manifest).map_err(ManifestError::Serialize)?;

        self.store
            .put(&self.bucket, &key, Bytes::from(body))
            .await
            .map_err(|source| ManifestError::Publish {
                key: key.clone(),
                source,
            })?;

        let uri = ObjectRef::new(&self.bucket, &key).uri();
        info!(manifest = %uri, objects = manifest.object_count, "Published manifest");
        Ok(uri)
    }

    /// One existence check on the derived marker key.
    pub async fn is_processed(
        &self,
        dataset_id: &str,
        stage: u32,
        object_key: &str,
    ) -> Result<bool, StoreError> {
        let key = Self::marker_key(dataset_id, stage, object_key);
        self.store.exists(&self.bucket, &key).await
    }

    /// Write the processed marker. Call only once every output for the
    /// object is durably stored.
    #[instrument(skip(self))]
    pub async fn mark_processed(
        &self,
        dataset_id: &str,
        stage: u32,
        object_key: &str,
    ) -> Result<(), ManifestError> {
        let key = Self::marker_key(dataset_id, stage, object_key);
        self.store
            .put(&self.bucket, &key, Bytes::new())
            .await
            .map_err(|source| ManifestError::MarkerWrite {
                key: key.clone(),
                source,
            })?;

        debug!(marker = %key, "Marked processed");
        Ok(())
    }

    /// Remove a marker so the object is picked up again.
    #[instrument(skip(self))]
    pub async fn unmark(
        &self,
        dataset_id: &str,
        stage: u32,
        object_key: &str,
    ) -> Result<(), ManifestError> {
        let key = Self::marker_key(dataset_id, stage, object_key);
        self.store.delete(&self.bucket, &key).await?;
        info!(marker = %key, "Removed processed marker");
        Ok(())
    }

    /// Every manifest for (dataset, stage), oldest first.
    pub async fn history(
        &self,
        dataset_id: &str,
        stage: u32,
    ) -> Result<Vec<ManifestEntry>, ManifestError> {
        let prefix = Self::manifest_prefix(dataset_id, stage);
        let mut entries: Vec<ManifestEntry> = self
            .store
            .list(&self.bucket, &prefix)
            .await?
            .into_iter()
            .filter(|obj| obj.key.ends_with(".json"))
            .map(|obj| ManifestEntry {
                key: obj.key,
                last_modified: obj.last_modified,
            })
            .collect();

        entries.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    /// The most recently modified manifest for (dataset, stage), if any.
    #[instrument(skip(self))]
    pub async fn latest(
        &self,
        dataset_id: &str,
        stage: u32,
    ) -> Result<Option<Manifest>, ManifestError> {
        let Some(newest) = self.history(dataset_id, stage).await?.pop() else {
            return Ok(None);
        };

        self.load(&newest.key).await.map(Some)
    }

    /// Fetch and decode the manifest stored at `key`.
    pub async fn load(&self, key: &str) -> Result<Manifest, ManifestError> {
        let body = self.store.get(&self.bucket, key).await?;
        let manifest: Manifest =
            serde_json::from_slice(&body).map_err(|source| ManifestError::Malformed {
                key: key.to_string(),
                source,
            })?;

        if manifest.schema_version > MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                key: key.to_string(),
                version: manifest.schema_version,
            });
        }

        Ok(manifest)
    }
}
