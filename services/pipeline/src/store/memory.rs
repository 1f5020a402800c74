use super::{partial_path, ObjectInfo, ObjectRef, ObjectStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    last_modified: DateTime<Utc>,
}

/// In-process [`ObjectStore`].
///
/// Keys are kept in lexical order per bucket, matching how S3 returns listings.
/// Modification timestamps are strictly increasing across writes. Writes under
/// a registered failure prefix are rejected with a transient error and leave
/// the stored state untouched.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
    clock: Mutex<Option<DateTime<Utc>>>,
    failing_write_prefixes: RwLock<Vec<String>>,
    failing_list: RwLock<bool>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every `put`/`upload` whose key starts with `prefix`.
    pub fn fail_writes_under(&self, prefix: impl Into<String>) {
        self.failing_write_prefixes.write().push(prefix.into());
    }

    /// Make every `list` call fail.
    pub fn fail_listing(&self, fail: bool) {
        *self.failing_list.write() = fail;
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        self.failing_write_prefixes.write().clear();
        *self.failing_list.write() = false;
    }

    /// Number of times `operation` was invoked (`put`, `get`, `list`, ...).
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn reset_call_counts(&self) {
        self.calls.lock().clear();
    }

    /// All keys currently stored in `bucket`, in lexical order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn record(&self, operation: &'static str) {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut last = self.clock.lock();
        let now = Utc::now();
        let next = match *last {
            Some(previous) if now <= previous => previous + ChronoDuration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }

    fn check_write(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let failing = self.failing_write_prefixes.read();
        if failing.iter().any(|prefix| key.starts_with(prefix.as_str())) {
            return Err(StoreError::Transient(format!(
                "injected write failure for s3://{bucket}/{key}"
            )));
        }
        Ok(())
    }

    fn insert(&self, bucket: &str, key: &str, body: Bytes) {
        let last_modified = self.tick();
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                last_modified,
            },
        );
    }

    fn lookup(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| obj.body.clone())
            .ok_or_else(|| StoreError::NotFound(ObjectRef::new(bucket, key)))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.record("put");
        self.check_write(bucket, key)?;
        self.insert(bucket, key, body);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        self.record("get");
        self.lookup(bucket, key)
    }

    async fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.record("upload");
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| StoreError::local_io(local_path, e))?;
        self.check_write(bucket, key)?;
        self.insert(bucket, key, Bytes::from(data));
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StoreError> {
        self.record("download");
        let data = self.lookup(bucket, key)?;

        let partial = partial_path(local_path);
        if let Err(e) = tokio::fs::write(&partial, &data).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(StoreError::local_io(&partial, e));
        }
        tokio::fs::rename(&partial, local_path)
            .await
            .map_err(|e| StoreError::local_io(local_path, e))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        self.record("list");
        if *self.failing_list.read() {
            return Err(StoreError::Transient(format!(
                "injected list failure for s3://{bucket}/{prefix}"
            )));
        }

        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), obj)| ObjectInfo {
                key: k.clone(),
                size: obj.body.len() as u64,
                last_modified: Some(obj.last_modified),
            })
            .collect())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        self.record("exists");
        Ok(self
            .objects
            .read()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.record("delete");
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
