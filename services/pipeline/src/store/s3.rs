use super::{partial_path, ObjectInfo, ObjectRef, ObjectStore, RetryPolicy, StoreError};
use crate::config::StoreConfig;
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// [`ObjectStore`] backed by an S3-compatible service.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    retry: RetryPolicy,
}

impl S3ObjectStore {
    /// Create a new client from the store configuration.
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.operation_timeout())
                    .build(),
            );

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "stage-pipeline",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("aws"),
            max_attempts = config.max_attempts,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Get the underlying S3 client
    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.retry
            .run("put_object", || {
                let body = ByteStream::from(body.clone());
                async move {
                    self.client
                        .put_object()
                        .bucket(bucket)
                        .key(key)
                        .body(body)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| classify(e, bucket, key))
                }
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        self.retry
            .run("get_object", || async move {
                let response = self
                    .client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| classify(e, bucket, key))?;

                let data = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::Transient(format!("reading body of {key}: {e}")))?;

                Ok(data.into_bytes())
            })
            .await
    }

    #[instrument(skip(self), fields(local_path = %local_path.display()))]
    async fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.retry
            .run("upload", || async move {
                let body = ByteStream::from_path(local_path).await.map_err(|e| {
                    StoreError::local_io(
                        local_path,
                        std::io::Error::new(std::io::ErrorKind::Other, e),
                    )
                })?;

                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_type(content_type_for(key))
                    .body(body)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify(e, bucket, key))
            })
            .await?;

        debug!(bucket = bucket, key = key, "Uploaded file");
        Ok(())
    }

    #[instrument(skip(self), fields(local_path = %local_path.display()))]
    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StoreError> {
        let partial = partial_path(local_path);

        let result = self
            .retry
            .run("download", || {
                let partial = partial.clone();
                async move {
                    let mut response = self
                        .client
                        .get_object()
                        .bucket(bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| classify(e, bucket, key))?;

                    let mut file = tokio::fs::File::create(&partial)
                        .await
                        .map_err(|e| StoreError::local_io(&partial, e))?;

                    while let Some(chunk) = response.body.try_next().await.map_err(|e| {
                        StoreError::Transient(format!("streaming body of {key}: {e}"))
                    })? {
                        file.write_all(&chunk)
                            .await
                            .map_err(|e| StoreError::local_io(&partial, e))?;
                    }

                    file.flush()
                        .await
                        .map_err(|e| StoreError::local_io(&partial, e))?;
                    Ok(())
                }
            })
            .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, local_path)
            .await
            .map_err(|e| StoreError::local_io(local_path, e))?;

        debug!(bucket = bucket, key = key, "Downloaded object");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        self.retry
            .run("list_objects_v2", || async move {
                let mut pages = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix)
                    .into_paginator()
                    .send();

                let mut objects = Vec::new();
                while let Some(page) = pages.next().await {
                    let page = page.map_err(|e| classify(e, bucket, prefix))?;
                    objects.extend(page.contents().iter().filter_map(|obj| {
                        obj.key().map(|key| ObjectInfo {
                            key: key.to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                            last_modified: obj.last_modified().and_then(|dt| {
                                DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
                            }),
                        })
                    }));
                }

                Ok(objects)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        let result = self
            .retry
            .run("head_object", || async move {
                self.client
                    .head_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify(e, bucket, key))
            })
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.retry
            .run("delete_object", || async move {
                self.client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify(e, bucket, key))
            })
            .await
    }
}

/// Map an SDK failure onto the store error taxonomy.
fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &str, key: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = DisplayErrorContext(&err).to_string();

    match &err {
        SdkError::TimeoutError(_) => StoreError::Timeout(detail),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => StoreError::Transient(detail),
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            service_error(status, service.err().code(), bucket, key, detail)
        }
        _ => StoreError::Provider(detail),
    }
}

fn service_error(
    status: u16,
    code: Option<&str>,
    bucket: &str,
    key: &str,
    detail: String,
) -> StoreError {
    match (status, code) {
        (404, _) | (_, Some("NoSuchKey")) | (_, Some("NotFound")) => {
            StoreError::NotFound(ObjectRef::new(bucket, key))
        }
        (403, _) | (_, Some("AccessDenied")) | (_, Some("InvalidAccessKeyId")) => {
            StoreError::AccessDenied(detail)
        }
        (408, _) | (_, Some("RequestTimeout")) => StoreError::Timeout(detail),
        (429, _) | (500..=599, _) | (_, Some("SlowDown")) | (_, Some("InternalError")) => {
            StoreError::Transient(detail)
        }
        _ => StoreError::Provider(detail),
    }
}

/// Get content type for an object key's extension
fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
