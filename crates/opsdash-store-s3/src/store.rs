use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, RequestChecksumCalculation};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use opsdash_store_core::{
    encode_document, normalize_document, Document, LoadPolicy, ReadResult, Store, StoreError,
    VersionToken, WriteOptions,
};
use tracing::{debug, instrument, warn};

const BACKEND: &str = "s3";
/// Maximum retries for transient errors (429 / 5xx).
const MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff.
const BASE_DELAY_MS: u64 = 200;

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint for non-AWS providers (R2, OSS, MinIO).
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub object_key: String,
    pub force_path_style: bool,
}

impl S3Config {
    /// Build an S3 client from static credentials.
    pub fn client(&self) -> S3Client {
        let credentials = Credentials::new(
            &self.access_key_id,
            &self.secret_access_key,
            None,
            None,
            "opsdash",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(self.region.clone()))
            .force_path_style(self.force_path_style)
            // Non-AWS providers reject the default streaming checksums
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired);

        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        S3Client::from_conf(builder.build())
    }
}

/// Document stored as a single object, with ETag-based optimistic locking.
#[derive(Clone)]
pub struct S3Store {
    s3_client: S3Client,
    bucket_name: String,
    object_key: String,
    policy: LoadPolicy,
}

impl S3Store {
    pub fn new(s3_client: S3Client, bucket_name: String, object_key: String) -> Self {
        Self {
            s3_client,
            bucket_name,
            object_key,
            policy: LoadPolicy::default(),
        }
    }

    pub fn from_config(config: &S3Config) -> Self {
        Self::new(
            config.client(),
            config.bucket.clone(),
            config.object_key.trim_start_matches('/').to_string(),
        )
    }

    pub fn with_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    // =========================================================================
    // Retry helpers
    // =========================================================================

    /// Sleep with exponential backoff + jitter.
    async fn backoff_sleep(attempt: u32) {
        let base = Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt));
        let jitter = Duration::from_millis(rand_jitter());
        tokio::time::sleep(base + jitter).await;
    }

    fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
        match err {
            SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
            SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
            _ => None,
        }
    }

    /// Check if an S3 error is retryable (429, 5xx, timeouts, dispatch failures).
    fn is_retryable<E>(err: &SdkError<E>) -> bool {
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
            _ => Self::status_of(err)
                .map(|status| status == 429 || (500..=504).contains(&status))
                .unwrap_or(false),
        }
    }

    // =========================================================================
    // Object primitives
    // =========================================================================

    /// Get the document object with its ETag. `None` if the object does not exist.
    async fn get_object_with_etag(&self) -> Result<Option<(Vec<u8>, Option<String>)>, StoreError> {
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .s3_client
                .get_object()
                .bucket(&self.bucket_name)
                .key(&self.object_key)
                .send()
                .await;

            match result {
                Ok(output) => {
                    let etag = output.e_tag().map(str::to_string);
                    let bytes = output
                        .body
                        .collect()
                        .await
                        .map_err(|e| {
                            StoreError::backend(BACKEND, format!("failed to read object body: {}", e))
                        })?
                        .into_bytes();
                    return Ok(Some((bytes.to_vec(), etag)));
                }
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, key = %self.object_key, "get_object retryable error, retrying");
                        Self::backoff_sleep(attempt).await;
                        continue;
                    }
                    let not_found = Self::status_of(&e) == Some(404);
                    let service_error = e.into_service_error();
                    if not_found || service_error.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(StoreError::backend(
                        BACKEND,
                        format!("get_object error: {}", service_error),
                    ));
                }
            }
        }
        unreachable!()
    }

    /// Put the document object, conditionally on `expected_etag` via `If-Match`.
    ///
    /// Returns the new ETag, or `StoreError::Conflict` on 412, or on 409 when
    /// S3 rejects a racing conditional write with `ConditionalRequestConflict`.
    async fn put_object(
        &self,
        data: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        for attempt in 0..=MAX_RETRIES {
            let mut request = self
                .s3_client
                .put_object()
                .bucket(&self.bucket_name)
                .key(&self.object_key)
                .content_type("application/json; charset=utf-8")
                .body(ByteStream::from(data.to_vec()));

            if let Some(etag) = expected_etag {
                request = request.if_match(etag);
            }

            match request.send().await {
                Ok(output) => return Ok(output.e_tag().map(str::to_string)),
                Err(e) => {
                    if matches!(Self::status_of(&e), Some(409 | 412)) {
                        return Err(StoreError::conflict(BACKEND));
                    }
                    if Self::is_retryable(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, key = %self.object_key, "put_object retryable error, retrying");
                        Self::backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(StoreError::backend(
                        BACKEND,
                        format!("put_object error: {}", e.into_service_error()),
                    ));
                }
            }
        }
        unreachable!()
    }
}

#[async_trait]
impl Store for S3Store {
    fn name(&self) -> &str {
        BACKEND
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket_name, key = %self.object_key))]
    async fn read(&self) -> Result<ReadResult, StoreError> {
        let Some((bytes, etag)) = self.get_object_with_etag().await? else {
            debug!("Object not found, seeding empty document");
            let document = Document::default();
            let version = self.write(&document, WriteOptions::unconditional()).await?;
            return Ok(ReadResult { document, version });
        };

        let document = self.policy.load(BACKEND, &bytes)?;
        debug!("Read object ({} bytes)", bytes.len());
        Ok(ReadResult {
            document,
            version: etag.map(VersionToken::new),
        })
    }

    #[instrument(skip(self, document, options), level = "debug", fields(bucket = %self.bucket_name, key = %self.object_key))]
    async fn write(
        &self,
        document: &Document,
        options: WriteOptions,
    ) -> Result<Option<VersionToken>, StoreError> {
        let bytes = encode_document(&normalize_document(document)?)?;
        let expected = options.expected_version;
        let etag = self
            .put_object(&bytes, expected.as_ref().map(VersionToken::as_str))
            .await?;
        debug!("Wrote object ({} bytes)", bytes.len());
        Ok(etag.map(VersionToken::new))
    }
}

fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 50)
        .unwrap_or(0)
}
