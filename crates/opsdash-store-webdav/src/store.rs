use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use opsdash_store_core::{
    encode_document, normalize_document, Document, LoadPolicy, ReadResult, Store, StoreError,
    VersionToken, WriteOptions,
};
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument, warn};

const BACKEND: &str = "webdav";
const MAX_RETRIES: u32 = 5;
const BASE_DELAY_MS: u64 = 200;

/// Connection settings for a WebDAV server.
#[derive(Debug, Clone)]
pub struct WebDavConfig {
    /// Server root, e.g. `https://dav.example.com/remote.php/dav/files/me`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Path of the document below the root, e.g. `/deploy-manage/data.json`
    pub file_path: String,
}

/// Document stored as a file on a WebDAV server.
///
/// Reads and writes go through plain `GET`/`PUT`; the server's ETag is the
/// version token and is sent back as `If-Match` on conditional writes, so the
/// server's own compare-and-swap decides conflicts.
pub struct WebDavStore {
    http: HttpClient,
    base_url: String,
    file_path: String,
    username: Option<String>,
    password: Option<String>,
    policy: LoadPolicy,
    /// Parent collections have been created (or found) once.
    collections_ready: AtomicBool,
}

impl WebDavStore {
    pub fn new(config: WebDavConfig) -> Self {
        let file_path = format!("/{}", config.file_path.trim_start_matches('/'));
        Self {
            http: HttpClient::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            file_path,
            username: config.username.filter(|u| !u.is_empty()),
            password: config.password,
            policy: LoadPolicy::default(),
            collections_ready: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn file_url(&self) -> String {
        format!("{}{}", self.base_url, self.file_path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.username {
            Some(username) => builder.basic_auth(username, self.password.as_deref()),
            None => builder,
        }
    }

    /// Send a request with exponential backoff retry on 429.
    async fn send_with_retry(
        &self,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response, StoreError> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);

        for attempt in 0..=MAX_RETRIES {
            let response = build_request()
                .send()
                .await
                .map_err(|e| StoreError::backend(BACKEND, format!("request failed: {}", e)))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            if attempt == MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                return Err(StoreError::backend(
                    BACKEND,
                    format!("rate limited after {} retries: {}", MAX_RETRIES, text),
                ));
            }

            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "WebDAV rate limited (429), retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        unreachable!()
    }

    async fn failure(action: &str, response: Response) -> StoreError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        StoreError::backend(
            BACKEND,
            format!("{} failed with status {}: {}", action, status, text),
        )
    }

    fn etag_of(response: &Response) -> Option<VersionToken> {
        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(VersionToken::new)
    }

    /// Create every missing parent collection of the document path.
    /// `405 Method Not Allowed` means the collection already exists.
    async fn ensure_collections(&self) -> Result<(), StoreError> {
        if self.collections_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mkcol = Method::from_bytes(b"MKCOL")
            .map_err(|e| StoreError::backend(BACKEND, format!("invalid method: {}", e)))?;

        let segments: Vec<&str> = self
            .file_path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let mut prefix = String::new();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            prefix.push('/');
            prefix.push_str(segment);
            let url = format!("{}{}/", self.base_url, prefix);

            let response = self
                .send_with_retry(|| self.request(mkcol.clone(), &url))
                .await?;
            let status = response.status();
            if status.is_success()
                || status == StatusCode::METHOD_NOT_ALLOWED
                || status.is_redirection()
            {
                debug!(collection = %prefix, %status, "Collection ready");
                continue;
            }
            return Err(Self::failure("MKCOL", response).await);
        }

        self.collections_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn seed(&self) -> Result<ReadResult, StoreError> {
        debug!("Remote file not found, seeding empty document");
        let document = Document::default();
        let version = self.write(&document, WriteOptions::unconditional()).await?;
        Ok(ReadResult { document, version })
    }

    /// Look up the current ETag when a PUT response did not carry one.
    async fn head_version(&self) -> Result<Option<VersionToken>, StoreError> {
        let url = self.file_url();
        let response = self
            .send_with_retry(|| self.request(Method::HEAD, &url))
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure("HEAD", response).await);
        }
        Ok(Self::etag_of(&response))
    }
}

#[async_trait]
impl Store for WebDavStore {
    fn name(&self) -> &str {
        BACKEND
    }

    #[instrument(skip(self), level = "debug", fields(path = %self.file_path))]
    async fn read(&self) -> Result<ReadResult, StoreError> {
        let url = self.file_url();
        let response = self
            .send_with_retry(|| self.request(Method::GET, &url))
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return self.seed().await;
        }
        if !status.is_success() {
            return Err(Self::failure("GET", response).await);
        }

        let version = Self::etag_of(&response);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::backend(BACKEND, format!("failed to read body: {}", e)))?;

        let document = self.policy.load(BACKEND, &bytes)?;
        debug!("GET {} ({} bytes)", self.file_path, bytes.len());
        Ok(ReadResult { document, version })
    }

    #[instrument(skip(self, document, options), level = "debug", fields(path = %self.file_path))]
    async fn write(
        &self,
        document: &Document,
        options: WriteOptions,
    ) -> Result<Option<VersionToken>, StoreError> {
        let bytes = encode_document(&normalize_document(document)?)?;
        self.ensure_collections().await?;

        let url = self.file_url();
        let expected = options.expected_version;
        let response = self
            .send_with_retry(|| {
                let request = self
                    .request(Method::PUT, &url)
                    .header(CONTENT_TYPE, "application/json; charset=utf-8")
                    .body(bytes.clone());
                match &expected {
                    Some(version) => request.header(IF_MATCH, version.as_str()),
                    None => request,
                }
            })
            .await?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(StoreError::conflict(BACKEND));
        }
        if !status.is_success() {
            return Err(Self::failure("PUT", response).await);
        }

        let version = match Self::etag_of(&response) {
            Some(version) => Some(version),
            None => self.head_version().await?,
        };
        debug!("PUT {} ({} bytes)", self.file_path, bytes.len());
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdash_store_core::Server;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FILE: &str = "/dav/deploy-manage/data.json";

    fn store_for(server: &MockServer, username: Option<&str>) -> WebDavStore {
        WebDavStore::new(WebDavConfig {
            url: format!("{}/dav/", server.uri()),
            username: username.map(str::to_string),
            password: Some("secret".to_string()),
            file_path: "deploy-manage/data.json".to_string(),
        })
    }

    fn stored_json() -> String {
        serde_json::json!({
            "version": 2,
            "servers": [{ "id": "a", "name": "alpha" }],
            "services": [],
            "domainOrder": ["zone-1"]
        })
        .to_string()
    }

    async fn mount_collections(server: &MockServer) {
        Mock::given(method("MKCOL"))
            .and(path("/dav/deploy-manage/"))
            .respond_with(ResponseTemplate::new(405))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_read_returns_document_and_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FILE))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(stored_json())
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let result = store_for(&server, None).read().await.unwrap();
        assert_eq!(result.document.servers[0].name, "alpha");
        assert_eq!(result.document.domain_order, vec!["zone-1"]);
        assert_eq!(result.version, Some(VersionToken::new("\"v1\"")));
    }

    #[tokio::test]
    async fn test_missing_file_is_seeded() {
        let server = MockServer::start().await;
        mount_collections(&server).await;
        Mock::given(method("GET"))
            .and(path(FILE))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(FILE))
            .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"seed\""))
            .expect(1)
            .mount(&server)
            .await;

        let result = store_for(&server, None).read().await.unwrap();
        assert_eq!(result.document, Document::default());
        assert_eq!(result.version, Some(VersionToken::new("\"seed\"")));
    }

    #[tokio::test]
    async fn test_conditional_write_sends_if_match() {
        let server = MockServer::start().await;
        mount_collections(&server).await;
        Mock::given(method("PUT"))
            .and(path(FILE))
            .and(header("If-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(204).insert_header("ETag", "\"v2\""))
            .expect(1)
            .mount(&server)
            .await;

        let doc = Document {
            servers: vec![Server {
                id: "a".into(),
                name: "alpha".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let version = store_for(&server, None)
            .write(&doc, WriteOptions::expecting(Some(VersionToken::new("\"v1\""))))
            .await
            .unwrap();
        assert_eq!(version, Some(VersionToken::new("\"v2\"")));
    }

    #[tokio::test]
    async fn test_precondition_failed_is_conflict() {
        let server = MockServer::start().await;
        mount_collections(&server).await;
        Mock::given(method("PUT"))
            .and(path(FILE))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let err = store_for(&server, None)
            .write(
                &Document::default(),
                WriteOptions::expecting(Some(VersionToken::new("\"stale\""))),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_missing_etag_falls_back_to_head() {
        let server = MockServer::start().await;
        mount_collections(&server).await;
        Mock::given(method("PUT"))
            .and(path(FILE))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(FILE))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"from-head\""))
            .mount(&server)
            .await;

        let version = store_for(&server, None)
            .write(&Document::default(), WriteOptions::unconditional())
            .await
            .unwrap();
        assert_eq!(version, Some(VersionToken::new("\"from-head\"")));
    }

    #[tokio::test]
    async fn test_auth_failure_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FILE))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .mount(&server)
            .await;

        let err = store_for(&server, Some("me")).read().await.unwrap_err();
        match err {
            StoreError::Backend { backend, message } => {
                assert_eq!(backend, "webdav");
                assert!(message.contains("401"));
                assert!(message.contains("bad credentials"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_remote_document_degrades() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FILE))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html>oops</html>")
                    .insert_header("ETag", "\"v9\""),
            )
            .mount(&server)
            .await;

        let result = store_for(&server, None).read().await.unwrap();
        assert_eq!(result.document, Document::default());
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FILE))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(FILE))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(stored_json())
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let result = store_for(&server, None).read().await.unwrap();
        assert_eq!(result.document.servers.len(), 1);
    }
}
