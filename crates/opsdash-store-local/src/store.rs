use std::ffi::OsString;
use std::fs::{self as std_fs, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use fs2::FileExt;
use opsdash_store_core::{
    encode_document, normalize_document, Document, LoadPolicy, ReadResult, Store, StoreError,
    VersionToken, WriteOptions,
};
use tokio::fs;
use tracing::{debug, instrument};

const BACKEND: &str = "local";

/// Document stored as a JSON file.
///
/// The version token is the file mtime in nanoseconds. A write checks the
/// on-disk mtime against the expected token, replaces the file through a temp
/// file + rename, and re-stats for the new token. Check-and-replace runs under
/// an advisory lock on `<file>.lock`, which only covers writers going through
/// this type.
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
    policy: LoadPolicy,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: LoadPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current version token, `None` if the file does not exist.
    async fn current_version(&self) -> Result<Option<VersionToken>, StoreError> {
        match fs::metadata(&self.path).await {
            Ok(metadata) => version_of(&metadata).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("stat", &self.path, e)),
        }
    }
}

#[async_trait]
impl Store for LocalStore {
    fn name(&self) -> &str {
        BACKEND
    }

    #[instrument(skip(self), level = "debug", fields(path = %self.path.display()))]
    async fn read(&self) -> Result<ReadResult, StoreError> {
        // Stat before reading: a concurrent replace then leaves us with an
        // older token, so our next conditional write conflicts instead of
        // silently overwriting.
        let Some(version) = self.current_version().await? else {
            return self.seed().await;
        };

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.seed().await,
            Err(e) => return Err(io_error("read", &self.path, e)),
        };

        let document = self.policy.load(BACKEND, &bytes)?;
        debug!("Read {} bytes", bytes.len());
        Ok(ReadResult {
            document,
            version: Some(version),
        })
    }

    #[instrument(skip(self, document, options), level = "debug", fields(path = %self.path.display()))]
    async fn write(
        &self,
        document: &Document,
        options: WriteOptions,
    ) -> Result<Option<VersionToken>, StoreError> {
        let bytes = encode_document(&normalize_document(document)?)?;
        let path = self.path.clone();
        let expected = options.expected_version;

        let version = tokio::task::spawn_blocking(move || {
            replace_locked(&path, &bytes, expected.as_ref())
        })
        .await
        .map_err(|e| StoreError::backend(BACKEND, format!("write task failed: {}", e)))??;

        debug!(version = %version, "Wrote document");
        Ok(Some(version))
    }
}

impl LocalStore {
    async fn seed(&self) -> Result<ReadResult, StoreError> {
        debug!("No document on disk, seeding empty document");
        let document = Document::default();
        let version = self.write(&document, WriteOptions::unconditional()).await?;
        Ok(ReadResult { document, version })
    }
}

fn version_of(metadata: &Metadata) -> Result<VersionToken, StoreError> {
    let modified = metadata
        .modified()
        .map_err(|e| StoreError::backend(BACKEND, format!("mtime unavailable: {}", e)))?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    Ok(VersionToken::new(nanos.to_string()))
}

fn io_error(action: &str, path: &Path, err: io::Error) -> StoreError {
    StoreError::backend(
        BACKEND,
        format!("failed to {} {}: {}", action, path.display(), err),
    )
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("data.json"));
    name.push(suffix);
    path.with_file_name(name)
}

/// Check the expected version and replace the file, holding the sidecar lock.
fn replace_locked(
    path: &Path,
    bytes: &[u8],
    expected: Option<&VersionToken>,
) -> Result<VersionToken, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std_fs::create_dir_all(parent).map_err(|e| io_error("create directory", parent, e))?;
    }

    let lock_path = sibling(path, ".lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| io_error("open lock file", &lock_path, e))?;
    FileExt::lock_exclusive(&lock_file).map_err(|e| io_error("lock", &lock_path, e))?;

    if let Some(expected) = expected {
        match std_fs::metadata(path) {
            Ok(metadata) => {
                if version_of(&metadata)? != *expected {
                    return Err(StoreError::conflict(BACKEND));
                }
            }
            // Nothing to conflict with yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("stat", path, e)),
        }
    }

    let temp_path = sibling(path, ".tmp");
    std_fs::write(&temp_path, bytes).map_err(|e| io_error("write", &temp_path, e))?;
    std_fs::rename(&temp_path, path).map_err(|e| io_error("rename temp file to", path, e))?;

    let metadata = std_fs::metadata(path).map_err(|e| io_error("stat", path, e))?;
    version_of(&metadata)
    // lock released when `lock_file` drops
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdash_store_core::Server;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("nested/dir/data.json"));
        (store, temp_dir)
    }

    fn doc_with(names: &[&str]) -> Document {
        Document {
            servers: names
                .iter()
                .enumerate()
                .map(|(i, name)| Server {
                    id: format!("id-{}", i),
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Let the filesystem clock move past the last mtime.
    async fn tick() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_read_seeds_missing_file() {
        let (store, _temp_dir) = setup();
        assert!(!store.path().exists());

        let result = store.read().await.unwrap();
        assert_eq!(result.document, Document::default());
        assert!(result.version.is_some());
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (store, _temp_dir) = setup();
        let doc = doc_with(&["alpha", "beta"]);

        let version = store
            .write(&doc, WriteOptions::unconditional())
            .await
            .unwrap();
        let result = store.read().await.unwrap();

        assert_eq!(result.document, doc);
        assert_eq!(result.version, version);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let (store, _temp_dir) = setup();
        let seeded = store.read().await.unwrap();
        tick().await;

        store
            .write(&doc_with(&["first"]), WriteOptions::expecting(seeded.version.clone()))
            .await
            .unwrap();
        tick().await;

        let err = store
            .write(&doc_with(&["second"]), WriteOptions::expecting(seeded.version))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let current = store.read().await.unwrap().document;
        assert_eq!(current.servers[0].name, "first");
    }

    #[tokio::test]
    async fn test_unconditional_write_always_wins() {
        let (store, _temp_dir) = setup();
        store.read().await.unwrap();
        tick().await;
        store
            .write(&doc_with(&["first"]), WriteOptions::unconditional())
            .await
            .unwrap();
        tick().await;

        store
            .write(&doc_with(&["imported"]), WriteOptions::unconditional())
            .await
            .unwrap();
        let current = store.read().await.unwrap().document;
        assert_eq!(current.servers[0].name, "imported");
    }

    #[tokio::test]
    async fn test_concurrent_writers_with_same_token() {
        let (store, _temp_dir) = setup();
        let store = Arc::new(store);
        let token = store.read().await.unwrap().version;
        tick().await;

        let a = {
            let store = store.clone();
            let token = token.clone();
            tokio::spawn(async move {
                store
                    .write(&doc_with(&["a"]), WriteOptions::expecting(token))
                    .await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .write(&doc_with(&["b"]), WriteOptions::expecting(token))
                    .await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(e) if e.is_conflict())));

        let winner = if results[0].is_ok() { "a" } else { "b" };
        let current = store.read().await.unwrap().document;
        assert_eq!(current.servers[0].name, winner);
    }

    #[tokio::test]
    async fn test_corrupt_file_degrades_to_empty() {
        let (store, _temp_dir) = setup();
        store.read().await.unwrap();
        std::fs::write(store.path(), "{\"servers\": 12, \"bogus\": true}").unwrap();

        let result = store.read().await.unwrap();
        assert_eq!(result.document, Document::default());
    }

    #[tokio::test]
    async fn test_corrupt_file_rejected_by_policy() {
        let (store, _temp_dir) = setup();
        let store = store.with_policy(LoadPolicy::Reject);
        store.read().await.unwrap();
        std::fs::write(store.path(), "not json").unwrap();

        let err = store.read().await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptDocument { .. }));
    }

    #[tokio::test]
    async fn test_file_format_is_indented_with_trailing_newline() {
        let (store, _temp_dir) = setup();
        store
            .write(&doc_with(&["alpha"]), WriteOptions::unconditional())
            .await
            .unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\n  \"servers\": [\n    {"));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["servers"][0]["name"], "alpha");
    }
}
