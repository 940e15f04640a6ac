//! A local cache in front of a slow remote store.
//!
//! Reads and writes always hit the on-disk cache. How the remote catches up
//! depends on the `CacheMode` chosen at construction:
//! - `LongLived`: writes mark the cache dirty and a background task pushes
//!   the whole cached document to the remote on a fixed interval
//! - `Ephemeral`: the cache lives under the temp directory and every write is
//!   pushed to the remote before returning
//!
//! Remote failures never fail a caller's read or write. They are logged and,
//! in long-lived mode, retried on the next interval.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use opsdash_store_core::{
    Document, LoadPolicy, ReadResult, Store, StoreError, VersionToken, WriteOptions,
};
use opsdash_store_local::LocalStore;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Default interval between background pushes in long-lived mode.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Whether the host process can run background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Long-running server: deferred sync from a background task.
    LongLived,
    /// Short-lived invocation: scratch cache, write-through.
    Ephemeral,
}

struct Inner {
    remote: Arc<dyn Store>,
    local: LocalStore,
    mode: CacheMode,
    dirty: AtomicBool,
    initialized: OnceCell<()>,
}

struct SyncTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// `Store` that serves from a local file and pushes to a remote store.
pub struct CachedStore {
    inner: Arc<Inner>,
    sync_interval: Duration,
    sync_task: Mutex<Option<SyncTask>>,
}

impl CachedStore {
    /// Create a cached store. Nothing is read until the first operation.
    ///
    /// In `Ephemeral` mode only the file name of `cache_path` is kept and the
    /// cache is placed under the system temp directory.
    pub fn new(remote: Arc<dyn Store>, cache_path: impl AsRef<Path>, mode: CacheMode) -> Self {
        Self::with_policy(remote, cache_path, mode, LoadPolicy::default())
    }

    pub fn with_policy(
        remote: Arc<dyn Store>,
        cache_path: impl AsRef<Path>,
        mode: CacheMode,
        policy: LoadPolicy,
    ) -> Self {
        let path = match mode {
            CacheMode::LongLived => cache_path.as_ref().to_path_buf(),
            CacheMode::Ephemeral => scratch_path(cache_path.as_ref()),
        };

        Self {
            inner: Arc::new(Inner {
                remote,
                local: LocalStore::new(path).with_policy(policy),
                mode,
                dirty: AtomicBool::new(false),
                initialized: OnceCell::new(),
            }),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            sync_task: Mutex::new(None),
        }
    }

    /// Override the background sync interval. Has no effect in ephemeral mode.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn mode(&self) -> CacheMode {
        self.inner.mode
    }

    pub fn cache_path(&self) -> &Path {
        self.inner.local.path()
    }

    /// True when the cache holds writes the remote has not seen yet.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Push the cached document to the remote if there are pending writes.
    ///
    /// Returns whether anything was pushed.
    pub async fn sync_now(&self) -> Result<bool, StoreError> {
        self.ensure_initialized().await;
        self.inner.sync_if_dirty().await
    }

    /// Push the cached document to the remote regardless of pending writes.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.ensure_initialized().await;
        let was_dirty = self.inner.dirty.swap(false, Ordering::SeqCst);
        self.inner.push().await.inspect_err(|_| {
            // Restore only what was pending; a concurrent write keeps its own mark
            self.inner.dirty.fetch_or(was_dirty, Ordering::SeqCst);
        })
    }

    /// Stop the background task and push any pending writes.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let task = self.sync_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            let _ = task.cancel.send(true);
            if let Err(e) = task.handle.await {
                warn!("Cache sync task ended abnormally: {}", e);
            }
        }

        if self.is_dirty() {
            info!("Flushing pending cache writes before shutdown");
            self.inner.sync_if_dirty().await?;
        }
        Ok(())
    }

    /// Run the one-time initialization. Concurrent callers wait on the same run.
    async fn ensure_initialized(&self) {
        self.inner
            .initialized
            .get_or_init(|| async {
                self.inner.seed_from_remote().await;
                if self.inner.mode == CacheMode::LongLived {
                    self.start_sync_task();
                }
            })
            .await;
    }

    fn start_sync_task(&self) {
        let Ok(mut guard) = self.sync_task.lock() else {
            return;
        };
        if guard.is_none() {
            *guard = Some(spawn_sync_task(Arc::downgrade(&self.inner), self.sync_interval));
        }
    }
}

impl Drop for CachedStore {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sync_task.lock() {
            if let Some(task) = guard.take() {
                task.handle.abort();
            }
        }
    }
}

impl Inner {
    /// Fill an empty cache from the remote. Remote failures leave the cache empty.
    async fn seed_from_remote(&self) {
        match self.local.read().await {
            Ok(cached) if !cached.document.is_empty() => {
                debug!("Cache already populated, skipping remote seed");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read local cache: {}", e);
                return;
            }
        }

        let remote = match self.remote.read().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(remote = self.remote.name(), "Remote unavailable, starting with an empty cache: {}", e);
                return;
            }
        };
        if remote.document.is_empty() {
            return;
        }

        match self
            .local
            .write(&remote.document, WriteOptions::unconditional())
            .await
        {
            Ok(_) => info!(remote = self.remote.name(), "Seeded local cache from remote"),
            Err(e) => warn!("Failed to seed local cache: {}", e),
        }
    }

    async fn sync_if_dirty(&self) -> Result<bool, StoreError> {
        // Clear before pushing so writes racing with the push mark it dirty again
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        match self.push().await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Overwrite the remote with the cached document. Last writer wins.
    async fn push(&self) -> Result<(), StoreError> {
        let cached = self.local.read().await?;
        self.remote
            .write(&cached.document, WriteOptions::unconditional())
            .await?;
        info!(remote = self.remote.name(), "Synced cache to remote");
        Ok(())
    }
}

fn spawn_sync_task(inner: Weak<Inner>, interval: Duration) -> SyncTask {
    let (cancel, mut cancelled) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled.changed() => break,
            }

            let Some(inner) = inner.upgrade() else {
                break;
            };
            if let Err(e) = inner.sync_if_dirty().await {
                warn!("Background sync failed, will retry next interval: {}", e);
            }
        }
        debug!("Cache sync task stopped");
    });

    SyncTask { cancel, handle }
}

fn scratch_path(cache_path: &Path) -> PathBuf {
    let file_name = cache_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data.json"));
    std::env::temp_dir().join("opsdash").join(file_name)
}

#[async_trait]
impl Store for CachedStore {
    fn name(&self) -> &str {
        "cache"
    }

    #[instrument(skip(self), level = "debug", fields(remote = self.inner.remote.name()))]
    async fn read(&self) -> Result<ReadResult, StoreError> {
        self.ensure_initialized().await;
        self.inner.local.read().await
    }

    #[instrument(skip(self, document, options), level = "debug", fields(remote = self.inner.remote.name()))]
    async fn write(
        &self,
        document: &Document,
        options: WriteOptions,
    ) -> Result<Option<VersionToken>, StoreError> {
        self.ensure_initialized().await;
        let version = self.inner.local.write(document, options).await?;

        match self.inner.mode {
            CacheMode::LongLived => {
                self.inner.dirty.store(true, Ordering::SeqCst);
            }
            CacheMode::Ephemeral => {
                if let Err(e) = self
                    .inner
                    .remote
                    .write(document, WriteOptions::unconditional())
                    .await
                {
                    warn!(remote = self.inner.remote.name(), "Write-through to remote failed: {}", e);
                }
            }
        }
        Ok(version)
    }
}
