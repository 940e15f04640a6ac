use std::sync::Arc;

use opsdash_store_core::{LoadPolicy, Store, StoreError};
use opsdash_store_local::LocalStore;
use opsdash_store_s3::S3Store;
use opsdash_store_webdav::WebDavStore;
use tracing::info;

use crate::cached::CachedStore;
use crate::config::{BackendConfig, Config, ConfigError};
use crate::repository::Repository;

/// Open the store for a backend selection.
pub fn open_backend(backend: &BackendConfig, policy: LoadPolicy) -> Arc<dyn Store> {
    match backend {
        BackendConfig::Local { path } => Arc::new(LocalStore::new(path).with_policy(policy)),
        BackendConfig::WebDav(config) => {
            Arc::new(WebDavStore::new(config.clone()).with_policy(policy))
        }
        BackendConfig::S3(config) => Arc::new(S3Store::from_config(config).with_policy(policy)),
    }
}

/// The process-wide store handle, built once at startup and passed to call sites.
#[derive(Clone)]
pub struct DataContext {
    store: Arc<dyn Store>,
    cache: Option<Arc<CachedStore>>,
    repository: Repository,
}

impl DataContext {
    /// Wrap a store that needs no lifecycle management.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            repository: Repository::new(store.clone()),
            store,
            cache: None,
        }
    }

    /// Wrap a cached store, keeping a handle for sync and shutdown.
    pub fn cached(cache: Arc<CachedStore>) -> Self {
        let store: Arc<dyn Store> = cache.clone();
        Self {
            repository: Repository::new(store.clone()),
            store,
            cache: Some(cache),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let backend = config.backend()?;
        let policy = config.load_policy();
        let remote = open_backend(&backend, policy);

        let Some(cache) = config.cache() else {
            info!(backend = remote.name(), "Using backend directly");
            return Ok(Self::new(remote));
        };

        info!(
            backend = remote.name(),
            cache = %cache.path.display(),
            mode = ?cache.mode,
            "Using cached backend"
        );
        let cached = CachedStore::with_policy(remote, &cache.path, cache.mode, policy)
            .with_sync_interval(cache.sync_interval);
        Ok(Self::cached(Arc::new(cached)))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn cache(&self) -> Option<&CachedStore> {
        self.cache.as_deref()
    }

    /// Stop background work and flush pending cache writes.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        match &self.cache {
            Some(cache) => cache.shutdown().await,
            None => Ok(()),
        }
    }
}
