//! Persistent document store for the opsdash operations dashboard.
//!
//! One JSON document (servers, services, DNS zone order) lives on a local
//! file, a WebDAV server or an S3-compatible bucket. This crate layers on top
//! of the backend crates:
//! - `CachedStore`: a local cache in front of a remote backend
//! - `Repository`: entity CRUD, reorder and cascade delete
//! - `Config` / `DataContext`: backend selection resolved once at startup
//! - `transfer`: whole-document export and import

pub mod cached;
pub mod config;
pub mod context;
pub mod repository;
pub mod transfer;

pub use cached::{CacheMode, CachedStore, DEFAULT_SYNC_INTERVAL};
pub use config::{BackendConfig, BackendKind, CacheConfig, Config, ConfigError};
pub use context::{open_backend, DataContext};
pub use repository::{Patch, Repository};

pub use opsdash_store_core::{
    Document, LoadPolicy, ReadResult, Server, Service, Store, StoreError, VersionToken,
    WriteOptions,
};
