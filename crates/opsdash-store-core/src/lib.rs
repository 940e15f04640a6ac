//! Core types for the opsdash document store.
//!
//! This crate defines the pieces shared by every storage backend:
//! - `Document` and its entities (`Server`, `Service`), with the schema
//!   normalization applied on every load and write
//! - `Store`: the read/write contract with optimistic concurrency
//! - `StoreError`: the error taxonomy surfaced to callers
//! - `MemoryStore`: an in-process backend with atomic compare-and-swap

mod error;
mod memory;
mod model;
mod schema;
mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use model::{
    DeploymentType, DockerConfig, Document, ProxyConfig, ProxyType, Server, Service,
    ServiceStatus, UrlItem, VercelConfig, DOCUMENT_VERSION,
};
pub use schema::{decode_document, encode_document, normalize_document, Decoded};
pub use store::{LoadPolicy, ReadResult, Store, VersionToken, WriteOptions};
