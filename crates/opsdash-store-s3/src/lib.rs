//! S3-compatible object storage backend (AWS S3, R2, OSS, MinIO): the document
//! is one object, versioned by its ETag.

mod store;

pub use store::{S3Config, S3Store};
