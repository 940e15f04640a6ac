use std::fmt;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;
use crate::model::Document;
use crate::schema::decode_document;

/// Opaque version of the stored document (file mtime, protocol ETag).
/// Only equality is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub document: Document,
    pub version: Option<VersionToken>,
}

/// Admission control for `Store::write`.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// When set, the write fails with `StoreError::Conflict` unless the stored
    /// document is still at this version. When `None` the write always wins.
    pub expected_version: Option<VersionToken>,
}

impl WriteOptions {
    /// Overwrite whatever is stored. Last writer wins, nothing is merged.
    pub fn unconditional() -> Self {
        Self::default()
    }

    pub fn expecting(version: Option<VersionToken>) -> Self {
        Self {
            expected_version: version,
        }
    }
}

/// What to do when a stored document fails schema validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Replace invalid parts with their defaults. A corrupt document is
    /// indistinguishable from a fresh one and will be overwritten by the next
    /// write.
    #[default]
    Degrade,
    /// Fail the read with `StoreError::CorruptDocument`.
    Reject,
}

impl LoadPolicy {
    /// Decode stored bytes under this policy.
    pub fn load(self, backend: &str, bytes: &[u8]) -> Result<Document, StoreError> {
        let decoded = decode_document(bytes);
        if decoded.is_clean() {
            return Ok(decoded.document);
        }

        let message = decoded.issues.join("; ");
        match self {
            Self::Degrade => {
                warn!(backend, issues = %message, "Stored document failed validation, using defaults");
                Ok(decoded.document)
            }
            Self::Reject => Err(StoreError::CorruptDocument {
                backend: backend.to_string(),
                message,
            }),
        }
    }
}

/// Storage backend for the document.
///
/// Implementations must:
/// - seed and return the empty document when nothing is stored yet
/// - normalize documents before persisting them
/// - refuse a write whose expected version is stale, persisting nothing
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name used in errors and logs.
    fn name(&self) -> &str;

    /// Read the current document and its version.
    async fn read(&self) -> Result<ReadResult, StoreError>;

    /// Persist a full document, returning the new version when the backend reports one.
    async fn write(
        &self,
        document: &Document,
        options: WriteOptions,
    ) -> Result<Option<VersionToken>, StoreError>;
}
