use std::fmt::Display;

/// Errors surfaced by stores and by the repository built on top of them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The expected version token no longer matches the stored document.
    /// Callers recover by re-reading and retrying with the fresh token.
    #[error("{backend}: document was updated elsewhere (version mismatch), refresh and retry")]
    Conflict { backend: String },

    /// Any backend-specific failure (network, auth, malformed response).
    #[error("{backend} backend error: {message}")]
    Backend { backend: String, message: String },

    /// The stored document failed schema validation and the store was
    /// configured to reject rather than degrade.
    #[error("{backend}: stored document is corrupt: {message}")]
    CorruptDocument { backend: String, message: String },

    /// A document handed to `write()` failed schema normalization.
    #[error("invalid document: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn backend(backend: &str, message: impl Display) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            message: message.to_string(),
        }
    }

    pub fn conflict(backend: &str) -> Self {
        Self::Conflict {
            backend: backend.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
