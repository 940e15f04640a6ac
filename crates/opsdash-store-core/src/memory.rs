use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::model::Document;
use crate::schema::{encode_document, normalize_document};
use crate::store::{LoadPolicy, ReadResult, Store, VersionToken, WriteOptions};

#[derive(Debug, Default)]
struct MemoryState {
    content: Option<Vec<u8>>,
    revision: u64,
    writes: u64,
    unavailable: bool,
}

/// In-process store holding the serialized document.
///
/// Check-and-write happens under one lock, so the compare-and-swap is exact.
/// The backend can be switched to "unavailable" to exercise degraded paths.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    policy: LoadPolicy,
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: LoadPolicy::default(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the stored bytes without any validation.
    pub fn put_raw(&self, bytes: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        state.content = Some(bytes.into());
        state.revision += 1;
    }

    /// The stored bytes, if anything has been written.
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.lock().content.clone()
    }

    /// Make every following call fail with a backend error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of successful writes, including the initial seed.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store poisoned")
    }

    fn token(revision: u64) -> VersionToken {
        VersionToken::new(format!("rev-{}", revision))
    }

    fn check_available(&self, state: &MemoryState) -> Result<(), StoreError> {
        if state.unavailable {
            return Err(StoreError::backend(&self.name, "backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), level = "debug", fields(backend = %self.name))]
    async fn read(&self) -> Result<ReadResult, StoreError> {
        let mut state = self.lock();
        self.check_available(&state)?;

        let Some(bytes) = state.content.clone() else {
            let document = Document::default();
            state.content = Some(encode_document(&document)?);
            state.revision += 1;
            state.writes += 1;
            debug!("Seeded empty document");
            return Ok(ReadResult {
                document,
                version: Some(Self::token(state.revision)),
            });
        };

        let document = self.policy.load(&self.name, &bytes)?;
        Ok(ReadResult {
            document,
            version: Some(Self::token(state.revision)),
        })
    }

    #[instrument(skip(self, document, options), level = "debug", fields(backend = %self.name))]
    async fn write(
        &self,
        document: &Document,
        options: WriteOptions,
    ) -> Result<Option<VersionToken>, StoreError> {
        let bytes = encode_document(&normalize_document(document)?)?;

        let mut state = self.lock();
        self.check_available(&state)?;

        if let Some(expected) = &options.expected_version {
            if state.content.is_some() && *expected != Self::token(state.revision) {
                return Err(StoreError::conflict(&self.name));
            }
        }

        state.content = Some(bytes);
        state.revision += 1;
        state.writes += 1;
        Ok(Some(Self::token(state.revision)))
    }
}
