//! Backup and restore of the whole document.

use opsdash_store_core::{decode_document, encode_document, Document, Store, StoreError, WriteOptions};
use tracing::{info, warn};

/// Counts of what an import wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub servers: usize,
    pub services: usize,
    pub domains: usize,
}

/// Serialize the current document exactly as stored.
pub async fn export(store: &dyn Store) -> Result<Vec<u8>, StoreError> {
    let document = store.read().await?.document;
    encode_document(&document)
}

/// Parse a backup, failing on anything the loader would have to repair.
pub fn parse_backup(bytes: &[u8]) -> Result<Document, StoreError> {
    let decoded = decode_document(bytes);
    if !decoded.is_clean() {
        return Err(StoreError::Validation(format!(
            "backup rejected: {}",
            decoded.issues.join("; ")
        )));
    }
    Ok(decoded.document)
}

/// Replace the stored document with a backup.
///
/// DANGER: the write carries no expected version. Whatever is stored is
/// overwritten, including changes made since the backup was taken. Last
/// writer wins and nothing is merged.
pub async fn import(store: &dyn Store, bytes: &[u8]) -> Result<ImportSummary, StoreError> {
    let document = parse_backup(bytes)?;
    warn!(backend = store.name(), "Importing backup: overwriting stored document unconditionally");

    store.write(&document, WriteOptions::unconditional()).await?;

    let summary = ImportSummary {
        servers: document.servers.len(),
        services: document.services.len(),
        domains: document.domain_order.len(),
    };
    info!(?summary, "Import complete");
    Ok(summary)
}
