//! Entity-level operations over any `Store`.
//!
//! Every mutation is one read-modify-write cycle: read the document and its
//! version, change it in memory, write it back expecting that version. A
//! `StoreError::Conflict` is returned to the caller as is; nothing is retried
//! here.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use opsdash_store_core::{
    normalize_document, Document, ReadResult, Server, Service, Store, StoreError, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Shallow JSON merge patch for an entity, keyed by camelCase field name.
///
/// Keys absent from the patch keep their value, `null` clears the field.
pub type Patch = Map<String, Value>;

/// Fields a patch can never change.
const IMMUTABLE_FIELDS: [&str; 2] = ["id", "createdAt"];

/// Entities that can be listed in manual order.
trait Sortable {
    fn sort_order(&self) -> Option<u32>;
    fn name(&self) -> &str;
}

impl Sortable for Server {
    fn sort_order(&self) -> Option<u32> {
        self.sort_order
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Sortable for Service {
    fn sort_order(&self) -> Option<u32> {
        self.sort_order
    }
    fn name(&self) -> &str {
        &self.name
    }
}

/// `sortOrder` ascending, unordered entities last, ties by name.
fn display_order<T: Sortable>(a: &T, b: &T) -> Ordering {
    let by_position = match (a.sort_order(), b.sort_order()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_position.then_with(|| a.name().cmp(b.name()))
}

fn sorted<T: Sortable + Clone>(items: &[T]) -> Vec<T> {
    let mut items = items.to_vec();
    items.sort_by(display_order);
    items
}

/// Apply a merge patch and re-validate the entity.
fn merge<T: Serialize + DeserializeOwned>(entity: &T, patch: Patch) -> Result<T, StoreError> {
    let Value::Object(mut fields) = serde_json::to_value(entity)? else {
        return Err(StoreError::Serialization("entity is not a JSON object".into()));
    };

    for (key, value) in patch {
        if IMMUTABLE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if value.is_null() {
            fields.remove(&key);
        } else {
            fields.insert(key, value);
        }
    }
    fields.insert(
        "updatedAt".to_string(),
        serde_json::to_value(Utc::now())?,
    );

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| StoreError::Validation(e.to_string()))
}

fn sort_position(index: usize) -> Result<u32, StoreError> {
    u32::try_from(index)
        .map_err(|_| StoreError::Validation(format!("sort position {} out of range", index)))
}

fn not_found(kind: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

/// CRUD, reorder and cascade delete for servers, services and domain order.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn Store>,
}

impl Repository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one read-modify-write cycle against the version that was read.
    ///
    /// Returns the document as persisted together with `apply`'s result.
    async fn mutate<R>(
        &self,
        apply: impl FnOnce(&mut Document) -> Result<R, StoreError>,
    ) -> Result<(Document, R), StoreError> {
        let ReadResult {
            mut document,
            version,
        } = self.store.read().await?;

        let outcome = apply(&mut document)?;
        let document = normalize_document(&document)?;
        self.store
            .write(&document, WriteOptions::expecting(version))
            .await?;
        Ok((document, outcome))
    }

    // =========================================================================
    // Servers
    // =========================================================================

    pub async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let document = self.store.read().await?.document;
        Ok(sorted(&document.servers))
    }

    pub async fn get_server(&self, id: &str) -> Result<Option<Server>, StoreError> {
        let document = self.store.read().await?.document;
        Ok(document.servers.into_iter().find(|s| s.id == id))
    }

    /// Insert a new server. Its id and timestamps are assigned here.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn create_server(&self, draft: Server) -> Result<Server, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let server = Server {
            id: id.clone(),
            created_at: now,
            updated_at: now,
            ..draft
        };

        let (document, ()) = self
            .mutate(|document| {
                document.servers.push(server);
                Ok(())
            })
            .await?;
        debug!(%id, "Created server");
        find_server(document, &id)
    }

    /// Merge `patch` into the server with `id`.
    #[instrument(skip(self, patch))]
    pub async fn update_server(&self, id: &str, patch: Patch) -> Result<Server, StoreError> {
        let (document, ()) = self
            .mutate(|document| {
                let server = document
                    .servers
                    .iter_mut()
                    .find(|s| s.id == id)
                    .ok_or_else(|| not_found("server", id))?;
                *server = merge(server, patch)?;
                Ok(())
            })
            .await?;
        find_server(document, id)
    }

    /// Remove a server and clear every service link to it in the same write.
    ///
    /// Returns `false` (and writes nothing) when no such server exists.
    #[instrument(skip(self))]
    pub async fn delete_server(&self, id: &str) -> Result<bool, StoreError> {
        let ReadResult {
            mut document,
            version,
        } = self.store.read().await?;

        let before = document.servers.len();
        document.servers.retain(|s| s.id != id);
        if document.servers.len() == before {
            return Ok(false);
        }

        let now = Utc::now();
        let mut unlinked = 0;
        for service in &mut document.services {
            let mut touched = false;
            if service.server_id.as_deref() == Some(id) {
                service.server_id = None;
                touched = true;
            }
            if service.proxy_server_id.as_deref() == Some(id) {
                service.proxy_server_id = None;
                touched = true;
            }
            if touched {
                service.updated_at = now;
                unlinked += 1;
            }
        }

        self.store
            .write(&document, WriteOptions::expecting(version))
            .await?;
        debug!(unlinked, "Deleted server");
        Ok(true)
    }

    /// Give each listed server `sortOrder` = its position. Unknown ids are ignored.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn reorder_servers(&self, ids: &[String]) -> Result<(), StoreError> {
        self.mutate(|document| {
            for (position, id) in ids.iter().enumerate() {
                if let Some(server) = document.servers.iter_mut().find(|s| &s.id == id) {
                    server.sort_order = Some(sort_position(position)?);
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // Services
    // =========================================================================

    pub async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let document = self.store.read().await?.document;
        Ok(sorted(&document.services))
    }

    pub async fn get_service(&self, id: &str) -> Result<Option<Service>, StoreError> {
        let document = self.store.read().await?.document;
        Ok(document.services.into_iter().find(|s| s.id == id))
    }

    /// Insert a new service. Its id and timestamps are assigned here.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn create_service(&self, draft: Service) -> Result<Service, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let service = Service {
            id: id.clone(),
            created_at: now,
            updated_at: now,
            ..draft
        };

        let (document, ()) = self
            .mutate(|document| {
                document.services.push(service);
                Ok(())
            })
            .await?;
        debug!(%id, "Created service");
        find_service(document, &id)
    }

    /// Merge `patch` into the service with `id`.
    #[instrument(skip(self, patch))]
    pub async fn update_service(&self, id: &str, patch: Patch) -> Result<Service, StoreError> {
        let (document, ()) = self
            .mutate(|document| {
                let service = document
                    .services
                    .iter_mut()
                    .find(|s| s.id == id)
                    .ok_or_else(|| not_found("service", id))?;
                *service = merge(service, patch)?;
                Ok(())
            })
            .await?;
        find_service(document, id)
    }

    /// Returns `false` (and writes nothing) when no such service exists.
    #[instrument(skip(self))]
    pub async fn delete_service(&self, id: &str) -> Result<bool, StoreError> {
        let ReadResult {
            mut document,
            version,
        } = self.store.read().await?;

        let before = document.services.len();
        document.services.retain(|s| s.id != id);
        if document.services.len() == before {
            return Ok(false);
        }

        self.store
            .write(&document, WriteOptions::expecting(version))
            .await?;
        Ok(true)
    }

    /// Give each listed service `sortOrder` = its position. Unknown ids are ignored.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn reorder_services(&self, ids: &[String]) -> Result<(), StoreError> {
        self.mutate(|document| {
            for (position, id) in ids.iter().enumerate() {
                if let Some(service) = document.services.iter_mut().find(|s| &s.id == id) {
                    service.sort_order = Some(sort_position(position)?);
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // Domains
    // =========================================================================

    pub async fn get_domain_order(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.store.read().await?.document.domain_order)
    }

    /// Replace the zone display order.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn set_domain_order(&self, ids: Vec<String>) -> Result<(), StoreError> {
        self.mutate(|document| {
            document.domain_order = ids;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

fn find_server(document: Document, id: &str) -> Result<Server, StoreError> {
    document
        .servers
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| not_found("server", id))
}

fn find_service(document: Document, id: &str) -> Result<Service, StoreError> {
    document
        .services
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| not_found("service", id))
}
