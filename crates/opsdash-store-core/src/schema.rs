//! Schema normalization for the persisted document.
//!
//! Loading is lenient: fields with a documented default fall back to it, an
//! invalid entity resets its whole collection to `[]`, and anything that is
//! not a document object at all becomes the empty document. Writing applies
//! the same rules to a typed document but rejects invalid entities instead of
//! dropping them.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;
use url::Url;

use crate::error::StoreError;
use crate::model::{
    DockerConfig, Document, ProxyConfig, Server, Service, UrlItem, VercelConfig, DOCUMENT_VERSION,
};

const TOP_LEVEL_KEYS: [&str; 4] = ["version", "servers", "services", "domainOrder"];

/// Outcome of decoding stored bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub document: Document,
    /// Everything that had to be replaced by a default. Empty for a clean document.
    pub issues: Vec<String>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Decode stored bytes into a document, degrading instead of failing.
pub fn decode_document(bytes: &[u8]) -> Decoded {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => return degraded(format!("not valid JSON: {}", e)),
    };

    let mut object = match value {
        Value::Object(object) => object,
        other => return degraded(format!("expected a JSON object, found {}", kind_of(&other))),
    };

    if let Some(unknown) = object.keys().find(|k| !TOP_LEVEL_KEYS.contains(&k.as_str())) {
        return degraded(format!("unknown top-level field `{}`", unknown));
    }

    let mut issues = Vec::new();
    let servers = decode_collection::<Server>(&mut object, "servers", &mut issues);
    let services = decode_collection::<Service>(&mut object, "services", &mut issues);
    let domain_order = match object.remove("domainOrder") {
        None => Vec::new(),
        Some(value) => match serde_json::from_value::<Vec<String>>(value)
            .map_err(|e| e.to_string())
            .and_then(normalize_domain_order)
        {
            Ok(ids) => ids,
            Err(reason) => {
                issues.push(format!("domainOrder reset to []: {}", reason));
                Vec::new()
            }
        },
    };

    Decoded {
        document: Document {
            version: DOCUMENT_VERSION,
            servers,
            services,
            domain_order,
        },
        issues,
    }
}

/// Serialize a document the way it is persisted: 2-space indent, trailing newline.
pub fn encode_document(document: &Document) -> Result<Vec<u8>, StoreError> {
    let mut bytes = serde_json::to_vec_pretty(document)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Normalize a document before it is written. Invalid entities are rejected.
pub fn normalize_document(document: &Document) -> Result<Document, StoreError> {
    let servers = document
        .servers
        .iter()
        .cloned()
        .map(|server| {
            let id = server.id.clone();
            server
                .normalize()
                .map_err(|reason| StoreError::Validation(format!("server `{}`: {}", id, reason)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let services = document
        .services
        .iter()
        .cloned()
        .map(|service| {
            let id = service.id.clone();
            service
                .normalize()
                .map_err(|reason| StoreError::Validation(format!("service `{}`: {}", id, reason)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let domain_order = normalize_domain_order(document.domain_order.clone())
        .map_err(|reason| StoreError::Validation(format!("domainOrder: {}", reason)))?;

    Ok(Document {
        version: DOCUMENT_VERSION,
        servers,
        services,
        domain_order,
    })
}

fn degraded(reason: String) -> Decoded {
    Decoded {
        document: Document::default(),
        issues: vec![format!("document reset to empty: {}", reason)],
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn decode_collection<T>(object: &mut Map<String, Value>, key: &str, issues: &mut Vec<String>) -> Vec<T>
where
    T: DeserializeOwned + Normalize,
{
    let Some(value) = object.remove(key) else {
        return Vec::new();
    };

    let decoded = serde_json::from_value::<Vec<Value>>(value)
        .map_err(|e| e.to_string())
        .and_then(|items| {
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value::<T>(item)
                        .map_err(|e| e.to_string())
                        .and_then(T::normalize)
                        .map_err(|reason| format!("entry {}: {}", index, reason))
                })
                .collect::<Result<Vec<_>, _>>()
        });

    match decoded {
        Ok(items) => items,
        Err(reason) => {
            warn!(collection = key, %reason, "Invalid entity in stored document, collection reset");
            issues.push(format!("{} reset to []: {}", key, reason));
            Vec::new()
        }
    }
}

fn normalize_domain_order(ids: Vec<String>) -> Result<Vec<String>, String> {
    ids.into_iter()
        .map(|id| required("zone id", id))
        .collect()
}

/// Per-entity normalization: trims strings, applies fallbacks, rejects what
/// has no fallback.
pub(crate) trait Normalize: Sized {
    fn normalize(self) -> Result<Self, String>;
}

impl Normalize for Server {
    fn normalize(self) -> Result<Self, String> {
        if self.cpu_cores == Some(0) {
            return Err("cpuCores must be positive".to_string());
        }
        if let Some(price) = self.price {
            if !price.is_finite() || price < 0.0 {
                return Err("price must be a non-negative number".to_string());
            }
        }

        Ok(Self {
            id: required("id", self.id)?,
            name: required("name", self.name)?,
            host: optional("host", self.host)?,
            provider: optional("provider", self.provider)?,
            region: optional("region", self.region)?,
            panel_url: optional_url("panelUrl", self.panel_url)?,
            tags: tags(self.tags),
            probe_uuid: optional("probeUuid", self.probe_uuid)?,
            cpu_name: optional("cpuName", self.cpu_name)?,
            os: optional("os", self.os)?,
            arch: optional("arch", self.arch)?,
            billing_cycle: optional("billingCycle", self.billing_cycle)?,
            currency: optional("currency", self.currency)?,
            ..self
        })
    }
}

impl Normalize for Service {
    fn normalize(self) -> Result<Self, String> {
        if self.monitor_id == Some(0) {
            return Err("monitorId must be positive".to_string());
        }

        Ok(Self {
            id: required("id", self.id)?,
            name: required("name", self.name)?,
            server_id: optional("serverId", self.server_id)?,
            proxy_server_id: optional("proxyServerId", self.proxy_server_id)?,
            repo_url: optional_url("repoUrl", self.repo_url)?,
            github: optional_url("github", self.github)?,
            urls: url_items(self.urls),
            management_urls: url_items(self.management_urls),
            healthcheck_url: optional_url("healthcheckUrl", self.healthcheck_url)?,
            tags: tags(self.tags),
            monitor_group: optional("monitorGroup", self.monitor_group)?,
            proxy: self.proxy.map(|proxy| ProxyConfig {
                upstream: proxy.upstream.map(|s| s.trim().to_string()),
                ..proxy
            }),
            docker: self.docker.map(|docker| DockerConfig {
                compose_path: docker.compose_path.map(|s| s.trim().to_string()),
                container_name: docker.container_name.map(|s| s.trim().to_string()),
            }),
            vercel: self.vercel.map(|vercel| VercelConfig {
                project: vercel.project.map(|s| s.trim().to_string()),
            }),
            ..self
        })
    }
}

impl Normalize for UrlItem {
    fn normalize(self) -> Result<Self, String> {
        Ok(Self {
            label: optional("label", self.label)?,
            url: url("url", self.url)?,
        })
    }
}

fn required(field: &str, value: String) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    Ok(trimmed.to_string())
}

fn optional(field: &str, value: Option<String>) -> Result<Option<String>, String> {
    value.map(|v| required(field, v)).transpose()
}

fn url(field: &str, value: String) -> Result<String, String> {
    let value = required(field, value)?;
    Url::parse(&value).map_err(|e| format!("{} is not a valid URL: {}", field, e))?;
    Ok(value)
}

fn optional_url(field: &str, value: Option<String>) -> Result<Option<String>, String> {
    value.map(|v| url(field, v)).transpose()
}

/// Tags fall back to `[]` when any entry is blank.
fn tags(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|tag| required("tag", tag))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_default()
}

/// URL lists fall back to `[]` when any entry is invalid.
fn url_items(items: Vec<UrlItem>) -> Vec<UrlItem> {
    items
        .into_iter()
        .map(Normalize::normalize)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProxyType, ServiceStatus};
    use serde_json::json;

    fn decode(value: Value) -> Decoded {
        decode_document(value.to_string().as_bytes())
    }

    #[test]
    fn test_garbage_degrades_to_empty() {
        for bytes in [&b"not json"[..], b"[]", b"42", b"\"text\""] {
            let decoded = decode_document(bytes);
            assert_eq!(decoded.document, Document::default());
            assert!(!decoded.is_clean());
        }
    }

    #[test]
    fn test_unknown_top_level_field_degrades_to_empty() {
        let decoded = decode(json!({
            "version": 2,
            "servers": [{ "id": "a", "name": "alpha" }],
            "extra": true
        }));
        assert!(decoded.document.servers.is_empty());
        assert!(decoded.issues[0].contains("extra"));
    }

    #[test]
    fn test_defaults_applied_to_loose_fields() {
        let decoded = decode(json!({
            "version": 1,
            "servers": [{
                "id": " a ",
                "name": "alpha",
                "tags": "not-a-list",
                "notes": 5,
                "createdAt": "yesterday"
            }],
            "services": [{
                "id": "s",
                "name": "svc",
                "status": "exploded",
                "deploymentType": "docker",
                "urls": [{ "url": "https://ok.example" }, { "url": "nope" }],
                "proxy": { "type": "1panel" }
            }]
        }));

        assert!(decoded.is_clean());
        let doc = decoded.document;
        assert_eq!(doc.version, DOCUMENT_VERSION);

        let server = &doc.servers[0];
        assert_eq!(server.id, "a");
        assert!(server.tags.is_empty());
        assert_eq!(server.notes, "");
        assert_eq!(server.created_at, chrono::DateTime::<chrono::Utc>::default());

        let service = &doc.services[0];
        assert_eq!(service.status, ServiceStatus::Active);
        assert!(service.urls.is_empty());
        assert_eq!(service.proxy.as_ref().map(|p| p.kind), Some(ProxyType::OnePanel));
    }

    #[test]
    fn test_invalid_entity_resets_only_its_collection() {
        let decoded = decode(json!({
            "servers": [{ "id": "a", "name": "   " }],
            "services": [{ "id": "s", "name": "svc" }],
            "domainOrder": ["z1", "z2"]
        }));

        assert!(decoded.document.servers.is_empty());
        assert_eq!(decoded.document.services.len(), 1);
        assert_eq!(decoded.document.domain_order, vec!["z1", "z2"]);
        assert_eq!(decoded.issues.len(), 1);
        assert!(decoded.issues[0].starts_with("servers"));
    }

    #[test]
    fn test_unknown_entity_field_rejected() {
        let decoded = decode(json!({
            "services": [{ "id": "s", "name": "svc", "color": "red" }]
        }));
        assert!(decoded.document.services.is_empty());
        assert!(!decoded.is_clean());
    }

    #[test]
    fn test_unknown_sub_object_keys_are_ignored() {
        let decoded = decode(json!({
            "services": [
                {
                    "id": "s1",
                    "name": "web",
                    "proxy": { "type": "nginx", "legacyPort": 80 },
                    "docker": { "composePath": "/srv/web", "build": true },
                    "vercel": { "project": "web", "team": "ops" }
                },
                { "id": "s2", "name": "api" }
            ]
        }));

        assert!(decoded.is_clean(), "{:?}", decoded.issues);
        let services = &decoded.document.services;
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].proxy.as_ref().map(|p| p.kind), Some(ProxyType::Nginx));
        assert_eq!(
            services[0].docker.as_ref().and_then(|d| d.compose_path.as_deref()),
            Some("/srv/web")
        );

        // Dropped keys do not come back on write
        let text = String::from_utf8(encode_document(&decoded.document).unwrap()).unwrap();
        assert!(!text.contains("legacyPort"));
    }

    #[test]
    fn test_normalize_rejects_bad_url() {
        let doc = Document {
            servers: vec![Server {
                id: "a".into(),
                name: "alpha".into(),
                panel_url: Some("not a url".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = normalize_document(&doc).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(err.to_string().contains("panelUrl"));
    }

    #[test]
    fn test_normalize_trims_strings() {
        let doc = Document {
            services: vec![Service {
                id: "s".into(),
                name: "  web  ".into(),
                server_id: Some(" a ".into()),
                tags: vec![" prod ".into()],
                ..Default::default()
            }],
            domain_order: vec![" zone ".into()],
            ..Default::default()
        };
        let normalized = normalize_document(&doc).unwrap();
        assert_eq!(normalized.services[0].name, "web");
        assert_eq!(normalized.services[0].server_id.as_deref(), Some("a"));
        assert_eq!(normalized.services[0].tags, vec!["prod"]);
        assert_eq!(normalized.domain_order, vec!["zone"]);
    }

    #[test]
    fn test_encoded_form_is_stable() {
        let doc = Document {
            domain_order: vec!["z".into()],
            ..Default::default()
        };
        let bytes = encode_document(&doc).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "{\n  \"version\": 2,\n  \"servers\": [],\n  \"services\": [],\n  \"domainOrder\": [\n    \"z\"\n  ]\n}\n"
        );
    }
}
