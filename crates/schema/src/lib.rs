//! Schema discovery cache: OpenAPI metadata for strategic merge patches.
//!
//! Fetches the downstream aggregated `/openapi/v2` document on demand,
//! memoizes per-GVK models, and rate-limits refetches. Unknown kinds resolve
//! to `None` and the caller falls back to a plain JSON merge patch.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use maestro_core::Gvk;

/// Merge metadata for one GVK, backed by the shared definitions document.
#[derive(Debug, Clone)]
pub struct SchemaModel {
    definitions: Arc<FxHashMap<String, Value>>,
    root: String,
}

impl SchemaModel {
    pub fn new(definitions: Arc<FxHashMap<String, Value>>, root: String) -> Self {
        Self { definitions, root }
    }

    pub fn root_schema(&self) -> Option<&Value> {
        self.definitions.get(&self.root)
    }

    /// Chase `$ref` links until an inline schema is reached.
    pub fn resolve<'a>(&'a self, mut schema: &'a Value) -> &'a Value {
        for _ in 0..8 {
            let Some(reference) = schema.get("$ref").and_then(|r| r.as_str()) else {
                return schema;
            };
            let Some(name) = reference.strip_prefix("#/definitions/") else {
                return schema;
            };
            match self.definitions.get(name) {
                Some(next) => schema = next,
                None => return schema,
            }
        }
        schema
    }

    /// Schema of a named property, `$ref`-resolved at the parent only. The
    /// returned value may itself be a `$ref` (callers resolve when needed so
    /// field-level patch annotations are not lost).
    pub fn property<'a>(&'a self, schema: &'a Value, field: &str) -> Option<&'a Value> {
        self.resolve(schema).get("properties")?.get(field)
    }

    /// Item schema of an array property.
    pub fn items<'a>(&'a self, schema: &'a Value) -> Option<&'a Value> {
        self.resolve(schema).get("items")
    }

    /// `x-kubernetes-patch-merge-key` of an array field, present only when
    /// the field merges by key rather than replacing wholesale.
    pub fn patch_merge_key<'a>(&self, field_schema: &'a Value) -> Option<&'a str> {
        let strategy = field_schema
            .get("x-kubernetes-patch-strategy")
            .and_then(|s| s.as_str())
            .unwrap_or("");
        if !strategy.split(',').any(|s| s == "merge") {
            return None;
        }
        field_schema.get("x-kubernetes-patch-merge-key").and_then(|k| k.as_str())
    }
}

struct FetchState {
    definitions: Option<Arc<FxHashMap<String, Value>>>,
    next_allowed: Instant,
}

/// On-demand, rate-limited schema discovery with single-flight fetches.
pub struct DiscoveryCache {
    client: kube::Client,
    min_interval: Duration,
    fetch: Mutex<FetchState>,
    models: RwLock<FxHashMap<String, Option<SchemaModel>>>,
}

impl DiscoveryCache {
    pub fn new(client: kube::Client, rps: f64) -> Self {
        let min_interval = if rps > 0.0 {
            Duration::from_secs_f64(1.0 / rps)
        } else {
            Duration::ZERO
        };
        Self {
            client,
            min_interval,
            fetch: Mutex::new(FetchState {
                definitions: None,
                next_allowed: Instant::now(),
            }),
            models: RwLock::new(FxHashMap::default()),
        }
    }

    /// Resolve merge metadata for a GVK. `Ok(None)` means the downstream
    /// apiserver doesn't advertise the kind (or has no schema for it).
    pub async fn get(&self, gvk: &Gvk) -> Result<Option<SchemaModel>> {
        let key = gvk_key(gvk);
        if let Some(model) = self.models.read().unwrap().get(&key) {
            return Ok(model.clone());
        }

        let definitions = self.load_definitions().await?;
        let model = find_definition(&definitions, gvk)
            .map(|root| SchemaModel::new(Arc::clone(&definitions), root));
        if model.is_none() {
            debug!(gvk = %key, "no openapi definition; merge patches will be non-strategic");
        }
        self.models.write().unwrap().insert(key, model.clone());
        Ok(model)
    }

    async fn load_definitions(&self) -> Result<Arc<FxHashMap<String, Value>>> {
        let mut state = self.fetch.lock().await;
        if let Some(defs) = &state.definitions {
            return Ok(Arc::clone(defs));
        }

        // External rate limit applies to document fetches only.
        let now = Instant::now();
        if state.next_allowed > now {
            tokio::time::sleep_until(state.next_allowed).await;
        }
        state.next_allowed = Instant::now() + self.min_interval;

        counter!("schema_fetches_total", 1u64);
        let request = http::Request::get("/openapi/v2")
            .body(Vec::new())
            .context("building openapi request")?;
        let body = self
            .client
            .request_text(request)
            .await
            .context("fetching /openapi/v2")?;
        let doc: Value = serde_json::from_str(&body).context("parsing openapi document")?;
        let mut definitions = FxHashMap::default();
        if let Some(defs) = doc.get("definitions").and_then(|d| d.as_object()) {
            for (name, schema) in defs {
                definitions.insert(name.clone(), schema.clone());
            }
        } else {
            warn!("openapi document has no definitions");
        }
        let definitions = Arc::new(definitions);
        state.definitions = Some(Arc::clone(&definitions));
        Ok(definitions)
    }
}

fn gvk_key(gvk: &Gvk) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Locate the definition advertising this GVK via
/// `x-kubernetes-group-version-kind`.
fn find_definition(definitions: &FxHashMap<String, Value>, gvk: &Gvk) -> Option<String> {
    for (name, schema) in definitions {
        let Some(gvks) = schema.get("x-kubernetes-group-version-kind").and_then(|g| g.as_array())
        else {
            continue;
        };
        for candidate in gvks {
            let group = candidate.get("group").and_then(|v| v.as_str()).unwrap_or("");
            let version = candidate.get("version").and_then(|v| v.as_str()).unwrap_or("");
            let kind = candidate.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            if group == gvk.group && version == gvk.version && kind == gvk.kind {
                return Some(name.clone());
            }
        }
    }
    None
}
