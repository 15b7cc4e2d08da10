//! Dynamic API resolution for downstream resources.
//!
//! The reconciler works on arbitrary kinds, so ApiResources are resolved via
//! server discovery and memoized per GVK key.

use anyhow::{anyhow, Result};
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

use maestro_core::Gvk;

// GVK key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn to_kube_gvk(gvk: &Gvk) -> GroupVersionKind {
    GroupVersionKind {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
    }
}

/// Resolve an ApiResource for the GVK, running discovery on cache misses.
pub async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(ApiResource, bool)> {
    let key = gvk_key(gvk);
    if let Some((ar, namespaced)) = DISCOVERY_CACHE.read().unwrap().get(&key).cloned() {
        return Ok((ar, namespaced));
    }
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE
                    .write()
                    .unwrap()
                    .insert(key, (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}", key))
}

/// A CRD that just became ready may not be discoverable yet; drop it from
/// the cache so the next lookup re-runs discovery.
pub fn invalidate(gvk: &GroupVersionKind) {
    DISCOVERY_CACHE.write().unwrap().remove(&gvk_key(gvk));
}

pub fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, ar),
            None => Api::all_with(client, ar),
        }
    } else {
        Api::all_with(client, ar)
    }
}
