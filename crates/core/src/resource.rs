//! Parsed form of a single synthesized resource.
//!
//! ResourceSlices carry opaque manifest strings; this module turns one into
//! the typed view the reconciler works with: identity, readiness metadata,
//! and the various `eno.azure.io/*` annotations that shape reconciliation.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::readiness::ReadinessChecks;
use crate::ResourceRef;

pub const READINESS_GROUP_ANNOTATION: &str = "eno.azure.io/readiness-group";
pub const READINESS_ANNOTATION: &str = "eno.azure.io/readiness";
pub const RECONCILE_INTERVAL_ANNOTATION: &str = "eno.azure.io/reconcile-interval";
pub const DISABLE_UPDATES_ANNOTATION: &str = "eno.azure.io/disable-updates";

const PATCH_API_VERSION: &str = "eno.azure.io/v1";
const PATCH_KIND: &str = "Patch";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SliceRef {
    pub name: String,
    pub namespace: String,
}

/// Position of one manifest within a ResourceSlice. Together with the
/// synthesis UUID this is the durable identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ManifestRef {
    pub slice: SliceRef,
    pub index: usize,
}

#[derive(Debug)]
pub struct Resource {
    pub object_ref: ResourceRef,
    pub gvk: Gvk,
    pub manifest_ref: ManifestRef,
    /// Desired state with engine annotations stripped.
    pub manifest: Value,
    pub readiness_group: i64,
    pub readiness_checks: ReadinessChecks,
    pub reconcile_interval: Option<Duration>,
    pub disable_updates: bool,
    /// RFC 6902 operations when the resource is an explicit patch. Patch
    /// resources are never created, only applied to pre-existing objects.
    pub patch: Option<Value>,
    pub deleted: bool,

    last_seen_version: Mutex<Option<String>>,
    last_reconciled: Mutex<Option<Instant>>,
}

impl Resource {
    /// Parse one slice manifest. Errors here are terminal for the resource:
    /// the manifest is frozen for the lifetime of its synthesis.
    pub fn from_manifest(
        slice: SliceRef,
        index: usize,
        manifest: &str,
        deleted: bool,
    ) -> Result<Self> {
        let mut value: Value = parse_json_or_yaml(manifest)?;

        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest missing apiVersion"))?
            .to_string();
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest missing kind"))?
            .to_string();
        let name = value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest missing metadata.name"))?
            .to_string();
        let namespace = value
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let manifest_ref = ManifestRef { slice, index };

        // Patch pseudo-resources target an object of another kind and carry
        // a JSON-patch instead of a full manifest.
        if api_version == PATCH_API_VERSION && kind == PATCH_KIND {
            let target = value
                .get("patch")
                .ok_or_else(|| anyhow!("Patch resource missing .patch"))?;
            let target_api_version = target
                .get("apiVersion")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("Patch resource missing .patch.apiVersion"))?;
            let target_kind = target
                .get("kind")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("Patch resource missing .patch.kind"))?;
            let ops = target
                .get("ops")
                .cloned()
                .ok_or_else(|| anyhow!("Patch resource missing .patch.ops"))?;
            if !ops.is_array() {
                return Err(anyhow!("Patch resource .patch.ops must be an array"));
            }
            let gvk = Gvk::from_api_version(target_api_version, target_kind);
            return Ok(Self {
                object_ref: ResourceRef {
                    group: gvk.group.clone(),
                    kind: gvk.kind.clone(),
                    name,
                    namespace,
                },
                gvk,
                manifest_ref,
                manifest: Value::Null,
                readiness_group: read_readiness_group(&value),
                readiness_checks: ReadinessChecks::from_annotations(annotations(&value)),
                reconcile_interval: read_reconcile_interval(&value),
                disable_updates: false,
                patch: Some(ops),
                deleted,
                last_seen_version: Mutex::new(None),
                last_reconciled: Mutex::new(None),
            });
        }

        let gvk = Gvk::from_api_version(&api_version, &kind);
        let readiness_group = read_readiness_group(&value);
        let readiness_checks = ReadinessChecks::from_annotations(annotations(&value));
        let reconcile_interval = read_reconcile_interval(&value);
        let disable_updates = annotations(&value)
            .and_then(|a| a.get(DISABLE_UPDATES_ANNOTATION))
            .and_then(|v| v.as_str())
            .map(|v| v == "true")
            .unwrap_or(false);
        strip_engine_annotations(&mut value);

        Ok(Self {
            object_ref: ResourceRef {
                group: gvk.group.clone(),
                kind: gvk.kind.clone(),
                name,
                namespace,
            },
            gvk,
            manifest_ref,
            manifest: value,
            readiness_group,
            readiness_checks,
            reconcile_interval,
            disable_updates,
            patch: None,
            deleted,
            last_seen_version: Mutex::new(None),
            last_reconciled: Mutex::new(None),
        })
    }

    pub fn is_patch(&self) -> bool {
        self.patch.is_some()
    }

    pub fn is_crd(&self) -> bool {
        self.gvk.group == "apiextensions.k8s.io" && self.gvk.kind == "CustomResourceDefinition"
    }

    /// For CRD manifests: the (group, kind) the CRD defines.
    pub fn defined_group_kind(&self) -> Option<(String, String)> {
        if !self.is_crd() {
            return None;
        }
        let spec = self.manifest.get("spec")?;
        let group = spec.get("group")?.as_str()?.to_string();
        let kind = spec.get("names")?.get("kind")?.as_str()?.to_string();
        Some((group, kind))
    }

    /// Remember the downstream resourceVersion observed after a clean sync.
    /// An empty string invalidates the cache.
    pub fn observe_version(&self, rv: &str) {
        let mut guard = self.last_seen_version.lock().unwrap();
        if rv.is_empty() {
            *guard = None;
        } else {
            *guard = Some(rv.to_string());
        }
    }

    pub fn has_been_seen(&self) -> bool {
        self.last_seen_version.lock().unwrap().is_some()
    }

    pub fn matches_last_seen(&self, rv: &str) -> bool {
        self.last_seen_version.lock().unwrap().as_deref() == Some(rv)
    }

    /// Track wall time between reconciliations of this resource. Returns the
    /// interval since the previous observation, if any.
    pub fn observe_reconciliation(&self) -> Option<Duration> {
        let mut guard = self.last_reconciled.lock().unwrap();
        let now = Instant::now();
        let prev = guard.replace(now);
        prev.map(|p| now.duration_since(p))
    }
}

fn parse_json_or_yaml(manifest: &str) -> Result<Value> {
    match serde_json::from_str(manifest) {
        Ok(v) => Ok(v),
        Err(_) => {
            let yaml: serde_yaml::Value =
                serde_yaml::from_str(manifest).context("parsing manifest")?;
            serde_json::to_value(yaml).context("converting manifest to JSON")
        }
    }
}

fn annotations(value: &Value) -> Option<&serde_json::Map<String, Value>> {
    value.get("metadata")?.get("annotations")?.as_object()
}

fn read_readiness_group(value: &Value) -> i64 {
    let Some(raw) = annotations(value)
        .and_then(|a| a.get(READINESS_GROUP_ANNOTATION))
        .and_then(|v| v.as_str())
    else {
        return 0;
    };
    match raw.parse::<i64>() {
        Ok(group) => group,
        Err(_) => {
            warn!(value = raw, "invalid readiness-group annotation; defaulting to 0");
            0
        }
    }
}

fn read_reconcile_interval(value: &Value) -> Option<Duration> {
    let raw = annotations(value)
        .and_then(|a| a.get(RECONCILE_INTERVAL_ANNOTATION))
        .and_then(|v| v.as_str())?;
    match humantime::parse_duration(raw) {
        Ok(d) => Some(d),
        Err(_) => {
            warn!(value = raw, "invalid reconcile-interval annotation; ignoring");
            None
        }
    }
}

/// Engine annotations configure reconciliation; they are not part of the
/// desired state sent downstream.
fn strip_engine_annotations(value: &mut Value) {
    let Some(meta) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
        return;
    };
    let mut drop_annotations = false;
    if let Some(ann) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
        ann.retain(|k, _| !k.starts_with("eno.azure.io/"));
        drop_annotations = ann.is_empty();
    }
    if drop_annotations {
        meta.remove("annotations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slice() -> SliceRef {
        SliceRef { name: "slice-0".into(), namespace: "default".into() }
    }

    #[test]
    fn parses_plain_manifest_with_annotations() {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "annotations": {
                    "eno.azure.io/readiness-group": "2",
                    "eno.azure.io/reconcile-interval": "5m",
                    "eno.azure.io/disable-updates": "true",
                    "team": "platform"
                }
            },
            "spec": {"replicas": 1}
        });
        let res =
            Resource::from_manifest(slice(), 0, &manifest.to_string(), false).unwrap();

        assert_eq!(res.gvk.group, "apps");
        assert_eq!(res.gvk.version, "v1");
        assert_eq!(res.object_ref.name, "web");
        assert_eq!(res.readiness_group, 2);
        assert_eq!(res.reconcile_interval, Some(Duration::from_secs(300)));
        assert!(res.disable_updates);
        assert!(!res.is_patch());

        // Engine annotations are stripped, user annotations kept.
        let ann = res.manifest["metadata"]["annotations"].as_object().unwrap();
        assert_eq!(ann.len(), 1);
        assert_eq!(ann["team"], "platform");
    }

    #[test]
    fn parses_yaml_manifest() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: ns\ndata:\n  k: v\n";
        let res = Resource::from_manifest(slice(), 1, manifest, false).unwrap();
        assert_eq!(res.gvk.kind, "ConfigMap");
        assert_eq!(res.object_ref.namespace.as_deref(), Some("ns"));
        assert_eq!(res.readiness_group, 0);
    }

    #[test]
    fn parses_patch_pseudo_resource() {
        let manifest = json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "Patch",
            "metadata": {"name": "web", "namespace": "default"},
            "patch": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "ops": [
                    {"op": "replace", "path": "/spec/replicas", "value": 3}
                ]
            }
        });
        let res =
            Resource::from_manifest(slice(), 0, &manifest.to_string(), false).unwrap();
        assert!(res.is_patch());
        assert_eq!(res.gvk.kind, "Deployment");
        assert_eq!(res.object_ref.kind, "Deployment");
        assert_eq!(res.patch.as_ref().unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn rejects_manifest_without_name() {
        let manifest = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}});
        let err = Resource::from_manifest(slice(), 0, &manifest.to_string(), false)
            .unwrap_err()
            .to_string();
        assert!(err.contains("metadata.name"), "{err}");
    }

    #[test]
    fn invalid_readiness_group_defaults_to_zero() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "annotations": {"eno.azure.io/readiness-group": "not-a-number"}
            }
        });
        let res =
            Resource::from_manifest(slice(), 0, &manifest.to_string(), false).unwrap();
        assert_eq!(res.readiness_group, 0);
    }

    #[test]
    fn crd_defined_group_kind() {
        let manifest = json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {
                "group": "example.com",
                "names": {"kind": "Widget", "plural": "widgets"}
            }
        });
        let res =
            Resource::from_manifest(slice(), 0, &manifest.to_string(), false).unwrap();
        assert!(res.is_crd());
        assert_eq!(
            res.defined_group_kind(),
            Some(("example.com".to_string(), "Widget".to_string()))
        );
    }

    #[test]
    fn version_observation_round_trip() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"}
        });
        let res =
            Resource::from_manifest(slice(), 0, &manifest.to_string(), false).unwrap();
        assert!(!res.has_been_seen());
        res.observe_version("41");
        assert!(res.has_been_seen());
        assert!(res.matches_last_seen("41"));
        assert!(!res.matches_last_seen("42"));
        res.observe_version("");
        assert!(!res.has_been_seen());
    }
}
