//! Patch computation: three-way merges and JSON-patch evaluation.
//!
//! The reconciler hands us (previous desired, next desired, current actual)
//! and we produce the minimal patch that moves current toward next while
//! preserving fields other actors own. With OpenAPI merge metadata the patch
//! is strategic (keyed lists merge element-wise); without it we fall back to
//! a plain JSON merge patch.

#![forbid(unsafe_code)]

use anyhow::anyhow;
use serde_json::{Map, Value};

use maestro_core::{Gvk, ReconcileError};
use maestro_schema::SchemaModel;

/// Closed set of patch encodings the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Json,
    Merge,
    Strategic,
}

impl PatchType {
    pub fn media_type(&self) -> &'static str {
        match self {
            PatchType::Json => "application/json-patch+json",
            PatchType::Merge => "application/merge-patch+json",
            PatchType::Strategic => "application/strategic-merge-patch+json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuiltPatch {
    pub payload: Value,
    pub patch_type: PatchType,
}

/// Strategic merge has a semantic-equality gap for PodDisruptionBudget;
/// excluded until that is implemented.
fn excluded_from_strategic(gvk: &Gvk) -> bool {
    gvk.group == "policy" && gvk.version == "v1" && gvk.kind == "PodDisruptionBudget"
}

/// Compute the three-way patch for a full-manifest resource. `None` means
/// current already matches and nothing should be written.
pub fn build_patch(
    prev: Option<&Value>,
    next: &Value,
    current: &Value,
    model: Option<&SchemaModel>,
    gvk: &Gvk,
) -> Result<Option<BuiltPatch>, ReconcileError> {
    if !next.is_object() || !current.is_object() {
        return Err(ReconcileError::terminal(anyhow!(
            "desired and current state must be JSON objects"
        )));
    }
    let empty = Value::Object(Map::new());
    let prev = prev.unwrap_or(&empty);

    let model = match model {
        Some(m) if !excluded_from_strategic(gvk) => Some(m),
        _ => None,
    };
    let schema = model.and_then(|m| m.root_schema().map(|s| (m, s)));
    let patch_type = if schema.is_some() { PatchType::Strategic } else { PatchType::Merge };

    match three_way(prev, next, current, schema) {
        Some(payload) => Ok(Some(BuiltPatch { payload, patch_type })),
        None => Ok(None),
    }
}

/// Recursive three-way diff. Additions and changes come from comparing
/// current against next; deletions from comparing prev against next. Fields
/// present only in current are left alone. With schema context, keyed lists
/// merge per element and removals become `$patch: delete` directives.
fn three_way(
    prev: &Value,
    next: &Value,
    current: &Value,
    schema: Option<(&SchemaModel, &Value)>,
) -> Option<Value> {
    let next_obj = next.as_object()?;
    let current_obj = current.as_object().cloned().unwrap_or_default();
    let prev_obj = prev.as_object().cloned().unwrap_or_default();

    let mut patch = Map::new();
    for (key, next_val) in next_obj {
        let field_schema =
            schema.and_then(|(model, node)| model.property(node, key).map(|f| (model, f)));
        match current_obj.get(key) {
            None => {
                patch.insert(key.clone(), next_val.clone());
            }
            Some(current_val) => match (next_val, current_val) {
                (Value::Object(_), Value::Object(_)) => {
                    let sub_prev = prev_obj.get(key).cloned().unwrap_or(Value::Null);
                    let resolved = field_schema
                        .map(|(model, f)| (model, model.resolve(f)));
                    if let Some(sub) = three_way(&sub_prev, next_val, current_val, resolved) {
                        patch.insert(key.clone(), sub);
                    }
                }
                (Value::Array(next_arr), Value::Array(current_arr)) => {
                    let merge_key = field_schema
                        .and_then(|(model, f)| model.patch_merge_key(f).map(|k| k.to_string()));
                    match merge_key {
                        Some(merge_key) => {
                            let item_schema = field_schema.and_then(|(model, f)| {
                                model.items(f).map(|i| (model, i))
                            });
                            let prev_arr = prev_obj
                                .get(key)
                                .and_then(|v| v.as_array())
                                .cloned()
                                .unwrap_or_default();
                            if let Some(items) = keyed_list_patch(
                                &prev_arr,
                                next_arr,
                                current_arr,
                                &merge_key,
                                item_schema,
                            ) {
                                patch.insert(key.clone(), Value::Array(items));
                            }
                        }
                        // Unkeyed lists replace wholesale.
                        None => {
                            if next_val != current_val {
                                patch.insert(key.clone(), next_val.clone());
                            }
                        }
                    }
                }
                _ => {
                    if next_val != current_val {
                        patch.insert(key.clone(), next_val.clone());
                    }
                }
            },
        }
    }

    // Deletions: fields the previous desired state managed but the next one
    // no longer declares.
    for (key, _) in prev_obj.iter() {
        if !next_obj.contains_key(key) && !patch.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    if patch.is_empty() {
        None
    } else {
        Some(Value::Object(patch))
    }
}

fn keyed_list_patch(
    prev: &[Value],
    next: &[Value],
    current: &[Value],
    merge_key: &str,
    item_schema: Option<(&SchemaModel, &Value)>,
) -> Option<Vec<Value>> {
    let find = |items: &[Value], key_val: &Value| -> Option<Value> {
        items.iter().find(|i| i.get(merge_key) == Some(key_val)).cloned()
    };

    let mut out = Vec::new();
    for next_elem in next {
        let Some(key_val) = next_elem.get(merge_key).cloned() else {
            // An element without its merge key cannot be addressed; send it
            // verbatim and let the apiserver complain.
            out.push(next_elem.clone());
            continue;
        };
        match find(current, &key_val) {
            None => out.push(next_elem.clone()),
            Some(current_elem) => {
                let prev_elem = find(prev, &key_val).unwrap_or(Value::Null);
                let resolved =
                    item_schema.map(|(model, s)| (model, model.resolve(s)));
                if let Some(mut sub) = three_way(&prev_elem, next_elem, &current_elem, resolved)
                {
                    if let Some(obj) = sub.as_object_mut() {
                        obj.insert(merge_key.to_string(), key_val);
                    }
                    out.push(sub);
                }
            }
        }
    }

    for prev_elem in prev {
        let Some(key_val) = prev_elem.get(merge_key) else { continue };
        if find(next, key_val).is_none() {
            let mut directive = Map::new();
            directive.insert(merge_key.to_string(), key_val.clone());
            directive.insert("$patch".to_string(), Value::String("delete".to_string()));
            out.push(Value::Object(directive));
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Prepare a merge/strategic patch body for the wire: inject the observed
/// resourceVersion for optimistic concurrency, strip server-owned fields,
/// and collapse to `None` when nothing but the resourceVersion remains.
pub fn munge_patch(patch: Value, resource_version: &str) -> Result<Option<Value>, ReconcileError> {
    let Value::Object(mut patch) = patch else {
        return Err(ReconcileError::terminal(anyhow!("patch must be a JSON object")));
    };
    patch.remove("status");

    let metadata = patch
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(metadata) = metadata.as_object_mut() else {
        return Err(ReconcileError::terminal(anyhow!("patch metadata must be an object")));
    };
    metadata.remove("creationTimestamp");
    metadata.insert(
        "resourceVersion".to_string(),
        Value::String(resource_version.to_string()),
    );

    let rv_only = patch.len() == 1
        && patch
            .get("metadata")
            .and_then(|m| m.as_object())
            .map(|m| m.len() == 1 && m.contains_key("resourceVersion"))
            .unwrap_or(false);
    if rv_only {
        return Ok(None);
    }
    Ok(Some(Value::Object(patch)))
}

/// Would applying this RFC 6902 patch change `current`? Used to decide
/// whether an explicit patch-form resource needs another write. A failed
/// `test` op means the patch does not apply (not an error); malformed ops
/// and invalid pointers are terminal.
pub fn json_patch_would_change(ops: &Value, current: &Value) -> Result<bool, ReconcileError> {
    let patch: json_patch::Patch = serde_json::from_value(ops.clone()).map_err(|err| {
        ReconcileError::terminal(anyhow!(err).context("invalid patch ops"))
    })?;
    let mut doc = current.clone();
    match json_patch::patch(&mut doc, &patch) {
        Ok(()) => Ok(doc != *current),
        Err(err) if matches!(err.kind, json_patch::PatchErrorKind::TestFailed) => Ok(false),
        Err(err) => Err(ReconcileError::terminal(
            anyhow!(err).context("applying patch ops"),
        )),
    }
}
