//! Maestro custom resource types.
//!
//! These are the durable objects the engine drives: a Composition pairs a
//! Synthesizer with inputs and carries up to two synthesis slots in its
//! status; ResourceSlices hold the synthesized manifests plus per-resource
//! reconciliation state.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Composition annotation controlling downstream deletion behavior.
pub const DELETION_STRATEGY_ANNOTATION: &str = "eno.azure.io/deletion-strategy";
pub const DELETION_STRATEGY_ORPHAN: &str = "orphan";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Composition",
    namespaced,
    status = "CompositionStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSpec {
    pub synthesizer: SynthesizerRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerRef {
    pub name: String,
    /// Optional floor on the synthesizer generation a synthesis may observe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_generation: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InputRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<BoundResourceRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub key: String,
    pub resource: BoundResourceRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BoundResourceRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_synthesis: Option<Synthesis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_synthesis: Option<Synthesis>,
}

/// One attempt to produce a resource set for a Composition.
///
/// Lifecycle: created pending (empty UUID) -> dispatched (UUID assigned) ->
/// initialized (pod created) -> synthesized (output captured) -> reconciled ->
/// ready. The UUID is assigned exactly once; the resource set is frozen once
/// `synthesized` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synthesis {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default)]
    pub observed_composition_generation: i64,
    #[serde(default)]
    pub observed_synthesizer_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesized: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Time>,
    #[serde(default)]
    pub attempts: i32,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_slices: Vec<ResourceSliceRef>,
}

impl Synthesis {
    /// Pending syntheses have been authored but not yet admitted by the
    /// concurrency limiter.
    pub fn is_pending(&self) -> bool {
        self.uuid.is_empty() && self.synthesized.is_none()
    }

    /// Active syntheses hold a concurrency slot: dispatched but not yet
    /// synthesized.
    pub fn is_active(&self) -> bool {
        !self.uuid.is_empty() && self.synthesized.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceRef {
    pub name: String,
}

impl Composition {
    pub fn current_synthesis_uuid(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.current_synthesis.as_ref())
            .map(|s| s.uuid.as_str())
            .unwrap_or("")
    }

    /// Install a fresh pending synthesis slot, swapping current into previous.
    ///
    /// The swap is a single in-memory mutation so callers can persist it with
    /// one status update. A current slot that never synthesized is discarded
    /// rather than demoted: its output was never captured, so it cannot serve
    /// as the "prev" side of a three-way merge.
    pub fn begin_synthesis(&mut self, observed_synthesizer_generation: i64) {
        let generation = self.metadata.generation.unwrap_or_default();
        let status = self.status.get_or_insert_with(CompositionStatus::default);
        if let Some(current) = status.current_synthesis.take() {
            if current.synthesized.is_some() {
                status.previous_synthesis = Some(current);
            }
        }
        status.current_synthesis = Some(Synthesis {
            observed_composition_generation: generation,
            observed_synthesizer_generation,
            ..Synthesis::default()
        });
    }
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Synthesizer",
    status = "SynthesizerStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerSpec {
    /// Container image of the synthesizer program.
    pub image: String,
    /// Inputs the synthesizer declares. Compositions bind them by key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<SynthesizerInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerInput {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerStatus {
    /// Set every time a synthesizer change is rolled out to a composition.
    /// The rollout controller spaces rollouts by at least its cooldown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rollout_time: Option<Time>,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "ResourceSlice",
    namespaced,
    status = "ResourceSliceStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceSpec {
    #[serde(default)]
    pub composition_generation: i64,
    #[serde(default)]
    pub synthesis_uuid: String,
    /// Immutable once written. Only the slice status may change afterwards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Manifest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Serialized desired state (JSON) as emitted by the synthesizer.
    pub manifest: String,
    /// True when the resource should be removed from the downstream cluster.
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceStatus {
    /// Indexed 1:1 with `spec.resources`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceState>,
}

/// Reconciliation state of a single resource within a slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    #[serde(default)]
    pub reconciled: bool,
    /// Stable for the lifetime of the owning synthesis once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Time>,
    #[serde(default)]
    pub deleted: bool,
}
