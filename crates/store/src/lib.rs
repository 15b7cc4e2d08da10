//! Desired-state cache: the in-memory index of synthesized resources.
//!
//! One entry per synthesis, filled from ResourceSlices and dropped when the
//! owning slot leaves the Composition's status. Readers get point-in-time
//! `Arc` snapshots; fills are single-writer per synthesis.

#![forbid(unsafe_code)]

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use maestro_api::{Composition, ResourceSlice};
use maestro_core::resource::{ManifestRef, Resource, SliceRef};
use maestro_core::{CompositionRef, ResourceRef, SynthesisRef};

/// Work item for the resource reconciler: one resource of one composition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub composition: CompositionRef,
    pub resource: ResourceRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDirection {
    /// Strictly lower readiness groups, ascending.
    Lower,
    /// Strictly higher readiness groups, ascending.
    Higher,
}

#[derive(Debug, Default)]
pub struct FillResult {
    /// One request per cached resource, to seed the reconciler queue.
    pub requests: Vec<Request>,
    /// Manifests that failed to parse. Terminal for those resources.
    pub failures: Vec<(ManifestRef, String)>,
}

struct SynthesisIndex {
    resources: FxHashMap<ResourceRef, Arc<Resource>>,
    by_group: BTreeMap<i64, Vec<Arc<Resource>>>,
    defined_crds: FxHashMap<(String, String), ResourceRef>,
}

type Snapshot = FxHashMap<SynthesisRef, Arc<SynthesisIndex>>;

/// The cache itself. The only mutable process-wide state besides the status
/// write buffer and the schema cache.
///
/// Writes (fills and purges) mutate under a lock and publish a fresh
/// snapshot; readers load the snapshot lock-free and see a stable
/// point-in-time view for the duration of a call.
#[derive(Default)]
pub struct Cache {
    writer: Mutex<Snapshot>,
    snapshot: ArcSwap<Snapshot>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_synthesis(&self, syn: &SynthesisRef) -> bool {
        self.snapshot.load().contains_key(syn)
    }

    /// Index the slices of one synthesis. Idempotent: a synthesis that is
    /// already cached is left untouched since slices are frozen once written.
    pub fn fill(
        &self,
        composition: &CompositionRef,
        uuid: &str,
        slices: &[ResourceSlice],
    ) -> FillResult {
        let syn = SynthesisRef { composition: composition.clone(), uuid: uuid.to_string() };
        if self.has_synthesis(&syn) {
            return FillResult::default();
        }

        let mut out = FillResult::default();
        let mut index = SynthesisIndex {
            resources: FxHashMap::default(),
            by_group: BTreeMap::new(),
            defined_crds: FxHashMap::default(),
        };
        for slice in slices {
            let slice_ref = SliceRef {
                name: slice.metadata.name.clone().unwrap_or_default(),
                namespace: slice.metadata.namespace.clone().unwrap_or_default(),
            };
            for (i, manifest) in slice.spec.resources.iter().enumerate() {
                let resource = match Resource::from_manifest(
                    slice_ref.clone(),
                    i,
                    &manifest.manifest,
                    manifest.deleted,
                ) {
                    Ok(r) => Arc::new(r),
                    Err(err) => {
                        warn!(slice = %slice_ref.name, index = i, error = %err, "invalid manifest in slice");
                        out.failures.push((
                            ManifestRef { slice: slice_ref.clone(), index: i },
                            err.to_string(),
                        ));
                        continue;
                    }
                };
                if let Some(group_kind) = resource.defined_group_kind() {
                    index.defined_crds.insert(group_kind, resource.object_ref.clone());
                }
                index
                    .by_group
                    .entry(resource.readiness_group)
                    .or_default()
                    .push(Arc::clone(&resource));
                out.requests.push(Request {
                    composition: composition.clone(),
                    resource: resource.object_ref.clone(),
                });
                index.resources.insert(resource.object_ref.clone(), resource);
            }
        }

        debug!(
            composition = %composition,
            uuid,
            resources = index.resources.len(),
            "filled synthesis cache"
        );
        let mut writer = self.writer.lock().unwrap();
        writer.insert(syn, Arc::new(index));
        gauge!("cache_syntheses", writer.len() as f64);
        self.snapshot.store(Arc::new(writer.clone()));
        out
    }

    /// Drop syntheses of this composition that are no longer referenced by a
    /// status slot. Passing `None` drops everything (composition deleted).
    pub fn purge(&self, composition: &CompositionRef, comp: Option<&Composition>) {
        let keep: Vec<String> = comp
            .and_then(|c| c.status.as_ref())
            .map(|s| {
                s.current_synthesis
                    .iter()
                    .chain(s.previous_synthesis.iter())
                    .filter(|syn| !syn.uuid.is_empty())
                    .map(|syn| syn.uuid.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut writer = self.writer.lock().unwrap();
        writer.retain(|syn, _| {
            syn.composition != *composition || keep.iter().any(|u| *u == syn.uuid)
        });
        gauge!("cache_syntheses", writer.len() as f64);
        self.snapshot.store(Arc::new(writer.clone()));
    }

    pub fn get(&self, syn: &SynthesisRef, resource: &ResourceRef) -> Option<Arc<Resource>> {
        let index = self.index(syn)?;
        index.resources.get(resource).cloned()
    }

    /// The CRD within the same synthesis that defines `(group, kind)`, if any.
    pub fn get_defining_crd(
        &self,
        syn: &SynthesisRef,
        group: &str,
        kind: &str,
    ) -> Option<Arc<Resource>> {
        let index = self.index(syn)?;
        let crd_ref = index.defined_crds.get(&(group.to_string(), kind.to_string()))?;
        index.resources.get(crd_ref).cloned()
    }

    /// Enumerate resources in groups strictly lower (or higher) than `group`,
    /// in ascending group order.
    pub fn range_by_readiness_group(
        &self,
        syn: &SynthesisRef,
        group: i64,
        direction: RangeDirection,
    ) -> Vec<Arc<Resource>> {
        let Some(index) = self.index(syn) else { return Vec::new() };
        let mut out = Vec::new();
        match direction {
            RangeDirection::Lower => {
                for (_, resources) in index.by_group.range(..group) {
                    out.extend(resources.iter().cloned());
                }
            }
            RangeDirection::Higher => {
                for (_, resources) in
                    index.by_group.range((group + 1)..)
                {
                    out.extend(resources.iter().cloned());
                }
            }
        }
        out
    }

    /// Work items for every resource of a cached synthesis. Used to
    /// re-enqueue the whole synthesis on slice status events.
    pub fn requests_for(&self, syn: &SynthesisRef) -> Vec<Request> {
        let Some(index) = self.index(syn) else { return Vec::new() };
        index
            .resources
            .keys()
            .map(|resource| Request {
                composition: syn.composition.clone(),
                resource: resource.clone(),
            })
            .collect()
    }

    fn index(&self, syn: &SynthesisRef) -> Option<Arc<SynthesisIndex>> {
        self.snapshot.load().get(syn).cloned()
    }
}
