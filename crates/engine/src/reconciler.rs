//! Per-resource reconciliation against the downstream cluster.
//!
//! One work item is one resource of one composition. Each pass diffs the
//! desired state from the cache against the live object, honoring CRD
//! ordering, readiness groups, and readiness checks, then reports the
//! resource state through the write buffer. Patches are three-way merges so
//! fields owned by other actors survive.

use anyhow::{anyhow, Context};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::dynamic;
use crate::write_buffer::{StatusPatchFn, WriteBuffer};
use maestro_api::{
    Composition, ResourceSlice, ResourceState, DELETION_STRATEGY_ANNOTATION,
    DELETION_STRATEGY_ORPHAN,
};
use maestro_apply::{build_patch, json_patch_would_change, munge_patch, PatchType};
use maestro_core::resource::{ManifestRef, Resource};
use maestro_core::{
    is_missing_namespace_message, jitter, CompositionRef, ReconcileError, SynthesisRef,
};
use maestro_schema::DiscoveryCache;
use maestro_store::{Cache, RangeDirection, Request};

/// Debug-only escape hatch: patch bodies may contain secret material.
static INSECURE_LOG_PATCH: Lazy<bool> =
    Lazy::new(|| std::env::var("INSECURE_LOG_PATCH").as_deref() == Ok("true"));

/// The apiserver doesn't close the loop on CRD registration; give it a full
/// second after the CRD reports ready.
const CRD_GRACE: Duration = Duration::from_secs(1);

/// What a reconcile pass should do to the downstream object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    Delete,
    Create,
    JsonPatch,
    DiffPatch,
}

/// Pure action selection; the orderings here encode several invariants:
/// explicit-patch resources are never created, deletions honor the orphan
/// strategy, and `DisableUpdates` suppresses diffs but not creation.
/// `deleted` covers both the manifest's flag and a deleting composition.
pub fn plan_action(
    resource: &Resource,
    deleted: bool,
    current_exists: bool,
    current_deleting: bool,
    orphan: bool,
) -> Action {
    if deleted {
        if !current_exists || current_deleting || orphan {
            return Action::Skip;
        }
        return Action::Delete;
    }
    if resource.is_patch() {
        // Only patch pre-existing objects.
        if current_exists {
            return Action::JsonPatch;
        }
        return Action::Skip;
    }
    if !current_exists {
        return Action::Create;
    }
    if resource.disable_updates {
        return Action::Skip;
    }
    Action::DiffPatch
}

/// Requeue policy after a clean pass.
pub fn requeue_after(
    resource: &Resource,
    deleted: bool,
    ready: bool,
    readiness_poll_interval: Duration,
) -> Option<Duration> {
    if !ready {
        return Some(jitter(readiness_poll_interval));
    }
    if deleted {
        return None;
    }
    resource.reconcile_interval.map(jitter)
}

/// Status patch for the write buffer; returns `None` when the prior state
/// already matches so an unchanged pass performs zero writes.
pub fn resource_state_patch(deleted: bool, ready: Option<Time>) -> StatusPatchFn {
    Arc::new(move |prior| {
        let next = ResourceState { reconciled: true, ready: ready.clone(), deleted };
        if prior == Some(&next) {
            return None;
        }
        Some(next)
    })
}

pub struct ResourceReconciler {
    client: Client,
    downstream: Client,
    cache: Arc<Cache>,
    discovery: Arc<DiscoveryCache>,
    write_buffer: Arc<WriteBuffer>,
    readiness_poll_interval: Duration,
}

impl ResourceReconciler {
    pub fn new(
        client: Client,
        downstream: Client,
        cache: Arc<Cache>,
        discovery: Arc<DiscoveryCache>,
        write_buffer: Arc<WriteBuffer>,
        readiness_poll_interval: Duration,
    ) -> Self {
        Self { client, downstream, cache, discovery, write_buffer, readiness_poll_interval }
    }

    /// One pass over one resource. `Ok(Some(d))` requests a timed requeue;
    /// dropped items are re-enqueued by cache fills and slice events.
    pub async fn reconcile(&self, req: &Request) -> Result<Option<Duration>, ReconcileError> {
        let comp_api: Api<Composition> =
            Api::namespaced(self.client.clone(), &req.composition.namespace);
        let Some(comp) = comp_api
            .get_opt(&req.composition.name)
            .await
            .context("getting composition")?
        else {
            return Ok(None);
        };
        let Some(current_syn) =
            comp.status.as_ref().and_then(|s| s.current_synthesis.as_ref())
        else {
            return Ok(None);
        };
        let comp_deleting = comp.metadata.deletion_timestamp.is_some();
        if current_syn.failed && !comp_deleting {
            return Ok(None);
        }

        // During composition teardown the desired state comes from whichever
        // slot actually produced output.
        let mut syn_uuid = current_syn.uuid.clone();
        if comp_deleting {
            if let Some(td) = crate::pod_lifecycle::teardown_synthesis(&comp) {
                syn_uuid = td.uuid.clone();
            }
        }
        let syn_ref = SynthesisRef {
            composition: req.composition.clone(),
            uuid: syn_uuid,
        };
        let Some(resource) = self.cache.get(&syn_ref, &req.resource) else {
            // The manifest no longer exists at this synthesis; filling the
            // replacement will enqueue a fresh work item.
            debug!(resource = %req.resource, "dropping work item for vanished synthesis");
            return Ok(None);
        };
        let prev = comp
            .status
            .as_ref()
            .and_then(|s| s.previous_synthesis.as_ref())
            .filter(|syn| !syn.uuid.is_empty())
            .and_then(|syn| {
                let prev_ref = SynthesisRef {
                    composition: req.composition.clone(),
                    uuid: syn.uuid.clone(),
                };
                self.cache.get(&prev_ref, &req.resource)
            });

        // Report how far reconciliation is drifting behind the configured
        // interval; identifies loops that can't keep up.
        if let Some(interval) = resource.reconcile_interval {
            if let Some(observed) = resource.observe_reconciliation() {
                let delta = observed.as_secs_f64() - interval.as_secs_f64();
                histogram!("reconciliation_schedule_delta_seconds", delta);
            }
        }

        // CRDs must be reconciled before CRs of the types they define;
        // apiserver ignores unknown fields, so ordering is required for
        // same-synthesis schema additions.
        if !resource.is_crd() {
            if let Some(crd) = self.cache.get_defining_crd(
                &syn_ref,
                &resource.gvk.group,
                &resource.gvk.kind,
            ) {
                let crd_state = self.slice_state(&req.composition, &crd.manifest_ref).await?;
                let Some(crd_ready) = crd_state.and_then(|s| s.ready) else {
                    debug!(resource = %req.resource, "deferring until the defining CRD is ready");
                    return Ok(None);
                };
                let since = Utc::now()
                    .signed_duration_since(crd_ready.0)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if since < CRD_GRACE {
                    dynamic::invalidate(&dynamic::to_kube_gvk(&resource.gvk));
                    return Ok(Some(CRD_GRACE - since));
                }
            }
        }

        // A deleting composition tears down everything it created, unless
        // the orphan strategy says otherwise.
        let deleted = resource.deleted || comp_deleting;

        let gvk = dynamic::to_kube_gvk(&resource.gvk);
        let (ar, namespaced) = dynamic::find_api_resource(self.downstream.clone(), &gvk)
            .await
            .context("resolving downstream api resource")?;
        let api = dynamic::dynamic_api(
            self.downstream.clone(),
            &ar,
            namespaced,
            resource.object_ref.namespace.as_deref(),
        );

        let (current, has_changed) = self.get_current(&api, &resource, deleted).await?;
        let state = self.slice_state(&req.composition, &resource.manifest_ref).await?;

        // Hot path: resource version unchanged since the last clean pass.
        if !has_changed && current.is_none() {
            let ready = state.as_ref().and_then(|s| s.ready.as_ref()).is_some();
            return Ok(requeue_after(&resource, deleted, ready, self.readiness_poll_interval));
        }

        // Readiness-group gate: hold back first-time reconciliation until
        // every resource in a strictly lower group is ready. Deletes are
        // not ordered.
        let reconciled = state.as_ref().map(|s| s.reconciled).unwrap_or(false);
        if !reconciled && !deleted {
            let deps = self.cache.range_by_readiness_group(
                &syn_ref,
                resource.readiness_group,
                RangeDirection::Lower,
            );
            for dep in deps {
                let dep_ready = self
                    .slice_state(&req.composition, &dep.manifest_ref)
                    .await?
                    .and_then(|s| s.ready);
                if dep_ready.is_none() {
                    debug!(
                        resource = %req.resource,
                        group = resource.readiness_group,
                        "deferring until earlier readiness groups are ready"
                    );
                    return Ok(None);
                }
            }
        }

        // Readiness: a recorded ready time is reused verbatim so the
        // timestamp stays monotone for the synthesis lifetime.
        let ready: Option<Time> = match state.as_ref().and_then(|s| s.ready.clone()) {
            Some(t) => Some(t),
            None => resource.readiness_checks.eval(current.as_ref()).map(Time),
        };

        let mut modified = false;
        if has_changed {
            // Invalidate first: a failed write must not leave a stale
            // version that would skip the retry.
            resource.observe_version("");
            modified = self
                .reconcile_resource(
                    &comp,
                    prev.as_deref(),
                    &resource,
                    deleted,
                    current.as_ref(),
                    &api,
                )
                .await?;
        }
        if modified {
            // Requeue to observe the write before trusting the version
            // cache again.
            return Ok(Some(Duration::ZERO));
        }
        if let Some(rv) = current
            .as_ref()
            .and_then(|c| c.pointer("/metadata/resourceVersion"))
            .and_then(|v| v.as_str())
        {
            resource.observe_version(rv);
        }

        let downstream_deleted = match &current {
            None => true,
            Some(c) => c.pointer("/metadata/deletionTimestamp").is_some(),
        };
        self.write_buffer.patch_status_async(
            &resource.manifest_ref,
            resource_state_patch(downstream_deleted, ready.clone()),
        );
        Ok(requeue_after(&resource, deleted, ready.is_some(), self.readiness_poll_interval))
    }

    /// Mutate the downstream object if needed. Returns whether a write
    /// happened.
    async fn reconcile_resource(
        &self,
        comp: &Composition,
        prev: Option<&Resource>,
        resource: &Resource,
        deleted: bool,
        current: Option<&Value>,
        api: &Api<DynamicObject>,
    ) -> Result<bool, ReconcileError> {
        let start = Instant::now();
        let result = self
            .apply_action(comp, prev, resource, deleted, current, api)
            .await;
        histogram!(
            "reconciliation_latency_seconds",
            start.elapsed().as_secs_f64()
        );
        result
    }

    async fn apply_action(
        &self,
        comp: &Composition,
        prev: Option<&Resource>,
        resource: &Resource,
        deleted: bool,
        current: Option<&Value>,
        api: &Api<DynamicObject>,
    ) -> Result<bool, ReconcileError> {
        let name = resource.object_ref.name.as_str();
        let orphan = comp
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(DELETION_STRATEGY_ANNOTATION))
            .map(|v| v == DELETION_STRATEGY_ORPHAN)
            .unwrap_or(false);
        let current_deleting = current
            .map(|c| c.pointer("/metadata/deletionTimestamp").is_some())
            .unwrap_or(false);

        match plan_action(resource, deleted, current.is_some(), current_deleting, orphan) {
            Action::Skip => Ok(false),
            Action::Delete => {
                counter!("reconciliation_actions_total", 1u64, "action" => "delete");
                match api.delete(name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    // Not-found deletes count as success.
                    Err(kube::Error::Api(err)) if err.code == 404 => {}
                    Err(err) => {
                        return Err(ReconcileError::Transient(
                            anyhow!(err).context("deleting resource"),
                        ))
                    }
                }
                info!(resource = %resource.object_ref, "deleted resource");
                Ok(true)
            }
            Action::Create => {
                counter!("reconciliation_actions_total", 1u64, "action" => "create");
                let obj: DynamicObject = serde_json::from_value(resource.manifest.clone())
                    .map_err(|err| {
                        ReconcileError::terminal(
                            anyhow!(err).context("invalid resource manifest"),
                        )
                    })?;
                api.create(&PostParams::default(), &obj)
                    .await
                    .map_err(|err| classify_write_error(err, "creating resource"))?;
                info!(resource = %resource.object_ref, "created resource");
                Ok(true)
            }
            Action::JsonPatch => {
                let ops = resource.patch.as_ref().expect("patch action implies ops");
                let current = current.expect("patch action implies current");
                if !json_patch_would_change(ops, current)? {
                    return Ok(false);
                }
                let patch: json_patch::Patch = serde_json::from_value(ops.clone())
                    .map_err(|err| {
                        ReconcileError::terminal(anyhow!(err).context("invalid patch ops"))
                    })?;
                counter!("reconciliation_actions_total", 1u64, "action" => "patch");
                if *INSECURE_LOG_PATCH {
                    info!(patch = %ops, "INSECURE logging patch");
                }
                api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
                    .await
                    .map_err(|err| classify_write_error(err, "applying json patch"))?;
                info!(resource = %resource.object_ref, "patched resource");
                Ok(true)
            }
            Action::DiffPatch => {
                let current = current.expect("diff action implies current");
                let model = self
                    .discovery
                    .get(&resource.gvk)
                    .await
                    .context("getting merge metadata")?;
                let prev_manifest = prev.filter(|p| !p.is_patch()).map(|p| &p.manifest);
                let Some(built) = build_patch(
                    prev_manifest,
                    &resource.manifest,
                    current,
                    model.as_ref(),
                    &resource.gvk,
                )?
                else {
                    return Ok(false);
                };

                let rv = current
                    .pointer("/metadata/resourceVersion")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let Some(payload) = munge_patch(built.payload, rv)? else {
                    debug!(resource = %resource.object_ref, "skipping empty patch");
                    return Ok(false);
                };
                counter!("reconciliation_actions_total", 1u64, "action" => "patch");
                if *INSECURE_LOG_PATCH {
                    info!(patch = %payload, "INSECURE logging patch");
                }
                let patch = match built.patch_type {
                    PatchType::Strategic => Patch::Strategic(payload),
                    _ => Patch::Merge(payload),
                };
                api.patch(name, &PatchParams::default(), &patch)
                    .await
                    .map_err(|err| classify_write_error(err, "applying patch"))?;
                info!(
                    resource = %resource.object_ref,
                    patch_type = built.patch_type.media_type(),
                    resource_version = rv,
                    "patched resource"
                );
                Ok(true)
            }
        }
    }

    /// Fetch live downstream state. Returns `(None, false)` on the hot path
    /// when the resourceVersion matches the last clean observation.
    async fn get_current(
        &self,
        api: &Api<DynamicObject>,
        resource: &Resource,
        deleted: bool,
    ) -> Result<(Option<Value>, bool), ReconcileError> {
        let name = resource.object_ref.name.as_str();
        if resource.has_been_seen() && !deleted {
            match api.get_metadata_opt(name).await {
                Ok(Some(meta)) => {
                    let rv = meta.metadata.resource_version.unwrap_or_default();
                    if resource.matches_last_seen(&rv) {
                        return Ok((None, false));
                    }
                    counter!("resource_version_changes_total", 1u64);
                }
                Ok(None) => return Ok((None, true)),
                Err(err) if is_missing_namespace_message(&err.to_string()) => {
                    return Ok((None, true))
                }
                Err(err) => {
                    return Err(ReconcileError::Transient(
                        anyhow!(err).context("reading current metadata"),
                    ))
                }
            }
        }

        match api.get_opt(name).await {
            Ok(Some(obj)) => {
                let value = serde_json::to_value(&obj).map_err(|err| {
                    ReconcileError::terminal(
                        anyhow!(err).context("encoding current state"),
                    )
                })?;
                Ok((Some(value), true))
            }
            Ok(None) => Ok((None, true)),
            // Cluster-scoped vs namespaced mismatch after a CRD scope
            // change: recoverable by treating the object as absent.
            Err(err) if is_missing_namespace_message(&err.to_string()) => Ok((None, true)),
            Err(err) => Err(ReconcileError::Transient(
                anyhow!(err).context("reading current state"),
            )),
        }
    }

    async fn slice_state(
        &self,
        composition: &CompositionRef,
        manifest_ref: &ManifestRef,
    ) -> Result<Option<ResourceState>, ReconcileError> {
        let api: Api<ResourceSlice> =
            Api::namespaced(self.client.clone(), &composition.namespace);
        let Some(slice) = api
            .get_opt(&manifest_ref.slice.name)
            .await
            .context("getting resource slice")?
        else {
            return Ok(None);
        };
        Ok(slice
            .status
            .as_ref()
            .and_then(|s| s.resources.get(manifest_ref.index))
            .cloned())
    }
}

fn classify_write_error(err: kube::Error, what: &'static str) -> ReconcileError {
    if is_missing_namespace_message(&err.to_string()) {
        // Treated as not-found so the loop recovers after CRD scope flips.
        return ReconcileError::Transient(anyhow!("{what}: object namespace mismatch"));
    }
    ReconcileError::Transient(anyhow!(err).context(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::resource::SliceRef;

    fn resource(manifest: serde_json::Value) -> Resource {
        Resource::from_manifest(
            SliceRef { name: "s".into(), namespace: "default".into() },
            0,
            &manifest.to_string(),
            false,
        )
        .unwrap()
    }

    fn deleted_resource() -> Resource {
        Resource::from_manifest(
            SliceRef { name: "s".into(), namespace: "default".into() },
            0,
            &serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm", "namespace": "default"}
            })
            .to_string(),
            true,
        )
        .unwrap()
    }

    fn patch_resource() -> Resource {
        resource(serde_json::json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "Patch",
            "metadata": {"name": "web", "namespace": "default"},
            "patch": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "ops": [{"op": "replace", "path": "/spec/replicas", "value": 1}]
            }
        }))
    }

    #[test]
    fn patch_resources_are_never_created() {
        let res = patch_resource();
        assert_eq!(plan_action(&res, false, false, false, false), Action::Skip);
        assert_eq!(plan_action(&res, false, true, false, false), Action::JsonPatch);
    }

    #[test]
    fn deletion_honors_orphan_strategy() {
        let res = deleted_resource();
        assert_eq!(plan_action(&res, true, true, false, false), Action::Delete);
        assert_eq!(plan_action(&res, true, true, false, true), Action::Skip);
        assert_eq!(plan_action(&res, true, false, false, false), Action::Skip);
        assert_eq!(plan_action(&res, true, true, true, false), Action::Skip);
    }

    #[test]
    fn deleting_composition_tears_down_live_resources() {
        // The flag may come from the composition's deletion rather than the
        // manifest itself.
        let res = resource(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "default"}
        }));
        assert!(!res.deleted);
        assert_eq!(plan_action(&res, true, true, false, false), Action::Delete);
        assert_eq!(plan_action(&res, true, true, false, true), Action::Skip);
    }

    #[test]
    fn disable_updates_skips_diffing_but_not_creation() {
        let res = resource(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "default",
                "annotations": {"eno.azure.io/disable-updates": "true"}
            }
        }));
        assert_eq!(plan_action(&res, false, false, false, false), Action::Create);
        assert_eq!(plan_action(&res, false, true, false, false), Action::Skip);
    }

    #[test]
    fn state_patch_skips_identical_states() {
        let ready = Some(Time(Utc::now()));
        let patch = resource_state_patch(false, ready.clone());

        let prior = ResourceState { reconciled: true, ready, deleted: false };
        assert!(patch(Some(&prior)).is_none());

        // Any difference produces a write.
        assert!(patch(None).is_some());
        let unreconciled = ResourceState { reconciled: false, ..prior.clone() };
        assert!(patch(Some(&unreconciled)).is_some());
    }

    #[test]
    fn requeue_prefers_readiness_polling() {
        let res = resource(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "default",
                "annotations": {"eno.azure.io/reconcile-interval": "1m"}
            }
        }));
        let poll = Duration::from_secs(5);

        // Not ready: poll (with jitter bounded to +/-10%).
        let d = requeue_after(&res, false, false, poll).unwrap();
        assert!(d >= Duration::from_millis(4500) && d <= Duration::from_millis(5500));

        // Ready with an interval: requeue at the interval.
        let d = requeue_after(&res, false, true, poll).unwrap();
        assert!(d >= Duration::from_secs(54) && d <= Duration::from_secs(66));

        // Ready, deleted: no requeue.
        let res = deleted_resource();
        assert!(requeue_after(&res, true, true, poll).is_none());
    }
}
