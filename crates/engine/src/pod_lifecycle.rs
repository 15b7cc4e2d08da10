//! Synthesizer pod lifecycle.
//!
//! Owns the mapping from an active synthesis to its execution pod: authors
//! pending slots when the composition generation moves, creates the pod,
//! captures its output into ResourceSlices, stamps `synthesized`, counts
//! attempts, and garbage-collects pods and slices left behind by superseded
//! syntheses. A successful pod is deleted as soon as its output is durable;
//! the slices hold everything worth keeping.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use maestro_api::{
    Composition, Manifest, ResourceSlice, ResourceSliceRef, ResourceSliceSpec, Synthesizer,
};
use maestro_core::{CompositionRef, EngineConfig};

pub const COMPOSITION_LABEL: &str = "eno.azure.io/composition";
pub const SYNTHESIS_LABEL: &str = "eno.azure.io/synthesis-uuid";
/// Holds the composition until its downstream resources are deleted (or
/// orphaned).
pub const CLEANUP_FINALIZER: &str = "eno.azure.io/cleanup";
const SYNTHESIZER_CONTAINER: &str = "synthesizer";

/// Keep slices comfortably under the apiserver object size limit.
const MAX_SLICE_RESOURCES: usize = 128;

/// The synthesis whose resource set is authoritative for teardown: the
/// current slot if it captured output, else the previous one. A pending or
/// failed current slot never created anything of its own.
pub fn teardown_synthesis(comp: &Composition) -> Option<&maestro_api::Synthesis> {
    let status = comp.status.as_ref()?;
    if let Some(current) = status.current_synthesis.as_ref() {
        if current.synthesized.is_some() {
            return Some(current);
        }
    }
    status
        .previous_synthesis
        .as_ref()
        .filter(|syn| syn.synthesized.is_some())
}

pub fn pod_name(composition: &str, uuid: &str) -> String {
    let short = uuid.get(..8).unwrap_or(uuid);
    format!("synth-{composition}-{short}")
}

fn owner_reference(comp: &Composition) -> OwnerReference {
    OwnerReference {
        api_version: "eno.azure.io/v1".to_string(),
        kind: "Composition".to_string(),
        name: comp.metadata.name.clone().unwrap_or_default(),
        uid: comp.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn labels(comp: &Composition, uuid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            COMPOSITION_LABEL.to_string(),
            comp.metadata.name.clone().unwrap_or_default(),
        ),
        (SYNTHESIS_LABEL.to_string(), uuid.to_string()),
    ])
}

/// The execution contract: the wrapper image runs the synthesizer, feeding
/// it inputs via env and collecting emitted manifests from stdout.
pub fn build_pod(
    comp: &Composition,
    syn: &Synthesizer,
    config: &EngineConfig,
    uuid: &str,
) -> Pod {
    let env = vec![
        EnvVar {
            name: "SYNTHESIZER_IMAGE".into(),
            value: Some(syn.spec.image.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "COMPOSITION_NAME".into(),
            value: comp.metadata.name.clone(),
            ..Default::default()
        },
        EnvVar {
            name: "COMPOSITION_NAMESPACE".into(),
            value: comp.metadata.namespace.clone(),
            ..Default::default()
        },
        EnvVar {
            name: "SYNTHESIS_UUID".into(),
            value: Some(uuid.to_string()),
            ..Default::default()
        },
    ];
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(
                comp.metadata.name.as_deref().unwrap_or_default(),
                uuid,
            )),
            namespace: comp.metadata.namespace.clone(),
            labels: Some(labels(comp, uuid)),
            owner_references: Some(vec![owner_reference(comp)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".into()),
            containers: vec![Container {
                name: SYNTHESIZER_CONTAINER.into(),
                image: Some(config.wrapper_image.clone()),
                env: Some(env),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

/// Parse the manifests a synthesizer wrote to stdout: a JSON List, a JSON
/// array, a single JSON object, or a YAML document stream.
pub fn parse_synthesizer_output(output: &str) -> Result<Vec<Value>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let candidates: Vec<Value> = if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match value {
            Value::Array(items) => items,
            Value::Object(mut obj) if obj.contains_key("items") => {
                match obj.remove("items") {
                    Some(Value::Array(items)) => items,
                    _ => return Err(anyhow!("synthesizer output items must be an array")),
                }
            }
            obj @ Value::Object(_) => vec![obj],
            _ => return Err(anyhow!("synthesizer output must be objects")),
        }
    } else {
        let mut docs = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(trimmed) {
            let yaml = serde_yaml::Value::deserialize(doc)
                .context("parsing synthesizer output as YAML")?;
            if yaml.is_null() {
                continue;
            }
            docs.push(serde_json::to_value(yaml).context("converting output to JSON")?);
        }
        docs
    };

    for manifest in &candidates {
        if !manifest.is_object() {
            return Err(anyhow!("synthesizer emitted a non-object manifest"));
        }
    }
    Ok(candidates)
}

/// Chunk manifests into slices owned by the composition.
pub fn build_slices(comp: &Composition, uuid: &str, manifests: &[Value]) -> Vec<ResourceSlice> {
    let comp_name = comp.metadata.name.clone().unwrap_or_default();
    let generation = comp.metadata.generation.unwrap_or_default();
    let chunks: Vec<&[Value]> = if manifests.is_empty() {
        vec![&[]]
    } else {
        manifests.chunks(MAX_SLICE_RESOURCES).collect()
    };
    chunks
        .into_iter()
        .map(|chunk| ResourceSlice {
            metadata: ObjectMeta {
                generate_name: Some(format!("{comp_name}-")),
                namespace: comp.metadata.namespace.clone(),
                labels: Some(labels(comp, uuid)),
                owner_references: Some(vec![owner_reference(comp)]),
                ..Default::default()
            },
            spec: ResourceSliceSpec {
                composition_generation: generation,
                synthesis_uuid: uuid.to_string(),
                resources: chunk
                    .iter()
                    .map(|m| Manifest { manifest: m.to_string(), deleted: false })
                    .collect(),
            },
            status: None,
        })
        .collect()
}

pub struct PodLifecycleController {
    client: Client,
    config: EngineConfig,
}

impl PodLifecycleController {
    pub fn new(client: Client, config: EngineConfig) -> Self {
        Self { client, config }
    }

    /// Drive one composition. Returns a requeue delay when a pod deadline
    /// needs to be checked later.
    pub async fn reconcile(&self, comp_ref: &CompositionRef) -> Result<Option<Duration>> {
        let comp_api: Api<Composition> =
            Api::namespaced(self.client.clone(), &comp_ref.namespace);
        let Some(mut comp) = comp_api
            .get_opt(&comp_ref.name)
            .await
            .context("getting composition")?
        else {
            // Owner references clean up pods and slices with the composition.
            return Ok(None);
        };
        if comp.metadata.deletion_timestamp.is_some() {
            return self.finalize(&comp_api, &mut comp, comp_ref).await;
        }
        self.ensure_finalizer(&comp_api, &comp, comp_ref).await?;

        let syn_api: Api<Synthesizer> = Api::all(self.client.clone());
        let Some(syn) = syn_api
            .get_opt(&comp.spec.synthesizer.name)
            .await
            .context("getting synthesizer")?
        else {
            warn!(composition = %comp_ref, synthesizer = %comp.spec.synthesizer.name, "synthesizer does not exist");
            return Ok(None);
        };
        let syn_generation = syn.metadata.generation.unwrap_or_default();

        // Author a fresh pending slot when the composition spec moved.
        let generation = comp.metadata.generation.unwrap_or_default();
        let needs_slot = match comp.status.as_ref().and_then(|s| s.current_synthesis.as_ref())
        {
            None => true,
            Some(cur) => cur.observed_composition_generation != generation,
        };
        if needs_slot {
            comp.begin_synthesis(syn_generation);
            comp_api
                .replace_status(
                    &comp_ref.name,
                    &PostParams::default(),
                    serde_json::to_vec(&comp).context("encoding composition")?,
                )
                .await
                .context("authoring pending synthesis")?;
            counter!("syntheses_authored_total", 1u64);
            info!(composition = %comp_ref, generation, "authored pending synthesis");
            return Ok(None);
        }

        let current = comp
            .status
            .as_ref()
            .and_then(|s| s.current_synthesis.as_ref())
            .cloned()
            .expect("slot checked above");

        self.collect_stale(&comp, comp_ref).await?;
        if current.is_pending() || current.failed || current.synthesized.is_some() {
            return Ok(None);
        }

        // Active synthesis: ensure its pod exists and observe it.
        let uuid = current.uuid.clone();
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &comp_ref.namespace);
        let name = pod_name(&comp_ref.name, &uuid);
        let Some(pod) = pod_api.get_opt(&name).await.context("getting pod")? else {
            let pod = build_pod(&comp, &syn, &self.config, &uuid);
            pod_api
                .create(&PostParams::default(), &pod)
                .await
                .context("creating synthesizer pod")?;
            counter!("synthesis_pods_created_total", 1u64);
            info!(composition = %comp_ref, pod = %name, synthesis_id = %uuid, "created synthesizer pod");
            if current.initialized.is_none() {
                if let Some(cur) = comp
                    .status
                    .as_mut()
                    .and_then(|s| s.current_synthesis.as_mut())
                {
                    cur.initialized = Some(Time(Utc::now()));
                }
                comp_api
                    .replace_status(
                        &comp_ref.name,
                        &PostParams::default(),
                        serde_json::to_vec(&comp).context("encoding composition")?,
                    )
                    .await
                    .context("recording initialized timestamp")?;
            }
            return Ok(Some(self.config.timeout));
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Pending");
        match phase {
            "Succeeded" => {
                self.capture_output(&comp_api, &pod_api, &mut comp, comp_ref, &name, &uuid)
                    .await?;
                Ok(None)
            }
            "Failed" => {
                warn!(composition = %comp_ref, pod = %name, "synthesizer pod failed");
                self.record_attempt(&comp_api, &mut comp, comp_ref).await?;
                delete_pod(&pod_api, &name).await?;
                Ok(None)
            }
            _ => {
                // Enforce the per-attempt wall clock from pod creation.
                let age = pod
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| Utc::now().signed_duration_since(t.0))
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or(Duration::ZERO);
                if age >= self.config.timeout {
                    warn!(composition = %comp_ref, pod = %name, "synthesis timed out");
                    counter!("synthesis_timeouts_total", 1u64);
                    self.record_attempt(&comp_api, &mut comp, comp_ref).await?;
                    delete_pod(&pod_api, &name).await?;
                    Ok(None)
                } else {
                    Ok(Some(self.config.timeout - age))
                }
            }
        }
    }

    async fn ensure_finalizer(
        &self,
        comp_api: &Api<Composition>,
        comp: &Composition,
        comp_ref: &CompositionRef,
    ) -> Result<()> {
        let mut finalizers = comp.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == CLEANUP_FINALIZER) {
            return Ok(());
        }
        finalizers.push(CLEANUP_FINALIZER.to_string());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        comp_api
            .patch(
                &comp_ref.name,
                &kube::api::PatchParams::default(),
                &kube::api::Patch::Merge(&patch),
            )
            .await
            .context("adding cleanup finalizer")?;
        Ok(())
    }

    /// Composition deletion: hold the finalizer until every resource of the
    /// current synthesis reports deleted downstream (the reconciler issues
    /// the deletes), then release. The orphan strategy releases immediately.
    async fn finalize(
        &self,
        comp_api: &Api<Composition>,
        comp: &mut Composition,
        comp_ref: &CompositionRef,
    ) -> Result<Option<Duration>> {
        let has_finalizer = comp
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|f| f == CLEANUP_FINALIZER))
            .unwrap_or(false);
        if !has_finalizer {
            return Ok(None);
        }

        let orphan = comp
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(maestro_api::DELETION_STRATEGY_ANNOTATION))
            .map(|v| v == maestro_api::DELETION_STRATEGY_ORPHAN)
            .unwrap_or(false);
        if !orphan && !self.downstream_cleanup_complete(comp, comp_ref).await? {
            return Ok(Some(self.config.readiness_poll_interval));
        }

        if let Some(finalizers) = comp.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != CLEANUP_FINALIZER);
        }
        comp_api
            .replace(
                &comp_ref.name,
                &PostParams::default(),
                comp,
            )
            .await
            .context("removing cleanup finalizer")?;
        info!(composition = %comp_ref, orphan, "released composition for deletion");
        Ok(None)
    }

    async fn downstream_cleanup_complete(
        &self,
        comp: &Composition,
        comp_ref: &CompositionRef,
    ) -> Result<bool> {
        let Some(synthesis) = teardown_synthesis(comp) else {
            // Nothing was ever created downstream.
            return Ok(true);
        };
        let slice_api: Api<ResourceSlice> =
            Api::namespaced(self.client.clone(), &comp_ref.namespace);
        for slice_ref in &synthesis.resource_slices {
            let Some(slice) = slice_api
                .get_opt(&slice_ref.name)
                .await
                .context("getting resource slice")?
            else {
                continue;
            };
            let states = slice
                .status
                .as_ref()
                .map(|s| s.resources.as_slice())
                .unwrap_or(&[]);
            for (i, _) in slice.spec.resources.iter().enumerate() {
                if !states.get(i).map(|s| s.deleted).unwrap_or(false) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Capture a successful pod's stdout into slices, then stamp the slot.
    async fn capture_output(
        &self,
        comp_api: &Api<Composition>,
        pod_api: &Api<Pod>,
        comp: &mut Composition,
        comp_ref: &CompositionRef,
        pod: &str,
        uuid: &str,
    ) -> Result<()> {
        let logs = pod_api
            .logs(
                pod,
                &LogParams {
                    container: Some(SYNTHESIZER_CONTAINER.into()),
                    ..Default::default()
                },
            )
            .await
            .context("reading synthesizer output")?;
        let manifests = match parse_synthesizer_output(&logs) {
            Ok(m) => m,
            Err(err) => {
                // Invalid output counts as a failed attempt.
                warn!(composition = %comp_ref, error = %err, "synthesizer emitted invalid output");
                self.record_attempt(comp_api, comp, comp_ref).await?;
                delete_pod(pod_api, pod).await?;
                return Ok(());
            }
        };

        let slice_api: Api<ResourceSlice> =
            Api::namespaced(self.client.clone(), &comp_ref.namespace);

        // A prior attempt may have crashed between writing slices and
        // stamping the status; clear its leftovers so the refs we record
        // below are exactly the slices we created.
        let selector = format!("{SYNTHESIS_LABEL}={uuid}");
        let stale = slice_api
            .list(&ListParams::default().labels(&selector))
            .await
            .context("listing slices")?;
        for slice in stale.items {
            if let Some(name) = slice.metadata.name.as_deref() {
                let _ = slice_api.delete(name, &DeleteParams::default()).await;
            }
        }

        let mut refs = Vec::new();
        for slice in build_slices(comp, uuid, &manifests) {
            let created = slice_api
                .create(&PostParams::default(), &slice)
                .await
                .context("creating resource slice")?;
            refs.push(ResourceSliceRef {
                name: created.metadata.name.clone().unwrap_or_default(),
            });
        }

        if let Some(cur) = comp
            .status
            .as_mut()
            .and_then(|s| s.current_synthesis.as_mut())
        {
            cur.synthesized = Some(Time(Utc::now()));
            cur.resource_slices = refs;
        }
        comp_api
            .replace_status(
                &comp_ref.name,
                &PostParams::default(),
                serde_json::to_vec(comp).context("encoding composition")?,
            )
            .await
            .context("recording synthesized output")?;
        counter!("syntheses_completed_total", 1u64);
        info!(
            composition = %comp_ref,
            synthesis_id = %uuid,
            resources = manifests.len(),
            "captured synthesis output"
        );

        // The pod holds no state worth keeping once the slices are durable.
        delete_pod(pod_api, pod).await?;
        Ok(())
    }

    async fn record_attempt(
        &self,
        comp_api: &Api<Composition>,
        comp: &mut Composition,
        comp_ref: &CompositionRef,
    ) -> Result<()> {
        let max_restarts = self.config.max_restarts;
        let Some(cur) = comp
            .status
            .as_mut()
            .and_then(|s| s.current_synthesis.as_mut())
        else {
            return Ok(());
        };
        cur.attempts += 1;
        if cur.attempts > max_restarts {
            cur.failed = true;
            counter!("syntheses_failed_total", 1u64);
            warn!(
                composition = %comp_ref,
                attempts = cur.attempts,
                "synthesis exceeded restart budget; abandoning"
            );
        }
        comp_api
            .replace_status(
                &comp_ref.name,
                &PostParams::default(),
                serde_json::to_vec(comp).context("encoding composition")?,
            )
            .await
            .context("recording synthesis attempt")?;
        Ok(())
    }

    /// Delete pods and slices belonging to syntheses that are no longer a
    /// status slot of this composition.
    async fn collect_stale(&self, comp: &Composition, comp_ref: &CompositionRef) -> Result<()> {
        let status = comp.status.as_ref();
        let keep: Vec<&str> = status
            .map(|s| {
                s.current_synthesis
                    .iter()
                    .chain(s.previous_synthesis.iter())
                    .map(|syn| syn.uuid.as_str())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let selector = format!("{COMPOSITION_LABEL}={}", comp_ref.name);

        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &comp_ref.namespace);
        let pods = pod_api
            .list(&ListParams::default().labels(&selector))
            .await
            .context("listing pods")?;
        // A settled current slot (synthesized or failed) no longer needs its
        // pod either.
        let active_uuid = status
            .and_then(|s| s.current_synthesis.as_ref())
            .filter(|syn| syn.is_active())
            .map(|syn| syn.uuid.as_str());
        for pod in pods.items {
            let pod_uuid = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(SYNTHESIS_LABEL))
                .map(|s| s.as_str())
                .unwrap_or("");
            if Some(pod_uuid) == active_uuid {
                continue;
            }
            if let Some(name) = pod.metadata.name.as_deref() {
                counter!("synthesis_pods_collected_total", 1u64);
                delete_pod(&pod_api, name).await?;
            }
        }

        let slice_api: Api<ResourceSlice> =
            Api::namespaced(self.client.clone(), &comp_ref.namespace);
        let slices = slice_api
            .list(&ListParams::default().labels(&selector))
            .await
            .context("listing slices")?;
        for slice in slices.items {
            let uuid = slice.spec.synthesis_uuid.as_str();
            if keep.contains(&uuid) {
                continue;
            }
            if let Some(name) = slice.metadata.name.as_deref() {
                let _ = slice_api.delete(name, &DeleteParams::default()).await;
            }
        }
        Ok(())
    }
}

async fn delete_pod(api: &Api<Pod>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err).context("deleting pod"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_api::{CompositionSpec, SynthesizerRef, SynthesizerSpec};

    fn comp() -> Composition {
        let mut c = Composition::new(
            "test-comp",
            CompositionSpec {
                synthesizer: SynthesizerRef { name: "test-syn".into(), min_generation: None },
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("default".into());
        c.metadata.uid = Some("11111111-2222-3333-4444-555555555555".into());
        c.metadata.generation = Some(3);
        c
    }

    #[test]
    fn pod_template_carries_identity() {
        let syn = Synthesizer::new(
            "test-syn",
            SynthesizerSpec { image: "example/synth:v1".into(), refs: vec![] },
        );
        let config = EngineConfig {
            wrapper_image: "example/wrapper:v9".into(),
            ..Default::default()
        };
        let pod = build_pod(&comp(), &syn, &config, "0a1b2c3d-aaaa-bbbb-cccc-111122223333");

        assert_eq!(pod.metadata.name.as_deref(), Some("synth-test-comp-0a1b2c3d"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[COMPOSITION_LABEL], "test-comp");
        assert_eq!(labels[SYNTHESIS_LABEL], "0a1b2c3d-aaaa-bbbb-cccc-111122223333");

        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Composition");
        assert_eq!(owner.controller, Some(true));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("example/wrapper:v9"));
        let env = container.env.as_ref().unwrap();
        let image = env.iter().find(|e| e.name == "SYNTHESIZER_IMAGE").unwrap();
        assert_eq!(image.value.as_deref(), Some("example/synth:v1"));
    }

    #[test]
    fn output_parsing_accepts_json_and_yaml_forms() {
        let list = r#"{"apiVersion": "v1", "kind": "List", "items": [
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}},
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}}
        ]}"#;
        assert_eq!(parse_synthesizer_output(list).unwrap().len(), 2);

        let array = r#"[{"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}]"#;
        assert_eq!(parse_synthesizer_output(array).unwrap().len(), 1);

        let single = r#"{"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}"#;
        assert_eq!(parse_synthesizer_output(single).unwrap().len(), 1);

        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
        assert_eq!(parse_synthesizer_output(yaml).unwrap().len(), 2);

        assert!(parse_synthesizer_output("  \n").unwrap().is_empty());
        assert!(parse_synthesizer_output("[1, 2]").is_err());
    }

    #[test]
    fn slices_chunk_large_outputs() {
        let manifests: Vec<Value> = (0..300)
            .map(|i| {
                serde_json::json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": format!("cm-{i}"), "namespace": "default"}
                })
            })
            .collect();
        let slices = build_slices(&comp(), "syn-uuid", &manifests);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].spec.resources.len(), 128);
        assert_eq!(slices[2].spec.resources.len(), 44);
        for slice in &slices {
            assert_eq!(slice.spec.synthesis_uuid, "syn-uuid");
            assert_eq!(slice.spec.composition_generation, 3);
            assert_eq!(slice.metadata.generate_name.as_deref(), Some("test-comp-"));
        }
    }

    #[test]
    fn empty_output_still_produces_one_slice() {
        // An empty synthesis must still be representable so the composition
        // can become ready with zero resources.
        let slices = build_slices(&comp(), "syn-uuid", &[]);
        assert_eq!(slices.len(), 1);
        assert!(slices[0].spec.resources.is_empty());
    }
}
