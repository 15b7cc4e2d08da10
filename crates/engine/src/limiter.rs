//! Global synthesis admission control.
//!
//! One loop watches the whole fleet: it counts in-flight syntheses, and when
//! below the cap claims one pending composition chosen uniformly at random.
//! Randomization is the fairness mechanism; a permanently-failing
//! composition cannot starve the rest of the fleet. The claim is an atomic
//! JSON-patch test+add against the status subresource so two replicas can
//! never double-dispatch, and every tick ends with a cooldown requeue to
//! pace fleet-wide dispatch.

use anyhow::{Context, Result};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use metrics::gauge;
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use maestro_api::Composition;
use maestro_core::CompositionRef;

#[derive(Debug, Default)]
pub struct Classified {
    pub active: usize,
    pub pending: Vec<CompositionRef>,
}

/// Partition the fleet by synthesis slot state. Slots that are absent or
/// already synthesized hold no concurrency slot.
pub fn classify(compositions: &[Composition]) -> Classified {
    let mut out = Classified::default();
    for comp in compositions {
        let Some(current) = comp.status.as_ref().and_then(|s| s.current_synthesis.as_ref())
        else {
            continue;
        };
        if current.synthesized.is_some() || current.failed {
            continue;
        }
        if current.is_pending() {
            out.pending.push(CompositionRef {
                name: comp.metadata.name.clone().unwrap_or_default(),
                namespace: comp.metadata.namespace.clone().unwrap_or_default(),
            });
        } else {
            out.active += 1;
        }
    }
    out
}

/// The atomic claim: only succeeds while the slot UUID is still null.
pub fn claim_patch(uuid: &str) -> serde_json::Value {
    json!([
        {"op": "test", "path": "/status/currentSynthesis/uuid", "value": null},
        {"op": "add", "path": "/status/currentSynthesis/uuid", "value": uuid}
    ])
}

pub struct SynthesisConcurrencyLimiter {
    client: Client,
    limit: usize,
    cooldown: Duration,
}

impl SynthesisConcurrencyLimiter {
    pub fn new(client: Client, limit: usize, cooldown: Duration) -> Self {
        Self { client, limit, cooldown }
    }

    /// One admission tick. Returns the requeue delay when a dispatch was
    /// attempted (successfully or not), pacing the next one.
    pub async fn reconcile(&self) -> Result<Option<Duration>> {
        let api: Api<Composition> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .context("listing compositions")?;

        let classified = classify(&list.items);
        gauge!("active_syntheses", classified.active as f64);
        gauge!("pending_syntheses", classified.pending.len() as f64);

        if classified.active >= self.limit {
            debug!(
                active = classified.active,
                pending = classified.pending.len(),
                "refusing to dispatch synthesis because concurrency limit has been reached"
            );
            return Ok(None);
        }
        if classified.pending.is_empty() {
            return Ok(None);
        }

        let next =
            &classified.pending[rand::thread_rng().gen_range(0..classified.pending.len())];
        let uuid = Uuid::new_v4().to_string();
        let patch: json_patch::Patch = serde_json::from_value(claim_patch(&uuid))
            .context("encoding claim patch")?;

        let api: Api<Composition> = Api::namespaced(self.client.clone(), &next.namespace);
        api.patch_status(&next.name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .context("writing uuid to composition status")?;
        info!(
            composition = %next,
            synthesis_id = %uuid,
            "dispatched synthesis"
        );

        // Cooldown applies to conflicts too: the caller requeues on error.
        Ok(Some(self.cooldown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_api::{CompositionSpec, CompositionStatus, Synthesis};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn comp(name: &str, synthesis: Option<Synthesis>) -> Composition {
        let mut c = Composition::new(name, CompositionSpec::default());
        c.metadata.namespace = Some("default".into());
        c.status = Some(CompositionStatus {
            current_synthesis: synthesis,
            previous_synthesis: None,
        });
        c
    }

    #[test]
    fn classify_partitions_the_fleet() {
        let comps = vec![
            comp("no-slot", None),
            comp("pending-1", Some(Synthesis::default())),
            comp("pending-2", Some(Synthesis::default())),
            comp("active", Some(Synthesis { uuid: "u1".into(), ..Default::default() })),
            comp(
                "done",
                Some(Synthesis {
                    uuid: "u2".into(),
                    synthesized: Some(Time(chrono::Utc::now())),
                    ..Default::default()
                }),
            ),
            comp(
                "failed",
                Some(Synthesis { uuid: "u3".into(), failed: true, ..Default::default() }),
            ),
        ];

        let classified = classify(&comps);
        assert_eq!(classified.active, 1);
        let names: Vec<_> = classified.pending.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["pending-1", "pending-2"]);
    }

    #[test]
    fn cap_is_respected_under_load() {
        // Five pending, two already active, limit two: nothing dispatches
        // until one of the active slots completes.
        let mut comps: Vec<_> = (0..5)
            .map(|i| comp(&format!("pending-{i}"), Some(Synthesis::default())))
            .collect();
        comps.push(comp("active-1", Some(Synthesis { uuid: "u1".into(), ..Default::default() })));
        comps.push(comp("active-2", Some(Synthesis { uuid: "u2".into(), ..Default::default() })));

        let classified = classify(&comps);
        assert_eq!(classified.active, 2);
        assert_eq!(classified.pending.len(), 5);
        assert!(classified.active >= 2, "limit=2 admits nothing this tick");

        // One completes: the next tick has capacity for exactly one claim.
        comps.pop();
        comps.push(comp(
            "active-2",
            Some(Synthesis {
                uuid: "u2".into(),
                synthesized: Some(Time(chrono::Utc::now())),
                ..Default::default()
            }),
        ));
        let classified = classify(&comps);
        assert_eq!(classified.active, 1);
    }

    #[test]
    fn claim_patch_tests_for_null_before_adding() {
        let patch = claim_patch("abc");
        let ops = patch.as_array().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0]["op"], "test");
        assert_eq!(ops[0]["value"], serde_json::Value::Null);
        assert_eq!(ops[1]["op"], "add");
        assert_eq!(ops[1]["value"], "abc");
        // Both ops address the same slot, so the add cannot land unless the
        // UUID was still unset: assignment happens at most once.
        assert_eq!(ops[0]["path"], ops[1]["path"]);
        // The encoded form is a valid RFC 6902 document.
        let parsed: Result<json_patch::Patch, _> = serde_json::from_value(patch);
        assert!(parsed.is_ok());
    }
}
