//! Synthesizer rollout gating.
//!
//! A synthesizer change must reroll every bound composition, but not all at
//! once: each tick rolls at most one composition and stamps
//! `status.lastRolloutTime`, and the next roll waits out the cooldown. The
//! fleet rerolls in staggered waves with inter-composition spacing >= the
//! cooldown.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::time::Duration;
use tracing::info;

use maestro_api::{Composition, Synthesizer};

/// Remaining wait before the next rollout is allowed; `None` means roll now.
pub fn rollout_delay(
    last_rollout: Option<&Time>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let last = last_rollout?;
    let elapsed = now.signed_duration_since(last.0).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= cooldown {
        None
    } else {
        Some(cooldown - elapsed)
    }
}

/// Compositions bound to the synthesizer whose current synthesis observed an
/// older generation. Compositions without a slot are handled by the pod
/// lifecycle controller's initial dispatch instead.
pub fn eligible<'a>(
    compositions: &'a [Composition],
    synthesizer: &str,
    generation: i64,
) -> Vec<&'a Composition> {
    compositions
        .iter()
        .filter(|comp| comp.spec.synthesizer.name == synthesizer)
        .filter(|comp| {
            comp.status
                .as_ref()
                .and_then(|s| s.current_synthesis.as_ref())
                .map(|syn| syn.observed_synthesizer_generation < generation)
                .unwrap_or(false)
        })
        .collect()
}

pub struct RolloutController {
    client: Client,
    cooldown: Duration,
}

impl RolloutController {
    pub fn new(client: Client, cooldown: Duration) -> Self {
        Self { client, cooldown }
    }

    /// Process one synthesizer. Returns the requeue delay when more work
    /// remains or the cooldown has not elapsed yet.
    pub async fn reconcile(&self, synthesizer: &str) -> Result<Option<Duration>> {
        let syn_api: Api<Synthesizer> = Api::all(self.client.clone());
        let Some(syn) = syn_api
            .get_opt(synthesizer)
            .await
            .context("getting synthesizer")?
        else {
            return Ok(None);
        };
        let generation = syn.metadata.generation.unwrap_or_default();

        let comp_api: Api<Composition> = Api::all(self.client.clone());
        let list = comp_api
            .list(&ListParams::default())
            .await
            .context("listing compositions")?;
        let outdated = eligible(&list.items, synthesizer, generation);
        if outdated.is_empty() {
            return Ok(None);
        }

        let last = syn.status.as_ref().and_then(|s| s.last_rollout_time.as_ref());
        if let Some(remaining) = rollout_delay(last, self.cooldown, Utc::now()) {
            return Ok(Some(remaining));
        }

        let mut comp = outdated[0].clone();
        let namespace = comp.metadata.namespace.clone().unwrap_or_default();
        let name = comp.metadata.name.clone().unwrap_or_default();
        comp.begin_synthesis(generation);
        let api: Api<Composition> = Api::namespaced(self.client.clone(), &namespace);
        api.replace_status(
            &name,
            &PostParams::default(),
            serde_json::to_vec(&comp).context("encoding composition")?,
        )
        .await
        .context("writing pending synthesis slot")?;

        let stamp = json!({"status": {"lastRolloutTime": Time(Utc::now())}});
        syn_api
            .patch_status(synthesizer, &PatchParams::default(), &Patch::Merge(&stamp))
            .await
            .context("stamping lastRolloutTime")?;
        info!(
            synthesizer,
            composition = %name,
            namespace = %namespace,
            generation,
            "rolled out synthesizer change"
        );

        if outdated.len() > 1 {
            Ok(Some(self.cooldown))
        } else {
            Ok(None)
        }
    }
}
