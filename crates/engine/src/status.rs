//! Composition status aggregation.
//!
//! Derives the synthesis-level `reconciled` and `ready` timestamps from the
//! per-resource states reported in the slices. Both stamps are written once
//! and never regress for a given synthesis.

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

use maestro_api::{Composition, ResourceSlice};
use maestro_core::CompositionRef;

#[derive(Debug, Default, PartialEq)]
pub struct SliceAggregate {
    pub total: usize,
    pub all_reconciled: bool,
    /// Latest per-resource ready time, present only when every resource is
    /// ready. An empty synthesis is vacuously ready.
    pub ready: Option<Time>,
}

pub fn aggregate(slices: &[ResourceSlice]) -> SliceAggregate {
    let mut total = 0usize;
    let mut all_reconciled = true;
    let mut ready: Option<Time> = None;
    let mut all_ready = true;

    for slice in slices {
        let states = slice.status.as_ref().map(|s| s.resources.as_slice()).unwrap_or(&[]);
        for (i, _) in slice.spec.resources.iter().enumerate() {
            total += 1;
            let Some(state) = states.get(i) else {
                all_reconciled = false;
                all_ready = false;
                continue;
            };
            if !state.reconciled {
                all_reconciled = false;
            }
            match &state.ready {
                Some(t) => {
                    if ready.as_ref().map(|r| t.0 > r.0).unwrap_or(true) {
                        ready = Some(t.clone());
                    }
                }
                None => all_ready = false,
            }
        }
    }

    if !all_ready {
        ready = None;
    } else if total == 0 {
        ready = Some(Time(Utc::now()));
    }
    SliceAggregate { total, all_reconciled, ready }
}

pub struct StatusController {
    client: Client,
}

impl StatusController {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn reconcile(&self, comp_ref: &CompositionRef) -> Result<()> {
        let api: Api<Composition> = Api::namespaced(self.client.clone(), &comp_ref.namespace);
        let Some(mut comp) = api
            .get_opt(&comp_ref.name)
            .await
            .context("getting composition")?
        else {
            return Ok(());
        };
        let Some(current) = comp
            .status
            .as_mut()
            .and_then(|s| s.current_synthesis.as_mut())
        else {
            return Ok(());
        };
        if current.synthesized.is_none() {
            return Ok(());
        }

        let slice_api: Api<ResourceSlice> =
            Api::namespaced(self.client.clone(), &comp_ref.namespace);
        let mut slices = Vec::with_capacity(current.resource_slices.len());
        for slice_ref in &current.resource_slices {
            match slice_api
                .get_opt(&slice_ref.name)
                .await
                .context("getting resource slice")?
            {
                Some(slice) => slices.push(slice),
                // Slice not visible yet (or already collected); try again on
                // the next event.
                None => return Ok(()),
            }
        }

        let agg = aggregate(&slices);
        let mut changed = false;
        if current.initialized.is_none() {
            current.initialized = current.synthesized.clone();
            changed = true;
        }
        if current.reconciled.is_none() && agg.all_reconciled {
            current.reconciled = Some(Time(Utc::now()));
            changed = true;
            info!(composition = %comp_ref, resources = agg.total, "synthesis reconciled");
        }
        if current.ready.is_none() {
            if let Some(ready) = agg.ready {
                current.ready = Some(ready);
                changed = true;
                info!(composition = %comp_ref, "synthesis ready");
            }
        }
        if !changed {
            return Ok(());
        }

        debug!(composition = %comp_ref, "updating derived composition status");
        api.replace_status(
            &comp_ref.name,
            &PostParams::default(),
            serde_json::to_vec(&comp).context("encoding composition")?,
        )
        .await
        .context("writing composition status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_api::{Manifest, ResourceSliceSpec, ResourceSliceStatus, ResourceState};

    fn slice(states: Vec<Option<ResourceState>>) -> ResourceSlice {
        let mut s = ResourceSlice::new(
            "s",
            ResourceSliceSpec {
                composition_generation: 1,
                synthesis_uuid: "u".into(),
                resources: states
                    .iter()
                    .map(|_| Manifest { manifest: "{}".into(), deleted: false })
                    .collect(),
            },
        );
        let reported: Vec<ResourceState> =
            states.into_iter().flatten().collect();
        if !reported.is_empty() {
            s.status = Some(ResourceSliceStatus { resources: reported });
        }
        s
    }

    fn state(reconciled: bool, ready_at: Option<&str>) -> ResourceState {
        ResourceState {
            reconciled,
            ready: ready_at.map(|t| {
                Time(chrono::DateTime::parse_from_rfc3339(t).unwrap().with_timezone(&Utc))
            }),
            deleted: false,
        }
    }

    #[test]
    fn empty_synthesis_is_vacuously_done() {
        let agg = aggregate(&[]);
        assert_eq!(agg.total, 0);
        assert!(agg.all_reconciled);
        assert!(agg.ready.is_some());
    }

    #[test]
    fn unreported_resources_block_both_stamps() {
        let agg = aggregate(&[slice(vec![
            Some(state(true, Some("2023-05-01T10:00:00Z"))),
            None,
        ])]);
        assert_eq!(agg.total, 2);
        assert!(!agg.all_reconciled);
        assert!(agg.ready.is_none());
    }

    #[test]
    fn ready_is_the_latest_resource_ready_time() {
        let agg = aggregate(&[
            slice(vec![Some(state(true, Some("2023-05-01T10:00:00Z")))]),
            slice(vec![Some(state(true, Some("2023-05-01T12:00:00Z")))]),
        ]);
        assert!(agg.all_reconciled);
        assert_eq!(
            agg.ready.unwrap().0.to_rfc3339(),
            "2023-05-01T12:00:00+00:00"
        );
    }

    #[test]
    fn reconciled_does_not_require_ready() {
        let agg = aggregate(&[slice(vec![
            Some(state(true, None)),
            Some(state(true, Some("2023-05-01T10:00:00Z"))),
        ])]);
        assert!(agg.all_reconciled);
        assert!(agg.ready.is_none());
    }
}
