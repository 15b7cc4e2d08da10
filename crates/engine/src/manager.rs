//! Engine wiring: watch streams, work queues, and worker tasks.
//!
//! Watchers translate API server events into queue items; workers drain the
//! queues through the controllers. Everything is tied to one cancellation
//! token so the process shuts down cleanly.

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource as KubeResource};
use metrics::counter;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::limiter::SynthesisConcurrencyLimiter;
use crate::pod_lifecycle::PodLifecycleController;
use crate::queue::WorkQueue;
use crate::reconciler::ResourceReconciler;
use crate::rollout::RolloutController;
use crate::status::StatusController;
use crate::write_buffer::{KubeSliceClient, WriteBuffer};
use maestro_api::{Composition, ResourceSlice, Synthesizer};
use maestro_core::{CompositionRef, EngineConfig, SynthesisRef};
use maestro_store::{Cache, Request};

const RESOURCE_WORKERS: usize = 8;
const WRITE_BUFFER_WORKERS: usize = 2;
const WATCH_BACKOFF_MAX_SECS: u64 = 30;

/// Run the engine until the token is cancelled.
pub async fn run(config: EngineConfig, cancel: CancellationToken) -> Result<()> {
    let client = Client::try_default().await.context("building kube client")?;
    let downstream = match &config.downstream_kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .context("reading downstream kubeconfig")?;
            let cfg = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .context("building downstream config")?;
            Client::try_from(cfg).context("building downstream client")?
        }
        None => client.clone(),
    };

    let cache = Arc::new(Cache::new());
    let discovery = Arc::new(maestro_schema::DiscoveryCache::new(
        downstream.clone(),
        config.discovery_rps,
    ));
    let write_buffer = WriteBuffer::new(Arc::new(KubeSliceClient::new(client.clone())));
    write_buffer.spawn(WRITE_BUFFER_WORKERS, cancel.clone());

    let lifecycle_queue: Arc<WorkQueue<CompositionRef>> = Arc::new(WorkQueue::new());
    let status_queue: Arc<WorkQueue<CompositionRef>> = Arc::new(WorkQueue::new());
    let cache_queue: Arc<WorkQueue<CompositionRef>> = Arc::new(WorkQueue::new());
    let rollout_queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new());
    let resource_queue: Arc<WorkQueue<Request>> = Arc::new(WorkQueue::new());
    let limiter_queue: Arc<WorkQueue<()>> = Arc::new(WorkQueue::new());

    // Composition events feed dispatch admission, pod lifecycle, status
    // aggregation, and cache maintenance.
    {
        let lifecycle = Arc::clone(&lifecycle_queue);
        let status = Arc::clone(&status_queue);
        let cache_sync = Arc::clone(&cache_queue);
        let limiter = Arc::clone(&limiter_queue);
        let resources = Arc::clone(&resource_queue);
        let cache_ref = Arc::clone(&cache);
        spawn_watch::<Composition>(client.clone(), cancel.clone(), "compositions", move |comp| {
            let Some(comp_ref) = composition_ref(&comp) else { return };
            lifecycle.add(comp_ref.clone());
            status.add(comp_ref.clone());
            cache_sync.add(comp_ref.clone());
            limiter.add(());

            // A deleting composition needs every cached resource revisited
            // so the reconciler can tear it down.
            if comp.metadata.deletion_timestamp.is_some() {
                if let Some(status) = &comp.status {
                    for syn in status
                        .current_synthesis
                        .iter()
                        .chain(status.previous_synthesis.iter())
                    {
                        if syn.uuid.is_empty() {
                            continue;
                        }
                        let syn_ref = SynthesisRef {
                            composition: comp_ref.clone(),
                            uuid: syn.uuid.clone(),
                        };
                        for request in cache_ref.requests_for(&syn_ref) {
                            resources.add(request);
                        }
                    }
                }
            }
        });
    }

    {
        let rollout = Arc::clone(&rollout_queue);
        spawn_watch::<Synthesizer>(client.clone(), cancel.clone(), "synthesizers", move |syn| {
            if let Some(name) = syn.meta().name.clone() {
                rollout.add(name);
            }
        });
    }

    // Slice status changes retrigger both composition aggregation and every
    // resource of the owning synthesis (readiness groups unblock this way).
    {
        let status = Arc::clone(&status_queue);
        let cache_sync = Arc::clone(&cache_queue);
        let resources = Arc::clone(&resource_queue);
        let cache_ref = Arc::clone(&cache);
        spawn_watch::<ResourceSlice>(client.clone(), cancel.clone(), "resourceslices", move |slice| {
            let Some(owner) = owner_composition(slice.meta()) else { return };
            status.add(owner.clone());
            cache_sync.add(owner.clone());
            let syn = SynthesisRef {
                composition: owner,
                uuid: slice.spec.synthesis_uuid.clone(),
            };
            for request in cache_ref.requests_for(&syn) {
                resources.add(request);
            }
        });
    }

    {
        let lifecycle = Arc::clone(&lifecycle_queue);
        spawn_watch::<Pod>(client.clone(), cancel.clone(), "pods", move |pod| {
            if let Some(owner) = owner_composition(pod.meta()) {
                lifecycle.add(owner);
            }
        });
    }

    // Admission: one loop for the whole fleet, cooldown-paced.
    {
        let limiter = SynthesisConcurrencyLimiter::new(
            client.clone(),
            config.concurrency_limit,
            config.cooldown,
        );
        let queue = Arc::clone(&limiter_queue);
        let cancel = cancel.clone();
        let cooldown = config.cooldown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = queue.next() => {}
                }
                match limiter.reconcile().await {
                    Ok(Some(delay)) => queue.add_after((), delay),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "synthesis dispatch failed");
                        queue.add_after((), cooldown);
                    }
                }
            }
        });
    }

    {
        let controller = PodLifecycleController::new(client.clone(), config.clone());
        let queue = Arc::clone(&lifecycle_queue);
        let cancel = cancel.clone();
        let timeout = config.timeout;
        tokio::spawn(async move {
            loop {
                let comp_ref = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = queue.next() => item,
                };
                match tokio::time::timeout(timeout, controller.reconcile(&comp_ref)).await {
                    Ok(Ok(Some(delay))) => {
                        queue.forget(&comp_ref);
                        queue.add_after(comp_ref, delay);
                    }
                    Ok(Ok(None)) => queue.forget(&comp_ref),
                    Ok(Err(err)) => {
                        warn!(composition = %comp_ref, error = %err, "pod lifecycle reconcile failed");
                        queue.requeue_backoff(comp_ref);
                    }
                    Err(_) => queue.add(comp_ref),
                }
            }
        });
    }

    {
        let controller = StatusController::new(client.clone());
        let queue = Arc::clone(&status_queue);
        let cancel = cancel.clone();
        let timeout = config.timeout;
        tokio::spawn(async move {
            loop {
                let comp_ref = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = queue.next() => item,
                };
                match tokio::time::timeout(timeout, controller.reconcile(&comp_ref)).await {
                    Ok(Ok(())) => queue.forget(&comp_ref),
                    Ok(Err(err)) => {
                        warn!(composition = %comp_ref, error = %err, "status aggregation failed");
                        queue.requeue_backoff(comp_ref);
                    }
                    Err(_) => queue.add(comp_ref),
                }
            }
        });
    }

    {
        let controller = RolloutController::new(client.clone(), config.cooldown);
        let queue = Arc::clone(&rollout_queue);
        let cancel = cancel.clone();
        let timeout = config.timeout;
        tokio::spawn(async move {
            loop {
                let synthesizer = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = queue.next() => item,
                };
                match tokio::time::timeout(timeout, controller.reconcile(&synthesizer)).await {
                    Ok(Ok(Some(delay))) => {
                        queue.forget(&synthesizer);
                        queue.add_after(synthesizer, delay);
                    }
                    Ok(Ok(None)) => queue.forget(&synthesizer),
                    Ok(Err(err)) => {
                        warn!(synthesizer = %synthesizer, error = %err, "rollout failed");
                        queue.requeue_backoff(synthesizer);
                    }
                    Err(_) => queue.add(synthesizer),
                }
            }
        });
    }

    // Cache maintenance: fill syntheses from their slices, purge stale ones,
    // and seed the resource queue.
    {
        let cache_ref = Arc::clone(&cache);
        let queue = Arc::clone(&cache_queue);
        let resources = Arc::clone(&resource_queue);
        let cancel = cancel.clone();
        let sync_client = client.clone();
        tokio::spawn(async move {
            loop {
                let comp_ref = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = queue.next() => item,
                };
                match sync_cache(&sync_client, &cache_ref, &comp_ref).await {
                    Ok(requests) => {
                        queue.forget(&comp_ref);
                        for request in requests {
                            resources.add(request);
                        }
                    }
                    Err(err) => {
                        warn!(composition = %comp_ref, error = %err, "cache sync failed");
                        queue.requeue_backoff(comp_ref);
                    }
                }
            }
        });
    }

    {
        let reconciler = Arc::new(ResourceReconciler::new(
            client.clone(),
            downstream.clone(),
            Arc::clone(&cache),
            discovery,
            Arc::clone(&write_buffer),
            config.readiness_poll_interval,
        ));
        for _ in 0..RESOURCE_WORKERS {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&resource_queue);
            let cancel = cancel.clone();
            let timeout = config.timeout;
            tokio::spawn(async move {
                loop {
                    let request = tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = queue.next() => item,
                    };
                    match tokio::time::timeout(timeout, reconciler.reconcile(&request)).await {
                        Ok(Ok(Some(delay))) => {
                            queue.forget(&request);
                            queue.add_after(request, delay);
                        }
                        Ok(Ok(None)) => queue.forget(&request),
                        Ok(Err(err)) if err.is_terminal() => {
                            // Aborts only this work item. Still requeued
                            // with backoff: a superseding synthesis clears
                            // the condition.
                            error!(resource = %request.resource, error = %err, "terminal reconcile error");
                            counter!("reconciliation_terminal_errors_total", 1u64);
                            queue.requeue_backoff(request);
                        }
                        Ok(Err(err)) => {
                            warn!(resource = %request.resource, error = %err, "reconcile failed");
                            queue.requeue_backoff(request);
                        }
                        // A cancelled reconcile re-enqueues normally.
                        Err(_) => queue.add(request),
                    }
                }
            });
        }
    }

    info!(
        concurrency_limit = config.concurrency_limit,
        cooldown_secs = config.cooldown.as_secs(),
        "engine started"
    );
    cancel.cancelled().await;
    info!("engine stopping");
    Ok(())
}

fn composition_ref(comp: &Composition) -> Option<CompositionRef> {
    Some(CompositionRef {
        name: comp.metadata.name.clone()?,
        namespace: comp.metadata.namespace.clone()?,
    })
}

fn owner_composition(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Option<CompositionRef> {
    let owner = meta
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == "Composition")?;
    Some(CompositionRef {
        name: owner.name.clone(),
        namespace: meta.namespace.clone()?,
    })
}

/// Fill the cache for every synthesized slot of the composition and drop
/// entries for slots that no longer exist.
async fn sync_cache(
    client: &Client,
    cache: &Cache,
    comp_ref: &CompositionRef,
) -> Result<Vec<Request>> {
    let api: Api<Composition> = Api::namespaced(client.clone(), &comp_ref.namespace);
    let Some(comp) = api
        .get_opt(&comp_ref.name)
        .await
        .context("getting composition")?
    else {
        cache.purge(comp_ref, None);
        return Ok(Vec::new());
    };
    cache.purge(comp_ref, Some(&comp));

    let slice_api: Api<ResourceSlice> = Api::namespaced(client.clone(), &comp_ref.namespace);
    let mut requests = Vec::new();
    let status = comp.status.as_ref();
    let slots = status
        .map(|s| {
            s.current_synthesis
                .iter()
                .chain(s.previous_synthesis.iter())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    for syn in slots {
        if syn.uuid.is_empty() || syn.synthesized.is_none() {
            continue;
        }
        let syn_ref = SynthesisRef {
            composition: comp_ref.clone(),
            uuid: syn.uuid.clone(),
        };
        if cache.has_synthesis(&syn_ref) {
            continue;
        }
        let mut slices = Vec::with_capacity(syn.resource_slices.len());
        let mut complete = true;
        for slice_ref in &syn.resource_slices {
            match slice_api
                .get_opt(&slice_ref.name)
                .await
                .context("getting resource slice")?
            {
                Some(slice) => slices.push(slice),
                None => {
                    // Slice not visible yet; the slice watcher will bring us
                    // back.
                    complete = false;
                    break;
                }
            }
        }
        if !complete {
            continue;
        }
        let result = cache.fill(comp_ref, &syn.uuid, &slices);
        for (manifest_ref, error) in &result.failures {
            counter!("manifest_parse_errors_total", 1u64);
            error!(
                slice = %manifest_ref.slice.name,
                index = manifest_ref.index,
                error = %error,
                "terminal manifest parse error"
            );
        }
        requests.extend(result.requests);
    }
    Ok(requests)
}

/// Watch loop: stream events, backoff on errors, restart forever. The
/// initial list arrives as a Restarted event.
fn spawn_watch<K>(
    client: Client,
    cancel: CancellationToken,
    what: &'static str,
    handler: impl Fn(K) + Send + 'static,
) where
    K: KubeResource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default + Clone + std::hash::Hash + Eq,
{
    tokio::spawn(async move {
        let api: Api<K> = Api::all(client);
        let mut backoff: u64 = 1;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let stream = watcher::watcher(api.clone(), watcher::Config::default());
            futures::pin_mut!(stream);
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = stream.try_next() => event,
                };
                match event {
                    Ok(Some(Event::Applied(obj))) => {
                        backoff = 1;
                        handler(obj);
                    }
                    Ok(Some(Event::Deleted(obj))) => handler(obj),
                    Ok(Some(Event::Restarted(objs))) => {
                        backoff = 1;
                        for obj in objs {
                            handler(obj);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(what, error = %err, "watch stream error; will backoff and restart");
                        counter!("watch_errors_total", 1u64);
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(WATCH_BACKOFF_MAX_SECS);
            counter!("watch_restarts_total", 1u64);
        }
    });
}
