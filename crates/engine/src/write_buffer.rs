//! Coalescing write buffer for ResourceSlice status patches.
//!
//! Reconciler workers report per-resource state through here instead of
//! writing slices directly: updates to the same resource coalesce (last
//! writer wins), writes batch per slice, and a bounded worker pool drains
//! them. Conflicts re-read the slice and re-apply the patch functions, so
//! the buffer converges without ordering guarantees across refs.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use metrics::counter;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::WorkQueue;
use maestro_api::{ResourceSlice, ResourceSliceStatus, ResourceState};
use maestro_core::resource::{ManifestRef, SliceRef};

/// Computes the replacement state from the current one; `None` means no
/// change is needed.
pub type StatusPatchFn =
    Arc<dyn Fn(Option<&ResourceState>) -> Option<ResourceState> + Send + Sync>;

/// Slice access seam. The engine uses the kube client; tests substitute a
/// mock.
#[async_trait]
pub trait SliceStatusClient: Send + Sync + 'static {
    async fn get_slice(&self, slice: &SliceRef) -> anyhow::Result<Option<ResourceSlice>>;
    async fn update_slice_status(
        &self,
        slice: &SliceRef,
        status: ResourceSliceStatus,
    ) -> anyhow::Result<()>;
}

pub struct KubeSliceClient {
    client: kube::Client,
}

impl KubeSliceClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SliceStatusClient for KubeSliceClient {
    async fn get_slice(&self, slice: &SliceRef) -> anyhow::Result<Option<ResourceSlice>> {
        let api: Api<ResourceSlice> = Api::namespaced(self.client.clone(), &slice.namespace);
        Ok(api.get_opt(&slice.name).await?)
    }

    async fn update_slice_status(
        &self,
        slice: &SliceRef,
        status: ResourceSliceStatus,
    ) -> anyhow::Result<()> {
        let api: Api<ResourceSlice> = Api::namespaced(self.client.clone(), &slice.namespace);
        let patch = serde_json::json!({"status": status});
        api.patch_status(&slice.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub struct WriteBuffer {
    client: Arc<dyn SliceStatusClient>,
    pending: Mutex<FxHashMap<ManifestRef, StatusPatchFn>>,
    queue: WorkQueue<SliceRef>,
}

impl WriteBuffer {
    pub fn new(client: Arc<dyn SliceStatusClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            pending: Mutex::new(FxHashMap::default()),
            queue: WorkQueue::new(),
        })
    }

    /// Record a status patch for eventual, batched delivery.
    pub fn patch_status_async(&self, manifest_ref: &ManifestRef, patch: StatusPatchFn) {
        self.pending
            .lock()
            .unwrap()
            .insert(manifest_ref.clone(), patch);
        self.queue.add(manifest_ref.slice.clone());
    }

    /// Start `workers` drain tasks.
    pub fn spawn(self: &Arc<Self>, workers: usize, cancel: CancellationToken) {
        for _ in 0..workers.max(1) {
            let buffer = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let slice_ref = tokio::select! {
                        _ = cancel.cancelled() => return,
                        slice_ref = buffer.queue.next() => slice_ref,
                    };
                    buffer.drain_slice(&slice_ref).await;
                }
            });
        }
    }

    fn take_pending(&self, slice: &SliceRef) -> Vec<(ManifestRef, StatusPatchFn)> {
        let mut pending = self.pending.lock().unwrap();
        let refs: Vec<ManifestRef> = pending
            .keys()
            .filter(|r| r.slice == *slice)
            .cloned()
            .collect();
        refs.into_iter()
            .map(|r| {
                let patch = pending.remove(&r).unwrap();
                (r, patch)
            })
            .collect()
    }

    /// Apply all coalesced patches for one slice with a single status write.
    pub async fn drain_slice(&self, slice_ref: &SliceRef) {
        let batch = self.take_pending(slice_ref);
        if batch.is_empty() {
            self.queue.forget(slice_ref);
            return;
        }

        match self.apply_batch(slice_ref, &batch).await {
            Ok(()) => {
                self.queue.forget(slice_ref);
            }
            Err(err) => {
                warn!(slice = %slice_ref.name, error = %err, "slice status update failed; will retry");
                counter!("slice_status_update_errors_total", 1u64);
                // Re-apply against a fresh read next round. A newer patch fn
                // queued in the meantime wins.
                let mut pending = self.pending.lock().unwrap();
                for (manifest_ref, patch) in batch {
                    pending.entry(manifest_ref).or_insert(patch);
                }
                drop(pending);
                self.queue.requeue_backoff(slice_ref.clone());
            }
        }
    }

    async fn apply_batch(
        &self,
        slice_ref: &SliceRef,
        batch: &[(ManifestRef, StatusPatchFn)],
    ) -> anyhow::Result<()> {
        let Some(slice) = self.client.get_slice(slice_ref).await? else {
            // Slice is gone; the synthesis was superseded. Nothing to write.
            debug!(slice = %slice_ref.name, "dropping status patches for deleted slice");
            return Ok(());
        };

        let len = slice.spec.resources.len();
        let mut states = slice
            .status
            .as_ref()
            .map(|s| s.resources.clone())
            .unwrap_or_default();
        let observed = states.len();

        let mut changed = false;
        for (manifest_ref, patch) in batch {
            if manifest_ref.index >= len {
                continue;
            }
            let existing = if manifest_ref.index < observed {
                Some(&states[manifest_ref.index])
            } else {
                None
            };
            let Some(next) = patch(existing) else { continue };
            if states.len() <= manifest_ref.index {
                states.resize(manifest_ref.index + 1, ResourceState::default());
            }
            if states[manifest_ref.index] != next {
                states[manifest_ref.index] = next;
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        self.client
            .update_slice_status(slice_ref, ResourceSliceStatus { resources: states })
            .await?;
        counter!("slice_status_updates_total", 1u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_api::{Manifest, ResourceSliceSpec};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockClient {
        slice: Mutex<Option<ResourceSlice>>,
        updates: AtomicUsize,
        fail_next: AtomicBool,
    }

    impl MockClient {
        fn with_resources(n: usize) -> Arc<Self> {
            let mut slice = ResourceSlice::new(
                "slice-0",
                ResourceSliceSpec {
                    composition_generation: 1,
                    synthesis_uuid: "syn-a".into(),
                    resources: (0..n)
                        .map(|_| Manifest { manifest: "{}".into(), deleted: false })
                        .collect(),
                },
            );
            slice.metadata.namespace = Some("default".into());
            Arc::new(Self {
                slice: Mutex::new(Some(slice)),
                updates: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl SliceStatusClient for MockClient {
        async fn get_slice(&self, _: &SliceRef) -> anyhow::Result<Option<ResourceSlice>> {
            Ok(self.slice.lock().unwrap().clone())
        }

        async fn update_slice_status(
            &self,
            _: &SliceRef,
            status: ResourceSliceStatus,
        ) -> anyhow::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("conflict");
            }
            let mut slice = self.slice.lock().unwrap();
            if let Some(slice) = slice.as_mut() {
                slice.status = Some(status);
            }
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn slice_ref() -> SliceRef {
        SliceRef { name: "slice-0".into(), namespace: "default".into() }
    }

    fn manifest_ref(index: usize) -> ManifestRef {
        ManifestRef { slice: slice_ref(), index }
    }

    fn set_reconciled() -> StatusPatchFn {
        Arc::new(|state| {
            let next = ResourceState { reconciled: true, ..Default::default() };
            if state == Some(&next) {
                return None;
            }
            Some(next)
        })
    }

    #[tokio::test]
    async fn coalesces_to_last_writer_and_batches_per_slice() {
        let client = MockClient::with_resources(2);
        let buffer = WriteBuffer::new(client.clone());

        buffer.patch_status_async(
            &manifest_ref(0),
            Arc::new(|_| Some(ResourceState { reconciled: false, ..Default::default() })),
        );
        buffer.patch_status_async(&manifest_ref(0), set_reconciled());
        buffer.patch_status_async(&manifest_ref(1), set_reconciled());
        buffer.drain_slice(&slice_ref()).await;

        // One write covers both refs; ref 0 got the later patch.
        assert_eq!(client.updates.load(Ordering::SeqCst), 1);
        let slice = client.slice.lock().unwrap().clone().unwrap();
        let states = slice.status.unwrap().resources;
        assert!(states[0].reconciled);
        assert!(states[1].reconciled);
    }

    #[tokio::test]
    async fn noop_patches_write_nothing() {
        let client = MockClient::with_resources(1);
        let buffer = WriteBuffer::new(client.clone());

        buffer.patch_status_async(&manifest_ref(0), set_reconciled());
        buffer.drain_slice(&slice_ref()).await;
        assert_eq!(client.updates.load(Ordering::SeqCst), 1);

        // Same state again: the patch fn returns None and no write happens.
        buffer.patch_status_async(&manifest_ref(0), set_reconciled());
        buffer.drain_slice(&slice_ref()).await;
        assert_eq!(client.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_writes_are_retried_with_reread() {
        let client = MockClient::with_resources(1);
        client.fail_next.store(true, Ordering::SeqCst);
        let buffer = WriteBuffer::new(client.clone());

        buffer.patch_status_async(&manifest_ref(0), set_reconciled());
        buffer.drain_slice(&slice_ref()).await;
        assert_eq!(client.updates.load(Ordering::SeqCst), 0);

        // The patch was put back; the next drain converges.
        buffer.drain_slice(&slice_ref()).await;
        assert_eq!(client.updates.load(Ordering::SeqCst), 1);
        let slice = client.slice.lock().unwrap().clone().unwrap();
        assert!(slice.status.unwrap().resources[0].reconciled);
    }

    #[tokio::test]
    async fn deleted_slice_drops_patches() {
        let client = MockClient::with_resources(1);
        *client.slice.lock().unwrap() = None;
        let buffer = WriteBuffer::new(client.clone());

        buffer.patch_status_async(&manifest_ref(0), set_reconciled());
        buffer.drain_slice(&slice_ref()).await;
        assert_eq!(client.updates.load(Ordering::SeqCst), 0);
        assert!(buffer.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_refs_are_ignored() {
        let client = MockClient::with_resources(1);
        let buffer = WriteBuffer::new(client.clone());

        buffer.patch_status_async(&manifest_ref(7), set_reconciled());
        buffer.drain_slice(&slice_ref()).await;
        assert_eq!(client.updates.load(Ordering::SeqCst), 0);
    }
}
