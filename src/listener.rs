//! Keeps the [`ResourceIndex`] in step with the cluster.
//!
//! One watch stream per workload kind feeds the listener. Applied objects
//! (initial listing, creation or update) are folded into the index, deleted
//! objects are removed from it. The first completed listing of a kind fires
//! that kind's synced signal.

use crate::image_reference::ImageReference;
use crate::index::{ResourceIndex, ResourceKey};
use crate::workload::{Workload, WorkloadRef};
use futures::{Stream, StreamExt};
use kube::Api;
use kube::runtime::{WatchStreamExt, watcher};
use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ChangeListener {
    index: Arc<ResourceIndex>,
}

impl ChangeListener {
    pub fn new(index: Arc<ResourceIndex>) -> Self {
        Self { index }
    }

    /// Handles both creation and update; only the new state matters.
    pub fn on_apply<W: Workload>(&self, workload: &W) {
        let workload_ref = WorkloadRef::of(workload);
        let keys: Vec<ResourceKey> = workload
            .containers()
            .iter()
            .filter_map(|container| {
                let image = container.image.as_deref().unwrap_or_default();
                let reference = ImageReference::parse(image);
                if !reference.is_valid() {
                    warn!(
                        "Skipping container {} in {}: invalid image format '{}'",
                        container.name, workload_ref, image
                    );
                    return None;
                }
                Some(ResourceKey::new(&workload_ref, &container.name, reference))
            })
            .collect();

        debug!("Indexing {} containers of {}", keys.len(), workload_ref);
        self.index.sync_workload(&workload_ref, keys);
    }

    pub fn on_delete<W: Workload>(&self, workload: &W) {
        let workload_ref = WorkloadRef::of(workload);
        for container in workload.containers() {
            let image = container.image.as_deref().unwrap_or_default();
            let reference = ImageReference::parse(image);
            if !reference.is_valid() {
                warn!(
                    "Skipping container {} in deleted {}: invalid image format '{}'",
                    container.name, workload_ref, image
                );
                continue;
            }
            self.index
                .remove(&reference.name, &reference.tag, &workload_ref);
        }
        // Slots the dispatcher wrote through may carry a newer tag than the
        // deleted object's last known state
        self.index
            .retain_workloads(workload_ref.kind, |other| other != &workload_ref);
        debug!("Removed {} from index", workload_ref);
    }

    /// Drains a watch event stream into the index until it ends.
    pub async fn consume<W, S>(&self, events: S, synced: oneshot::Sender<()>)
    where
        W: Workload,
        S: Stream<Item = Result<watcher::Event<W>, watcher::Error>>,
    {
        let mut events = pin!(events);
        let mut synced = Some(synced);
        // workloads seen since the last Init, used to prune missed deletions
        let mut relisted: Option<HashSet<WorkloadRef>> = None;

        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Apply(workload)) => self.on_apply(&workload),
                Ok(watcher::Event::Delete(workload)) => self.on_delete(&workload),
                Ok(watcher::Event::Init) => {
                    debug!("{} watcher (re)listing", W::KIND);
                    relisted = Some(HashSet::new());
                }
                Ok(watcher::Event::InitApply(workload)) => {
                    self.on_apply(&workload);
                    if let Some(seen) = relisted.as_mut() {
                        seen.insert(WorkloadRef::of(&workload));
                    }
                }
                Ok(watcher::Event::InitDone) => {
                    if let Some(seen) = relisted.take() {
                        self.index
                            .retain_workloads(W::KIND, |workload| seen.contains(workload));
                    }
                    if let Some(synced) = synced.take() {
                        info!(
                            "{} watcher synced, index holds {} images",
                            W::KIND,
                            self.index.image_count()
                        );
                        let _ = synced.send(());
                    }
                }
                Err(e) => warn!("{} watch stream error: {}", W::KIND, e),
            }
        }
    }
}

/// Watches one workload kind until `shutdown` is cancelled.
pub async fn watch<W: Workload>(
    api: Api<W>,
    config: watcher::Config,
    listener: Arc<ChangeListener>,
    synced: oneshot::Sender<()>,
    shutdown: CancellationToken,
) {
    info!("Starting {} watcher", W::KIND);
    let events = watcher(api, config).default_backoff();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = listener.consume(events, synced) => {}
    }
    info!("{} watcher stopped", W::KIND);
}
