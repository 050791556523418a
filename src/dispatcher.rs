//! Single consumer that turns push events into workload updates.
//!
//! Events are processed strictly one at a time, in the order they were
//! enqueued. Cluster calls are awaited inline, so a slow API server delays
//! every queued event behind the current one; each call is bounded by the
//! configured update timeout.

use crate::cluster::{ClusterClient, WorkloadStore};
use crate::image_reference::ImageReference;
use crate::index::{ResourceIndex, ResourceKey};
use crate::push_event::PushEvent;
use crate::workload::{Workload, WorkloadKind};
use anyhow::anyhow;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A push event waiting in the queue, with its completion channel.
pub struct Submission {
    pub id: u64,
    pub event: PushEvent,
    pub done: oneshot::Sender<DispatchReport>,
}

/// Outcome of dispatching one push event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Container slots rolled onto the pushed image
    pub updated: usize,
    /// Container slots already running the pushed tag
    pub up_to_date: usize,
    /// Container slots whose update failed or timed out
    pub failed: usize,
    /// Pushed images with an unparseable resource URL
    pub invalid: usize,
    /// Pushed images no indexed workload runs
    pub unmatched: usize,
}

pub struct Dispatcher<C> {
    index: Arc<ResourceIndex>,
    cluster: Arc<C>,
    update_timeout: Duration,
}

impl<C: ClusterClient> Dispatcher<C> {
    pub fn new(index: Arc<ResourceIndex>, cluster: Arc<C>, update_timeout: Duration) -> Self {
        Self {
            index,
            cluster,
            update_timeout,
        }
    }

    /// Drains `queue` until it closes or `shutdown` is cancelled. Nothing is
    /// dequeued before `synced` turns true.
    pub async fn run(
        self,
        mut queue: mpsc::Receiver<Submission>,
        mut synced: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) {
        let initial_sync = async { synced.wait_for(|synced| *synced).await.is_ok() };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            completed = initial_sync => {
                if !completed {
                    error!("Cluster watchers stopped before the initial sync, dispatcher not started");
                    return;
                }
            }
        }
        info!("Update dispatcher started");

        loop {
            let submission = tokio::select! {
                _ = shutdown.cancelled() => break,
                submission = queue.recv() => match submission {
                    Some(submission) => submission,
                    None => break,
                },
            };

            let report = self.dispatch(submission.id, &submission.event).await;
            info!("Event {} processed: {:?}", submission.id, report);
            if submission.done.send(report).is_err() {
                debug!("Submitter of event {} is no longer waiting", submission.id);
            }
        }

        info!("Update dispatcher stopped");
    }

    pub async fn dispatch(&self, event_id: u64, event: &PushEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        info!(
            "Event {}: {} pushed {} images to {}",
            event_id,
            event.operator,
            event.event_data.resources.len(),
            event.repository_name()
        );

        for image in &event.event_data.resources {
            let reference = ImageReference::parse(&image.resource_url);
            if !reference.is_valid() {
                warn!(
                    "Event {}: invalid image format: {}",
                    event_id, image.resource_url
                );
                report.invalid += 1;
                continue;
            }

            // The lock is released before any cluster call
            let Some(keys) = self.index.lookup(&reference.name) else {
                debug!(
                    "Event {}: no workload runs image {}",
                    event_id, reference.name
                );
                report.unmatched += 1;
                continue;
            };

            for key in keys {
                if key.image_tag == reference.tag {
                    info!(
                        "Event {}: image already up to date: {} {}/{} container {}",
                        event_id, key.kind, key.namespace, key.resource_name, key.container_name
                    );
                    report.up_to_date += 1;
                    continue;
                }

                match self.update_container(&key, &image.resource_url).await {
                    Ok(()) => {
                        info!(
                            "Event {}: image updated: {} {}/{} container {} -> {}",
                            event_id,
                            key.kind,
                            key.namespace,
                            key.resource_name,
                            key.container_name,
                            image.resource_url
                        );
                        if !self.index.update_tag(&reference.name, &key, &reference.tag) {
                            debug!(
                                "Event {}: {} {}/{} left the index during the update",
                                event_id, key.kind, key.namespace, key.resource_name
                            );
                        }
                        report.updated += 1;
                    }
                    Err(e) => {
                        error!(
                            "Event {}: failed to update {} {}/{} container {}: {:?}",
                            event_id, key.kind, key.namespace, key.resource_name, key.container_name, e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    async fn update_container(&self, key: &ResourceKey, image: &str) -> anyhow::Result<()> {
        let update = async {
            match key.kind {
                WorkloadKind::Deployment => {
                    roll_container::<Deployment, _>(self.cluster.as_ref(), key, image).await
                }
                WorkloadKind::StatefulSet => {
                    roll_container::<StatefulSet, _>(self.cluster.as_ref(), key, image).await
                }
            }
        };

        match tokio::time::timeout(self.update_timeout, update).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "Timed out after {:?} updating {} {}/{}",
                self.update_timeout,
                key.kind,
                key.namespace,
                key.resource_name
            )),
        }
    }
}

async fn roll_container<W, S>(store: &S, key: &ResourceKey, image: &str) -> anyhow::Result<()>
where
    W: Workload,
    S: WorkloadStore<W> + ?Sized,
{
    let mut workload = store.get(&key.namespace, &key.resource_name).await?;
    if !workload.set_container_image(&key.container_name, image) {
        anyhow::bail!(
            "{} {}/{} has no container named {}",
            W::KIND,
            key.namespace,
            key.resource_name,
            key.container_name
        );
    }
    store.replace(&key.namespace, &workload).await
}
