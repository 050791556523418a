//! Wires the index, the cluster listeners and the update dispatcher together.

use crate::cluster::{ClusterClient, KubeCluster};
use crate::config::WatcherConfig;
use crate::dispatcher::{DispatchReport, Dispatcher, Submission};
use crate::index::ResourceIndex;
use crate::listener::{self, ChangeListener};
use crate::push_event::PushEvent;
use crate::workload::Workload;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::runtime::watcher;
use kube::{Api, Client};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("update dispatcher is not running")]
    Closed,
    #[error("event {0} was dropped before it was dispatched")]
    Dropped(u64),
}

/// Completion handle for one enqueued push event.
#[derive(Debug)]
pub struct EventTicket {
    pub id: u64,
    done: oneshot::Receiver<DispatchReport>,
}

impl EventTicket {
    pub async fn wait(self) -> Result<DispatchReport, SubmitError> {
        self.done.await.map_err(|_| SubmitError::Dropped(self.id))
    }
}

pub struct WatcherService {
    queue: mpsc::Sender<Submission>,
    synced: watch::Receiver<bool>,
    next_event_id: AtomicU64,
}

impl WatcherService {
    /// Watches Deployments and StatefulSets through `client` and spawns the
    /// dispatcher, which starts once both kinds have been listed.
    pub fn start(client: Client, config: &WatcherConfig, shutdown: CancellationToken) -> Self {
        let index = Arc::new(ResourceIndex::default());
        let listener = Arc::new(ChangeListener::new(index.clone()));

        let deployments_synced =
            spawn_watcher::<Deployment>(&client, config, listener.clone(), shutdown.clone());
        let stateful_sets_synced =
            spawn_watcher::<StatefulSet>(&client, config, listener, shutdown.clone());

        let synced = combine_synced(deployments_synced, stateful_sets_synced, index.clone());

        Self::spawn(
            index,
            Arc::new(KubeCluster::new(client)),
            synced,
            config,
            shutdown,
        )
    }

    /// Spawns the dispatcher over an existing index and cluster client.
    pub fn spawn<C: ClusterClient>(
        index: Arc<ResourceIndex>,
        cluster: Arc<C>,
        synced: watch::Receiver<bool>,
        config: &WatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue, events) = mpsc::channel(config.queue_capacity);
        let dispatcher = Dispatcher::new(index, cluster, config.update_timeout());
        tokio::spawn(dispatcher.run(events, synced.clone(), shutdown));

        Self {
            queue,
            synced,
            next_event_id: AtomicU64::new(1),
        }
    }

    /// Queues `event`, waiting for room in the queue if it is full.
    pub async fn enqueue(&self, event: PushEvent) -> Result<EventTicket, SubmitError> {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done) = oneshot::channel();
        self.queue
            .send(Submission {
                id,
                event,
                done: done_tx,
            })
            .await
            .map_err(|_| SubmitError::Closed)?;
        Ok(EventTicket { id, done })
    }

    /// Queues `event` and waits until it has been fully dispatched.
    pub async fn submit(&self, event: PushEvent) -> Result<(u64, DispatchReport), SubmitError> {
        let ticket = self.enqueue(event).await?;
        let id = ticket.id;
        Ok((id, ticket.wait().await?))
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }
}

/// Flips the returned flag to true once both per-kind signals have fired.
/// It stays false if either watcher stops before its first listing.
fn combine_synced(
    deployments: oneshot::Receiver<()>,
    stateful_sets: oneshot::Receiver<()>,
    index: Arc<ResourceIndex>,
) -> watch::Receiver<bool> {
    let (synced_tx, synced) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::join!(deployments, stateful_sets) {
            (Ok(()), Ok(())) => {
                info!(
                    "Initial cluster state synced: {} images across {} containers",
                    index.image_count(),
                    index.key_count()
                );
                synced_tx.send_replace(true);
            }
            _ => warn!("Cluster watchers stopped before the initial sync completed"),
        }
    });
    synced
}

fn spawn_watcher<W: Workload>(
    client: &Client,
    config: &WatcherConfig,
    listener: Arc<ChangeListener>,
    shutdown: CancellationToken,
) -> oneshot::Receiver<()> {
    let api: Api<W> = match &config.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let mut watcher_config = watcher::Config::default();
    if let Some(selector) = &config.label_selector {
        watcher_config = watcher_config.labels(selector);
    }

    let (synced_tx, synced) = oneshot::channel();
    tokio::spawn(listener::watch(
        api,
        watcher_config,
        listener,
        synced_tx,
        shutdown,
    ));
    synced
}
