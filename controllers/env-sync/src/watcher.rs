//! ConfigMap watch subscription and event funnel.
//!
//! `subscribe` starts a background task that pumps the kube watch stream into
//! a reflector cache and, alongside, into a channel of classified
//! [`ConfigMapEvent`]s. The [`funnel`] turns those events into reconciliation
//! keys: only creations and deletions matter, because the reconciler reacts to
//! whether a ConfigMap exists, never to what it contains.

use crate::key::ReconcileKey;
use crate::queue::WorkQueue;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube_runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered notifications between the pump and the funnel
const EVENT_BUFFER: usize = 256;

/// A ConfigMap notification, reduced to the key it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigMapEvent {
    /// First seen by this watch
    Added(ReconcileKey),
    /// Changed while already cached
    Updated(ReconcileKey),
    /// Removed, or missing from a relist
    Deleted(ReconcileKey),
}

/// Maps a notification to the key that needs reconciling, if any.
///
/// Updates are dropped on purpose: they do not change whether the ConfigMap
/// exists, so they cannot change the desired state of any Deployment.
pub fn funnel(event: &ConfigMapEvent) -> Option<ReconcileKey> {
    match event {
        ConfigMapEvent::Added(key) | ConfigMapEvent::Deleted(key) => Some(key.clone()),
        ConfigMapEvent::Updated(_) => None,
    }
}

/// Feeds every funnelled key into the queue until the subscription closes.
pub async fn run_funnel(mut events: mpsc::Receiver<ConfigMapEvent>, queue: WorkQueue<ReconcileKey>) {
    while let Some(event) = events.recv().await {
        match funnel(&event) {
            Some(key) => {
                info!("{:?}, enqueueing {}", event, key);
                queue.add(key);
            }
            None => debug!("{:?} ignored", event),
        }
    }
    debug!("ConfigMap event channel closed, funnel stopping");
}

fn object_ref(key: &ReconcileKey) -> ObjectRef<ConfigMap> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// Keys of every ConfigMap currently in the cache.
pub fn cached_keys(store: &Store<ConfigMap>) -> Vec<ReconcileKey> {
    let mut keys: Vec<_> = store
        .state()
        .iter()
        .map(|cm| ReconcileKey::from_config_map(cm))
        .collect();
    keys.sort();
    keys
}

/// Handle to a running ConfigMap watch.
///
/// Dropping the handle also stops the pump; [`cancel`](Self::cancel)
/// additionally waits for it to exit.
pub struct Subscription {
    store: Store<ConfigMap>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cached", &self.store.state().len())
            .field("running", &!self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Waits for the first complete listing to land in the cache.
    ///
    /// Returns `false` if the watch stopped before that happened.
    pub async fn wait_for_initial_sync(&self) -> bool {
        self.store.wait_until_ready().await.is_ok()
    }

    /// Point-in-time cache read. Absence here does not prove the ConfigMap is gone.
    #[allow(dead_code)] // Reconciliation reads the live API instead
    pub fn get(&self, key: &ReconcileKey) -> Option<Arc<ConfigMap>> {
        self.store.get(&object_ref(key))
    }

    /// Keys of every cached ConfigMap
    pub fn keys(&self) -> Vec<ReconcileKey> {
        cached_keys(&self.store)
    }

    /// A reader sharing this subscription's cache.
    pub fn store(&self) -> Store<ConfigMap> {
        self.store.clone()
    }

    /// Stops the pump and waits for it to exit.
    pub async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Err(e) = self.task.await {
            warn!("ConfigMap watch task ended abnormally: {}", e);
        }
    }
}

/// Starts watching ConfigMaps visible through `api`.
pub fn subscribe(api: Api<ConfigMap>) -> (Subscription, mpsc::Receiver<ConfigMapEvent>) {
    subscribe_stream(watcher(api, watcher::Config::default()).default_backoff())
}

/// Starts a subscription over an arbitrary watch event stream.
pub fn subscribe_stream<S>(stream: S) -> (Subscription, mpsc::Receiver<ConfigMapEvent>)
where
    S: Stream<Item = Result<watcher::Event<ConfigMap>, watcher::Error>> + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let (cancel_tx, cancel_rx) = oneshot::channel();

    let pump = Pump {
        reader: reader.clone(),
        writer,
        events: tx,
        relist_seen: None,
    };
    let task = tokio::spawn(pump.run(stream, cancel_rx));

    (
        Subscription {
            store: reader,
            cancel: Some(cancel_tx),
            task,
        },
        rx,
    )
}

struct Pump {
    reader: Store<ConfigMap>,
    writer: Writer<ConfigMap>,
    events: mpsc::Sender<ConfigMapEvent>,
    // Keys seen since the last `Init`, while a relist is in progress
    relist_seen: Option<HashSet<ReconcileKey>>,
}

impl Pump {
    async fn run<S>(mut self, stream: S, mut cancel: oneshot::Receiver<()>)
    where
        S: Stream<Item = Result<watcher::Event<ConfigMap>, watcher::Error>> + Send + 'static,
    {
        info!("Starting ConfigMap watcher");
        let mut stream = Box::pin(stream);

        loop {
            let next = tokio::select! {
                _ = &mut cancel => {
                    info!("ConfigMap watcher cancelled");
                    return;
                }
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    // The backoff wrapper keeps the stream alive across errors
                    warn!("ConfigMap watch error, retrying: {}", e);
                    continue;
                }
                None => {
                    info!("ConfigMap watch stream ended");
                    return;
                }
            };

            // Classify against the cache before the event is applied to it
            let notifications = self.classify(&event);
            self.writer.apply_watcher_event(&event);

            for notification in notifications {
                if self.events.send(notification).await.is_err() {
                    debug!("ConfigMap event receiver dropped, watcher stopping");
                    return;
                }
            }
        }
    }

    fn classify(&mut self, event: &watcher::Event<ConfigMap>) -> Vec<ConfigMapEvent> {
        match event {
            watcher::Event::Apply(cm) => vec![self.added_or_updated(cm)],
            watcher::Event::Delete(cm) => {
                vec![ConfigMapEvent::Deleted(ReconcileKey::from_config_map(cm))]
            }
            watcher::Event::Init => {
                debug!("ConfigMap relist started");
                self.relist_seen = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(cm) => {
                let notification = self.added_or_updated(cm);
                if let Some(seen) = self.relist_seen.as_mut() {
                    seen.insert(ReconcileKey::from_config_map(cm));
                }
                vec![notification]
            }
            watcher::Event::InitDone => {
                // Anything cached before the relist but absent from it was
                // deleted while the watch was down.
                let seen = self.relist_seen.take().unwrap_or_default();
                let vanished: Vec<_> = cached_keys(&self.reader)
                    .into_iter()
                    .filter(|key| !seen.contains(key))
                    .map(ConfigMapEvent::Deleted)
                    .collect();
                info!(
                    "ConfigMap relist complete: {} present, {} vanished",
                    seen.len(),
                    vanished.len()
                );
                vanished
            }
        }
    }

    fn added_or_updated(&self, cm: &ConfigMap) -> ConfigMapEvent {
        let key = ReconcileKey::from_config_map(cm);
        if self.reader.get(&object_ref(&key)).is_some() {
            ConfigMapEvent::Updated(key)
        } else {
            ConfigMapEvent::Added(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_config_map;
    use futures::stream;
    use watcher::Event;

    fn key(name: &str) -> ReconcileKey {
        ReconcileKey::new("ns1", name)
    }

    fn cm(name: &str) -> ConfigMap {
        create_test_config_map("ns1", name)
    }

    async fn collect(mut rx: mpsc::Receiver<ConfigMapEvent>) -> Vec<ConfigMapEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn events(
        items: Vec<Event<ConfigMap>>,
    ) -> impl Stream<Item = Result<Event<ConfigMap>, watcher::Error>> + Send + 'static {
        stream::iter(items.into_iter().map(Ok))
    }

    #[test]
    fn test_funnel_ignores_updates() {
        assert_eq!(funnel(&ConfigMapEvent::Added(key("a"))), Some(key("a")));
        assert_eq!(funnel(&ConfigMapEvent::Deleted(key("a"))), Some(key("a")));
        assert_eq!(funnel(&ConfigMapEvent::Updated(key("a"))), None);
    }

    #[tokio::test]
    async fn test_pump_classifies_add_update_delete() {
        let (sub, rx) = subscribe_stream(events(vec![
            Event::Init,
            Event::InitApply(cm("a")),
            Event::InitDone,
            Event::Apply(cm("a")),
            Event::Apply(cm("b")),
            Event::Delete(cm("a")),
        ]));

        assert_eq!(
            collect(rx).await,
            vec![
                ConfigMapEvent::Added(key("a")),
                ConfigMapEvent::Updated(key("a")),
                ConfigMapEvent::Added(key("b")),
                ConfigMapEvent::Deleted(key("a")),
            ]
        );
        assert!(sub.wait_for_initial_sync().await);
        assert!(sub.get(&key("a")).is_none());
        assert!(sub.get(&key("b")).is_some());
        assert_eq!(sub.keys(), vec![key("b")]);
    }

    #[tokio::test]
    async fn test_relist_reports_objects_deleted_while_disconnected() {
        let (_sub, rx) = subscribe_stream(events(vec![
            Event::Init,
            Event::InitApply(cm("a")),
            Event::InitApply(cm("b")),
            Event::InitDone,
            // Watch restarted: `a` went away, `c` appeared
            Event::Init,
            Event::InitApply(cm("b")),
            Event::InitApply(cm("c")),
            Event::InitDone,
        ]));

        assert_eq!(
            collect(rx).await,
            vec![
                ConfigMapEvent::Added(key("a")),
                ConfigMapEvent::Added(key("b")),
                ConfigMapEvent::Updated(key("b")),
                ConfigMapEvent::Added(key("c")),
                ConfigMapEvent::Deleted(key("a")),
            ]
        );
    }

    #[tokio::test]
    async fn test_initial_sync_fails_when_watch_dies_early() {
        let (sub, rx) = subscribe_stream(events(vec![Event::Init, Event::InitApply(cm("a"))]));
        let _ = collect(rx).await;
        assert!(!sub.wait_for_initial_sync().await);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_watch() {
        let (sub, _rx) = subscribe_stream(stream::pending::<Result<Event<ConfigMap>, watcher::Error>>());
        sub.cancel().await;
    }

    #[tokio::test]
    async fn test_run_funnel_enqueues_adds_and_deletes_only() {
        let queue: WorkQueue<ReconcileKey> = WorkQueue::new();
        let (tx, rx) = mpsc::channel(8);
        tx.send(ConfigMapEvent::Added(key("a"))).await.unwrap();
        tx.send(ConfigMapEvent::Updated(key("b"))).await.unwrap();
        tx.send(ConfigMapEvent::Deleted(key("c"))).await.unwrap();
        tx.send(ConfigMapEvent::Added(key("a"))).await.unwrap();
        drop(tx);

        run_funnel(rx, queue.clone()).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("c")));
    }
}
