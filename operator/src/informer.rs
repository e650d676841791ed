//! Local cache of watched objects and the change notifications derived from it.
//!
//! An [`Informer`] runs a kube watcher, mirrors the objects in a reflector
//! [`Store`], and forwards every change as a [`Notification`] over a bounded
//! channel. The channel decouples the watch stream from how fast the event
//! handler consumes it.

use std::{collections::HashSet, fmt::Debug, hash::Hash, time::Duration};

use futures::{future, Stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::ListParams,
    runtime::{
        reflector::{
            store::{Store, Writer},
            ObjectRef,
        },
        watcher::{self, watcher},
    },
    Api, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{handler::Kind, ResourceKey};

/// Pause before resuming a failed watch.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How an object left the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum Deletion {
    /// A delete event carried the final state of the object.
    Final(ObjectMeta),
    /// The object vanished between two lists, so its final state is unknown.
    /// Holds its key and the last state the cache saw.
    Tombstone {
        key: String,
        last_known: Option<ObjectMeta>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Added(ObjectMeta),
    Updated { old: ObjectMeta, new: ObjectMeta },
    Deleted(Deletion),
}

/// A change to one cached object of the given kind.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub kind: Kind,
    pub change: Change,
}

/// Resolves once the informer has completed its first list.
#[derive(Clone, Debug)]
pub struct CacheSync(watch::Receiver<bool>);

impl CacheSync {
    /// A cache that is already synced.
    pub fn ready() -> Self {
        let (_, rx) = watch::channel(true);
        CacheSync(rx)
    }

    pub fn has_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until synced. Returns false if the informer went away first.
    pub async fn wait(mut self) -> bool {
        loop {
            if *self.0.borrow_and_update() {
                return true;
            }
            if self.0.changed().await.is_err() {
                return false;
            }
        }
    }
}

impl From<watch::Receiver<bool>> for CacheSync {
    fn from(rx: watch::Receiver<bool>) -> Self {
        CacheSync(rx)
    }
}

/// Wait for all caches to sync. Returns false if `shutdown` fires first or an
/// informer stops before syncing.
pub async fn wait_for_cache_sync(syncs: Vec<CacheSync>, shutdown: &CancellationToken) -> bool {
    let pending = syncs.iter().filter(|sync| !sync.has_synced()).count();
    if pending > 0 {
        info!(pending, "waiting for caches to sync");
    }
    tokio::select! {
        () = shutdown.cancelled() => false,
        synced = future::join_all(syncs.into_iter().map(CacheSync::wait)) => {
            synced.into_iter().all(|synced| synced)
        }
    }
}

pub struct Informer<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash,
{
    kind: Kind,
    writer: Writer<K>,
    synced: watch::Sender<bool>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(kind: Kind) -> Self {
        let (synced, _) = watch::channel(false);
        Informer {
            kind,
            writer: Writer::default(),
            synced,
        }
    }

    /// Read handle on the cache.
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    pub fn cache_sync(&self) -> CacheSync {
        CacheSync(self.synced.subscribe())
    }

    /// Watch `api` until `shutdown` fires or the receiving side of `tx` is dropped.
    pub async fn run(
        self,
        api: Api<K>,
        params: ListParams,
        tx: mpsc::Sender<Notification>,
        shutdown: CancellationToken,
    ) {
        self.run_stream(watcher(api, params), tx, shutdown).await;
    }

    /// Mirror `events` into the cache and forward the changes to `tx`.
    ///
    /// The cache is updated before the notifications of an event are sent, so
    /// whoever reacts to one already sees the new state.
    pub async fn run_stream<S>(
        self,
        events: S,
        tx: mpsc::Sender<Notification>,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    {
        let Informer {
            kind,
            mut writer,
            synced,
        } = self;
        let mut events = events.boxed();

        info!(?kind, "starting informer");
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.next() => event,
            };

            match event {
                Some(Ok(event)) => {
                    let notifications = notifications(kind, &writer.as_reader(), &event);
                    writer.apply_watcher_event(&event);
                    if let watcher::Event::Restarted(objects) = &event {
                        debug!(?kind, count = objects.len(), "cache listed");
                        synced.send_replace(true);
                    }
                    for notification in notifications {
                        if tx.send(notification).await.is_err() {
                            debug!(?kind, "event handler gone, stopping informer");
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(?kind, error = %err, "watch failed, retrying");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                    }
                }
                None => break,
            }
        }
        info!(?kind, "informer stopped");
    }
}

/// Changes `event` makes to the cache in `store`, which must not have seen
/// the event applied yet.
pub fn notifications<K>(
    kind: Kind,
    store: &Store<K>,
    event: &watcher::Event<K>,
) -> Vec<Notification>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let notification = |change| Notification { kind, change };
    let applied = |obj: &K| {
        let new = obj.meta().clone();
        match store.get(&ObjectRef::from_obj(obj)) {
            Some(old) => Change::Updated {
                old: old.meta().clone(),
                new,
            },
            None => Change::Added(new),
        }
    };

    match event {
        watcher::Event::Applied(obj) => vec![notification(applied(obj))],
        watcher::Event::Deleted(obj) => {
            vec![notification(Change::Deleted(Deletion::Final(obj.meta().clone())))]
        }
        watcher::Event::Restarted(objects) => {
            let listed: HashSet<ResourceKey> = objects
                .iter()
                .filter_map(|obj| ResourceKey::from_meta(obj.meta()))
                .collect();

            // anything cached but missing from the new list was deleted while
            // the watch was down
            let vanished = store.state().into_iter().filter_map(|obj| {
                let key = ResourceKey::from_meta(obj.meta())?;
                (!listed.contains(&key)).then(|| {
                    Change::Deleted(Deletion::Tombstone {
                        key: key.to_string(),
                        last_known: Some(obj.meta().clone()),
                    })
                })
            });

            objects
                .iter()
                .map(applied)
                .chain(vanished)
                .map(notification)
                .collect()
        }
    }
}
