//! Turns cache notifications into work queue keys.

use std::{collections::HashMap, sync::Arc};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    runtime::reflector::{ObjectRef, Store},
    Resource,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    informer::{Change, Deletion, Notification},
    queue::WorkQueue,
    Mydemo, ResourceKey,
};

/// Kinds of object the controller watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Mydemo,
    Deployment,
}

/// Maps an object of some kind to the key of the Mydemo it belongs to.
pub type KeyResolver = fn(&ObjectMeta, &Store<Mydemo>) -> Option<ResourceKey>;

pub struct EventHandler {
    queue: Arc<WorkQueue<ResourceKey>>,
    mydemos: Store<Mydemo>,
    resolvers: HashMap<Kind, KeyResolver>,
}

impl EventHandler {
    pub fn new(queue: Arc<WorkQueue<ResourceKey>>, mydemos: Store<Mydemo>) -> Self {
        let resolvers = HashMap::from([
            (Kind::Mydemo, own_key as KeyResolver),
            (Kind::Deployment, owner_key as KeyResolver),
        ]);
        EventHandler {
            queue,
            mydemos,
            resolvers,
        }
    }

    /// Consume notifications until `shutdown` fires or every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<Notification>, shutdown: CancellationToken) {
        loop {
            let notification = tokio::select! {
                () = shutdown.cancelled() => break,
                notification = rx.recv() => notification,
            };
            match notification {
                Some(notification) => self.handle(notification),
                None => break,
            }
        }
        info!("event handler stopped");
    }

    pub fn handle(&self, Notification { kind, change }: Notification) {
        match change {
            Change::Added(meta) => self.enqueue_for(kind, &meta),
            Change::Updated { old, new } => {
                if old.resource_version == new.resource_version {
                    trace!(?kind, name = ?new.name, "skipping resync");
                    return;
                }
                self.enqueue_for(kind, &new);
            }
            Change::Deleted(Deletion::Final(meta)) => self.enqueue_for(kind, &meta),
            Change::Deleted(Deletion::Tombstone {
                last_known: Some(meta),
                ..
            }) => self.enqueue_for(kind, &meta),
            Change::Deleted(Deletion::Tombstone {
                key,
                last_known: None,
            }) => match (kind, key.parse::<ResourceKey>()) {
                (Kind::Mydemo, Ok(key)) => self.enqueue(key),
                (_, Err(err)) => debug!(?kind, error = %err, "dropping tombstone"),
                (_, Ok(key)) => debug!(?kind, %key, "cannot resolve owner of tombstone"),
            },
        }
    }

    fn enqueue_for(&self, kind: Kind, meta: &ObjectMeta) {
        let Some(resolve) = self.resolvers.get(&kind) else {
            debug!(?kind, "no resolver for kind");
            return;
        };
        if let Some(key) = resolve(meta, &self.mydemos) {
            self.enqueue(key);
        }
    }

    /// The only path onto the work queue.
    pub fn enqueue(&self, key: ResourceKey) {
        trace!(%key, "enqueue");
        self.queue.add(key);
    }
}

fn own_key(meta: &ObjectMeta, _: &Store<Mydemo>) -> Option<ResourceKey> {
    ResourceKey::from_meta(meta)
}

/// Key of the Mydemo controlling the object, if it is still cached.
fn owner_key(meta: &ObjectMeta, mydemos: &Store<Mydemo>) -> Option<ResourceKey> {
    let owner = meta
        .owner_references
        .as_deref()?
        .iter()
        .find(|owner| owner.controller == Some(true))?;
    if owner.kind != Mydemo::kind(&()) || owner.api_version != Mydemo::api_version(&()) {
        return None;
    }

    let namespace = meta.namespace.as_deref()?;
    match mydemos.get(&ObjectRef::new(&owner.name).within(namespace)) {
        Some(mydemo) => Some(mydemo.key()),
        None => {
            debug!(
                object = ?meta.name,
                owner = %owner.name,
                namespace = %namespace,
                "ignoring orphaned object"
            );
            None
        }
    }
}
