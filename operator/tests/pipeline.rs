//! Event handler, work queue and worker pool wired together the way the
//! operator runs them, with a recording reconciler in place of the cluster.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use crddemo_operator::{
    backoff::ExponentialBackoff,
    controller::Controller,
    handler::{EventHandler, Kind},
    informer::{CacheSync, Change, Deletion, Notification},
    kube::{
        runtime::{reflector::store::Writer, watcher},
        CustomResourceExt,
    },
    k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
    queue::WorkQueue,
    reconciler::Reconcile,
    Error, Mydemo, MydemoSpec, ResourceKey, Result,
};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<ResourceKey>>,
}

impl Recorder {
    fn seen(&self) -> Vec<ResourceKey> {
        self.seen.lock().unwrap().clone()
    }

    async fn wait_for(&self, n: usize) -> Vec<ResourceKey> {
        timeout(Duration::from_secs(5), async {
            loop {
                let seen = self.seen();
                if seen.len() >= n {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("reconciles did not happen in time")
    }
}

#[async_trait]
impl Reconcile for Recorder {
    async fn reconcile(&self, key: &ResourceKey) -> Result<()> {
        self.seen.lock().unwrap().push(key.clone());
        if key.name() == "broken" {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(())
    }
}

fn mydemo(name: &str) -> Mydemo {
    let mut mydemo = Mydemo::new(
        name,
        MydemoSpec {
            deployment_name: format!("{name}-nginx"),
            replicas: Some(1),
            image: None,
        },
    );
    mydemo.metadata.namespace = Some("default".into());
    mydemo.metadata.uid = Some(format!("uid-{name}"));
    mydemo.metadata.resource_version = Some("1".into());
    mydemo
}

fn deployment_owned_by(owner: &Mydemo, version: &str) -> ObjectMeta {
    let api_resource = Mydemo::api_resource();
    ObjectMeta {
        name: Some(owner.spec.deployment_name.clone()),
        namespace: Some("default".into()),
        resource_version: Some(version.into()),
        owner_references: Some(vec![OwnerReference {
            api_version: api_resource.api_version,
            kind: api_resource.kind,
            name: owner.metadata.name.clone().unwrap(),
            uid: owner.metadata.uid.clone().unwrap(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]),
        ..ObjectMeta::default()
    }
}

struct Pipeline {
    tx: mpsc::Sender<Notification>,
    recorder: Arc<Recorder>,
    shutdown: CancellationToken,
    controller: tokio::task::JoinHandle<Result<()>>,
}

fn pipeline(cached: Vec<Mydemo>) -> Pipeline {
    let mut writer = Writer::default();
    writer.apply_watcher_event(&watcher::Event::Restarted(cached));

    let queue = WorkQueue::new(ExponentialBackoff::new(
        Duration::from_millis(5),
        Duration::from_millis(100),
    ));
    let recorder = Arc::new(Recorder::default());
    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);

    let handler = EventHandler::new(queue.clone(), writer.as_reader());
    tokio::spawn(handler.run(rx, shutdown.clone()));

    let controller = Controller::new(queue, recorder.clone(), vec![CacheSync::ready()]);
    let controller = tokio::spawn(controller.run(2, shutdown.clone()));

    Pipeline {
        tx,
        recorder,
        shutdown,
        controller,
    }
}

impl Pipeline {
    async fn send(&self, kind: Kind, change: Change) {
        self.tx.send(Notification { kind, change }).await.unwrap();
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.controller.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn new_mydemo_is_reconciled() {
    let web = mydemo("web");
    let p = pipeline(vec![web.clone()]);

    p.send(Kind::Mydemo, Change::Added(web.metadata.clone())).await;
    let seen = p.recorder.wait_for(1).await;
    assert_eq!(seen, vec![ResourceKey::namespaced("default", "web")]);
    p.stop().await;
}

#[tokio::test]
async fn drift_on_dependent_reconciles_owner() {
    let web = mydemo("web");
    let p = pipeline(vec![web.clone()]);

    p.send(
        Kind::Deployment,
        Change::Updated {
            old: deployment_owned_by(&web, "7"),
            new: deployment_owned_by(&web, "8"),
        },
    )
    .await;
    let seen = p.recorder.wait_for(1).await;
    assert_eq!(seen, vec![ResourceKey::namespaced("default", "web")]);
    p.stop().await;
}

#[tokio::test]
async fn resyncs_cause_no_work() {
    let web = mydemo("web");
    let p = pipeline(vec![web.clone()]);

    p.send(
        Kind::Mydemo,
        Change::Updated {
            old: web.metadata.clone(),
            new: web.metadata.clone(),
        },
    )
    .await;
    // a marker after the resync proves the handler got past it
    p.send(Kind::Mydemo, Change::Added(mydemo("marker").metadata)).await;
    let seen = p.recorder.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(seen, vec![ResourceKey::namespaced("default", "marker")]);
    assert_eq!(p.recorder.seen().len(), 1);
    p.stop().await;
}

#[tokio::test]
async fn terminal_failures_do_not_block_other_keys() {
    let p = pipeline(vec![]);

    p.send(Kind::Mydemo, Change::Added(mydemo("broken").metadata)).await;
    p.send(
        Kind::Mydemo,
        Change::Deleted(Deletion::Tombstone {
            key: "default/gone".into(),
            last_known: None,
        }),
    )
    .await;
    let mut seen = p.recorder.wait_for(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    seen.sort();
    assert_eq!(
        seen,
        vec![
            ResourceKey::namespaced("default", "broken"),
            ResourceKey::namespaced("default", "gone"),
        ]
    );
    // the terminal failure was not retried
    assert_eq!(p.recorder.seen().len(), 2);
    p.stop().await;
}
