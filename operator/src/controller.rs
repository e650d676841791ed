use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{api::ListParams, Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::ExponentialBackoff,
    cluster::KubeCluster,
    config::ControllerConfig,
    error::{Disposition, Result},
    handler::{EventHandler, Kind},
    informer::{wait_for_cache_sync, CacheSync, Informer},
    queue::WorkQueue,
    reconciler::{Reconcile, Reconciler},
    Error, Mydemo, ResourceKey,
};

/// Pool of workers draining the work queue into a reconciler.
pub struct Controller<R> {
    queue: Arc<WorkQueue<ResourceKey>>,
    reconciler: Arc<R>,
    cache_syncs: Vec<CacheSync>,
}

impl<R: Reconcile> Controller<R> {
    pub fn new(
        queue: Arc<WorkQueue<ResourceKey>>,
        reconciler: Arc<R>,
        cache_syncs: Vec<CacheSync>,
    ) -> Self {
        Controller {
            queue,
            reconciler,
            cache_syncs,
        }
    }

    /// Run `workers` reconcile loops until `shutdown` fires.
    ///
    /// Nothing is processed before every cache has synced. On shutdown the
    /// queue stops handing out keys and this returns once in-flight
    /// reconciles have finished.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) -> Result<()> {
        if workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }

        info!("waiting for informer caches to sync");
        if !wait_for_cache_sync(self.cache_syncs, &shutdown).await {
            self.queue.shut_down();
            if shutdown.is_cancelled() {
                info!("stopped before caches synced");
                return Ok(());
            }
            return Err(Error::Transient("informer stopped before its cache synced".into()));
        }

        info!(workers, "starting workers");
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let worker_loop = run_worker(worker, self.queue.clone(), self.reconciler.clone());
                tokio::spawn(worker_loop)
            })
            .collect();

        shutdown.cancelled().await;
        info!("shutting down workers");
        self.queue.shut_down();

        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                error!(error = %err, "worker task failed");
            }
        }
        info!("workers stopped");
        Ok(())
    }
}

async fn run_worker<R: Reconcile>(
    worker: usize,
    queue: Arc<WorkQueue<ResourceKey>>,
    reconciler: Arc<R>,
) {
    debug!(worker, "worker started");
    while process_next_item(&queue, reconciler.as_ref()).await {}
    debug!(worker, "worker stopped");
}

/// Marks the key done however processing ends.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<ResourceKey>,
    key: &'a ResourceKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

/// Reconcile one key from the queue. Returns false once the queue shut down.
async fn process_next_item<R: Reconcile + ?Sized>(
    queue: &WorkQueue<ResourceKey>,
    reconciler: &R,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    let _done = DoneGuard { queue, key: &key };

    let result = AssertUnwindSafe(reconciler.reconcile(&key))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(&*panic);
            Err(Error::Transient(format!("reconcile panicked: {message}")))
        });

    match result {
        Ok(()) => {
            debug!(%key, "reconciled");
            queue.forget(&key);
        }
        Err(err) => match err.disposition() {
            Disposition::Terminal => {
                warn!(%key, error = %err, "dropping key after terminal error");
                queue.forget(&key);
            }
            Disposition::Immediate => {
                debug!(%key, error = %err, "requeueing without backoff");
                queue.add_after(key.clone(), queue.base_delay());
            }
            Disposition::Backoff => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    %key,
                    error = %err,
                    retries = queue.num_requeues(&key),
                    delay_ms = delay.as_millis() as u64,
                    "reconcile failed, requeueing"
                );
            }
        },
    }
    true
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Start the controller.
///
/// Wires the informers, the event handler and the worker pool together. The
/// returned future runs until `shutdown` fires and in-flight work is done.
pub async fn init(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<BoxFuture<'static, Result<()>>> {
    config.validate()?;

    let mydemos = Api::<Mydemo>::all(client.clone());
    if mydemos.list(&ListParams::default().limit(1)).await.is_err() {
        error!("mydemo CRD is not queryable.");
        info!("install CRD with crddemo crd | kubectl apply -f -");
        return Err(Error::CrdNotInstalled);
    }

    let deployments = Api::<Deployment>::all(client.clone());
    let mydemo_informer = Informer::new(Kind::Mydemo);
    let deployment_informer = Informer::new(Kind::Deployment);
    let cache_syncs = vec![mydemo_informer.cache_sync(), deployment_informer.cache_sync()];

    let queue = WorkQueue::new(ExponentialBackoff::new(config.backoff_base, config.backoff_max));
    let handler = EventHandler::new(queue.clone(), mydemo_informer.store());
    let cluster = KubeCluster::new(client, deployment_informer.store());
    let reconciler = Reconciler::new(cluster, mydemo_informer.store());
    let controller = Controller::new(queue, Arc::new(reconciler), cache_syncs);

    info!(workers = config.workers, "starting operator");

    let (tx, rx) = mpsc::channel(config.event_buffer);
    let background = vec![
        tokio::spawn(mydemo_informer.run(
            mydemos,
            ListParams::default(),
            tx.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(deployment_informer.run(
            deployments,
            ListParams::default(),
            tx,
            shutdown.clone(),
        )),
        tokio::spawn(handler.run(rx, shutdown.clone())),
    ];

    let task = async move {
        let result = controller.run(config.workers, shutdown.clone()).await;
        // also stop the informers if the pool gave up on its own
        shutdown.cancel();
        futures::future::join_all(background).await;
        result
    };
    Ok(task.boxed())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use kube::core::ErrorResponse;
    use tokio::{
        sync::{watch, Notify, Semaphore},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;

    #[derive(Debug)]
    enum Step {
        Succeed,
        Transient,
        Terminal,
        Conflict,
        Panic,
        /// Succeed after the test adds a permit to the gate.
        Gated,
    }

    /// Reconciler following a script, recording how it was called.
    struct Scripted {
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        finished: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        started: Notify,
        gate: Semaphore,
    }

    impl Scripted {
        fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Scripted {
                script: Mutex::new(steps.into_iter().collect()),
                calls: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                started: Notify::new(),
                gate: Semaphore::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn wait_for_calls(&self, n: usize) {
            timeout(Duration::from_secs(30), async {
                while self.calls() < n {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("expected {n} calls, saw {}", self.calls()));
        }
    }

    #[async_trait::async_trait]
    impl Reconcile for Scripted {
        async fn reconcile(&self, _key: &ResourceKey) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.started.notify_one();

            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
            let result = match step {
                Step::Succeed => Ok(()),
                Step::Transient => Err(Error::Transient("api unavailable".into())),
                Step::Terminal => Err(Error::InvalidKey("bad".into())),
                Step::Conflict => Err(Error::VersionConflict(kube::Error::Api(ErrorResponse {
                    status: "Failure".into(),
                    message: "the object has been modified".into(),
                    reason: "Conflict".into(),
                    code: 409,
                }))),
                Step::Panic => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    panic!("reconciler bug");
                }
                Step::Gated => {
                    let _permit = self.gate.acquire().await.unwrap();
                    Ok(())
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::namespaced("default", name)
    }

    fn queue() -> Arc<WorkQueue<ResourceKey>> {
        WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        ))
    }

    fn start(
        queue: &Arc<WorkQueue<ResourceKey>>,
        reconciler: &Arc<Scripted>,
        workers: usize,
        syncs: Vec<CacheSync>,
    ) -> (CancellationToken, JoinHandle<Result<()>>) {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(queue.clone(), reconciler.clone(), syncs);
        let handle = tokio::spawn(controller.run(workers, shutdown.clone()));
        (shutdown, handle)
    }

    #[tokio::test]
    async fn rejects_zero_workers() {
        let controller = Controller::new(queue(), Scripted::new([]), vec![]);
        let err = controller.run(0, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn re_adds_during_reconcile_run_once_afterwards() {
        let queue = queue();
        let reconciler = Scripted::new([Step::Gated]);
        let (shutdown, handle) = start(&queue, &reconciler, 4, vec![CacheSync::ready()]);

        queue.add(key("a"));
        reconciler.started.notified().await;
        for _ in 0..5 {
            queue.add(key("a"));
        }
        // three idle workers, yet nothing else is handed out
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.calls(), 1);

        reconciler.gate.add_permits(1);
        reconciler.wait_for_calls(2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(reconciler.calls(), 2);
        assert_eq!(reconciler.max_in_flight.load(Ordering::SeqCst), 1);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let queue = queue();
        let reconciler = Scripted::new([Step::Gated, Step::Gated]);
        let (shutdown, handle) = start(&queue, &reconciler, 2, vec![CacheSync::ready()]);

        queue.add(key("a"));
        queue.add(key("b"));
        reconciler.wait_for_calls(2).await;
        assert_eq!(reconciler.max_in_flight.load(Ordering::SeqCst), 2);

        reconciler.gate.add_permits(2);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_forget() {
        let queue = queue();
        let reconciler = Scripted::new([Step::Transient, Step::Transient, Step::Transient]);
        let (shutdown, handle) = start(&queue, &reconciler, 1, vec![CacheSync::ready()]);

        queue.add(key("a"));
        reconciler.wait_for_calls(4).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(queue.num_requeues(&key("a")), 0);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let queue = queue();
        let reconciler = Scripted::new([Step::Terminal]);
        let (shutdown, handle) = start(&queue, &reconciler, 1, vec![CacheSync::ready()]);

        queue.add(key("a"));
        reconciler.wait_for_calls(1).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(reconciler.calls(), 1);
        assert_eq!(queue.num_requeues(&key("a")), 0);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn version_conflicts_retry_without_backoff() {
        let queue = queue();
        let reconciler = Scripted::new([Step::Conflict, Step::Conflict]);
        let (shutdown, handle) = start(&queue, &reconciler, 1, vec![CacheSync::ready()]);

        let start = tokio::time::Instant::now();
        queue.add(key("a"));
        reconciler.wait_for_calls(3).await;

        assert_eq!(queue.num_requeues(&key("a")), 0);
        // each retry waits the base delay, which does not grow
        let elapsed = start.elapsed();
        assert!(elapsed >= 2 * queue.base_delay(), "{elapsed:?}");
        assert!(elapsed < 3 * queue.base_delay(), "{elapsed:?}");
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panics_are_retried_and_worker_survives() {
        let queue = queue();
        let reconciler = Scripted::new([Step::Panic]);
        let (shutdown, handle) = start(&queue, &reconciler, 1, vec![CacheSync::ready()]);

        queue.add(key("a"));
        reconciler.wait_for_calls(2).await;
        queue.add(key("b"));
        reconciler.wait_for_calls(3).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waits_for_cache_sync() {
        let queue = queue();
        let reconciler = Scripted::new([]);
        let (synced, rx) = watch::channel(false);
        let (shutdown, handle) = start(&queue, &reconciler, 1, vec![rx.into()]);

        queue.add(key("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.calls(), 0);

        synced.send_replace(true);
        reconciler.wait_for_calls(1).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_sync_processes_nothing() {
        let queue = queue();
        let reconciler = Scripted::new([]);
        let (_synced, rx) = watch::channel(false);
        let (shutdown, handle) = start(&queue, &reconciler, 1, vec![rx.into()]);

        queue.add(key("a"));
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(reconciler.calls(), 0);
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_finish_and_starts_nothing_new() {
        let queue = queue();
        let reconciler = Scripted::new([Step::Gated]);
        let (shutdown, handle) = start(&queue, &reconciler, 1, vec![CacheSync::ready()]);

        queue.add(key("a"));
        reconciler.started.notified().await;
        queue.add(key("b"));
        shutdown.cancel();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "returned while a reconcile was running");

        reconciler.gate.add_permits(1);
        handle.await.unwrap().unwrap();
        assert_eq!(reconciler.calls(), 1);
        assert_eq!(reconciler.finished.load(Ordering::SeqCst), 1);
    }
}
