//! Deduplicating, rate limited work queue.
//!
//! An item is either queued, processing, or absent. Adding an item that is
//! already queued is a no-op; adding one that is processing marks it dirty so
//! that [`WorkQueue::done`] puts it back. Together this means one item is never
//! handed to two workers at once, and no add is ever lost.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{
    sync::{mpsc, Notify},
    time::{self, Instant},
};
use tracing::trace;

use crate::backoff::ExponentialBackoff;

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    /// Items that need processing, whether queued or waiting on a worker to finish.
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    backoff: Mutex<ExponentialBackoff<T>>,
    delays: Mutex<Option<mpsc::UnboundedSender<(T, Instant)>>>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue and spawn its timer task on the current tokio runtime.
    pub fn new(backoff: ExponentialBackoff<T>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(WorkQueue {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff: Mutex::new(backoff),
            delays: Mutex::new(Some(tx)),
        });
        tokio::spawn(run_delays(Arc::downgrade(&queue), rx));
        queue
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self) -> MutexGuard<'_, ExponentialBackoff<T>> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // requeued by `done`
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    ///
    /// The returned item stays in the processing set until [`done`](Self::done)
    /// is called for it.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item`. If it was added again meanwhile it is queued.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.shutting_down || !state.dirty.contains(item) {
            return;
        }
        state.queue.push_back(item.clone());
        drop(state);
        self.notify.notify_one();
    }

    /// Add `item` once `delay` has passed. Pending delays for the same item
    /// collapse into the earliest one.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let delays = self.delays.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = delays.as_ref() {
            // the receiver only goes away with the queue itself
            let _ = tx.send((item, Instant::now() + delay));
        }
    }

    /// Add `item` after its next backoff delay, returning that delay.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.backoff().when(&item);
        self.add_after(item, delay);
        delay
    }

    /// Reset the backoff of `item`.
    pub fn forget(&self, item: &T) {
        self.backoff().forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.backoff().num_requeues(item)
    }

    /// Shortest delay the rate limiter hands out.
    pub fn base_delay(&self) -> Duration {
        self.backoff().base()
    }

    /// Number of items waiting for a worker.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items. Blocked and future [`get`](Self::get) calls
    /// return `None`, later adds are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.queue.clear();
        }
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

/// Moves delayed items onto the queue once they are due.
async fn run_delays<T>(queue: Weak<WorkQueue<T>>, mut rx: mpsc::UnboundedReceiver<(T, Instant)>)
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    let mut waiting: HashMap<T, Instant> = HashMap::new();

    loop {
        let next = waiting.values().min().copied();
        let due = async {
            match next {
                Some(at) => time::sleep_until(at).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            req = rx.recv() => match req {
                Some((item, at)) => {
                    waiting
                        .entry(item)
                        .and_modify(|pending| *pending = (*pending).min(at))
                        .or_insert(at);
                }
                None => return,
            },
            () = due => {
                let Some(queue) = queue.upgrade() else { return };
                let now = Instant::now();
                let ready: Vec<T> = waiting
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(item, _)| item.clone())
                    .collect();
                trace!(count = ready.len(), "delayed items due");
                for item in ready {
                    waiting.remove(&item);
                    queue.add(item);
                }
            }
        }
    }
}
