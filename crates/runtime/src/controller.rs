use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use korda_core::{labels, meta, Gvk, KordaError, KordaResult, ObjectKey, WatchEvent};
use korda_store::{ResourceStore, WatchFilter};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::{Backoff, WorkQueue};
use crate::{Outcome, Reconciler, RuntimeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Label selector a controller uses to watch the children of its instances.
pub fn child_filter(instance_gvk: &Gvk) -> WatchFilter {
    WatchFilter::all().label(labels::INSTANCE_KIND, instance_gvk.kind.clone())
}

/// Owning instance of a materialized child, read from its ownership labels.
pub fn owner_of(child: &Json) -> Option<ObjectKey> {
    let name = meta::label(child, labels::INSTANCE_NAME)?;
    let ns = meta::label(child, labels::INSTANCE_NAMESPACE).filter(|s| !s.is_empty());
    Some(ObjectKey::new(ns, name))
}

type KeyOf = fn(&Json) -> Option<ObjectKey>;

/// Watches, queue and workers for one composite type.
pub struct Controller {
    gvk: Gvk,
    queue: WorkQueue<ObjectKey>,
    state: watch::Sender<LifecycleState>,
    stop: watch::Sender<bool>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Spawn the instance watch, one watch per child type, the resync timer and the workers.
    pub fn start(
        gvk: Gvk,
        child_gvks: Vec<Gvk>,
        store: Arc<dyn ResourceStore>,
        reconciler: Arc<dyn Reconciler>,
        cfg: &RuntimeConfig,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(Backoff::new(cfg.backoff_base, cfg.backoff_max));
        let (state, _) = watch::channel(LifecycleState::Starting);
        let (stop, _) = watch::channel(false);
        let ctl = Arc::new(Self {
            gvk: gvk.clone(),
            queue: queue.clone(),
            state,
            stop,
            watchers: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        });

        let mut watchers = Vec::new();
        watchers.push(tokio::spawn(watch_loop(
            Arc::clone(&store),
            gvk.clone(),
            WatchFilter::all(),
            queue.clone(),
            ctl.stop.subscribe(),
            ObjectKey::of,
            Some(Arc::clone(&ctl)),
            cfg.backoff_base,
        )));
        for child in child_gvks {
            watchers.push(tokio::spawn(watch_loop(
                Arc::clone(&store),
                child,
                child_filter(&gvk),
                queue.clone(),
                ctl.stop.subscribe(),
                owner_of,
                None,
                cfg.backoff_base,
            )));
        }
        if !cfg.resync.is_zero() {
            watchers.push(tokio::spawn(resync_loop(Arc::clone(&store), gvk.clone(), queue.clone(), ctl.stop.subscribe(), cfg.resync)));
        }
        *ctl.watchers.lock().unwrap_or_else(PoisonError::into_inner) = watchers;

        let workers = (0..cfg.workers.max(1))
            .map(|i| tokio::spawn(worker_loop(i, gvk.clone(), queue.clone(), Arc::clone(&reconciler))))
            .collect();
        *ctl.workers.lock().unwrap_or_else(PoisonError::into_inner) = workers;
        info!(gvk = %gvk, workers = cfg.workers, "controller starting");
        ctl
    }

    pub fn gvk(&self) -> &Gvk { &self.gvk }

    pub fn state(&self) -> LifecycleState { *self.state.borrow() }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    fn mark_running(&self) {
        let flipped = self.state.send_if_modified(|s| {
            if *s == LifecycleState::Starting {
                *s = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        if flipped {
            info!(gvk = %self.gvk, "controller running");
        }
    }

    /// Resolves true once the initial listing completed, false if the
    /// controller stopped first.
    pub async fn running(&self) -> bool {
        let mut rx = self.state.subscribe();
        let running = match rx.wait_for(|s| *s != LifecycleState::Starting).await {
            Ok(s) => *s == LifecycleState::Running,
            Err(_) => false,
        };
        running
    }

    /// Stop watching, let in-flight passes finish within `drain`, then release
    /// everything. Teardown completes even when the drain times out.
    pub async fn stop(&self, drain: Duration) -> KordaResult<()> {
        if matches!(self.state(), LifecycleState::Stopping | LifecycleState::Stopped) {
            return Ok(());
        }
        self.state.send_replace(LifecycleState::Stopping);
        debug!(gvk = %self.gvk, in_flight = self.queue.in_flight(), "controller stopping");
        let _ = self.stop.send(true);
        for w in std::mem::take(&mut *self.watchers.lock().unwrap_or_else(PoisonError::into_inner)) {
            w.abort();
        }
        self.queue.shut_down();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        let drained = tokio::time::timeout(drain, futures::future::join_all(workers)).await;
        let result = match drained {
            Ok(_) => Ok(()),
            Err(_) => {
                for a in aborts {
                    a.abort();
                }
                warn!(gvk = %self.gvk, timeout = ?drain, "drain timed out; aborting in-flight passes");
                Err(KordaError::DrainTimeout { gvk: self.gvk.to_string(), timeout: drain })
            }
        };
        self.state.send_replace(LifecycleState::Stopped);
        info!(gvk = %self.gvk, "controller stopped");
        result
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    store: Arc<dyn ResourceStore>,
    gvk: Gvk,
    filter: WatchFilter,
    queue: WorkQueue<ObjectKey>,
    mut stop: watch::Receiver<bool>,
    key_of: KeyOf,
    owner: Option<Arc<Controller>>,
    retry: Duration,
) {
    loop {
        let opened = tokio::select! {
            _ = stop.changed() => return,
            r = store.watch(&gvk, &filter) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                debug!(gvk = %gvk, error = %e, "watch failed to open; retrying");
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(retry) => continue,
                }
            }
        };
        loop {
            let next = tokio::select! {
                _ = stop.changed() => return,
                n = stream.next() => n,
            };
            match next {
                Some(Ok(WatchEvent::Restarted(items))) => {
                    debug!(gvk = %gvk, count = items.len(), "watch listing");
                    for key in items.iter().filter_map(key_of) {
                        queue.add(key);
                    }
                    if let Some(ctl) = &owner {
                        ctl.mark_running();
                    }
                }
                Some(Ok(WatchEvent::Applied(obj))) | Some(Ok(WatchEvent::Deleted(obj))) => {
                    if let Some(key) = key_of(&obj) {
                        queue.add(key);
                    }
                }
                Some(Err(e)) => {
                    debug!(gvk = %gvk, error = %e, "watch stream error; reopening");
                    break;
                }
                None => {
                    debug!(gvk = %gvk, "watch stream ended; reopening");
                    break;
                }
            }
        }
    }
}

async fn resync_loop(store: Arc<dyn ResourceStore>, gvk: Gvk, queue: WorkQueue<ObjectKey>, mut stop: watch::Receiver<bool>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {}
        }
        match store.list(&gvk, &WatchFilter::all()).await {
            Ok(items) => {
                for key in items.iter().filter_map(ObjectKey::of) {
                    queue.add(key);
                }
            }
            Err(e) => debug!(gvk = %gvk, error = %e, "resync list failed"),
        }
    }
}

async fn worker_loop(id: usize, gvk: Gvk, queue: WorkQueue<ObjectKey>, reconciler: Arc<dyn Reconciler>) {
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let res = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await;
        counter!("reconcile_passes", 1u64);
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        let Ok(res) = res else {
            counter!("reconcile_panics", 1u64);
            let delay = queue.add_rate_limited(key.clone());
            warn!(gvk = %gvk, key = %key, worker = id, ?delay, "reconcile panicked; will retry");
            queue.done(&key);
            continue;
        };
        match res {
            Ok(Outcome::Done) => queue.forget(&key),
            Ok(Outcome::RequeueAfter(d)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), d);
            }
            Err(e) if e.is_retryable() => {
                let delay = queue.add_rate_limited(key.clone());
                debug!(gvk = %gvk, key = %key, worker = id, reason = e.reason(), error = %e, ?delay, "pass will be retried");
            }
            Err(e) => {
                queue.forget(&key);
                warn!(gvk = %gvk, key = %key, worker = id, error = %e, "pass failed");
            }
        }
        queue.done(&key);
    }
    debug!(gvk = %gvk, worker = id, "worker exiting");
}
