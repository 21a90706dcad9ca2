// src/core/scheduler.rs

//! The Background Scheduler: starts and supervises every periodic
//! worker the controller runs — image catalog refresh, the prepuller tick,
//! lab and file-server reconciliation, the progress-event purger, and a
//! long-lived Node watch — isolating each from the others' panics and
//! coordinating graceful shutdown.

use crate::core::events::ProgressEventBus;
use crate::core::events::purger::{ActiveUserProvider, EventPurgerTask};
use crate::core::fileserver::FileServerManager;
use crate::core::images::ImageService;
use crate::core::k8s::KubernetesAdapter;
use crate::core::k8s::watch::{WatchEvent, watch_cluster};
use crate::core::lab::LabManager;
use crate::core::prepuller::PrepullerTask;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long `shutdown` waits for every worker to return before giving up and
/// moving on; workers that exceed this just get dropped mid-task.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

const INITIAL_RESTART_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);

/// Minimum spacing between node-watch-triggered refreshes, so a burst of
/// node churn (a node group scaling up) coalesces into one refresh rather
/// than one per event.
const NODE_WATCH_REFRESH_DEBOUNCE: Duration = Duration::from_secs(5);

/// Combines the lab and file-server managers' own in-memory user sets so the
/// event-bus purger never drops a channel out from under either one.
///
/// Every user with a slot counts as active, `absent` included: a lab that
/// fully tears down calls `bus.forget_user` itself at that moment, so this
/// purger exists as a backstop for leftover state (e.g. a crash between
/// teardown and `forget_user`), not as the primary reclamation path.
struct CombinedActiveUsers {
    lab: Arc<LabManager>,
    fileserver: Option<Arc<FileServerManager>>,
}

impl ActiveUserProvider for CombinedActiveUsers {
    fn active_users(&self) -> HashSet<String> {
        let mut users: HashSet<String> = self.lab.slots_snapshot().into_iter().map(|(u, _)| u).collect();
        if let Some(fileserver) = &self.fileserver {
            users.extend(fileserver.slots_snapshot().into_iter().map(|(u, _)| u));
        }
        users
    }
}

/// Owns the shutdown broadcast and every worker's `JoinHandle`. Built by
/// [`Scheduler::start`] and torn down by [`Scheduler::shutdown`]; dropping a
/// `Scheduler` without calling `shutdown` just leaves its workers running
/// until the process exits.
pub struct Scheduler {
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts every background worker. `fileserver` is `None` when
    /// `fileserver.enabled` is false in configuration, in which case no
    /// file-server reconcile worker is started.
    pub fn start(
        k8s: KubernetesAdapter,
        images: Arc<ImageService>,
        prepuller: Arc<PrepullerTask>,
        lab: Arc<LabManager>,
        fileserver: Option<Arc<FileServerManager>>,
        bus: Arc<ProgressEventBus>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        handles.push(spawn_supervised("image-refresh", &shutdown_tx, &stopping, {
            let images = images.clone();
            move |rx| {
                let images = images.clone();
                async move { images.run(rx).await }
            }
        }));

        handles.push(spawn_supervised("prepuller-tick", &shutdown_tx, &stopping, {
            let prepuller = prepuller.clone();
            move |rx| {
                let prepuller = prepuller.clone();
                async move { prepuller.run(rx).await }
            }
        }));

        handles.push(spawn_supervised("lab-reconcile", &shutdown_tx, &stopping, {
            let lab = lab.clone();
            move |rx| {
                let lab = lab.clone();
                async move { run_lab_reconcile_loop(lab, rx).await }
            }
        }));

        if let Some(fileserver) = fileserver.clone() {
            handles.push(spawn_supervised("fileserver-reconcile", &shutdown_tx, &stopping, {
                move |rx| {
                    let fileserver = fileserver.clone();
                    async move { run_fileserver_reconcile_loop(fileserver, rx).await }
                }
            }));
        }

        let active_users: Arc<dyn ActiveUserProvider> = Arc::new(CombinedActiveUsers {
            lab: lab.clone(),
            fileserver: fileserver.clone(),
        });
        handles.push(spawn_supervised("event-purger", &shutdown_tx, &stopping, {
            let bus = bus.clone();
            let active_users = active_users.clone();
            move |rx| {
                let task = EventPurgerTask::new(bus.clone(), active_users.clone());
                async move { task.run(rx).await }
            }
        }));

        handles.push(spawn_supervised("node-watch", &shutdown_tx, &stopping, {
            let k8s = k8s.clone();
            let images = images.clone();
            move |rx| {
                let k8s = k8s.clone();
                let images = images.clone();
                async move { run_node_watch_loop(k8s, images, rx).await }
            }
        }));

        Scheduler {
            shutdown_tx,
            stopping,
            handles,
        }
    }

    /// Signals every worker to stop, waits up to [`SHUTDOWN_GRACE_PERIOD`]
    /// for them to return, and drains the progress-event bus's subscribers
    /// with a sentinel event so SSE clients see a clean stream end rather
    /// than a dropped connection.
    pub async fn shutdown(self, bus: &ProgressEventBus) {
        info!("Scheduler shutting down {} background workers.", self.handles.len());
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let grace = tokio::time::sleep(SHUTDOWN_GRACE_PERIOD);
        tokio::pin!(grace);
        let mut remaining: futures::stream::FuturesUnordered<JoinHandle<()>> =
            self.handles.into_iter().collect();
        loop {
            tokio::select! {
                _ = &mut grace => {
                    warn!("{} background worker(s) did not stop within the grace period.", remaining.len());
                    break;
                }
                next = remaining.next() => {
                    match next {
                        Some(Err(e)) => warn!("background worker task join error during shutdown: {}", e),
                        Some(Ok(())) => {}
                        None => break,
                    }
                }
            }
        }

        bus.shutdown_sentinel();
    }
}

/// Spawns a supervising task that runs `make(rx)` to completion, and, unless
/// [`Scheduler::shutdown`] has been called, restarts it after an
/// exponentially growing backoff. A worker that panics is isolated to this
/// task alone: `tokio::spawn` already catches the unwind, so the outer loop
/// only has to decide whether to restart.
fn spawn_supervised<N, Fut>(
    name: &'static str,
    shutdown_tx: &broadcast::Sender<()>,
    stopping: &Arc<AtomicBool>,
    make: N,
) -> JoinHandle<()>
where
    N: Fn(broadcast::Receiver<()>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shutdown_tx = shutdown_tx.clone();
    let stopping = stopping.clone();
    tokio::spawn(async move {
        let mut backoff = INITIAL_RESTART_BACKOFF;
        loop {
            let rx = shutdown_tx.subscribe();
            let result = tokio::spawn(make(rx)).await;

            if stopping.load(Ordering::SeqCst) {
                return;
            }
            match result {
                Ok(()) => {
                    warn!(
                        "worker '{}' exited before shutdown was requested; restarting in {:?}",
                        name, backoff
                    );
                }
                Err(e) => {
                    error!("worker '{}' panicked ({}); restarting in {:?}", name, e, backoff);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
        }
    })
}

async fn run_lab_reconcile_loop(lab: Arc<LabManager>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("Lab reconcile task started.");
    let mut interval = tokio::time::interval(lab.lab_config().reconcile_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outcome = lab.reconcile().await;
                lab.publish_metrics();
                if outcome.adopted > 0 || outcome.reaped > 0 || outcome.failed > 0 {
                    info!(
                        "Lab reconcile pass: {} adopted, {} reaped, {} failed.",
                        outcome.adopted, outcome.reaped, outcome.failed
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Lab reconcile task shutting down.");
                return;
            }
        }
    }
}

async fn run_fileserver_reconcile_loop(fileserver: Arc<FileServerManager>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("File-server reconcile task started.");
    let mut interval = tokio::time::interval(fileserver.fileserver_config().reconcile_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outcome = fileserver.reconcile().await;
                fileserver.publish_metrics();
                if outcome.completed > 0 || outcome.orphaned_removed > 0 || outcome.stuck_reaped > 0 {
                    info!(
                        "File-server reconcile pass: {} completed, {} orphaned removed, {} stuck reaped.",
                        outcome.completed, outcome.orphaned_removed, outcome.stuck_reaped
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                info!("File-server reconcile task shutting down.");
                return;
            }
        }
    }
}

/// Watches `Node` objects cluster-wide and triggers an out-of-band catalog
/// refresh (debounced) whenever the node set changes, so newly-ready nodes
/// start receiving prepulled images well before the next scheduled
/// `refresh_interval` tick.
async fn run_node_watch_loop(k8s: KubernetesAdapter, images: Arc<ImageService>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("Node watch task started.");
    let mut stream = Box::pin(watch_cluster::<Node>(k8s.client(), None));
    let mut last_refresh = tokio::time::Instant::now() - NODE_WATCH_REFRESH_DEBOUNCE;

    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(WatchEvent::Applied(node)) | Some(WatchEvent::Deleted(node)) => {
                        let name = node.metadata.name.clone().unwrap_or_default();
                        let now = tokio::time::Instant::now();
                        if now.duration_since(last_refresh) >= NODE_WATCH_REFRESH_DEBOUNCE {
                            info!("Node watch observed a change to '{}', triggering catalog refresh.", name);
                            images.refresh().await;
                            last_refresh = now;
                        }
                    }
                    None => {
                        warn!("node watch stream ended unexpectedly; restarting");
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Node watch task shutting down.");
                return;
            }
        }
    }
}
