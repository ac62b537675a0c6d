//! Sync orchestrator
//!
//! One component owns the whole sync lifecycle: a FIFO queue serializes
//! push and pull (they never overlap), a timer schedules periodic pushes,
//! SSE events are debounced into pulls, connectivity transitions reconnect
//! the event stream, and every state change publishes an immutable
//! [`SyncStatus`] snapshot through a watch channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::invalidate::QueryInvalidator;
use super::pull::PullEngine;
use super::push::PushEngine;
use super::status::{Connection, SyncState, SyncStatus};
use super::transport::{EventSource, SyncTransport};
use crate::db::LocalStore;

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Periodic push cadence
    pub push_interval: Duration,
    /// Quiet window after the last SSE event before a pull is enqueued
    pub sse_debounce: Duration,
    /// Delay before re-opening a dropped SSE connection
    pub sse_reconnect_delay: Duration,
    /// Page size for incremental pulls
    pub pull_page_limit: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_secs(30),
            sse_debounce: Duration::from_millis(100),
            sse_reconnect_delay: Duration::from_secs(5),
            pull_page_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncTask {
    InitialSnapshot,
    Push,
    Pull,
}

/// Process-wide sync conductor
///
/// Lifecycle: construct (`new`), `start`, `stop`, drop (`destroy`). The
/// store, transport, event source and invalidator are injected so the
/// whole core runs against fakes in tests.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: LocalStore,
    push: PushEngine,
    pull: PullEngine,
    events: Option<Arc<dyn EventSource>>,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<SyncTask>>>,
    debounce_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    sse_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        transport: Arc<dyn SyncTransport>,
        events: Option<Arc<dyn EventSource>>,
        invalidator: Arc<dyn QueryInvalidator>,
        config: SyncConfig,
    ) -> Self {
        let push = PushEngine::new(store.clone(), transport.clone(), invalidator.clone());
        let pull = PullEngine::new(store.clone(), transport, invalidator)
            .with_page_limit(config.pull_page_limit);
        let (status, _) = watch::channel(SyncStatus::default());

        Self {
            inner: Arc::new(Inner {
                store,
                push,
                pull,
                events,
                config,
                status,
                queue_tx: Mutex::new(None),
                debounce_tx: Mutex::new(None),
                handles: Mutex::new(Vec::new()),
                sse_handle: Mutex::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Start the worker, timer and debounce tasks, then queue the initial
    /// snapshot and an initial push.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (debounce_tx, debounce_rx) = mpsc::unbounded_channel();
        *self.inner.queue_tx.lock().expect("queue lock") = Some(queue_tx);
        *self.inner.debounce_tx.lock().expect("debounce lock") = Some(debounce_tx);

        // The worker is detached rather than tracked: stop() must let the
        // in-flight task finish (it exits right after, since the queue is
        // closed and the stopped flag drops anything still buffered).
        tokio::spawn(Inner::worker(self.inner.clone(), queue_rx));

        let mut handles = self.inner.handles.lock().expect("handles lock");
        handles.push(tokio::spawn(Inner::timer(self.inner.clone())));
        handles.push(tokio::spawn(Inner::debouncer(self.inner.clone(), debounce_rx)));
        drop(handles);

        self.inner.enqueue(SyncTask::InitialSnapshot);
        self.inner.enqueue(SyncTask::Push);
    }

    /// Stop all activity: the timer, the debounce, the SSE connection and
    /// the task queue. Whatever is in flight completes, queued tasks are
    /// dropped, and no further request, write or notification originates
    /// from this component.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.queue_tx.lock().expect("queue lock").take();
        self.inner.debounce_tx.lock().expect("debounce lock").take();

        if let Some(handle) = self.inner.sse_handle.lock().expect("sse lock").take() {
            handle.abort();
        }
        for handle in self.inner.handles.lock().expect("handles lock").drain(..) {
            handle.abort();
        }

        tracing::debug!("sync orchestrator stopped");
    }

    /// Tear the component down. Equivalent to `stop` + drop.
    pub fn destroy(self) {
        self.stop();
    }

    /// Subscribe to status snapshots. The receiver also exposes the
    /// current snapshot via `borrow()`.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_sender().subscribe()
    }

    /// The current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status_sender().borrow().clone()
    }

    /// Connectivity callback: the network came back.
    pub fn set_online(&self) {
        self.inner.update(|status| {
            status.connection = Connection::Online;
        });
        self.inner.enqueue(SyncTask::Push);
        self.inner.enqueue(SyncTask::Pull);
        Inner::connect_sse(&self.inner);
    }

    /// Connectivity callback: the network went away.
    pub fn set_offline(&self) {
        self.inner.update(|status| {
            status.connection = Connection::Offline;
        });
        if let Some(handle) = self.inner.sse_handle.lock().expect("sse lock").take() {
            handle.abort();
        }
    }

    /// Feed one server change notification into the debounce window.
    pub fn notify_remote_change(&self) {
        let guard = self.inner.debounce_tx.lock().expect("debounce lock");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Ask for a push soon (e.g. right after a local mutation).
    pub fn request_push(&self) {
        self.inner.enqueue(SyncTask::Push);
    }

    /// Ask for a pull soon.
    pub fn request_pull(&self) {
        self.inner.enqueue(SyncTask::Pull);
    }

    /// Recompute the pending-operations counter from the outbox.
    pub async fn refresh_pending(&self) {
        self.inner.refresh_pending().await;
    }

    fn status_sender(&self) -> &watch::Sender<SyncStatus> {
        &self.inner.status
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn enqueue(&self, task: SyncTask) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let guard = self.queue_tx.lock().expect("queue lock");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(task);
        }
    }

    /// Publish a status change; subscribers are only woken when a field
    /// actually changed, and never after `stop`.
    fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    async fn refresh_pending(&self) {
        match self.store.pending_count().await {
            Ok(count) => self.update(|status| {
                status.pending_operations = count;
            }),
            Err(error) => tracing::warn!(%error, "failed to count pending operations"),
        }
    }

    /// Drains the FIFO queue; at most one sync task runs at a time.
    async fn worker(inner: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SyncTask>) {
        inner.refresh_pending().await;
        while let Some(task) = rx.recv().await {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            inner.run_task(task).await;
        }
    }

    async fn run_task(&self, task: SyncTask) {
        match task {
            SyncTask::Push => {
                self.update(|status| {
                    status.state = SyncState::Pushing;
                });
                match self.push.run().await {
                    Ok(outcome) => {
                        let last_push = self.store.last_push_timestamp().await.ok().flatten();
                        self.update(|status| {
                            status.state = SyncState::Idle;
                            status.last_error = None;
                            status.last_push_time = last_push;
                        });
                        if outcome.processed > 0 {
                            tracing::debug!(?outcome, "push finished");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "push failed");
                        self.update(|status| {
                            status.state = SyncState::Error;
                            status.last_error = Some(error.to_string());
                        });
                    }
                }
                self.refresh_pending().await;
            }
            SyncTask::Pull => {
                self.update(|status| {
                    status.state = SyncState::Pulling;
                    status.pull_syncing = true;
                });
                match self.pull.run().await {
                    Ok(outcome) => {
                        self.update(|status| {
                            status.state = SyncState::Idle;
                            status.pull_syncing = false;
                            status.last_error = None;
                        });
                        if outcome.applied + outcome.rebased > 0 {
                            tracing::debug!(?outcome, "pull finished");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "pull failed");
                        self.update(|status| {
                            status.state = SyncState::Error;
                            status.pull_syncing = false;
                            status.last_error = Some(error.to_string());
                        });
                    }
                }
            }
            SyncTask::InitialSnapshot => {
                self.update(|status| {
                    status.state = SyncState::Pulling;
                    status.pull_syncing = true;
                });
                match self.pull.initial_snapshot().await {
                    Ok(_) => self.update(|status| {
                        status.state = SyncState::Idle;
                        status.pull_syncing = false;
                        status.last_error = None;
                    }),
                    Err(error) => {
                        tracing::warn!(%error, "initial snapshot failed");
                        self.update(|status| {
                            status.state = SyncState::Error;
                            status.pull_syncing = false;
                            status.last_error = Some(error.to_string());
                        });
                    }
                }
            }
        }
    }

    /// Periodic push while online.
    async fn timer(inner: Arc<Self>) {
        let mut interval = tokio::time::interval(inner.config.push_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; start() already queued a push.
        interval.tick().await;

        loop {
            interval.tick().await;
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            let status = inner.status.borrow().clone();
            if status.connection == Connection::Online && status.state != SyncState::Pushing {
                inner.enqueue(SyncTask::Push);
            }
        }
    }

    /// Collapse bursts of SSE events into a single pull.
    async fn debouncer(inner: Arc<Self>, mut rx: mpsc::UnboundedReceiver<()>) {
        while rx.recv().await.is_some() {
            loop {
                match tokio::time::timeout(inner.config.sse_debounce, rx.recv()).await {
                    // Another event inside the window resets it.
                    Ok(Some(())) => {}
                    // Channel closed: we're shutting down.
                    Ok(None) => return,
                    // Quiet long enough.
                    Err(_) => break,
                }
            }
            if inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            inner.enqueue(SyncTask::Pull);
        }
    }

    /// (Re)open the SSE subscription; each `sync` event feeds the debounce.
    fn connect_sse(inner: &Arc<Self>) {
        let Some(events) = inner.events.clone() else {
            return;
        };
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut slot = inner.sse_handle.lock().expect("sse lock");
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let inner = inner.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                match events.connect().await {
                    Ok(mut stream) => {
                        tracing::debug!("SSE connected");
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(event) if event.event == "sync" => {
                                    let guard =
                                        inner.debounce_tx.lock().expect("debounce lock");
                                    if let Some(tx) = guard.as_ref() {
                                        let _ = tx.send(());
                                    }
                                }
                                Ok(_) => {}
                                Err(error) => {
                                    tracing::warn!(%error, "SSE stream error");
                                    break;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "SSE connect failed");
                    }
                }

                if inner.stopped.load(Ordering::SeqCst)
                    || inner.status.borrow().connection != Connection::Online
                {
                    break;
                }
                tokio::time::sleep(inner.config.sse_reconnect_delay).await;
            }
        }));
    }
}
