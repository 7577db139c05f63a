/**
 * Namespace Watcher
 *
 * Follows pods and network policies in a single namespace and hands every
 * change, in source order, to the caller's handlers from one dispatch loop.
 */
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::event::{Change, ChangeKind, WatchEvent, WatchedResource};
use super::handler::{EventHandler, HandlerFailure, HandlerResult};
use super::source::{EventSink, EventSource, SourceFactory};

/// Slots in the shared event channel. One event can wait while the handler
/// for the previous one runs.
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Sources running, dispatch loop not started
    Created,
    Running,
    /// Dispatch loop returned. Terminal.
    Stopped,
}

/// Counters returned by [`NamespaceWatcher::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub pod_events: u64,
    pub policy_events: u64,
    pub failures: u64,
}

/// Requests stop of a [`NamespaceWatcher`] from anywhere, including while
/// `run` owns the watcher.
#[derive(Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    state: watch::Receiver<WatcherState>,
}

impl StopHandle {
    /// Stop the watcher and its sources.
    ///
    /// Returns `true` for the call that initiated the stop and `false` if the
    /// watcher was already stopping; repeated calls never block.
    pub fn stop(&self) -> bool {
        let initiated = !self.stopping.swap(true, Ordering::AcqRel);
        self.cancel.cancel();
        initiated
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Wait until the dispatch loop has returned, or until the watcher is
    /// dropped without `run` having finished.
    ///
    /// Returns the last state the watcher reached: [`WatcherState::Stopped`]
    /// after `run`, otherwise the state it was dropped in.
    pub async fn wait_stopped(&mut self) -> WatcherState {
        let waited = self
            .state
            .wait_for(|state| *state == WatcherState::Stopped)
            .await
            .map(|state| *state);
        match waited {
            Ok(state) => state,
            Err(_) => *self.state.borrow(),
        }
    }
}

pub struct NamespaceWatcher {
    namespace: String,
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    events_rx: mpsc::Receiver<WatchEvent>,
    failures_tx: mpsc::UnboundedSender<HandlerFailure>,
    failures_rx: Option<mpsc::UnboundedReceiver<HandlerFailure>>,
    state_tx: watch::Sender<WatcherState>,
    task_handles: Vec<JoinHandle<()>>,
}

impl NamespaceWatcher {
    /// Create a watcher for `namespace` and start its pod and policy sources.
    ///
    /// Returns immediately. Sources that fail to connect report it later as
    /// error changes.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(namespace: impl Into<String>, factory: &dyn SourceFactory) -> Self {
        let namespace = namespace.into();
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(WatcherState::Created);

        let pod_handle = Self::start_source(
            factory.pod_source(&namespace),
            EventSink::<Pod>::new(namespace.clone(), events_tx.clone(), cancel.child_token()),
        );
        let policy_handle = Self::start_source(
            factory.policy_source(&namespace),
            EventSink::<NetworkPolicy>::new(namespace.clone(), events_tx, cancel.child_token()),
        );

        info!("🔍 Namespace watcher created for {}", namespace);

        Self {
            namespace,
            cancel,
            stopping: Arc::new(AtomicBool::new(false)),
            events_rx,
            failures_tx,
            failures_rx: Some(failures_rx),
            state_tx,
            task_handles: vec![pod_handle, policy_handle],
        }
    }

    fn start_source<K: WatchedResource>(
        source: Box<dyn EventSource<K>>,
        sink: EventSink<K>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let namespace = sink.namespace().to_string();
            debug!("{} source started for {}", K::KIND, namespace);
            source.run(sink).await;
            debug!("{} source exited for {}", K::KIND, namespace);
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn state(&self) -> WatcherState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
            stopping: Arc::clone(&self.stopping),
            state: self.state_tx.subscribe(),
        }
    }

    /// Stop the watcher. See [`StopHandle::stop`].
    pub fn stop(&self) -> bool {
        self.stop_handle().stop()
    }

    /// Take the receiver of handler failures. Available once.
    ///
    /// Failures are queued without bound for as long as the receiver is
    /// held, so a taker must drain it.
    pub fn take_failures(&mut self) -> Option<mpsc::UnboundedReceiver<HandlerFailure>> {
        self.failures_rx.take()
    }

    /// Run the dispatch loop until stopped or until both sources have exited.
    ///
    /// Handlers are awaited one at a time. Once stop is requested no further
    /// handler is invoked, even if events are still queued. On return both
    /// sources have exited.
    #[instrument(name = "namespace_watcher", skip_all, fields(namespace = %self.namespace))]
    pub async fn run<P, N>(mut self, mut pod_handler: P, mut policy_handler: N) -> DispatchStats
    where
        P: EventHandler<Pod>,
        N: EventHandler<NetworkPolicy>,
    {
        // failures are only queued for a receiver taken before run
        drop(self.failures_rx.take());
        self.state_tx.send_replace(WatcherState::Running);
        info!("📡 Watching namespace {}", self.namespace);

        let mut stats = DispatchStats::default();
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("🛑 Received stop signal for namespace {}", self.namespace);
                    break;
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        warn!("All sources for namespace {} exited", self.namespace);
                        break;
                    };
                    self.dispatch(event, &mut pod_handler, &mut policy_handler, &mut stats)
                        .await;
                }
            }
        }

        self.shutdown().await;
        info!(
            "Namespace {} stopped after {} pod and {} policy events ({} failures)",
            self.namespace, stats.pod_events, stats.policy_events, stats.failures
        );
        stats
    }

    async fn dispatch<P, N>(
        &self,
        event: WatchEvent,
        pod_handler: &mut P,
        policy_handler: &mut N,
        stats: &mut DispatchStats,
    ) where
        P: EventHandler<Pod>,
        N: EventHandler<NetworkPolicy>,
    {
        match event {
            WatchEvent::Pod(change) => {
                stats.pod_events += 1;
                let (kind, object) = (change.kind(), change.describe());
                debug!("Processing pod event {} {}", kind, object);
                if let Err(e) = pod_handler.handle(change).await {
                    stats.failures += 1;
                    self.report_failure::<Pod>(kind, object, e);
                }
            }
            WatchEvent::Policy(change) => {
                stats.policy_events += 1;
                let (kind, object) = (change.kind(), change.describe());
                debug!("Processing policy event {} {}", kind, object);
                if let Err(e) = policy_handler.handle(change).await {
                    stats.failures += 1;
                    self.report_failure::<NetworkPolicy>(kind, object, e);
                }
            }
        }
    }

    fn report_failure<K: WatchedResource>(
        &self,
        change: ChangeKind,
        object: String,
        error: anyhow::Error,
    ) {
        let failure = HandlerFailure {
            namespace: self.namespace.clone(),
            resource: K::KIND,
            change,
            object,
            error,
        };
        warn!("{}", failure);
        // nobody listening is fine
        let _ = self.failures_tx.send(failure);
    }

    fn cancel_sources(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    async fn shutdown(&mut self) {
        self.cancel_sources();
        for handle in self.task_handles.drain(..) {
            if let Err(e) = handle.await {
                error!("❌ Source task for namespace {} failed: {}", self.namespace, e);
            }
        }
        self.state_tx.send_replace(WatcherState::Stopped);
    }
}

impl Drop for NamespaceWatcher {
    fn drop(&mut self) {
        // A watcher dropped without running must not leak its sources.
        self.cancel_sources();
    }
}

/// Build a [`Change`] handler that ignores everything. Useful when only one
/// resource kind matters to the caller.
#[must_use]
pub fn ignore<K>() -> impl FnMut(Change<K>) -> HandlerResult + Send {
    |_| Ok(())
}
