use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::{Change, WatchEvent, WatchedResource};

/// Returned by [`EventSink::send`] once the watcher no longer accepts events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

/// The write end an [`EventSource`] emits into.
///
/// Every send races against the stop token, so a source blocked on a slow
/// dispatch loop still observes stop. After stop has been observed nothing
/// more is delivered.
pub struct EventSink<K> {
    namespace: String,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
    _kind: PhantomData<fn(K)>,
}

impl<K: WatchedResource> EventSink<K> {
    pub(crate) fn new(
        namespace: String,
        tx: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            namespace,
            tx,
            cancel,
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Hand one change to the dispatch loop, waiting until it has room.
    ///
    /// # Errors
    ///
    /// Returns [`Stopped`] if the watcher was stopped before the change was
    /// accepted, or if the dispatch loop is gone.
    pub async fn send(&self, change: Change<K>) -> Result<(), Stopped> {
        if self.cancel.is_cancelled() {
            return Err(Stopped);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Stopped),
            sent = self.tx.send(K::into_event(change)) => sent.map_err(|_| Stopped),
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Completes when the watcher is stopped
    pub async fn stopped(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.tx.closed() => {}
        }
    }
}

/// Produces the ordered change stream for one resource kind in one namespace.
///
/// `run` must keep emitting until [`EventSink::send`] reports [`Stopped`] or
/// [`EventSink::stopped`] completes, and then return. Reconnecting after a
/// broken stream is the source's own business.
#[async_trait]
pub trait EventSource<K: WatchedResource>: Send + 'static {
    async fn run(self: Box<Self>, sink: EventSink<K>);
}

/// Creates the pod and policy sources for a namespace
pub trait SourceFactory {
    fn pod_source(&self, namespace: &str) -> Box<dyn EventSource<Pod>>;

    fn policy_source(&self, namespace: &str) -> Box<dyn EventSource<NetworkPolicy>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::event::ChangeKind;

    #[tokio::test]
    async fn send_tags_and_delivers() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink: EventSink<Pod> = EventSink::new("ns1".into(), tx, CancellationToken::new());

        sink.send(Change::Added(Pod::default())).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WatchEvent::Pod(_)));
        assert_eq!(event.change_kind(), ChangeKind::Added);
    }

    #[tokio::test]
    async fn blocked_send_observes_stop() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink: EventSink<Pod> = EventSink::new("ns1".into(), tx, cancel.clone());

        // fill the only slot, nobody drains it
        sink.send(Change::Added(Pod::default())).await.unwrap();

        let blocked = tokio::spawn(async move { sink.send(Change::Added(Pod::default())).await });
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(blocked.await.unwrap(), Err(Stopped));
    }

    #[tokio::test]
    async fn send_after_stop_is_refused() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink: EventSink<NetworkPolicy> = EventSink::new("ns1".into(), tx, cancel.clone());
        cancel.cancel();

        assert!(sink.is_stopped());
        assert_eq!(sink.send(Change::Added(NetworkPolicy::default())).await, Err(Stopped));
        assert!(rx.try_recv().is_err());
    }
}
