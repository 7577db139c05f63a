use async_trait::async_trait;

use super::event::{Change, ChangeKind, ResourceKind};

/// Outcome of handling one change
pub type HandlerResult = anyhow::Result<()>;

/// Callback for changes of resource type `K`.
///
/// The dispatch loop awaits each call before taking the next event, so a
/// slow handler throttles every source of the watcher. Plain closures
/// `FnMut(Change<K>) -> HandlerResult` implement this trait.
#[async_trait]
pub trait EventHandler<K: Send + 'static>: Send {
    async fn handle(&mut self, change: Change<K>) -> HandlerResult;
}

#[async_trait]
impl<K, F> EventHandler<K> for F
where
    K: Send + 'static,
    F: FnMut(Change<K>) -> HandlerResult + Send,
{
    async fn handle(&mut self, change: Change<K>) -> HandlerResult {
        self(change)
    }
}

/// A handler error, as reported on the watcher's failure channel
#[derive(Debug)]
pub struct HandlerFailure {
    pub namespace: String,
    pub resource: ResourceKind,
    pub change: ChangeKind,
    /// `namespace/name` of the object, or the stream error text
    pub object: String,
    pub error: anyhow::Error,
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} handler failed on {} {} in namespace {}: {:#}",
            self.resource, self.change, self.object, self.namespace, self.error
        )
    }
}
