pub mod event;
pub mod handler;
pub mod namespace;
pub mod source;

pub use event::{Change, ChangeKind, ResourceKind, WatchEvent, WatchedResource};
pub use handler::{EventHandler, HandlerFailure, HandlerResult};
pub use namespace::{ignore, DispatchStats, NamespaceWatcher, StopHandle, WatcherState};
pub use source::{EventSink, EventSource, SourceFactory, Stopped};
