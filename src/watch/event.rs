use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::error::ErrorResponse;
use kube::ResourceExt;

/// The two kinds of resources a namespace watcher follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pod,
    NetworkPolicy,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod => f.write_str("Pod"),
            Self::NetworkPolicy => f.write_str("NetworkPolicy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Error,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => f.write_str("added"),
            Self::Modified => f.write_str("modified"),
            Self::Deleted => f.write_str("deleted"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// One observed change to a resource of type `K`.
///
/// Stream failures travel as [`Change::Error`] so a handler sees them in
/// order with the rest of the stream.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Error(ErrorResponse),
}

impl<K> Change<K> {
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Added(_) => ChangeKind::Added,
            Self::Modified(_) => ChangeKind::Modified,
            Self::Deleted(_) => ChangeKind::Deleted,
            Self::Error(_) => ChangeKind::Error,
        }
    }

    /// The resource payload, absent for error changes
    #[must_use]
    pub const fn object(&self) -> Option<&K> {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => Some(o),
            Self::Error(_) => None,
        }
    }
}

impl<K: ResourceExt> Change<K> {
    /// `namespace/name` of the payload, or the error message
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => {
                format!("{}/{}", o.namespace().unwrap_or_default(), o.name_any())
            }
            Self::Error(e) => format!("{} ({})", e.message, e.reason),
        }
    }
}

/// A change tagged with its resource kind. This is what travels on the
/// watcher's single event channel.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Pod(Change<Pod>),
    Policy(Change<NetworkPolicy>),
}

impl WatchEvent {
    #[must_use]
    pub const fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::Pod(_) => ResourceKind::Pod,
            Self::Policy(_) => ResourceKind::NetworkPolicy,
        }
    }

    #[must_use]
    pub const fn change_kind(&self) -> ChangeKind {
        match self {
            Self::Pod(c) => c.kind(),
            Self::Policy(c) => c.kind(),
        }
    }
}

/// A Kubernetes resource type a namespace watcher can follow.
///
/// Tying the tag to the type means a source can only ever emit events of its
/// own kind.
pub trait WatchedResource:
    kube::Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: ResourceKind;

    fn into_event(change: Change<Self>) -> WatchEvent;
}

impl WatchedResource for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn into_event(change: Change<Self>) -> WatchEvent {
        WatchEvent::Pod(change)
    }
}

impl WatchedResource for NetworkPolicy {
    const KIND: ResourceKind = ResourceKind::NetworkPolicy;

    fn into_event(change: Change<Self>) -> WatchEvent {
        WatchEvent::Policy(change)
    }
}
