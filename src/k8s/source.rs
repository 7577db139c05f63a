/**
 * Kubernetes watch sources
 *
 * Streams pod and network-policy changes for one namespace from the API
 * server. A broken stream is reported to the handler as an error change and
 * the watch is restarted from the last seen resource version.
 */
use super::config::{
    GONE_STATUS_CODE, INITIAL_BACKOFF_SECONDS, INITIAL_RESOURCE_VERSION, MAX_BACKOFF_SECONDS,
    MAX_WATCH_RESTARTS, RESTART_DELAY_SECONDS, WATCH_TIMEOUT_SECONDS,
};
use crate::watch::{Change, EventSink, EventSource, SourceFactory, WatchedResource};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::error::ErrorResponse;
use kube::{Client, ResourceExt};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Field selector restricting pods to those scheduled on `node`
#[must_use]
pub fn node_field_selector(node: &str) -> String {
    format!("spec.nodeName={node}")
}

/// Turn a client error into the error payload handlers receive
#[must_use]
pub fn error_response(e: kube::Error) -> ErrorResponse {
    match e {
        kube::Error::Api(resp) => resp,
        other => ErrorResponse {
            status: "Failure".to_string(),
            message: other.to_string(),
            reason: "WatchFailed".to_string(),
            code: 0,
        },
    }
}

/// Next backoff after a failure, doubling up to [`MAX_BACKOFF_SECONDS`]
#[must_use]
pub const fn next_backoff(current: u64) -> u64 {
    let doubled = current.saturating_mul(2);
    if doubled > MAX_BACKOFF_SECONDS {
        MAX_BACKOFF_SECONDS
    } else {
        doubled
    }
}

/// Watches one resource type through the API server
pub struct KubeSource<K> {
    api: Api<K>,
    params: WatchParams,
}

impl<K: WatchedResource> KubeSource<K> {
    #[must_use]
    pub const fn new(api: Api<K>, params: WatchParams) -> Self {
        Self { api, params }
    }

    /// Run one watch request to completion, forwarding every change.
    ///
    /// Returns `Ok` when the server closes the stream or the sink is stopped.
    async fn watch_once(
        &self,
        sink: &EventSink<K>,
        resource_version: &mut String,
    ) -> Result<(), ErrorResponse> {
        use futures::{TryStreamExt, pin_mut};

        let version = resource_version.clone();
        let stream = self
            .api
            .watch(&self.params, &version)
            .await
            .map_err(error_response)?;
        pin_mut!(stream);

        while let Some(event) = stream.try_next().await.map_err(error_response)? {
            let change = match event {
                WatchEvent::Added(obj) => {
                    track_version(resource_version, &obj);
                    debug!("➕ {} added: {}/{}", K::KIND, sink.namespace(), obj.name_any());
                    Change::Added(obj)
                }
                WatchEvent::Modified(obj) => {
                    track_version(resource_version, &obj);
                    debug!("📝 {} modified: {}/{}", K::KIND, sink.namespace(), obj.name_any());
                    Change::Modified(obj)
                }
                WatchEvent::Deleted(obj) => {
                    track_version(resource_version, &obj);
                    debug!("🗑️  {} deleted: {}/{}", K::KIND, sink.namespace(), obj.name_any());
                    Change::Deleted(obj)
                }
                WatchEvent::Bookmark(bookmark) => {
                    *resource_version = bookmark.metadata.resource_version;
                    continue;
                }
                WatchEvent::Error(e) => return Err(e),
            };
            if sink.send(change).await.is_err() {
                return Ok(());
            }
        }

        Ok(())
    }
}

fn track_version<K: ResourceExt>(resource_version: &mut String, obj: &K) {
    if let Some(version) = obj.resource_version() {
        *resource_version = version;
    }
}

/// Sleep for `secs`, returning `false` if the sink was stopped first
async fn pause<K: WatchedResource>(sink: &EventSink<K>, secs: u64) -> bool {
    tokio::select! {
        () = sink.stopped() => false,
        () = sleep(Duration::from_secs(secs)) => true,
    }
}

#[async_trait]
impl<K: WatchedResource> EventSource<K> for KubeSource<K> {
    async fn run(self: Box<Self>, sink: EventSink<K>) {
        info!("🔍 Starting {} watcher for {}", K::KIND, sink.namespace());

        let mut backoff_seconds = INITIAL_BACKOFF_SECONDS;
        let mut restart_count = 0;
        let mut resource_version = INITIAL_RESOURCE_VERSION.to_string();

        loop {
            if sink.is_stopped() {
                break;
            }
            if restart_count >= MAX_WATCH_RESTARTS {
                error!(
                    "❌ {} watcher for {} exceeded maximum restart attempts ({}), stopping",
                    K::KIND,
                    sink.namespace(),
                    MAX_WATCH_RESTARTS
                );
                break;
            }

            let outcome = tokio::select! {
                () = sink.stopped() => break,
                outcome = self.watch_once(&sink, &mut resource_version) => outcome,
            };

            match outcome {
                Ok(()) => {
                    debug!("🔍 {} watch stream ended, restarting", K::KIND);
                    backoff_seconds = INITIAL_BACKOFF_SECONDS;
                    restart_count = 0;
                }
                Err(e) => {
                    restart_count += 1;
                    error!(
                        "❌ {} watcher failed (attempt {}/{}): {}, restarting in {}s",
                        K::KIND,
                        restart_count,
                        MAX_WATCH_RESTARTS,
                        e,
                        backoff_seconds
                    );
                    if e.code == GONE_STATUS_CODE {
                        warn!("{} resource version expired, relisting", K::KIND);
                        resource_version = INITIAL_RESOURCE_VERSION.to_string();
                    }
                    if sink.send(Change::Error(e)).await.is_err() {
                        break;
                    }
                    if !pause(&sink, backoff_seconds).await {
                        break;
                    }
                    backoff_seconds = next_backoff(backoff_seconds);
                }
            }

            if !pause(&sink, RESTART_DELAY_SECONDS).await {
                break;
            }
        }

        info!("{} watcher for {} stopped", K::KIND, sink.namespace());
    }
}

/// Builds API-server backed sources. Pods are limited to `node_name` when set.
#[derive(Clone)]
pub struct KubeSourceFactory {
    client: Client,
    node_name: Option<String>,
}

impl KubeSourceFactory {
    #[must_use]
    pub fn new(client: Client, node_name: Option<String>) -> Self {
        Self {
            client,
            node_name: node_name.filter(|n| !n.is_empty()),
        }
    }

    fn watch_params() -> WatchParams {
        WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS)
    }
}

impl SourceFactory for KubeSourceFactory {
    fn pod_source(&self, namespace: &str) -> Box<dyn EventSource<Pod>> {
        let mut params = Self::watch_params();
        if let Some(node) = &self.node_name {
            params = params.fields(&node_field_selector(node));
        }
        Box::new(KubeSource::new(
            Api::namespaced(self.client.clone(), namespace),
            params,
        ))
    }

    fn policy_source(&self, namespace: &str) -> Box<dyn EventSource<NetworkPolicy>> {
        Box::new(KubeSource::new(
            Api::namespaced(self.client.clone(), namespace),
            Self::watch_params(),
        ))
    }
}
