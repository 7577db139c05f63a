// Client creation with custom user-agent support for kube 2.x
use crate::error::Result as NwResult;
use hyper::http::{HeaderName, HeaderValue};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, warn};

/// Resolve the user agent, letting `NETPOL_USER_AGENT` override the default
#[must_use]
pub fn user_agent(default: &str) -> String {
    std::env::var("NETPOL_USER_AGENT")
        .ok()
        .filter(|ua| !ua.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Add a user-agent header to `config`. Invalid values are logged and skipped.
pub fn add_user_agent_header(config: &mut Config, custom_user_agent: Option<&str>) {
    if let Some(user_agent) = custom_user_agent {
        match HeaderValue::from_str(user_agent) {
            Ok(header_value) => config
                .headers
                .push((HeaderName::from_static("user-agent"), header_value)),
            Err(e) => warn!("Ignoring invalid user agent {:?}: {}", user_agent, e),
        }
    }
}

/// Load the client configuration.
///
/// An existing kubeconfig at `kubeconfig` is used as is. Otherwise the
/// configuration is inferred, which covers the in-cluster service account.
///
/// # Errors
///
/// Will return `Err` if the kubeconfig cannot be read or no configuration
/// can be inferred
pub async fn load_config(kubeconfig: Option<&Path>) -> NwResult<Config> {
    match kubeconfig {
        Some(path) if path.exists() => {
            debug!("📄 Loading Kubernetes configuration from {}", path.display());
            let kc = Kubeconfig::read_from(path)?;
            Ok(Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?)
        }
        Some(path) => {
            debug!(
                "No kubeconfig at {}, inferring configuration",
                path.display()
            );
            Ok(Config::infer().await?)
        }
        None => Ok(Config::infer().await?),
    }
}

/// Create a new k8s client to interact with k8s cluster api
///
/// # Errors
///
/// Will return `Err` if the configuration cannot be loaded or the client
/// cannot be built from it
pub async fn new(kubeconfig: Option<&Path>, custom_user_agent: Option<&str>) -> NwResult<Client> {
    let mut config = load_config(kubeconfig).await?;
    add_user_agent_header(&mut config, custom_user_agent);
    let client = Client::try_from(config)?;
    Ok(client)
}
