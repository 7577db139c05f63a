/**
 * Layered configuration for the watcher process.
 *
 * Values come from three layers with a fixed precedence: command-line flags,
 * then `NETPOL_*` environment variables, then defaults. Every layer is a plain
 * [`ConfigLayer`], and resolution is a pure function of the layers plus an
 * [`Environment`] snapshot, so nothing here reads process-global state.
 */
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::Serialize;
use thiserror::Error;

/// Prefix for environment variables, e.g. `NETPOL_NODE_NAME`
pub const ENV_PREFIX: &str = "NETPOL_";

/// Kubeconfig location relative to the home directory
pub const DEFAULT_KUBECONFIG_LOCATION: &str = ".kube/config";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("couldn't load node name, ensure the Kubernetes node name is given as a parameter")]
    MissingNodeName,

    #[error("auth type should be PSK or PKI, got {0:?}")]
    InvalidAuthType(String),

    #[error("PSK should be provided when auth type is PSK")]
    MissingPsk,

    #[error("target network is invalid: {network}: {reason}")]
    InvalidTargetNetwork { network: String, reason: String },

    #[error("{key} expects a boolean, got {value:?}")]
    InvalidBool { key: String, value: String },
}

/// How this instance authenticates its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthMode {
    #[serde(rename = "PSK")]
    Psk,
    #[serde(rename = "PKI")]
    Pki,
}

impl FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PSK" => Ok(Self::Psk),
            "PKI" => Ok(Self::Pki),
            other => Err(ConfigError::InvalidAuthType(other.to_string())),
        }
    }
}

/// One source of configuration values. `None` means "not set in this layer".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    pub auth_type: Option<String>,
    pub node_name: Option<String>,
    pub pki_directory: Option<PathBuf>,
    pub psk: Option<String>,
    pub remote_enforcer: Option<bool>,
    pub target_networks: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub log_level: Option<String>,
    pub enforce: Option<bool>,
}

impl ConfigLayer {
    /// The built-in defaults layer
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            auth_type: Some("PSK".to_string()),
            node_name: None,
            pki_directory: None,
            psk: Some("PSK".to_string()),
            remote_enforcer: Some(true),
            target_networks: Some(String::new()),
            kubeconfig: None,
            log_level: Some("info".to_string()),
            enforce: Some(false),
        }
    }

    /// Build a layer from environment variables carrying [`ENV_PREFIX`].
    ///
    /// Takes the variables as an iterator so callers decide whether to read
    /// `std::env::vars()` or a fixed set. Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBool`] for a boolean variable that is not
    /// `true`/`false`/`1`/`0`.
    pub fn from_env<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut layer = Self::default();
        for (key, value) in vars {
            let Some(field) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();
            if value.is_empty() {
                continue;
            }
            match field {
                "AUTH_TYPE" => layer.auth_type = Some(value),
                "NODE_NAME" => layer.node_name = Some(value),
                "PKI_DIRECTORY" => layer.pki_directory = Some(PathBuf::from(value)),
                "PSK" => layer.psk = Some(value),
                "REMOTE_ENFORCER" => {
                    layer.remote_enforcer = Some(parse_bool(key.as_ref(), &value)?);
                }
                "TARGET_NETWORKS" => layer.target_networks = Some(value),
                "KUBECONFIG" => layer.kubeconfig = Some(PathBuf::from(value)),
                "LOG_LEVEL" => layer.log_level = Some(value),
                "ENFORCE" => layer.enforce = Some(parse_bool(key.as_ref(), &value)?),
                _ => {}
            }
        }
        Ok(layer)
    }

    /// Merge layers; for each field the first layer that sets it wins.
    #[must_use]
    pub fn merge(flags: Self, env: Self, defaults: Self) -> Self {
        Self {
            auth_type: flags.auth_type.or(env.auth_type).or(defaults.auth_type),
            node_name: flags.node_name.or(env.node_name).or(defaults.node_name),
            pki_directory: flags
                .pki_directory
                .or(env.pki_directory)
                .or(defaults.pki_directory),
            psk: flags.psk.or(env.psk).or(defaults.psk),
            remote_enforcer: flags
                .remote_enforcer
                .or(env.remote_enforcer)
                .or(defaults.remote_enforcer),
            target_networks: flags
                .target_networks
                .or(env.target_networks)
                .or(defaults.target_networks),
            kubeconfig: flags.kubeconfig.or(env.kubeconfig).or(defaults.kubeconfig),
            log_level: flags.log_level.or(env.log_level).or(defaults.log_level),
            enforce: flags.enforce.or(env.enforce).or(defaults.enforce),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Facts about the process surroundings that influence validation
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Running inside a cluster (`KUBERNETES_PORT` is set)
    pub in_cluster: bool,
    /// Home directory used to locate a default kubeconfig
    pub home: Option<PathBuf>,
}

impl Environment {
    /// Snapshot the current process environment
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            in_cluster: std::env::var_os("KUBERNETES_PORT").is_some_and(|v| !v.is_empty()),
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }
}

/// Fully merged and validated configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Configuration {
    pub auth_type: AuthMode,
    pub node_name: String,
    pub pki_directory: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub psk: String,
    pub remote_enforcer: bool,
    /// Validated CIDRs, in the order they were given
    pub target_networks: Vec<String>,
    /// `None` means use the in-cluster service account
    pub kubeconfig: Option<PathBuf>,
    pub log_level: String,
    pub enforce: bool,
}

impl Configuration {
    /// Configuration for a process started in enforcer mode. Nothing else is
    /// loaded or validated in that mode.
    #[must_use]
    pub fn enforcer() -> Self {
        Self {
            auth_type: AuthMode::Psk,
            node_name: String::new(),
            pki_directory: None,
            psk: String::new(),
            remote_enforcer: false,
            target_networks: Vec::new(),
            kubeconfig: None,
            log_level: "info".to_string(),
            enforce: true,
        }
    }

    /// Merge the three layers and validate the result.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the node name is missing outside
    /// enforce mode, the auth type is unknown, PSK mode has no key, or a
    /// target network is not a valid CIDR.
    pub fn resolve(
        flags: ConfigLayer,
        env: ConfigLayer,
        defaults: ConfigLayer,
        environment: &Environment,
    ) -> Result<Self, ConfigError> {
        let merged = ConfigLayer::merge(flags, env, defaults);
        let enforce = merged.enforce.unwrap_or(false);

        let kubeconfig = if environment.in_cluster {
            None
        } else {
            merged.kubeconfig.or_else(|| {
                environment
                    .home
                    .as_deref()
                    .map(|home| home.join(DEFAULT_KUBECONFIG_LOCATION))
            })
        };

        let node_name = merged.node_name.unwrap_or_default();
        if !enforce && node_name.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }

        let auth_type: AuthMode = merged.auth_type.unwrap_or_default().parse()?;

        let psk = merged.psk.unwrap_or_default();
        if auth_type == AuthMode::Psk && psk.is_empty() {
            return Err(ConfigError::MissingPsk);
        }

        let target_networks = parse_target_networks(&merged.target_networks.unwrap_or_default())?;

        Ok(Self {
            auth_type,
            node_name,
            pki_directory: merged.pki_directory,
            psk,
            remote_enforcer: merged.remote_enforcer.unwrap_or(true),
            target_networks,
            kubeconfig,
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
            enforce,
        })
    }

    /// Kubeconfig path if one is in use
    #[must_use]
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }
}

/// Split a whitespace separated list of networks and validate each as a CIDR.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTargetNetwork`] for the first entry that is
/// not in prefix notation or does not parse.
pub fn parse_target_networks(nets: &str) -> Result<Vec<String>, ConfigError> {
    nets.split_whitespace()
        .map(|network| {
            if !network.contains('/') {
                return Err(ConfigError::InvalidTargetNetwork {
                    network: network.to_string(),
                    reason: "missing prefix length".to_string(),
                });
            }
            IpNetwork::from_str(network)
                .map(|_| network.to_string())
                .map_err(|e| ConfigError::InvalidTargetNetwork {
                    network: network.to_string(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_node(name: &str) -> ConfigLayer {
        ConfigLayer {
            node_name: Some(name.to_string()),
            ..ConfigLayer::default()
        }
    }

    #[test]
    fn parses_networks_in_order() {
        let nets = parse_target_networks(" 10.0.0.0/8  192.168.1.0/24\tfd00::/8 ").unwrap();
        assert_eq!(nets, vec!["10.0.0.0/8", "192.168.1.0/24", "fd00::/8"]);
        assert!(parse_target_networks("").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_networks() {
        assert!(matches!(
            parse_target_networks("10.0.0.0/8 10.0.0.0/33"),
            Err(ConfigError::InvalidTargetNetwork { network, .. }) if network == "10.0.0.0/33"
        ));
        assert!(matches!(
            parse_target_networks("10.1.2.3"),
            Err(ConfigError::InvalidTargetNetwork { .. })
        ));
        assert!(parse_target_networks("not-a-network/8").is_err());
    }

    #[test]
    fn auth_mode_is_case_sensitive() {
        assert_eq!("PSK".parse::<AuthMode>(), Ok(AuthMode::Psk));
        assert_eq!("PKI".parse::<AuthMode>(), Ok(AuthMode::Pki));
        assert!("psk".parse::<AuthMode>().is_err());
    }

    #[test]
    fn env_layer_reads_prefixed_vars_only() {
        let layer = ConfigLayer::from_env([
            ("NETPOL_NODE_NAME", "node-a"),
            ("NETPOL_REMOTE_ENFORCER", "false"),
            ("NETPOL_PSK", ""),
            ("NODE_NAME", "ignored"),
        ])
        .unwrap();
        assert_eq!(layer.node_name.as_deref(), Some("node-a"));
        assert_eq!(layer.remote_enforcer, Some(false));
        assert_eq!(layer.psk, None);
    }

    #[test]
    fn env_layer_rejects_bad_bool() {
        let err = ConfigLayer::from_env([("NETPOL_ENFORCE", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }

    #[test]
    fn flags_beat_env_beat_defaults() {
        let flags = ConfigLayer {
            log_level: Some("debug".to_string()),
            ..with_node("from-flags")
        };
        let env = ConfigLayer {
            log_level: Some("warn".to_string()),
            psk: Some("secret".to_string()),
            ..with_node("from-env")
        };
        let merged = ConfigLayer::merge(flags, env, ConfigLayer::defaults());
        assert_eq!(merged.node_name.as_deref(), Some("from-flags"));
        assert_eq!(merged.log_level.as_deref(), Some("debug"));
        assert_eq!(merged.psk.as_deref(), Some("secret"));
        assert_eq!(merged.auth_type.as_deref(), Some("PSK"));
    }

    #[test]
    fn kubeconfig_defaults_to_home_outside_cluster() {
        let environment = Environment {
            in_cluster: false,
            home: Some(PathBuf::from("/home/op")),
        };
        let config = Configuration::resolve(
            with_node("n1"),
            ConfigLayer::default(),
            ConfigLayer::defaults(),
            &environment,
        )
        .unwrap();
        assert_eq!(
            config.kubeconfig(),
            Some(Path::new("/home/op/.kube/config"))
        );
    }

    #[test]
    fn kubeconfig_cleared_in_cluster() {
        let flags = ConfigLayer {
            kubeconfig: Some(PathBuf::from("/tmp/kc")),
            ..with_node("n1")
        };
        let environment = Environment {
            in_cluster: true,
            home: Some(PathBuf::from("/root")),
        };
        let config = Configuration::resolve(
            flags,
            ConfigLayer::default(),
            ConfigLayer::defaults(),
            &environment,
        )
        .unwrap();
        assert_eq!(config.kubeconfig, None);
    }

    #[test]
    fn psk_is_not_serialized() {
        let config = Configuration::resolve(
            with_node("n1"),
            ConfigLayer::default(),
            ConfigLayer::defaults(),
            &Environment::default(),
        )
        .unwrap();
        let json = k8s_openapi::serde_json::to_string(&config).unwrap();
        assert!(!json.contains("\"psk\""));
        assert!(json.contains("\"auth_type\":\"PSK\""));
    }
}
