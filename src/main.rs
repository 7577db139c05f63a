use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::serde_json;
use netpol_watch::config::{ConfigLayer, Configuration, Environment};
use netpol_watch::k8s::source::KubeSourceFactory;
use netpol_watch::k8s::{USER_AGENT, client};
use netpol_watch::watch::{Change, ChangeKind, HandlerResult, NamespaceWatcher};
use netpol_watch::{Result, logging};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Name of the namespace to watch
    #[arg(short, long, env = "NETPOL_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(flatten)]
    flags: Flags,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as a policy enforcer spawned into a pod network namespace
    Enforce,
}

/// Settings given on the command line. Unset flags fall through to
/// `NETPOL_*` environment variables and then to defaults.
#[derive(clap::Args, Debug, Default)]
struct Flags {
    /// Authentication type: PSK or PKI
    #[arg(long)]
    auth_type: Option<String>,

    /// Node name in Kubernetes
    #[arg(long)]
    node_name: Option<String>,

    /// Directory holding the PKI material
    #[arg(long)]
    pki_directory: Option<PathBuf>,

    /// Pre-shared key
    #[arg(long)]
    psk: Option<String>,

    /// Spawn the enforcer into each pod network namespace
    #[arg(long)]
    remote_enforcer: Option<bool>,

    /// Whitespace separated CIDRs the policies apply to
    #[arg(long)]
    target_networks: Option<String>,

    /// Kubeconfig used to connect to Kubernetes
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Start in enforcer mode; same as the `enforce` subcommand
    #[arg(long)]
    enforce: bool,
}

impl From<Flags> for ConfigLayer {
    fn from(flags: Flags) -> Self {
        Self {
            auth_type: flags.auth_type,
            node_name: flags.node_name,
            pki_directory: flags.pki_directory,
            psk: flags.psk,
            remote_enforcer: flags.remote_enforcer,
            target_networks: flags.target_networks,
            kubeconfig: flags.kubeconfig,
            log_level: flags.log_level,
            enforce: flags.enforce.then_some(true),
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn on_pod(change: Change<Pod>) -> HandlerResult {
    match &change {
        Change::Error(e) => warn!("Pod stream error: {} ({})", e.message, e.reason),
        Change::Deleted(_) => info!("🗑️  Pod {}", change.describe()),
        Change::Added(pod) | Change::Modified(pod) => {
            let ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.as_deref())
                .unwrap_or("-");
            info!("Pod {} {} ip={}", change.kind(), change.describe(), ip);
        }
    }
    Ok(())
}

#[allow(clippy::unnecessary_wraps)]
fn on_policy(change: Change<NetworkPolicy>) -> HandlerResult {
    if change.kind() == ChangeKind::Error {
        warn!("NetworkPolicy stream error: {}", change.describe());
    } else {
        info!("NetworkPolicy {} {}", change.kind(), change.describe());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Enforce)) {
        let config = Configuration::enforcer();
        logging::init(&config.log_level);
        info!("Started in enforce mode, no namespace to watch");
        return Ok(());
    }

    let env = ConfigLayer::from_env(std::env::vars())?;
    let config = Configuration::resolve(
        cli.flags.into(),
        env,
        ConfigLayer::defaults(),
        &Environment::from_process(),
    )?;
    logging::init(&config.log_level);
    info!("Effective configuration: {}", serde_json::to_string(&config)?);
    if config.enforce {
        info!("Started in enforce mode, no namespace to watch");
        return Ok(());
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let user_agent = client::user_agent(USER_AGENT);
    let client = client::new(config.kubeconfig(), Some(&user_agent)).await?;
    let factory = KubeSourceFactory::new(client, Some(config.node_name.clone()));

    let watcher = NamespaceWatcher::new(cli.namespace, &factory);
    let stop = watcher.stop_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        stop.stop();
    });

    let stats = watcher.run(on_pod, on_policy).await;
    info!(
        "Done: {} pod events, {} policy events, {} handler failures",
        stats.pod_events, stats.policy_events, stats.failures
    );
    Ok(())
}
