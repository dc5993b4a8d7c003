//! iaptun - Tunnel local TCP ports to cloud instances through the relay
//!
//! Opens a loopback listener per destination; every local connection is
//! forwarded to the instance port over an authenticated WebSocket relay.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use iaptun_broker::{BroadcastEventSink, TunnelBroker, TunnelEvent};
use iaptun_transport_websocket::StaticTokenSource;
use iaptun_tunnel::{
    InstanceLocator, IpAllowListPolicy, LoopbackRelayPolicy, RelayPolicy, RelayTunnelService,
    TunnelDestination, TunnelServiceConfig,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ConfigManager, IaptunConfig};

/// iaptun - Tunnel local TCP ports to cloud instances
#[derive(Parser, Debug)]
#[command(name = "iaptun")]
#[command(about = "Tunnel local TCP ports to cloud instances through an identity-aware relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel and keep it open until Ctrl+C
    #[command(long_about = r#"
Open a local tunnel to a port on a cloud instance. The local port is
derived from the destination, so reconnecting usually lands on the same
port. Runs until interrupted with Ctrl+C.

EXAMPLES:
  # RDP to a Windows VM
  iaptun connect --instance projects/my-project/zones/us-central1-a/instances/vm-1 \
    --port 3389

  # Let clients from the office network use the tunnel
  iaptun connect --instance projects/p/zones/z/instances/db-1 --port 5432 \
    --allow 127.0.0.1 --allow 10.20.0.0/16

ENVIRONMENT VARIABLES:
  IAPTUN_INSTANCE   Instance locator
  IAPTUN_RELAY_URL  Relay base URL
  IAPTUN_TOKEN      Access token
    "#)]
    Connect {
        #[command(flatten)]
        target: TargetArgs,

        /// Client IP or CIDR range allowed to use the tunnel (repeatable).
        /// Without it only loopback clients are accepted.
        #[arg(long = "allow", value_name = "CIDR")]
        allow: Vec<String>,
    },

    /// Check that the relay lets us reach an instance port
    Probe {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Instance as projects/<project>/zones/<zone>/instances/<name>
    #[arg(long, env = "IAPTUN_INSTANCE")]
    instance: InstanceLocator,

    /// Port on the instance
    #[arg(long)]
    port: u16,

    /// Probe timeout in seconds
    #[arg(long, value_name = "SECS")]
    probe_timeout: Option<u64>,

    /// Relay base URL (ws:// or wss://)
    #[arg(long, env = "IAPTUN_RELAY_URL")]
    relay_url: Option<String>,

    /// Access token sent to the relay
    #[arg(long, env = "IAPTUN_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl TargetArgs {
    fn destination(&self) -> TunnelDestination {
        TunnelDestination::new(self.instance.clone(), self.port)
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn build_broker(
    target: &TargetArgs,
    config: &IaptunConfig,
    events: Arc<BroadcastEventSink>,
) -> Result<TunnelBroker> {
    let token = config.access_token(target.token.clone())?;

    let service_config = TunnelServiceConfig::default()
        .with_relay(config.relay_config(target.relay_url.as_deref()))
        .with_preflight_timeout(Some(config.probe_timeout(target.probe_timeout)));

    let tokens = Arc::new(StaticTokenSource::new(token));
    let service = RelayTunnelService::new(service_config, tokens)
        .context("Invalid tunnel configuration")?;

    Ok(TunnelBroker::new(Arc::new(service), events))
}

fn build_policy(allow: &[String]) -> Result<Arc<dyn RelayPolicy>> {
    if allow.is_empty() {
        return Ok(Arc::new(LoopbackRelayPolicy));
    }

    let policy = IpAllowListPolicy::new(allow).context("Invalid --allow value")?;
    Ok(Arc::new(policy))
}

/// Log broker events until the sink goes away
fn spawn_event_logger(mut events: broadcast::Receiver<TunnelEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TunnelEvent::Opened(destination)) => {
                    debug!("Event: tunnel to {} opened", destination)
                }
                Ok(TunnelEvent::Closed(destination)) => {
                    debug!("Event: tunnel to {} closed", destination)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event logger skipped {} events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_connect(target: TargetArgs, allow: Vec<String>, config: IaptunConfig) -> Result<()> {
    let events = Arc::new(BroadcastEventSink::default());
    spawn_event_logger(events.subscribe());

    let broker = build_broker(&target, &config, events)?;
    let policy = build_policy(&allow)?;
    let destination = target.destination();

    let tunnel = broker
        .connect(&destination, policy, config.probe_timeout(target.probe_timeout))
        .await
        .with_context(|| format!("Failed to open tunnel to {}", destination))?;

    info!(
        "Tunnel to {} ready: connect to 127.0.0.1:{} (policy {})",
        destination,
        tunnel.local_port(),
        tunnel.policy_id()
    );
    info!("Press Ctrl+C to close the tunnel");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    let stats = tunnel.statistics();
    broker
        .disconnect_all()
        .await
        .context("Failed to close tunnels")?;

    info!(
        "Tunnel closed ({} bytes sent, {} bytes received)",
        stats.bytes_sent, stats.bytes_received
    );
    Ok(())
}

async fn run_probe(target: TargetArgs, config: IaptunConfig) -> Result<()> {
    let events = Arc::new(BroadcastEventSink::default());
    let broker = build_broker(&target, &config, events)?;
    let destination = target.destination();

    broker
        .connect(
            &destination,
            Arc::new(LoopbackRelayPolicy),
            config.probe_timeout(target.probe_timeout),
        )
        .await
        .with_context(|| format!("Probe of {} failed", destination))?;

    if let Err(e) = broker.disconnect(&destination).await {
        error!("Failed to close tunnel to {}: {}", destination, e);
    }

    info!("{} is reachable through the relay", destination);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = ConfigManager::load()?;

    match cli.command {
        Commands::Connect { target, allow } => run_connect(target, allow, config).await,
        Commands::Probe { target } => run_probe(target, config).await,
    }
}
