use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod history;
mod inspector;
mod proxy;
mod session;

use config::{ClientConfig, TunnelSettings};
use inspector::InspectorHub;
use proxy::Forwarder;
use session::RelaySession;

/// Replays waiting for the session before the inspector starts refusing them
const REPLAY_QUEUE: usize = 32;

const INSPECTOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "relaytap")]
#[command(author = "Relaytap Team")]
#[command(version = "0.1.0")]
#[command(about = "Expose a local HTTP service through a tunnel server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Tunnel server URL (overrides the config file)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Custom subdomain
        #[arg(short = 'd', long)]
        subdomain: Option<String>,

        /// Local host to forward to
        #[arg(long)]
        host: Option<String>,

        /// Seconds to wait for the local service before answering 502
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Inspector dashboard port
        #[arg(long)]
        inspect_port: Option<u16>,

        /// Disable the inspector dashboard
        #[arg(long)]
        no_inspect: bool,
    },
    /// Store an auth token
    Login {
        /// Token issued by the tunnel server
        token: String,
    },
    /// Remove the stored auth token
    Logout,
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "relaytap=debug,relaytap_shared=debug"
    } else {
        "relaytap=info,relaytap_shared=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config_path = match cli.config.clone().or_else(ClientConfig::default_path) {
        Some(path) => path,
        None => anyhow::bail!("Could not determine a config directory; pass --config"),
    };
    match cli.command {
        Commands::Http {
            port,
            subdomain,
            host,
            timeout,
            inspect_port,
            no_inspect,
        } => {
            let mut config = ClientConfig::load_or_default(&config_path)?;
            if let Some(server) = cli.server {
                config.server = server;
            }
            if let Some(host) = host {
                config.local_host = host;
            }
            if let Some(timeout) = timeout {
                config.forward_timeout_secs = timeout;
            }
            if let Some(inspect_port) = inspect_port {
                config.inspector.port = inspect_port;
            }
            if no_inspect {
                config.inspector.enabled = false;
            }
            config.validate()?;
            run_http_tunnel(&config, port, subdomain).await?;
        }
        Commands::Login { token } => {
            store_token(&config_path, Some(token))?;
            println!("✓ Token saved to {}", config_path.display());
        }
        Commands::Logout => {
            store_token(&config_path, None)?;
            println!("✓ Token removed from {}", config_path.display());
        }
        Commands::Config => {
            let mut config = ClientConfig::load_or_default(&config_path)?;
            if let Some(server) = cli.server {
                config.server = server;
            }
            println!("# {}", config_path.display());
            print!("{}", serde_yaml::to_string(&config.redacted())?);
        }
    }

    Ok(())
}

/// Update only the stored token; command-line overrides never reach the file
fn store_token(path: &Path, token: Option<String>) -> Result<()> {
    let mut config = ClientConfig::load_or_default(path)?;
    config.token = token;
    config.save(path)
}

/// Run HTTP tunnel until Ctrl+C or the server ends it
async fn run_http_tunnel(config: &ClientConfig, local_port: u16, subdomain: Option<String>) -> Result<()> {
    let settings: &dyn TunnelSettings = config;
    let subdomain = subdomain.or_else(|| settings.default_subdomain());
    let token = settings.token();

    let forwarder = Forwarder::new(config.local_host.clone(), local_port, config.forward_timeout())
        .context("Failed to set up local forwarding")?;
    let mut session = RelaySession::new(forwarder);

    let mut inspector_task = None;
    if config.inspector.enabled {
        let (replay_tx, replay_rx) = mpsc::channel(REPLAY_QUEUE);
        let hub = InspectorHub::new(history::MAX_ENTRIES, replay_tx);
        inspector_task = Some(tokio::spawn(inspector::start_inspector(
            hub.clone(),
            settings.inspector_port(),
        )));
        session = session.with_inspector(hub, replay_rx);
    }

    let endpoint = settings.server_endpoint();
    if let Err(e) = session.open(&endpoint, subdomain.as_deref(), token.as_deref()).await {
        session.close().await;
        return Err(e).context("Failed to connect to tunnel server");
    }
    info!("Control connection established");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let result = session.run(shutdown).await;

    // The session closed the hub; give the dashboard a moment to drain
    if let Some(task) = inspector_task {
        if tokio::time::timeout(INSPECTOR_STOP_TIMEOUT, task).await.is_err() {
            warn!("Inspector did not stop in time");
        }
    }

    result.context("Tunnel stopped")?;
    match session.identity() {
        Some(identity) => println!("\n✓ Tunnel {} stopped.", identity.public_url),
        None => println!("\n✓ Tunnel stopped."),
    }
    Ok(())
}
