//! Burrow CLI
//!
//! `burrow serve` runs the tunnel server, `burrow connect` exposes a local
//! port through one.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_client::{Tunnel, TunnelConfig, TunnelEvent};
use burrow_server::config::parse_port_range;
use burrow_server::{FileConfig, ServerConfig, TunnelServer};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// Burrow - expose local HTTP services under a public subdomain
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose local HTTP services under a public subdomain")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    #[command(long_about = r#"
Run the tunnel server. Tunnels are requested with GET /?new or GET /<id>
on the base domain and served on <id>.<domain>.

Settings are read from defaults, then the --config JSON file, then the
environment and these flags. A flag wins over its environment variable.

ENVIRONMENT VARIABLES:
  BURROW_CONFIG    JSON config file
  SECURE_PROTOCOL  Advertise https:// tunnel URLs (true/false)
  SERVER_ADDRESS   Address the public listener binds to
  SERVER_PORT      Port the public listener binds to
  PORT_RANGE       Broker port range, e.g. 10000-20000
  MAX_SOCKETS      Sockets each client may open
  DOMAINS          Base domains, e.g. tunnel.example.com,example.org
  LANDING_PAGE     Redirect target for GET / on the base domain
    "#)]
    Serve(ServeArgs),

    /// Expose a local port through a tunnel server
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// JSON config file
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Address the public listener binds to
    #[arg(long, env = "SERVER_ADDRESS")]
    address: Option<IpAddr>,

    /// Port the public listener binds to
    #[arg(long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Advertise https:// tunnel URLs (TLS is terminated in front of burrow)
    #[arg(
        long,
        env = "SECURE_PROTOCOL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    secure: Option<bool>,

    /// Base domain tunnels are served under (repeatable or comma separated)
    #[arg(long = "domain", env = "DOMAINS", value_delimiter = ',')]
    domains: Vec<String>,

    /// Redirect target for GET / on the base domain
    #[arg(long, env = "LANDING_PAGE")]
    landing_page: Option<String>,

    /// Broker port range, e.g. 10000-20000
    #[arg(long, env = "PORT_RANGE", value_parser = port_range)]
    port_range: Option<[u16; 2]>,

    /// Sockets each client may open against its broker
    #[arg(long, env = "MAX_SOCKETS")]
    max_sockets: Option<usize>,

    /// Address broker listeners bind to
    #[arg(long)]
    broker_address: Option<IpAddr>,

    /// How long a tunnel survives without client sockets, in milliseconds
    #[arg(long)]
    grace_period_ms: Option<u64>,
}

impl ServeArgs {
    /// Values given by flag or environment, layered over the config file
    fn overrides(&self) -> FileConfig {
        let domains: Vec<String> = self
            .domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();

        FileConfig {
            secure: self.secure,
            address: self.address,
            port: self.port,
            port_range: self.port_range,
            max_sockets: self.max_sockets,
            domains: (!domains.is_empty()).then_some(domains),
            landing_page: self.landing_page.clone().filter(|p| !p.is_empty()),
        }
    }
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Local port to expose
    #[arg(short, long, env = "BURROW_PORT")]
    port: u16,

    /// Tunnel server
    #[arg(long, env = "BURROW_HOST", default_value = burrow_client::DEFAULT_SERVER)]
    host: Url,

    /// Request this subdomain
    #[arg(short, long, env = "BURROW_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Proxy to this host instead of localhost, rewriting the Host header to it
    #[arg(short, long, env = "BURROW_LOCAL_HOST")]
    local_host: Option<String>,

    /// Reach the local service over HTTPS
    #[arg(long)]
    local_https: bool,

    /// Client certificate for the local service (PEM)
    #[arg(long, requires = "local_key")]
    local_cert: Option<PathBuf>,

    /// Key for --local-cert (PEM)
    #[arg(long, requires = "local_cert")]
    local_key: Option<PathBuf>,

    /// Certificate authority for the local service (PEM)
    #[arg(long)]
    local_ca: Option<PathBuf>,

    /// Skip certificate checks for the local service
    #[arg(long)]
    allow_invalid_cert: bool,

    /// Print each forwarded request line
    #[arg(long)]
    print_requests: bool,
}

fn port_range(value: &str) -> Result<[u16; 2], String> {
    parse_port_range(value).ok_or_else(|| format!("invalid port range: {}", value))
}

/// Install the subscriber; RUST_LOG wins over `log_level`
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
        token.cancel();
    });
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    config.merge(args.overrides());
    if let Some(broker_address) = args.broker_address {
        config.broker_addr = broker_address;
    }
    if let Some(grace) = args.grace_period_ms {
        config.grace_period = Duration::from_millis(grace);
    }

    info!("Public listener: {}", config.bind_addr);
    if config.domains.is_empty() {
        info!("Base domain: derived from each request's Host");
    } else {
        info!("Base domains: {}", config.domains.join(", "));
    }
    if let Some((start, end)) = config.port_range {
        info!("Broker ports: {}-{}", start, end);
    }

    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start tunnel server")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    server.run(shutdown).await.context("Tunnel server failed")?;

    info!("Burrow server stopped");
    Ok(())
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let mut builder = TunnelConfig::builder()
        .server(args.host)
        .local_port(args.port)
        .local_https(args.local_https)
        .allow_invalid_cert(args.allow_invalid_cert);

    if let Some(subdomain) = args.subdomain {
        builder = builder.subdomain(subdomain);
    }
    if let Some(local_host) = args.local_host {
        builder = builder.local_host(local_host);
    }
    if let Some(cert) = args.local_cert {
        builder = builder.local_cert(cert);
    }
    if let Some(key) = args.local_key {
        builder = builder.local_key(key);
    }
    if let Some(ca) = args.local_ca {
        builder = builder.local_ca(ca);
    }
    let config = builder.build().context("Invalid tunnel configuration")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let tunnel = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        tunnel = Tunnel::open(config) => tunnel.context("Failed to open tunnel")?,
    };
    println!("your url is: {}", tunnel.url());

    let mut failure = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = tunnel.next_event() => match event {
                Some(TunnelEvent::Request { method, path }) => {
                    if args.print_requests {
                        println!("{} {}", method, path);
                    }
                }
                Some(TunnelEvent::Error { message }) => {
                    error!("Tunnel failed: {}", message);
                    failure = Some(message);
                    break;
                }
                None => break,
            },
        }
    }

    tunnel.close();
    tunnel.closed().await;
    info!("Tunnel {} closed", tunnel.id());

    match failure {
        Some(message) => anyhow::bail!(message),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Connect(args) => connect(args).await,
    }
}
