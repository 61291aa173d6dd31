//! WolfTun - Point-to-Multipoint Encrypted Tunnel
//!
//! Runs either end of the tunnel: a server terminating a private /24, or a
//! client attaching to it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolftun::config::{Mode, TunnelConfig};
use wolftun::crypto::Cipher;
use wolftun::device::{LinuxTunFactory, UdpTransport};
use wolftun::engine::{wait_for_signal, ClientEngine, ClientOptions, ServerEngine, ServerOptions};
use wolftun::route::{Router, SystemRouter};

/// WolfTun - Point-to-Multipoint Encrypted Tunnel
#[derive(Parser)]
#[command(name = "wolftun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run as client or server
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Server host name or IPv4 address (client)
    #[arg(short, long)]
    addr: Option<String>,

    /// Server UDP port (client)
    #[arg(short, long)]
    port: Option<u16>,

    /// UDP port to listen on (server)
    #[arg(short, long)]
    bind: Option<u16>,

    /// Shared secret
    #[arg(short, long)]
    secret: Option<String>,

    /// TUN device name
    #[arg(short, long)]
    device: Option<String>,

    /// Server address inside the tunnel (server)
    #[arg(long)]
    local_ip: Option<Ipv4Addr>,

    /// DNS server to push to clients (server)
    #[arg(long)]
    dns: Option<Ipv4Addr>,

    /// LZ4-compress outgoing packets
    #[arg(long)]
    compress: bool,

    /// Keep the system default route (client)
    #[arg(long)]
    no_default_route: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the file configuration
    fn apply(&self, config: &mut TunnelConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(mode) = self.mode {
            config.tunnel.mode = mode;
        }
        if let Some(addr) = &self.addr {
            config.client.server_addr = addr.clone();
        }
        if let Some(port) = self.port {
            config.client.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind_port = bind;
        }
        if let Some(secret) = &self.secret {
            config.tunnel.secret = secret.clone();
        }
        if let Some(device) = &self.device {
            config.device.name = device.clone();
        }
        if let Some(local_ip) = self.local_ip {
            config.server.local_ip = Some(local_ip);
        }
        if let Some(dns) = self.dns {
            config.server.dns = Some(dns);
        }
        if self.compress {
            config.tunnel.compress = true;
        }
        if self.no_default_route {
            config.client.default_route = false;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet
            eprintln!("wolftun: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config.logging.level);

    if let Err(e) = run(config).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<TunnelConfig> {
    let mut config = match &cli.config {
        Some(path) => TunnelConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {:?}", path))?,
        None => TunnelConfig::default(),
    };
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(config: TunnelConfig) -> anyhow::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("wolftun must run as root to create TUN devices and change routes");
    }

    let cipher = Cipher::from_secret(&config.tunnel.secret);
    let factory = LinuxTunFactory::new(config.device.name.clone(), config.device.mtu);
    let router = Arc::new(SystemRouter::new());

    tracing::info!("Starting WolfTun {} in {} mode", env!("CARGO_PKG_VERSION"), config.tunnel.mode);
    match config.tunnel.mode {
        Mode::Server => run_server(&config, cipher, factory, router).await,
        Mode::Client => run_client(&config, cipher, factory, router).await,
    }
}

async fn run_server(
    config: &TunnelConfig,
    cipher: Cipher,
    factory: LinuxTunFactory,
    router: Arc<SystemRouter>,
) -> anyhow::Result<()> {
    if config.server.ip_forwarding {
        router.enable_ipv4_forwarding().await?;
    }

    let bind = SocketAddr::from(([0, 0, 0, 0], config.server.bind_port));
    let transport = UdpTransport::bind(bind)
        .await
        .with_context(|| format!("failed to bind UDP port {}", config.server.bind_port))?;

    let options = ServerOptions {
        local_ip: config.server_local_ip(),
        nat_address: config.server.nat_address,
        dns: config.server.dns,
        compress: config.tunnel.compress,
    };
    let engine = ServerEngine::bind(options, cipher, &factory, Arc::new(transport))
        .await
        .context("failed to start server")?;

    engine.run(wait_for_signal()).await?;
    Ok(())
}

async fn run_client(
    config: &TunnelConfig,
    cipher: Cipher,
    factory: LinuxTunFactory,
    router: Arc<SystemRouter>,
) -> anyhow::Result<()> {
    let host = config.server_host()?;
    let server = resolve_ipv4(host, config.client.port).await?;
    tracing::info!("Connecting to {} ({})", host, server);

    let transport = UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    let options = ClientOptions {
        server,
        handshake_timeout: config.handshake_timeout(),
        default_route: config.client.default_route,
        compress: config.tunnel.compress,
    };
    let engine = ClientEngine::new(options, cipher, Arc::new(transport), Arc::new(factory), router);

    engine.run(wait_for_signal()).await?;
    Ok(())
}

/// Resolve a host name to its first IPv4 address
async fn resolve_ipv4(host: &str, port: u16) -> anyhow::Result<SocketAddrV4> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {}", host))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    bail!("{} has no IPv4 address", host)
}
