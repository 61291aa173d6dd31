//! WolfTun Configuration
//!
//! TOML configuration for both ends of the tunnel. Every field has a
//! default, so an empty file (or no file) plus command-line flags is enough
//! to run.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest MTU every IPv4 host must accept
const MIN_MTU: u16 = 576;
/// Largest MTU whose packets still fit a single read buffer
pub const MAX_MTU: u16 = crate::device::MAX_PACKET as u16;
/// Linux interface names are at most 15 bytes
const MAX_DEVICE_NAME: usize = 15;

/// Main WolfTun configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub tunnel: TunnelSection,

    /// Client-side settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Server-side settings
    #[serde(default)]
    pub server: ServerConfig,

    /// TUN device settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which end of the tunnel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Client,
    Server,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Client => f.write_str("client"),
            Mode::Server => f.write_str("server"),
        }
    }
}

/// Settings shared by both ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Run as client or server
    #[serde(default)]
    pub mode: Mode,

    /// Shared secret the tunnel key is derived from
    #[serde(default = "default_secret")]
    pub secret: String,

    /// LZ4-compress outgoing packets when it makes them smaller
    #[serde(default)]
    pub compress: bool,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or IPv4 address
    #[serde(default)]
    pub server_addr: String,

    /// Server UDP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Send all traffic through the tunnel
    #[serde(default = "default_true")]
    pub default_route: bool,

    /// Wait for the server's answer before resending the handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP port to listen on
    #[serde(default = "default_port")]
    pub bind_port: u16,

    /// Server address inside the tunnel, always the `.1` of its /24
    /// (random `10.x.y.1` when unset)
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,

    /// DNS server pushed to clients in the handshake
    #[serde(default)]
    pub dns: Option<Ipv4Addr>,

    /// Masquerade client egress behind this address
    #[serde(default)]
    pub nat_address: Option<Ipv4Addr>,

    /// Turn on kernel IPv4 forwarding at startup
    #[serde(default = "default_true")]
    pub ip_forwarding: bool,
}

/// TUN device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Interface name
    #[serde(default = "default_device_name")]
    pub name: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_secret() -> String {
    "default".to_string()
}

fn default_port() -> u16 {
    8964
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_device_name() -> String {
    "wolftun0".to_string()
}

fn default_mtu() -> u16 {
    1400
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            secret: default_secret(),
            compress: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            port: default_port(),
            default_route: true,
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: default_port(),
            local_ip: None,
            dns: None,
            nat_address: None,
            ip_forwarding: true,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            mtu: default_mtu(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: TunnelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.secret.is_empty() {
            return Err(Error::Config("tunnel.secret cannot be empty".into()));
        }

        if self.device.name.is_empty() || self.device.name.len() > MAX_DEVICE_NAME {
            return Err(Error::Config(format!(
                "device.name must be 1 to {} bytes",
                MAX_DEVICE_NAME
            )));
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.device.mtu) {
            return Err(Error::Config(format!(
                "device.mtu must be between {} and {}",
                MIN_MTU, MAX_MTU
            )));
        }

        if self.client.handshake_timeout_ms == 0 {
            return Err(Error::Config("client.handshake_timeout_ms must be positive".into()));
        }

        if let Some(local_ip) = self.server.local_ip {
            if local_ip.octets()[3] != 1 {
                return Err(Error::Config(format!(
                    "server.local_ip {} must be the .1 address of its /24",
                    local_ip
                )));
            }
        }

        Ok(())
    }

    /// Server host to connect to, required in client mode
    pub fn server_host(&self) -> Result<&str> {
        match self.client.server_addr.as_str() {
            "" => Err(Error::Config("client.server_addr is required in client mode".into())),
            host => Ok(host),
        }
    }

    /// Server tunnel address, picking a random subnet when none is configured
    pub fn server_local_ip(&self) -> Ipv4Addr {
        self.server.local_ip.unwrap_or_else(random_local_ip)
    }

    /// Get the handshake timeout as Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.client.handshake_timeout_ms)
    }
}

/// A random `10.x.y.1` server address
pub fn random_local_ip() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(10, rng.gen(), rng.gen(), 1)
}
