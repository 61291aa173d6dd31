//! Client Engine
//!
//! Handshakes with one server, brings up the TUN device on the assigned
//! address, points the default route into the tunnel and relays until the
//! first fatal error or stop signal. A DNS server pushed by the server is
//! installed as the resolver. Teardown undoes the routing and resolver
//! changes.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::{first_termination, log_termination, spawn_relay, spawn_signal, Completion, Termination};
use crate::crypto::Cipher;
use crate::device::{Transport, TunDevice, TunFactory, MAX_PACKET};
use crate::error::{Error, Result};
use crate::protocol::{FrameCodec, Kind, Message, MAX_DATAGRAM};
use crate::route::{tunnel_gateway, Router};

/// Prefix length of the tunnel subnet
pub const TUNNEL_PREFIX: u8 = 24;

/// Client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    Relaying,
    ShuttingDown,
    Terminated,
}

/// Client engine settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server's physical UDP endpoint
    pub server: SocketAddrV4,
    /// How long to wait for an `Accept` before resending the `Request`
    pub handshake_timeout: Duration,
    /// Replace the OS default route with the tunnel gateway
    pub default_route: bool,
    /// Compress outgoing `Data`
    pub compress: bool,
}

/// Routing changes applied by the client, undone at teardown
#[derive(Debug, Default)]
struct SavedRoutes {
    /// Default gateway found at startup
    previous_gateway: Option<Ipv4Addr>,
    /// Host route to the server is installed
    pinned: bool,
    /// The previous default route was removed
    default_cleared: bool,
    /// The tunnel default route is installed
    tunnel_default: bool,
    /// Resolver configuration replaced by the pushed DNS server
    resolver: Option<String>,
}

pub struct ClientEngine {
    options: ClientOptions,
    codec: FrameCodec,
    transport: Arc<dyn Transport>,
    factory: Arc<dyn TunFactory>,
    router: Arc<dyn Router>,
    tun: Option<Arc<dyn TunDevice>>,
    address: Option<Ipv4Addr>,
    dns: Option<Ipv4Addr>,
    routes: SavedRoutes,
    state: ClientState,
}

impl ClientEngine {
    pub fn new(
        options: ClientOptions,
        cipher: Cipher,
        transport: Arc<dyn Transport>,
        factory: Arc<dyn TunFactory>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            codec: FrameCodec::new(cipher).with_compression(options.compress),
            options,
            transport,
            factory,
            router,
            tun: None,
            address: None,
            dns: None,
            routes: SavedRoutes::default(),
            state: ClientState::Disconnected,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Virtual address assigned by the server, once handshaken
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    /// DNS server pushed by the server, if any
    pub fn dns(&self) -> Option<Ipv4Addr> {
        self.dns
    }

    fn server(&self) -> SocketAddr {
        SocketAddr::V4(self.options.server)
    }

    /// Send `Request`s until the server answers with an `Accept`.
    ///
    /// Each wait is bounded by the handshake timeout; there is no retry
    /// limit. A malformed or unexpected datagram from the server is fatal.
    pub async fn handshake(&mut self) -> Result<Ipv4Addr> {
        self.state = ClientState::Handshaking;
        let server = self.server();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let request = self.codec.seal(Message::request())?;
            self.transport.send_to(&request, server).await?;
            debug!("Sent handshake request to {} (attempt {})", server, attempt);

            match tokio::time::timeout(self.options.handshake_timeout, self.await_accept(&mut buf)).await {
                Ok(result) => {
                    let accept = result?;
                    let address = accept
                        .assigned_address()
                        .ok_or_else(|| Error::MalformedFrame("accept without address".into()))?;
                    self.dns = accept.assigned_dns();
                    match self.dns {
                        Some(dns) => info!("Server {} assigned {} with DNS {}", server, address, dns),
                        None => info!("Server {} assigned {}", server, address),
                    }
                    self.address = Some(address);
                    return Ok(address);
                }
                Err(_) => {
                    let elapsed = self.options.handshake_timeout.as_millis() as u64;
                    warn!("{}, resending request", Error::HandshakeTimeout(elapsed));
                }
            }
        }
    }

    async fn await_accept(&mut self, buf: &mut [u8]) -> Result<Message> {
        let server = self.server();
        loop {
            let (len, from) = self.transport.recv_from(buf).await?;
            if from != server {
                trace!("Ignoring datagram from {} during handshake", from);
                continue;
            }

            let message = self.codec.open(&buf[..len])?;
            if message.kind() != Kind::Accept {
                return Err(Error::UnexpectedMessage {
                    expected: Kind::Accept.name(),
                    got: message.kind().name(),
                });
            }
            return Ok(message);
        }
    }

    /// Open the TUN device on `address` and route traffic into the tunnel.
    ///
    /// On failure everything already applied is undone.
    pub async fn establish(&mut self, address: Ipv4Addr) -> Result<()> {
        let result = self.bring_up(address).await;
        match result {
            Ok(()) => {
                self.state = ClientState::Relaying;
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, address: Ipv4Addr) -> Result<()> {
        let tun = self.factory.open(address, TUNNEL_PREFIX).await?;
        info!("Tunnel device {} carries {}/{}", tun.name(), address, TUNNEL_PREFIX);
        self.tun = Some(tun);

        let server_ip = *self.options.server.ip();
        let previous = self.router.default_gateway().await?;
        self.routes.previous_gateway = Some(previous);

        self.router.pin_host_route(previous, server_ip).await?;
        self.routes.pinned = true;

        if self.options.default_route {
            let gateway = tunnel_gateway(address);
            self.router.clear_default_route().await?;
            self.routes.default_cleared = true;
            self.router.set_default_gateway(gateway).await?;
            self.routes.tunnel_default = true;
            info!("Default route moved from {} to {}", previous, gateway);
        }

        if let Some(dns) = self.dns {
            let replaced = self.router.set_dns(dns).await?;
            self.routes.resolver = Some(replaced);
        }
        Ok(())
    }

    /// Close both handles and restore routing. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.state == ClientState::Terminated {
            return;
        }
        self.state = ClientState::ShuttingDown;

        if let Some(tun) = self.tun.take() {
            tun.close();
        }
        self.transport.close();

        let routes = std::mem::take(&mut self.routes);
        if let Some(previous) = routes.resolver {
            if let Err(e) = self.router.restore_dns(previous).await {
                warn!("Failed to restore resolver configuration: {}", e);
            }
        }
        if routes.tunnel_default {
            if let Err(e) = self.router.clear_default_route().await {
                warn!("Failed to remove tunnel default route: {}", e);
            }
        }
        if routes.default_cleared {
            if let Some(previous) = routes.previous_gateway {
                match self.router.set_default_gateway(previous).await {
                    Ok(()) => info!("Restored default gateway {}", previous),
                    Err(e) => warn!("Failed to restore default gateway {}: {}", previous, e),
                }
            }
        }
        if routes.pinned {
            if let Err(e) = self.router.unpin_host_route(*self.options.server.ip()).await {
                warn!("Failed to remove host route to {}: {}", self.options.server.ip(), e);
            }
        }

        self.state = ClientState::Terminated;
    }

    /// Connect and relay until `stop` resolves or a task fails
    pub async fn run<S>(mut self, stop: S) -> Result<()>
    where
        S: Future<Output = String> + Send + 'static,
    {
        let mut stop = Box::pin(stop);

        let startup = tokio::select! {
            result = self.start() => result.err().map(Termination::Failed),
            reason = &mut stop => Some(Termination::Signal(reason)),
        };
        if let Some(termination) = startup {
            log_termination("Client", &termination);
            self.teardown().await;
            return termination.into_result();
        }

        let tun = self.tun.clone().ok_or(Error::Closed)?;
        let address = self.address.ok_or(Error::Closed)?;
        let server = self.server();
        let (completion, done) = Completion::new();
        let handles = vec![
            spawn_relay(
                "tun->server",
                completion.clone(),
                tun_to_server(tun.clone(), self.transport.clone(), self.codec.clone(), server),
            ),
            spawn_relay(
                "server->tun",
                completion.clone(),
                server_to_tun(tun, self.transport.clone(), self.codec.clone(), server, address),
            ),
            spawn_signal(completion, stop),
        ];

        let termination = first_termination(done).await;
        log_termination("Client", &termination);
        self.teardown().await;
        futures::future::join_all(handles).await;
        termination.into_result()
    }

    async fn start(&mut self) -> Result<()> {
        let address = self.handshake().await?;
        self.establish(address).await
    }
}

async fn tun_to_server(
    tun: Arc<dyn TunDevice>,
    transport: Arc<dyn Transport>,
    mut codec: FrameCodec,
    server: SocketAddr,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let len = tun.read(&mut buf).await?;
        let datagram = codec.seal(Message::data(Bytes::copy_from_slice(&buf[..len])))?;
        transport.send_to(&datagram, server).await?;
        trace!("tun -> {}: {} bytes", server, len);
    }
}

async fn server_to_tun(
    tun: Arc<dyn TunDevice>,
    transport: Arc<dyn Transport>,
    mut codec: FrameCodec,
    server: SocketAddr,
    address: Ipv4Addr,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = transport.recv_from(&mut buf).await?;
        if from != server {
            trace!("Ignoring datagram from {}", from);
            continue;
        }

        let message = codec.open(&buf[..len])?;
        match message.kind() {
            Kind::Data => {}
            // Answer to a retransmitted Request
            Kind::Accept if message.assigned_address() == Some(address) => {
                debug!("Ignoring repeated Accept for {}", address);
                continue;
            }
            other => {
                return Err(Error::UnexpectedMessage {
                    expected: Kind::Data.name(),
                    got: other.name(),
                });
            }
        }
        let packet = message.into_payload();
        tun.write(&packet).await?;
        trace!("{} -> tun: {} bytes", server, packet.len());
    }
}
