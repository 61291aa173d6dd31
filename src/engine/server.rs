//! Server Engine
//!
//! Terminates the tunnel /24 on a local TUN device. Peers handshake to get
//! an address from the session table; after that, packets read from TUN are
//! sent to whichever peer owns the destination address and `Data` from
//! peers is written to TUN. Bad input from peers is dropped, only TUN and
//! socket failures stop the server.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use super::client::TUNNEL_PREFIX;
use super::{first_termination, log_termination, spawn_relay, spawn_signal, Completion};
use crate::crypto::Cipher;
use crate::device::{Transport, TunDevice, TunFactory, MAX_PACKET};
use crate::error::{Error, Result};
use crate::packet;
use crate::protocol::{FrameCodec, Kind, Message, MAX_DATAGRAM};
use crate::state::{NatTable, SessionTable, Translation};

/// Server engine settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Server address inside the tunnel, `.1` of the subnet
    pub local_ip: Ipv4Addr,
    /// External address to masquerade client egress behind
    pub nat_address: Option<Ipv4Addr>,
    /// DNS server pushed to clients in `Accept`
    pub dns: Option<Ipv4Addr>,
    /// Compress outgoing `Data`
    pub compress: bool,
}

/// State shared by the relay tasks
struct Shared {
    local_ip: Ipv4Addr,
    dns: Option<Ipv4Addr>,
    tun: Arc<dyn TunDevice>,
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionTable>,
    nat: Option<Arc<NatTable>>,
}

impl Shared {
    fn in_tunnel(&self, address: Ipv4Addr) -> bool {
        address.octets()[..3] == self.local_ip.octets()[..3]
    }
}

pub struct ServerEngine {
    shared: Arc<Shared>,
    codec: FrameCodec,
}

impl ServerEngine {
    /// Open the TUN device on `local_ip/24` and prepare the tables.
    ///
    /// NAT ports are allocated from the port after the one the transport is
    /// bound to.
    pub async fn bind(
        options: ServerOptions,
        cipher: Cipher,
        factory: &dyn TunFactory,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if options.local_ip.octets()[3] != 1 {
            return Err(Error::Config(format!(
                "server address {} must be the .1 address of its /24",
                options.local_ip
            )));
        }

        let listen = transport.local_addr()?;
        let tun = factory.open(options.local_ip, TUNNEL_PREFIX).await?;
        info!(
            "Server listening on {} with {} at {}/{}",
            listen,
            tun.name(),
            options.local_ip,
            TUNNEL_PREFIX
        );

        let nat = options.nat_address.map(|external| {
            let base_port = listen.port().saturating_add(1);
            info!("Masquerading client egress as {} from port {}", external, base_port);
            Arc::new(NatTable::new(external, base_port))
        });

        Ok(Self {
            shared: Arc::new(Shared {
                local_ip: options.local_ip,
                dns: options.dns,
                tun,
                transport,
                sessions: Arc::new(SessionTable::new(options.local_ip)),
                nat,
            }),
            codec: FrameCodec::new(cipher).with_compression(options.compress),
        })
    }

    pub fn sessions(&self) -> Arc<SessionTable> {
        self.shared.sessions.clone()
    }

    pub fn nat(&self) -> Option<Arc<NatTable>> {
        self.shared.nat.clone()
    }

    /// Close the TUN device and the transport. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.tun.close();
        self.shared.transport.close();
    }

    /// Serve until `stop` resolves or a device fails
    pub async fn run<S>(self, stop: S) -> Result<()>
    where
        S: Future<Output = String> + Send + 'static,
    {
        let (completion, done) = Completion::new();
        let handles = vec![
            spawn_relay(
                "tun->peers",
                completion.clone(),
                tun_to_peers(self.shared.clone(), self.codec.clone()),
            ),
            spawn_relay(
                "peers->tun",
                completion.clone(),
                peers_to_tun(self.shared.clone(), self.codec.clone()),
            ),
            spawn_signal(completion, stop),
        ];

        let termination = first_termination(done).await;
        log_termination("Server", &termination);
        self.shutdown();
        futures::future::join_all(handles).await;
        info!("Server stopped with {} sessions", self.shared.sessions.len().await);
        termination.into_result()
    }
}

async fn tun_to_peers(shared: Arc<Shared>, mut codec: FrameCodec) -> Result<()> {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let len = shared.tun.read(&mut buf).await?;
        match forward_to_peer(&shared, &mut codec, &mut buf[..len]).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => trace!("Dropping packet: {}", e),
            Err(e) => return Err(e),
        }
    }
}

/// Send one TUN packet to the peer owning its destination
async fn forward_to_peer(shared: &Shared, codec: &mut FrameCodec, packet: &mut [u8]) -> Result<()> {
    if let Some(nat) = &shared.nat {
        if packet::destination(packet) == Some(nat.external()) {
            nat.reverse_translate(packet).await?;
        }
    }

    let destination = packet::destination(packet)
        .ok_or_else(|| Error::InvalidPacket(format!("not IPv4 ({} bytes)", packet.len())))?;
    let peer = shared.sessions.lookup(destination).await?;

    let datagram = codec.seal(Message::data(Bytes::copy_from_slice(packet)))?;
    shared.transport.send_to(&datagram, peer).await?;
    trace!("tun -> {} ({}): {} bytes", destination, peer, packet.len());
    Ok(())
}

async fn peers_to_tun(shared: Arc<Shared>, mut codec: FrameCodec) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = shared.transport.recv_from(&mut buf).await?;
        let handled = match codec.open(&buf[..len]) {
            Ok(message) => dispatch(&shared, &mut codec, message, from).await,
            Err(e) => Err(e),
        };
        match handled {
            Ok(()) => {}
            Err(e) if e.is_protocol() || e.is_recoverable() => {
                warn!("Dropping datagram from {}: {}", from, e);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn dispatch(shared: &Shared, codec: &mut FrameCodec, message: Message, from: SocketAddr) -> Result<()> {
    match message.kind() {
        Kind::Request => handle_request(shared, codec, from).await,
        Kind::Data => handle_data(shared, message.into_payload(), from).await,
        Kind::Accept => Err(Error::UnexpectedMessage {
            expected: "Request or Data",
            got: Kind::Accept.name(),
        }),
    }
}

async fn handle_request(shared: &Shared, codec: &mut FrameCodec, from: SocketAddr) -> Result<()> {
    let address = shared.sessions.new_client(from).await?;
    let reply = codec.seal(Message::accept_with_dns(address, shared.dns))?;
    shared.transport.send_to(&reply, from).await?;
    debug!("Accepted {} as {}", from, address);
    Ok(())
}

async fn handle_data(shared: &Shared, mut packet: Bytes, from: SocketAddr) -> Result<()> {
    if let Some(nat) = &shared.nat {
        let outside = packet::destination(&packet).is_some_and(|dst| !shared.in_tunnel(dst));
        if outside {
            let mut rewritten = BytesMut::from(packet.as_ref());
            if let Translation::Rewritten(port) = nat.forward_translate(&mut rewritten).await? {
                trace!("Masqueraded {} on port {}", from, port);
            }
            packet = rewritten.freeze();
        }
    }

    shared.tun.write(&packet).await?;
    trace!("{} -> tun: {} bytes", from, packet.len());
    Ok(())
}
