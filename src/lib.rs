//! WolfTun - Point-to-Multipoint Encrypted Tunnel
//!
//! A server terminates a private /24 on a TUN device and relays IPv4
//! packets to and from remote clients over UDP. Clients attach their own
//! TUN device to the same subnet and, by default, route all traffic
//! through the server.
//!
//! # Architecture
//!
//! Every datagram carries one framed [`protocol::Message`] sealed with
//! ChaCha20-Poly1305 under a key derived from a shared secret. Clients
//! handshake for a virtual address; the server keeps a session table from
//! virtual addresses to UDP endpoints and can masquerade client egress
//! behind one external address.
//!
//! # Features
//!
//! - Authenticated encryption with a fresh nonce per datagram
//! - Idempotent handshake with automatic retransmission
//! - Drop-not-crash handling of bad input on the server
//! - Optional NAT with full checksum recomputation
//! - Optional LZ4 compression of tunnelled packets
//! - Route and resolver save/restore on the client, with server-pushed DNS

pub mod config;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod route;
pub mod state;

pub use config::TunnelConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Mode, TunnelConfig};
    pub use crate::crypto::Cipher;
    pub use crate::device::{LinuxTunFactory, Transport, TunDevice, TunFactory, UdpTransport};
    pub use crate::engine::{ClientEngine, ClientOptions, ServerEngine, ServerOptions};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{FrameCodec, Kind, Message};
    pub use crate::route::{Router, SystemRouter};
    pub use crate::state::{NatTable, SessionTable};
}
