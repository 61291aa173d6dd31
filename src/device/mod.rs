//! Device Module
//!
//! The two handles every engine owns: a TUN device carrying raw IP packets
//! and a datagram transport carrying sealed frames. Both sit behind traits
//! so the engines can run against in-memory doubles in tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

mod tun;
mod udp;

#[cfg(test)]
pub(crate) mod memory;

pub use self::tun::{LinuxTun, LinuxTunFactory};
pub use self::udp::UdpTransport;

/// Largest packet read from either handle in one call
pub const MAX_PACKET: usize = 2048;

/// A virtual network interface exchanging raw IP packets
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one packet into `buf`, returning its length
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one whole packet. A partial write is an error.
    async fn write(&self, packet: &[u8]) -> Result<()>;

    /// Interface name
    fn name(&self) -> &str;

    /// Release the device. Closing twice is a no-op.
    fn close(&self);
}

/// Opens TUN devices once the tunnel address is known
#[async_trait]
pub trait TunFactory: Send + Sync {
    /// Create a device carrying `address/prefix_len` and bring it up
    async fn open(&self, address: Ipv4Addr, prefix_len: u8) -> Result<Arc<dyn TunDevice>>;
}

/// A datagram socket
#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive one datagram
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send one datagram
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<usize>;

    /// Local bound address
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Release the socket. Closing twice is a no-op.
    fn close(&self);
}
