//! UDP transport
//!
//! Wraps a tokio UDP socket. Closing drops the engine's reference; the
//! descriptor itself goes away once in-flight calls have returned.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::Transport;
use crate::error::{Error, Result};

/// UDP-based transport
pub struct UdpTransport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to the given address, e.g. `0.0.0.0:8964` or `0.0.0.0:0`
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound to {}", local_addr);
        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
        })
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::Closed)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket()?.recv_from(buf).await?)
    }

    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<usize> {
        Ok(self.socket()?.send_to(datagram, dest).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn close(&self) {
        let taken = self
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if taken.is_some() {
            debug!("UDP transport {} closed", self.local_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        a.close();
        a.close();

        let mut buf = [0u8; 16];
        assert!(matches!(a.recv_from(&mut buf).await, Err(Error::Closed)));
        assert!(matches!(
            a.send_to(b"x", "127.0.0.1:9".parse().unwrap()).await,
            Err(Error::Closed)
        ));
    }
}
