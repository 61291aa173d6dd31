//! In-memory devices for engine tests
//!
//! `MemoryTun` hands the test a handle to inject packets as if the kernel
//! routed them into the tunnel and to observe packets the engine wrote.
//! `MemoryNetwork` is a lossless datagram switch between bound transports.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{Transport, TunDevice, TunFactory};
use crate::error::{Error, Result};

pub(crate) struct MemoryTun {
    name: String,
    inbound: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
    outbound: UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
}

/// Test side of a [`MemoryTun`]
pub(crate) struct TunHandle {
    pub inject: UnboundedSender<Vec<u8>>,
    pub written: UnboundedReceiver<Vec<u8>>,
}

pub(crate) fn tun_pair(name: &str) -> (Arc<MemoryTun>, TunHandle) {
    let (inject, inbound) = mpsc::unbounded_channel();
    let (outbound, written) = mpsc::unbounded_channel();
    let tun = Arc::new(MemoryTun {
        name: name.to_string(),
        inbound: tokio::sync::Mutex::new(inbound),
        outbound,
        closed: AtomicBool::new(false),
    });
    (tun, TunHandle { inject, written })
}

impl MemoryTun {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunDevice for MemoryTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let packet = self.inbound.lock().await.recv().await.ok_or(Error::Closed)?;
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.outbound.send(packet.to_vec()).map_err(|_| Error::Closed)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out one prepared [`MemoryTun`] and records how it was configured
pub(crate) struct MemoryTunFactory {
    tun: Mutex<Option<Arc<MemoryTun>>>,
    pub opened: Mutex<Vec<(Ipv4Addr, u8)>>,
}

impl MemoryTunFactory {
    pub fn new(tun: Arc<MemoryTun>) -> Self {
        Self { tun: Mutex::new(Some(tun)), opened: Mutex::new(Vec::new()) }
    }

    /// A factory whose `open` always fails
    pub fn failing() -> Self {
        Self { tun: Mutex::new(None), opened: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl TunFactory for MemoryTunFactory {
    async fn open(&self, address: Ipv4Addr, prefix_len: u8) -> Result<Arc<dyn TunDevice>> {
        let tun = self
            .tun
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Device("no memory tun available".into()))?;
        self.opened.lock().unwrap().push((address, prefix_len));
        let tun: Arc<dyn TunDevice> = tun;
        Ok(tun)
    }
}

type Inbox = UnboundedSender<(Vec<u8>, SocketAddr)>;

/// A datagram switch connecting [`MemoryTransport`]s by address
#[derive(Clone, Default)]
pub(crate) struct MemoryNetwork {
    ports: Arc<Mutex<HashMap<SocketAddr, Inbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> Arc<MemoryTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ports.lock().unwrap().insert(addr, tx);
        Arc::new(MemoryTransport {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }
}

pub(crate) struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let (datagram, from) = self.inbox.lock().await.recv().await.ok_or(Error::Closed)?;
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok((datagram.len(), from))
    }

    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        // Unknown destinations swallow the datagram, like UDP
        if let Some(inbox) = self.network.ports.lock().unwrap().get(&dest) {
            let _ = inbox.send((datagram.to_vec(), self.addr));
        }
        Ok(datagram.len())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.network.ports.lock().unwrap().remove(&self.addr);
        }
    }
}
