//! Session Table
//!
//! Maps virtual client addresses inside the tunnel /24 to the physical UDP
//! endpoints they handshook from.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// First host octet handed to clients (`.1` is the server)
pub const FIRST_CLIENT_OCTET: u8 = 2;
/// Last host octet handed to clients (`.255` is broadcast)
pub const LAST_CLIENT_OCTET: u8 = 254;

#[derive(Debug, Default)]
struct Sessions {
    by_address: HashMap<Ipv4Addr, SocketAddr>,
    by_endpoint: HashMap<SocketAddr, Ipv4Addr>,
    /// Next host octet to allocate, `None` once the pool is used up
    next_octet: Option<u8>,
}

/// Server-side session table
pub struct SessionTable {
    local_ip: Ipv4Addr,
    sessions: RwLock<Sessions>,
}

impl SessionTable {
    /// Create a table for the /24 containing the server's tunnel address
    pub fn new(local_ip: Ipv4Addr) -> Self {
        Self {
            local_ip,
            sessions: RwLock::new(Sessions {
                next_octet: Some(FIRST_CLIENT_OCTET),
                ..Default::default()
            }),
        }
    }

    /// The server's own tunnel address
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Assign a virtual address to a peer.
    ///
    /// A peer that already holds an address gets the same one back.
    pub async fn new_client(&self, peer: SocketAddr) -> Result<Ipv4Addr> {
        let mut sessions = self.sessions.write().await;

        if let Some(address) = sessions.by_endpoint.get(&peer) {
            return Ok(*address);
        }

        let [a, b, c, own] = self.local_ip.octets();
        // Never hand out the server's own address
        let octet = loop {
            let octet = sessions
                .next_octet
                .ok_or(Error::AddressPoolExhausted(self.local_ip))?;
            sessions.next_octet = (octet < LAST_CLIENT_OCTET).then(|| octet + 1);
            if octet != own {
                break octet;
            }
        };

        let address = Ipv4Addr::new(a, b, c, octet);
        sessions.by_address.insert(address, peer);
        sessions.by_endpoint.insert(peer, address);

        tracing::info!("Assigned {} to {} ({} sessions)", address, peer, sessions.by_address.len());
        Ok(address)
    }

    /// Find the endpoint for a virtual address
    pub async fn lookup(&self, address: Ipv4Addr) -> Result<SocketAddr> {
        self.sessions
            .read()
            .await
            .by_address
            .get(&address)
            .copied()
            .ok_or(Error::SessionNotFound(address))
    }

    /// Number of sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.by_address.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
