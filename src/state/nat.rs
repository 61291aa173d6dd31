//! NAT Table
//!
//! Masquerading for clients that share the server's external address.
//! Egress UDP/TCP packets get their source rewritten to
//! `(external address, allocated port)`; ingress packets addressed to an
//! allocated port are rewritten back. ICMP and every other protocol pass
//! through untouched.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::packet::{self, Ipv4Layout, PROTO_TCP, PROTO_UDP};

/// Source identity of an egress flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatTuple {
    pub protocol: u8,
    pub source_ip: Ipv4Addr,
    pub source_port: u16,
}

impl std::fmt::Display for NatTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.protocol {
            PROTO_TCP => "tcp",
            PROTO_UDP => "udp",
            _ => "ip",
        };
        write!(f, "{}/{}:{}", proto, self.source_ip, self.source_port)
    }
}

/// What a translate call did to the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Addresses and ports were rewritten
    Rewritten(u16),
    /// Protocol is not translated, packet left unchanged
    Passthrough,
}

#[derive(Debug)]
struct Mappings {
    forward: HashMap<NatTuple, u16>,
    reverse: HashMap<u16, NatTuple>,
    /// Next port to hand out, `None` once past 65535
    next_port: Option<u16>,
}

/// Shared-egress translation table
pub struct NatTable {
    external: Ipv4Addr,
    base_port: u16,
    mappings: RwLock<Mappings>,
}

impl NatTable {
    /// Create a table translating to `external`, allocating ports from `base_port`
    pub fn new(external: Ipv4Addr, base_port: u16) -> Self {
        Self {
            external,
            base_port,
            mappings: RwLock::new(Mappings {
                forward: HashMap::new(),
                reverse: HashMap::new(),
                next_port: Some(base_port),
            }),
        }
    }

    pub fn external(&self) -> Ipv4Addr {
        self.external
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Get the external port for a tuple, allocating one on first sight
    pub async fn forward_lookup(&self, tuple: NatTuple) -> Result<u16> {
        if let Some(port) = self.mappings.read().await.forward.get(&tuple) {
            return Ok(*port);
        }

        let mut mappings = self.mappings.write().await;
        // Another task may have allocated between the two locks
        if let Some(port) = mappings.forward.get(&tuple) {
            return Ok(*port);
        }

        let port = mappings.next_port.ok_or(Error::NatExhausted)?;
        mappings.next_port = port.checked_add(1);
        mappings.forward.insert(tuple, port);
        mappings.reverse.insert(port, tuple);
        debug!("NAT {} -> {}:{}", tuple, self.external, port);
        Ok(port)
    }

    /// Find the tuple behind an external port
    pub async fn reverse_lookup(&self, port: u16) -> Result<NatTuple> {
        self.mappings
            .read()
            .await
            .reverse
            .get(&port)
            .copied()
            .ok_or(Error::NatNotFound(port))
    }

    /// Number of active mappings
    pub async fn len(&self) -> usize {
        self.mappings.read().await.forward.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rewrite an egress packet's source to the external identity.
    ///
    /// Fragments and truncated transport headers are refused before any
    /// port is allocated.
    pub async fn forward_translate(&self, packet: &mut [u8]) -> Result<Translation> {
        let layout = Ipv4Layout::parse(packet)?;
        if !layout.carries_ports() {
            return Ok(Translation::Passthrough);
        }
        layout.check_rewritable()?;
        let Some(source_port) = layout.source_port(packet) else {
            return Ok(Translation::Passthrough);
        };
        let source_ip = packet::source(packet).ok_or_else(|| Error::InvalidPacket("no source".into()))?;

        let tuple = NatTuple { protocol: layout.protocol, source_ip, source_port };
        let port = self.forward_lookup(tuple).await?;

        packet::set_source(packet, self.external);
        layout.set_source_port(packet, port);
        packet::update_ipv4_checksum(packet, &layout);
        packet::update_transport_checksum(packet, &layout)?;
        trace!("NAT out {} as {}:{}", tuple, self.external, port);
        Ok(Translation::Rewritten(port))
    }

    /// Rewrite an ingress packet's destination back to the original flow
    pub async fn reverse_translate(&self, packet: &mut [u8]) -> Result<Translation> {
        let layout = Ipv4Layout::parse(packet)?;
        if !layout.carries_ports() {
            return Ok(Translation::Passthrough);
        }
        layout.check_rewritable()?;
        let Some(port) = layout.destination_port(packet) else {
            return Ok(Translation::Passthrough);
        };

        let tuple = self.reverse_lookup(port).await?;
        if tuple.protocol != layout.protocol {
            return Err(Error::NatNotFound(port));
        }

        packet::set_destination(packet, tuple.source_ip);
        layout.set_destination_port(packet, tuple.source_port);
        packet::update_ipv4_checksum(packet, &layout);
        packet::update_transport_checksum(packet, &layout)?;
        trace!("NAT in {} -> {}", port, tuple);
        Ok(Translation::Rewritten(port))
    }
}
