//! Tunnel Messages
//!
//! Plaintext frame layout (the whole frame is sealed before it hits the wire):
//!
//! ```text
//! [4: magic, big endian] [1: kind | flags] [N: payload]
//! ```
//!
//! The top bit of the kind byte marks a `Data` payload compressed with LZ4
//! (size-prepended block). An `Accept` payload is the assigned address,
//! optionally followed by a DNS server address (4 or 8 bytes).

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::OVERHEAD;
use crate::device::MAX_PACKET;
use crate::error::{Error, Result};

/// Frame magic ("WTN1")
pub const MAGIC: u32 = 0x5754_4E31;

/// Frame header size in bytes
pub const HEADER_LEN: usize = 5;

/// Largest payload that still fits one sealed UDP datagram
pub const MAX_PAYLOAD: usize = 65_507 - OVERHEAD - HEADER_LEN;

/// Receive buffer size for one sealed datagram carrying a full TUN packet
pub const MAX_DATAGRAM: usize = MAX_PACKET + HEADER_LEN + OVERHEAD;

/// Kind byte flag for an LZ4-compressed `Data` payload
const FLAG_COMPRESSED: u8 = 0x80;

/// Message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Client asks for a virtual address
    Request = 1,
    /// Server assigns a virtual address
    Accept = 2,
    /// Raw IP packet
    Data = 3,
}

impl Kind {
    /// Get the kind name (for logging)
    pub fn name(self) -> &'static str {
        match self {
            Kind::Request => "Request",
            Kind::Accept => "Accept",
            Kind::Data => "Data",
        }
    }
}

impl TryFrom<u8> for Kind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Kind::Request),
            2 => Ok(Kind::Accept),
            3 => Ok(Kind::Data),
            other => Err(Error::MalformedFrame(format!("unknown message kind {}", other))),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: Kind,
    payload: Bytes,
}

impl Message {
    /// Address request (no payload)
    pub fn request() -> Self {
        Self { kind: Kind::Request, payload: Bytes::new() }
    }

    /// Address assignment
    pub fn accept(address: Ipv4Addr) -> Self {
        Self::accept_with_dns(address, None)
    }

    /// Address assignment with an optional DNS server for the client
    pub fn accept_with_dns(address: Ipv4Addr, dns: Option<Ipv4Addr>) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_slice(&address.octets());
        if let Some(dns) = dns {
            payload.put_slice(&dns.octets());
        }
        Self { kind: Kind::Accept, payload: payload.freeze() }
    }

    /// IP packet
    pub fn data(packet: impl Into<Bytes>) -> Self {
        Self { kind: Kind::Data, payload: packet.into() }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The address carried by an `Accept`
    pub fn assigned_address(&self) -> Option<Ipv4Addr> {
        self.accept_field(0)
    }

    /// The DNS server carried by an `Accept`, if the server pushed one
    pub fn assigned_dns(&self) -> Option<Ipv4Addr> {
        self.accept_field(4)
    }

    fn accept_field(&self, offset: usize) -> Option<Ipv4Addr> {
        if self.kind != Kind::Accept {
            return None;
        }
        let octets: [u8; 4] = self.payload.get(offset..offset + 4)?.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Size of the encoded frame
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the plaintext frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        self.encode_with(dst, false)
    }

    /// Append the plaintext frame, compressing a `Data` payload when that
    /// makes it smaller
    pub fn encode_with(&self, dst: &mut BytesMut, compress: bool) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let compressed = (compress && self.kind == Kind::Data && !self.payload.is_empty())
            .then(|| lz4_flex::compress_prepend_size(&self.payload))
            .filter(|packed| packed.len() < self.payload.len());

        dst.reserve(self.encoded_len());
        dst.put_u32(MAGIC);
        match compressed {
            Some(packed) => {
                dst.put_u8(self.kind as u8 | FLAG_COMPRESSED);
                dst.put_slice(&packed);
            }
            None => {
                dst.put_u8(self.kind as u8);
                dst.put_slice(&self.payload);
            }
        }
        Ok(())
    }

    /// Parse a plaintext frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "frame is {} bytes, header needs {}",
                frame.len(),
                HEADER_LEN
            )));
        }

        let magic = BigEndian::read_u32(&frame[..4]);
        if magic != MAGIC {
            return Err(Error::MalformedFrame(format!("invalid magic {:#010x}", magic)));
        }

        let compressed = frame[4] & FLAG_COMPRESSED != 0;
        let kind = Kind::try_from(frame[4] & !FLAG_COMPRESSED)?;
        let payload = &frame[HEADER_LEN..];

        match kind {
            _ if compressed && kind != Kind::Data => {
                return Err(Error::MalformedFrame(format!("{} cannot be compressed", kind)));
            }
            Kind::Request if !payload.is_empty() => {
                return Err(Error::MalformedFrame("Request carries a payload".into()));
            }
            Kind::Accept if payload.len() != 4 && payload.len() != 8 => {
                return Err(Error::MalformedFrame(format!(
                    "Accept payload is {} bytes, expected 4 or 8",
                    payload.len()
                )));
            }
            _ => {}
        }

        let payload = if compressed {
            Bytes::from(decompress(payload)?)
        } else {
            Bytes::copy_from_slice(payload)
        };
        Ok(Self { kind, payload })
    }
}

/// Inflate a size-prepended LZ4 block, refusing sizes no packet can have
fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 4 {
        return Err(Error::MalformedFrame("compressed payload has no size".into()));
    }
    let size = LittleEndian::read_u32(&payload[..4]) as usize;
    if size > MAX_PAYLOAD {
        return Err(Error::MalformedFrame(format!(
            "compressed payload claims {} bytes, max {}",
            size, MAX_PAYLOAD
        )));
    }
    lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| Error::MalformedFrame(format!("Decompression failed: {}", e)))
}
