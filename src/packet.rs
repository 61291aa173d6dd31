//! IPv4 packet helpers
//!
//! Field access on raw IPv4 packets as read from a TUN device, and the
//! Internet checksum (RFC 1071) for the IPv4 header and TCP/UDP segments.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Minimum IPv4 header length
pub const IPV4_MIN_HEADER: usize = 20;

/// ICMP protocol number
pub const PROTO_ICMP: u8 = 0x01;
/// TCP protocol number
pub const PROTO_TCP: u8 = 0x06;
/// UDP protocol number
pub const PROTO_UDP: u8 = 0x11;

/// Smallest TCP header
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

/// Flags and fragment offset share bytes 6..8
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

const CHECKSUM_OFFSET_IPV4: usize = 10;
const CHECKSUM_OFFSET_TCP: usize = 16;
const CHECKSUM_OFFSET_UDP: usize = 6;

/// Extract the destination IPv4 address from a raw IP packet
pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER || (packet[0] >> 4) != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Extract the source IPv4 address from a raw IP packet
pub fn source(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER || (packet[0] >> 4) != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
}

/// Validated view of an IPv4 packet's framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Layout {
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    /// Total length from the header
    pub total_len: usize,
    /// Transport protocol number
    pub protocol: u8,
    /// More-fragments flag set or non-zero fragment offset
    pub fragmented: bool,
}

impl Ipv4Layout {
    /// Parse and sanity-check the IPv4 header
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < IPV4_MIN_HEADER {
            return Err(Error::InvalidPacket(format!("{} bytes is too short for IPv4", packet.len())));
        }
        if packet[0] >> 4 != 4 {
            return Err(Error::InvalidPacket(format!("IP version {}", packet[0] >> 4)));
        }

        let header_len = ((packet[0] & 0x0f) as usize) << 2;
        let total_len = BigEndian::read_u16(&packet[2..4]) as usize;
        if header_len < IPV4_MIN_HEADER || total_len < header_len || total_len > packet.len() {
            return Err(Error::InvalidPacket(format!(
                "inconsistent lengths: ihl={} total={} captured={}",
                header_len,
                total_len,
                packet.len()
            )));
        }

        let fragment = BigEndian::read_u16(&packet[6..8]);
        Ok(Self {
            header_len,
            total_len,
            protocol: packet[9],
            fragmented: fragment & (FLAG_MORE_FRAGMENTS | FRAGMENT_OFFSET_MASK) != 0,
        })
    }

    /// Whether the protocol has TCP/UDP style ports
    pub fn carries_ports(&self) -> bool {
        matches!(self.protocol, PROTO_TCP | PROTO_UDP)
    }

    /// Check that ports and transport checksum can be rewritten in this
    /// packet alone: not a fragment, and the whole transport header present.
    pub fn check_rewritable(&self) -> Result<()> {
        if self.fragmented {
            return Err(Error::InvalidPacket("fragmented packet".into()));
        }
        let needed = match self.protocol {
            PROTO_TCP => TCP_MIN_HEADER,
            PROTO_UDP => UDP_HEADER,
            _ => 0,
        };
        if self.header_len + needed > self.total_len {
            return Err(Error::InvalidPacket(format!(
                "transport header truncated ({} of {} bytes)",
                self.total_len - self.header_len,
                needed
            )));
        }
        Ok(())
    }

    /// Offset of the port field pair, if the protocol carries ports
    fn ports_present(&self) -> bool {
        self.carries_ports() && self.total_len >= self.header_len + 4
    }

    pub fn source_port(&self, packet: &[u8]) -> Option<u16> {
        self.ports_present()
            .then(|| BigEndian::read_u16(&packet[self.header_len..self.header_len + 2]))
    }

    pub fn destination_port(&self, packet: &[u8]) -> Option<u16> {
        self.ports_present()
            .then(|| BigEndian::read_u16(&packet[self.header_len + 2..self.header_len + 4]))
    }

    pub fn set_source_port(&self, packet: &mut [u8], port: u16) {
        BigEndian::write_u16(&mut packet[self.header_len..self.header_len + 2], port);
    }

    pub fn set_destination_port(&self, packet: &mut [u8], port: u16) {
        BigEndian::write_u16(&mut packet[self.header_len + 2..self.header_len + 4], port);
    }
}

pub fn set_source(packet: &mut [u8], address: Ipv4Addr) {
    packet[12..16].copy_from_slice(&address.octets());
}

pub fn set_destination(packet: &mut [u8], address: Ipv4Addr) {
    packet[16..20].copy_from_slice(&address.octets());
}

/// Sum 16-bit big-endian words, padding an odd trailing byte with zero
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(BigEndian::read_u16(word) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum of a byte slice
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Recompute the IPv4 header checksum in place
pub fn update_ipv4_checksum(packet: &mut [u8], layout: &Ipv4Layout) {
    packet[CHECKSUM_OFFSET_IPV4..CHECKSUM_OFFSET_IPV4 + 2].fill(0);
    let sum = checksum(&packet[..layout.header_len]);
    BigEndian::write_u16(&mut packet[CHECKSUM_OFFSET_IPV4..CHECKSUM_OFFSET_IPV4 + 2], sum);
}

/// Checksum of a TCP/UDP segment including the IPv4 pseudo-header
fn transport_checksum(packet: &[u8], layout: &Ipv4Layout) -> u16 {
    let segment = &packet[layout.header_len..layout.total_len];
    let mut sum = sum_words(&packet[12..20], 0);
    sum = sum.wrapping_add(layout.protocol as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    fold(sum_words(segment, sum))
}

/// Recompute the TCP or UDP checksum in place. Other protocols are left alone.
///
/// A zero UDP checksum means the sender opted out, so it stays zero.
pub fn update_transport_checksum(packet: &mut [u8], layout: &Ipv4Layout) -> Result<()> {
    let offset = match layout.protocol {
        PROTO_TCP => CHECKSUM_OFFSET_TCP,
        PROTO_UDP => CHECKSUM_OFFSET_UDP,
        _ => return Ok(()),
    };
    let field = layout.header_len + offset;
    if field + 2 > layout.total_len {
        return Err(Error::InvalidPacket("transport header truncated".into()));
    }

    if layout.protocol == PROTO_UDP && BigEndian::read_u16(&packet[field..field + 2]) == 0 {
        return Ok(());
    }

    packet[field..field + 2].fill(0);
    let mut sum = transport_checksum(packet, layout);
    if layout.protocol == PROTO_UDP && sum == 0 {
        sum = 0xffff;
    }
    BigEndian::write_u16(&mut packet[field..field + 2], sum);
    Ok(())
}

/// Check both checksums of a packet (used by tests and diagnostics)
pub fn checksums_valid(packet: &[u8]) -> bool {
    let Ok(layout) = Ipv4Layout::parse(packet) else {
        return false;
    };
    if checksum(&packet[..layout.header_len]) != 0 {
        return false;
    }
    match layout.protocol {
        PROTO_TCP | PROTO_UDP => {
            let offset = if layout.protocol == PROTO_TCP { CHECKSUM_OFFSET_TCP } else { CHECKSUM_OFFSET_UDP };
            let field = layout.header_len + offset;
            if field + 2 > layout.total_len {
                return false;
            }
            if layout.protocol == PROTO_UDP && BigEndian::read_u16(&packet[field..field + 2]) == 0 {
                return true;
            }
            transport_checksum(packet, &layout) == 0
        }
        _ => true,
    }
}

/// Build a minimal IPv4/UDP packet with valid checksums
#[cfg(test)]
pub(crate) fn build_udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, body: &[u8]) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + 8 + body.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    BigEndian::write_u16(&mut packet[2..4], total as u16);
    packet[8] = 64;
    packet[9] = PROTO_UDP;
    set_source(&mut packet, src);
    set_destination(&mut packet, dst);
    BigEndian::write_u16(&mut packet[20..22], src_port);
    BigEndian::write_u16(&mut packet[22..24], dst_port);
    BigEndian::write_u16(&mut packet[24..26], (8 + body.len()) as u16);
    packet[26..28].copy_from_slice(&[0xff, 0xff]);
    packet[28..].copy_from_slice(body);

    let layout = Ipv4Layout::parse(&packet).unwrap();
    update_ipv4_checksum(&mut packet, &layout);
    update_transport_checksum(&mut packet, &layout).unwrap();
    packet
}

/// Build a minimal IPv4/TCP packet (SYN) with valid checksums
#[cfg(test)]
pub(crate) fn build_tcp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + 20;
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    BigEndian::write_u16(&mut packet[2..4], total as u16);
    packet[8] = 64;
    packet[9] = PROTO_TCP;
    set_source(&mut packet, src);
    set_destination(&mut packet, dst);
    BigEndian::write_u16(&mut packet[20..22], src_port);
    BigEndian::write_u16(&mut packet[22..24], dst_port);
    BigEndian::write_u32(&mut packet[24..28], 0x0102_0304);
    packet[32] = 5 << 4;
    packet[33] = 0x02;
    BigEndian::write_u16(&mut packet[34..36], 64_240);

    let layout = Ipv4Layout::parse(&packet).unwrap();
    update_ipv4_checksum(&mut packet, &layout);
    update_transport_checksum(&mut packet, &layout).unwrap();
    packet
}

/// Build a minimal IPv4/ICMP echo request
#[cfg(test)]
pub(crate) fn build_icmp(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + 8;
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    BigEndian::write_u16(&mut packet[2..4], total as u16);
    packet[8] = 64;
    packet[9] = PROTO_ICMP;
    set_source(&mut packet, src);
    set_destination(&mut packet, dst);
    packet[20] = 8;
    let icmp = checksum(&packet[20..]);
    BigEndian::write_u16(&mut packet[22..24], icmp);

    let layout = Ipv4Layout::parse(&packet).unwrap();
    update_ipv4_checksum(&mut packet, &layout);
    packet
}
