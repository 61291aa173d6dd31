//! WolfTun Error Types

use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for WolfTun operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfTun error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Crypto errors
    #[error("Crypto setup error: {0}")]
    Crypto(String),

    #[error("Decryption failed (wrong secret or corrupted datagram)")]
    Decrypt,

    // Protocol errors
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected {got} message (expected {expected})")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // Lookup errors
    #[error("No session found for virtual address {0}")]
    SessionNotFound(Ipv4Addr),

    #[error("NAT record not found for external port {0}")]
    NatNotFound(u16),

    // Allocation errors
    #[error("Virtual address pool exhausted in {0}/24")]
    AddressPoolExhausted(Ipv4Addr),

    #[error("No external port left to allocate")]
    NatExhausted,

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    // Handshake errors
    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    // Device and transport errors
    #[error("Device error: {0}")]
    Device(String),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Handle already closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Routing errors
    #[error("Routing error: {0}")]
    Route(String),
}

impl Error {
    /// Check if this error comes from the TUN device or the UDP socket.
    /// These terminate the engine that owns the handle.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ShortWrite { .. } | Error::Closed | Error::Device(_)
        )
    }

    /// Check if this error was caused by a bad datagram from a peer
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_)
                | Error::Decrypt
                | Error::UnexpectedMessage { .. }
                | Error::PayloadTooLarge { .. }
        )
    }

    /// Check if this error is a per-packet table miss
    pub fn is_lookup_miss(&self) -> bool {
        matches!(self, Error::SessionNotFound(_) | Error::NatNotFound(_))
    }

    /// Check if the packet that caused this error can simply be dropped
    pub fn is_recoverable(&self) -> bool {
        self.is_lookup_miss()
            || matches!(
                self,
                Error::HandshakeTimeout(_)
                    | Error::AddressPoolExhausted(_)
                    | Error::NatExhausted
                    | Error::InvalidPacket(_)
            )
    }
}
