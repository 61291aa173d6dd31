//! Tunnel Protocol
//!
//! Defines the messages exchanged between client and server and the
//! datagram codec that frames and seals them.

pub mod codec;
pub mod message;

pub use codec::FrameCodec;
pub use message::{Kind, Message, MAGIC, MAX_DATAGRAM, MAX_PAYLOAD};
