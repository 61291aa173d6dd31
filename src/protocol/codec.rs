//! Datagram Codec
//!
//! Frames a [`Message`] and seals the whole frame with the tunnel cipher.
//! One datagram carries exactly one frame, so the decoder always consumes
//! the entire buffer it is handed.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;
use crate::crypto::Cipher;
use crate::error::{Error, Result};

/// Message framing plus encryption
#[derive(Debug, Clone)]
pub struct FrameCodec {
    cipher: Cipher,
    compress: bool,
}

impl FrameCodec {
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher, compress: false }
    }

    /// Compress outgoing `Data` payloads. Compressed frames are always
    /// accepted on receive.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Seal a message into a datagram
    pub fn seal(&mut self, message: Message) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Open one received datagram
    pub fn open(&mut self, datagram: &[u8]) -> Result<Message> {
        let mut buf = BytesMut::from(datagram);
        self.decode(&mut buf)?
            .ok_or_else(|| Error::MalformedFrame("empty datagram".into()))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let mut frame = BytesMut::with_capacity(message.encoded_len());
        message.encode_with(&mut frame, self.compress)?;
        let sealed = self.cipher.encrypt(&frame)?;
        dst.extend_from_slice(&sealed);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split_to(src.len());
        let frame = self.cipher.decrypt(&datagram)?;
        Message::decode(&frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;
    use crate::config::MAX_MTU;
    use crate::crypto::OVERHEAD;
    use crate::device::{Transport, UdpTransport};
    use crate::protocol::message::{HEADER_LEN, MAX_DATAGRAM};

    fn codec(secret: &str) -> FrameCodec {
        FrameCodec::new(Cipher::from_secret(secret))
    }

    #[test]
    fn test_seal_and_open() {
        let mut codec = codec("default");
        let messages = [
            Message::request(),
            Message::accept(Ipv4Addr::new(192, 168, 88, 2)),
            Message::data(vec![0x45, 0, 0, 20]),
        ];
        for message in messages {
            let datagram = codec.seal(message.clone()).unwrap();
            assert_eq!(datagram.len(), message.encoded_len() + OVERHEAD);
            assert_eq!(codec.open(&datagram).unwrap(), message);
        }
    }

    #[test]
    fn test_decoder_consumes_whole_datagram() {
        let mut codec = codec("default");
        let mut buf = BytesMut::new();
        codec.encode(Message::data(vec![9u8; 100]), &mut buf).unwrap();

        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.payload().len(), 100);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bit_flip_is_rejected() {
        let mut codec = codec("default");
        let datagram = codec.seal(Message::data(vec![1, 2, 3, 4])).unwrap();
        for index in [0, 12, 12 + HEADER_LEN, datagram.len() - 1] {
            let mut corrupted = datagram.to_vec();
            corrupted[index] ^= 0x80;
            let err = codec.open(&corrupted).unwrap_err();
            assert!(err.is_protocol(), "byte {} gave {:?}", index, err);
        }
    }

    #[test]
    fn test_wrong_secret_is_a_protocol_error() {
        let datagram = codec("alpha").seal(Message::request()).unwrap();
        assert!(codec("beta").open(&datagram).unwrap_err().is_protocol());
    }

    #[test]
    fn test_valid_seal_of_bad_frame() {
        let cipher = Cipher::from_secret("default");
        let sealed = cipher.encrypt(&[0xde, 0xad, 0xbe, 0xef, 1]).unwrap();
        assert!(matches!(
            codec("default").open(&sealed),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_compression_is_transparent() {
        let cipher = Cipher::from_secret("default");
        let mut sender = FrameCodec::new(cipher.clone()).with_compression(true);
        let mut receiver = FrameCodec::new(cipher);

        let packet = vec![0u8; 1200];
        let datagram = sender.seal(Message::data(packet.clone())).unwrap();
        assert!(datagram.len() < packet.len());
        assert_eq!(receiver.open(&datagram).unwrap().payload().as_ref(), &packet[..]);
    }

    #[tokio::test]
    async fn test_largest_packet_survives_udp() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = UdpTransport::bind(any).await.unwrap();
        let b = UdpTransport::bind(any).await.unwrap();

        let mut codec = codec("default");
        let packet = vec![0xA5u8; MAX_MTU as usize];
        let datagram = codec.seal(Message::data(packet.clone())).unwrap();
        assert_eq!(datagram.len(), MAX_MTU as usize + HEADER_LEN + OVERHEAD);
        a.send_to(&datagram, b.local_addr().unwrap()).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, datagram.len());
        assert_eq!(codec.open(&buf[..n]).unwrap().payload().as_ref(), &packet[..]);
    }

    #[test]
    fn test_empty_datagram() {
        assert!(matches!(codec("default").open(&[]), Err(Error::MalformedFrame(_))));
    }
}
