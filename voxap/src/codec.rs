//! # AP packet framing
//!
//! Every packet on the AP channel is `[cmd:1][len_be:2][payload][mac:4]`,
//! with the header and payload encrypted by the Shannon cipher and the MAC
//! produced by the same cipher pass. Each direction keeps its own cipher and
//! a packet counter used as the per-packet nonce; counters start at zero
//! right after the handshake and are never reset.
//!
//! Decoding is a two-phase state machine (header, then payload+MAC). A
//! nonce is only consumed once the full header has been decrypted, so
//! partial reads can never desynchronize the channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::ApError,
    shannon::{Shannon, ShannonError, MAC_LEN},
};

/// Size of the cleartext packet header.
const HEADER_LEN: usize = 3;

/// One framed AP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApPacket {
    pub cmd: u8,
    pub payload: Bytes,
}

impl ApPacket {
    pub fn new(cmd: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            payload: payload.into(),
        }
    }
}

#[derive(Clone, Copy)]
enum DecodeState {
    Header,
    Payload { cmd: u8, len: usize },
}

/// Encrypting codec for the framed AP channel.
pub struct ApCodec {
    encode_cipher: Shannon,
    encode_nonce: u32,
    decode_cipher: Shannon,
    decode_nonce: u32,
    state: DecodeState,
}

impl ApCodec {
    /// Builds a codec from the two direction keys derived by the handshake.
    pub fn new(send_key: &[u8], recv_key: &[u8]) -> Result<Self, ShannonError> {
        Ok(Self {
            encode_cipher: Shannon::new(send_key)?,
            encode_nonce: 0,
            decode_cipher: Shannon::new(recv_key)?,
            decode_nonce: 0,
            state: DecodeState::Header,
        })
    }

    /// Packets sent so far.
    pub fn send_count(&self) -> u32 {
        self.encode_nonce
    }

    /// Packets fully received so far.
    pub fn recv_count(&self) -> u32 {
        self.decode_nonce
    }
}

impl Encoder<ApPacket> for ApCodec {
    type Error = ApError;

    fn encode(&mut self, item: ApPacket, dst: &mut BytesMut) -> Result<(), ApError> {
        let len = item.payload.len();
        if len > u16::MAX as usize {
            return Err(ApError::MalformedFrame(format!(
                "payload too large: {len} bytes"
            )));
        }

        let start = dst.len();
        dst.reserve(HEADER_LEN + len + MAC_LEN);
        dst.put_u8(item.cmd);
        dst.put_u16(len as u16);
        dst.put_slice(&item.payload);

        self.encode_cipher.nonce_u32(self.encode_nonce);
        self.encode_nonce = self.encode_nonce.wrapping_add(1);
        self.encode_cipher.encrypt(&mut dst[start..]);

        let mut mac = [0u8; MAC_LEN];
        self.encode_cipher.finish(&mut mac);
        dst.put_slice(&mac);

        Ok(())
    }
}

impl Decoder for ApCodec {
    type Item = ApPacket;
    type Error = ApError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ApPacket>, ApError> {
        if let DecodeState::Header = self.state {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&src[..HEADER_LEN]);

            self.decode_cipher.nonce_u32(self.decode_nonce);
            self.decode_nonce = self.decode_nonce.wrapping_add(1);
            self.decode_cipher.decrypt(&mut header);

            let cmd = header[0];
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            src.advance(HEADER_LEN);
            self.state = DecodeState::Payload { cmd, len };
        }

        if let DecodeState::Payload { cmd, len } = self.state {
            if src.len() < len + MAC_LEN {
                return Ok(None);
            }

            let mut payload = vec![0u8; len];
            payload.copy_from_slice(&src[..len]);
            self.decode_cipher.decrypt(&mut payload);

            let mut mac = [0u8; MAC_LEN];
            mac.copy_from_slice(&src[len..len + MAC_LEN]);
            self.decode_cipher
                .check_mac(&mac)
                .map_err(|_| ApError::MacFailure)?;

            src.advance(len + MAC_LEN);
            self.state = DecodeState::Header;
            return Ok(Some(ApPacket {
                cmd,
                payload: Bytes::from(payload),
            }));
        }

        unreachable!("decode state handled above")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_pair() -> (Vec<u8>, Vec<u8>) {
        let send: Vec<u8> = (0u8..32).map(|i| i.wrapping_mul(7)).collect();
        let recv: Vec<u8> = (0u8..32).map(|i| i.wrapping_mul(7).wrapping_add(1)).collect();
        (send, recv)
    }

    fn codec_pair() -> (ApCodec, ApCodec) {
        let (send, recv) = key_pair();
        let client = ApCodec::new(&send, &recv).unwrap();
        let server = ApCodec::new(&recv, &send).unwrap();
        (client, server)
    }

    #[test]
    fn packet_stream_round_trip() {
        let (mut client, mut server) = codec_pair();

        let mut big = vec![0u8; 256];
        for (i, b) in big.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(5);
        }
        let packets = vec![
            ApPacket::new(0xAB, vec![0x01, 0x02, 0x03]),
            ApPacket::new(0x04, Vec::new()),
            ApPacket::new(0xFF, big),
        ];

        let mut wire = BytesMut::new();
        for p in &packets {
            client.encode(p.clone(), &mut wire).unwrap();
        }
        assert_eq!(client.send_count(), packets.len() as u32);

        for expected in &packets {
            let wire_len = 3 + expected.payload.len() + 4;
            let before = wire.len();
            let decoded = server.decode(&mut wire).unwrap().unwrap();
            assert_eq!(&decoded, expected);
            assert_eq!(before - wire.len(), wire_len);
        }
        assert!(wire.is_empty());
        assert_eq!(server.recv_count(), packets.len() as u32);
    }

    #[test]
    fn tampered_byte_fails_mac() {
        let (mut client, mut server) = codec_pair();

        let mut wire = BytesMut::new();
        client
            .encode(ApPacket::new(0xAB, vec![0x01, 0x02, 0x03]), &mut wire)
            .unwrap();
        client.encode(ApPacket::new(0x04, Vec::new()), &mut wire).unwrap();

        // First packet is intact.
        server.decode(&mut wire).unwrap().unwrap();

        // Flip byte index 5 of the second encoded packet (within its MAC).
        wire[5] ^= 0x01;
        assert!(matches!(
            server.decode(&mut wire),
            Err(ApError::MacFailure)
        ));
    }

    #[test]
    fn partial_reads_do_not_desync() {
        let (mut client, mut server) = codec_pair();

        let mut wire = BytesMut::new();
        client
            .encode(ApPacket::new(0x42, vec![9u8; 10]), &mut wire)
            .unwrap();
        client
            .encode(ApPacket::new(0x43, vec![7u8; 3]), &mut wire)
            .unwrap();

        // Feed the stream two bytes at a time.
        let mut feed = BytesMut::new();
        let mut decoded = Vec::new();
        while !wire.is_empty() || !feed.is_empty() {
            if !wire.is_empty() {
                let take = wire.len().min(2);
                feed.extend_from_slice(&wire.split_to(take));
            }
            while let Some(packet) = server.decode(&mut feed).unwrap() {
                decoded.push(packet);
            }
        }

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].cmd, 0x42);
        assert_eq!(decoded[1].cmd, 0x43);
        assert_eq!(server.recv_count(), 2);
    }
}
