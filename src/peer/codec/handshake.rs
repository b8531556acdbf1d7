//! The fixed 68-byte BitTorrent handshake and its codec.

use std::io::{self, Cursor};

use bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The message sent at the beginning of a peer session by both sides of
/// the connection.
///
/// Handshake data format:
///
/// ```txt
/// <prot len><protocol string><reserved><info_hash><peer_id>
/// | 1 byte  |   19 bytes    | 8 bytes | 20 bytes | 20 bytes |
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connection is aborted.
    pub prot: [u8; 19],
    /// Reserved bytes in which the client's supported extensions are
    /// announced bitwise.
    pub reserved: [u8; 8],
    /// The torrent's info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually identifying the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a handshake advertising our own capabilities: the extension
    /// protocol (BEP 10) always, the DHT and fast-extension bits when
    /// asked.
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        dht: bool,
        fast: bool,
    ) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0u8; 8];
        // bit 20 counted from the least significant bit of the 64-bit
        // reserved field: byte 5, 0x10
        reserved[5] |= 0x10;
        if dht {
            reserved[7] |= 0x01;
        }
        if fast {
            reserved[7] |= 0x04;
        }
        Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote supports the extension protocol (BEP 10).
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    /// Whether the remote advertises a DHT node (BEP 5).
    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 0x01 != 0
    }

    /// Whether the remote supports the fast extension (BEP 6).
    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }

    /// Returns the length of the encoded handshake, in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> u64 {
        1 + 19 + 8 + 20 + 20
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut bytes::BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        // protocol length prefix
        debug_assert_eq!(prot.len(), 19);
        buf.put_u8(prot.len() as u8);
        // we should only be sending the BitTorrent protocol string
        debug_assert_eq!(prot, PROTOCOL_STRING.as_bytes());

        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut bytes::BytesMut,
    ) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the protocol string length without advancing the buffer
        // cursor, as the full message may not have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                r#"handshake must start with "BitTorrent protocol""#,
            ));
        }

        // check that the full payload arrived; the length prefix byte is
        // extra on top of the payload
        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() > payload_len {
            buf.advance(1);
        } else {
            return Ok(None);
        }

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                r#"handshake must carry "BitTorrent protocol""#,
            ));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}
