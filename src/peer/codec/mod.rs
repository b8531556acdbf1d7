//! Framing of the peer wire protocol: `<length: u32 BE><id: u8><payload>`,
//! with a zero length denoting a keep-alive.

pub(crate) mod handshake;
pub(crate) mod message;

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::blockinfo::BlockInfo;
use crate::Bitfield;

pub(crate) use handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING};
pub(crate) use message::{Message, MessageId};

/// An upper bound on a single frame. The largest legitimate frames are
/// block messages (16 KiB and change) and bitfields of very large
/// torrents; anything beyond this is treated as a protocol violation
/// before the buffer balloons.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("non keep-alive has an id") as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index.try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "piece index exceeds u32",
                    )
                })?);
            }
            Message::Bitfield(bitfield) => {
                // NOTE: `bitfield.len()` is the number of _bits_
                let data = bitfield.as_raw_slice();
                buf.put_u32(1 + data.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(data);
            }
            Message::Request(block) => {
                encode_block_info(buf, MessageId::Request, &block)?;
            }
            Message::Cancel(block) => {
                encode_block_info(buf, MessageId::Cancel, &block)?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 4 + 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index.try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "piece index exceeds u32",
                    )
                })?);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(1 + 1 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

fn encode_block_info(
    buf: &mut BytesMut,
    id: MessageId,
    block: &BlockInfo,
) -> io::Result<()> {
    buf.put_u32(1 + 4 + 4 + 4);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index.try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "piece index exceeds u32")
    })?);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
    Ok(())
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek the length prefix without consuming it: the rest of the
        // frame may not have arrived yet
        let mut peek = &buf[..];
        let frame_len = peek.get_u32();
        if frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds maximum length",
            ));
        }
        if frame_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if (buf.len() as u64) < 4 + frame_len as u64 {
            // reserve so the remainder of the frame fits without
            // reallocation as it trickles in
            buf.reserve(4 + frame_len as usize - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        let id = buf.get_u8();
        let payload_len = (frame_len - 1) as usize;
        let id = MessageId::try_from(id).map_err(|id| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message id {id}"),
            )
        })?;

        let expect_len = |expected: usize| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message length does not match its type",
                ))
            }
        };

        let msg = match id {
            MessageId::Choke => {
                expect_len(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_len(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_len(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_len(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_len(4)?;
                Message::Have {
                    piece_index: buf.get_u32() as usize,
                }
            }
            MessageId::Bitfield => {
                let mut data = vec![0u8; payload_len];
                buf.copy_to_slice(&mut data);
                Message::Bitfield(Bitfield::from_vec(data))
            }
            MessageId::Request => {
                expect_len(12)?;
                Message::Request(decode_block_info(buf))
            }
            MessageId::Cancel => {
                expect_len(12)?;
                Message::Cancel(decode_block_info(buf))
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "block message too short",
                    ));
                }
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let mut data = vec![0u8; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data: data.into(),
                }
            }
            MessageId::Extended => {
                if payload_len < 1 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "extended message without sub-id",
                    ));
                }
                let id = buf.get_u8();
                let mut payload = vec![0u8; payload_len - 1];
                buf.copy_to_slice(&mut payload);
                Message::Extended { id, payload }
            }
        };
        Ok(Some(msg))
    }
}

fn decode_block_info(buf: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: buf.get_u32() as usize,
        offset: buf.get_u32(),
        len: buf.get_u32(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;
    use crate::BLOCK_LEN;

    /// Tests a stream of arbitrary messages to ensure that not only do
    /// they encode and then decode correctly (like the individual test
    /// cases ascertain), but that the buffer cursor is properly advanced
    /// by the codec implementation in both cases.
    #[test]
    fn test_message_stream() {
        let (handshake, encoded_handshake) = make_handshake();
        let msgs = [
            make_choke(),
            make_unchoke(),
            make_keep_alive(),
            make_interested(),
            make_not_interested(),
            make_bitfield(),
            make_have(),
            make_request(),
            make_block(),
            make_block(),
            make_keep_alive(),
            make_extended(),
            make_interested(),
            make_cancel(),
            make_block(),
            make_not_interested(),
            make_choke(),
            make_choke(),
        ];

        // create a byte stream of all above messages
        let msgs_len =
            msgs.iter().fold(0, |acc, (_, encoded)| acc + encoded.len());
        let mut read_buf = BytesMut::with_capacity(msgs_len);
        read_buf.extend_from_slice(&encoded_handshake);
        for (_, encoded) in &msgs {
            read_buf.extend_from_slice(encoded);
        }

        // decode messages one by one from the byte stream in the same
        // order as they were encoded, starting with the handshake
        let decoded_handshake =
            HandshakeCodec.decode(&mut read_buf).unwrap();
        assert_eq!(decoded_handshake, Some(handshake));
        for (msg, _) in &msgs {
            let decoded_msg = PeerCodec.decode(&mut read_buf).unwrap();
            assert_eq!(decoded_msg.unwrap(), *msg);
        }
    }

    /// Simulates a closer to real world use case than `test_message_stream`
    /// by progressively loading up the codec's read buffer with the encoded
    /// message bytes, asserting that messages are decoded correctly even if
    /// their bytes arrive in different chunks.
    ///
    /// This is a regression test in that there used to be a bug that failed
    /// to parse block messages (the largest message type) if the full
    /// message couldn't be received in one go.
    #[test]
    fn test_chunked_message_stream() {
        let mut read_buf = BytesMut::new();

        // start with the handshake by adding only the first half of it
        let (handshake, encoded_handshake) = make_handshake();
        let handshake_split_pos = encoded_handshake.len() / 2;
        read_buf
            .extend_from_slice(&encoded_handshake[0..handshake_split_pos]);

        // can't decode the handshake without the full message
        assert!(HandshakeCodec.decode(&mut read_buf).unwrap().is_none());

        // the handshake should decode with the second half added
        read_buf
            .extend_from_slice(&encoded_handshake[handshake_split_pos..]);
        let decoded_handshake =
            HandshakeCodec.decode(&mut read_buf).unwrap();
        assert_eq!(decoded_handshake, Some(handshake));

        let msgs = [
            make_choke(),
            make_unchoke(),
            make_interested(),
            make_not_interested(),
            make_bitfield(),
            make_have(),
            make_request(),
            make_block(),
            make_block(),
            make_extended(),
            make_interested(),
            make_cancel(),
            make_block(),
            make_not_interested(),
            make_choke(),
            make_choke(),
        ];

        // do the same procedure as with the handshake for each message:
        // add the first half, fail to decode, add the second half, decode
        for (msg, encoded) in &msgs {
            let split_pos = encoded.len() / 2;
            read_buf.extend_from_slice(&encoded[0..split_pos]);
            assert!(PeerCodec.decode(&mut read_buf).unwrap().is_none());
            read_buf.extend_from_slice(&encoded[split_pos..]);
            let decoded_msg = PeerCodec.decode(&mut read_buf).unwrap();
            assert_eq!(decoded_msg.unwrap(), *msg);
        }
    }

    /// Tests the encoding and subsequent decoding of a valid handshake.
    #[test]
    fn test_handshake_codec() {
        let (handshake, expected_encoded) = make_handshake();

        let mut encoded = BytesMut::with_capacity(expected_encoded.len());
        HandshakeCodec.encode(handshake, &mut encoded).unwrap();
        assert_eq!(encoded, expected_encoded);

        // don't decode a partial handshake
        let mut partial_encoded = encoded[0..30].into();
        let decoded = HandshakeCodec.decode(&mut partial_encoded).unwrap();
        assert_eq!(decoded, None);

        let decoded = HandshakeCodec.decode(&mut encoded).unwrap();
        assert_eq!(decoded, Some(handshake));
    }

    /// Tests that decoding an invalid handshake results in an error.
    #[test]
    fn test_invalid_handshake_decoding() {
        let mut invalid_encoded = {
            let prot = "not the BitTorrent protocol";
            // these buffer values don't matter here as we're only
            // expecting invalid encodings
            let reserved = [0; 8];
            let info_hash = [0; 20];
            let peer_id = [0; 20];

            let buf_len = prot.len() + 49;
            let mut buf = BytesMut::with_capacity(buf_len);
            let prot_len = prot.len() as u8;
            buf.put_u8(prot_len);
            buf.extend_from_slice(prot.as_bytes());
            buf.extend_from_slice(&reserved);
            buf.extend_from_slice(&info_hash);
            buf.extend_from_slice(&peer_id);
            buf
        };
        let result = HandshakeCodec.decode(&mut invalid_encoded);
        assert!(result.is_err());
    }

    #[test]
    fn test_handshake_reserved_bits() {
        let hs = Handshake::new([0; 20], [0; 20], true, true);
        assert!(hs.supports_extensions());
        assert!(hs.supports_dht());
        assert!(hs.supports_fast());

        let hs = Handshake::new([0; 20], [0; 20], false, false);
        assert!(hs.supports_extensions());
        assert!(!hs.supports_dht());
        assert!(!hs.supports_fast());
    }

    #[test]
    fn test_reject_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_reject_mismatched_length() {
        // a HAVE message with a 2-byte payload
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(42);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_reject_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(MessageId::Bitfield as u8);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    /// Returns a `Handshake` and its expected encoded variant.
    fn make_handshake() -> (Handshake, Bytes) {
        let handshake = Handshake::new(
            *b"da39a3ee5e6b4b0d3255",
            *b"RT00-abcdefgh1234567",
            true,
            false,
        );

        let encoded = {
            let mut buf = Vec::with_capacity(68);
            buf.push(19u8);
            buf.extend_from_slice(PROTOCOL_STRING.as_bytes());
            buf.extend_from_slice(&handshake.reserved);
            buf.extend_from_slice(&handshake.info_hash);
            buf.extend_from_slice(&handshake.peer_id);
            buf
        };
        assert_eq!(encoded.len() as u64, handshake.len());

        (handshake, encoded.into())
    }

    #[test]
    fn test_keep_alive_codec() {
        let (msg, expected_encoded) = make_keep_alive();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_choke_codec() {
        let (msg, expected_encoded) = make_choke();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_unchoke_codec() {
        let (msg, expected_encoded) = make_unchoke();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_interested_codec() {
        let (msg, expected_encoded) = make_interested();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_not_interested_codec() {
        let (msg, expected_encoded) = make_not_interested();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_bitfield_codec() {
        let (msg, expected_encoded) = make_bitfield();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_have_codec() {
        let (msg, expected_encoded) = make_have();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_request_codec() {
        let (msg, expected_encoded) = make_request();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_block_codec() {
        let (msg, expected_encoded) = make_block();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_cancel_codec() {
        let (msg, expected_encoded) = make_cancel();
        assert_message_codec(msg, expected_encoded);
    }

    #[test]
    fn test_extended_codec() {
        let (msg, expected_encoded) = make_extended();
        assert_message_codec(msg, expected_encoded);
    }

    /// Asserts that a message encodes and subsequently decodes correctly.
    fn assert_message_codec(msg: Message, expected_encoded: Bytes) {
        let mut encoded = BytesMut::with_capacity(expected_encoded.len());
        PeerCodec.encode(msg.clone(), &mut encoded).unwrap();
        assert_eq!(encoded, expected_encoded);

        // don't decode a partial message
        let mut partial_encoded = encoded[0..encoded.len() - 1].into();
        let decoded = PeerCodec.decode(&mut partial_encoded).unwrap();
        assert_eq!(decoded, None);

        let decoded = PeerCodec.decode(&mut encoded).unwrap();
        assert_eq!(decoded, Some(msg));
    }

    fn make_keep_alive() -> (Message, Bytes) {
        (Message::KeepAlive, Bytes::from_static(&[0; 4]))
    }

    fn make_choke() -> (Message, Bytes) {
        (
            Message::Choke,
            make_empty_msg_encoded_payload(MessageId::Choke),
        )
    }

    fn make_unchoke() -> (Message, Bytes) {
        (
            Message::Unchoke,
            make_empty_msg_encoded_payload(MessageId::Unchoke),
        )
    }

    fn make_interested() -> (Message, Bytes) {
        (
            Message::Interested,
            make_empty_msg_encoded_payload(MessageId::Interested),
        )
    }

    fn make_not_interested() -> (Message, Bytes) {
        (
            Message::NotInterested,
            make_empty_msg_encoded_payload(MessageId::NotInterested),
        )
    }

    /// Helper for the four payloadless messages that share a format.
    fn make_empty_msg_encoded_payload(id: MessageId) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 1);
        buf.put_u32(1);
        buf.put_u8(id as u8);
        buf.into()
    }

    fn make_bitfield() -> (Message, Bytes) {
        let bitfield =
            Bitfield::from_vec(vec![0b1100_1001, 0b1000_0011, 0b1111_1011]);
        let encoded = {
            // 1 byte message id and n byte bitfield
            //
            // NOTE: `bitfield.len()` returns the number of _bits_
            let msg_len = 1 + bitfield.len() / 8;
            let mut buf = BytesMut::with_capacity(4 + msg_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Bitfield as u8);
            buf.extend_from_slice(bitfield.as_raw_slice());
            buf
        };
        let msg = Message::Bitfield(bitfield);
        (msg, encoded.into())
    }

    fn make_have() -> (Message, Bytes) {
        let piece_index = 42;
        let msg = Message::Have { piece_index };
        let encoded = {
            // 1 byte message id and 4 byte piece index
            let msg_len = 1 + 4;
            let mut buf = BytesMut::with_capacity(4 + msg_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Have as u8);
            buf.put_u32(piece_index as u32);
            buf
        };
        (msg, encoded.into())
    }

    fn make_request() -> (Message, Bytes) {
        let piece_index = 42;
        let offset = 0x4000;
        let len = BLOCK_LEN;
        let msg = Message::Request(BlockInfo {
            piece_index,
            offset,
            len,
        });
        let encoded = make_block_info_encoded_msg_payload(
            MessageId::Request,
            piece_index,
            offset,
            len,
        );
        (msg, encoded)
    }

    fn make_block() -> (Message, Bytes) {
        let piece_index = 42;
        let offset = 0x4000;
        let data = vec![0xa5; 0x4000];
        let encoded = {
            // 1 byte message id, 4 byte piece index, 4 byte offset and
            // n byte block
            let msg_len = 1 + 4 + 4 + data.len();
            let mut buf = BytesMut::with_capacity(4 + msg_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Block as u8);
            buf.put_u32(piece_index as u32);
            buf.put_u32(offset);
            buf.extend_from_slice(&data);
            buf
        };
        let msg = Message::Block {
            piece_index,
            offset,
            data: data.into(),
        };
        (msg, encoded.into())
    }

    fn make_cancel() -> (Message, Bytes) {
        let piece_index = 42;
        let offset = 0x4000;
        let len = BLOCK_LEN;
        let msg = Message::Cancel(BlockInfo {
            piece_index,
            offset,
            len,
        });
        let encoded = make_block_info_encoded_msg_payload(
            MessageId::Cancel,
            piece_index,
            offset,
            len,
        );
        (msg, encoded)
    }

    fn make_extended() -> (Message, Bytes) {
        let payload = b"d1:md11:ut_metadatai1eee".to_vec();
        let msg = Message::Extended {
            id: 0,
            payload: payload.clone(),
        };
        let encoded = {
            let msg_len = 1 + 1 + payload.len();
            let mut buf = BytesMut::with_capacity(4 + msg_len);
            buf.put_u32(msg_len as u32);
            buf.put_u8(MessageId::Extended as u8);
            buf.put_u8(0);
            buf.extend_from_slice(&payload);
            buf
        };
        (msg, encoded.into())
    }

    /// Helper for the 'request' and 'cancel' messages that share a format.
    fn make_block_info_encoded_msg_payload(
        id: MessageId,
        piece_index: usize,
        offset: u32,
        len: u32,
    ) -> Bytes {
        // 1 byte message id, 4 byte piece index, 4 byte offset, 4 byte
        // length
        let msg_len = 1 + 4 + 4 + 4;
        let mut buf = BytesMut::with_capacity(4 + msg_len as usize);
        buf.put_u32(msg_len);
        buf.put_u8(id as u8);
        buf.put_u32(piece_index as u32);
        buf.put_u32(offset);
        buf.put_u32(len);
        buf.into()
    }
}
