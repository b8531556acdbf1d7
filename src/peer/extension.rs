//! The extension protocol (BEP 10) and the two sub-protocols the engine
//! speaks over it: ut_metadata (BEP 9) and ut_pex (BEP 11).
//!
//! Sub-protocol ids are peer-assigned: each side advertises its own
//! mapping in the extension handshake and must address the peer with the
//! peer's ids, never its own. Unknown sub-ids are ignored.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Buf;

use crate::bencode::{self, Value};
use crate::error::peer::Violation;

/// Our locally assigned sub-id for ut_metadata.
pub(crate) const OUR_UT_METADATA_ID: u8 = 1;
/// Our locally assigned sub-id for ut_pex.
pub(crate) const OUR_UT_PEX_ID: u8 = 2;

/// The client name+version we advertise in the extension handshake.
const CLIENT_VERSION: &str = "riptide 0.1.0";

/// The decoded extension handshake (sub-id 0).
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ExtensionHandshake {
    /// The peer's sub-id for ut_metadata, when it supports it.
    pub ut_metadata: Option<u8>,
    /// The peer's sub-id for ut_pex, when it supports it.
    pub ut_pex: Option<u8>,
    /// The info-dictionary size in bytes, advertised by ut_metadata
    /// speakers that already have the metadata.
    pub metadata_size: Option<u64>,
    /// The peer's advertised client name and version.
    pub client: Option<String>,
    /// The peer's maximum request queue length.
    pub request_queue_len: Option<u64>,
}

impl ExtensionHandshake {
    /// Builds our own handshake. `metadata_size` is included once we hold
    /// the full info dictionary.
    pub fn own(metadata_size: Option<u64>) -> Self {
        Self {
            ut_metadata: Some(OUR_UT_METADATA_ID),
            ut_pex: Some(OUR_UT_PEX_ID),
            metadata_size,
            client: Some(CLIENT_VERSION.to_owned()),
            request_queue_len: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = BTreeMap::new();
        if let Some(id) = self.ut_metadata {
            m.insert(b"ut_metadata".to_vec(), Value::Int(id as i64));
        }
        if let Some(id) = self.ut_pex {
            m.insert(b"ut_pex".to_vec(), Value::Int(id as i64));
        }

        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(
                b"metadata_size".to_vec(),
                Value::Int(size as i64),
            );
        }
        if let Some(client) = &self.client {
            dict.insert(b"v".to_vec(), Value::from(client.as_str()));
        }
        Value::Dict(dict).encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Violation> {
        let root = bencode::decode(payload)
            .map_err(|_| Violation::InvalidExtensionMessage)?;
        if root.as_dict().is_none() {
            return Err(Violation::InvalidExtensionMessage);
        }

        let sub_id = |name: &[u8]| {
            root.lookup(b"m")
                .and_then(|m| m.lookup(name))
                .and_then(Value::as_int)
                // a zero id means "recently disabled" per BEP 10
                .filter(|id| (1..=u8::MAX as i64).contains(id))
                .map(|id| id as u8)
        };

        Ok(Self {
            ut_metadata: sub_id(b"ut_metadata"),
            ut_pex: sub_id(b"ut_pex"),
            metadata_size: root
                .lookup(b"metadata_size")
                .and_then(Value::as_int)
                .filter(|size| *size >= 0)
                .map(|size| size as u64),
            client: root
                .lookup(b"v")
                .and_then(Value::as_str)
                .map(str::to_owned),
            request_queue_len: root
                .lookup(b"reqq")
                .and_then(Value::as_int)
                .filter(|n| *n > 0)
                .map(|n| n as u64),
        })
    }
}

/// A ut_metadata message (BEP 9). The info dictionary travels in 16 KiB
/// pieces appended after the bencoded header.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MetadataMsg {
    Request {
        piece: usize,
    },
    Data {
        piece: usize,
        total_size: u64,
        payload: Vec<u8>,
    },
    Reject {
        piece: usize,
    },
}

impl MetadataMsg {
    const REQUEST: i64 = 0;
    const DATA: i64 = 1;
    const REJECT: i64 = 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        let (msg_type, piece) = match self {
            Self::Request { piece } => (Self::REQUEST, *piece),
            Self::Data {
                piece, total_size, ..
            } => {
                dict.insert(
                    b"total_size".to_vec(),
                    Value::Int(*total_size as i64),
                );
                (Self::DATA, *piece)
            }
            Self::Reject { piece } => (Self::REJECT, *piece),
        };
        dict.insert(b"msg_type".to_vec(), Value::Int(msg_type));
        dict.insert(b"piece".to_vec(), Value::Int(piece as i64));

        let mut buf = Value::Dict(dict).encode();
        if let Self::Data { payload, .. } = self {
            buf.extend_from_slice(payload);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Violation> {
        let (header, consumed) = bencode::decode_prefix(payload)
            .map_err(|_| Violation::InvalidExtensionMessage)?;
        let msg_type = header
            .lookup(b"msg_type")
            .and_then(Value::as_int)
            .ok_or(Violation::InvalidExtensionMessage)?;
        let piece = header
            .lookup(b"piece")
            .and_then(Value::as_int)
            .filter(|p| *p >= 0)
            .ok_or(Violation::InvalidExtensionMessage)?
            as usize;

        match msg_type {
            Self::REQUEST => Ok(Self::Request { piece }),
            Self::DATA => {
                let total_size = header
                    .lookup(b"total_size")
                    .and_then(Value::as_int)
                    .filter(|s| *s >= 0)
                    .ok_or(Violation::InvalidExtensionMessage)?
                    as u64;
                Ok(Self::Data {
                    piece,
                    total_size,
                    payload: payload[consumed..].to_vec(),
                })
            }
            Self::REJECT => Ok(Self::Reject { piece }),
            _ => Err(Violation::InvalidExtensionMessage),
        }
    }
}

/// A ut_pex message (BEP 11): peers learned and lost since the previous
/// message, in the compact 6-byte format. Only IPv4 entries are exchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PexMsg {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"added".to_vec(),
            Value::Bytes(encode_compact_peers(&self.added)),
        );
        // no flags are set for any peer we advertise
        dict.insert(
            b"added.f".to_vec(),
            Value::Bytes(vec![
                0u8;
                self.added
                    .iter()
                    .filter(|a| a.is_ipv4())
                    .count()
            ]),
        );
        dict.insert(
            b"dropped".to_vec(),
            Value::Bytes(encode_compact_peers(&self.dropped)),
        );
        Value::Dict(dict).encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Violation> {
        let root = bencode::decode(payload)
            .map_err(|_| Violation::InvalidExtensionMessage)?;
        let peers = |key: &[u8]| {
            root.lookup(key)
                .and_then(Value::as_bytes)
                .map(decode_compact_peers)
                .transpose()
                .map(Option::unwrap_or_default)
        };
        Ok(Self {
            added: peers(b"added")?,
            dropped: peers(b"dropped")?,
        })
    }
}

/// Encodes IPv4 peers into the compact 6-bytes-per-peer format.
pub(crate) fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let SocketAddr::V4(addr) = peer {
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

/// Decodes the compact peer format; the length must be a multiple of 6.
pub(crate) fn decode_compact_peers(
    mut buf: &[u8],
) -> Result<Vec<SocketAddr>, Violation> {
    if buf.len() % 6 != 0 {
        return Err(Violation::InvalidExtensionMessage);
    }
    let mut peers = Vec::with_capacity(buf.len() / 6);
    while buf.has_remaining() {
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        peers.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_extension_handshake_round_trip() {
        let own = ExtensionHandshake::own(Some(31337));
        let decoded = ExtensionHandshake::decode(&own.encode()).unwrap();
        assert_eq!(decoded.ut_metadata, Some(OUR_UT_METADATA_ID));
        assert_eq!(decoded.ut_pex, Some(OUR_UT_PEX_ID));
        assert_eq!(decoded.metadata_size, Some(31337));
        assert_eq!(decoded.client.as_deref(), Some(CLIENT_VERSION));
    }

    #[test]
    fn test_extension_handshake_unknown_entries_ignored() {
        // a handshake advertising only an unknown sub-protocol
        let payload = b"d1:md6:ut_fooi3eee";
        let decoded = ExtensionHandshake::decode(payload).unwrap();
        assert_eq!(decoded.ut_metadata, None);
        assert_eq!(decoded.ut_pex, None);
    }

    #[test]
    fn test_extension_handshake_zero_id_means_disabled() {
        let payload = b"d1:md11:ut_metadatai0eee";
        let decoded = ExtensionHandshake::decode(payload).unwrap();
        assert_eq!(decoded.ut_metadata, None);
    }

    #[test]
    fn test_metadata_msg_round_trips() {
        for msg in [
            MetadataMsg::Request { piece: 2 },
            MetadataMsg::Reject { piece: 0 },
            MetadataMsg::Data {
                piece: 1,
                total_size: 40000,
                payload: vec![0xab; 100],
            },
        ] {
            assert_eq!(MetadataMsg::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_metadata_data_carries_trailer() {
        let msg = MetadataMsg::Data {
            piece: 0,
            total_size: 3,
            payload: b"abc".to_vec(),
        };
        let encoded = msg.encode();
        // the payload sits after the bencoded header, not inside it
        assert!(encoded.ends_with(b"abc"));
        assert!(encoded.starts_with(b"d"));
    }

    #[test]
    fn test_pex_round_trip() {
        let msg = PexMsg {
            added: vec![
                "10.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:51413".parse().unwrap(),
            ],
            dropped: vec!["192.168.1.9:6881".parse().unwrap()],
        };
        let decoded = PexMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_compact_peers_reject_bad_length() {
        assert!(decode_compact_peers(&[0u8; 7]).is_err());
        assert_eq!(decode_compact_peers(&[]).unwrap(), vec![]);
    }

    #[test]
    fn test_malformed_payloads_are_violations() {
        assert!(ExtensionHandshake::decode(b"not bencode").is_err());
        // unknown msg_type
        assert!(MetadataMsg::decode(b"d8:msg_typei9e5:piecei0ee").is_err());
        // a compact list of the wrong granularity
        assert!(PexMsg::decode(b"d5:added7:1234567e").is_err());
    }
}
