//! KRPC: the bencoded query/response/error messages the DHT speaks over
//! UDP (BEP 5), plus the node id arithmetic and compact encodings.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Buf;
use rand::Rng;

use crate::bencode::{self, Value};
use crate::error::dht::{DhtError, Result};
use crate::Sha1Hash;

/// A 160-bit Kademlia node id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// The XOR distance metric.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl From<Sha1Hash> for NodeId {
    fn from(hash: Sha1Hash) -> Self {
        Self(hash)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

/// An XOR distance between two ids; orders lexicographically, which is
/// numerically correct for big-endian byte strings.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 20]);

impl Distance {
    /// The index of the highest set bit, i.e. `floor(log2(distance))`;
    /// `None` for the zero distance. This is the routing table bucket
    /// index.
    pub fn bucket_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((19 - i) * 8 + bit);
            }
        }
        None
    }
}

/// A node's contact information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// The queries a node can send or serve.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: Sha1Hash,
    },
    AnnouncePeer {
        info_hash: Sha1Hash,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

impl Query {
    fn method(&self) -> &'static [u8] {
        match self {
            Self::Ping => b"ping",
            Self::FindNode { .. } => b"find_node",
            Self::GetPeers { .. } => b"get_peers",
            Self::AnnouncePeer { .. } => b"announce_peer",
        }
    }
}

/// The `r` dictionary of a response, flattened to the fields we use.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseBody {
    pub id: Option<NodeId>,
    /// Compact node list from `find_node`/`get_peers`.
    pub nodes: Vec<NodeInfo>,
    /// Peer addresses from `get_peers`.
    pub values: Vec<SocketAddr>,
    /// The write token `get_peers` hands out for a later announce.
    pub token: Option<Vec<u8>>,
}

/// A decoded KRPC message.
#[derive(Clone, Debug, PartialEq)]
pub enum KrpcMessage {
    Query {
        transaction_id: Vec<u8>,
        id: NodeId,
        query: Query,
    },
    Response {
        transaction_id: Vec<u8>,
        body: ResponseBody,
    },
    Error {
        transaction_id: Vec<u8>,
        code: i64,
        message: String,
    },
}

/// Generates a fresh 2-byte transaction id.
pub fn new_transaction_id() -> Vec<u8> {
    let mut tid = vec![0u8; 2];
    rand::thread_rng().fill(tid.as_mut_slice());
    tid
}

/// Encodes a query message.
pub fn encode_query(
    transaction_id: &[u8],
    own_id: &NodeId,
    query: &Query,
) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(b"id".to_vec(), Value::Bytes(own_id.0.to_vec()));
    match query {
        Query::Ping => {}
        Query::FindNode { target } => {
            args.insert(b"target".to_vec(), Value::Bytes(target.0.to_vec()));
        }
        Query::GetPeers { info_hash } => {
            args.insert(
                b"info_hash".to_vec(),
                Value::Bytes(info_hash.to_vec()),
            );
        }
        Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        } => {
            args.insert(
                b"info_hash".to_vec(),
                Value::Bytes(info_hash.to_vec()),
            );
            args.insert(b"port".to_vec(), Value::Int(*port as i64));
            args.insert(b"token".to_vec(), Value::Bytes(token.clone()));
            args.insert(
                b"implied_port".to_vec(),
                Value::Int(*implied_port as i64),
            );
        }
    }

    let mut root = BTreeMap::new();
    root.insert(b"t".to_vec(), Value::Bytes(transaction_id.to_vec()));
    root.insert(b"y".to_vec(), Value::from("q"));
    root.insert(
        b"q".to_vec(),
        Value::Bytes(query.method().to_vec()),
    );
    root.insert(b"a".to_vec(), Value::Dict(args));
    Value::Dict(root).encode()
}

/// Encodes a response to a served query.
pub fn encode_response(
    transaction_id: &[u8],
    own_id: &NodeId,
    nodes: &[NodeInfo],
    values: &[SocketAddr],
    token: Option<&[u8]>,
) -> Vec<u8> {
    let mut body = BTreeMap::new();
    body.insert(b"id".to_vec(), Value::Bytes(own_id.0.to_vec()));
    if !nodes.is_empty() {
        body.insert(
            b"nodes".to_vec(),
            Value::Bytes(encode_compact_nodes(nodes)),
        );
    }
    if !values.is_empty() {
        body.insert(
            b"values".to_vec(),
            Value::List(
                values
                    .iter()
                    .map(|peer| Value::Bytes(encode_compact_peer(peer)))
                    .collect(),
            ),
        );
    }
    if let Some(token) = token {
        body.insert(b"token".to_vec(), Value::Bytes(token.to_vec()));
    }

    let mut root = BTreeMap::new();
    root.insert(b"t".to_vec(), Value::Bytes(transaction_id.to_vec()));
    root.insert(b"y".to_vec(), Value::from("r"));
    root.insert(b"r".to_vec(), Value::Dict(body));
    Value::Dict(root).encode()
}

/// Encodes a KRPC error message.
pub fn encode_error(
    transaction_id: &[u8],
    code: i64,
    message: &str,
) -> Vec<u8> {
    let mut root = BTreeMap::new();
    root.insert(b"t".to_vec(), Value::Bytes(transaction_id.to_vec()));
    root.insert(b"y".to_vec(), Value::from("e"));
    root.insert(
        b"e".to_vec(),
        Value::List(vec![Value::Int(code), Value::from(message)]),
    );
    Value::Dict(root).encode()
}

/// Decodes any KRPC packet.
pub fn decode(buf: &[u8]) -> Result<KrpcMessage> {
    let root = bencode::decode(buf)?;
    let transaction_id = root
        .lookup(b"t")
        .and_then(Value::as_bytes)
        .ok_or(DhtError::Krpc("missing transaction id"))?
        .to_vec();
    let kind = root
        .lookup(b"y")
        .and_then(Value::as_bytes)
        .ok_or(DhtError::Krpc("missing message kind"))?;

    match kind {
        b"q" => {
            let method = root
                .lookup(b"q")
                .and_then(Value::as_bytes)
                .ok_or(DhtError::Krpc("query without method"))?;
            let args = root
                .lookup(b"a")
                .ok_or(DhtError::Krpc("query without args"))?;
            let id = args
                .lookup(b"id")
                .and_then(Value::as_bytes)
                .and_then(NodeId::from_slice)
                .ok_or(DhtError::Krpc("query without node id"))?;

            let query = match method {
                b"ping" => Query::Ping,
                b"find_node" => Query::FindNode {
                    target: args
                        .lookup(b"target")
                        .and_then(Value::as_bytes)
                        .and_then(NodeId::from_slice)
                        .ok_or(DhtError::Krpc("find_node without target"))?,
                },
                b"get_peers" => Query::GetPeers {
                    info_hash: args
                        .lookup(b"info_hash")
                        .and_then(Value::as_bytes)
                        .and_then(|b| b.try_into().ok())
                        .ok_or(DhtError::Krpc(
                            "get_peers without info hash",
                        ))?,
                },
                b"announce_peer" => Query::AnnouncePeer {
                    info_hash: args
                        .lookup(b"info_hash")
                        .and_then(Value::as_bytes)
                        .and_then(|b| b.try_into().ok())
                        .ok_or(DhtError::Krpc(
                            "announce_peer without info hash",
                        ))?,
                    port: args
                        .lookup(b"port")
                        .and_then(Value::as_int)
                        .filter(|p| (0..=u16::MAX as i64).contains(p))
                        .unwrap_or(0) as u16,
                    token: args
                        .lookup(b"token")
                        .and_then(Value::as_bytes)
                        .ok_or(DhtError::Krpc(
                            "announce_peer without token",
                        ))?
                        .to_vec(),
                    implied_port: args
                        .lookup(b"implied_port")
                        .and_then(Value::as_int)
                        == Some(1),
                },
                _ => return Err(DhtError::Krpc("unknown query method")),
            };
            Ok(KrpcMessage::Query {
                transaction_id,
                id,
                query,
            })
        }
        b"r" => {
            let body = root
                .lookup(b"r")
                .ok_or(DhtError::Krpc("response without body"))?;
            Ok(KrpcMessage::Response {
                transaction_id,
                body: ResponseBody {
                    id: body
                        .lookup(b"id")
                        .and_then(Value::as_bytes)
                        .and_then(NodeId::from_slice),
                    nodes: body
                        .lookup(b"nodes")
                        .and_then(Value::as_bytes)
                        .map(decode_compact_nodes)
                        .unwrap_or_default(),
                    values: body
                        .lookup(b"values")
                        .and_then(Value::as_list)
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(Value::as_bytes)
                                .filter_map(decode_compact_peer)
                                .collect()
                        })
                        .unwrap_or_default(),
                    token: body
                        .lookup(b"token")
                        .and_then(Value::as_bytes)
                        .map(<[u8]>::to_vec),
                },
            })
        }
        b"e" => {
            let list = root
                .lookup(b"e")
                .and_then(Value::as_list)
                .ok_or(DhtError::Krpc("error without detail list"))?;
            Ok(KrpcMessage::Error {
                transaction_id,
                code: list.first().and_then(Value::as_int).unwrap_or(201),
                message: list
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
            })
        }
        _ => Err(DhtError::Krpc("unknown message kind")),
    }
}

/// Compact node info: 20 byte id, 4 byte IPv4, 2 byte port, per node.
pub fn encode_compact_nodes(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let SocketAddr::V4(addr) = node.addr {
            buf.extend_from_slice(&node.id.0);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

pub fn decode_compact_nodes(mut buf: &[u8]) -> Vec<NodeInfo> {
    let mut nodes = Vec::with_capacity(buf.len() / 26);
    while buf.len() >= 26 {
        let id = NodeId::from_slice(&buf[..20]).expect("20 byte slice");
        buf.advance(20);
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        nodes.push(NodeInfo {
            id,
            addr: SocketAddr::new(IpAddr::V4(ip), port),
        });
    }
    nodes
}

fn encode_compact_peer(peer: &SocketAddr) -> Vec<u8> {
    match peer {
        SocketAddr::V4(addr) => {
            let mut buf = Vec::with_capacity(6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
            buf
        }
        SocketAddr::V6(_) => Vec::new(),
    }
}

fn decode_compact_peer(mut buf: &[u8]) -> Option<SocketAddr> {
    if buf.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::from(buf.get_u32());
    let port = buf.get_u16();
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_distance_and_bucket_index() {
        let a = NodeId([0u8; 20]);
        let mut b = [0u8; 20];
        b[0] = 0x80;
        let b = NodeId(b);
        // the top bit differs: the farthest bucket
        assert_eq!(a.distance(&b).bucket_index(), Some(159));
        // identical ids have no bucket
        assert_eq!(a.distance(&a).bucket_index(), None);

        let mut c = [0u8; 20];
        c[19] = 0x01;
        let c = NodeId(c);
        assert_eq!(a.distance(&c).bucket_index(), Some(0));

        // the distance orders lexicographically
        assert!(a.distance(&c) < a.distance(&b));
    }

    #[test]
    fn test_query_round_trips() {
        let own_id = NodeId([7u8; 20]);
        let tid = b"aa".to_vec();
        for query in [
            Query::Ping,
            Query::FindNode {
                target: NodeId([1u8; 20]),
            },
            Query::GetPeers {
                info_hash: [2u8; 20],
            },
            Query::AnnouncePeer {
                info_hash: [2u8; 20],
                port: 6881,
                token: b"tok".to_vec(),
                implied_port: false,
            },
        ] {
            let encoded = encode_query(&tid, &own_id, &query);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(
                decoded,
                KrpcMessage::Query {
                    transaction_id: tid.clone(),
                    id: own_id,
                    query: query.clone(),
                }
            );
        }
    }

    #[test]
    fn test_response_round_trip() {
        let own_id = NodeId([9u8; 20]);
        let nodes = vec![NodeInfo {
            id: NodeId([1u8; 20]),
            addr: "10.0.0.1:6881".parse().unwrap(),
        }];
        let values: Vec<SocketAddr> =
            vec!["10.0.0.2:51413".parse().unwrap()];
        let encoded = encode_response(
            b"xy",
            &own_id,
            &nodes,
            &values,
            Some(b"token"),
        );
        let decoded = decode(&encoded).unwrap();
        match decoded {
            KrpcMessage::Response {
                transaction_id,
                body,
            } => {
                assert_eq!(transaction_id, b"xy".to_vec());
                assert_eq!(body.id, Some(own_id));
                assert_eq!(body.nodes, nodes);
                assert_eq!(body.values, values);
                assert_eq!(body.token, Some(b"token".to_vec()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_error_round_trip() {
        let encoded = encode_error(b"zz", 203, "protocol error");
        let decoded = decode(&encoded).unwrap();
        assert_eq!(
            decoded,
            KrpcMessage::Error {
                transaction_id: b"zz".to_vec(),
                code: 203,
                message: "protocol error".into(),
            }
        );
    }

    #[test]
    fn test_reject_malformed_packets() {
        assert!(decode(b"garbage").is_err());
        // bencode but not krpc
        assert!(decode(b"d1:xi1ee").is_err());
        // a query without args
        assert!(decode(b"d1:q4:ping1:t2:aa1:y1:qe").is_err());
    }
}
