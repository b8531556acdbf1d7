//! The embedded DHT node (BEP 5): one Kademlia instance shared by every
//! non-private torrent in the engine.
//!
//! The node runs as a single task multiplexing all traffic over one UDP
//! socket: it serves incoming queries from its routing table and peer
//! store, and drives any number of concurrent iterative lookups as pure
//! state machines (see [`lookup`]), so no query ever blocks the loop.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::error::EngineResult;
use crate::Sha1Hash;

pub(crate) mod krpc;
pub(crate) mod lookup;
pub(crate) mod routing;

use krpc::{KrpcMessage, NodeId, NodeInfo, Query, ResponseBody};
use lookup::LookupState;
use routing::{RoutingTable, K};

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
type Receiver = mpsc::UnboundedReceiver<Command>;

pub type JoinHandle = task::JoinHandle<EngineResult<()>>;

/// Commands the engine and torrents send the DHT node.
pub(crate) enum Command {
    /// Look up peers for an info hash; optionally announce our listen
    /// port to the closest nodes afterwards.
    GetPeers {
        info_hash: Sha1Hash,
        announce_port: Option<u16>,
        /// Query timeout, adapted by the caller to its swarm health.
        timeout: Duration,
        result_tx: oneshot::Sender<Vec<SocketAddr>>,
    },
    Shutdown,
}

/// How long an issued or received token stays valid.
const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
/// How often the token secret rotates. With one previous secret accepted
/// this gives announcers the full [`TOKEN_TTL`] window.
const SECRET_ROTATION: Duration = Duration::from_secs(5 * 60);
/// Announced peers are served for this long.
const PEER_TTL: Duration = Duration::from_secs(30 * 60);
/// The default timeout for housekeeping queries (pings, refreshes).
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns the DHT node task on the given UDP port.
pub(crate) fn spawn(
    port: u16,
    bootstrap: Vec<String>,
) -> EngineResult<(JoinHandle, Sender)> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let join_handle = task::spawn(async move {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(crate::error::Error::PortBind)?;
        log::info!("DHT node listening on udp port {port}");
        let mut node = Node::new(socket, cmd_rx, bootstrap);
        node.run().await;
        Ok(())
    });
    Ok((join_handle, cmd_tx))
}

struct PendingQuery {
    /// The id we believe the queried node has (a placeholder for
    /// bootstrap contacts whose id we don't know yet).
    node_id: NodeId,
    addr: SocketAddr,
    /// The lookup this query belongs to, if any.
    lookup: Option<u64>,
    sent_at: Instant,
    timeout: Duration,
}

struct ActiveLookup {
    state: LookupState,
    info_hash: Sha1Hash,
    announce_port: Option<u16>,
    timeout: Duration,
    peers_found: Vec<SocketAddr>,
    result_tx: Option<oneshot::Sender<Vec<SocketAddr>>>,
}

struct Node {
    socket: UdpSocket,
    cmd_rx: Receiver,
    table: RoutingTable,
    bootstrap: Vec<String>,
    /// In-flight queries keyed by transaction id.
    pending: HashMap<Vec<u8>, PendingQuery>,
    /// Running iterative lookups keyed by a local id.
    lookups: HashMap<u64, ActiveLookup>,
    next_lookup_id: u64,
    /// Write tokens other nodes gave us: `(node, info_hash) → token`.
    received_tokens: HashMap<(SocketAddr, Sha1Hash), (Vec<u8>, Instant)>,
    /// Peers announced to us, per info hash.
    peer_store: HashMap<Sha1Hash, HashMap<SocketAddr, Instant>>,
    /// The secrets behind the tokens we issue; current and previous.
    secret: [u8; 16],
    prev_secret: [u8; 16],
    secret_rotated_at: Instant,
}

impl Node {
    fn new(
        socket: UdpSocket,
        cmd_rx: Receiver,
        bootstrap: Vec<String>,
    ) -> Self {
        use rand::Rng;
        let mut secret = [0u8; 16];
        rand::thread_rng().fill(&mut secret);
        Self {
            socket,
            cmd_rx,
            table: RoutingTable::new(NodeId::random()),
            bootstrap,
            pending: HashMap::new(),
            lookups: HashMap::new(),
            next_lookup_id: 0,
            received_tokens: HashMap::new(),
            peer_store: HashMap::new(),
            secret,
            prev_secret: secret,
            secret_rotated_at: Instant::now(),
        }
    }

    async fn run(&mut self) {
        self.bootstrap().await;

        let mut buf = vec![0u8; 64 * 1024];
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::GetPeers {
                            info_hash,
                            announce_port,
                            timeout,
                            result_tx,
                        }) => {
                            self.start_lookup(
                                info_hash,
                                announce_port,
                                timeout,
                                result_tx,
                            )
                            .await;
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("DHT node shutting down");
                            return;
                        }
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((n, from)) => {
                            self.handle_packet(&buf[..n], from).await;
                        }
                        Err(e) => {
                            log::warn!("DHT socket error: {e}");
                        }
                    }
                }
                _ = tick.tick() => {
                    self.housekeeping().await;
                }
            }
        }
    }

    /// Seeds an empty routing table from the configured bootstrap hosts.
    async fn bootstrap(&mut self) {
        let own_id = self.table.own_id();
        for host in self.bootstrap.clone() {
            match tokio::net::lookup_host(&host).await {
                Ok(addrs) => {
                    for addr in addrs.filter(|a| a.is_ipv4()) {
                        self.send_query(
                            addr,
                            NodeId::random(),
                            Query::FindNode { target: own_id },
                            None,
                            DEFAULT_QUERY_TIMEOUT,
                        )
                        .await;
                    }
                }
                Err(e) => {
                    log::warn!("DHT bootstrap {host} failed to resolve: {e}")
                }
            }
        }
    }

    /// Sends one query; returns false when the socket refused it, in
    /// which case the caller records the failure.
    async fn send_query(
        &mut self,
        addr: SocketAddr,
        node_id: NodeId,
        query: Query,
        lookup: Option<u64>,
        timeout: Duration,
    ) -> bool {
        let tid = krpc::new_transaction_id();
        let packet = krpc::encode_query(&tid, &self.table.own_id(), &query);
        if let Err(e) = self.socket.send_to(&packet, addr).await {
            log::debug!("DHT send to {addr} failed: {e}");
            return false;
        }
        self.pending.insert(
            tid,
            PendingQuery {
                node_id,
                addr,
                lookup,
                sent_at: Instant::now(),
                timeout,
            },
        );
        true
    }

    async fn start_lookup(
        &mut self,
        info_hash: Sha1Hash,
        announce_port: Option<u16>,
        timeout: Duration,
        result_tx: oneshot::Sender<Vec<SocketAddr>>,
    ) {
        let target = NodeId(info_hash);
        let seeds = self.table.closest(&target, K);
        if seeds.is_empty() {
            log::info!("DHT lookup with empty table; bootstrapping");
            self.bootstrap().await;
        }
        let lookup_id = self.next_lookup_id;
        self.next_lookup_id += 1;
        self.lookups.insert(
            lookup_id,
            ActiveLookup {
                state: LookupState::new(target, seeds),
                info_hash,
                announce_port,
                timeout,
                peers_found: Vec::new(),
                result_tx: Some(result_tx),
            },
        );
        self.drive_lookup(lookup_id).await;
    }

    /// Sends the lookup's next query batch and finishes it when it has
    /// converged. Loops rather than recursing so an unreachable node in
    /// the batch immediately frees its pipeline slot.
    async fn drive_lookup(&mut self, lookup_id: u64) {
        loop {
            let (info_hash, timeout, batch) = {
                let Some(lookup) = self.lookups.get_mut(&lookup_id) else {
                    return;
                };
                (
                    lookup.info_hash,
                    lookup.timeout,
                    lookup.state.next_batch(),
                )
            };
            if batch.is_empty() {
                break;
            }
            let mut any_failed = false;
            for node in batch {
                let sent = self
                    .send_query(
                        node.addr,
                        node.id,
                        Query::GetPeers { info_hash },
                        Some(lookup_id),
                        timeout,
                    )
                    .await;
                if !sent {
                    if let Some(lookup) = self.lookups.get_mut(&lookup_id)
                    {
                        lookup.state.on_failure(&node.id);
                    }
                    any_failed = true;
                }
            }
            if !any_failed {
                return;
            }
        }

        let done = self
            .lookups
            .get(&lookup_id)
            .map(|l| l.state.is_done())
            .unwrap_or(true);
        if !done {
            return;
        }
        let Some(mut lookup) = self.lookups.remove(&lookup_id) else {
            return;
        };

        // announce to the closest responders whose token we hold
        if let Some(port) = lookup.announce_port {
            let closest = lookup.state.closest_responded(K);
            for node in closest {
                let token = self
                    .received_tokens
                    .get(&(node.addr, lookup.info_hash))
                    .filter(|(_, at)| at.elapsed() < TOKEN_TTL)
                    .map(|(token, _)| token.clone());
                let Some(token) = token else {
                    continue;
                };
                self.send_query(
                    node.addr,
                    node.id,
                    Query::AnnouncePeer {
                        info_hash: lookup.info_hash,
                        port,
                        token,
                        implied_port: false,
                    },
                    None,
                    lookup.timeout,
                )
                .await;
            }
        }

        lookup.peers_found.sort_unstable();
        lookup.peers_found.dedup();
        log::info!(
            "DHT lookup for {} found {} peers",
            hex::encode(lookup.info_hash),
            lookup.peers_found.len()
        );
        if let Some(tx) = lookup.result_tx.take() {
            tx.send(lookup.peers_found).ok();
        }
    }

    async fn fail_lookup_query(&mut self, lookup_id: u64, node_id: &NodeId) {
        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
            lookup.state.on_failure(node_id);
        }
        self.drive_lookup(lookup_id).await;
    }

    async fn handle_packet(&mut self, packet: &[u8], from: SocketAddr) {
        let msg = match krpc::decode(packet) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Malformed DHT packet from {from}: {e}");
                return;
            }
        };
        match msg {
            KrpcMessage::Query {
                transaction_id,
                id,
                query,
            } => {
                self.table.add_node(NodeInfo { id, addr: from }, false);
                let reply = self.serve_query(&transaction_id, from, &query);
                if let Err(e) = self.socket.send_to(&reply, from).await {
                    log::debug!("DHT reply to {from} failed: {e}");
                }
            }
            KrpcMessage::Response {
                transaction_id,
                body,
            } => {
                let Some(pending) = self.pending.remove(&transaction_id)
                else {
                    log::debug!("Stale DHT response from {from}");
                    return;
                };
                // trust the id the node reports over our placeholder
                let node_id = body.id.unwrap_or(pending.node_id);
                self.table.add_node(
                    NodeInfo {
                        id: node_id,
                        addr: from,
                    },
                    true,
                );
                self.table.mark_responded(&node_id);
                self.absorb_response(&pending, from, body).await;
            }
            KrpcMessage::Error {
                transaction_id,
                code,
                message,
            } => {
                log::debug!("DHT error {code} from {from}: {message}");
                if let Some(pending) = self.pending.remove(&transaction_id)
                {
                    self.table.mark_failed(&pending.node_id);
                    if let Some(lookup_id) = pending.lookup {
                        self.fail_lookup_query(lookup_id, &pending.node_id)
                            .await;
                    }
                }
            }
        }
    }

    async fn absorb_response(
        &mut self,
        pending: &PendingQuery,
        from: SocketAddr,
        body: ResponseBody,
    ) {
        let Some(lookup_id) = pending.lookup else {
            return;
        };
        let Some(lookup) = self.lookups.get_mut(&lookup_id) else {
            return;
        };
        if let Some(token) = body.token {
            self.received_tokens.insert(
                (from, lookup.info_hash),
                (token, Instant::now()),
            );
        }
        lookup.peers_found.extend(body.values);
        // mark the original id too in case the node reported another
        lookup.state.on_response(&pending.node_id, body.nodes);
        self.drive_lookup(lookup_id).await;
    }

    /// Builds the reply to an incoming query.
    fn serve_query(
        &mut self,
        transaction_id: &[u8],
        from: SocketAddr,
        query: &Query,
    ) -> Vec<u8> {
        let own_id = self.table.own_id();
        match query {
            Query::Ping => krpc::encode_response(
                transaction_id,
                &own_id,
                &[],
                &[],
                None,
            ),
            Query::FindNode { target } => {
                let nodes = self.table.closest(target, K);
                krpc::encode_response(
                    transaction_id,
                    &own_id,
                    &nodes,
                    &[],
                    None,
                )
            }
            Query::GetPeers { info_hash } => {
                let token = self.issue_token(from);
                let peers: Vec<SocketAddr> = self
                    .peer_store
                    .get(info_hash)
                    .map(|peers| {
                        peers
                            .iter()
                            .filter(|(_, at)| at.elapsed() < PEER_TTL)
                            .map(|(addr, _)| *addr)
                            .take(50)
                            .collect()
                    })
                    .unwrap_or_default();
                let nodes = if peers.is_empty() {
                    self.table.closest(&NodeId(*info_hash), K)
                } else {
                    Vec::new()
                };
                krpc::encode_response(
                    transaction_id,
                    &own_id,
                    &nodes,
                    &peers,
                    Some(&token),
                )
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.validate_token(from, token) {
                    return krpc::encode_error(
                        transaction_id,
                        203,
                        "bad token",
                    );
                }
                let port = if *implied_port { from.port() } else { *port };
                let peer = SocketAddr::new(from.ip(), port);
                self.peer_store
                    .entry(*info_hash)
                    .or_default()
                    .insert(peer, Instant::now());
                krpc::encode_response(
                    transaction_id,
                    &own_id,
                    &[],
                    &[],
                    None,
                )
            }
        }
    }

    /// Issues an opaque write token bound to the requester's IP.
    fn issue_token(&self, addr: SocketAddr) -> Vec<u8> {
        token_for(&self.secret, addr)
    }

    /// A token is valid when it matches the current or previous secret.
    fn validate_token(&self, addr: SocketAddr, token: &[u8]) -> bool {
        token == token_for(&self.secret, addr)
            || token == token_for(&self.prev_secret, addr)
    }

    async fn housekeeping(&mut self) {
        // rotate the token secret
        if self.secret_rotated_at.elapsed() >= SECRET_ROTATION {
            use rand::Rng;
            self.prev_secret = self.secret;
            rand::thread_rng().fill(&mut self.secret);
            self.secret_rotated_at = Instant::now();
        }

        // sweep expired caches
        self.received_tokens
            .retain(|_, (_, at)| at.elapsed() < TOKEN_TTL);
        for peers in self.peer_store.values_mut() {
            peers.retain(|_, at| at.elapsed() < PEER_TTL);
        }
        self.peer_store.retain(|_, peers| !peers.is_empty());

        // time out pending queries
        let expired: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_at.elapsed() > p.timeout)
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in expired {
            let Some(pending) = self.pending.remove(&tid) else {
                continue;
            };
            log::debug!("DHT query to {} timed out", pending.addr);
            self.table.mark_failed(&pending.node_id);
            if let Some(lookup_id) = pending.lookup {
                self.fail_lookup_query(lookup_id, &pending.node_id).await;
            }
        }
    }
}

fn token_for(secret: &[u8; 16], addr: SocketAddr) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_node() -> Node {
        let socket =
            UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        Node::new(socket, rx, vec![])
    }

    #[tokio::test]
    async fn test_token_issue_and_validate() {
        let node = test_node().await;
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let token = node.issue_token(addr);
        assert!(node.validate_token(addr, &token));

        // bound to the address
        let other: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        assert!(!node.validate_token(other, &token));
    }

    #[tokio::test]
    async fn test_token_survives_one_rotation() {
        let mut node = test_node().await;
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let token = node.issue_token(addr);

        // one rotation: the previous secret still validates
        node.secret_rotated_at = Instant::now() - SECRET_ROTATION;
        node.housekeeping().await;
        assert!(node.validate_token(addr, &token));

        // two rotations: the token is gone
        node.secret_rotated_at = Instant::now() - SECRET_ROTATION;
        node.housekeeping().await;
        assert!(!node.validate_token(addr, &token));
    }

    #[tokio::test]
    async fn test_serve_announce_then_get_peers() {
        let mut node = test_node().await;
        let announcer: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let info_hash = [0x42u8; 20];

        // an announce with a bad token is refused
        let reply = node.serve_query(
            b"t1",
            announcer,
            &Query::AnnouncePeer {
                info_hash,
                port: 6881,
                token: b"bogus".to_vec(),
                implied_port: false,
            },
        );
        assert!(matches!(
            krpc::decode(&reply).unwrap(),
            KrpcMessage::Error { code: 203, .. }
        ));

        // with a proper token the peer is stored
        let token = node.issue_token(announcer);
        let reply = node.serve_query(
            b"t2",
            announcer,
            &Query::AnnouncePeer {
                info_hash,
                port: 6881,
                token,
                implied_port: false,
            },
        );
        assert!(matches!(
            krpc::decode(&reply).unwrap(),
            KrpcMessage::Response { .. }
        ));

        // a get_peers now returns the announced endpoint
        let asker: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        let reply = node.serve_query(
            b"t3",
            asker,
            &Query::GetPeers { info_hash },
        );
        match krpc::decode(&reply).unwrap() {
            KrpcMessage::Response { body, .. } => {
                let expected: SocketAddr =
                    "10.0.0.1:6881".parse().unwrap();
                assert_eq!(body.values, vec![expected]);
                assert!(body.token.is_some());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_peers_returns_nodes_when_no_peers() {
        let mut node = test_node().await;
        let neighbor = NodeInfo {
            id: NodeId([1u8; 20]),
            addr: "10.0.0.3:6881".parse().unwrap(),
        };
        node.table.add_node(neighbor, true);

        let reply = node.serve_query(
            b"t1",
            "10.0.0.9:7000".parse().unwrap(),
            &Query::GetPeers {
                info_hash: [0x42u8; 20],
            },
        );
        match krpc::decode(&reply).unwrap() {
            KrpcMessage::Response { body, .. } => {
                assert!(body.values.is_empty());
                assert_eq!(body.nodes, vec![neighbor]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
