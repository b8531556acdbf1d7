//! The per-peer protocol session: handshake, extension handshake, then
//! the steady message exchange, driven until disconnect or shutdown.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::{Framed, FramedParts};

use crate::blockinfo::{Block, BlockInfo};
use crate::counter::ThruputCounters;
use crate::error::peer::{PeerError, Result, Violation};
use crate::torrent::TorrentContext;
use crate::{disk, torrent, Bitfield, BLOCK_LEN, MAX_BLOCK_LEN};

use super::codec::{
    Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING,
};
use super::extension::{
    ExtensionHandshake, MetadataMsg, PexMsg, OUR_UT_METADATA_ID,
    OUR_UT_PEX_ID,
};
use super::{
    Command, ConnectionState, PeerInfo, PeerQuality, PeerSource, Receiver,
    SessionSnapshot, SessionTick,
};

/// Who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

/// How many unserved incoming requests a peer may stack up before the
/// session treats the flood as a violation.
const MAX_INCOMING_REQUESTS: usize = 250;

/// Unsolicited blocks tolerated before the peer is dropped.
const MAX_UNSOLICITED_BLOCKS: usize = 8;

/// How long without outbound traffic before a keep-alive goes out.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// How long without any inbound traffic before the session gives up.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(240);

type Socket = Framed<TcpStream, PeerCodec>;
type Sink = futures::stream::SplitSink<Socket, Message>;

struct State {
    connection: ConnectionState,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for State {
    fn default() -> Self {
        // both sides start choked and uninterested
        Self {
            connection: ConnectionState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

pub(crate) struct PeerSession {
    /// Shared state of the owning torrent.
    ctx: Arc<TorrentContext>,
    /// The port on which the torrent sends this session commands.
    cmd_rx: Receiver,
    /// Our own command sender, handed to the disk task so read results
    /// come back to this session.
    own_tx: super::Sender,
    /// The remote address.
    addr: SocketAddr,
    direction: Direction,
    state: State,
    /// Information about the peer, set after a successful handshake.
    peer: Option<PeerInfo>,
    /// Our pending block requests and their send times. If we receive
    /// a block that is not in this map, it is unsolicited.
    outgoing_requests: HashMap<BlockInfo, Instant>,
    /// Requests the peer made that we haven't served yet, bounded by
    /// [`MAX_INCOMING_REQUESTS`].
    incoming_requests: Vec<BlockInfo>,
    /// Uploads held back by the rate limiter, retried each tick.
    deferred_uploads: VecDeque<Block>,
    /// The request pipeline target, adapted from the bandwidth-delay
    /// product on each block receipt.
    target_queue_len: usize,
    /// Observed block request round-trip time.
    rtt: crate::avg::SlidingDurationAvg,
    counters: ThruputCounters,
    quality: PeerQuality,
    /// Unsolicited blocks seen; a flood is a violation.
    unsolicited_count: usize,
    last_inbound: Instant,
    last_outbound: Instant,
    /// Set when the download rate bucket ran dry; cleared each tick.
    send_blocked: bool,
}

impl PeerSession {
    /// Creates a new session with the peer at the given address. The
    /// returned sender is the torrent's command line to the session.
    pub fn new(
        ctx: Arc<TorrentContext>,
        addr: SocketAddr,
        direction: Direction,
        source: PeerSource,
    ) -> (Self, super::Sender) {
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let min_depth = ctx.conf.pipeline_min_depth;
        (
            Self {
                ctx,
                cmd_rx,
                own_tx: cmd_tx.clone(),
                addr,
                direction,
                state: State::default(),
                peer: None,
                outgoing_requests: HashMap::new(),
                incoming_requests: Vec::new(),
                deferred_uploads: VecDeque::new(),
                target_queue_len: min_depth,
                rtt: Default::default(),
                counters: Default::default(),
                quality: PeerQuality::new(source),
                unsolicited_count: 0,
                last_inbound: Instant::now(),
                last_outbound: Instant::now(),
                send_blocked: false,
            },
            cmd_tx,
        )
    }

    /// Connects out to the peer and runs the session to completion.
    pub async fn start_outbound(
        &mut self,
        handshake_timeout: Duration,
    ) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Outbound);
        log::info!("Connecting to peer {}", self.addr);
        self.check_allowed()?;
        self.state.connection = ConnectionState::Connecting;
        let stream = TcpStream::connect(self.addr).await?;
        let socket = Framed::new(stream, HandshakeCodec);
        let socket =
            self.exchange_handshakes(socket, handshake_timeout).await?;
        self.run(socket).await
    }

    /// Runs the session over an accepted connection whose handshake the
    /// listener already consumed. `read_buf` carries any bytes the peer
    /// sent right after its handshake.
    pub async fn start_inbound(
        &mut self,
        stream: TcpStream,
        peer_handshake: Handshake,
        read_buf: bytes::BytesMut,
    ) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Inbound);
        self.check_allowed()?;
        self.validate_handshake(&peer_handshake)?;

        // reply with our side of the handshake, keeping the already
        // received bytes in the read buffer
        let mut parts = FramedParts::new(stream, HandshakeCodec);
        parts.read_buf = read_buf;
        let mut socket = Framed::from_parts(parts);
        self.state.connection = ConnectionState::Handshaking;
        socket
            .send(Handshake::new(
                self.ctx.info_hash,
                self.ctx.client_id,
                self.ctx.dht_enabled,
                false,
            ))
            .await?;
        let socket = self.into_message_codec(socket);
        self.register_handshake(&peer_handshake);
        self.run(socket).await
    }

    fn check_allowed(&self) -> Result<()> {
        if let Some(filter) = &self.ctx.peer_filter {
            if !filter(self.addr) {
                log::info!("Peer {} rejected by filter", self.addr);
                return Err(PeerError::NotAllowed);
            }
        }
        Ok(())
    }

    /// Outbound side of the handshake: send ours, await and validate the
    /// peer's within the adaptive timeout.
    async fn exchange_handshakes(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        handshake_timeout: Duration,
    ) -> Result<Socket> {
        self.state.connection = ConnectionState::Handshaking;
        log::info!("Sending handshake to peer {}", self.addr);
        socket
            .send(Handshake::new(
                self.ctx.info_hash,
                self.ctx.client_id,
                self.ctx.dht_enabled,
                false,
            ))
            .await?;

        let peer_handshake =
            match time::timeout(handshake_timeout, socket.next()).await {
                Err(_) => {
                    log::info!("Peer {} handshake timed out", self.addr);
                    return Err(PeerError::HandshakeTimeout);
                }
                Ok(None) => {
                    return Err(PeerError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during handshake",
                    )))
                }
                Ok(Some(handshake)) => handshake?,
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        self.validate_handshake(&peer_handshake)?;
        self.register_handshake(&peer_handshake);
        Ok(self.into_message_codec(socket))
    }

    fn validate_handshake(&self, handshake: &Handshake) -> Result<()> {
        if handshake.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(PeerError::UnknownInfoHash);
        }
        if handshake.peer_id == self.ctx.client_id {
            log::info!("Peer {} is ourselves", self.addr);
            return Err(PeerError::SelfConnection);
        }
        Ok(())
    }

    fn register_handshake(&mut self, handshake: &Handshake) {
        self.peer = Some(PeerInfo {
            id: handshake.peer_id,
            pieces: Bitfield::repeat(false, self.ctx.piece_count),
            extensions: handshake
                .supports_extensions()
                .then(ExtensionHandshake::default),
        });
        self.ctx
            .cmd_tx
            .send(torrent::Command::PeerConnected {
                addr: self.addr,
                id: handshake.peer_id,
            })
            .ok();
    }

    /// Switches the socket to the message codec, keeping any bytes the
    /// peer may have sent right after its handshake.
    fn into_message_codec(
        &self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Socket {
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Framed::from_parts(new_parts)
    }

    /// The main session loop after the handshakes.
    async fn run(&mut self, socket: Socket) -> Result<()> {
        self.state.connection = ConnectionState::AvailabilityExchange;
        let (mut sink, mut stream) = socket.split();

        // the extension handshake goes out first when both sides signaled
        // BEP 10 support
        if self
            .peer
            .as_ref()
            .map(|p| p.extensions.is_some())
            .unwrap_or(false)
        {
            let metadata_size = self
                .ctx
                .raw_info
                .read()
                .expect("raw info lock poisoned")
                .as_ref()
                .map(|info| info.len() as u64);
            sink.send(Message::Extended {
                id: 0,
                payload: ExtensionHandshake::own(metadata_size).encode(),
            })
            .await?;
        }

        // advertise our pieces unless we have none
        {
            let own_pieces =
                self.ctx.store.read().await.own_pieces();
            if own_pieces.any() {
                sink.send(Message::Bitfield(own_pieces)).await?;
            }
        }
        self.last_outbound = Instant::now();

        let result = self.event_loop(&mut sink, &mut stream).await;
        self.state.connection = match &result {
            Ok(()) => ConnectionState::Disconnected,
            Err(_) => ConnectionState::Error,
        };
        self.teardown().await;
        result
    }

    async fn event_loop(
        &mut self,
        sink: &mut Sink,
        stream: &mut futures::stream::SplitStream<Socket>,
    ) -> Result<()> {
        let mut tick = time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    let Some(msg) = maybe_msg else {
                        log::info!("Peer {} closed the connection", self.addr);
                        return Ok(());
                    };
                    let msg = msg.map_err(|e| {
                        if e.kind() == std::io::ErrorKind::InvalidData {
                            PeerError::Violation(
                                Violation::InvalidMessageLength,
                            )
                        } else {
                            PeerError::Io(e)
                        }
                    })?;
                    self.last_inbound = Instant::now();
                    self.handle_msg(sink, msg).await?;
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // the torrent dropped us; shut down quietly
                        return Ok(());
                    };
                    if !self.handle_cmd(sink, cmd).await? {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    self.tick(sink).await?;
                }
            }
        }
    }

    async fn handle_msg(
        &mut self,
        sink: &mut Sink,
        msg: Message,
    ) -> Result<()> {
        // the bitfield may only arrive as the very first message
        let msg = if self.state.connection
            == ConnectionState::AvailabilityExchange
        {
            self.state.connection = ConnectionState::Connected;
            match msg {
                Message::Bitfield(bitfield) => {
                    self.handle_bitfield(sink, bitfield).await?;
                    return Ok(());
                }
                other => other,
            }
        } else {
            msg
        };

        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield after first message",
                    self.addr
                );
                return Err(Violation::BitfieldNotAfterHandshake.into());
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.state.peer_choking {
                    log::info!("Peer {} choked us", self.addr);
                    self.state.peer_choking = true;
                    // we don't expect our outstanding requests to be
                    // served any longer
                    self.abandon_outgoing_requests().await;
                }
            }
            Message::Unchoke => {
                if self.state.peer_choking {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.state.peer_choking = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.state.peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.state.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.state.peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.state.peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.handle_have(sink, piece_index).await?;
            }
            Message::Request(block) => {
                self.handle_request(block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block(info, data.into_owned()).await?;
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                self.incoming_requests.retain(|b| *b != block);
            }
            Message::Extended { id, payload } => {
                self.handle_extended(sink, id, payload).await?;
            }
        }
        Ok(())
    }

    async fn handle_bitfield(
        &mut self,
        sink: &mut Sink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("Handling peer {} bitfield message", self.addr);

        // before the metadata is known (magnet sessions) there is no piece
        // count to validate against; stash the bitfield as-is
        let piece_count = self.ctx.piece_count;
        if piece_count == 0 {
            if let Some(peer) = &mut self.peer {
                peer.pieces = bitfield;
            }
            return Ok(());
        }

        // the wire bitfield is padded up to a byte boundary; slice off the
        // spill and reject set bits past the piece count
        if bitfield.len() < piece_count
            || bitfield[piece_count..].any()
        {
            return Err(Violation::InvalidPieceIndex.into());
        }
        bitfield.truncate(piece_count);

        let am_interested = {
            let mut store = self.ctx.store.write().await;
            store.register_peer(&bitfield)
        };
        if let Some(peer) = &mut self.peer {
            peer.pieces = bitfield;
        }
        self.update_interest(sink, am_interested).await
    }

    async fn handle_have(
        &mut self,
        sink: &mut Sink,
        piece_index: usize,
    ) -> Result<()> {
        if self.ctx.piece_count == 0 {
            // metadata not yet known; nothing to validate or schedule
            return Ok(());
        }
        if piece_index >= self.ctx.piece_count {
            return Err(Violation::InvalidPieceIndex.into());
        }
        let already_had = self
            .peer
            .as_ref()
            .map(|p| p.pieces[piece_index])
            .unwrap_or(false);
        if already_had {
            return Ok(());
        }
        if let Some(peer) = &mut self.peer {
            peer.pieces.set(piece_index, true);
        }
        let am_interested = {
            let mut store = self.ctx.store.write().await;
            store.register_have(piece_index);
            self.peer
                .as_ref()
                .map(|p| store.is_interested_in(&p.pieces))
                .unwrap_or(false)
        };
        self.update_interest(sink, am_interested).await
    }

    /// Sends INTERESTED/NOT_INTERESTED on transitions only.
    async fn update_interest(
        &mut self,
        sink: &mut Sink,
        am_interested: bool,
    ) -> Result<()> {
        if am_interested && !self.state.am_interested {
            log::info!("Interested in peer {}", self.addr);
            self.state.am_interested = true;
            sink.send(Message::Interested).await?;
            self.last_outbound = Instant::now();
        } else if !am_interested && self.state.am_interested {
            log::info!("No longer interested in peer {}", self.addr);
            self.state.am_interested = false;
            sink.send(Message::NotInterested).await?;
            self.last_outbound = Instant::now();
        }
        Ok(())
    }

    async fn handle_request(&mut self, block: BlockInfo) -> Result<()> {
        if self.state.am_choking {
            log::info!("Choked peer {} sent request", self.addr);
            return Err(Violation::RequestWhileChoked.into());
        }
        if block.len == 0 || block.len > MAX_BLOCK_LEN {
            return Err(Violation::InvalidBlockInfo.into());
        }
        let piece_len = {
            let store = self.ctx.store.read().await;
            let Some(len) = store.storage().piece_len(block.piece_index)
            else {
                return Err(Violation::InvalidPieceIndex.into());
            };
            // only verified pieces may be served
            if store.state(block.piece_index)
                != Some(crate::piece::PieceState::Verified)
            {
                log::debug!(
                    "Peer {} requested unverified piece {}",
                    self.addr,
                    block.piece_index
                );
                return Ok(());
            }
            len
        };
        if block.offset + block.len > piece_len {
            return Err(Violation::InvalidBlockInfo.into());
        }
        if self.incoming_requests.len() >= MAX_INCOMING_REQUESTS {
            return Err(Violation::InvalidBlockInfo.into());
        }
        if self.incoming_requests.contains(&block) {
            return Ok(());
        }
        self.incoming_requests.push(block);

        // the disk task reads the block and posts it back as a command
        self.ctx
            .disk_tx
            .send(disk::Command::ReadBlock {
                id: self.ctx.id,
                block_info: block,
                result_tx: self.own_tx.clone(),
            })
            .await
            .map_err(|_| PeerError::Channel)?;
        Ok(())
    }

    async fn handle_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let Some(sent_at) = self.outgoing_requests.remove(&info) else {
            log::warn!(
                "Peer {} sent block we didn't request: {}",
                self.addr,
                info
            );
            self.unsolicited_count += 1;
            self.counters.waste.add(data.len() as u64);
            if self.unsolicited_count > MAX_UNSOLICITED_BLOCKS {
                return Err(Violation::UnrequestedBlock.into());
            }
            return Ok(());
        };

        self.rtt.update(sent_at.elapsed());
        self.counters.down.payload.add(data.len() as u64);
        self.quality.record(0.3);
        self.adapt_target_queue_len();

        // a reply to a merged request covers several canonical blocks;
        // the store and the disk task account in 16 KiB granularity
        if info.len <= BLOCK_LEN {
            return self.handle_sub_block(info, data).await;
        }
        for sub in split_request(&info) {
            let start = (sub.offset - info.offset) as usize;
            let chunk = data[start..start + sub.len as usize].to_vec();
            self.handle_sub_block(sub, chunk).await?;
        }
        Ok(())
    }

    async fn handle_sub_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let receipt = {
            let mut store = self.ctx.store.write().await;
            store.received_block(self.addr, &info)
        };
        match receipt {
            crate::piece::BlockReceipt::Accepted { cancels, .. } => {
                // endgame: everyone else still holding this request gets
                // a cancel
                for other in cancels {
                    self.ctx
                        .cmd_tx
                        .send(torrent::Command::CancelBlock {
                            addr: other,
                            block: info,
                        })
                        .ok();
                }
                // hand the bytes to the disk task; it reports the piece
                // completion to the torrent once the piece assembles
                self.ctx
                    .disk_tx
                    .send(disk::Command::WriteBlock {
                        id: self.ctx.id,
                        block_info: info,
                        data,
                    })
                    .await
                    .map_err(|_| PeerError::Channel)?;
            }
            crate::piece::BlockReceipt::Ignored => {
                // raced with a timeout sweep or an endgame duplicate
                log::debug!(
                    "Block {} from peer {} no longer wanted",
                    info,
                    self.addr
                );
                self.counters.waste.add(data.len() as u64);
            }
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        sink: &mut Sink,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        match id {
            0 => {
                let handshake = ExtensionHandshake::decode(&payload)
                    .map_err(PeerError::Violation)?;
                log::debug!(
                    "Peer {} extension handshake: {:?}",
                    self.addr,
                    handshake
                );
                if let Some(size) = handshake.metadata_size {
                    self.ctx
                        .cmd_tx
                        .send(torrent::Command::MetadataSize {
                            addr: self.addr,
                            size,
                        })
                        .ok();
                }
                if let Some(peer) = &mut self.peer {
                    peer.extensions = Some(handshake);
                }
            }
            OUR_UT_METADATA_ID => {
                let msg = MetadataMsg::decode(&payload)
                    .map_err(PeerError::Violation)?;
                match msg {
                    MetadataMsg::Request { piece } => {
                        self.serve_metadata_piece(sink, piece).await?;
                    }
                    msg => {
                        self.ctx
                            .cmd_tx
                            .send(torrent::Command::MetadataPiece {
                                addr: self.addr,
                                msg,
                            })
                            .ok();
                    }
                }
            }
            OUR_UT_PEX_ID => {
                // private torrents neither send nor accept PEX
                if self.ctx.is_private() {
                    log::debug!(
                        "Ignoring PEX from {} on private torrent",
                        self.addr
                    );
                    return Ok(());
                }
                let msg = PexMsg::decode(&payload)
                    .map_err(PeerError::Violation)?;
                self.ctx
                    .cmd_tx
                    .send(torrent::Command::PexReceived {
                        addr: self.addr,
                        msg,
                    })
                    .ok();
            }
            other => {
                // unknown sub-ids must be ignored
                log::debug!(
                    "Peer {} sent unknown extension sub-id {}",
                    self.addr,
                    other
                );
            }
        }
        Ok(())
    }

    /// Serves one 16 KiB chunk of the info dictionary, or a reject when we
    /// don't have the metadata (yet).
    async fn serve_metadata_piece(
        &mut self,
        sink: &mut Sink,
        piece: usize,
    ) -> Result<()> {
        let Some(remote_id) = self
            .peer
            .as_ref()
            .and_then(|p| p.extensions.as_ref())
            .and_then(|e| e.ut_metadata)
        else {
            return Ok(());
        };
        let reply = {
            let raw_info = self
                .ctx
                .raw_info
                .read()
                .expect("raw info lock poisoned");
            match raw_info.as_ref() {
                Some(info) => {
                    let start = piece * BLOCK_LEN as usize;
                    if start >= info.len() {
                        MetadataMsg::Reject { piece }
                    } else {
                        let end =
                            (start + BLOCK_LEN as usize).min(info.len());
                        MetadataMsg::Data {
                            piece,
                            total_size: info.len() as u64,
                            payload: info[start..end].to_vec(),
                        }
                    }
                }
                None => MetadataMsg::Reject { piece },
            }
        };
        sink.send(Message::Extended {
            id: remote_id,
            payload: reply.encode(),
        })
        .await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    async fn handle_cmd(
        &mut self,
        sink: &mut Sink,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Block(block) => {
                self.send_block(sink, block).await?;
            }
            Command::SendHave { index } => {
                sink.send(Message::Have { piece_index: index }).await?;
                self.last_outbound = Instant::now();
                // the new piece may end our interest in this peer
                let am_interested = {
                    let store = self.ctx.store.read().await;
                    self.peer
                        .as_ref()
                        .map(|p| store.is_interested_in(&p.pieces))
                        .unwrap_or(false)
                };
                self.update_interest(sink, am_interested).await?;
            }
            Command::Unchoke => {
                if self.state.am_choking {
                    self.state.am_choking = false;
                    sink.send(Message::Unchoke).await?;
                    self.last_outbound = Instant::now();
                }
            }
            Command::Choke => {
                if !self.state.am_choking {
                    self.state.am_choking = true;
                    self.incoming_requests.clear();
                    self.deferred_uploads.clear();
                    sink.send(Message::Choke).await?;
                    self.last_outbound = Instant::now();
                }
            }
            Command::CancelBlock(block) => {
                if self.outgoing_requests.remove(&block).is_some() {
                    sink.send(Message::Cancel(block)).await?;
                    self.last_outbound = Instant::now();
                }
            }
            Command::RequestMetadata { piece } => {
                if let Some(remote_id) = self
                    .peer
                    .as_ref()
                    .and_then(|p| p.extensions.as_ref())
                    .and_then(|e| e.ut_metadata)
                {
                    sink.send(Message::Extended {
                        id: remote_id,
                        payload: MetadataMsg::Request { piece }.encode(),
                    })
                    .await?;
                    self.last_outbound = Instant::now();
                }
            }
            Command::SendPex(msg) => {
                if self.ctx.is_private() {
                    return Ok(true);
                }
                if let Some(remote_id) = self
                    .peer
                    .as_ref()
                    .and_then(|p| p.extensions.as_ref())
                    .and_then(|e| e.ut_pex)
                {
                    sink.send(Message::Extended {
                        id: remote_id,
                        payload: msg.encode(),
                    })
                    .await?;
                    self.last_outbound = Instant::now();
                }
            }
            Command::Shutdown => {
                log::info!("Shutting down peer {} session", self.addr);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sends a block the disk read for us, unless the peer withdrew the
    /// request or the upload bucket is dry.
    async fn send_block(
        &mut self,
        sink: &mut Sink,
        block: Block,
    ) -> Result<()> {
        let info = block.info();
        let Some(pos) =
            self.incoming_requests.iter().position(|b| *b == info)
        else {
            // cancelled while the disk was reading
            return Ok(());
        };

        let allowed = self
            .ctx
            .rate_limiter
            .lock()
            .expect("rate limiter lock poisoned")
            .claim_upload(info.len as u64);
        if !allowed {
            // deferred, not dropped: the tick retries once the bucket
            // refills
            self.deferred_uploads.push_back(block);
            return Ok(());
        }
        self.incoming_requests.remove(pos);

        self.counters.up.payload.add(info.len as u64);
        self.quality.record(0.1);
        sink.send(Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data: block.data,
        })
        .await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    /// Fills the request pipeline up to the adaptive target length.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if !self.state.am_interested
            || self.state.peer_choking
            || self.send_blocked
        {
            return Ok(());
        }
        let capacity = self
            .target_queue_len
            .saturating_sub(self.outgoing_requests.len());
        if capacity == 0 {
            return Ok(());
        }

        // the download bucket is consulted up front; an empty bucket
        // defers requesting until the next tick rather than dropping
        let projected = (capacity as u64).min(4) * BLOCK_LEN as u64;
        let allowed = self
            .ctx
            .rate_limiter
            .lock()
            .expect("rate limiter lock poisoned")
            .claim_download(projected);
        if !allowed {
            self.send_blocked = true;
            return Ok(());
        }

        let mut blocks = Vec::with_capacity(capacity);
        {
            let Some(peer) = &self.peer else {
                return Ok(());
            };
            let bandwidth_norm = self.bandwidth_norm();
            let mut store = self.ctx.store.write().await;
            store.pick_blocks(
                self.addr,
                &peer.pieces,
                capacity,
                bandwidth_norm,
                &mut blocks,
            );
        }
        if blocks.is_empty() {
            return Ok(());
        }
        // merged requests go only to peers that signaled large-request
        // tolerance; everyone else gets canonical 16 KiB requests
        if self.supports_large_requests() {
            blocks = coalesce_requests(
                &blocks,
                self.ctx.conf.pipeline_coalesce_threshold,
            );
        }
        log::debug!(
            "Requesting {} blocks from peer {}",
            blocks.len(),
            self.addr
        );
        let now = Instant::now();
        for block in blocks {
            self.outgoing_requests.insert(block, now);
            sink.send(Message::Request(block)).await?;
        }
        self.last_outbound = Instant::now();
        Ok(())
    }

    /// Whether requests larger than one canonical block may be sent to
    /// this peer. No BEP advertises oversized-request tolerance; the
    /// request-queue hint in the extension handshake is the capability
    /// signal used here.
    fn supports_large_requests(&self) -> bool {
        self.peer
            .as_ref()
            .and_then(|p| p.extensions.as_ref())
            .and_then(|e| e.request_queue_len)
            .is_some()
    }

    /// Our download rate relative to the torrent's fastest peer.
    fn bandwidth_norm(&self) -> f64 {
        let own = self.counters.down.payload.avg() as f64;
        let max = self.ctx.max_download_rate() as f64;
        if max <= 0.0 {
            0.5
        } else {
            (own / max).clamp(0.0, 1.0)
        }
    }

    /// Recomputes the pipeline target from the bandwidth-delay product.
    fn adapt_target_queue_len(&mut self) {
        let rate = self.counters.down.payload.avg();
        let rtt = self.rtt.mean().max(Duration::from_millis(50));
        let bdp_blocks = (rate as f64 / BLOCK_LEN as f64
            * rtt.as_secs_f64())
        .ceil() as usize;
        self.target_queue_len = bdp_blocks.clamp(
            self.ctx.conf.pipeline_min_depth,
            self.ctx.conf.pipeline_max_depth,
        );
    }

    /// The adaptive block-request timeout.
    fn request_timeout(&self) -> Duration {
        let conf = &self.ctx.conf;
        let rtt_based = self
            .rtt
            .mean()
            .saturating_mul(conf.request_rtt_multiplier);
        rtt_based.clamp(conf.request_timeout_min, conf.request_timeout_max)
    }

    /// Periodic work: counters, keep-alive, inactivity, request timeout
    /// sweep, deferred uploads, session tick report.
    async fn tick(&mut self, sink: &mut Sink) -> Result<()> {
        self.counters.tick();
        self.send_blocked = false;

        // a silent peer gets dropped once nothing moved for too long
        if self.last_inbound.elapsed() >= INACTIVITY_TIMEOUT {
            log::info!("Peer {} inactivity timeout", self.addr);
            return Err(PeerError::InactivityTimeout);
        }

        // sweep timed out requests so their blocks become assignable to
        // other peers on the next pick
        let timeout = self.request_timeout();
        let now = Instant::now();
        let expired: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(_, sent_at)| now.duration_since(**sent_at) > timeout)
            .map(|(block, _)| *block)
            .collect();
        if !expired.is_empty() {
            log::debug!(
                "{} requests to peer {} timed out",
                expired.len(),
                self.addr
            );
            self.quality.timeouts += expired.len();
            self.quality.record(-0.5);
            // shrink the pipeline; it regrows on consistent fills
            self.target_queue_len = (self.target_queue_len / 2)
                .max(self.ctx.conf.pipeline_min_depth);
            let mut store = self.ctx.store.write().await;
            for block in expired {
                self.outgoing_requests.remove(&block);
                for sub in split_request(&block) {
                    store.release_block(self.addr, &sub);
                }
            }
        }

        // retry rate-limited uploads
        while let Some(block) = self.deferred_uploads.pop_front() {
            let info = block.info();
            let allowed = self
                .ctx
                .rate_limiter
                .lock()
                .expect("rate limiter lock poisoned")
                .claim_upload(info.len as u64);
            if !allowed {
                self.deferred_uploads.push_front(block);
                break;
            }
            self.incoming_requests.retain(|b| *b != info);
            self.counters.up.payload.add(info.len as u64);
            sink.send(Message::Block {
                piece_index: block.piece_index,
                offset: block.offset,
                data: block.data,
            })
            .await?;
            self.last_outbound = Instant::now();
        }

        // keep the connection alive when we have nothing else to say
        if self.last_outbound.elapsed() >= KEEP_ALIVE_INTERVAL {
            sink.send(Message::KeepAlive).await?;
            self.last_outbound = Instant::now();
        }

        // opportunistic pipelining: the scheduler tick may have freed
        // blocks (timeouts elsewhere, new verified pieces)
        self.make_requests(sink).await?;

        // report the session state to the torrent
        self.ctx
            .cmd_tx
            .send(torrent::Command::PeerState {
                addr: self.addr,
                info: SessionTick {
                    state: SessionSnapshot {
                        connection: self.state.connection,
                        am_choking: self.state.am_choking,
                        am_interested: self.state.am_interested,
                        peer_choking: self.state.peer_choking,
                        peer_interested: self.state.peer_interested,
                    },
                    download_rate: self.counters.down.payload.avg(),
                    upload_rate: self.counters.up.payload.avg(),
                    downloaded_payload: self.counters.down.payload.total(),
                    uploaded_payload: self.counters.up.payload.total(),
                    piece_count: self
                        .peer
                        .as_ref()
                        .map(|p| p.pieces.count_ones())
                        .unwrap_or(0),
                    quality: self.quality.score(),
                    last_activity: self.last_inbound,
                },
            })
            .ok();
        Ok(())
    }

    /// Releases our in-flight requests back to the store after an
    /// incoming CHOKE.
    async fn abandon_outgoing_requests(&mut self) {
        let mut store = self.ctx.store.write().await;
        for block in self.outgoing_requests.keys() {
            for sub in split_request(block) {
                store.release_block(self.addr, &sub);
            }
        }
        self.outgoing_requests.clear();
    }

    /// Final cleanup: rarity and request bookkeeping. The disconnect
    /// notice itself is sent by the torrent's spawn wrapper, which also
    /// knows how the session ended.
    async fn teardown(&mut self) {
        if let Some(peer) = &self.peer {
            let mut store = self.ctx.store.write().await;
            store.unregister_peer(self.addr, &peer.pieces);
        }
        self.outgoing_requests.clear();
    }
}

/// Merges contiguous blocks of the same piece into larger requests, as
/// long as the combined length stays within the threshold. The input must
/// be in pick order; only adjacent entries merge.
pub(crate) fn coalesce_requests(
    blocks: &[BlockInfo],
    threshold: u32,
) -> Vec<BlockInfo> {
    let mut out: Vec<BlockInfo> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(last) = out.last_mut() {
            if last.piece_index == block.piece_index
                && last.offset + last.len == block.offset
                && last.len + block.len <= threshold
            {
                last.len += block.len;
                continue;
            }
        }
        out.push(*block);
    }
    out
}

/// Splits a possibly merged request back into the canonical 16 KiB
/// blocks the store and the disk task account in. A canonical request
/// splits to itself.
pub(crate) fn split_request(info: &BlockInfo) -> Vec<BlockInfo> {
    let mut out =
        Vec::with_capacity(info.len.div_ceil(BLOCK_LEN) as usize);
    let mut offset = info.offset;
    let mut remaining = info.len;
    while remaining > 0 {
        let len = remaining.min(BLOCK_LEN);
        out.push(BlockInfo {
            piece_index: info.piece_index,
            offset,
            len,
        });
        offset += len;
        remaining -= len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(piece_index: usize, offset: u32, len: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len,
        }
    }

    #[test]
    fn test_coalesce_contiguous_requests() {
        let blocks = vec![
            block(0, 0, BLOCK_LEN),
            block(0, BLOCK_LEN, BLOCK_LEN),
            block(0, 2 * BLOCK_LEN, BLOCK_LEN),
            block(1, 0, BLOCK_LEN),
        ];
        let merged = coalesce_requests(&blocks, 2 * BLOCK_LEN);
        assert_eq!(
            merged,
            vec![
                block(0, 0, 2 * BLOCK_LEN),
                block(0, 2 * BLOCK_LEN, BLOCK_LEN),
                block(1, 0, BLOCK_LEN),
            ]
        );
    }

    #[test]
    fn test_coalesce_respects_threshold_and_gaps() {
        let blocks = vec![
            block(0, 0, BLOCK_LEN),
            // a gap: block at 2 * BLOCK_LEN is not adjacent
            block(0, 2 * BLOCK_LEN, BLOCK_LEN),
        ];
        assert_eq!(coalesce_requests(&blocks, 4 * BLOCK_LEN), blocks);

        // threshold of one block length never merges
        let contiguous =
            vec![block(0, 0, BLOCK_LEN), block(0, BLOCK_LEN, BLOCK_LEN)];
        assert_eq!(
            coalesce_requests(&contiguous, BLOCK_LEN),
            contiguous
        );
    }

    #[test]
    fn test_split_inverts_coalesce() {
        let picked = vec![
            block(3, 0, BLOCK_LEN),
            block(3, BLOCK_LEN, BLOCK_LEN),
            // a short tail block stays mergeable
            block(3, 2 * BLOCK_LEN, 100),
        ];
        let merged = coalesce_requests(&picked, 3 * BLOCK_LEN);
        assert_eq!(merged.len(), 1);

        let split: Vec<BlockInfo> = merged
            .iter()
            .flat_map(|m| split_request(m))
            .collect();
        assert_eq!(split, picked);

        // a canonical request splits to itself
        assert_eq!(
            split_request(&block(0, BLOCK_LEN, BLOCK_LEN)),
            vec![block(0, BLOCK_LEN, BLOCK_LEN)]
        );
    }
}
