//! The per-torrent orchestrator: owns the piece store, the peer session
//! set, the choking controller, the tracker schedule, the PEX state, the
//! metadata fetch (for magnet starts) and the checkpoint cadence.
//!
//! The torrent runs as one task. Peer sessions, tracker announces and DHT
//! lookups run as their own tasks and report back through the torrent's
//! command channel; nothing here blocks the loop on the network.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, RwLock};
use tokio::task;
use url::Url;

use crate::alert::{Alert, AlertSender};
use crate::blockinfo::BlockInfo;
use crate::checkpoint::{
    priority_from_code, CheckpointManager, CheckpointRecord, TorrentSource,
};
use crate::choke::{ChokeCandidate, Choker};
use crate::conf::{DiscoveryConf, SwarmHealth, TorrentConf};
use crate::error::disk::{ReadError, WriteError};
use crate::error::peer::PeerError;
use crate::error::torrent::Result;
use crate::error::TrackerError;
use crate::magnet::MagnetUri;
use crate::metadata::{MetadataError, MetadataFetch};
use crate::metainfo::Metainfo;
use crate::peer::codec::Handshake;
use crate::peer::extension::{MetadataMsg, PexMsg};
use crate::peer::{
    self, Direction, PeerCandidate, PeerSession, PeerSource, SessionTick,
};
use crate::pex::PexState;
use crate::piece::{
    hashes_from_metainfo, FilePriority, FileSelection, PieceStore,
    StoreOptions,
};
use crate::rate::RateLimiter;
use crate::storage_info::StorageInfo;
use crate::tracker::{
    Announce, Event, Response, Tracker, TrackerState,
};
use crate::{dht, disk, PeerId, PieceIndex, Sha1Hash, TorrentId};

pub mod stats;

use stats::TorrentStats;

/// The channel for communication with a torrent.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The type returned on completing a piece.
#[derive(Debug)]
pub struct PieceCompletion {
    /// The index of the piece.
    pub index: PieceIndex,
    /// Whether the piece hashed correctly. If it didn't, it was not
    /// written to disk.
    pub is_valid: bool,
}

/// The messages a torrent can receive from the rest of the engine.
pub(crate) enum Command {
    /// The disk task finished allocating our files.
    Allocated { ok: bool },
    /// Sent when a completed piece was hash-checked and written, or when
    /// writing it failed.
    PieceCompletion(std::result::Result<PieceCompletion, WriteError>),
    /// There was an error reading a block for an upload.
    ReadError {
        block_info: BlockInfo,
        error: ReadError,
    },
    /// A session completed its handshake.
    PeerConnected { addr: SocketAddr, id: PeerId },
    /// Periodic session state report.
    PeerState { addr: SocketAddr, info: SessionTick },
    /// A session's task finished, successfully or not.
    SessionEnded {
        addr: SocketAddr,
        result: std::result::Result<(), PeerError>,
    },
    /// An endgame duplicate arrived elsewhere; tell this peer to cancel.
    CancelBlock { addr: SocketAddr, block: BlockInfo },
    /// A peer advertised the metadata size in its extension handshake.
    MetadataSize { addr: SocketAddr, size: u64 },
    /// A ut_metadata data/reject message arrived.
    MetadataPiece { addr: SocketAddr, msg: MetadataMsg },
    /// A PEX message arrived.
    PexReceived { addr: SocketAddr, msg: PexMsg },
    /// The engine's listener accepted a connection for our info-hash.
    /// `read_buf` holds bytes the peer sent after its handshake.
    PeerAccepted {
        stream: TcpStream,
        handshake: Handshake,
        read_buf: bytes::BytesMut,
    },
    /// New candidate endpoints from a tracker, the DHT, PEX or the user.
    AddPeers {
        peers: Vec<SocketAddr>,
        source: PeerSource,
    },
    /// An announce task finished; hand the tracker back.
    AnnounceResult {
        slot: usize,
        tracker: Tracker,
        event: Option<Event>,
        result: std::result::Result<Response, TrackerError>,
    },
    /// The resume spot check finished.
    ResumeVerified { ok: bool },
    /// Change one file's selection entry.
    SetFileSelection {
        file: usize,
        selected: bool,
        priority: FilePriority,
    },
    /// Stop transfers but keep the torrent loaded.
    Pause,
    /// Resume a paused or errored torrent.
    Resume,
    /// Graceful shutdown: flush the checkpoint, close the sessions,
    /// announce our exit.
    Shutdown,
}

/// The lifecycle of a torrent session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    /// Magnet start: the info dictionary is still being fetched.
    FetchingMetadata,
    Downloading,
    Seeding,
    Paused,
    /// A fatal condition paused the torrent; it will not retry until the
    /// user resumes it.
    Error,
}

/// The filter hook the engine installs to ask "is this peer allowed?".
pub(crate) type PeerFilter = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// State shared between a torrent and its peer sessions.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    /// The torrent's 20-byte wire identity.
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    /// Zero until the metadata is known (magnet starts).
    pub piece_count: usize,
    /// The torrent's command channel, for session events.
    pub cmd_tx: Sender,
    /// The authoritative piece store.
    pub store: RwLock<PieceStore>,
    pub disk_tx: disk::Sender,
    /// The engine-wide transfer rate buckets.
    pub rate_limiter: Arc<std::sync::Mutex<RateLimiter>>,
    pub conf: TorrentConf,
    /// Whether we advertise a DHT node in handshakes.
    pub dht_enabled: bool,
    /// Private torrents never touch the DHT, PEX or local discovery.
    private: AtomicBool,
    /// The canonical bencoded info dictionary, once known; served over
    /// ut_metadata.
    pub raw_info: std::sync::RwLock<Option<Arc<Vec<u8>>>>,
    /// The engine's peer-allow hook.
    pub peer_filter: Option<PeerFilter>,
    /// The fastest per-peer download rate seen this round; feeds the
    /// bandwidth-weighted piece picker.
    max_download_rate: AtomicU64,
}

impl TorrentContext {
    pub fn is_private(&self) -> bool {
        self.private.load(Ordering::Relaxed)
    }

    pub fn set_private(&self, private: bool) {
        self.private.store(private, Ordering::Relaxed);
    }

    pub fn max_download_rate(&self) -> u64 {
        self.max_download_rate.load(Ordering::Relaxed)
    }

    pub fn set_max_download_rate(&self, rate: u64) {
        self.max_download_rate.store(rate, Ordering::Relaxed);
    }
}

/// What the torrent starts from.
pub(crate) enum TorrentKind {
    /// A parsed `.torrent` file.
    Metainfo {
        metainfo: Box<Metainfo>,
        /// The canonical bencoded info dictionary.
        raw_info: Vec<u8>,
        source: TorrentSource,
    },
    /// A magnet link; the metadata is fetched from the swarm.
    Magnet { magnet: Box<MagnetUri> },
}

/// Everything needed to construct a torrent.
pub(crate) struct Params {
    pub id: TorrentId,
    pub kind: TorrentKind,
    pub conf: TorrentConf,
    pub discovery: DiscoveryConf,
    pub client_id: PeerId,
    pub download_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub listen_port: u16,
    pub disk_tx: disk::Sender,
    pub dht_tx: Option<dht::Sender>,
    pub alert_tx: AlertSender,
    pub rate_limiter: Arc<std::sync::Mutex<RateLimiter>>,
    pub peer_filter: Option<PeerFilter>,
    /// The engine-wide connected-session counter and its cap.
    pub global_peers: Arc<AtomicUsize>,
    pub max_global_peers: usize,
}

struct PeerHandle {
    tx: peer::Sender,
    join: Option<task::JoinHandle<()>>,
    /// Set after the handshake.
    id: Option<PeerId>,
    connected_at: Instant,
    /// The latest session tick, if any arrived yet.
    last_tick: Option<SessionTick>,
    /// Whether the peer advertised ut_metadata with a size.
    serves_metadata: bool,
    violations: usize,
}

struct TrackerSlot {
    /// Taken while an announce task is running.
    tracker: Option<Tracker>,
    url: Url,
    state: TrackerState,
    sent_started: bool,
    sent_completed: bool,
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    cmd_rx: Receiver,
    state: LifecycleState,
    conf: TorrentConf,
    discovery: DiscoveryConf,
    alert_tx: AlertSender,
    dht_tx: Option<dht::Sender>,
    listen_port: u16,
    download_dir: PathBuf,
    name: String,
    metainfo: Option<Metainfo>,
    magnet: Option<MagnetUri>,
    source: TorrentSource,

    peers: HashMap<SocketAddr, PeerHandle>,
    candidates: HashMap<SocketAddr, PeerCandidate>,
    banned: HashSet<SocketAddr>,

    choker: Choker,
    last_choke_tick: Option<Instant>,
    pex: PexState,
    trackers: Vec<TrackerSlot>,
    metadata_fetch: Option<MetadataFetch>,

    checkpoints: CheckpointManager,
    checkpoint_created_at: Option<u64>,
    last_full_checkpoint: Option<Instant>,
    /// Pieces verified since the last full checkpoint.
    pending_delta: Vec<PieceIndex>,
    /// Resume verification in progress; commands pause requesting.
    resume_pending: bool,

    /// Consecutive disk write failures; three of them error the torrent.
    disk_failures: usize,
    last_dht_lookup: Option<Instant>,
    dht_in_flight: bool,
    start_time: Instant,
    global_peers: Arc<AtomicUsize>,
    max_global_peers: usize,
}

impl Torrent {
    /// The torrent's wire info-hash, for the engine's routing map.
    pub fn info_hash(&self) -> Sha1Hash {
        self.ctx.info_hash
    }

    /// Builds a torrent and its command channel; `start` runs it.
    pub fn new(params: Params) -> (Self, Sender) {
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();

        let (
            name,
            info_hash,
            metainfo,
            magnet,
            source,
            raw_info,
            storage,
            hashes,
            private,
            tracker_urls,
        ) = match params.kind {
            TorrentKind::Metainfo {
                metainfo,
                raw_info,
                source,
            } => {
                let storage = StorageInfo::new(
                    &metainfo,
                    params.download_dir.clone(),
                );
                let hashes = hashes_from_metainfo(&metainfo);
                (
                    metainfo.name.clone(),
                    metainfo.wire_info_hash(),
                    Some(*metainfo),
                    None,
                    source,
                    Some(raw_info),
                    storage,
                    hashes,
                    false,
                    Vec::new(),
                )
            }
            TorrentKind::Magnet { magnet } => {
                let name = magnet
                    .name
                    .clone()
                    .unwrap_or_else(|| hex::encode(magnet.wire_info_hash()));
                let info_hash = magnet.wire_info_hash();
                let source = TorrentSource::Magnet {
                    uri: format!(
                        "magnet:?xt=urn:btih:{}",
                        hex::encode(info_hash)
                    ),
                };
                let trackers = magnet.trackers.clone();
                // no metadata yet: an empty store until promotion
                let storage = StorageInfo {
                    piece_count: 0,
                    piece_len: 0,
                    last_piece_len: 0,
                    download_len: 0,
                    download_dir: params.download_dir.clone(),
                    files: Vec::new(),
                };
                (
                    name,
                    info_hash,
                    None,
                    Some(*magnet),
                    source,
                    None,
                    storage,
                    Vec::new(),
                    false,
                    trackers,
                )
            }
        };

        let private = metainfo
            .as_ref()
            .map(|m| m.private)
            .unwrap_or(private);
        let tracker_urls = metainfo
            .as_ref()
            .map(|m| m.trackers.clone())
            .unwrap_or(tracker_urls);
        let piece_count = storage.piece_count;
        let store = PieceStore::new(
            storage,
            hashes,
            StoreOptions::from(&params.conf),
        );

        let ctx = Arc::new(TorrentContext {
            id: params.id,
            info_hash,
            client_id: params.client_id,
            piece_count,
            cmd_tx: cmd_tx.clone(),
            store: RwLock::new(store),
            disk_tx: params.disk_tx,
            rate_limiter: params.rate_limiter,
            conf: params.conf.clone(),
            dht_enabled: params.dht_tx.is_some(),
            private: AtomicBool::new(private),
            raw_info: std::sync::RwLock::new(
                raw_info.map(Arc::new),
            ),
            peer_filter: params.peer_filter,
            max_download_rate: AtomicU64::new(0),
        });

        let trackers = tracker_urls
            .into_iter()
            .filter_map(|url| {
                Tracker::from_url(url.clone()).map(|tracker| TrackerSlot {
                    tracker: Some(tracker),
                    url,
                    state: TrackerState::default(),
                    sent_started: false,
                    sent_completed: false,
                })
            })
            .collect();

        let pex_interval = params.discovery.pex_interval;
        let torrent = Self {
            state: LifecycleState::Initializing,
            conf: params.conf.clone(),
            discovery: params.discovery,
            alert_tx: params.alert_tx,
            dht_tx: params.dht_tx,
            listen_port: params.listen_port,
            download_dir: params.download_dir,
            name,
            metainfo,
            magnet,
            source,
            peers: HashMap::new(),
            candidates: HashMap::new(),
            banned: HashSet::new(),
            choker: Choker::new(
                params.conf.max_upload_slots,
                params.conf.optimistic_unchoke_interval,
            ),
            last_choke_tick: None,
            pex: PexState::new(pex_interval),
            trackers,
            metadata_fetch: None,
            checkpoints: CheckpointManager::new(params.checkpoint_dir),
            checkpoint_created_at: None,
            last_full_checkpoint: None,
            pending_delta: Vec::new(),
            resume_pending: false,
            disk_failures: 0,
            last_dht_lookup: None,
            dht_in_flight: false,
            start_time: Instant::now(),
            global_peers: params.global_peers,
            max_global_peers: params.max_global_peers,
            ctx,
            cmd_rx,
        };
        (torrent, cmd_tx)
    }

    /// Runs the torrent to completion of its lifecycle (shutdown).
    pub async fn start(&mut self, seeds: &[SocketAddr]) -> Result<()> {
        log::info!("Starting torrent {} ({})", self.ctx.id, self.name);

        for addr in seeds {
            self.add_candidate(*addr, PeerSource::Manual);
        }
        if let Some(magnet) = &self.magnet {
            let peers = magnet.peers.clone();
            for addr in peers {
                self.add_candidate(addr, PeerSource::Manual);
            }
        }

        if self.metainfo.is_some() {
            self.load_checkpoint().await;
            self.allocate_on_disk().await?;
            self.state = if self.ctx.store.read().await.is_complete() {
                LifecycleState::Seeding
            } else {
                LifecycleState::Downloading
            };
        } else {
            self.state = LifecycleState::FetchingMetadata;
        }

        self.run().await
    }

    async fn allocate_on_disk(&mut self) -> Result<()> {
        let (storage, hashes) = {
            let store = self.ctx.store.read().await;
            let storage = store.storage().clone();
            let hashes = (0..storage.piece_count)
                .filter_map(|i| store.expected_hash(i))
                .collect();
            (storage, hashes)
        };
        self.ctx
            .disk_tx
            .send(disk::Command::NewTorrent {
                id: self.ctx.id,
                storage_info: storage,
                piece_hashes: hashes,
                torrent_tx: self.ctx.cmd_tx.clone(),
            })
            .await
            .map_err(|_| crate::error::TorrentError::Channel)?;
        Ok(())
    }

    /// Restores state from a checkpoint, refusing (and quarantining)
    /// records that do not match this torrent's identity.
    async fn load_checkpoint(&mut self) {
        let info_hash = self.ctx.info_hash;
        let record = match self.checkpoints.load(&info_hash) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Checkpoint for {} unusable: {e}", self.name);
                return;
            }
        };

        let (piece_count, piece_len) = {
            let store = self.ctx.store.read().await;
            (store.piece_count(), store.storage().piece_len)
        };
        if let Err(e) =
            record.validate_against(&info_hash, piece_count, piece_len)
        {
            log::warn!(
                "Checkpoint for {} refused ({e}); quarantining",
                self.name
            );
            let path = self.checkpoints.record_path(&info_hash);
            self.checkpoints.quarantine(&path);
            return;
        }

        log::info!(
            "Resuming {} from checkpoint: {}/{} pieces verified",
            self.name,
            record.verified_pieces.len(),
            record.total_pieces
        );
        {
            let mut store = self.ctx.store.write().await;
            store.restore_verified(&record.verified_pieces);
            for (file, sel) in record.selection.iter().enumerate() {
                store.set_file_selection(
                    file,
                    sel.selected,
                    priority_from_code(sel.priority),
                );
            }
        }
        self.checkpoint_created_at = Some(record.created_at);
        for peer in record.peers {
            self.add_candidate(peer, PeerSource::Manual);
        }
        for slot in self.trackers.iter_mut() {
            if let Some(failures) =
                record.tracker_health.get(slot.url.as_str())
            {
                slot.state.failure_count = *failures;
            }
        }
        // the spot check runs once the disk task has our files open
        self.resume_pending = self.conf.resume_verify_pieces > 0
            && !record.verified_pieces.is_empty();
    }

    /// Spot-checks random verified pieces against disk; a single failure
    /// distrusts the whole checkpoint.
    async fn start_resume_verification(&mut self) {
        let sample: Vec<PieceIndex> = {
            let store = self.ctx.store.read().await;
            // padding-only pieces have nothing on disk to check
            let mut indices: Vec<PieceIndex> = store
                .verified_indices()
                .into_iter()
                .filter(|&i| !store.storage().is_all_padding(i))
                .collect();
            indices.shuffle(&mut rand::thread_rng());
            indices.truncate(self.conf.resume_verify_pieces);
            indices
        };
        if sample.is_empty() {
            self.resume_pending = false;
            return;
        }

        log::info!(
            "Verifying {} resumed pieces of {}",
            sample.len(),
            self.name
        );
        let mut receivers = Vec::with_capacity(sample.len());
        for index in &sample {
            let (tx, rx) = oneshot::channel();
            if self
                .ctx
                .disk_tx
                .send(disk::Command::VerifyPiece {
                    id: self.ctx.id,
                    piece_index: *index,
                    result_tx: tx,
                })
                .await
                .is_err()
            {
                return;
            }
            receivers.push(rx);
        }
        let cmd_tx = self.ctx.cmd_tx.clone();
        task::spawn(async move {
            let mut ok = true;
            for rx in receivers {
                ok &= rx.await.unwrap_or(false);
            }
            cmd_tx.send(Command::ResumeVerified { ok }).ok();
        });
    }

    async fn run(&mut self) -> Result<()> {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    if !self.handle_cmd(cmd).await? {
                        break;
                    }
                }
                _ = tick.tick() => {
                    self.tick().await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_cmd(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::Allocated { ok } => {
                if !ok {
                    log::error!("Disk allocation failed for {}", self.name);
                    self.enter_error("disk allocation failed").await;
                } else if self.resume_pending {
                    self.start_resume_verification().await;
                }
            }
            Command::ResumeVerified { ok } => {
                self.resume_pending = false;
                if !ok {
                    log::warn!(
                        "Resume verification failed for {}; starting over",
                        self.name
                    );
                    let path =
                        self.checkpoints.record_path(&self.ctx.info_hash);
                    self.checkpoints.quarantine(&path);
                    self.rebuild_store_from_scratch().await;
                }
            }
            Command::PieceCompletion(result) => {
                self.handle_piece_completion(result).await?;
            }
            Command::ReadError { block_info, error } => {
                log::warn!(
                    "Read error for {block_info} of {}: {error}",
                    self.name
                );
            }
            Command::PeerConnected { addr, id } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.id = Some(id);
                }
                if let Some(candidate) = self.candidates.get_mut(&addr) {
                    candidate.successes += 1;
                    candidate.failures = 0;
                    candidate.breaker_opened_at = None;
                }
            }
            Command::PeerState { addr, info } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.last_tick = Some(info);
                }
            }
            Command::SessionEnded { addr, result } => {
                self.handle_session_ended(addr, result);
            }
            Command::CancelBlock { addr, block } => {
                if let Some(handle) = self.peers.get(&addr) {
                    handle.tx.send(peer::Command::CancelBlock(block)).ok();
                }
            }
            Command::MetadataSize { addr, size } => {
                self.handle_metadata_size(addr, size);
            }
            Command::MetadataPiece { addr, msg } => {
                self.handle_metadata_piece(addr, msg).await?;
            }
            Command::PexReceived { addr, msg } => {
                if self.ctx.is_private() {
                    return Ok(true);
                }
                log::debug!(
                    "PEX from {addr}: {} added, {} dropped",
                    msg.added.len(),
                    msg.dropped.len()
                );
                for peer in msg.added {
                    self.add_candidate(peer, PeerSource::Pex);
                }
            }
            Command::PeerAccepted {
                stream,
                handshake,
                read_buf,
            } => {
                self.handle_inbound(stream, handshake, read_buf);
            }
            Command::AddPeers { peers, source } => {
                if source == PeerSource::Dht {
                    self.dht_in_flight = false;
                }
                for peer in peers {
                    self.add_candidate(peer, source);
                }
            }
            Command::AnnounceResult {
                slot,
                tracker,
                event,
                result,
            } => {
                self.handle_announce_result(slot, tracker, event, result);
            }
            Command::SetFileSelection {
                file,
                selected,
                priority,
            } => {
                let mut store = self.ctx.store.write().await;
                store.set_file_selection(file, selected, priority);
            }
            Command::Pause => {
                if !matches!(
                    self.state,
                    LifecycleState::Paused | LifecycleState::Error
                ) {
                    log::info!("Pausing torrent {}", self.name);
                    self.state = LifecycleState::Paused;
                    self.stop_sessions().await;
                    self.announce_event_everywhere(Event::Stopped);
                    self.flush_full_checkpoint().await;
                }
            }
            Command::Resume => {
                if matches!(
                    self.state,
                    LifecycleState::Paused | LifecycleState::Error
                ) {
                    log::info!("Resuming torrent {}", self.name);
                    self.disk_failures = 0;
                    for slot in self.trackers.iter_mut() {
                        slot.sent_started = false;
                    }
                    self.state = if self.metainfo.is_none() {
                        LifecycleState::FetchingMetadata
                    } else if self.ctx.store.read().await.is_complete() {
                        LifecycleState::Seeding
                    } else {
                        LifecycleState::Downloading
                    };
                }
            }
            Command::Shutdown => {
                log::info!("Shutting down torrent {}", self.name);
                self.stop_sessions().await;
                self.announce_event_everywhere(Event::Stopped);
                self.flush_full_checkpoint().await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ==================== piece lifecycle ====================

    async fn handle_piece_completion(
        &mut self,
        result: std::result::Result<PieceCompletion, WriteError>,
    ) -> Result<()> {
        match result {
            Ok(PieceCompletion { index, is_valid }) => {
                if is_valid {
                    self.disk_failures = 0;
                    self.on_piece_verified(index).await?;
                } else {
                    self.on_piece_rejected(index).await;
                }
            }
            Err(e) => {
                log::error!("Disk write failed for {}: {e}", self.name);
                self.disk_failures += 1;
                // the piece's buffered blocks are gone; re-download it
                // unless the disk looks dead
                if self.disk_failures >= 3 {
                    self.enter_error("disk write failed repeatedly").await;
                }
            }
        }
        Ok(())
    }

    async fn on_piece_verified(&mut self, index: PieceIndex) -> Result<()> {
        let (torrent_complete, fraction) = {
            let mut store = self.ctx.store.write().await;
            let outcome = store.handle_verification(index, true);
            (outcome.torrent_complete, store.completed_fraction())
        };
        log::info!(
            "Piece {index} of {} verified ({:.1}%)",
            self.name,
            fraction * 100.0
        );

        // everyone learns we have a new piece
        for handle in self.peers.values() {
            handle.tx.send(peer::Command::SendHave { index }).ok();
        }

        self.pending_delta.push(index);
        if self.conf.checkpoint_on_piece {
            self.flush_delta_checkpoint().await;
        }

        if torrent_complete {
            log::info!("Torrent {} complete; now seeding", self.name);
            self.state = LifecycleState::Seeding;
            self.ctx
                .disk_tx
                .send(disk::Command::FinalizeTorrent { id: self.ctx.id })
                .await
                .ok();
            self.announce_event_everywhere(Event::Completed);
            self.alert_tx
                .send(Alert::TorrentComplete(self.ctx.id))
                .ok();
            self.flush_full_checkpoint().await;
        }
        Ok(())
    }

    async fn on_piece_rejected(&mut self, index: PieceIndex) {
        let participants = {
            let mut store = self.ctx.store.write().await;
            store.handle_verification(index, false).participants
        };
        log::warn!(
            "Piece {index} of {} failed its hash check; {} peers implicated",
            self.name,
            participants.len()
        );
        for addr in participants {
            self.record_violation(addr);
        }
    }

    fn record_violation(&mut self, addr: SocketAddr) {
        let threshold = self.conf.peer_violation_threshold;
        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.violations += 1;
            if handle.violations >= threshold {
                log::warn!(
                    "Peer {addr} exceeded the violation threshold; banning"
                );
                self.banned.insert(addr);
                handle.tx.send(peer::Command::Shutdown).ok();
            }
        } else {
            self.banned.insert(addr);
        }
    }

    async fn rebuild_store_from_scratch(&mut self) {
        let Some(metainfo) = &self.metainfo else {
            return;
        };
        let storage =
            StorageInfo::new(metainfo, self.download_dir.clone());
        let hashes = hashes_from_metainfo(metainfo);
        let mut store = self.ctx.store.write().await;
        *store = PieceStore::new(
            storage,
            hashes,
            StoreOptions::from(&self.conf),
        );
        self.state = LifecycleState::Downloading;
    }

    async fn enter_error(&mut self, reason: &str) {
        self.state = LifecycleState::Error;
        self.stop_sessions().await;
        self.alert_tx
            .send(Alert::TorrentError {
                id: self.ctx.id,
                reason: reason.to_owned(),
            })
            .ok();
    }

    // ==================== peers ====================

    fn add_candidate(&mut self, addr: SocketAddr, source: PeerSource) {
        if self.banned.contains(&addr) {
            return;
        }
        self.candidates
            .entry(addr)
            .or_insert_with(|| PeerCandidate::new(addr, source));
    }

    fn handshake_timeout(&self) -> Duration {
        let count = self.peers.len();
        let health = SwarmHealth::from_peer_count(count);
        let band = match health {
            SwarmHealth::Desperation => {
                self.conf.handshake_timeout_desperation
            }
            SwarmHealth::Normal => self.conf.handshake_timeout_normal,
            SwarmHealth::Healthy => self.conf.handshake_timeout_healthy,
        };
        health.timeout_within(band, count)
    }

    /// Opens outbound sessions to the best unconnected candidates, up to
    /// the per-torrent cap.
    fn connect_candidates(&mut self) {
        if matches!(
            self.state,
            LifecycleState::Paused
                | LifecycleState::Error
                | LifecycleState::Initializing
        ) {
            return;
        }
        let global_room = self
            .max_global_peers
            .saturating_sub(self.global_peers.load(Ordering::Relaxed));
        let capacity = self
            .conf
            .max_connected_peer_count
            .saturating_sub(self.peers.len())
            .min(global_room);
        if capacity == 0 {
            return;
        }

        let recovery = self.conf.circuit_breaker_recovery_timeout;
        let mut ranked: Vec<PeerCandidate> = self
            .candidates
            .values()
            .filter(|c| {
                !self.peers.contains_key(&c.addr)
                    && !self.banned.contains(&c.addr)
                    && !c.breaker_open(recovery)
            })
            .cloned()
            .collect();
        ranked.sort_by(|a, b| {
            b.rank()
                .partial_cmp(&a.rank())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let timeout = self.handshake_timeout();
        for candidate in ranked.into_iter().take(capacity) {
            self.spawn_outbound(candidate.addr, candidate.source, timeout);
        }
    }

    fn spawn_outbound(
        &mut self,
        addr: SocketAddr,
        source: PeerSource,
        handshake_timeout: Duration,
    ) {
        log::debug!("Connecting to candidate {addr}");
        let (mut session, tx) = PeerSession::new(
            Arc::clone(&self.ctx),
            addr,
            Direction::Outbound,
            source,
        );
        self.global_peers.fetch_add(1, Ordering::Relaxed);
        let cmd_tx = self.ctx.cmd_tx.clone();
        let join = task::spawn(async move {
            let result = session.start_outbound(handshake_timeout).await;
            cmd_tx.send(Command::SessionEnded { addr, result }).ok();
        });
        self.peers.insert(
            addr,
            PeerHandle {
                tx,
                join: Some(join),
                id: None,
                connected_at: Instant::now(),
                last_tick: None,
                serves_metadata: false,
                violations: 0,
            },
        );
    }

    fn handle_inbound(
        &mut self,
        stream: TcpStream,
        handshake: Handshake,
        read_buf: bytes::BytesMut,
    ) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if matches!(
            self.state,
            LifecycleState::Paused | LifecycleState::Error
        ) || self.banned.contains(&addr)
            || self.peers.contains_key(&addr)
            || self.peers.len() >= self.conf.max_connected_peer_count
            || self.global_peers.load(Ordering::Relaxed)
                >= self.max_global_peers
        {
            // politely refuse: dropping the stream closes it
            log::debug!("Refusing inbound peer {addr}");
            return;
        }

        log::info!("Accepting inbound peer {addr}");
        self.global_peers.fetch_add(1, Ordering::Relaxed);
        let (mut session, tx) = PeerSession::new(
            Arc::clone(&self.ctx),
            addr,
            Direction::Inbound,
            PeerSource::Manual,
        );
        let cmd_tx = self.ctx.cmd_tx.clone();
        let join = task::spawn(async move {
            let result =
                session.start_inbound(stream, handshake, read_buf).await;
            cmd_tx.send(Command::SessionEnded { addr, result }).ok();
        });
        self.peers.insert(
            addr,
            PeerHandle {
                tx,
                join: Some(join),
                id: None,
                connected_at: Instant::now(),
                last_tick: None,
                serves_metadata: false,
                violations: 0,
            },
        );
        self.add_candidate(addr, PeerSource::Manual);
    }

    fn handle_session_ended(
        &mut self,
        addr: SocketAddr,
        result: std::result::Result<(), PeerError>,
    ) {
        let handle = self.peers.remove(&addr);
        if handle.is_some() {
            self.global_peers.fetch_sub(1, Ordering::Relaxed);
        }
        self.choker.forget(addr);

        let handshaken =
            handle.as_ref().map(|h| h.id.is_some()).unwrap_or(false);
        match result {
            Ok(()) => {
                log::debug!("Peer {addr} session ended cleanly");
            }
            Err(PeerError::Violation(violation)) => {
                log::warn!("Peer {addr} violated protocol: {violation}");
                self.record_violation(addr);
            }
            Err(e) => {
                log::debug!("Peer {addr} session failed: {e}");
                if !handshaken {
                    // a failed connect counts against the endpoint's
                    // circuit breaker
                    let threshold =
                        self.conf.circuit_breaker_failure_threshold;
                    if let Some(candidate) =
                        self.candidates.get_mut(&addr)
                    {
                        candidate.failures += 1;
                        if candidate.failures >= threshold {
                            log::info!(
                                "Circuit breaker open for {addr} after \
                                 {} failures",
                                candidate.failures
                            );
                            candidate.breaker_opened_at =
                                Some(Instant::now());
                            candidate.failures = 0;
                        }
                    }
                }
            }
        }
    }

    async fn stop_sessions(&mut self) {
        for handle in self.peers.values() {
            handle.tx.send(peer::Command::Shutdown).ok();
        }
        self.global_peers
            .fetch_sub(self.peers.len(), Ordering::Relaxed);
        for (_, mut handle) in self.peers.drain() {
            if let Some(join) = handle.join.take() {
                join.await.ok();
            }
        }
        self.choker = Choker::new(
            self.conf.max_upload_slots,
            self.conf.optimistic_unchoke_interval,
        );
    }

    // ==================== metadata exchange ====================

    fn handle_metadata_size(&mut self, addr: SocketAddr, size: u64) {
        if self.metainfo.is_some() {
            return;
        }
        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.serves_metadata = true;
        }
        if self.metadata_fetch.is_none() {
            match MetadataFetch::new(self.ctx.info_hash, size) {
                Ok(fetch) => {
                    log::info!(
                        "Fetching metadata for {} ({} bytes, {} pieces)",
                        self.name,
                        fetch.total_size(),
                        fetch.piece_count()
                    );
                    self.metadata_fetch = Some(fetch);
                }
                Err(e) => {
                    log::warn!(
                        "Peer {addr} advertised bad metadata size: {e:?}"
                    );
                    return;
                }
            }
        }
        self.request_metadata_pieces();
    }

    /// Asks every metadata-capable peer for the next missing pieces.
    fn request_metadata_pieces(&mut self) {
        let Some(fetch) = &mut self.metadata_fetch else {
            return;
        };
        for (addr, handle) in self.peers.iter() {
            if !handle.serves_metadata {
                continue;
            }
            while let Some(piece) = fetch.next_request(*addr) {
                handle
                    .tx
                    .send(peer::Command::RequestMetadata { piece })
                    .ok();
            }
        }
    }

    async fn handle_metadata_piece(
        &mut self,
        addr: SocketAddr,
        msg: MetadataMsg,
    ) -> Result<()> {
        enum Step {
            Nothing,
            Promote(Vec<u8>),
            Penalize(Vec<SocketAddr>),
        }
        let step = {
            let Some(fetch) = &mut self.metadata_fetch else {
                return Ok(());
            };
            match msg {
                MetadataMsg::Reject { piece } => {
                    fetch.on_reject(addr, piece);
                    Step::Nothing
                }
                MetadataMsg::Data { piece, payload, .. } => {
                    match fetch.on_data(addr, piece, payload) {
                        Ok(Some(info_bytes)) => Step::Promote(info_bytes),
                        Ok(None) => Step::Nothing,
                        Err(MetadataError::HashMismatch(contributors)) => {
                            Step::Penalize(contributors)
                        }
                        Err(MetadataError::BadSize(_)) => Step::Nothing,
                    }
                }
                // serving happens in the session; nothing to do here
                MetadataMsg::Request { .. } => Step::Nothing,
            }
        };
        match step {
            Step::Nothing => {}
            Step::Promote(info_bytes) => {
                self.promote_metadata(info_bytes).await?;
            }
            Step::Penalize(contributors) => {
                log::warn!(
                    "Metadata for {} failed verification",
                    self.name
                );
                for addr in contributors {
                    self.record_violation(addr);
                }
            }
        }
        self.request_metadata_pieces();
        Ok(())
    }

    /// Turns the fetched info dictionary into a full torrent: rebuilds
    /// the context and store, allocates on disk and reconnects peers.
    async fn promote_metadata(&mut self, info_bytes: Vec<u8>) -> Result<()> {
        let trackers = self
            .magnet
            .as_ref()
            .map(|m| m.trackers.clone())
            .unwrap_or_default();
        let metainfo = match Metainfo::from_info_dict_bytes(
            &info_bytes,
            trackers,
        ) {
            Ok(metainfo) => metainfo,
            Err(e) => {
                log::warn!(
                    "Fetched metadata for {} does not parse: {e}",
                    self.name
                );
                self.metadata_fetch = None;
                return Ok(());
            }
        };
        debug_assert_eq!(metainfo.wire_info_hash(), self.ctx.info_hash);

        log::info!(
            "Metadata complete for {}: {} files, {} pieces",
            self.name,
            metainfo.files.len(),
            metainfo.piece_count()
        );
        self.metadata_fetch = None;
        self.name = metainfo.name.clone();

        // sessions were sized for "no metadata"; restart them against
        // the rebuilt context
        self.stop_sessions().await;

        let storage =
            StorageInfo::new(&metainfo, self.download_dir.clone());
        let piece_count = storage.piece_count;
        let hashes = hashes_from_metainfo(&metainfo);
        let mut store = PieceStore::new(
            storage,
            hashes,
            StoreOptions::from(&self.conf),
        );
        if let Some(select_only) = self
            .magnet
            .as_ref()
            .filter(|m| !m.select_only.is_empty())
            .map(|m| m.select_only.clone())
        {
            let selection = FileSelection::select_only(
                store.storage(),
                &select_only,
            );
            store.replace_selection(selection);
        }

        self.ctx = Arc::new(TorrentContext {
            id: self.ctx.id,
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            piece_count,
            cmd_tx: self.ctx.cmd_tx.clone(),
            store: RwLock::new(store),
            disk_tx: self.ctx.disk_tx.clone(),
            rate_limiter: Arc::clone(&self.ctx.rate_limiter),
            conf: self.conf.clone(),
            dht_enabled: self.ctx.dht_enabled,
            private: AtomicBool::new(metainfo.private),
            raw_info: std::sync::RwLock::new(Some(Arc::new(info_bytes))),
            peer_filter: self.ctx.peer_filter.clone(),
            max_download_rate: AtomicU64::new(0),
        });
        self.metainfo = Some(metainfo);

        self.allocate_on_disk().await?;
        self.state = LifecycleState::Downloading;
        self.alert_tx
            .send(Alert::MetadataComplete(self.ctx.id))
            .ok();
        Ok(())
    }

    // ==================== trackers & discovery ====================

    /// Fires one announce task per due tracker.
    fn schedule_announces(&mut self) {
        if matches!(
            self.state,
            LifecycleState::Paused
                | LifecycleState::Error
                | LifecycleState::Initializing
        ) {
            return;
        }
        let peer_count = self.peers.len();
        let wanted = self.conf.min_requested_peer_count;
        let bounds = (
            self.conf.announce_interval_min,
            self.conf.announce_interval_max,
        );

        for slot_index in 0..self.trackers.len() {
            let slot = &self.trackers[slot_index];
            if slot.tracker.is_none()
                || slot.state.is_defunct(self.conf.tracker_error_threshold)
            {
                continue;
            }
            let due = match slot.state.last_announce {
                None => true,
                Some(at) => {
                    at.elapsed()
                        >= slot.state.next_announce_in(
                            bounds, peer_count, wanted,
                        )
                }
            };
            // failures push the next attempt out by the backoff delay
            let backoff_blocks = match (
                slot.state.backoff_delay,
                slot.state.last_failure,
            ) {
                (Some(delay), Some(at)) => at.elapsed() < delay,
                _ => false,
            };
            if !due || backoff_blocks {
                continue;
            }
            let event = if !slot.sent_started {
                Some(Event::Started)
            } else {
                None
            };
            self.spawn_announce(slot_index, event);
        }
    }

    fn spawn_announce(&mut self, slot_index: usize, event: Option<Event>) {
        let Some(slot) = self.trackers.get_mut(slot_index) else {
            return;
        };
        let Some(mut tracker) = slot.tracker.take() else {
            return;
        };
        let params = self.announce_params(event);
        let timeout = self.conf.tracker_timeout;
        let cmd_tx = self.ctx.cmd_tx.clone();
        task::spawn(async move {
            let result = tracker.announce(params, timeout).await;
            cmd_tx
                .send(Command::AnnounceResult {
                    slot: slot_index,
                    tracker,
                    event,
                    result,
                })
                .ok();
        });
    }

    fn announce_params(&self, event: Option<Event>) -> Announce {
        let (downloaded, uploaded, left) = self.transfer_totals();
        Announce {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.listen_port,
            ip: None,
            downloaded,
            uploaded,
            left,
            peer_count: Some(self.conf.min_requested_peer_count.max(30)),
            tracker_id: None,
            event,
        }
    }

    fn transfer_totals(&self) -> (u64, u64, u64) {
        let mut downloaded = 0;
        let mut uploaded = 0;
        for handle in self.peers.values() {
            if let Some(tick) = &handle.last_tick {
                downloaded += tick.downloaded_payload;
                uploaded += tick.uploaded_payload;
            }
        }
        // `left` derives from the store, not the counters, so it is
        // correct across restarts
        let left = self
            .ctx
            .store
            .try_read()
            .map(|store| {
                let (verified, total) = store.progress();
                let piece_len =
                    store.storage().piece_len as u64;
                ((total - verified) as u64).saturating_mul(piece_len)
            })
            .unwrap_or(0);
        (downloaded, uploaded, left)
    }

    fn handle_announce_result(
        &mut self,
        slot_index: usize,
        tracker: Tracker,
        event: Option<Event>,
        result: std::result::Result<Response, TrackerError>,
    ) {
        let Some(slot) = self.trackers.get_mut(slot_index) else {
            return;
        };
        slot.tracker = Some(tracker);
        match result {
            Ok(response) => {
                log::info!(
                    "Tracker {} returned {} peers",
                    slot.url,
                    response.peers.len()
                );
                slot.state.record_success(&response);
                match event {
                    Some(Event::Started) => slot.sent_started = true,
                    Some(Event::Completed) => slot.sent_completed = true,
                    _ => {}
                }
                let peers = response.peers;
                for peer in peers {
                    self.add_candidate(peer, PeerSource::Tracker);
                }
            }
            Err(e) => {
                log::warn!("Tracker {} announce failed: {e}", slot.url);
                slot.state.record_failure(
                    self.conf.tracker_backoff_base,
                    self.conf.tracker_backoff_max,
                );
            }
        }
    }

    /// Fire-and-forget event announces (completed, stopped).
    fn announce_event_everywhere(&mut self, event: Event) {
        for slot_index in 0..self.trackers.len() {
            let slot = &self.trackers[slot_index];
            if slot.tracker.is_none() || !slot.sent_started {
                continue;
            }
            if event == Event::Completed && slot.sent_completed {
                continue;
            }
            self.spawn_announce(slot_index, Some(event));
        }
    }

    /// Kicks off a DHT lookup when the swarm looks thin.
    fn maybe_dht_lookup(&mut self) {
        let Some(dht_tx) = &self.dht_tx else {
            return;
        };
        if self.ctx.is_private()
            || self.dht_in_flight
            || matches!(
                self.state,
                LifecycleState::Paused
                    | LifecycleState::Error
                    | LifecycleState::Initializing
            )
        {
            return;
        }
        let starving =
            self.peers.len() < self.conf.min_requested_peer_count;
        let refresh_due = self
            .last_dht_lookup
            .map(|at| at.elapsed() >= Duration::from_secs(300))
            .unwrap_or(true);
        if !starving && !refresh_due {
            return;
        }

        let count = self.peers.len();
        let health = SwarmHealth::from_peer_count(count);
        let band = match health {
            SwarmHealth::Desperation => {
                self.discovery.dht_timeout_desperation
            }
            SwarmHealth::Normal => self.discovery.dht_timeout_normal,
            SwarmHealth::Healthy => self.discovery.dht_timeout_healthy,
        };
        let timeout = health.timeout_within(band, count);

        let (tx, rx) = oneshot::channel();
        if dht_tx
            .send(dht::Command::GetPeers {
                info_hash: self.ctx.info_hash,
                announce_port: Some(self.listen_port),
                timeout,
                result_tx: tx,
            })
            .is_err()
        {
            return;
        }
        self.dht_in_flight = true;
        self.last_dht_lookup = Some(Instant::now());
        let cmd_tx = self.ctx.cmd_tx.clone();
        task::spawn(async move {
            let peers = rx.await.unwrap_or_default();
            cmd_tx
                .send(Command::AddPeers {
                    peers,
                    source: PeerSource::Dht,
                })
                .ok();
        });
    }

    // ==================== periodic work ====================

    async fn tick(&mut self) -> Result<()> {
        if matches!(
            self.state,
            LifecycleState::Paused | LifecycleState::Error
        ) {
            return Ok(());
        }

        self.connect_candidates();
        self.schedule_announces();
        self.maybe_dht_lookup();

        // a DHT answer resets the flag through AddPeers; a timed out
        // lookup must not pin it forever
        if self
            .last_dht_lookup
            .map(|at| at.elapsed() > Duration::from_secs(120))
            .unwrap_or(false)
        {
            self.dht_in_flight = false;
        }

        self.choke_tick();
        self.pex_tick();
        self.request_metadata_pieces();
        self.update_rate_views();

        // periodic full checkpoint
        let full_due = self
            .last_full_checkpoint
            .map(|at| at.elapsed() >= self.conf.checkpoint_interval)
            .unwrap_or(true);
        if full_due && self.metainfo.is_some() {
            self.flush_full_checkpoint().await;
        }

        self.send_stats().await;
        Ok(())
    }

    fn choke_tick(&mut self) {
        let due = self
            .last_choke_tick
            .map(|at| at.elapsed() >= self.conf.unchoke_interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_choke_tick = Some(Instant::now());

        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter_map(|(addr, handle)| {
                let tick = handle.last_tick.as_ref()?;
                Some(ChokeCandidate {
                    addr: *addr,
                    peer_interested: tick.state.peer_interested,
                    download_rate: tick.download_rate,
                    upload_rate: tick.upload_rate,
                    connected_at: handle.connected_at,
                })
            })
            .collect();
        let seeding = self.state == LifecycleState::Seeding;
        let decision =
            self.choker.tick(&candidates, seeding, Instant::now());
        for addr in decision.unchoke {
            if let Some(handle) = self.peers.get(&addr) {
                handle.tx.send(peer::Command::Unchoke).ok();
            }
        }
        for addr in decision.choke {
            if let Some(handle) = self.peers.get(&addr) {
                handle.tx.send(peer::Command::Choke).ok();
            }
        }
    }

    fn pex_tick(&mut self) {
        if self.ctx.is_private() {
            return;
        }
        let connected: HashSet<SocketAddr> =
            self.peers.keys().copied().collect();
        if let Some(msg) = self.pex.compose(&connected, Instant::now()) {
            log::debug!(
                "PEX flush for {}: {} added, {} dropped",
                self.name,
                msg.added.len(),
                msg.dropped.len()
            );
            for handle in self.peers.values() {
                handle.tx.send(peer::Command::SendPex(msg.clone())).ok();
            }
        }
    }

    /// Publishes the fastest per-peer download rate for the
    /// bandwidth-weighted picker.
    fn update_rate_views(&self) {
        let max = self
            .peers
            .values()
            .filter_map(|h| h.last_tick.as_ref())
            .map(|t| t.download_rate)
            .max()
            .unwrap_or(0);
        self.ctx.set_max_download_rate(max);
    }

    async fn send_stats(&mut self) {
        let (verified, total, fraction, endgame) = {
            let store = self.ctx.store.read().await;
            let (verified, total) = store.progress();
            (
                verified,
                total,
                store.completed_fraction(),
                store.is_endgame(),
            )
        };
        let mut download_rate = 0;
        let mut upload_rate = 0;
        let mut downloaded_payload = 0;
        let mut uploaded_payload = 0;
        let mut unchoked_us = 0;
        for handle in self.peers.values() {
            if let Some(tick) = &handle.last_tick {
                download_rate += tick.download_rate;
                upload_rate += tick.upload_rate;
                downloaded_payload += tick.downloaded_payload;
                uploaded_payload += tick.uploaded_payload;
                if !tick.state.peer_choking {
                    unchoked_us += 1;
                }
            }
        }
        let stats = TorrentStats {
            state: self.state,
            run_duration: self.start_time.elapsed(),
            verified_pieces: verified,
            total_pieces: total,
            completion: fraction,
            endgame,
            download_rate,
            upload_rate,
            downloaded_payload,
            uploaded_payload,
            peer_count: self.peers.len(),
            unchoked_us_count: unchoked_us,
            candidate_count: self.candidates.len(),
        };
        self.alert_tx
            .send(Alert::TorrentStats {
                id: self.ctx.id,
                stats: Box::new(stats),
            })
            .ok();
    }

    // ==================== checkpoints ====================

    async fn flush_delta_checkpoint(&mut self) {
        if self.pending_delta.is_empty() {
            return;
        }
        let encoded = self.checkpoints.encode_delta(
            &self.ctx.info_hash,
            self.pending_delta.clone(),
        );
        match encoded {
            Ok((path, bytes)) => {
                let (tx, rx) = oneshot::channel();
                if self
                    .ctx
                    .disk_tx
                    .send(disk::Command::WriteFileAtomic {
                        path,
                        bytes,
                        result_tx: tx,
                    })
                    .await
                    .is_ok()
                {
                    task::spawn(async move {
                        if let Ok(Err(e)) = rx.await {
                            log::warn!("Delta checkpoint write failed: {e}");
                        }
                    });
                }
            }
            Err(e) => log::warn!("Delta checkpoint encoding failed: {e}"),
        }
    }

    async fn flush_full_checkpoint(&mut self) {
        if self.metainfo.is_none() {
            // nothing resumable before the metadata exists
            return;
        }
        let record = {
            let store = self.ctx.store.read().await;
            CheckpointRecord::build(
                &self.ctx.info_hash,
                &self.name,
                store.storage(),
                &store.piece_states(),
                store.selection(),
                self.source.clone(),
                self.trackers
                    .iter()
                    .map(|s| s.url.to_string())
                    .collect(),
                self.trackers
                    .iter()
                    .map(|s| (s.url.to_string(), s.state.failure_count))
                    .collect(),
                self.peers.keys().copied().collect(),
                self.checkpoint_created_at,
            )
        };
        self.checkpoint_created_at = Some(record.created_at);

        match self.checkpoints.encode_full(&record) {
            Ok((path, bytes)) => {
                let (tx, rx) = oneshot::channel();
                if self
                    .ctx
                    .disk_tx
                    .send(disk::Command::WriteFileAtomic {
                        path,
                        bytes,
                        result_tx: tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                let delta_path =
                    self.checkpoints.delta_path(&self.ctx.info_hash);
                task::spawn(async move {
                    match rx.await {
                        Ok(Ok(())) => {
                            // the full record supersedes the delta
                            match std::fs::remove_file(&delta_path) {
                                Ok(())  => {}
                                Err(e)
                                    if e.kind()
                                        == std::io::ErrorKind::NotFound => {}
                                Err(e) => log::warn!(
                                    "Failed to drop stale delta: {e}"
                                ),
                            }
                        }
                        Ok(Err(e)) => {
                            // never blocks downloads; retried next round
                            log::warn!("Checkpoint write failed: {e}");
                        }
                        Err(_) => {}
                    }
                });
                self.last_full_checkpoint = Some(Instant::now());
                self.pending_delta.clear();
            }
            Err(e) => log::warn!("Checkpoint encoding failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_state_is_plain_data() {
        assert_ne!(LifecycleState::Paused, LifecycleState::Error);
        assert_eq!(
            LifecycleState::FetchingMetadata,
            LifecycleState::FetchingMetadata
        );
    }
}
