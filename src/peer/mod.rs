//! Peer sessions: the per-connection protocol state machines.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::blockinfo::Block;
use crate::peer::extension::PexMsg;
use crate::{Bitfield, PeerId, PieceIndex};

pub(crate) mod codec;
pub(crate) mod extension;
pub(crate) mod session;

pub(crate) use session::{Direction, PeerSession};

/// The channel on which a torrent (or the disk task) sends commands to
/// a peer session.
pub(crate) type Sender = UnboundedSender<Command>;
pub(crate) type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// The result of a disk read for a block the peer requested; sends the
    /// PIECE message.
    Block(Block),
    /// Announce a freshly verified piece to the peer and recompute our
    /// interest.
    SendHave { index: PieceIndex },
    /// The choking controller granted this peer an unchoke slot.
    Unchoke,
    /// The choking controller revoked this peer's slot.
    Choke,
    /// Withdraw an outstanding block request (endgame duplicate already
    /// delivered elsewhere).
    CancelBlock(crate::blockinfo::BlockInfo),
    /// Ask the peer for a metadata piece over ut_metadata.
    RequestMetadata { piece: usize },
    /// Send a PEX delta to the peer.
    SendPex(PexMsg),
    /// Eventually shut down the session gracefully.
    Shutdown,
}

/// The source a peer endpoint was learned from. Affects the candidate
/// queue ranking and the session's quality prior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Lsd,
    Manual,
}

impl PeerSource {
    /// The prior trust weight of the source, in `0.0..=1.0`.
    pub(crate) fn weight(&self) -> f64 {
        match self {
            Self::Manual => 1.0,
            Self::Tracker => 0.8,
            Self::Dht => 0.6,
            Self::Pex => 0.5,
            Self::Lsd => 0.5,
        }
    }
}

/// An endpoint the torrent may connect to, with accumulated history.
#[derive(Clone, Debug)]
pub(crate) struct PeerCandidate {
    pub addr: SocketAddr,
    pub source: PeerSource,
    /// Consecutive connect failures; feeds the circuit breaker.
    pub failures: usize,
    /// When the circuit breaker opened, if it is open.
    pub breaker_opened_at: Option<Instant>,
    /// Successful sessions with this endpoint.
    pub successes: usize,
}

impl PeerCandidate {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            failures: 0,
            breaker_opened_at: None,
            successes: 0,
        }
    }

    /// Candidate ordering score: source trust adjusted by history.
    pub fn rank(&self) -> f64 {
        let history = self.successes as f64 - self.failures as f64;
        self.source.weight() + history.clamp(-3.0, 3.0) * 0.1
    }

    /// Whether the circuit breaker currently suppresses connects.
    pub fn breaker_open(&self, recovery_timeout: Duration) -> bool {
        match self.breaker_opened_at {
            Some(at) => at.elapsed() < recovery_timeout,
            None => false,
        }
    }
}

/// A peer session's derived quality, `0.0..=1.0`, combining transfer
/// rates, connection success and inactivity. Scores decay toward the
/// neutral 0.5 as evidence ages.
#[derive(Debug)]
pub(crate) struct PeerQuality {
    /// Fresh sessions inherit a prior from their source.
    source_weight: f64,
    /// Exponential accumulator of goodness signals.
    score: f64,
    /// Request timeouts charged against the peer.
    pub timeouts: usize,
    /// Protocol violations observed.
    pub violations: usize,
    last_update: Instant,
}

impl PeerQuality {
    const DECAY_HALF_LIFE: Duration = Duration::from_secs(120);

    pub fn new(source: PeerSource) -> Self {
        Self {
            source_weight: source.weight(),
            score: 0.5,
            timeouts: 0,
            violations: 0,
            last_update: Instant::now(),
        }
    }

    fn decay(&mut self) {
        let elapsed = self.last_update.elapsed();
        self.last_update = Instant::now();
        let halvings =
            elapsed.as_secs_f64() / Self::DECAY_HALF_LIFE.as_secs_f64();
        let keep = 0.5f64.powf(halvings);
        self.score = 0.5 + (self.score - 0.5) * keep;
    }

    /// Nudges the score by a signed signal in `-1.0..=1.0`.
    pub fn record(&mut self, signal: f64) {
        self.decay();
        self.score = (self.score + signal * 0.1).clamp(0.0, 1.0);
    }

    /// The current score, with decay and the source prior mixed in.
    pub fn score(&self) -> f64 {
        let elapsed = self.last_update.elapsed();
        let halvings =
            elapsed.as_secs_f64() / Self::DECAY_HALF_LIFE.as_secs_f64();
        let keep = 0.5f64.powf(halvings);
        let decayed = 0.5 + (self.score - 0.5) * keep;
        (0.85 * decayed + 0.15 * self.source_weight).clamp(0.0, 1.0)
    }
}

/// The most essential information of a peer session that is sent to
/// torrent with each session tick.
pub(crate) struct SessionTick {
    /// A snapshot of the session state.
    pub state: SessionSnapshot,
    /// The session's per-second transfer rates, payload only.
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Total payload bytes moved in each direction.
    pub downloaded_payload: u64,
    pub uploaded_payload: u64,
    /// The number of pieces the peer has available.
    pub piece_count: usize,
    /// The derived quality score.
    pub quality: f64,
    /// When the peer last sent us anything.
    pub last_activity: Instant,
}

/// The subset of session state the torrent's controllers act on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SessionSnapshot {
    pub connection: ConnectionState,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

/// At any given time, a connection with a peer is in one of these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// The TCP connection is being established.
    Connecting,
    /// Our handshake is on the wire, the peer's hasn't arrived.
    Handshaking,
    /// Handshakes exchanged; the optional extension handshake and the
    /// one-shot bitfield exchange happen here.
    AvailabilityExchange,
    /// The steady state in which any message may be exchanged.
    Connected,
    /// The session hit a protocol or IO error and is being torn down.
    Error,
    /// The session has stopped.
    Disconnected,
}

/// Information about the connected peer, set after a successful handshake.
pub(crate) struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    pub id: PeerId,
    /// All pieces the peer has, kept current through HAVE messages.
    pub pieces: Bitfield,
    /// The peer's extension handshake, when one arrived.
    pub extensions: Option<extension::ExtensionHandshake>,
}
