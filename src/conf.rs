//! This module defines types used to configure the engine and its parts.
//!
//! Defaults follow widely deployed client behavior; each knob is overridable
//! per engine, and the per-torrent subset also per torrent.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The Azureus-style client id prefix: dash, two letter client code, four
/// digit version, dash. The remaining 12 bytes are randomized per engine.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RT0010-";

/// Generates a fresh BEP 20 peer id: the fixed client prefix followed by
/// 12 random alphanumeric characters.
pub fn gen_client_id() -> PeerId {
    use rand::Rng;
    const CHARSET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = CHARSET[rng.gen_range(0..CHARSET.len())];
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Debug, Clone)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub disk: DiskConf,
    pub discovery: DiscoveryConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// A random client id is generated.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        Self {
            engine: EngineConf {
                client_id: gen_client_id(),
                checkpoint_dir: download_dir.join(".riptide/checkpoints"),
                download_dir,
                listen_addr: None,
                max_global_peers: 200,
                download_rate_limit: None,
                upload_rate_limit: None,
            },
            torrent: TorrentConf::default(),
            disk: DiskConf::default(),
            discovery: DiscoveryConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,
    /// Where checkpoint records are kept, one file per torrent.
    pub checkpoint_dir: PathBuf,
    /// The address on which the engine accepts inbound peer connections.
    /// When `None`, an unspecified address with an OS-assigned port is used.
    pub listen_addr: Option<std::net::SocketAddr>,
    /// The total number of connected peers across all torrents. At the cap,
    /// outbound connects are suppressed and inbound handshakes are refused
    /// with a polite close.
    pub max_global_peers: usize,
    /// Global download rate cap in bytes per second, shared by all torrents.
    pub download_rate_limit: Option<u64>,
    /// Global upload rate cap in bytes per second, shared by all torrents.
    pub upload_rate_limit: Option<u64>,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents
/// by default, but individual torrents may override this configuration.
#[derive(Debug, Clone)]
pub struct TorrentConf {
    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide an announce interval, we default to
    /// announcing this often.
    pub announce_interval: Duration,

    /// The bounds the adaptive announce interval stays within; a tracker
    /// supplied `min interval` is a hard floor on top of this.
    pub announce_interval_min: Duration,
    pub announce_interval_max: Duration,

    /// Per-request timeout for a tracker exchange.
    pub tracker_timeout: Duration,

    /// Base delay for per-tracker exponential backoff after a failure.
    pub tracker_backoff_base: Duration,

    /// Cap on the per-tracker backoff delay.
    pub tracker_backoff_max: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// How often the choking controller reconsiders its unchoke set.
    pub unchoke_interval: Duration,

    /// How often the optimistic unchoke slot is rotated.
    pub optimistic_unchoke_interval: Duration,

    /// Total unchoke slots, optimistic slot included.
    pub max_upload_slots: usize,

    /// The scheduler tick period for request pipelining, timeout sweeps and
    /// endgame bookkeeping.
    pub tick_interval: Duration,

    /// Request pipeline depth bounds. The per-peer target depth floats
    /// between these based on the bandwidth-delay product.
    pub pipeline_min_depth: usize,
    pub pipeline_max_depth: usize,

    /// Two contiguous assigned blocks are merged into one request when the
    /// combined length does not exceed this many bytes and the peer
    /// signaled large-request tolerance in its extension handshake.
    pub pipeline_coalesce_threshold: u32,

    /// Bounds on the adaptive block-request timeout.
    pub request_timeout_min: Duration,
    pub request_timeout_max: Duration,

    /// The observed round-trip mean is multiplied by this to get the
    /// request timeout.
    pub request_rtt_multiplier: u32,

    /// Completion fraction at which endgame mode begins.
    pub endgame_threshold: f64,

    /// Maximum simultaneous peers a block may be requested from in endgame.
    pub endgame_duplicates: usize,

    /// Piece selection behavior; see [`crate::piece::picker`].
    pub piece_selection: PieceSelection,

    /// How many pieces ahead of the first needed piece sequential selection
    /// will look.
    pub sequential_window: usize,

    /// When the availability of the sequential window drops below this
    /// fraction, sequential selection falls back to rarest-first for the
    /// tick.
    pub sequential_fallback_threshold: f64,

    /// Consecutive violations after which a peer is disconnected and banned
    /// from the candidate queue.
    pub peer_violation_threshold: usize,

    /// Consecutive connect failures after which an endpoint's circuit
    /// breaker opens.
    pub circuit_breaker_failure_threshold: usize,

    /// How long an open circuit breaker suppresses reconnection attempts.
    pub circuit_breaker_recovery_timeout: Duration,

    /// Handshake timeout bands, gated on the torrent's connected peer
    /// count: desperation below 5 peers, normal at 5..=20, healthy above.
    pub handshake_timeout_desperation: (Duration, Duration),
    pub handshake_timeout_normal: (Duration, Duration),
    pub handshake_timeout_healthy: (Duration, Duration),

    /// How often a full checkpoint record is flushed.
    pub checkpoint_interval: Duration,

    /// Also flush an incremental checkpoint after every verified piece.
    pub checkpoint_on_piece: bool,

    /// How many random verified pieces to re-hash against disk when
    /// resuming from a checkpoint. Zero disables the spot check.
    pub resume_verify_pieces: usize,

    /// Specifies which optional alerts to send, besides the default
    /// periodic stats update.
    pub alerts: TorrentAlertConf,
}

/// The piece selection strategy and its parameters.
///
/// All strategies honor per-file priority and skip pieces whose effective
/// priority is "do not download".
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PieceSelection {
    /// Deterministic cycling over candidates; debugging aid.
    RoundRobin,
    /// Ascending rarity, ties broken by ascending index. The default.
    RarestFirst,
    /// Ascending index within a sliding window, with a rarest-first
    /// fallback when window availability is poor.
    Sequential,
    /// Blend of rarity and per-peer bandwidth; `weight` is the rarity
    /// share in `0.0..=1.0`.
    BandwidthWeightedRarest { weight: f64 },
    /// Sequential until `progress_threshold` completion, rarest-first
    /// afterwards.
    ProgressiveRarest { progress_threshold: f64 },
    /// Re-evaluates recent progress over a window of piece completions and
    /// switches between sequential and rarest-first accordingly.
    AdaptiveHybrid,
}

impl Default for PieceSelection {
    fn default() -> Self {
        Self::RarestFirst
    }
}

/// Configuration of a torrent's optional alerts.
///
/// By default, all optional alerts are turned off. This is because some of
/// these alerts may have overhead that shouldn't be paid when the alerts are
/// not used.
#[derive(Debug, Clone, Default)]
pub struct TorrentAlertConf {
    /// Receive the pieces that were completed each round.
    pub completed_pieces: bool,
    /// Receive aggregate statistics about the torrent's peers.
    pub peers: bool,
}

impl Default for TorrentConf {
    fn default() -> Self {
        TorrentConf {
            // We always request at least 10 peers as anything less is a
            // waste of a network round trip and it allows us to buffer up
            // a bit more than needed.
            min_requested_peer_count: 10,
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(30 * 60),
            announce_interval_min: Duration::from_secs(20),
            announce_interval_max: Duration::from_secs(3600),
            tracker_timeout: Duration::from_secs(30),
            tracker_backoff_base: Duration::from_secs(2),
            tracker_backoff_max: Duration::from_secs(300),
            tracker_error_threshold: 15,
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            max_upload_slots: 4,
            tick_interval: Duration::from_millis(100),
            pipeline_min_depth: 4,
            pipeline_max_depth: 128,
            // at most one extra block per merged request
            pipeline_coalesce_threshold: 2 * crate::BLOCK_LEN,
            request_timeout_min: Duration::from_secs(2),
            request_timeout_max: Duration::from_secs(60),
            request_rtt_multiplier: 4,
            endgame_threshold: 0.95,
            endgame_duplicates: 2,
            piece_selection: PieceSelection::default(),
            sequential_window: 10,
            sequential_fallback_threshold: 0.1,
            peer_violation_threshold: 3,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_timeout: Duration::from_secs(60),
            handshake_timeout_desperation: (
                Duration::from_secs(30),
                Duration::from_secs(60),
            ),
            handshake_timeout_normal: (
                Duration::from_secs(15),
                Duration::from_secs(30),
            ),
            handshake_timeout_healthy: (
                Duration::from_secs(20),
                Duration::from_secs(40),
            ),
            checkpoint_interval: Duration::from_secs(30),
            checkpoint_on_piece: true,
            resume_verify_pieces: 10,
            alerts: Default::default(),
        }
    }
}

/// Disk task configuration.
#[derive(Debug, Clone)]
pub struct DiskConf {
    /// Bounds on the adaptive worker pool that services the queue.
    pub workers_min: usize,
    pub workers_max: usize,

    /// The number of queued operations at which producers start blocking.
    pub queue_size: usize,

    /// Two writes to the same file are merged into one batch when the gap
    /// between them is at most this many bytes.
    pub write_contiguous_threshold: u64,

    /// A partially filled write batch is flushed after this long.
    pub write_batch_timeout: Duration,

    /// How many pieces may hash-verify in parallel.
    pub hash_batch_size: usize,

    /// Number of block-sized entries the read cache may hold.
    pub read_cache_blocks: usize,

    /// How file space is reserved when a torrent is allocated.
    pub preallocation: Preallocation,
}

/// File preallocation strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preallocation {
    /// Files are created empty and grow as pieces arrive.
    None,
    /// Files are extended to their final length without reserving blocks.
    Sparse,
    /// Space is reserved up front (`posix_fallocate` where available,
    /// otherwise an explicit extend).
    Full,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            workers_min: 1,
            workers_max: 16,
            queue_size: 200,
            write_contiguous_threshold: 4096,
            write_batch_timeout: Duration::from_millis(5),
            hash_batch_size: 4,
            // 64 MiB of cache at the default block size
            read_cache_blocks: 4096,
            preallocation: Preallocation::Sparse,
        }
    }
}

/// Peer discovery configuration: trackers aside, the DHT and PEX.
#[derive(Debug, Clone)]
pub struct DiscoveryConf {
    /// Whether to run the shared DHT node at all.
    pub enable_dht: bool,

    /// The UDP port the DHT node binds.
    pub dht_port: u16,

    /// Nodes used to seed an empty routing table.
    pub dht_bootstrap_nodes: Vec<String>,

    /// DHT query timeout bands, gated on swarm health like the handshake
    /// bands.
    pub dht_timeout_desperation: (Duration, Duration),
    pub dht_timeout_normal: (Duration, Duration),
    pub dht_timeout_healthy: (Duration, Duration),

    /// Whether to exchange peers over ut_pex.
    pub enable_pex: bool,

    /// Minimum gap between PEX messages to the same peer. BEP 11 requires
    /// at least a minute.
    pub pex_interval: Duration,
}

impl Default for DiscoveryConf {
    fn default() -> Self {
        Self {
            enable_dht: true,
            dht_port: 6881,
            dht_bootstrap_nodes: vec![
                "router.bittorrent.com:6881".into(),
                "dht.transmissionbt.com:6881".into(),
                "router.utorrent.com:6881".into(),
            ],
            dht_timeout_desperation: (
                Duration::from_secs(30),
                Duration::from_secs(60),
            ),
            dht_timeout_normal: (
                Duration::from_secs(5),
                Duration::from_secs(15),
            ),
            dht_timeout_healthy: (
                Duration::from_secs(10),
                Duration::from_secs(30),
            ),
            enable_pex: true,
            pex_interval: Duration::from_secs(60),
        }
    }
}

/// The swarm-health bands used by the adaptive timeouts: fewer than five
/// peers is desperation, up to twenty is normal, beyond that healthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwarmHealth {
    Desperation,
    Normal,
    Healthy,
}

impl SwarmHealth {
    pub fn from_peer_count(count: usize) -> Self {
        match count {
            0..=4 => Self::Desperation,
            5..=20 => Self::Normal,
            _ => Self::Healthy,
        }
    }

    /// Interpolates a timeout within the band: a crowd near the band's
    /// upper gate gets the band minimum, an empty band gets the maximum.
    pub fn timeout_within(&self, band: (Duration, Duration), count: usize) -> Duration {
        let (min, max) = band;
        let (lo, hi) = match self {
            Self::Desperation => (0usize, 4),
            Self::Normal => (5, 20),
            Self::Healthy => (21, 50),
        };
        let count = count.clamp(lo, hi);
        if hi == lo {
            return max;
        }
        let frac = (count - lo) as f64 / (hi - lo) as f64;
        let span = max.saturating_sub(min);
        max - span.mul_f64(frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = gen_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_swarm_health_bands() {
        assert_eq!(
            SwarmHealth::from_peer_count(0),
            SwarmHealth::Desperation
        );
        assert_eq!(
            SwarmHealth::from_peer_count(4),
            SwarmHealth::Desperation
        );
        assert_eq!(SwarmHealth::from_peer_count(5), SwarmHealth::Normal);
        assert_eq!(SwarmHealth::from_peer_count(20), SwarmHealth::Normal);
        assert_eq!(SwarmHealth::from_peer_count(21), SwarmHealth::Healthy);
    }

    #[test]
    fn test_timeout_band_interpolation() {
        let band = (Duration::from_secs(30), Duration::from_secs(60));
        let health = SwarmHealth::Desperation;
        // an empty swarm waits the longest
        assert_eq!(health.timeout_within(band, 0), Duration::from_secs(60));
        // at the top of the band we use the band minimum
        assert_eq!(health.timeout_within(band, 4), Duration::from_secs(30));
    }
}
