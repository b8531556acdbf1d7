//! The periodic statistics snapshot a torrent reports through the alert
//! channel.

use std::time::Duration;

use super::LifecycleState;

/// Aggregate per-torrent statistics, rebuilt each status round from the
/// piece store and the latest session ticks.
#[derive(Clone, Debug)]
pub struct TorrentStats {
    /// The torrent's lifecycle state.
    pub state: LifecycleState,
    /// How long the torrent has been running.
    pub run_duration: Duration,

    /// Verified needed pieces and the needed total.
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// `verified_pieces / total_pieces`, `1.0` when nothing is needed.
    pub completion: f64,
    /// Whether the endgame duplicate-request mode is active.
    pub endgame: bool,

    /// Summed recent per-second payload rates across peers.
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Total payload bytes moved.
    pub downloaded_payload: u64,
    pub uploaded_payload: u64,

    /// Connected peer sessions.
    pub peer_count: usize,
    /// Of those, how many have unchoked us.
    pub unchoked_us_count: usize,
    /// Endpoints waiting in the candidate queue.
    pub candidate_count: usize,
}

impl TorrentStats {
    /// True once every needed piece is verified.
    pub fn is_complete(&self) -> bool {
        self.verified_pieces == self.total_pieces
    }
}
