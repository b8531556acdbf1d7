//! The alerts the API user may receive from the torrent engine.
//!
//! Alerts travel on an unbounded channel returned by
//! [`crate::engine::spawn`]; an application embedding the engine can be
//! driven partially or entirely by them.
//!
//! Only the cheap alerts are broadcast by default. The optional ones (per
//! round completed pieces, per-peer statistics) are enabled through
//! [`crate::conf::TorrentAlertConf`] because they carry overhead that
//! shouldn't be paid when nobody listens.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::Error;
use crate::torrent::stats::TorrentStats;
use crate::TorrentId;

/// The channel on which the engine sends alerts to the library user.
pub(crate) type AlertSender = UnboundedSender<Alert>;
/// The channel on which the library user receives alerts from the engine.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// The events the engine reports to the user.
#[derive(Debug)]
pub enum Alert {
    /// Every needed piece of the torrent has been downloaded and verified.
    TorrentComplete(TorrentId),
    /// Periodic update of a torrent's statistics.
    TorrentStats {
        id: TorrentId,
        stats: Box<TorrentStats>,
    },
    /// A magnet-initiated torrent has fetched and validated its metadata.
    MetadataComplete(TorrentId),
    /// The torrent moved into an error state and paused itself; it will
    /// not retry until resumed.
    TorrentError { id: TorrentId, reason: String },
    /// An error not tied to a single torrent.
    Error(Error),
}
