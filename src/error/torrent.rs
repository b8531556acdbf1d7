use tokio::io::Error as IoError;
use tokio::sync::mpsc::error::SendError;

pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("channel error")]
    /// The channel on which some component in engine was
    /// listening or sending died.
    Channel,

    #[error("disk failure: {0}")]
    /// A block write kept failing after the retry budget was exhausted;
    /// the torrent pauses itself in an error state.
    Disk(String),

    #[error("metadata fetch failed: {0}")]
    /// A magnet-initiated torrent could not obtain a valid info
    /// dictionary from any peer.
    Metadata(String),

    #[error("{0}")]
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<IoError> for TorrentError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl<T> From<SendError<T>> for TorrentError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
