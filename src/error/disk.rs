use std::path::PathBuf;

use crate::error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned on failed torrent allocations.
///
/// This error is non-fatal, so it should not be grouped with the
/// global `Error` type as it may be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum NewTorrentError {
    #[error("disk torrent entry already exists")]
    /// The torrent entry already exists in `Disk`'s hashmap of torrents.
    AlreadyExists,

    #[error("failed to allocate {path:?}: {source}")]
    /// IO error while creating or preallocating a torrent file.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Error type returned on failed block writes.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from. The torrent retries the write a bounded
/// number of times before moving itself into an error state.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write to {path:?} at offset {offset} failed: {source}")]
    Io {
        path: PathBuf,
        offset: u64,
        source: std::io::Error,
    },
}

/// Error type returned on failed block reads.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("invalid block offset")]
    /// The block's offset in piece is invalid.
    InvalidBlockOffset,

    #[error("torrent data missing")]
    /// The block is valid within torrent but its data has not been downloaded
    /// yet or has been deleted. A short read lands here too.
    MissingData,

    #[error("read from {path:?} at offset {offset} failed: {source}")]
    Io {
        path: PathBuf,
        offset: u64,
        source: std::io::Error,
    },
}
