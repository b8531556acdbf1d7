use std::path::PathBuf;

pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint {path:?} is unreadable: {detail}")]
    /// The file exists but cannot be parsed. The manager quarantines it
    /// (renames, never deletes) and the torrent starts from scratch.
    Corrupt { path: PathBuf, detail: String },

    #[error("checkpoint does not match torrent: {0}")]
    /// Info-hash, piece count or piece length disagree between the stored
    /// record and the freshly parsed metainfo. Quarantined like `Corrupt`.
    Mismatch(&'static str),

    #[error("resume verification failed for piece {piece}")]
    /// A spot-checked piece no longer hashes to its expected digest.
    VerifyFailed { piece: usize },

    #[error("{0}")]
    Io(std::io::Error),

    #[error("{0}")]
    Serde(serde_json::Error),
}

impl From<std::io::Error> for CheckpointError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}
