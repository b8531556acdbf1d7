use crate::error::bencode::BencodeError;

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("{0}")]
    Bencode(#[from] BencodeError),

    #[error("metainfo root is not a dictionary")]
    NotADict,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {detail}")]
    InvalidField {
        field: &'static str,
        detail: String,
    },

    #[error("invalid pieces: length must be a multiple of the digest size")]
    InvalidPieces,

    #[error("invalid file tree entry at `{path}`: {detail}")]
    /// A v2 file-tree node violated the format; `path` names the offending
    /// subtree with `/`-joined components.
    InvalidFileTree { path: String, detail: String },

    #[error("piece layer for `{path}` has wrong hash count")]
    /// The `piece layers` entry for a file does not contain exactly
    /// `ceil(len / piece_length)` 32-byte hashes.
    InvalidPieceLayer { path: String },

    #[error("file `{path}` is a symlink but has no symlink path")]
    MissingSymlinkTarget { path: String },

    #[error("invalid tracker url")]
    InvalidTrackerUrl,
}

impl From<url::ParseError> for MetainfoError {
    fn from(_: url::ParseError) -> Self {
        Self::InvalidTrackerUrl
    }
}
