use crate::error::bencode::BencodeError;

pub type Result<T, E = DhtError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("{0}")]
    /// A KRPC packet failed to decode.
    Bencode(#[from] BencodeError),

    #[error("malformed krpc message: {0}")]
    /// Decoded as bencode but missing required KRPC fields.
    Krpc(&'static str),

    #[error("query timed out")]
    Timeout,

    #[error("remote error {code}: {message}")]
    /// The queried node answered with a KRPC error message.
    Remote { code: i64, message: String },

    #[error("channel error")]
    /// The node task has shut down.
    Channel,

    #[error("{0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for DhtError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DhtError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}
