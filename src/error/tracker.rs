pub use serde_bencode::Error as BencodeDeError;

use reqwest::Error as HttpError;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{0}")]
    /// The announce/scrape response failed to parse as bencode.
    BencodeDe(BencodeDeError),

    #[error("{0}")]
    Http(HttpError),

    #[error("{0}")]
    /// An IO error on the UDP socket.
    Io(std::io::Error),

    #[error("tracker request timed out")]
    Timeout,

    #[error("udp tracker protocol error: {0}")]
    /// Response too short, action mismatch, or a stale transaction id.
    UdpProtocol(&'static str),

    #[error("tracker failure: {0}")]
    /// The tracker itself reported a failure reason.
    Failure(String),

    #[error("tracker url has no usable scheme")]
    UnsupportedScheme,
}

impl From<BencodeDeError> for TrackerError {
    fn from(value: BencodeDeError) -> Self {
        Self::BencodeDe(value)
    }
}

impl From<HttpError> for TrackerError {
    fn from(value: HttpError) -> Self {
        Self::Http(value)
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
