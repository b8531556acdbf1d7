pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("channel error")]
    /// The channel on which some component in engine
    /// was listening or sending died.
    Channel,

    #[error("handshake timeout")]
    /// The peer did not complete the handshake within the adaptive window.
    HandshakeTimeout,

    #[error("invalid info hash")]
    /// Peer's torrent info hash did not match any torrent we serve.
    UnknownInfoHash,

    #[error("connected to self")]
    /// The remote handshake carried our own peer id.
    SelfConnection,

    #[error("peer not allowed")]
    /// The engine's peer-filter hook rejected this endpoint.
    NotAllowed,

    #[error("inactivity timeout")]
    /// A peer session timed out because neither side of the
    /// connection became interested in each other.
    InactivityTimeout,

    #[error("protocol violation: {0}")]
    /// The peer broke a protocol rule; the session is severed and the
    /// peer's violation count is incremented.
    Violation(Violation),

    #[error("{0}")]
    /// An IO error occurred.
    Io(std::io::Error),
}

/// The protocol rules a remote peer can break.
///
/// Each of these drops the session; repeat offenders get banned by the
/// torrent's candidate queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("bitfield not sent directly after handshake")]
    /// The bitfield message may only arrive as the first message.
    BitfieldNotAfterHandshake,

    #[error("request while choked")]
    /// Peers must not request blocks while we are choking them.
    RequestWhileChoked,

    #[error("invalid message length")]
    /// The message length prefix disagrees with the message type.
    InvalidMessageLength,

    #[error("invalid piece index")]
    /// HAVE or REQUEST for `index >= piece_count`.
    InvalidPieceIndex,

    #[error("invalid block info")]
    /// Block offset/length outside the piece, or a request longer than
    /// the maximum block size.
    InvalidBlockInfo,

    #[error("unrequested block")]
    /// Repeatedly delivered blocks we never asked for.
    UnrequestedBlock,

    #[error("piece hash mismatch")]
    /// Contributed to a piece whose digest check failed.
    HashMismatch,

    #[error("malformed extension message")]
    /// An extension-protocol payload failed to decode.
    InvalidExtensionMessage,
}

impl From<IoError> for PeerError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl<T> From<SendError<T>> for PeerError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}

impl From<Violation> for PeerError {
    fn from(value: Violation) -> Self {
        Self::Violation(value)
    }
}
