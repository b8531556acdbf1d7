use std::sync::atomic::{AtomicU32, Ordering};

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// A SHA-256 hash digest, 32 bytes long. Used by BitTorrent v2 metadata.
pub type Sha256Hash = [u8; 32];

/// The peer ID is an arbitrary 20 byte string.
///
/// [`Guidelines for choosing a peer ID`](http://bittorrent.org/beps/bep_0020.html).
pub type PeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least
/// significant bits, that is, where the highest bit represents the first
/// piece, the second highest element represents the second piece, and so on.
///
/// A truthy boolean value of a piece's position in this vector means
/// that peer has the piece, while a falsy value means that peer doesn't have
/// the piece.
pub type Bitfield = bitvec::prelude::BitVec<u8, bitvec::prelude::Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// The largest block length we accept in an incoming request. Anything above
/// is a protocol violation and drops the session.
pub(crate) const MAX_BLOCK_LEN: u32 = BLOCK_LEN;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub(crate) type PieceIndex = usize;

/// The type of a file's index within a torrent.
pub(crate) type FileIndex = usize;

/// Uniquely identifies a torrent within a single engine instance.
///
/// Ids are handed out sequentially and are not reused. They have no meaning
/// outside the process; on the wire and in checkpoints a torrent is always
/// identified by its info-hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TorrentId(pub u32);

impl TorrentId {
    /// Produces a new unique torrent id.
    pub fn new() -> Self {
        static TORRENT_ID: AtomicU32 = AtomicU32::new(0);
        let id = TORRENT_ID.fetch_add(1, Ordering::Relaxed);
        TorrentId(id)
    }
}

impl std::fmt::Display for TorrentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t#{}", self.0)
    }
}
