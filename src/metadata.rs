//! Fetching the info dictionary from peers (ut_metadata, BEP 9), used by
//! magnet-initiated torrents that start without metadata.
//!
//! This is a pure state machine: the torrent drives it with peer events
//! and it answers with which 16 KiB piece to request next. Validation is
//! all-or-nothing: only the SHA-1 of the complete concatenation can be
//! checked against the info-hash, so a mismatch discards everything and
//! penalizes every contributor.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use crate::{Sha1Hash, BLOCK_LEN};

/// Metadata pieces are fixed 16 KiB, the last one possibly shorter.
pub(crate) const METADATA_PIECE_LEN: usize = BLOCK_LEN as usize;

/// An upper bound on advertised metadata sizes; anything bigger is
/// treated as hostile.
pub(crate) const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// How long to wait for a requested metadata piece before asking another
/// peer.
const PIECE_TIMEOUT: Duration = Duration::from_secs(20);

/// Why a metadata fetch attempt failed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MetadataError {
    /// The advertised size is zero or implausibly large.
    BadSize(u64),
    /// The assembled dictionary does not hash to the info-hash. Carries
    /// the peers that contributed pieces; all of them are suspect.
    HashMismatch(Vec<SocketAddr>),
}

/// The in-progress fetch of one torrent's info dictionary.
#[derive(Debug)]
pub(crate) struct MetadataFetch {
    expected_hash: Sha1Hash,
    total_size: usize,
    /// Received pieces, in order; `None` where still missing.
    pieces: Vec<Option<Vec<u8>>>,
    /// Outstanding requests: piece index to (peer, sent time).
    in_flight: HashMap<usize, (SocketAddr, Instant)>,
    /// Everyone who delivered a piece of the current attempt.
    contributors: HashSet<SocketAddr>,
}

impl MetadataFetch {
    /// Starts a fetch for an advertised metadata size.
    pub fn new(
        expected_hash: Sha1Hash,
        total_size: u64,
    ) -> Result<Self, MetadataError> {
        if total_size == 0 || total_size as usize > MAX_METADATA_SIZE {
            return Err(MetadataError::BadSize(total_size));
        }
        let total_size = total_size as usize;
        let piece_count = total_size.div_ceil(METADATA_PIECE_LEN);
        Ok(Self {
            expected_hash,
            total_size,
            pieces: vec![None; piece_count],
            in_flight: HashMap::new(),
            contributors: HashSet::new(),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// The next piece to request from the given peer, if any is missing
    /// and not already in flight elsewhere. Requests that timed out are
    /// reassigned.
    pub fn next_request(&mut self, peer: SocketAddr) -> Option<usize> {
        let now = Instant::now();
        for (index, piece) in self.pieces.iter().enumerate() {
            if piece.is_some() {
                continue;
            }
            match self.in_flight.get(&index) {
                Some((holder, sent_at))
                    if *holder != peer
                        && now.duration_since(*sent_at)
                            < PIECE_TIMEOUT =>
                {
                    continue;
                }
                Some((holder, _)) if *holder == peer => continue,
                _ => {}
            }
            self.in_flight.insert(index, (peer, now));
            return Some(index);
        }
        None
    }

    /// Records a rejected request so the piece becomes assignable again.
    pub fn on_reject(&mut self, peer: SocketAddr, piece: usize) {
        if let Some((holder, _)) = self.in_flight.get(&piece) {
            if *holder == peer {
                self.in_flight.remove(&piece);
            }
        }
    }

    /// Records a delivered piece. On the final piece the concatenation is
    /// hashed against the info-hash: success yields the raw info
    /// dictionary; a mismatch resets the fetch and reports the
    /// contributors for penalizing.
    pub fn on_data(
        &mut self,
        peer: SocketAddr,
        piece: usize,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, MetadataError> {
        if piece >= self.pieces.len() {
            return Ok(None);
        }
        let expected_len = if piece + 1 == self.pieces.len() {
            self.total_size - piece * METADATA_PIECE_LEN
        } else {
            METADATA_PIECE_LEN
        };
        if payload.len() != expected_len {
            log::warn!(
                "Metadata piece {piece} from {peer} has bad length {}",
                payload.len()
            );
            self.in_flight.remove(&piece);
            return Ok(None);
        }

        self.in_flight.remove(&piece);
        if self.pieces[piece].is_none() {
            self.pieces[piece] = Some(payload);
            self.contributors.insert(peer);
        }

        if self.pieces.iter().any(Option::is_none) {
            return Ok(None);
        }

        // assemble and verify
        let mut info = Vec::with_capacity(self.total_size);
        for piece in self.pieces.iter().flatten() {
            info.extend_from_slice(piece);
        }
        let digest = Sha1::digest(&info);
        if digest.as_slice() == self.expected_hash {
            Ok(Some(info))
        } else {
            log::warn!("Assembled metadata failed its hash check");
            let contributors = self.contributors.drain().collect();
            for piece in self.pieces.iter_mut() {
                *piece = None;
            }
            self.in_flight.clear();
            Err(MetadataError::HashMismatch(contributors))
        }
    }
}
