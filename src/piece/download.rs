//! Block-level bookkeeping of a single piece that is being downloaded.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::blockinfo::{block_count, block_len, BlockInfo};
use crate::PieceIndex;

/// The request state of a single block within a piece.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Not requested from anybody yet.
    Free,
    /// Requested from the listed peers. Outside endgame the list holds at
    /// most one entry; in endgame up to the configured duplicate cap.
    Requested(Vec<SocketAddr>),
    /// The block has arrived and is sitting in the disk task's write
    /// buffer.
    Received,
}

/// Tracks the blocks of one piece while the piece is being downloaded.
#[derive(Debug)]
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// Per-block request state, ordered by block offset.
    blocks: Vec<BlockState>,
    /// Every peer that delivered at least one block of this piece. Kept
    /// until the verification verdict so hash-mismatch penalties can be
    /// attributed.
    participants: HashSet<SocketAddr>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockState::Free; block_count(len)],
            participants: HashSet::new(),
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `count` blocks for the given peer and marks them
    /// requested by it.
    ///
    /// Outside endgame only free blocks are picked. In endgame a block
    /// already requested from other peers may be picked again, as long as
    /// the peer itself doesn't already have it in flight and the duplicate
    /// cap is not exceeded. Received blocks are never picked.
    pub fn pick_blocks(
        &mut self,
        peer: SocketAddr,
        count: usize,
        endgame: bool,
        max_duplicates: usize,
        out: &mut Vec<BlockInfo>,
    ) {
        let mut picked = 0;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            match block {
                BlockState::Free => {
                    *block = BlockState::Requested(vec![peer]);
                }
                BlockState::Requested(peers) if endgame => {
                    if peers.contains(&peer) || peers.len() >= max_duplicates
                    {
                        continue;
                    }
                    peers.push(peer);
                }
                _ => continue,
            }
            out.push(BlockInfo {
                piece_index: self.index,
                offset: i as u32 * crate::BLOCK_LEN,
                len: block_len(self.len, i),
            });
            picked += 1;
        }
    }

    /// Marks a block received and returns the other peers that still have
    /// the same block in flight, so the caller can send them CANCELs.
    ///
    /// Returns `None` if the block was not in flight from this peer (an
    /// unsolicited or duplicate delivery).
    pub fn received_block(
        &mut self,
        peer: SocketAddr,
        offset: u32,
    ) -> Option<Vec<SocketAddr>> {
        let index = (offset / crate::BLOCK_LEN) as usize;
        let block = self.blocks.get_mut(index)?;
        match block {
            BlockState::Requested(peers) if peers.contains(&peer) => {
                let others = peers
                    .iter()
                    .copied()
                    .filter(|p| *p != peer)
                    .collect();
                *block = BlockState::Received;
                self.participants.insert(peer);
                Some(others)
            }
            _ => None,
        }
    }

    /// The peers that delivered blocks of this piece.
    pub fn participants(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.participants.iter().copied()
    }

    /// Releases one in-flight request of the peer, e.g. after a local
    /// request timeout. Frees the block entirely when no other peer has it
    /// in flight.
    pub fn release_block(&mut self, peer: SocketAddr, offset: u32) {
        let index = (offset / crate::BLOCK_LEN) as usize;
        if let Some(BlockState::Requested(peers)) = self.blocks.get_mut(index)
        {
            peers.retain(|p| *p != peer);
            if peers.is_empty() {
                self.blocks[index] = BlockState::Free;
            }
        }
    }

    /// Releases every in-flight request of the peer, e.g. on disconnect or
    /// an incoming CHOKE.
    pub fn release_peer(&mut self, peer: SocketAddr) {
        for block in self.blocks.iter_mut() {
            if let BlockState::Requested(peers) = block {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    *block = BlockState::Free;
                }
            }
        }
    }

    /// Forgets all progress, used when the completed piece failed its hash
    /// check.
    pub fn rewind(&mut self) {
        for block in self.blocks.iter_mut() {
            *block = BlockState::Free;
        }
        self.participants.clear();
    }

    /// True when the peer still has at least one block of this piece in
    /// flight.
    pub fn has_requests_from(&self, peer: SocketAddr) -> bool {
        self.blocks.iter().any(|b| {
            matches!(b, BlockState::Requested(peers) if peers.contains(&peer))
        })
    }

    /// True when any peer has any block of this piece in flight.
    pub fn has_any_request(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, BlockState::Requested(_)))
    }

    /// True when at least one block has been received.
    pub fn has_received_blocks(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, BlockState::Received))
    }

    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| !matches!(b, BlockState::Received))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.count_missing_blocks() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    // a piece of two whole blocks and a short tail block
    const PIECE_LEN: u32 = 2 * BLOCK_LEN + 123;

    #[test]
    fn test_pick_blocks_in_offset_order() {
        let mut download = PieceDownload::new(7, PIECE_LEN);
        let mut out = Vec::new();
        download.pick_blocks(addr(1), 2, false, 1, &mut out);
        assert_eq!(
            out,
            vec![
                BlockInfo {
                    piece_index: 7,
                    offset: 0,
                    len: BLOCK_LEN
                },
                BlockInfo {
                    piece_index: 7,
                    offset: BLOCK_LEN,
                    len: BLOCK_LEN
                },
            ]
        );

        // the next pick continues at the tail block, with its short length
        out.clear();
        download.pick_blocks(addr(1), 2, false, 1, &mut out);
        assert_eq!(
            out,
            vec![BlockInfo {
                piece_index: 7,
                offset: 2 * BLOCK_LEN,
                len: 123
            }]
        );

        // everything is requested now
        out.clear();
        download.pick_blocks(addr(2), 2, false, 1, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_single_requester_outside_endgame() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut out = Vec::new();
        download.pick_blocks(addr(1), 3, false, 1, &mut out);
        assert_eq!(out.len(), 3);

        // a second peer cannot double-request outside endgame
        out.clear();
        download.pick_blocks(addr(2), 3, false, 1, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_endgame_duplicates_and_cancels() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut out = Vec::new();
        download.pick_blocks(addr(1), 3, true, 2, &mut out);
        assert_eq!(out.len(), 3);

        // a second peer may duplicate every block in endgame
        out.clear();
        download.pick_blocks(addr(2), 3, true, 2, &mut out);
        assert_eq!(out.len(), 3);

        // but a third peer is over the duplicate cap
        out.clear();
        download.pick_blocks(addr(3), 3, true, 2, &mut out);
        assert!(out.is_empty());

        // when one peer delivers, the other one is returned for a CANCEL
        let others = download.received_block(addr(1), 0).unwrap();
        assert_eq!(others, vec![addr(2)]);

        // a received block is not picked again even in endgame
        out.clear();
        download.pick_blocks(addr(3), 1, true, 3, &mut out);
        assert_eq!(
            out,
            vec![BlockInfo {
                piece_index: 0,
                offset: BLOCK_LEN,
                len: BLOCK_LEN
            }]
        );
    }

    #[test]
    fn test_unsolicited_delivery_is_rejected() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        assert_eq!(download.received_block(addr(1), 0), None);

        let mut out = Vec::new();
        download.pick_blocks(addr(1), 1, false, 1, &mut out);
        // wrong peer
        assert_eq!(download.received_block(addr(2), 0), None);
        // delivering twice
        assert!(download.received_block(addr(1), 0).is_some());
        assert_eq!(download.received_block(addr(1), 0), None);
    }

    #[test]
    fn test_release_frees_blocks() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut out = Vec::new();
        download.pick_blocks(addr(1), 3, false, 1, &mut out);
        assert!(download.has_requests_from(addr(1)));

        download.release_block(addr(1), BLOCK_LEN);
        // the freed block can be picked by someone else
        out.clear();
        download.pick_blocks(addr(2), 3, false, 1, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].offset, BLOCK_LEN);

        download.release_peer(addr(1));
        assert!(!download.has_requests_from(addr(1)));
        // but peer 2's request survives
        assert!(download.has_requests_from(addr(2)));
    }

    #[test]
    fn test_completion_and_rewind() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut out = Vec::new();
        download.pick_blocks(addr(1), 3, false, 1, &mut out);
        assert_eq!(download.count_missing_blocks(), 3);
        for block in &out {
            download.received_block(addr(1), block.offset);
        }
        assert!(download.is_complete());

        download.rewind();
        assert_eq!(download.count_missing_blocks(), 3);
        assert!(!download.is_complete());
    }
}
