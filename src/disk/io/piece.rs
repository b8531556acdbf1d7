//! An in-progress piece: the write buffer of its blocks, its hash
//! verification and its scatter across file segments.

use std::collections::BTreeMap;
use std::ops::Range;

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::blockinfo::block_count;
use crate::error::disk::{ReadError, WriteError};
use crate::piece::PieceHash;
use crate::{FileIndex, Sha256Hash, BLOCK_LEN};

use super::file::TorrentFile;

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
pub(crate) struct Piece {
    /// The expected digest of the whole piece.
    pub expected_hash: PieceHash,
    /// The length of the piece, in bytes.
    pub len: u32,
    /// The nominal piece length of the torrent; the v2 leaf computation
    /// needs it even for the shorter last piece.
    pub nominal_len: u32,
    /// The so far downloaded blocks. Once the size of the map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash
    /// is correct, saved to disk.
    ///
    /// Blocks are keyed and thus ordered by their offset within piece,
    /// which is important when iterating to hash them in the right order.
    pub blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with, as indices into the
    /// torrent's file vector.
    pub file_range: Range<FileIndex>,
}

impl Piece {
    /// Places a block into the piece's write buffer if not already there.
    pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        use std::collections::btree_map::Entry;
        let entry = self.blocks.entry(offset);
        if matches!(entry, Entry::Occupied(_)) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            entry.or_insert(data);
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    pub fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Hashes the buffered blocks and compares against the expected digest.
    ///
    /// For v1 this is a flat SHA-1 over the piece bytes. For v2 it is the
    /// piece's Merkle leaf: the root of the SHA-256 tree over the piece's
    /// 16 KiB blocks, zero-padded to the nominal block count.
    pub fn matches_hash(&self) -> bool {
        debug_assert!(self.is_complete());
        match &self.expected_hash {
            PieceHash::V1(expected) => {
                let mut hasher = Sha1::new();
                for block in self.blocks.values() {
                    hasher.update(block);
                }
                hasher.finalize().as_slice() == expected
            }
            PieceHash::V2(expected) => {
                let root = merkle_root(
                    self.blocks.values().map(|b| b.as_slice()),
                    block_count(self.nominal_len),
                );
                &root == expected
            }
        }
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// Padding files occupy their byte range but receive no bytes; `None`
    /// entries in `files` are exactly the padding files.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should
    /// be executed on a blocking thread pool, not the async executor.
    pub fn write(
        &self,
        torrent_piece_offset: u64,
        files: &[Option<TorrentFile>],
        all_files: &[crate::storage_info::FileInfo],
    ) -> Result<(), WriteError> {
        let blocks: Vec<&[u8]> =
            self.blocks.values().map(|b| b.as_slice()).collect();
        debug_assert!(!self.file_range.is_empty());

        // the offset within the piece that the next segment starts at
        let mut piece_offset = 0u64;
        for file_index in self.file_range.clone() {
            if piece_offset >= self.len as u64 {
                break;
            }
            let remaining = self.len as u64 - piece_offset;
            let info = &all_files[file_index];
            if info.len == 0 {
                continue;
            }
            let slice = info
                .get_slice(torrent_piece_offset + piece_offset, remaining);
            debug_assert!(slice.len > 0);
            // padding files consume their byte range but are never written
            if let Some(file) = &files[file_index] {
                file.write_blocks(slice, &blocks, piece_offset as usize)?;
            }
            piece_offset += slice.len;
        }
        Ok(())
    }

    /// Reads the byte range `[offset, offset + out.len())` of the piece
    /// from its file segments into `out`. Padding segments read as zeros.
    pub fn read(
        torrent_piece_offset: u64,
        piece_len: u32,
        file_range: Range<FileIndex>,
        files: &[Option<TorrentFile>],
        all_files: &[crate::storage_info::FileInfo],
        offset: u32,
        out: &mut [u8],
    ) -> Result<(), ReadError> {
        if offset as usize + out.len() > piece_len as usize {
            return Err(ReadError::InvalidBlockOffset);
        }
        let read_start = torrent_piece_offset + offset as u64;
        let read_end = read_start + out.len() as u64;

        let mut filled = 0usize;
        for file_index in file_range {
            if filled == out.len() {
                break;
            }
            let info = &all_files[file_index];
            let file_start = info.torrent_offset;
            let file_end = info.torrent_end_offset();
            // the overlap of the wanted range with this file
            let start = read_start.max(file_start);
            let end = read_end.min(file_end);
            if start >= end {
                continue;
            }
            let chunk_len = (end - start) as usize;
            let dest = &mut out[filled..filled + chunk_len];
            match &files[file_index] {
                Some(file) => {
                    file.read_exact_at(dest, start - file_start)?;
                }
                None => {
                    // padding bytes are implied zeros
                    dest.fill(0);
                }
            }
            filled += chunk_len;
        }
        if filled != out.len() {
            return Err(ReadError::MissingData);
        }
        Ok(())
    }
}

/// Computes the BEP 52 Merkle root over a piece's 16 KiB blocks: leaf
/// hashes are SHA-256 of each block, the leaf count is padded to
/// `leaf_count` (a power of two) with all-zero hashes, and parents are
/// `SHA-256(left || right)`.
pub(crate) fn merkle_root<'a>(
    blocks: impl Iterator<Item = &'a [u8]>,
    leaf_count: usize,
) -> Sha256Hash {
    let mut layer: Vec<Sha256Hash> = blocks
        .map(|block| {
            debug_assert!(block.len() <= BLOCK_LEN as usize);
            let digest = Sha256::digest(block);
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&digest);
            hash
        })
        .collect();
    debug_assert!(layer.len() <= leaf_count);
    let leaf_count = leaf_count.next_power_of_two().max(1);
    layer.resize(leaf_count, [0u8; 32]);

    while layer.len() > 1 {
        layer = layer
            .chunks_exact(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&hasher.finalize());
                hash
            })
            .collect();
    }
    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_hash_verification() {
        let data_a = vec![0xabu8; BLOCK_LEN as usize];
        let data_b = vec![0xcdu8; 100];
        let mut hasher = Sha1::new();
        hasher.update(&data_a);
        hasher.update(&data_b);
        let mut expected = [0u8; 20];
        expected.copy_from_slice(&hasher.finalize());

        let mut piece = Piece {
            expected_hash: PieceHash::V1(expected),
            len: BLOCK_LEN + 100,
            nominal_len: BLOCK_LEN + 100,
            blocks: BTreeMap::new(),
            file_range: 0..1,
        };
        // blocks arriving out of order still hash in offset order
        piece.enqueue_block(BLOCK_LEN, data_b);
        assert!(!piece.is_complete());
        piece.enqueue_block(0, data_a);
        assert!(piece.is_complete());
        assert!(piece.matches_hash());

        // a corrupted block fails
        piece.blocks.get_mut(&0).unwrap()[0] ^= 0xff;
        assert!(!piece.matches_hash());
    }

    #[test]
    fn test_duplicate_block_is_kept_once() {
        let mut piece = Piece {
            expected_hash: PieceHash::V1([0u8; 20]),
            len: BLOCK_LEN,
            nominal_len: BLOCK_LEN,
            blocks: BTreeMap::new(),
            file_range: 0..1,
        };
        piece.enqueue_block(0, vec![1u8; BLOCK_LEN as usize]);
        piece.enqueue_block(0, vec![2u8; BLOCK_LEN as usize]);
        assert_eq!(piece.blocks.len(), 1);
        assert_eq!(piece.blocks[&0][0], 1);
    }

    #[test]
    fn test_merkle_root_single_leaf() {
        let block = vec![7u8; BLOCK_LEN as usize];
        let root = merkle_root([block.as_slice()].into_iter(), 1);
        let mut expected = [0u8; 32];
        expected.copy_from_slice(&Sha256::digest(&block));
        assert_eq!(root, expected);
    }

    #[test]
    fn test_merkle_root_pads_with_zero_hashes() {
        let block = vec![7u8; BLOCK_LEN as usize];
        // two-leaf tree with one real leaf: parent of (H(block), zeros)
        let root = merkle_root([block.as_slice()].into_iter(), 2);
        let leaf = Sha256::digest(&block);
        let mut hasher = Sha256::new();
        hasher.update(leaf);
        hasher.update([0u8; 32]);
        let mut expected = [0u8; 32];
        expected.copy_from_slice(&hasher.finalize());
        assert_eq!(root, expected);
    }

    #[test]
    fn test_v2_piece_verification() {
        let a = vec![1u8; BLOCK_LEN as usize];
        let b = vec![2u8; BLOCK_LEN as usize];
        let expected =
            merkle_root([a.as_slice(), b.as_slice()].into_iter(), 2);

        let mut piece = Piece {
            expected_hash: PieceHash::V2(expected),
            len: 2 * BLOCK_LEN,
            nominal_len: 2 * BLOCK_LEN,
            blocks: BTreeMap::new(),
            file_range: 0..1,
        };
        piece.enqueue_block(0, a);
        piece.enqueue_block(BLOCK_LEN, b);
        assert!(piece.matches_hash());
    }
}
