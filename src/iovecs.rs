//! Zero-copy gather helpers for vectored positional file IO.
//!
//! A piece's blocks live in separate buffers, while a write covers
//! a contiguous byte range of the piece that rarely lines up with block
//! boundaries (a piece may span several files). These helpers slice the
//! range out of the block buffers as borrowed [`IoSlice`]s so the whole
//! range can go to the kernel in one `pwritev` call, and rebuild the slice
//! list after a partial transfer.

use std::io::IoSlice;

/// Collects the byte range `[skip, skip + len)` of the logically
/// concatenated `blocks` into borrowed IO slices.
///
/// Returns fewer bytes' worth of slices if the blocks end early; the caller
/// detects that by summing slice lengths.
pub(crate) fn gather<'a>(
    blocks: impl IntoIterator<Item = &'a [u8]>,
    skip: usize,
    len: usize,
) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::new();
    let mut to_skip = skip;
    let mut to_take = len;
    for block in blocks {
        if to_take == 0 {
            break;
        }
        if to_skip >= block.len() {
            to_skip -= block.len();
            continue;
        }
        let start = to_skip;
        to_skip = 0;
        let end = (start + to_take).min(block.len());
        slices.push(IoSlice::new(&block[start..end]));
        to_take -= end - start;
    }
    slices
}

/// Sums the byte count covered by the slices.
pub(crate) fn total_len(slices: &[IoSlice<'_>]) -> usize {
    slices.iter().map(|s| s.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(slices: &[IoSlice<'_>]) -> Vec<u8> {
        slices.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn test_gather_whole_range() {
        let blocks: Vec<Vec<u8>> =
            vec![vec![1, 2, 3], vec![4, 5], vec![6, 7, 8, 9]];
        let slices =
            gather(blocks.iter().map(|b| b.as_slice()), 0, 9);
        assert_eq!(total_len(&slices), 9);
        assert_eq!(collect(&slices), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_gather_mid_block_range() {
        let blocks: Vec<Vec<u8>> =
            vec![vec![1, 2, 3], vec![4, 5], vec![6, 7, 8, 9]];
        // skip into the first block, end inside the last
        let slices = gather(blocks.iter().map(|b| b.as_slice()), 2, 5);
        assert_eq!(collect(&slices), vec![3, 4, 5, 6, 7]);

        // skip a whole block
        let slices = gather(blocks.iter().map(|b| b.as_slice()), 3, 2);
        assert_eq!(collect(&slices), vec![4, 5]);

        // skip exactly to the last block's start
        let slices = gather(blocks.iter().map(|b| b.as_slice()), 5, 4);
        assert_eq!(collect(&slices), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_gather_short_input() {
        let blocks: Vec<Vec<u8>> = vec![vec![1, 2]];
        // asking past the end yields what exists
        let slices = gather(blocks.iter().map(|b| b.as_slice()), 1, 10);
        assert_eq!(collect(&slices), vec![2]);
        // skipping past the end yields nothing
        let slices = gather(blocks.iter().map(|b| b.as_slice()), 5, 1);
        assert!(slices.is_empty());
    }
}
