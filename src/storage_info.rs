//! Torrent geometry: how the flat piece stream maps onto the file list.
//!
//! Everything here is derived once from the metainfo and shared read-only
//! by the piece store, the disk task and the peer sessions.

use std::{ops::Range, path::PathBuf};

use crate::{metainfo::Metainfo, FileIndex, PieceIndex, Sha1Hash, Sha256Hash};

/// The BEP 47 attribute set of a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// The file is alignment padding: its bytes are never transferred or
    /// written, but its length still occupies piece space.
    pub padding: bool,
    /// Executable bit should be set on completion.
    pub executable: bool,
    /// Hidden attribute; best effort off Windows.
    pub hidden: bool,
    /// The file is a symlink; `FileInfo::symlink_target` holds the target.
    pub symlink: bool,
}

impl FileAttrs {
    /// Parses the `attr` byte string of a file node ("p", "x", "h", "l" in
    /// any combination). Unknown attribute characters are ignored.
    pub fn from_bytes(attr: &[u8]) -> Self {
        let mut attrs = Self::default();
        for b in attr {
            match b {
                b'p' => attrs.padding = true,
                b'x' => attrs.executable = true,
                b'h' => attrs.hidden = true,
                b'l' => attrs.symlink = true,
                _ => {}
            }
        }
        attrs
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for FileAttrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.padding {
            f.write_str("p")?;
        }
        if self.executable {
            f.write_str("x")?;
        }
        if self.hidden {
            f.write_str("h")?;
        }
        if self.symlink {
            f.write_str("l")?;
        }
        Ok(())
    }
}

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
    /// BEP 47 attributes; default when the metainfo carries none.
    pub attrs: FileAttrs,
    /// The symlink target, present iff `attrs.symlink`.
    pub symlink_target: Option<PathBuf>,
    /// Optional whole-file SHA-1 from the metainfo.
    pub sha1: Option<Sha1Hash>,
    /// The file's v2 Merkle pieces root; absent for v1 torrents and empty
    /// files.
    pub pieces_root: Option<Sha256Hash>,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the
    /// last bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the range starting at
    /// the given offset.
    ///
    /// # Arguments
    ///
    /// * `torrent_offset` - A byte offset in the entire torrent.
    /// * `len` - The length of the byte range, starting from the offset.
    ///   This may exceed the file length, in which case the returned slice
    ///   length will be smaller.
    ///
    /// # Panics
    ///
    /// This will panic if `torrent_offset` is smaller than the file's offset
    /// in torrent, or if it's past the last byte in file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count
/// and length, download length, etc.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent, padding included.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of single file downloads, this is the directory where the
    /// file is downloaded. In case of archive downloads, this directory is
    /// the download directory joined by the torrent's name, so that
    /// a multi-file torrent doesn't scatter its entries across the download
    /// directory.
    pub download_dir: PathBuf,
    /// The paths and lengths of the torrent files, in metainfo order.
    /// Padding files are present (they consume piece space) but are marked
    /// by their attributes and never touch the disk.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.download_len();
        let piece_len = metainfo.piece_len;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count as u64 - 1);
        let last_piece_len = last_piece_len as u32;

        // if this is an archive, download files into the torrent's own dir
        let download_dir = if metainfo.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files: metainfo.files.clone(),
        }
    }

    /// Returns the length of the piece at the given index, or `None` when
    /// the index is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        if index + 1 == self.piece_count {
            Some(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Some(self.piece_len)
        } else {
            None
        }
    }

    /// The absolute offset of the piece's first byte in the torrent.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the zero-based indices of the files of torrent that
    /// intersect with the piece, or an empty range for an out of bounds
    /// index.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Range<FileIndex> {
        let Some(piece_len) = self.piece_len(index) else {
            return 0..0;
        };
        let piece_offset = self.piece_offset(index);
        let piece_end = piece_offset + piece_len as u64;
        self.files_intersecting_bytes(piece_offset..piece_end)
    }

    /// Returns the files that overlap with the given left-inclusive range
    /// of bytes.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        // find the index of the first file that contains the first byte of
        // the given range; empty files never contain anything
        let first_matching_index = match self
            .files
            .iter()
            .enumerate()
            .find(|(_, file)| file.byte_range().contains(&byte_range.start))
            .map(|(index, _)| index)
        {
            Some(index) => index,
            None => return 0..0,
        };

        let mut file_range = first_matching_index..first_matching_index + 1;

        // walk the files after the first match for as long as their first
        // byte is inside the queried range
        for (index, file) in
            self.files.iter().enumerate().skip(first_matching_index + 1)
        {
            if file.len == 0 || !byte_range.contains(&file.torrent_offset) {
                if file.len == 0 {
                    // zero-length files sit between their neighbors without
                    // occupying bytes; skip them without ending the scan
                    continue;
                }
                break;
            }
            file_range.end = index + 1;
        }

        file_range
    }

    /// True when every file the piece overlaps is a padding file. Such
    /// a piece holds only implied zeros, is never requested from peers and
    /// never touches the disk.
    pub fn is_all_padding(&self, index: PieceIndex) -> bool {
        let range = self.files_intersecting_piece(index);
        if range.is_empty() {
            return false;
        }
        self.files[range].iter().all(|f| f.attrs.padding)
    }

    /// Returns true if the download consists of multiple files.
    pub fn is_archive(&self) -> bool {
        self.files.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_file(path: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            len,
            torrent_offset,
            attrs: FileAttrs::default(),
            symlink_target: None,
            sha1: None,
            pieces_root: None,
        }
    }

    #[test]
    fn test_attrs_parsing() {
        let attrs = FileAttrs::from_bytes(b"px");
        assert!(attrs.padding);
        assert!(attrs.executable);
        assert!(!attrs.hidden);
        assert!(!attrs.symlink);
        assert_eq!(attrs.to_string(), "px");

        assert!(FileAttrs::from_bytes(b"").is_empty());
        // unknown characters are ignored
        assert!(FileAttrs::from_bytes(b"zq").is_empty());
    }

    #[test]
    fn test_file_get_slice() {
        let file = plain_file("/tmp/does/not/exist", 200, 500);

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice {
                offset: 300 - 200,
                len: 500 - (300 - 200),
            },
            "file slice for byte range longer than file should return \
            at most file length long slice"
        );

        assert_eq!(
            file.get_slice(300, 10),
            FileSlice {
                offset: 300 - 200,
                len: 10,
            },
            "file slice for byte range smaller than file should return \
            at most byte range long slice"
        );

        assert_eq!(
            file.get_slice(200, 500),
            FileSlice {
                offset: 0,
                len: 500,
            },
            "file slice for byte range equal to file length should return \
            the full file slice"
        );
    }

    #[test]
    #[should_panic(expected = "torrent offset must be larger than file offset")]
    fn test_file_get_slice_starting_before_file() {
        let file = plain_file("/tmp/does/not/exist", 200, 500);
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic(
        expected = "torrent offset must be smaller than file end offset"
    )]
    fn test_file_get_slice_starting_after_file() {
        let file = plain_file("/tmp/does/not/exist", 200, 500);
        file.get_slice(200 + 500, 400);
    }

    fn multi_file_info() -> StorageInfo {
        // pieces: (index:first byte offset)
        // ----------------------------------------------------------------
        // |0:0         |1:16          |2:32          |3:48          |4:64 |
        // ----------------------------------------------------------------
        // files: (index:first byte offset,last byte offset)
        // ----------------------------------------------------------------
        // |0:0,8 |1:9,19  |2:20,26|3:27,35 |4:36,47  |5:48,63      |6:64,71|
        // ----------------------------------------------------------------
        let files = vec![
            plain_file("/0", 0, 9),
            plain_file("/1", 9, 11),
            plain_file("/2", 20, 7),
            plain_file("/3", 27, 9),
            plain_file("/4", 36, 12),
            plain_file("/5", 48, 16),
            plain_file("/6", 64, 8),
        ];
        let download_len: u64 = files.iter().map(|f| f.len).sum();
        debug_assert_eq!(download_len, 72);
        StorageInfo {
            piece_count: 5,
            piece_len: 16,
            last_piece_len: 8,
            download_len,
            download_dir: PathBuf::from("/"),
            files,
        }
    }

    #[test]
    fn test_files_intersecting_pieces() {
        let info = multi_file_info();
        // piece 0 intersects with files 0 and 1
        assert_eq!(info.files_intersecting_piece(0), 0..2);
        // piece 1 intersects with files 1, 2, 3
        assert_eq!(info.files_intersecting_piece(1), 1..4);
        // piece 2 intersects with files 3 and 4
        assert_eq!(info.files_intersecting_piece(2), 3..5);
        // piece 3 intersects with only file 5
        assert_eq!(info.files_intersecting_piece(3), 5..6);
        // last piece 4 intersects with only file 6
        assert_eq!(info.files_intersecting_piece(4), 6..7);
        // piece 5 is invalid
        assert_eq!(info.files_intersecting_piece(5), 0..0);
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 16,
            last_piece_len: 10,
            download_len: 26,
            download_dir: PathBuf::from("/"),
            files: vec![
                plain_file("/bogus0", 0, 4),
                plain_file("/bogus1", 4, 9),
                plain_file("/bogus2", 13, 3),
                plain_file("/bogus3", 16, 10),
            ],
        };
        // bytes only in the first file
        assert_eq!(info.files_intersecting_bytes(0..4), 0..1);
        // bytes intersecting two files
        assert_eq!(info.files_intersecting_bytes(0..5), 0..2);
        // bytes overlapping with two files
        assert_eq!(info.files_intersecting_bytes(0..13), 0..2);
        // bytes intersecting three files
        assert_eq!(info.files_intersecting_bytes(0..15), 0..3);
        // bytes intersecting all files
        assert_eq!(info.files_intersecting_bytes(0..18), 0..4);
        // bytes intersecting the last byte of the last file
        assert_eq!(info.files_intersecting_bytes(25..26), 3..4);
        // bytes overlapping with two files in the middle
        assert_eq!(info.files_intersecting_bytes(4..16), 1..3);
        // bytes not intersecting any files
        assert_eq!(info.files_intersecting_bytes(30..38), 0..0);
    }

    #[test]
    fn test_piece_len_boundaries() {
        let info = multi_file_info();
        assert_eq!(info.piece_len(0), Some(16));
        assert_eq!(info.piece_len(3), Some(16));
        assert_eq!(info.piece_len(4), Some(8));
        assert_eq!(info.piece_len(5), None);
    }

    #[test]
    fn test_all_padding_detection() {
        let mut info = multi_file_info();
        // make file 5 (sole owner of piece 3) a padding file
        info.files[5].attrs.padding = true;
        assert!(info.is_all_padding(3));
        // piece 2 overlaps real files
        assert!(!info.is_all_padding(2));
        // piece 0 overlaps a real and, after marking file 0, a padding file:
        // still not all-padding because file 1 is real
        info.files[0].attrs.padding = true;
        assert!(!info.is_all_padding(0));
    }
}
