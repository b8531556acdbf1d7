//! A single torrent file on disk and the positional IO against it.

use std::fs::{File, OpenOptions};
use std::io::IoSlice;
use std::path::Path;

use crate::conf::Preallocation;
use crate::error::disk::{NewTorrentError, ReadError, WriteError};
use crate::iovecs;
use crate::storage_info::{FileInfo, FileSlice};

#[derive(Debug)]
pub(crate) struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens (creating if necessary) the file in read-write mode at the
    /// download directory joined with the path in the file info, applying
    /// the configured preallocation.
    pub fn open(
        download_dir: &Path,
        info: FileInfo,
        preallocation: Preallocation,
    ) -> Result<Self, NewTorrentError> {
        debug_assert!(!info.attrs.padding, "padding files are never opened");
        let path = download_dir.join(&info.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                NewTorrentError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                }
            })?;
        }
        log::trace!("Opening and creating file {:?}", path);
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                NewTorrentError::Io {
                    path: path.clone(),
                    source: e,
                }
            })?;

        let file = Self { info, handle };
        file.preallocate(preallocation).map_err(|e| {
            NewTorrentError::Io {
                path,
                source: e,
            }
        })?;
        Ok(file)
    }

    fn preallocate(&self, strategy: Preallocation) -> std::io::Result<()> {
        let len = self.info.len;
        if len == 0 {
            // an empty file only needs to exist, which `open` ensured
            return Ok(());
        }
        match strategy {
            Preallocation::None => Ok(()),
            Preallocation::Sparse => self.handle.set_len(len),
            Preallocation::Full => self.fallocate(len),
        }
    }

    #[cfg(unix)]
    fn fallocate(&self, len: u64) -> std::io::Result<()> {
        use std::os::fd::AsRawFd;
        nix::fcntl::posix_fallocate(
            self.handle.as_raw_fd(),
            0,
            len.min(i64::MAX as u64) as i64,
        )
        .map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn fallocate(&self, len: u64) -> std::io::Result<()> {
        self.handle.set_len(len)
    }

    /// Writes the byte range `[skip, skip + slice.len)` of the logically
    /// concatenated `blocks` to this file at `slice.offset`, retrying
    /// partial transfers until everything is on disk.
    pub fn write_blocks(
        &self,
        slice: FileSlice,
        blocks: &[&[u8]],
        skip: usize,
    ) -> Result<(), WriteError> {
        let total = slice.len as usize;
        let mut written = 0usize;
        // system calls are not guaranteed to transfer the whole input in
        // one go, so repeat until all bytes are confirmed on disk
        while written < total {
            let iov = iovecs::gather(
                blocks.iter().copied(),
                skip + written,
                total - written,
            );
            debug_assert_eq!(iovecs::total_len(&iov), total - written);
            let n = self
                .pwritev(&iov, slice.offset + written as u64)
                .map_err(|e| WriteError::Io {
                    path: self.info.path.clone(),
                    offset: slice.offset + written as u64,
                    source: e,
                })?;
            if n == 0 {
                return Err(WriteError::Io {
                    path: self.info.path.clone(),
                    offset: slice.offset + written as u64,
                    source: std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "pwritev wrote zero bytes",
                    ),
                });
            }
            written += n;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn pwritev(
        &self,
        bufs: &[IoSlice<'_>],
        offset: u64,
    ) -> std::io::Result<usize> {
        use std::os::fd::AsFd;
        nix::sys::uio::pwritev(
            self.handle.as_fd(),
            bufs,
            offset.min(i64::MAX as u64) as i64,
        )
        .map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn pwritev(
        &self,
        bufs: &[IoSlice<'_>],
        offset: u64,
    ) -> std::io::Result<usize> {
        use std::io::{Seek, SeekFrom, Write};
        let mut handle = &self.handle;
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_vectored(bufs)
    }

    /// Reads `out.len()` bytes from the file at `offset`. A short read
    /// (end of file before the buffer is full) is `MissingData`: the range
    /// is valid in the torrent but not on disk yet.
    pub fn read_exact_at(
        &self,
        out: &mut [u8],
        offset: u64,
    ) -> Result<(), ReadError> {
        let mut read = 0usize;
        while read < out.len() {
            let n = self
                .pread(&mut out[read..], offset + read as u64)
                .map_err(|e| ReadError::Io {
                    path: self.info.path.clone(),
                    offset: offset + read as u64,
                    source: e,
                })?;
            if n == 0 {
                return Err(ReadError::MissingData);
            }
            read += n;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::os::fd::AsFd;
        nix::sys::uio::pread(
            self.handle.as_fd(),
            buf,
            offset.min(i64::MAX as u64) as i64,
        )
        .map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut handle = &self.handle;
        handle.seek(SeekFrom::Start(offset))?;
        handle.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FileAttrs;
    use std::path::PathBuf;

    fn file_info(name: &str, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(name),
            len,
            torrent_offset: 0,
            attrs: FileAttrs::default(),
            symlink_target: None,
            sha1: None,
            pieces_root: None,
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = TorrentFile::open(
            dir.path(),
            file_info("data.bin", 64),
            Preallocation::None,
        )
        .unwrap();

        let blocks: Vec<Vec<u8>> = vec![vec![1u8; 16], vec![2u8; 16]];
        let refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
        file.write_blocks(FileSlice { offset: 8, len: 24 }, &refs, 4)
            .unwrap();

        let mut out = vec![0u8; 24];
        file.read_exact_at(&mut out, 8).unwrap();
        // bytes 4..16 of block one, then 0..12 of block two
        let mut expected = vec![1u8; 12];
        expected.extend_from_slice(&[2u8; 12]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_short_read_is_missing_data() {
        let dir = tempfile::tempdir().unwrap();
        let file = TorrentFile::open(
            dir.path(),
            file_info("short.bin", 64),
            Preallocation::None,
        )
        .unwrap();
        let mut out = vec![0u8; 16];
        assert!(matches!(
            file.read_exact_at(&mut out, 0),
            Err(ReadError::MissingData)
        ));
    }

    #[test]
    fn test_nested_path_and_sparse_preallocation() {
        let dir = tempfile::tempdir().unwrap();
        let file = TorrentFile::open(
            dir.path(),
            file_info("a/b/c.bin", 4096),
            Preallocation::Sparse,
        )
        .unwrap();
        assert_eq!(file.handle.metadata().unwrap().len(), 4096);
        assert!(dir.path().join("a/b/c.bin").exists());
    }

    #[test]
    fn test_empty_file_is_touched() {
        let dir = tempfile::tempdir().unwrap();
        let _file = TorrentFile::open(
            dir.path(),
            file_info("empty.bin", 0),
            Preallocation::Full,
        )
        .unwrap();
        let meta = std::fs::metadata(dir.path().join("empty.bin")).unwrap();
        assert_eq!(meta.len(), 0);
    }
}
