//! Command execution for the disk task: per-torrent dispatch and the
//! hand-off of blocking jobs to the thread pool.

use std::collections::HashMap;

use tokio::task;

use crate::blockinfo::{BlockInfo, CachedBlock};
use crate::conf::DiskConf;
use crate::error::disk::NewTorrentError;
use crate::TorrentId;

use super::{block_read_done, Command, Done};

mod file;
mod piece;
pub(crate) mod torrent;

pub(crate) use self::torrent::Torrent;

struct TorrentEntry {
    torrent: Torrent,
    /// Where piece completions and read errors are reported.
    torrent_tx: crate::torrent::Sender,
}

/// The state the disk task dispatches against.
pub(crate) struct Disk {
    conf: DiskConf,
    torrents: HashMap<TorrentId, TorrentEntry>,
}

impl Disk {
    pub fn new(conf: DiskConf) -> Self {
        Self {
            conf,
            torrents: HashMap::new(),
        }
    }

    /// Inserts the result of a finished allocation job. Returns the
    /// engine-facing allocation result.
    pub fn torrent_allocated(
        &mut self,
        id: TorrentId,
        result: Result<Torrent, NewTorrentError>,
        torrent_tx: crate::torrent::Sender,
    ) -> Result<(), NewTorrentError> {
        match result {
            Ok(torrent) => {
                self.torrents.insert(
                    id,
                    TorrentEntry {
                        torrent,
                        torrent_tx,
                    },
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn cache_block(
        &mut self,
        id: TorrentId,
        block_info: BlockInfo,
        block: CachedBlock,
    ) {
        if let Some(entry) = self.torrents.get_mut(&id) {
            entry.torrent.cache_block(block_info, block);
        }
    }

    /// Executes one command. Returns true when a blocking job was spawned
    /// (occupying a worker slot); inline work returns false.
    pub fn execute(
        &mut self,
        cmd: Command,
        done_tx: &tokio::sync::mpsc::UnboundedSender<Done>,
    ) -> bool {
        match cmd {
            Command::NewTorrent {
                id,
                storage_info,
                piece_hashes,
                torrent_tx,
            } => {
                if self.torrents.contains_key(&id) {
                    log::warn!("Torrent {id} already allocated on disk");
                    done_tx
                        .send(Done::Allocated {
                            id,
                            result: Err(NewTorrentError::AlreadyExists),
                            torrent_tx,
                        })
                        .ok();
                    return false;
                }
                let conf = self.conf.clone();
                let done = done_tx.clone();
                task::spawn_blocking(move || {
                    let result =
                        Torrent::allocate(storage_info, piece_hashes, &conf);
                    done.send(Done::Allocated {
                        id,
                        result,
                        torrent_tx,
                    })
                    .ok();
                });
                true
            }
            Command::WriteBlock {
                id,
                block_info,
                data,
            } => {
                let Some(entry) = self.torrents.get_mut(&id) else {
                    log::warn!("Write for unknown torrent {id}");
                    return false;
                };
                let Some(job) = entry.torrent.write_block(block_info, data)
                else {
                    return false;
                };
                // the piece is complete: hash it and, if valid, write it
                let torrent_tx = entry.torrent_tx.clone();
                let done = done_tx.clone();
                let index = job.index;
                task::spawn_blocking(move || {
                    let (is_valid, result) = job.run();
                    let msg = match result {
                        Ok(()) => Ok(crate::torrent::PieceCompletion {
                            index,
                            is_valid,
                        }),
                        Err(e) => Err(e),
                    };
                    torrent_tx
                        .send(crate::torrent::Command::PieceCompletion(msg))
                        .ok();
                    done.send(Done::Job).ok();
                });
                true
            }
            Command::ReadBlock {
                id,
                block_info,
                result_tx,
            } => {
                let Some(entry) = self.torrents.get_mut(&id) else {
                    log::warn!("Read for unknown torrent {id}");
                    return false;
                };
                match entry.torrent.read_block(block_info) {
                    Ok(Ok(block)) => {
                        // cache hit, serve inline
                        block_read_done(
                            &result_tx,
                            Some(&entry.torrent_tx),
                            block_info,
                            Ok(block),
                        );
                        false
                    }
                    Ok(Err(job)) => {
                        let torrent_tx = entry.torrent_tx.clone();
                        let done = done_tx.clone();
                        task::spawn_blocking(move || {
                            let result = job.run();
                            if let Ok(block) = &result {
                                done.send(Done::CachePut {
                                    id,
                                    block_info,
                                    block: std::sync::Arc::clone(block),
                                })
                                .ok();
                            }
                            block_read_done(
                                &result_tx,
                                Some(&torrent_tx),
                                block_info,
                                result,
                            );
                            done.send(Done::Job).ok();
                        });
                        true
                    }
                    Err(error) => {
                        block_read_done(
                            &result_tx,
                            Some(&entry.torrent_tx),
                            block_info,
                            Err(error),
                        );
                        false
                    }
                }
            }
            Command::VerifyPiece {
                id,
                piece_index,
                result_tx,
            } => {
                let job = self
                    .torrents
                    .get(&id)
                    .and_then(|e| e.torrent.verify_piece(piece_index));
                match job {
                    Some(job) => {
                        let done = done_tx.clone();
                        task::spawn_blocking(move || {
                            result_tx.send(job.run()).ok();
                            done.send(Done::Job).ok();
                        });
                        true
                    }
                    None => {
                        result_tx.send(false).ok();
                        false
                    }
                }
            }
            Command::WriteFileAtomic {
                path,
                bytes,
                result_tx,
            } => {
                let done = done_tx.clone();
                task::spawn_blocking(move || {
                    result_tx.send(write_file_atomic(&path, &bytes)).ok();
                    done.send(Done::Job).ok();
                });
                true
            }
            Command::FinalizeTorrent { id } => {
                let Some(entry) = self.torrents.get(&id) else {
                    return false;
                };
                let job = entry.torrent.finalize_job();
                let done = done_tx.clone();
                task::spawn_blocking(move || {
                    job.run();
                    done.send(Done::Job).ok();
                });
                true
            }
            Command::Shutdown => false,
        }
    }
}

/// Writes a file crash-safely: temp file in the same directory, fsync,
/// rename over the target.
fn write_file_atomic(
    path: &std::path::Path,
    bytes: &[u8],
) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = {
        let mut name = path.as_os_str().to_owned();
        name.push(".tmp");
        std::path::PathBuf::from(name)
    };
    let mut tmp = std::fs::File::create(&tmp_path)?;
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    drop(tmp);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_file_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/record.json");
        write_file_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
        // no temp file left behind
        assert!(!path.with_extension("json.tmp").exists());

        // overwriting replaces the content atomically
        write_file_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":2}");
    }
}
