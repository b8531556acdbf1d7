//! The disk task: a bounded work queue over all torrents' file IO.
//!
//! Producers (torrents, peer sessions, the checkpoint manager) send
//! commands through a bounded channel, so a saturated disk applies
//! backpressure instead of dropping work. Internally the task keeps three
//! priority classes and runs jobs on the blocking thread pool, with the
//! number of in-flight jobs floating between the configured worker bounds
//! based on queue depth.
//!
//! Piece verification happens here too: a completed piece's blocks are
//! hashed on a worker and, when the digest matches, written to the file
//! segments in one vectored pass. The verdict goes back to the owning
//! torrent as a [`crate::torrent::Command::PieceCompletion`].

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::blockinfo::{Block, BlockInfo};
use crate::conf::DiskConf;
use crate::error::disk::{NewTorrentError, ReadError};
use crate::error::EngineResult;
use crate::piece::PieceHash;
use crate::storage_info::StorageInfo;
use crate::{engine, peer, torrent, PieceIndex, TorrentId};

pub(crate) mod io;

use io::Disk;

pub type JoinHandle = task::JoinHandle<EngineResult<()>>;

/// The channel for sending commands to the disk task. Bounded: sends block
/// when the disk queue is full.
pub(crate) type Sender = mpsc::Sender<Command>;
type Receiver = mpsc::Receiver<Command>;

/// The priority classes of the disk queue, drained in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Priority {
    Checkpoint,
    Metadata,
    Regular,
}

/// The commands the disk task can execute.
pub(crate) enum Command {
    /// Allocate a new torrent's files on disk.
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<PieceHash>,
        torrent_tx: torrent::Sender,
    },
    /// Buffer a downloaded block; completing a piece triggers its hash
    /// check and write-out.
    WriteBlock {
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    },
    /// Read a block and send it to the given peer session (upload path).
    ReadBlock {
        id: TorrentId,
        block_info: BlockInfo,
        result_tx: peer::Sender,
    },
    /// Re-hash a piece against disk contents (resume spot check).
    VerifyPiece {
        id: TorrentId,
        piece_index: PieceIndex,
        result_tx: oneshot::Sender<bool>,
    },
    /// Atomically write a small file (checkpoint records): temp file,
    /// fsync, rename.
    WriteFileAtomic {
        path: PathBuf,
        bytes: Vec<u8>,
        result_tx: oneshot::Sender<std::io::Result<()>>,
    },
    /// Apply BEP 47 attributes to a completed torrent's files.
    FinalizeTorrent { id: TorrentId },
    /// Eventually shut the disk task down, after the queue drains.
    Shutdown,
}

impl Command {
    fn priority(&self) -> Priority {
        match self {
            Command::WriteFileAtomic { .. } => Priority::Checkpoint,
            Command::NewTorrent { .. }
            | Command::VerifyPiece { .. }
            | Command::FinalizeTorrent { .. } => Priority::Metadata,
            Command::WriteBlock { .. }
            | Command::ReadBlock { .. }
            | Command::Shutdown => Priority::Regular,
        }
    }
}

/// Internal job-completion events flowing back to the dispatcher.
pub(crate) enum Done {
    /// A job finished; frees a worker slot.
    Job,
    /// A torrent allocation finished; insert it and notify the engine.
    Allocated {
        id: TorrentId,
        result: Result<io::Torrent, NewTorrentError>,
        torrent_tx: torrent::Sender,
    },
    /// A block read finished; feed the read cache.
    CachePut {
        id: TorrentId,
        block_info: BlockInfo,
        block: crate::blockinfo::CachedBlock,
    },
}

/// Spawns the disk task and returns its join handle and command channel.
pub(crate) fn spawn(
    conf: DiskConf,
    engine_tx: engine::Sender,
) -> EngineResult<(JoinHandle, Sender)> {
    log::info!("Spawning disk task");
    let (tx, rx) = mpsc::channel(conf.queue_size);
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let mut task = Task {
        disk: Disk::new(conf.clone()),
        conf,
        engine_tx,
        cmd_rx: rx,
        done_tx,
        done_rx,
        queues: Queues::default(),
        in_flight: 0,
        shutting_down: false,
    };
    let join_handle = task::spawn(async move { task.run().await });
    Ok((join_handle, tx))
}

#[derive(Default)]
struct Queues {
    checkpoint: VecDeque<Command>,
    metadata: VecDeque<Command>,
    regular: VecDeque<Command>,
}

impl Queues {
    fn push(&mut self, cmd: Command) {
        match cmd.priority() {
            Priority::Checkpoint => self.checkpoint.push_back(cmd),
            Priority::Metadata => self.metadata.push_back(cmd),
            Priority::Regular => self.regular.push_back(cmd),
        }
    }

    fn pop(&mut self) -> Option<Command> {
        self.checkpoint
            .pop_front()
            .or_else(|| self.metadata.pop_front())
            .or_else(|| self.regular.pop_front())
    }

    fn len(&self) -> usize {
        self.checkpoint.len() + self.metadata.len() + self.regular.len()
    }
}

struct Task {
    disk: Disk,
    conf: DiskConf,
    engine_tx: engine::Sender,
    cmd_rx: Receiver,
    done_tx: mpsc::UnboundedSender<Done>,
    done_rx: mpsc::UnboundedReceiver<Done>,
    queues: Queues,
    /// Jobs currently on the blocking pool.
    in_flight: usize,
    shutting_down: bool,
}

impl Task {
    /// The worker target floats with queue depth between the configured
    /// bounds.
    fn target_workers(&self) -> usize {
        self.queues
            .len()
            .clamp(self.conf.workers_min, self.conf.workers_max)
    }

    async fn run(&mut self) -> EngineResult<()> {
        log::info!("Starting disk event loop");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv(), if !self.shutting_down => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Disk queue draining for shutdown");
                            self.shutting_down = true;
                        }
                        Some(cmd) => self.queues.push(cmd),
                    }
                }
                done = self.done_rx.recv() => {
                    // the task holds a done sender, so recv can't fail
                    let done = done.expect("done channel closed");
                    self.handle_done(done);
                }
            }
            self.pump();
            if self.shutting_down
                && self.queues.len() == 0
                && self.in_flight == 0
            {
                break;
            }
        }
        log::info!("Disk event loop stopped");
        Ok(())
    }

    fn handle_done(&mut self, done: Done) {
        match done {
            Done::Job => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            Done::Allocated {
                id,
                result,
                torrent_tx,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let result = self.disk.torrent_allocated(
                    id,
                    result,
                    torrent_tx.clone(),
                );
                torrent_tx
                    .send(torrent::Command::Allocated {
                        ok: result.is_ok(),
                    })
                    .ok();
                self.engine_tx
                    .send(engine::Command::TorrentAllocation { id, result })
                    .ok();
            }
            Done::CachePut {
                id,
                block_info,
                block,
            } => {
                // not a worker slot, just a cache feed
                self.disk.cache_block(id, block_info, block);
            }
        }
    }

    /// Starts queued jobs while worker slots are free.
    fn pump(&mut self) {
        while self.in_flight < self.target_workers().max(1) {
            let Some(cmd) = self.queues.pop() else {
                break;
            };
            if self.disk.execute(cmd, &self.done_tx) {
                self.in_flight += 1;
            }
        }
    }
}

/// The read-result message the disk sends to a requesting peer session.
pub(crate) fn block_read_done(
    result_tx: &peer::Sender,
    torrent_tx: Option<&torrent::Sender>,
    info: BlockInfo,
    result: Result<crate::blockinfo::CachedBlock, ReadError>,
) {
    match result {
        Ok(data) => {
            result_tx
                .send(peer::Command::Block(Block {
                    piece_index: info.piece_index,
                    offset: info.offset,
                    data: data.into(),
                }))
                .ok();
        }
        Err(error) => {
            log::warn!("Block {info} read error: {error}");
            if let Some(tx) = torrent_tx {
                tx.send(torrent::Command::ReadError {
                    block_info: info,
                    error,
                })
                .ok();
            }
        }
    }
}
