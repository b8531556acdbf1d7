//! The engine is the top-level coordinator that runs and manages all
//! entities in the swarm: the torrents, the shared disk task, the shared
//! DHT node, the shared rate buckets and the inbound peer listener.
//!
//! The user interacts with the engine via the [`EngineHandle`], which
//! exposes a restricted public API; the underlying communication method
//! is a tokio mpsc channel. The engine is spawned as a tokio task and
//! runs in the background until an unrecoverable error occurs or until
//! the user sends a shutdown command.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task;
use tokio_util::codec::FramedRead;

use crate::alert::{Alert, AlertReceiver, AlertSender};
use crate::bencode;
use crate::conf::{Conf, TorrentConf};
use crate::checkpoint::TorrentSource;
use crate::error::{EngineResult, Error, NewTorrentError, TorrentResult};
use crate::magnet::MagnetUri;
use crate::metainfo::Metainfo;
use crate::peer::codec::{Handshake, HandshakeCodec};
use crate::piece::FilePriority;
use crate::rate::RateLimiter;
use crate::torrent::{self, Torrent, TorrentKind};
use crate::{dht, disk, Sha1Hash, TorrentId};

/// The channel through which the user can send commands to the engine.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The type of commands that the engine can receive.
pub(crate) enum Command {
    /// Contains the information for creating a new torrent.
    CreateTorrent {
        id: TorrentId,
        params: Box<TorrentParams>,
    },
    /// Torrent allocation result from the disk task. If successful, the
    /// id of the allocated torrent is returned for identification, if
    /// not, the reason of the error is included.
    TorrentAllocation {
        id: TorrentId,
        result: Result<(), NewTorrentError>,
    },
    /// An inbound connection whose handshake the listener read.
    InboundPeer {
        stream: TcpStream,
        handshake: Handshake,
        read_buf: bytes::BytesMut,
    },
    /// Pause the torrent: stop transfers, keep it loaded.
    PauseTorrent { id: TorrentId },
    /// Resume a paused or errored torrent.
    ResumeTorrent { id: TorrentId },
    /// Change a file's selection entry within a torrent.
    SetFileSelection {
        id: TorrentId,
        file: usize,
        selected: bool,
        priority: FilePriority,
    },
    /// Gracefully shuts down the engine and waits for all its torrents
    /// to do the same.
    Shutdown,
}

/// What to load a torrent from.
pub enum AddTorrent {
    /// The raw contents of a `.torrent` file, with its path (if it came
    /// from one) recorded for checkpoints.
    TorrentFile {
        bytes: Vec<u8>,
        path: Option<PathBuf>,
    },
    /// A magnet URI.
    Magnet(String),
}

/// Information for creating a new torrent.
pub struct TorrentParams {
    /// Where the torrent comes from.
    pub source: AddTorrent,
    /// If set, overrides the default per-torrent config.
    pub conf: Option<TorrentConf>,
    /// Known peers to try first (e.g. seeds in a controlled setup).
    pub seeds: Vec<SocketAddr>,
}

/// The hook the engine consults before any peer connection is allowed.
pub type PeerFilter = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Spawns the engine as a tokio task.
///
/// The return value is a tuple of an [`EngineHandle`], which may be used
/// to send the engine commands, and an [`AlertReceiver`], to which
/// various components in the engine send alerts of events.
pub fn spawn(conf: Conf) -> EngineResult<(EngineHandle, AlertReceiver)> {
    spawn_with_filter(conf, None)
}

/// Like [`spawn`], with an "is this peer allowed?" hook installed. The
/// hook is consulted for both inbound and outbound connections.
pub fn spawn_with_filter(
    conf: Conf,
    peer_filter: Option<PeerFilter>,
) -> EngineResult<(EngineHandle, AlertReceiver)> {
    log::info!("Spawning engine task");

    let (alert_tx, alert_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let engine_cmd_tx = cmd_tx.clone();
    let join_handle = task::spawn(async move {
        let mut engine =
            Engine::new(conf, alert_tx, engine_cmd_tx, cmd_rx, peer_filter)
                .await?;
        engine.run().await
    });

    Ok((
        EngineHandle {
            tx: cmd_tx,
            join_handle: Some(join_handle),
        },
        alert_rx,
    ))
}

/// A running torrent's entry in the engine.
struct TorrentEntry {
    /// The torrent's command channel on which engine sends commands.
    tx: torrent::Sender,
    /// The torrent task's join handle, used during shutdown.
    join_handle: Option<task::JoinHandle<TorrentResult<()>>>,
}

struct Engine {
    /// All currently running torrents in engine.
    torrents: HashMap<TorrentId, TorrentEntry>,
    /// Info-hash to torrent id, for routing inbound peers.
    by_info_hash: HashMap<Sha1Hash, TorrentId>,

    /// The port on which other entities in the engine, or the API
    /// consumer, send the engine commands.
    cmd_rx: Receiver,

    disk_tx: disk::Sender,
    disk_join_handle: Option<disk::JoinHandle>,

    dht_tx: Option<dht::Sender>,
    dht_join_handle: Option<dht::JoinHandle>,

    /// The inbound peer listener task.
    listener_handle: Option<task::JoinHandle<()>>,
    /// The port the listener actually bound; announced to trackers.
    listen_port: u16,

    /// The channel on which tasks in the engine post alerts to the user.
    alert_tx: AlertSender,

    /// The engine-wide transfer rate buckets.
    rate_limiter: Arc<std::sync::Mutex<RateLimiter>>,
    /// Connected sessions across all torrents, against the global cap.
    global_peers: Arc<AtomicUsize>,

    peer_filter: Option<PeerFilter>,

    /// The global engine configuration that includes defaults for
    /// torrents whose config is not overridden.
    conf: Conf,
}

impl Engine {
    /// Creates a new engine: spawns the disk task, the DHT node (when
    /// enabled) and the inbound listener.
    async fn new(
        conf: Conf,
        alert_tx: AlertSender,
        cmd_tx: Sender,
        cmd_rx: Receiver,
        peer_filter: Option<PeerFilter>,
    ) -> EngineResult<Self> {
        let (disk_join_handle, disk_tx) =
            disk::spawn(conf.disk.clone(), cmd_tx.clone())?;

        let (dht_join_handle, dht_tx) = if conf.discovery.enable_dht {
            let (join, tx) = dht::spawn(
                conf.discovery.dht_port,
                conf.discovery.dht_bootstrap_nodes.clone(),
            )?;
            (Some(join), Some(tx))
        } else {
            (None, None)
        };

        // bind the peer listener; a busy required port is a fatal
        // startup error
        let listen_addr = conf.engine.listen_addr.unwrap_or_else(|| {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        });
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(Error::PortBind)?;
        let listen_port =
            listener.local_addr().map_err(Error::PortBind)?.port();
        log::info!("Accepting peer connections on port {listen_port}");
        let listener_handle =
            Some(task::spawn(accept_loop(listener, cmd_tx.clone())));

        Ok(Engine {
            torrents: HashMap::new(),
            by_info_hash: HashMap::new(),
            cmd_rx,
            disk_tx,
            disk_join_handle: Some(disk_join_handle),
            dht_tx,
            dht_join_handle,
            listener_handle,
            listen_port,
            alert_tx,
            rate_limiter: Arc::new(std::sync::Mutex::new(
                RateLimiter::new(
                    conf.engine.download_rate_limit,
                    conf.engine.upload_rate_limit,
                ),
            )),
            global_peers: Arc::new(AtomicUsize::new(0)),
            peer_filter,
            conf,
        })
    }

    async fn run(&mut self) -> EngineResult<()> {
        log::info!("Starting engine");

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::CreateTorrent { id, params } => {
                    if let Err(e) = self.create_torrent(id, *params) {
                        log::error!("Failed to create torrent {id}: {e}");
                        self.alert_tx.send(Alert::Error(e)).ok();
                    }
                }
                Command::TorrentAllocation { id, result } => match result {
                    Ok(_) => {
                        log::info!("Torrent {id} allocated on disk");
                    }
                    Err(e) => {
                        log::error!(
                            "Error allocating torrent {id} on disk: {e}"
                        );
                    }
                },
                Command::InboundPeer {
                    stream,
                    handshake,
                    read_buf,
                } => {
                    self.route_inbound(stream, handshake, read_buf);
                }
                Command::PauseTorrent { id } => {
                    self.send_to_torrent(id, torrent::Command::Pause);
                }
                Command::ResumeTorrent { id } => {
                    self.send_to_torrent(id, torrent::Command::Resume);
                }
                Command::SetFileSelection {
                    id,
                    file,
                    selected,
                    priority,
                } => {
                    self.send_to_torrent(
                        id,
                        torrent::Command::SetFileSelection {
                            file,
                            selected,
                            priority,
                        },
                    );
                }
                Command::Shutdown => {
                    self.shutdown().await?;
                    break;
                }
            }
        }

        Ok(())
    }

    fn send_to_torrent(&self, id: TorrentId, cmd: torrent::Command) {
        match self.torrents.get(&id) {
            Some(entry) => {
                entry.tx.send(cmd).ok();
            }
            None => log::warn!("Command for unknown torrent {id}"),
        }
    }

    /// Creates and spawns a new torrent based on the parameters given.
    fn create_torrent(
        &mut self,
        id: TorrentId,
        params: TorrentParams,
    ) -> EngineResult<()> {
        let kind = match params.source {
            AddTorrent::TorrentFile { bytes, path } => {
                let metainfo = Metainfo::from_bytes(&bytes)
                    .map_err(Error::InvalidMetainfo)?;
                // the canonical info dictionary is kept for serving
                // ut_metadata
                let raw_info = bencode::decode(&bytes)
                    .ok()
                    .and_then(|root| {
                        root.lookup(b"info").map(|info| info.encode())
                    })
                    .expect("metainfo parsed above");
                let source = match path {
                    Some(path) => TorrentSource::TorrentFile { path },
                    None => TorrentSource::Magnet {
                        uri: format!(
                            "magnet:?xt=urn:btih:{}",
                            hex::encode(metainfo.wire_info_hash())
                        ),
                    },
                };
                TorrentKind::Metainfo {
                    metainfo: Box::new(metainfo),
                    raw_info,
                    source,
                }
            }
            AddTorrent::Magnet(uri) => {
                let magnet =
                    MagnetUri::parse(&uri).map_err(Error::InvalidMagnet)?;
                TorrentKind::Magnet {
                    magnet: Box::new(magnet),
                }
            }
        };

        let conf = params
            .conf
            .unwrap_or_else(|| self.conf.torrent.clone());
        let (mut torrent, torrent_tx) = Torrent::new(torrent::Params {
            id,
            kind,
            conf,
            discovery: self.conf.discovery.clone(),
            client_id: self.conf.engine.client_id,
            download_dir: self.conf.engine.download_dir.clone(),
            checkpoint_dir: self.conf.engine.checkpoint_dir.clone(),
            listen_port: self.listen_port,
            disk_tx: self.disk_tx.clone(),
            dht_tx: self.dht_tx.clone(),
            alert_tx: self.alert_tx.clone(),
            rate_limiter: Arc::clone(&self.rate_limiter),
            peer_filter: self.peer_filter.clone(),
            global_peers: Arc::clone(&self.global_peers),
            max_global_peers: self.conf.engine.max_global_peers,
        });

        self.by_info_hash.insert(torrent.info_hash(), id);
        let seeds = params.seeds;
        let join_handle =
            task::spawn(async move { torrent.start(&seeds).await });
        self.torrents.insert(
            id,
            TorrentEntry {
                tx: torrent_tx,
                join_handle: Some(join_handle),
            },
        );
        Ok(())
    }

    /// Routes an accepted connection to the torrent serving its
    /// info-hash; unknown hashes are dropped with a polite close.
    fn route_inbound(
        &mut self,
        stream: TcpStream,
        handshake: Handshake,
        read_buf: bytes::BytesMut,
    ) {
        let Some(id) = self.by_info_hash.get(&handshake.info_hash) else {
            log::debug!(
                "Inbound peer for unknown info hash {}",
                hex::encode(handshake.info_hash)
            );
            return;
        };
        self.send_to_torrent(
            *id,
            torrent::Command::PeerAccepted {
                stream,
                handshake,
                read_buf,
            },
        );
    }

    async fn shutdown(&mut self) -> EngineResult<()> {
        log::info!("Shutting down engine");

        // no new inbound peers
        if let Some(listener) = self.listener_handle.take() {
            listener.abort();
        }

        // tell all torrents to shut down and join their tasks
        for torrent in self.torrents.values_mut() {
            // the torrent task may no longer be running, so don't panic
            torrent.tx.send(torrent::Command::Shutdown).ok();
        }
        for torrent in self.torrents.values_mut() {
            if let Some(join_handle) = torrent.join_handle.take() {
                match join_handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Torrent error: {e}"),
                    Err(e) => log::error!("Torrent task panicked: {e}"),
                }
            }
        }

        if let Some(dht_tx) = &self.dht_tx {
            dht_tx.send(dht::Command::Shutdown).ok();
        }
        if let Some(join_handle) = self.dht_join_handle.take() {
            join_handle.await.ok();
        }

        // the disk drains its queue before exiting, so every checkpoint
        // flushed above is durable once this join returns
        self.disk_tx.send(disk::Command::Shutdown).await.ok();
        if let Some(join_handle) = self.disk_join_handle.take() {
            join_handle
                .await
                .expect("disk task has panicked")
                .map_err(Error::from)?;
        }

        Ok(())
    }
}

/// The listener: accepts connections and reads their handshakes before
/// handing them to the engine for routing.
async fn accept_loop(listener: TcpListener, cmd_tx: Sender) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Accept failed: {e}");
                continue;
            }
        };
        log::debug!("Inbound connection from {addr}");
        let cmd_tx = cmd_tx.clone();
        task::spawn(async move {
            // the remote has 30 seconds to present its handshake
            let mut framed = FramedRead::new(stream, HandshakeCodec);
            let handshake = tokio::time::timeout(
                Duration::from_secs(30),
                framed.next(),
            )
            .await;
            match handshake {
                Ok(Some(Ok(handshake))) => {
                    let read_buf = framed.read_buffer().clone();
                    let stream = framed.into_inner();
                    cmd_tx
                        .send(Command::InboundPeer {
                            stream,
                            handshake,
                            read_buf,
                        })
                        .ok();
                }
                Ok(Some(Err(e))) => {
                    log::debug!("Bad inbound handshake from {addr}: {e}");
                }
                Ok(None) | Err(_) => {
                    log::debug!("Inbound peer {addr} sent no handshake");
                }
            }
        });
    }
}

/// A handle to the currently running torrent engine.
pub struct EngineHandle {
    tx: Sender,
    join_handle: Option<task::JoinHandle<EngineResult<()>>>,
}

impl EngineHandle {
    /// Creates and starts a torrent from a `.torrent` file's contents or
    /// a magnet URI.
    ///
    /// If successful, it returns the id of the torrent. This id can be
    /// used to identify the torrent when issuing further commands.
    pub fn create_torrent(
        &self,
        params: TorrentParams,
    ) -> EngineResult<TorrentId> {
        log::trace!("Creating torrent");
        let id = TorrentId::new();
        self.tx.send(Command::CreateTorrent {
            id,
            params: Box::new(params),
        })?;
        Ok(id)
    }

    /// Pauses the torrent: transfers stop, the checkpoint is flushed.
    pub fn pause_torrent(&self, id: TorrentId) -> EngineResult<()> {
        self.tx.send(Command::PauseTorrent { id })?;
        Ok(())
    }

    /// Resumes a paused or errored torrent.
    pub fn resume_torrent(&self, id: TorrentId) -> EngineResult<()> {
        self.tx.send(Command::ResumeTorrent { id })?;
        Ok(())
    }

    /// Changes one file's selection entry within a torrent.
    pub fn set_file_selection(
        &self,
        id: TorrentId,
        file: usize,
        selected: bool,
        priority: FilePriority,
    ) -> EngineResult<()> {
        self.tx.send(Command::SetFileSelection {
            id,
            file,
            selected,
            priority,
        })?;
        Ok(())
    }

    /// Gracefully shuts down the engine and waits for all its torrents
    /// to do the same.
    ///
    /// # Panics
    ///
    /// This method panics if the engine has already been shut down.
    pub async fn shutdown(mut self) -> EngineResult<()> {
        log::trace!("Shutting down engine task");
        self.tx.send(Command::Shutdown)?;
        if let Err(e) = self
            .join_handle
            .take()
            .expect("engine already shut down")
            .await
            .expect("task error")
        {
            log::error!("Engine error: {e}");
        }
        Ok(())
    }
}
