//! A BitTorrent swarm engine library.
//!
//! The engine joins swarms from `.torrent` files or magnet links,
//! downloads content from peers with hash verification and crash
//! resumable checkpoints, and serves it back. Peer discovery runs over
//! HTTP/UDP trackers, a shared Kademlia DHT node and peer exchange.
//!
//! The entry point is [`engine::spawn`]: it returns a handle for issuing
//! commands (add torrent, pause, resume, shutdown) and an alert channel
//! the application can be driven by.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use riptide::{conf::Conf, engine};
//!
//! let (handle, mut alerts) = engine::spawn(Conf::new("/tmp/downloads"))?;
//! let id = handle.create_torrent(engine::TorrentParams {
//!     source: engine::AddTorrent::Magnet(
//!         "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a"
//!             .into(),
//!     ),
//!     conf: None,
//!     seeds: Vec::new(),
//! })?;
//! while let Some(alert) = alerts.recv().await {
//!     log::info!("engine alert: {alert:?}");
//! }
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod bencode;
pub mod conf;
pub mod engine;
pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod storage_info;

pub(crate) mod avg;
pub(crate) mod blockinfo;
pub(crate) mod checkpoint;
pub(crate) mod choke;
pub(crate) mod counter;
pub(crate) mod dht;
pub(crate) mod disk;
pub(crate) mod iovecs;
pub(crate) mod metadata;
pub(crate) mod peer;
pub(crate) mod pex;
pub(crate) mod piece;
pub(crate) mod rate;
pub(crate) mod torrent;
pub(crate) mod tracker;

mod define;
pub use define::*;

pub use alert::{Alert, AlertReceiver};
pub use engine::{AddTorrent, EngineHandle, TorrentParams};
pub use piece::{FilePriority, PieceState};
pub use torrent::stats::TorrentStats;
pub use torrent::LifecycleState;
