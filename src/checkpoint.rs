//! Crash-resumable checkpoints: one JSON record per torrent, written
//! atomically (temp file, fsync, rename) through the disk task's
//! checkpoint-priority queue.
//!
//! A full record snapshots the piece states, file list, selection,
//! torrent source and tracker health. Between full saves, cheap delta
//! records append the freshly verified pieces; the loader merges them.
//! Records that fail to parse or that disagree with the torrent's
//! identity are quarantined (renamed, never deleted) and the torrent
//! starts from scratch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};

use crate::error::checkpoint::{CheckpointError, Result};
use crate::piece::{FilePriority, PieceState};
use crate::storage_info::StorageInfo;
use crate::{PieceIndex, Sha1Hash};

/// The record format version; bumped on incompatible layout changes.
const FORMAT_VERSION: u32 = 1;

/// Where the torrent came from, so a resume can re-open it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum TorrentSource {
    TorrentFile { path: PathBuf },
    Magnet { uri: String },
}

/// One file's snapshot within a checkpoint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CheckpointFile {
    pub path: PathBuf,
    pub len: u64,
    /// BEP 47 attribute letters, e.g. `"px"`.
    #[serde(default)]
    pub attrs: String,
    /// Hex of the per-file SHA-1, when the metainfo carried one.
    #[serde(default)]
    pub sha1: Option<String>,
}

/// One file's selection entry.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CheckpointSelection {
    pub selected: bool,
    /// 0 = skip, 1 = low, 2 = normal, 3 = high, 4 = max.
    pub priority: u8,
}

/// The per-torrent checkpoint snapshot.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CheckpointRecord {
    pub version: u32,
    /// Hex of the torrent's wire info-hash.
    pub info_hash: String,
    pub name: String,
    pub piece_len: u32,
    pub total_pieces: usize,
    /// Indices of verified pieces, ascending.
    pub verified_pieces: Vec<PieceIndex>,
    /// Per-piece state codes; everything non-verified loads as missing.
    pub piece_states: Vec<u8>,
    pub files: Vec<CheckpointFile>,
    pub selection: Vec<CheckpointSelection>,
    pub source: TorrentSource,
    pub trackers: Vec<String>,
    /// Tracker URL to consecutive-failure count.
    #[serde(default)]
    pub tracker_health: HashMap<String, usize>,
    /// Last known peers, a seed for the candidate queue on resume.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Unix seconds.
    pub created_at: u64,
    pub updated_at: u64,
}

/// The incremental record: verified pieces since the last full save.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CheckpointDelta {
    pub info_hash: String,
    pub new_verified: Vec<PieceIndex>,
    pub updated_at: u64,
}

fn piece_state_code(state: PieceState) -> u8 {
    match state {
        PieceState::Missing => 0,
        PieceState::Requested => 1,
        PieceState::Downloading => 2,
        PieceState::Complete => 3,
        PieceState::Verified => 4,
    }
}

fn priority_code(priority: FilePriority) -> u8 {
    match priority {
        FilePriority::Skip => 0,
        FilePriority::Low => 1,
        FilePriority::Normal => 2,
        FilePriority::High => 3,
        FilePriority::Max => 4,
    }
}

pub(crate) fn priority_from_code(code: u8) -> FilePriority {
    match code {
        0 => FilePriority::Skip,
        1 => FilePriority::Low,
        3 => FilePriority::High,
        4 => FilePriority::Max,
        _ => FilePriority::Normal,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl CheckpointRecord {
    /// Builds a full record from the torrent's live state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        info_hash: &Sha1Hash,
        name: &str,
        storage: &StorageInfo,
        piece_states: &[PieceState],
        selection: &crate::piece::FileSelection,
        source: TorrentSource,
        trackers: Vec<String>,
        tracker_health: HashMap<String, usize>,
        peers: Vec<SocketAddr>,
        created_at: Option<u64>,
    ) -> Self {
        let now = unix_now();
        Self {
            version: FORMAT_VERSION,
            info_hash: hex::encode(info_hash),
            name: name.to_owned(),
            piece_len: storage.piece_len,
            total_pieces: storage.piece_count,
            verified_pieces: piece_states
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == PieceState::Verified)
                .map(|(i, _)| i)
                .collect(),
            piece_states: piece_states
                .iter()
                .copied()
                .map(piece_state_code)
                .collect(),
            files: storage
                .files
                .iter()
                .map(|f| CheckpointFile {
                    path: f.path.clone(),
                    len: f.len,
                    attrs: f.attrs.to_string(),
                    sha1: f.sha1.map(hex::encode),
                })
                .collect(),
            selection: (0..storage.files.len())
                .map(|i| {
                    let sel = selection.get(i).expect("selection matches files");
                    CheckpointSelection {
                        selected: sel.selected,
                        priority: priority_code(sel.priority),
                    }
                })
                .collect(),
            source,
            trackers,
            tracker_health,
            peers,
            created_at: created_at.unwrap_or(now),
            updated_at: now,
        }
    }

    /// Checks the record against a freshly parsed torrent's identity.
    /// A mismatch means the checkpoint belongs to something else.
    pub(crate) fn validate_against(
        &self,
        info_hash: &Sha1Hash,
        total_pieces: usize,
        piece_len: u32,
    ) -> Result<()> {
        if self.info_hash != hex::encode(info_hash) {
            return Err(CheckpointError::Mismatch("info hash"));
        }
        if self.total_pieces != total_pieces {
            return Err(CheckpointError::Mismatch("piece count"));
        }
        if self.piece_len != piece_len {
            return Err(CheckpointError::Mismatch("piece length"));
        }
        if self
            .verified_pieces
            .iter()
            .any(|&i| i >= self.total_pieces)
        {
            return Err(CheckpointError::Mismatch(
                "verified piece out of range",
            ));
        }
        Ok(())
    }
}

/// Path management, serialization and recovery for checkpoint records.
pub(crate) struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn record_path(&self, info_hash: &Sha1Hash) -> PathBuf {
        self.dir.join(format!("{}.ckpt.json", hex::encode(info_hash)))
    }

    pub fn delta_path(&self, info_hash: &Sha1Hash) -> PathBuf {
        self.dir
            .join(format!("{}.ckpt.delta.json", hex::encode(info_hash)))
    }

    /// Serializes a full record for the disk task's atomic write. Also
    /// returns the stale delta path so the caller can drop it after the
    /// full record landed.
    pub fn encode_full(
        &self,
        record: &CheckpointRecord,
    ) -> Result<(PathBuf, Vec<u8>)> {
        let bytes = serde_json::to_vec_pretty(record)?;
        Ok((self.record_path(&decode_hash(&record.info_hash)?), bytes))
    }

    /// Serializes a delta record.
    pub fn encode_delta(
        &self,
        info_hash: &Sha1Hash,
        new_verified: Vec<PieceIndex>,
    ) -> Result<(PathBuf, Vec<u8>)> {
        let delta = CheckpointDelta {
            info_hash: hex::encode(info_hash),
            new_verified,
            updated_at: unix_now(),
        };
        let bytes = serde_json::to_vec(&delta)?;
        Ok((self.delta_path(info_hash), bytes))
    }

    /// Loads and merges the record (and any delta) for the info-hash.
    /// Unparseable files are quarantined and reported as `Corrupt`.
    pub fn load(
        &self,
        info_hash: &Sha1Hash,
    ) -> Result<Option<CheckpointRecord>> {
        let path = self.record_path(info_hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let mut record: CheckpointRecord =
            match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    self.quarantine(&path);
                    return Err(CheckpointError::Corrupt {
                        path,
                        detail: e.to_string(),
                    });
                }
            };
        if record.version != FORMAT_VERSION {
            self.quarantine(&path);
            return Err(CheckpointError::Corrupt {
                path,
                detail: format!(
                    "unsupported format version {}",
                    record.version
                ),
            });
        }

        // merge the delta, if one survived since the last full save
        let delta_path = self.delta_path(info_hash);
        match std::fs::read(&delta_path) {
            Ok(bytes) => match serde_json::from_slice::<CheckpointDelta>(
                &bytes,
            ) {
                Ok(delta) if delta.info_hash == record.info_hash => {
                    for index in delta.new_verified {
                        if index < record.total_pieces
                            && !record.verified_pieces.contains(&index)
                        {
                            record.verified_pieces.push(index);
                            if let Some(state) =
                                record.piece_states.get_mut(index)
                            {
                                *state =
                                    piece_state_code(PieceState::Verified);
                            }
                        }
                    }
                    record.verified_pieces.sort_unstable();
                    record.updated_at =
                        record.updated_at.max(delta.updated_at);
                }
                Ok(_) => {
                    log::warn!("Delta at {delta_path:?} is for another torrent");
                    self.quarantine(&delta_path);
                }
                Err(e) => {
                    log::warn!("Unreadable delta at {delta_path:?}: {e}");
                    self.quarantine(&delta_path);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("Failed reading delta {delta_path:?}: {e}");
            }
        }

        Ok(Some(record))
    }

    /// Renames a suspect file out of the way; never deletes it.
    pub fn quarantine(&self, path: &Path) {
        let mut target = path.as_os_str().to_owned();
        target.push(".quarantine");
        if let Err(e) = std::fs::rename(path, PathBuf::from(&target)) {
            log::warn!("Failed to quarantine {path:?}: {e}");
        } else {
            log::warn!("Quarantined checkpoint {path:?}");
        }
    }

    /// Removes the delta file after a full save superseded it.
    pub fn clear_delta(&self, info_hash: &Sha1Hash) {
        let path = self.delta_path(info_hash);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove delta {path:?}: {e}"),
        }
    }
}

fn decode_hash(hex_hash: &str) -> Result<Sha1Hash> {
    hex::decode(hex_hash)
        .ok()
        .and_then(|b| <Sha1Hash>::try_from(b.as_slice()).ok())
        .ok_or(CheckpointError::Mismatch("info hash not 20 bytes of hex"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::piece::FileSelection;
    use crate::storage_info::{FileAttrs, FileInfo};

    fn storage() -> StorageInfo {
        StorageInfo {
            piece_count: 4,
            piece_len: 0x4000,
            last_piece_len: 100,
            download_len: 3 * 0x4000 + 100,
            download_dir: PathBuf::from("/tmp"),
            files: vec![FileInfo {
                path: PathBuf::from("file.bin"),
                len: 3 * 0x4000 + 100,
                torrent_offset: 0,
                attrs: FileAttrs::default(),
                symlink_target: None,
                sha1: None,
                pieces_root: None,
            }],
        }
    }

    fn record(info_hash: &Sha1Hash) -> CheckpointRecord {
        let storage = storage();
        let selection = FileSelection::select_all(&storage);
        CheckpointRecord::build(
            info_hash,
            "file.bin",
            &storage,
            &[
                PieceState::Verified,
                PieceState::Downloading,
                PieceState::Missing,
                PieceState::Verified,
            ],
            &selection,
            TorrentSource::Magnet {
                uri: "magnet:?xt=urn:btih:00".into(),
            },
            vec!["http://t.example/announce".into()],
            HashMap::new(),
            vec!["10.0.0.1:6881".parse().unwrap()],
            None,
        )
    }

    #[test]
    fn test_build_snapshot() {
        let info_hash = [0xabu8; 20];
        let record = record(&info_hash);
        assert_eq!(record.verified_pieces, vec![0, 3]);
        assert_eq!(record.piece_states, vec![4, 2, 0, 4]);
        assert_eq!(record.total_pieces, 4);
        assert_eq!(record.info_hash, hex::encode(info_hash));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf());
        let info_hash = [0xabu8; 20];
        let record = record(&info_hash);

        let (path, bytes) = manager.encode_full(&record).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let loaded = manager.load(&info_hash).unwrap().unwrap();
        assert_eq!(loaded, record);

        // a torrent we never saved yields nothing
        assert!(manager.load(&[0u8; 20]).unwrap().is_none());
    }

    #[test]
    fn test_delta_merge() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf());
        let info_hash = [0xabu8; 20];
        let record = record(&info_hash);

        let (path, bytes) = manager.encode_full(&record).unwrap();
        std::fs::write(&path, bytes).unwrap();
        let (delta_path, delta_bytes) =
            manager.encode_delta(&info_hash, vec![2]).unwrap();
        std::fs::write(&delta_path, delta_bytes).unwrap();

        let loaded = manager.load(&info_hash).unwrap().unwrap();
        assert_eq!(loaded.verified_pieces, vec![0, 2, 3]);
        assert_eq!(loaded.piece_states[2], 4);

        manager.clear_delta(&info_hash);
        let loaded = manager.load(&info_hash).unwrap().unwrap();
        assert_eq!(loaded.verified_pieces, vec![0, 3]);
    }

    #[test]
    fn test_corrupt_record_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf());
        let info_hash = [0xabu8; 20];
        let path = manager.record_path(&info_hash);
        std::fs::write(&path, b"{ not json").unwrap();

        let err = manager.load(&info_hash).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
        // the bad file moved aside rather than vanishing
        assert!(!path.exists());
        let quarantined = {
            let mut name = path.as_os_str().to_owned();
            name.push(".quarantine");
            PathBuf::from(name)
        };
        assert!(quarantined.exists());
    }

    #[test]
    fn test_validation_refusals() {
        let info_hash = [0xabu8; 20];
        let record = record(&info_hash);

        assert!(record.validate_against(&info_hash, 4, 0x4000).is_ok());
        assert!(matches!(
            record.validate_against(&[0u8; 20], 4, 0x4000),
            Err(CheckpointError::Mismatch("info hash"))
        ));
        assert!(matches!(
            record.validate_against(&info_hash, 5, 0x4000),
            Err(CheckpointError::Mismatch("piece count"))
        ));
        assert!(matches!(
            record.validate_against(&info_hash, 4, 0x8000),
            Err(CheckpointError::Mismatch("piece length"))
        ));
    }
}
