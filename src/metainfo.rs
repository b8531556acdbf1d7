//! Parsing of `.torrent` metainfo: v1, v2 and hybrid shapes.
//!
//! The parser works on the raw bencode value tree rather than a serde
//! derive, because v2 metainfo requires walking an arbitrarily shaped file
//! tree and because the info-hashes are computed by canonically re-encoding
//! the parsed `info` dictionary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use sha2::Sha256;
use url::Url;

use crate::bencode::{self, Value};
use crate::error::metainfo::{MetainfoError, Result};
use crate::storage_info::{FileAttrs, FileInfo};
use crate::{Sha1Hash, Sha256Hash};

/// The smallest piece length the parser accepts, 16 KiB.
const MIN_PIECE_LEN: u32 = 0x4000;

/// The parsed, immutable metadata of a torrent.
#[derive(Clone)]
pub struct Metainfo {
    /// Torrent name, the stem of the download path.
    pub name: String,
    /// SHA-1 of the bencoded info dictionary; present for v1 and hybrid
    /// torrents.
    pub info_hash_v1: Option<Sha1Hash>,
    /// SHA-256 of the bencoded info dictionary; present for v2 and hybrid
    /// torrents.
    pub info_hash_v2: Option<Sha256Hash>,
    /// The ordered v1 piece hashes. Empty for v2-only torrents.
    pub pieces: Vec<Sha1Hash>,
    /// v2 Merkle piece layers: pieces-root mapped to the ordered SHA-256
    /// leaves of that file's piece layer. Empty for v1-only torrents.
    pub piece_layers: HashMap<Sha256Hash, Vec<Sha256Hash>>,
    /// The nominal piece length.
    pub piece_len: u32,
    /// The flattened file list, in piece-stream order, padding included.
    pub files: Vec<FileInfo>,
    /// Whether this is a private torrent: no DHT, PEX or local discovery.
    pub private: bool,
    /// The trackers that we can announce to, announce-list flattened.
    pub trackers: Vec<Url>,
}

impl std::fmt::Debug for Metainfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metainfo")
            .field("name", &self.name)
            .field("info_hash_v1", &self.info_hash_v1.map(hex::encode))
            .field("info_hash_v2", &self.info_hash_v2.map(hex::encode))
            .field("piece_count", &self.piece_count())
            .field("piece_len", &self.piece_len)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

impl Metainfo {
    /// Parses a `.torrent` buffer into a [`Metainfo`], or returns an error
    /// describing the first violated rule.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let root = bencode::decode(bytes)?;
        let root_dict = root.as_dict().ok_or(MetainfoError::NotADict)?;

        let info = root_dict
            .get(&b"info"[..])
            .ok_or(MetainfoError::MissingField("info"))?;
        let trackers = parse_trackers(root_dict);
        Self::from_info_value(info, Some(root_dict), trackers)
    }

    /// Builds a [`Metainfo`] from a bare, bencoded info dictionary, as
    /// obtained over ut_metadata for magnet-initiated torrents. Trackers
    /// come from the magnet URI since there is no outer dictionary.
    pub fn from_info_dict_bytes(
        bytes: &[u8],
        trackers: Vec<Url>,
    ) -> Result<Self> {
        let info = bencode::decode(bytes)?;
        if info.as_dict().is_none() {
            return Err(MetainfoError::NotADict);
        }
        Self::from_info_value(&info, None, trackers)
    }

    fn from_info_value(
        info: &Value,
        root_dict: Option<&std::collections::BTreeMap<Vec<u8>, Value>>,
        trackers: Vec<Url>,
    ) -> Result<Self> {
        let info_dict =
            info.as_dict().ok_or(MetainfoError::MissingField("info"))?;

        let name = info
            .lookup(b"name")
            .and_then(Value::as_str)
            .ok_or(MetainfoError::MissingField("info.name"))?
            .to_owned();
        if name.is_empty() {
            return Err(MetainfoError::InvalidField {
                field: "info.name",
                detail: "must not be empty".into(),
            });
        }

        let piece_len = info
            .lookup(b"piece length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::MissingField("info.piece length"))?;
        if piece_len < MIN_PIECE_LEN as i64
            || piece_len > u32::MAX as i64
            || !(piece_len as u64).is_power_of_two()
        {
            return Err(MetainfoError::InvalidField {
                field: "info.piece length",
                detail: format!(
                    "{piece_len} is not a power of two of at least 16 KiB"
                ),
            });
        }
        let piece_len = piece_len as u32;

        let meta_version =
            info.lookup(b"meta version").and_then(Value::as_int);
        let is_v2 = meta_version == Some(2)
            && info_dict.contains_key(&b"file tree"[..]);
        let is_v1 = info_dict.contains_key(&b"pieces"[..]);
        if !is_v1 && !is_v2 {
            return Err(MetainfoError::InvalidField {
                field: "info",
                detail: "neither v1 `pieces` nor v2 `file tree` present"
                    .into(),
            });
        }

        // file list, from the shape that is present; for a hybrid torrent
        // the v2 file tree is authoritative and must describe the same
        // content as the v1 list
        let files = if is_v2 {
            parse_file_tree(
                info.lookup(b"file tree")
                    .expect("file tree checked above"),
            )?
        } else {
            parse_v1_files(info_dict, &name)?
        };

        // the v1 pieces field is a concatenation of 20 byte SHA-1 hashes,
        // so it must be a multiple of 20
        let mut pieces = Vec::new();
        if is_v1 {
            let raw = info
                .lookup(b"pieces")
                .and_then(Value::as_bytes)
                .ok_or(MetainfoError::InvalidPieces)?;
            if raw.len() % 20 != 0 {
                return Err(MetainfoError::InvalidPieces);
            }
            pieces.reserve_exact(raw.len() / 20);
            for chunk in raw.chunks_exact(20) {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                pieces.push(hash);
            }
            let download_len: u64 = files.iter().map(|f| f.len).sum();
            let expected =
                download_len.div_ceil(piece_len as u64) as usize;
            if pieces.len() != expected {
                return Err(MetainfoError::InvalidPieces);
            }
        }

        let piece_layers = match (is_v2, root_dict) {
            (true, Some(root_dict)) => {
                parse_piece_layers(root_dict, &files, piece_len)?
            }
            // a bare info dictionary has no `piece layers`; v2 piece
            // verification is then limited to single-piece files
            _ => HashMap::new(),
        };

        let private = info.lookup(b"private").and_then(Value::as_int)
            == Some(1);

        // the info hashes are the digests of the canonical re-encoding of
        // the info dictionary
        let info_bytes = info.encode();
        let info_hash_v1 = is_v1.then(|| {
            let digest = Sha1::digest(&info_bytes);
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        });
        let info_hash_v2 = is_v2.then(|| {
            let digest = Sha256::digest(&info_bytes);
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&digest);
            hash
        });

        if trackers.is_empty() {
            log::warn!("No trackers in metainfo of {name}");
        }

        Ok(Metainfo {
            name,
            info_hash_v1,
            info_hash_v2,
            pieces,
            piece_layers,
            piece_len,
            files,
            private,
            trackers,
        })
    }

    /// The 20-byte hash that identifies this torrent on the wire: the v1
    /// info-hash when present, otherwise the truncated v2 info-hash
    /// (BEP 52).
    pub fn wire_info_hash(&self) -> Sha1Hash {
        if let Some(hash) = self.info_hash_v1 {
            return hash;
        }
        let v2 = self
            .info_hash_v2
            .expect("metainfo must have at least one info hash");
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&v2[..20]);
        hash
    }

    /// The total length of the download, padding files included.
    pub fn download_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        if !self.pieces.is_empty() {
            self.pieces.len()
        } else {
            self.download_len().div_ceil(self.piece_len as u64) as usize
        }
    }

    /// Return true if the download has multiple files.
    pub fn is_archive(&self) -> bool {
        self.files.len() > 1
    }
}

/// Checks a file path parsed from metainfo: relative, non-empty, and
/// without parent-directory escapes.
fn validate_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(MetainfoError::InvalidField {
            field: "path",
            detail: "empty path".into(),
        });
    }
    if path.is_absolute() || path == Path::new("/") {
        return Err(MetainfoError::InvalidField {
            field: "path",
            detail: format!("absolute path {path:?}"),
        });
    }
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(MetainfoError::InvalidField {
            field: "path",
            detail: format!("path {path:?} escapes the download dir"),
        });
    }
    Ok(())
}

/// Parses file attributes common to v1 file entries and v2 tree leaves.
fn parse_attrs(
    node: &Value,
    path: &Path,
) -> Result<(FileAttrs, Option<PathBuf>, Option<Sha1Hash>)> {
    let attrs = node
        .lookup(b"attr")
        .and_then(Value::as_bytes)
        .map(FileAttrs::from_bytes)
        .unwrap_or_default();

    let symlink_target = if attrs.symlink {
        let target: PathBuf = node
            .lookup(b"symlink path")
            .and_then(Value::as_list)
            .map(|components| {
                components
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<PathBuf>()
            })
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| MetainfoError::MissingSymlinkTarget {
                path: path.display().to_string(),
            })?;
        Some(target)
    } else {
        None
    };

    let sha1 = node
        .lookup(b"sha1")
        .and_then(Value::as_bytes)
        .filter(|b| b.len() == 20)
        .map(|b| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(b);
            hash
        });

    Ok((attrs, symlink_target, sha1))
}

/// Parses the v1 `length`/`files` shape into a flat file list.
fn parse_v1_files(
    info_dict: &std::collections::BTreeMap<Vec<u8>, Value>,
    name: &str,
) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    if let Some(len) = info_dict.get(&b"length"[..]) {
        // single file torrent
        if info_dict.contains_key(&b"files"[..]) {
            return Err(MetainfoError::InvalidField {
                field: "info",
                detail: "contains both `length` and `files`".into(),
            });
        }
        let len = len.as_int().filter(|l| *l >= 0).ok_or(
            MetainfoError::InvalidField {
                field: "info.length",
                detail: "negative length".into(),
            },
        )?;
        files.push(FileInfo {
            path: PathBuf::from(name),
            len: len as u64,
            torrent_offset: 0,
            attrs: FileAttrs::default(),
            symlink_target: None,
            sha1: None,
            pieces_root: None,
        });
        return Ok(files);
    }

    let raw_files = info_dict
        .get(&b"files"[..])
        .and_then(Value::as_list)
        .ok_or(MetainfoError::MissingField("info.files"))?;
    if raw_files.is_empty() {
        return Err(MetainfoError::InvalidField {
            field: "info.files",
            detail: "must not be empty".into(),
        });
    }

    files.reserve_exact(raw_files.len());
    let mut torrent_offset = 0;
    for file in raw_files {
        let len = file
            .lookup(b"length")
            .and_then(Value::as_int)
            .filter(|l| *l >= 0)
            .ok_or(MetainfoError::InvalidField {
                field: "files[].length",
                detail: "missing or negative".into(),
            })?;
        let path: PathBuf = file
            .lookup(b"path")
            .and_then(Value::as_list)
            .map(|components| {
                components
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<PathBuf>()
            })
            .ok_or(MetainfoError::MissingField("files[].path"))?;
        validate_path(&path)?;

        let (attrs, symlink_target, sha1) = parse_attrs(file, &path)?;

        files.push(FileInfo {
            path,
            len: len as u64,
            torrent_offset,
            attrs,
            symlink_target,
            sha1,
            pieces_root: None,
        });
        torrent_offset += len as u64;
    }

    Ok(files)
}

/// Flattens a v2 file tree into an ordered file list via depth-first,
/// lexicographic traversal of child keys.
fn parse_file_tree(tree: &Value) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    let mut torrent_offset = 0;
    walk_file_tree(tree, &mut PathBuf::new(), &mut files, &mut torrent_offset)?;
    if files.is_empty() {
        return Err(MetainfoError::InvalidFileTree {
            path: String::new(),
            detail: "tree has no files".into(),
        });
    }
    Ok(files)
}

fn walk_file_tree(
    node: &Value,
    path: &mut PathBuf,
    files: &mut Vec<FileInfo>,
    torrent_offset: &mut u64,
) -> Result<()> {
    let dict = node.as_dict().ok_or_else(|| {
        MetainfoError::InvalidFileTree {
            path: path.display().to_string(),
            detail: "node is not a dictionary".into(),
        }
    })?;

    // a leaf is the `{"": {...}}` sentinel
    if let Some(leaf) = dict.get(&b""[..]) {
        if dict.len() != 1 {
            return Err(MetainfoError::InvalidFileTree {
                path: path.display().to_string(),
                detail: "file node has sibling entries".into(),
            });
        }
        validate_path(path)?;

        let len = leaf
            .lookup(b"length")
            .and_then(Value::as_int)
            .filter(|l| *l >= 0)
            .ok_or_else(|| MetainfoError::InvalidFileTree {
                path: path.display().to_string(),
                detail: "missing or negative length".into(),
            })?;

        let pieces_root = leaf
            .lookup(b"pieces root")
            .and_then(Value::as_bytes)
            .map(|b| {
                if b.len() != 32 {
                    return Err(MetainfoError::InvalidFileTree {
                        path: path.display().to_string(),
                        detail: "pieces root is not 32 bytes".into(),
                    });
                }
                let mut root = [0u8; 32];
                root.copy_from_slice(b);
                Ok(root)
            })
            .transpose()?;
        if len > 0 && pieces_root.is_none() {
            return Err(MetainfoError::InvalidFileTree {
                path: path.display().to_string(),
                detail: "non-empty file without pieces root".into(),
            });
        }

        let (attrs, symlink_target, sha1) = parse_attrs(leaf, path)?;

        files.push(FileInfo {
            path: path.clone(),
            len: len as u64,
            torrent_offset: *torrent_offset,
            attrs,
            symlink_target,
            sha1,
            pieces_root,
        });
        *torrent_offset += len as u64;
        return Ok(());
    }

    if dict.is_empty() {
        return Err(MetainfoError::InvalidFileTree {
            path: path.display().to_string(),
            detail: "directory without children".into(),
        });
    }

    // BTreeMap iterates in ascending byte order, giving the depth-first
    // lexicographic traversal order
    for (component, child) in dict {
        let component = std::str::from_utf8(component).map_err(|_| {
            MetainfoError::InvalidFileTree {
                path: path.display().to_string(),
                detail: "non UTF-8 path component".into(),
            }
        })?;
        path.push(component);
        walk_file_tree(child, path, files, torrent_offset)?;
        path.pop();
    }
    Ok(())
}

/// Validates the top level `piece layers` dictionary against the file list:
/// every file of length `L` must map its pieces root to exactly
/// `ceil(L / piece_len)` 32-byte leaf hashes. Files no longer than one
/// piece have no layer entry; their pieces root is the sole leaf.
fn parse_piece_layers(
    root_dict: &std::collections::BTreeMap<Vec<u8>, Value>,
    files: &[FileInfo],
    piece_len: u32,
) -> Result<HashMap<Sha256Hash, Vec<Sha256Hash>>> {
    let layers_dict = root_dict
        .get(&b"piece layers"[..])
        .and_then(Value::as_dict);

    let mut layers = HashMap::new();
    if let Some(dict) = layers_dict {
        for (root, leaves) in dict {
            if root.len() != 32 {
                return Err(MetainfoError::InvalidField {
                    field: "piece layers",
                    detail: "key is not a 32-byte pieces root".into(),
                });
            }
            let leaves = leaves.as_bytes().ok_or(
                MetainfoError::InvalidField {
                    field: "piece layers",
                    detail: "layer is not a byte string".into(),
                },
            )?;
            if leaves.is_empty() || leaves.len() % 32 != 0 {
                return Err(MetainfoError::InvalidField {
                    field: "piece layers",
                    detail: "layer length is not a positive multiple of 32"
                        .into(),
                });
            }
            let mut root_hash = [0u8; 32];
            root_hash.copy_from_slice(root);
            let leaf_hashes: Vec<Sha256Hash> = leaves
                .chunks_exact(32)
                .map(|chunk| {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect();
            layers.insert(root_hash, leaf_hashes);
        }
    }

    // cross-check the expected hash counts per file
    for file in files {
        if file.len == 0 {
            // an empty file contributes no hashes
            continue;
        }
        let expected = file.len.div_ceil(piece_len as u64) as usize;
        if expected <= 1 {
            // single-piece files keep their only leaf in the pieces root
            continue;
        }
        // files longer than one piece must have a matching layer; we can't
        // tie roots to files here without recomputing Merkle roots, so the
        // per-root validation above has to suffice for count checks
        let has_layer = layers.values().any(|l| l.len() == expected);
        if !has_layer {
            return Err(MetainfoError::InvalidPieceLayer {
                path: file.path.display().to_string(),
            });
        }
    }

    Ok(layers)
}

fn parse_trackers(
    root_dict: &std::collections::BTreeMap<Vec<u8>, Value>,
) -> Vec<Url> {
    fn push(trackers: &mut Vec<Url>, s: &str) {
        if let Ok(url) = Url::parse(s) {
            if matches!(url.scheme(), "http" | "https" | "udp")
                && !trackers.contains(&url)
            {
                trackers.push(url);
            }
        }
    }

    let mut trackers = Vec::new();
    if let Some(tiers) = root_dict
        .get(&b"announce-list"[..])
        .and_then(Value::as_list)
    {
        for tier in tiers {
            if let Some(urls) = tier.as_list() {
                for url in urls {
                    if let Some(s) = url.as_str() {
                        push(&mut trackers, s);
                    }
                }
            }
        }
    }
    if trackers.is_empty() {
        if let Some(s) = root_dict
            .get(&b"announce"[..])
            .and_then(Value::as_str)
        {
            push(&mut trackers, s);
        }
    }
    trackers
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bencode::Value;
    use std::collections::BTreeMap;

    fn bval(b: &[u8]) -> Value {
        Value::Bytes(b.to_vec())
    }

    /// Builds a minimal single-file v1 torrent with 3 pieces.
    fn v1_single_file() -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bval(b"file.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"length".to_vec(), Value::Int(40960));
        info.insert(b"pieces".to_vec(), bval(&[7u8; 60]));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            bval(b"http://tracker.example/announce"),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));
        Value::Dict(root).encode()
    }

    fn v1_multi_file() -> Vec<u8> {
        let mut file1 = BTreeMap::new();
        file1.insert(
            b"path".to_vec(),
            Value::List(vec![bval(b"dir"), bval(b"a.bin")]),
        );
        file1.insert(b"length".to_vec(), Value::Int(20000));

        let mut pad = BTreeMap::new();
        pad.insert(
            b"path".to_vec(),
            Value::List(vec![bval(b".pad"), bval(b"12768")]),
        );
        pad.insert(b"length".to_vec(), Value::Int(12768));
        pad.insert(b"attr".to_vec(), bval(b"p"));

        let mut file2 = BTreeMap::new();
        file2.insert(b"path".to_vec(), Value::List(vec![bval(b"b.bin")]));
        file2.insert(b"length".to_vec(), Value::Int(16384));
        file2.insert(b"attr".to_vec(), bval(b"x"));

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bval(b"archive"));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![
                Value::Dict(file1),
                Value::Dict(pad),
                Value::Dict(file2),
            ]),
        );
        // (20000 + 12768 + 16384) / 16384 = 3 pieces
        info.insert(b"pieces".to_vec(), bval(&[7u8; 60]));
        info.insert(b"private".to_vec(), Value::Int(1));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce-list".to_vec(),
            Value::List(vec![Value::List(vec![
                bval(b"http://one.example/announce"),
                bval(b"udp://two.example:6969/announce"),
            ])]),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));
        Value::Dict(root).encode()
    }

    fn v2_torrent() -> Vec<u8> {
        // one file of 40960 bytes -> 3 pieces of 16384
        let mut leaf = BTreeMap::new();
        leaf.insert(b"length".to_vec(), Value::Int(40960));
        leaf.insert(b"pieces root".to_vec(), bval(&[3u8; 32]));
        let mut sentinel = BTreeMap::new();
        sentinel.insert(b"".to_vec(), Value::Dict(leaf));
        let mut tree = BTreeMap::new();
        tree.insert(b"file.bin".to_vec(), Value::Dict(sentinel));

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bval(b"file.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"meta version".to_vec(), Value::Int(2));
        info.insert(b"file tree".to_vec(), Value::Dict(tree));

        let mut layers = BTreeMap::new();
        layers.insert([3u8; 32].to_vec(), bval(&[9u8; 3 * 32]));

        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        root.insert(b"piece layers".to_vec(), Value::Dict(layers));
        Value::Dict(root).encode()
    }

    #[test]
    fn test_parse_v1_single_file() {
        let metainfo = Metainfo::from_bytes(&v1_single_file()).unwrap();
        assert_eq!(metainfo.name, "file.bin");
        assert!(metainfo.info_hash_v1.is_some());
        assert!(metainfo.info_hash_v2.is_none());
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.download_len(), 40960);
        assert_eq!(metainfo.files.len(), 1);
        assert!(!metainfo.is_archive());
        assert!(!metainfo.private);
        assert_eq!(metainfo.trackers.len(), 1);
    }

    #[test]
    fn test_parse_v1_multi_file_with_padding() {
        let metainfo = Metainfo::from_bytes(&v1_multi_file()).unwrap();
        assert_eq!(metainfo.files.len(), 3);
        assert!(metainfo.is_archive());
        assert!(metainfo.private);

        let pad = &metainfo.files[1];
        assert!(pad.attrs.padding);
        assert_eq!(pad.torrent_offset, 20000);

        let exe = &metainfo.files[2];
        assert!(exe.attrs.executable);
        assert_eq!(exe.torrent_offset, 20000 + 12768);

        // both the http and the udp tracker survive
        assert_eq!(metainfo.trackers.len(), 2);
    }

    #[test]
    fn test_parse_v2() {
        let metainfo = Metainfo::from_bytes(&v2_torrent()).unwrap();
        assert!(metainfo.info_hash_v1.is_none());
        assert!(metainfo.info_hash_v2.is_some());
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.piece_layers.len(), 1);
        assert_eq!(metainfo.piece_layers[&[3u8; 32]].len(), 3);
        // wire identity is the truncated v2 hash
        let wire = metainfo.wire_info_hash();
        assert_eq!(&wire[..], &metainfo.info_hash_v2.unwrap()[..20]);
    }

    #[test]
    fn test_info_hash_is_reencoding_stable() {
        // parsing and re-encoding the same buffer must yield the same hash:
        // parse twice and compare
        let a = Metainfo::from_bytes(&v1_single_file()).unwrap();
        let b = Metainfo::from_bytes(&v1_single_file()).unwrap();
        assert_eq!(a.info_hash_v1, b.info_hash_v1);

        // and it must equal a direct digest of the canonical info dict
        let root = bencode::decode(&v1_single_file()).unwrap();
        let expected = Sha1::digest(root.lookup(b"info").unwrap().encode());
        assert_eq!(&a.info_hash_v1.unwrap()[..], expected.as_slice());
    }

    #[test]
    fn test_from_bare_info_dict() {
        // extract the info dict of the single-file torrent and parse it
        // the way a metadata fetch promotion would
        let root = bencode::decode(&v1_single_file()).unwrap();
        let info_bytes = root.lookup(b"info").unwrap().encode();
        let trackers =
            vec![Url::parse("http://tracker.example/announce").unwrap()];
        let metainfo =
            Metainfo::from_info_dict_bytes(&info_bytes, trackers).unwrap();

        // the info hash matches the full parse
        let full = Metainfo::from_bytes(&v1_single_file()).unwrap();
        assert_eq!(metainfo.info_hash_v1, full.info_hash_v1);
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.trackers.len(), 1);
    }

    #[test]
    fn test_reject_bad_piece_len() {
        // piece length not a power of two
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bval(b"x"));
        info.insert(b"piece length".to_vec(), Value::Int(20000));
        info.insert(b"length".to_vec(), Value::Int(100));
        info.insert(b"pieces".to_vec(), bval(&[0u8; 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        assert!(Metainfo::from_bytes(&Value::Dict(root).encode()).is_err());
    }

    #[test]
    fn test_reject_pieces_not_multiple_of_20() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bval(b"x"));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"length".to_vec(), Value::Int(100));
        info.insert(b"pieces".to_vec(), bval(&[0u8; 21]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        assert!(Metainfo::from_bytes(&Value::Dict(root).encode()).is_err());
    }

    #[test]
    fn test_reject_escaping_paths() {
        let mut file = BTreeMap::new();
        file.insert(
            b"path".to_vec(),
            Value::List(vec![bval(b".."), bval(b"evil.bin")]),
        );
        file.insert(b"length".to_vec(), Value::Int(16384));
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bval(b"archive"));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(file)]));
        info.insert(b"pieces".to_vec(), bval(&[0u8; 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        assert!(Metainfo::from_bytes(&Value::Dict(root).encode()).is_err());
    }

    #[test]
    fn test_reject_symlink_without_target() {
        let mut file = BTreeMap::new();
        file.insert(b"path".to_vec(), Value::List(vec![bval(b"link")]));
        file.insert(b"length".to_vec(), Value::Int(0));
        file.insert(b"attr".to_vec(), bval(b"l"));
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bval(b"archive"));
        info.insert(b"piece length".to_vec(), Value::Int(16384));
        info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(file)]));
        info.insert(b"pieces".to_vec(), bval(b""));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        let err = Metainfo::from_bytes(&Value::Dict(root).encode())
            .unwrap_err();
        assert!(matches!(
            err,
            MetainfoError::MissingSymlinkTarget { .. }
        ));
    }

    #[test]
    fn test_reject_v2_bad_layer_count() {
        // tamper with the layer to only hold 2 hashes instead of 3
        let mut buf = v2_torrent();
        let v2 = bencode::decode(&buf).unwrap();
        let mut root = v2.as_dict().unwrap().clone();
        let mut layers = BTreeMap::new();
        layers.insert([3u8; 32].to_vec(), bval(&[9u8; 2 * 32]));
        root.insert(b"piece layers".to_vec(), Value::Dict(layers));
        buf = Value::Dict(root).encode();
        assert!(matches!(
            Metainfo::from_bytes(&buf).unwrap_err(),
            MetainfoError::InvalidPieceLayer { .. }
        ));
    }
}
