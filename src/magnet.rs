//! `magnet:` URI parsing (BEP 9, with the BEP 53 selection extension).
//!
//! A magnet link identifies a torrent by info-hash alone; the info
//! dictionary itself is later fetched from peers over ut_metadata.

use std::net::SocketAddr;

use url::Url;

use crate::error::magnet::{MagnetError, Result};
use crate::{Sha1Hash, Sha256Hash};

/// The parsed fields of a magnet URI.
#[derive(Clone, Debug, Default)]
pub struct MagnetUri {
    /// v1 info-hash from `xt=urn:btih:`, either 40 hex or 32 base32 chars.
    pub info_hash_v1: Option<Sha1Hash>,
    /// v2 info-hash from `xt=urn:btmh:1220...` (sha2-256 multihash).
    pub info_hash_v2: Option<Sha256Hash>,
    /// `dn`: suggested display name.
    pub name: Option<String>,
    /// `tr`: tracker URLs, repeatable, in appearance order.
    pub trackers: Vec<Url>,
    /// `xl`: exact length hint in bytes.
    pub total_len: Option<u64>,
    /// `so`: zero-based file indices to select (BEP 53), expanded from
    /// the `0,2,4-7` list syntax, ascending and deduplicated.
    pub select_only: Vec<usize>,
    /// `x.pe`: direct peer endpoints.
    pub peers: Vec<SocketAddr>,
    /// `ws`: web seed URLs.
    pub web_seeds: Vec<Url>,
}

impl MagnetUri {
    /// Parses a magnet URI string.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input.trim())
            .map_err(|_| MagnetError::NotMagnet)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::NotMagnet);
        }

        let mut magnet = MagnetUri::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => magnet.parse_topic(&value)?,
                "dn" => magnet.name = Some(value.into_owned()),
                "tr" => {
                    if let Ok(tracker) = Url::parse(&value) {
                        magnet.trackers.push(tracker);
                    }
                }
                "xl" => {
                    magnet.total_len = Some(value.parse().map_err(|_| {
                        MagnetError::InvalidParam { param: "xl" }
                    })?);
                }
                "so" => magnet.parse_select_only(&value)?,
                "x.pe" => {
                    if let Ok(addr) = value.parse() {
                        magnet.peers.push(addr);
                    }
                }
                "ws" => {
                    if let Ok(seed) = Url::parse(&value) {
                        magnet.web_seeds.push(seed);
                    }
                }
                // unknown parameters are ignored, per the URI scheme
                _ => {}
            }
        }

        if magnet.info_hash_v1.is_none() && magnet.info_hash_v2.is_none() {
            return Err(MagnetError::MissingTopic);
        }
        Ok(magnet)
    }

    fn parse_topic(&mut self, topic: &str) -> Result<()> {
        if let Some(digest) = topic.strip_prefix("urn:btih:") {
            let hash: Sha1Hash = match digest.len() {
                40 => {
                    let bytes = hex::decode(digest).map_err(|_| {
                        MagnetError::InvalidTopic("bad hex".into())
                    })?;
                    bytes.try_into().expect("40 hex chars are 20 bytes")
                }
                32 => {
                    let bytes = base32::decode(
                        base32::Alphabet::Rfc4648 { padding: false },
                        &digest.to_ascii_uppercase(),
                    )
                    .filter(|b| b.len() == 20)
                    .ok_or_else(|| {
                        MagnetError::InvalidTopic("bad base32".into())
                    })?;
                    bytes.try_into().expect("length checked above")
                }
                n => {
                    return Err(MagnetError::InvalidTopic(format!(
                        "btih digest has {n} chars, expected 40 or 32"
                    )))
                }
            };
            self.info_hash_v1 = Some(hash);
        } else if let Some(multihash) = topic.strip_prefix("urn:btmh:") {
            // 0x12 = sha2-256, 0x20 = 32 byte digest
            let digest =
                multihash.strip_prefix("1220").ok_or_else(|| {
                    MagnetError::InvalidTopic(
                        "btmh is not a sha2-256 multihash".into(),
                    )
                })?;
            let bytes = hex::decode(digest)
                .ok()
                .filter(|b| b.len() == 32)
                .ok_or_else(|| {
                    MagnetError::InvalidTopic("bad btmh digest".into())
                })?;
            self.info_hash_v2 =
                Some(bytes.try_into().expect("length checked above"));
        }
        // other urn namespaces are ignored
        Ok(())
    }

    /// Expands the BEP 53 `so` syntax: `0,2,4-7`.
    fn parse_select_only(&mut self, value: &str) -> Result<()> {
        let invalid = || MagnetError::InvalidParam { param: "so" };
        for part in value.split(',').filter(|p| !p.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                let start: usize = start.parse().map_err(|_| invalid())?;
                let end: usize = end.parse().map_err(|_| invalid())?;
                if end < start {
                    return Err(invalid());
                }
                self.select_only.extend(start..=end);
            } else {
                self.select_only
                    .push(part.parse().map_err(|_| invalid())?);
            }
        }
        self.select_only.sort_unstable();
        self.select_only.dedup();
        Ok(())
    }

    /// The 20-byte hash identifying this torrent on the wire: v1 when
    /// present, else the truncated v2 hash.
    pub fn wire_info_hash(&self) -> Sha1Hash {
        if let Some(hash) = self.info_hash_v1 {
            return hash;
        }
        let v2 = self
            .info_hash_v2
            .expect("validated to carry at least one topic");
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&v2[..20]);
        hash
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const HEX_HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn test_parse_v1_hex() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HEX_HASH}&dn=debian.iso\
             &tr=http://tracker.example/announce\
             &tr=udp://tracker2.example:6969/announce"
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(
            magnet.info_hash_v1.map(hex::encode),
            Some(HEX_HASH.to_owned())
        );
        assert_eq!(magnet.name.as_deref(), Some("debian.iso"));
        assert_eq!(magnet.trackers.len(), 2);
        assert_eq!(magnet.wire_info_hash(), magnet.info_hash_v1.unwrap());
    }

    #[test]
    fn test_parse_v1_base32() {
        // the base32 form of the same 20 bytes
        let hash = hex::decode(HEX_HASH).unwrap();
        let b32 = base32::encode(
            base32::Alphabet::Rfc4648 { padding: false },
            &hash,
        );
        assert_eq!(b32.len(), 32);
        let magnet =
            MagnetUri::parse(&format!("magnet:?xt=urn:btih:{b32}")).unwrap();
        assert_eq!(magnet.info_hash_v1.map(hex::encode), Some(HEX_HASH.into()));
    }

    #[test]
    fn test_parse_v2() {
        let digest = "a".repeat(64);
        let magnet = MagnetUri::parse(&format!(
            "magnet:?xt=urn:btmh:1220{digest}"
        ))
        .unwrap();
        assert!(magnet.info_hash_v1.is_none());
        let v2 = magnet.info_hash_v2.unwrap();
        assert_eq!(hex::encode(v2), digest);
        assert_eq!(&magnet.wire_info_hash()[..], &v2[..20]);
    }

    #[test]
    fn test_parse_hints() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HEX_HASH}&xl=123456\
             &so=0,2,4-6&x.pe=10.0.0.1:6881&ws=http://seed.example/f"
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.total_len, Some(123456));
        assert_eq!(magnet.select_only, vec![0, 2, 4, 5, 6]);
        assert_eq!(magnet.peers.len(), 1);
        assert_eq!(magnet.web_seeds.len(), 1);
    }

    #[test]
    fn test_reject_bad_input() {
        assert!(matches!(
            MagnetUri::parse("http://example.com").unwrap_err(),
            MagnetError::NotMagnet
        ));
        assert!(matches!(
            MagnetUri::parse("magnet:?dn=no-topic").unwrap_err(),
            MagnetError::MissingTopic
        ));
        assert!(matches!(
            MagnetUri::parse("magnet:?xt=urn:btih:deadbeef").unwrap_err(),
            MagnetError::InvalidTopic(_)
        ));
        assert!(matches!(
            MagnetUri::parse(&format!(
                "magnet:?xt=urn:btih:{HEX_HASH}&so=5-2"
            ))
            .unwrap_err(),
            MagnetError::InvalidParam { param: "so" }
        ));
    }
}
