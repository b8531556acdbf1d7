use std::{net::SocketAddr, time::Duration};

use serde_derive::Deserialize;

use super::{deserialize_peers, deserialize_seconds};

/// The tracker's answer to an announce.
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq, serde_derive::Serialize))]
pub struct Response {
    /// The tracker id. If set, we must send it with each subsequent
    /// announce.
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    /// If this is not empty, no other field in the response is valid. It
    /// contains a human-readable error message as to why the request was
    /// invalid.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    /// Optional. Similar to `failure_reason`, but the response is still
    /// processed.
    pub warning_message: Option<String>,

    /// The number of seconds the client should wait before recontacting
    /// the tracker.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub interval: Option<Duration>,

    /// If present, the client must not reannounce itself before the end
    /// of this interval.
    #[serde(default)]
    #[serde(rename = "min interval")]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub min_interval: Option<Duration>,

    #[serde(rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    pub leecher_count: Option<usize>,

    /// The list of peers, from either the compact or the full
    /// representation.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

/// Per-torrent counts from a scrape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrapeEntry {
    /// Peers with the complete file.
    pub seeders: usize,
    /// Total completed downloads ever reported.
    pub completed: usize,
    /// Peers still downloading.
    pub leechers: usize,
}
