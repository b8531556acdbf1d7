use std::net::IpAddr;

use crate::{PeerId, Sha1Hash};

/// Parameters for announcing to a tracker.
/// [`More details about the key meanings`](http://bittorrent.org/beps/bep_0003.html)
#[derive(Clone, Debug)]
pub struct Announce {
    /// The torrent's wire info hash.
    pub info_hash: Sha1Hash,
    /// Self identifier.
    pub peer_id: PeerId,

    /// The port on which we accept peer connections.
    pub port: u16,
    /// The true IP address in dotted quad format. Only necessary when the
    /// request originates from an address other than the client's own
    /// (a proxy, or a tracker on the same NAT'd subnet).
    pub ip: Option<IpAddr>,

    /// Number of payload bytes downloaded so far.
    pub downloaded: u64,
    /// Number of payload bytes uploaded so far.
    pub uploaded: u64,
    /// Number of bytes left to download.
    pub left: u64,

    /// The number of peers the client wishes to receive from the tracker.
    /// If omitted and the tracker is UDP, -1 is sent to let the tracker
    /// decide; HTTP trackers typically default to 30-50.
    pub peer_count: Option<usize>,

    /// If previously received from the tracker, we must send it with each
    /// announce.
    pub tracker_id: Option<String>,

    /// Only set during the special events defined in [`Event`]; omitted
    /// for the regular interval announces.
    pub event: Option<Event>,
}

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The first request to a tracker must include this value.
    Started,
    /// Sent when the client becomes a seeder. Must not be sent if the
    /// client started as one.
    Completed,
    /// Sent when the client is shutting down gracefully.
    Stopped,
}

impl Event {
    /// The query-string form used by HTTP trackers.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    /// The numeric form used by UDP trackers (BEP 15).
    pub(crate) fn to_udp(event: Option<Event>) -> u32 {
        match event {
            None => 0,
            Some(Self::Completed) => 1,
            Some(Self::Started) => 2,
            Some(Self::Stopped) => 3,
        }
    }
}
