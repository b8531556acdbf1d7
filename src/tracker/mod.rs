//! Tracker clients: the HTTP(S) and UDP transports behind one announce
//! contract, plus the per-tracker backoff and adaptive-interval state the
//! torrent's announce loop keeps.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use serde::de;
use serde_derive::Deserialize;
use url::Url;

use crate::error::tracker::TrackerError;
pub use crate::error::tracker::{Result, Result as TrackerResult};
use crate::Sha1Hash;

pub mod announce;
pub mod http;
pub mod response;
pub mod udp;

pub use announce::{Announce, Event};
pub use http::HttpTracker;
pub use response::{Response, ScrapeEntry};
pub use udp::UdpTracker;

/// A tracker endpoint over whichever transport its URL names.
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    /// Builds a client for the URL, or `None` for unsupported schemes.
    pub fn from_url(url: Url) -> Option<Self> {
        match url.scheme() {
            "http" | "https" => Some(Self::Http(HttpTracker::new(url))),
            "udp" => Some(Self::Udp(UdpTracker::new(url))),
            _ => None,
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Http(t) => t.url(),
            Self::Udp(t) => t.url(),
        }
    }

    pub async fn announce(
        &mut self,
        params: Announce,
        timeout: Duration,
    ) -> Result<Response> {
        match self {
            Self::Http(t) => t.announce(params, timeout).await,
            Self::Udp(t) => t.announce(params, timeout).await,
        }
    }

    pub async fn scrape(
        &mut self,
        info_hash: &Sha1Hash,
        timeout: Duration,
    ) -> Result<ScrapeEntry> {
        match self {
            Self::Http(t) => t.scrape(info_hash, timeout).await,
            Self::Udp(t) => t.scrape(info_hash, timeout).await,
        }
    }
}

/// Per-tracker health: exponential backoff on failure, adaptive announce
/// cadence on success.
#[derive(Debug)]
pub(crate) struct TrackerState {
    /// Consecutive failures.
    pub failure_count: usize,
    pub last_failure: Option<Instant>,
    /// The delay currently imposed by backoff, `None` when healthy.
    pub backoff_delay: Option<Duration>,
    /// The interval the tracker asked us to keep, if any.
    pub interval: Option<Duration>,
    /// A hard floor on the announce cadence, per the tracker.
    pub min_interval: Option<Duration>,
    pub last_announce: Option<Instant>,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            backoff_delay: None,
            interval: None,
            min_interval: None,
            last_announce: None,
        }
    }
}

impl TrackerState {
    /// Records a successful exchange, clearing the backoff.
    pub fn record_success(&mut self, response: &Response) {
        self.failure_count = 0;
        self.last_failure = None;
        self.backoff_delay = None;
        self.interval = response.interval;
        self.min_interval = response.min_interval;
        self.last_announce = Some(Instant::now());
    }

    /// Records a failure and computes the next backoff delay:
    /// `min(cap, base * 2^failures)` plus up to 10% jitter.
    pub fn record_failure(&mut self, base: Duration, cap: Duration) {
        self.last_failure = Some(Instant::now());
        let exp = self.failure_count.min(16) as u32;
        let delay = base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(cap);
        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
        self.backoff_delay = Some(delay + jitter);
        self.failure_count += 1;
    }

    /// The delay before the next announce to this tracker.
    ///
    /// The adaptive interval shrinks toward `bounds.0` while the torrent
    /// is short on peers and stretches toward `bounds.1` as the swarm
    /// saturates; a tracker-given `min interval` is a hard floor and an
    /// active backoff dominates everything.
    pub fn next_announce_in(
        &self,
        bounds: (Duration, Duration),
        peer_count: usize,
        wanted_peers: usize,
    ) -> Duration {
        if let Some(backoff) = self.backoff_delay {
            return backoff;
        }
        let (min, max) = bounds;
        let fill = if wanted_peers == 0 {
            1.0
        } else {
            (peer_count as f64 / wanted_peers as f64).clamp(0.0, 1.0)
        };
        let mut delay = min + (max - min).mul_f64(fill);
        if let Some(interval) = self.interval {
            delay = delay.min(interval.max(min));
        }
        if let Some(floor) = self.min_interval {
            delay = delay.max(floor);
        }
        delay
    }

    /// True when this tracker has failed so often the torrent should stop
    /// scheduling it.
    pub fn is_defunct(&self, error_threshold: usize) -> bool {
        self.failure_count >= error_threshold
    }
}

/// Deserialize an integer representing seconds into a `Duration`.
pub fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s: Option<u64> = de::Deserialize::deserialize(deserializer)?;
    Ok(s.map(Duration::from_secs))
}

/// Peers can be sent in two ways:
/// - as a bencoded list of dicts including full peer metadata, or
/// - as a single bencoded string of the compact 6-byte representation.
///
/// This helper deserializes both into the same type, discarding the peer
/// id of the full representation, which we don't use at this stage.
pub fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(
            &self,
            formatter: &mut std::fmt::Formatter,
        ) -> std::fmt::Result {
            formatter
                .write_str("a string or a list of dicts representing peers")
        }

        /// Deserializes a compact string of peers: 4 bytes IPv4 address
        /// and 2 bytes port, both network byte order, per entry.
        fn visit_bytes<E>(
            self,
            mut b: &[u8],
        ) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;
            let buf_len = b.len();
            if buf_len % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers compact string must be a multiple of 6",
                ));
            }
            let mut peers = Vec::with_capacity(buf_len / ENTRY_LEN);
            for _ in (0..buf_len).step_by(ENTRY_LEN) {
                let addr = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(addr), port));
            }
            Ok(peers)
        }

        /// Deserializes a list of dicts containing the peer information.
        fn visit_seq<A>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }
            let mut peers =
                Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                let Ok(ip) = ip.parse() else {
                    continue;
                };
                peers.push(SocketAddr::new(ip, port));
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');
