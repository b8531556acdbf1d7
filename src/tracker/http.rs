//! The HTTP(S) tracker client.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, Url};

use crate::bencode::{self, Value};
use crate::error::tracker::TrackerError;
use crate::Sha1Hash;

use super::announce::Announce;
use super::response::{Response, ScrapeEntry};
use super::{Result, URL_ENCODE_RESERVED};

/// The HTTP tracker for a torrent, from which we can request peers and to
/// which we announce transfer progress.
pub struct HttpTracker {
    /// The shared HTTP client.
    client: Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        HttpTracker {
            client: Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends an announce request to the tracker with the specified
    /// parameters, reporting our status and requesting peers.
    pub async fn announce(
        &self,
        params: Announce,
        timeout: Duration,
    ) -> Result<Response> {
        let mut query = vec![
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            ("compact", "1".to_string()),
        ];

        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }
        if let Some(ip) = &params.ip {
            query.push(("ip", ip.to_string()));
        }
        if let Some(event) = params.event {
            query.push(("event", event.as_str().to_string()));
        }
        if let Some(tracker_id) = &params.tracker_id {
            query.push(("trackerid", tracker_id.clone()));
        }

        // the info hash and peer id are raw bytes, only percent-encoded,
        // so they cannot go through the regular query builder
        let url = format!(
            "{url}\
            ?info_hash={info_hash}\
            &peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encoding::percent_encode(
                &params.info_hash,
                URL_ENCODE_RESERVED
            ),
            peer_id = percent_encoding::percent_encode(
                &params.peer_id,
                URL_ENCODE_RESERVED
            )
        );

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::Timeout
                } else {
                    TrackerError::Http(e)
                }
            })?
            .error_for_status()?
            .bytes()
            .await?;

        let resp: Response = serde_bencode::from_bytes(&resp)?;
        if let Some(reason) = &resp.failure_reason {
            return Err(TrackerError::Failure(reason.clone()));
        }
        if let Some(warning) = &resp.warning_message {
            log::warn!("Tracker {} warning: {}", self.url, warning);
        }
        Ok(resp)
    }

    /// Scrapes the tracker for the torrent's swarm counts. Only possible
    /// when the announce URL ends in `/announce`, whose last occurrence is
    /// substituted with `/scrape` by convention.
    pub async fn scrape(
        &self,
        info_hash: &Sha1Hash,
        timeout: Duration,
    ) -> Result<ScrapeEntry> {
        let scrape_url = self
            .scrape_url()
            .ok_or(TrackerError::UnsupportedScheme)?;
        let url = format!(
            "{scrape_url}?info_hash={info_hash}",
            info_hash = percent_encoding::percent_encode(
                info_hash,
                URL_ENCODE_RESERVED
            )
        );
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::Timeout
                } else {
                    TrackerError::Http(e)
                }
            })?
            .error_for_status()?
            .bytes()
            .await?;

        parse_scrape(&resp, info_hash)
    }

    /// Derives the scrape URL from the announce URL, or `None` when the
    /// tracker doesn't follow the convention.
    fn scrape_url(&self) -> Option<String> {
        let url = self.url.to_string();
        let pos = url.rfind("/announce")?;
        let mut scrape = url;
        scrape.replace_range(pos..pos + "/announce".len(), "/scrape");
        Some(scrape)
    }
}

/// Pulls one torrent's counts out of a bencoded scrape response.
fn parse_scrape(
    bytes: &[u8],
    info_hash: &Sha1Hash,
) -> Result<ScrapeEntry> {
    let root = bencode::decode(bytes)
        .map_err(|_| TrackerError::UdpProtocol("malformed scrape body"))?;
    let files: &BTreeMap<Vec<u8>, Value> = root
        .lookup(b"files")
        .and_then(Value::as_dict)
        .ok_or(TrackerError::UdpProtocol("scrape body without files"))?;
    let entry = files
        .get(info_hash.as_slice())
        .ok_or_else(|| {
            TrackerError::Failure("torrent not known to tracker".into())
        })?;
    let count = |key: &[u8]| {
        entry
            .lookup(key)
            .and_then(Value::as_int)
            .filter(|n| *n >= 0)
            .unwrap_or(0) as usize
    };
    Ok(ScrapeEntry {
        seeders: count(b"complete"),
        completed: count(b"downloaded"),
        leechers: count(b"incomplete"),
    })
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;
    use crate::tracker::announce::Event;

    fn announce_params(info_hash: Sha1Hash) -> Announce {
        Announce {
            info_hash,
            peer_id: *b"-RT0010-abcdefgh1234",
            port: 6881,
            ip: None,
            downloaded: 100,
            uploaded: 20,
            left: 900,
            peer_count: Some(50),
            tracker_id: None,
            event: Some(Event::Started),
        }
    }

    #[tokio::test]
    async fn test_announce_compact_response() {
        let mut server = mockito::Server::new_async().await;

        let ip = Ipv4Addr::new(192, 168, 0, 1);
        let port = 8989u16;
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&ip.octets());
        body.extend_from_slice(&port.to_be_bytes());
        body.push(b'e');

        let mock = server
            .mock("GET", "/announce")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("compact".into(), "1".into()),
                mockito::Matcher::UrlEncoded(
                    "event".into(),
                    "started".into(),
                ),
                mockito::Matcher::UrlEncoded("port".into(), "6881".into()),
            ]))
            .with_body(body)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/announce", server.url())).unwrap();
        let tracker = HttpTracker::new(url);
        let resp = tracker
            .announce(announce_params([0xaa; 20]), Duration::from_secs(5))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        let expected: SocketAddr = (ip, port).into();
        assert_eq!(resp.peers, vec![expected]);
    }

    #[tokio::test]
    async fn test_announce_failure_reason() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_body(b"d14:failure reason11:unregisterede")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/announce", server.url())).unwrap();
        let tracker = HttpTracker::new(url);
        let err = tracker
            .announce(announce_params([0xaa; 20]), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Failure(reason) if reason == "unregistered"));
    }

    #[tokio::test]
    async fn test_scrape_counts() {
        let mut server = mockito::Server::new_async().await;
        let info_hash = [0x11u8; 20];

        let mut body = Vec::new();
        body.extend_from_slice(b"d5:filesd20:");
        body.extend_from_slice(&info_hash);
        body.extend_from_slice(
            b"d8:completei5e10:downloadedi50e10:incompletei9eeee",
        );

        let _mock = server
            .mock("GET", "/scrape")
            .match_query(mockito::Matcher::Any)
            .with_body(body)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/announce", server.url())).unwrap();
        let tracker = HttpTracker::new(url);
        let entry = tracker
            .scrape(&info_hash, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            entry,
            ScrapeEntry {
                seeders: 5,
                completed: 50,
                leechers: 9,
            }
        );
    }

    #[test]
    fn test_scrape_url_derivation() {
        let tracker = HttpTracker::new(
            Url::parse("http://t.example/announce").unwrap(),
        );
        assert_eq!(
            tracker.scrape_url().unwrap(),
            "http://t.example/scrape"
        );

        let tracker = HttpTracker::new(
            Url::parse("http://t.example/x/announce?key=1").unwrap(),
        );
        assert_eq!(
            tracker.scrape_url().unwrap(),
            "http://t.example/x/scrape?key=1"
        );

        let tracker =
            HttpTracker::new(Url::parse("http://t.example/ann").unwrap());
        assert!(tracker.scrape_url().is_none());
    }
}
