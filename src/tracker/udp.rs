//! The UDP tracker client (BEP 15).
//!
//! Transactions follow the `connect → announce / scrape` scheme: every
//! request carries a fresh random transaction id that the response must
//! echo, and the connection id handed out by `connect` expires 60 seconds
//! after issuance.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time;
use url::Url;

use crate::error::tracker::TrackerError;
use crate::Sha1Hash;

use super::announce::{Announce, Event};
use super::response::{Response, ScrapeEntry};
use super::Result;

const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// How long a connection id stays valid after the connect exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

pub struct UdpTracker {
    url: Url,
    /// The connection id from the last connect exchange and when it was
    /// issued.
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub fn new(url: Url) -> Self {
        debug_assert_eq!(url.scheme(), "udp");
        Self {
            url,
            connection: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn remote_addr(&self) -> Result<(String, u16)> {
        let host = self
            .url
            .host_str()
            .ok_or(TrackerError::UnsupportedScheme)?
            .to_owned();
        let port = self.url.port().ok_or(TrackerError::UnsupportedScheme)?;
        Ok((host, port))
    }

    async fn socket(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let (host, port) = self.remote_addr()?;
        socket.connect((host.as_str(), port)).await?;
        Ok(socket)
    }

    /// One request/response exchange with a fresh transaction id. The
    /// caller builds the packet via `build` (given the transaction id) and
    /// gets back the response payload past the 8-byte action+transaction
    /// header, after both have been validated.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        expected_action: u32,
        timeout: Duration,
        build: impl FnOnce(u32, &mut BytesMut),
    ) -> Result<BytesMut> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = BytesMut::with_capacity(98);
        build(transaction_id, &mut packet);
        socket.send(&packet).await?;

        let mut buf = vec![0u8; 2048];
        let n = time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::Timeout)??;
        let mut resp = BytesMut::from(&buf[..n]);
        if resp.len() < 8 {
            return Err(TrackerError::UdpProtocol("response too short"));
        }
        let action = resp.get_u32();
        let echoed = resp.get_u32();
        if echoed != transaction_id {
            return Err(TrackerError::UdpProtocol(
                "transaction id mismatch",
            ));
        }
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&resp).into_owned();
            return Err(TrackerError::Failure(message));
        }
        if action != expected_action {
            return Err(TrackerError::UdpProtocol("action mismatch"));
        }
        Ok(resp)
    }

    /// Returns a live connection id, running the connect exchange when the
    /// cached one is missing or expired.
    async fn connection_id(
        &mut self,
        socket: &UdpSocket,
        timeout: Duration,
    ) -> Result<u64> {
        if let Some((id, issued_at)) = self.connection {
            if issued_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }
        let mut resp = self
            .exchange(socket, ACTION_CONNECT, timeout, |tid, packet| {
                packet.put_u64(PROTOCOL_MAGIC);
                packet.put_u32(ACTION_CONNECT);
                packet.put_u32(tid);
            })
            .await?;
        if resp.len() < 8 {
            return Err(TrackerError::UdpProtocol(
                "connect response too short",
            ));
        }
        let id = resp.get_u64();
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    pub async fn announce(
        &mut self,
        params: Announce,
        timeout: Duration,
    ) -> Result<Response> {
        let socket = self.socket().await?;
        let connection_id = self.connection_id(&socket, timeout).await?;

        let mut resp = self
            .exchange(&socket, ACTION_ANNOUNCE, timeout, |tid, packet| {
                packet.put_u64(connection_id);
                packet.put_u32(ACTION_ANNOUNCE);
                packet.put_u32(tid);
                packet.put_slice(&params.info_hash);
                packet.put_slice(&params.peer_id);
                packet.put_u64(params.downloaded);
                packet.put_u64(params.left);
                packet.put_u64(params.uploaded);
                packet.put_u32(Event::to_udp(params.event));
                // let the tracker infer our IP
                packet.put_u32(0);
                // a random key identifies us across address changes
                packet.put_u32(rand::thread_rng().gen());
                packet.put_i32(
                    params
                        .peer_count
                        .map(|n| n as i32)
                        .unwrap_or(-1),
                );
                packet.put_u16(params.port);
            })
            .await?;

        if resp.len() < 12 {
            return Err(TrackerError::UdpProtocol(
                "announce response too short",
            ));
        }
        let interval = resp.get_u32();
        let leechers = resp.get_u32();
        let seeders = resp.get_u32();
        if resp.len() % 6 != 0 {
            return Err(TrackerError::UdpProtocol(
                "peer list not a multiple of 6",
            ));
        }
        let mut peers = Vec::with_capacity(resp.len() / 6);
        while resp.has_remaining() {
            let ip = Ipv4Addr::from(resp.get_u32());
            let port = resp.get_u16();
            peers.push(SocketAddr::new(IpAddr::V4(ip), port));
        }

        Ok(Response {
            tracker_id: None,
            failure_reason: None,
            warning_message: None,
            interval: Some(Duration::from_secs(interval as u64)),
            min_interval: None,
            seeder_count: Some(seeders as usize),
            leecher_count: Some(leechers as usize),
            peers,
        })
    }

    pub async fn scrape(
        &mut self,
        info_hash: &Sha1Hash,
        timeout: Duration,
    ) -> Result<ScrapeEntry> {
        let socket = self.socket().await?;
        let connection_id = self.connection_id(&socket, timeout).await?;

        let mut resp = self
            .exchange(&socket, ACTION_SCRAPE, timeout, |tid, packet| {
                packet.put_u64(connection_id);
                packet.put_u32(ACTION_SCRAPE);
                packet.put_u32(tid);
                packet.put_slice(info_hash);
            })
            .await?;

        if resp.len() < 12 {
            return Err(TrackerError::UdpProtocol(
                "scrape response too short",
            ));
        }
        Ok(ScrapeEntry {
            seeders: resp.get_u32() as usize,
            completed: resp.get_u32() as usize,
            leechers: resp.get_u32() as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal in-process UDP tracker good for one connect and one
    /// follow-up request.
    async fn fake_tracker(
        announce_body: Vec<u8>,
    ) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let socket =
            UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];

            // connect exchange
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let mut req = &buf[..n];
            assert_eq!(req.get_u64(), PROTOCOL_MAGIC);
            assert_eq!(req.get_u32(), ACTION_CONNECT);
            let tid = req.get_u32();
            let mut resp = BytesMut::new();
            resp.put_u32(ACTION_CONNECT);
            resp.put_u32(tid);
            resp.put_u64(0xdead_beef);
            socket.send_to(&resp, peer).await.unwrap();

            // announce exchange
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let mut req = &buf[..n];
            assert_eq!(req.get_u64(), 0xdead_beef);
            assert_eq!(req.get_u32(), ACTION_ANNOUNCE);
            let tid = req.get_u32();
            let mut resp = BytesMut::new();
            resp.put_u32(ACTION_ANNOUNCE);
            resp.put_u32(tid);
            resp.put_slice(&announce_body);
            socket.send_to(&resp, peer).await.unwrap();
        });
        (addr, handle)
    }

    fn params() -> Announce {
        Announce {
            info_hash: [0xaa; 20],
            peer_id: *b"-RT0010-abcdefgh1234",
            port: 6881,
            ip: None,
            downloaded: 0,
            uploaded: 0,
            left: 1000,
            peer_count: None,
            tracker_id: None,
            event: Some(Event::Started),
        }
    }

    #[tokio::test]
    async fn test_connect_then_announce() {
        // interval 1800, 3 leechers, 2 seeders, one peer 10.1.2.3:6881
        let mut body = BytesMut::new();
        body.put_u32(1800);
        body.put_u32(3);
        body.put_u32(2);
        body.put_slice(&[10, 1, 2, 3]);
        body.put_u16(6881);

        let (addr, server) = fake_tracker(body.to_vec()).await;
        let url =
            Url::parse(&format!("udp://{}:{}", addr.ip(), addr.port()))
                .unwrap();
        let mut tracker = UdpTracker::new(url);
        let resp = tracker
            .announce(params(), Duration::from_secs(5))
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.seeder_count, Some(2));
        assert_eq!(resp.leecher_count, Some(3));
        let expected: SocketAddr = "10.1.2.3:6881".parse().unwrap();
        assert_eq!(resp.peers, vec![expected]);
        // the connection id is cached for the next exchange
        assert!(tracker.connection.is_some());
    }

    #[tokio::test]
    async fn test_announce_timeout() {
        // a socket nobody answers on
        let silent =
            UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = silent.local_addr().unwrap();
        let url =
            Url::parse(&format!("udp://{}:{}", addr.ip(), addr.port()))
                .unwrap();
        let mut tracker = UdpTracker::new(url);
        let err = tracker
            .announce(params(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Timeout));
    }
}
