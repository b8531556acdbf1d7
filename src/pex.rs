//! Torrent-side PEX bookkeeping (BEP 11): composing the periodic
//! added/dropped deltas against the last advertised connected set.
//!
//! The wire payloads live in [`crate::peer::extension::PexMsg`]; sessions
//! send them on the torrent's command. PEX is entirely disabled for
//! private torrents, both directions.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::peer::extension::PexMsg;

/// Tracks what the swarm has been told and when.
pub(crate) struct PexState {
    /// Minimum gap between two messages; BEP 11 demands at least a
    /// minute.
    interval: Duration,
    /// The connected set as of the last flush.
    advertised: HashSet<SocketAddr>,
    last_flush: Option<Instant>,
}

impl PexState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_secs(60)),
            advertised: HashSet::new(),
            last_flush: None,
        }
    }

    /// Composes the next delta against the currently connected set, or
    /// `None` when the interval hasn't elapsed or nothing changed.
    pub fn compose(
        &mut self,
        connected: &HashSet<SocketAddr>,
        now: Instant,
    ) -> Option<PexMsg> {
        if let Some(last) = self.last_flush {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        let added: Vec<SocketAddr> = connected
            .difference(&self.advertised)
            .copied()
            .collect();
        let dropped: Vec<SocketAddr> = self
            .advertised
            .difference(connected)
            .copied()
            .collect();
        if added.is_empty() && dropped.is_empty() {
            // keep the cadence anchored so a later change flushes promptly
            self.last_flush = Some(now);
            return None;
        }
        self.advertised = connected.clone();
        self.last_flush = Some(now);
        Some(PexMsg { added, dropped })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([10, 0, 0, 1], port).into()
    }

    #[test]
    fn test_first_flush_advertises_everyone() {
        let mut pex = PexState::new(Duration::from_secs(60));
        let connected: HashSet<_> = [addr(1), addr(2)].into();
        let msg = pex.compose(&connected, Instant::now()).unwrap();
        let mut added = msg.added.clone();
        added.sort();
        assert_eq!(added, vec![addr(1), addr(2)]);
        assert!(msg.dropped.is_empty());
    }

    #[test]
    fn test_interval_is_enforced() {
        let mut pex = PexState::new(Duration::from_secs(60));
        let start = Instant::now();
        let connected: HashSet<_> = [addr(1)].into();
        assert!(pex.compose(&connected, start).is_some());

        // a change within the interval is held back
        let connected: HashSet<_> = [addr(1), addr(2)].into();
        assert!(pex
            .compose(&connected, start + Duration::from_secs(30))
            .is_none());

        // and flushed once the interval passes
        let msg = pex
            .compose(&connected, start + Duration::from_secs(61))
            .unwrap();
        assert_eq!(msg.added, vec![addr(2)]);
    }

    #[test]
    fn test_dropped_peers_are_reported() {
        let mut pex = PexState::new(Duration::from_secs(60));
        let start = Instant::now();
        let connected: HashSet<_> = [addr(1), addr(2)].into();
        pex.compose(&connected, start);

        let connected: HashSet<_> = [addr(2)].into();
        let msg = pex
            .compose(&connected, start + Duration::from_secs(61))
            .unwrap();
        assert!(msg.added.is_empty());
        assert_eq!(msg.dropped, vec![addr(1)]);
    }

    #[test]
    fn test_no_change_no_message() {
        let mut pex = PexState::new(Duration::from_secs(60));
        let start = Instant::now();
        let connected: HashSet<_> = [addr(1)].into();
        assert!(pex.compose(&connected, start).is_some());
        assert!(pex
            .compose(&connected, start + Duration::from_secs(61))
            .is_none());
    }

    #[test]
    fn test_sub_minute_interval_is_clamped() {
        let pex = PexState::new(Duration::from_secs(1));
        assert_eq!(pex.interval, Duration::from_secs(60));
    }
}
