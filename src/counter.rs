//! Transfer accounting shared by peer sessions and torrents.
//!
//! Counters are advanced as bytes move and "rounds" are closed once
//! a second by their owner's tick, which folds the round total into
//! a running per-second average.

use crate::avg::SlidingAvg;

/// Counts bytes over rounds and keeps a running average of the per-round
/// (i.e. per-second) throughput.
#[derive(Debug, Default)]
pub struct Counter {
    /// Total bytes since the counter was created.
    total: u64,
    /// Bytes accumulated in the current round.
    round: u64,
    /// The highest per-round total seen.
    peak: u64,
    /// Running average of the per-round totals.
    avg: SlidingAvg,
}

impl Counter {
    /// Records transferred bytes in the current round.
    pub fn add(&mut self, bytes: u64) {
        self.round += bytes;
        self.total += bytes;
    }

    /// Closes the current round: folds it into the average, adjusts the
    /// peak and resets the round total.
    pub fn tick(&mut self) {
        self.peak = self.peak.max(self.round);
        self.avg.update(self.round.min(i64::MAX as u64) as i64);
        self.round = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// The running per-second average, in bytes.
    pub fn avg(&self) -> u64 {
        self.avg.mean().max(0) as u64
    }
}

/// A pair of counters separating protocol chatter from payload bytes.
#[derive(Debug, Default)]
pub struct ChannelCounter {
    /// Bytes that carried block payloads.
    pub payload: Counter,
    /// Everything else: handshakes, keep-alives, message headers.
    pub protocol: Counter,
}

impl ChannelCounter {
    pub fn tick(&mut self) {
        self.payload.tick();
        self.protocol.tick();
    }

    pub fn total(&self) -> u64 {
        self.payload.total() + self.protocol.total()
    }
}

/// The throughput counters of one direction-pair: everything a peer
/// session or a torrent needs to report about its transfer rates.
#[derive(Debug, Default)]
pub struct ThruputCounters {
    pub down: ChannelCounter,
    pub up: ChannelCounter,
    /// Payload bytes received that failed validation and were dropped
    /// (e.g. blocks of a piece that failed its hash check).
    pub waste: Counter,
}

impl ThruputCounters {
    /// Closes the current round on all counters.
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
        self.waste.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_accounting() {
        let mut c = Counter::default();
        c.add(1000);
        c.add(500);
        assert_eq!(c.round(), 1500);
        assert_eq!(c.total(), 1500);

        c.tick();
        assert_eq!(c.round(), 0);
        assert_eq!(c.total(), 1500);
        assert_eq!(c.peak(), 1500);
        assert_eq!(c.avg(), 1500);

        // a quieter round lowers the average but not the peak
        c.add(100);
        c.tick();
        assert!(c.avg() < 1500);
        assert_eq!(c.peak(), 1500);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut c = ThruputCounters::default();
        c.down.payload.add(0x4000);
        c.down.protocol.add(13);
        c.up.protocol.add(5);
        assert_eq!(c.down.total(), 0x4000 + 13);
        assert_eq!(c.up.total(), 5);
        assert_eq!(c.waste.total(), 0);
    }
}
