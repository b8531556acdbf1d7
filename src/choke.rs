//! The choking controller: decides each round which peers may download
//! from us.
//!
//! Every `unchoke_interval` the torrent feeds the controller a snapshot of
//! its interested peers. The controller keeps the top uploaders-to-us (or
//! downloaders-from-us once seeding) in the regular slots and rotates one
//! optimistic slot on its own, slower cadence, weighted toward freshly
//! connected peers so newcomers get a chance to prove themselves.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

/// What the controller knows about a peer when ranking it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChokeCandidate {
    pub addr: SocketAddr,
    /// Only interested peers compete for slots.
    pub peer_interested: bool,
    /// Recent average of bytes/s we receive from the peer.
    pub download_rate: u64,
    /// Recent average of bytes/s we send to the peer.
    pub upload_rate: u64,
    /// When the session connected; drives the optimistic weighting.
    pub connected_at: Instant,
}

/// The per-tick verdict: which sessions to send UNCHOKE and CHOKE.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ChokeDecision {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

/// A peer connected less than this long ago counts as fresh and gets the
/// boosted optimistic weight.
const FRESH_PEER_AGE: Duration = Duration::from_secs(60);
/// The weight multiplier for fresh peers in the optimistic draw.
const FRESH_PEER_WEIGHT: u32 = 3;

pub(crate) struct Choker {
    /// Total slots, the optimistic one included.
    max_upload_slots: usize,
    optimistic_interval: Duration,
    /// The currently unchoked set, as of the last tick.
    unchoked: HashSet<SocketAddr>,
    /// The current optimistic unchoke, if any.
    optimistic: Option<SocketAddr>,
    last_optimistic_rotation: Option<Instant>,
}

impl Choker {
    pub fn new(max_upload_slots: usize, optimistic_interval: Duration) -> Self {
        Self {
            max_upload_slots: max_upload_slots.max(1),
            optimistic_interval,
            unchoked: HashSet::new(),
            optimistic: None,
            last_optimistic_rotation: None,
        }
    }

    pub fn unchoked(&self) -> &HashSet<SocketAddr> {
        &self.unchoked
    }

    /// Runs one choke round and returns the messages to issue.
    ///
    /// `seeding` switches the ranking metric from "bytes they upload to
    /// us" to "bytes we upload to them".
    pub fn tick(
        &mut self,
        candidates: &[ChokeCandidate],
        seeding: bool,
        now: Instant,
    ) -> ChokeDecision {
        let mut interested: Vec<&ChokeCandidate> = candidates
            .iter()
            .filter(|c| c.peer_interested)
            .collect();

        // rank by recent transfer merit
        interested.sort_by_key(|c| {
            std::cmp::Reverse(if seeding {
                c.upload_rate
            } else {
                c.download_rate
            })
        });

        // rotate the optimistic slot on its own cadence; it persists
        // across regular ticks in between
        let rotate = match self.last_optimistic_rotation {
            None => true,
            Some(at) => now.duration_since(at) >= self.optimistic_interval,
        };
        let regular_slots = self.max_upload_slots - 1;
        if rotate {
            let pool: Vec<&ChokeCandidate> = interested
                .iter()
                .skip(regular_slots)
                .copied()
                .collect();
            self.optimistic = pick_optimistic(&pool, now);
            self.last_optimistic_rotation = Some(now);
        } else if let Some(current) = self.optimistic {
            // drop the slot if its peer vanished or lost interest
            if !interested.iter().any(|c| c.addr == current) {
                self.optimistic = None;
            }
        }

        let mut next: HashSet<SocketAddr> = interested
            .iter()
            .take(regular_slots)
            .map(|c| c.addr)
            .collect();
        if let Some(optimistic) = self.optimistic {
            next.insert(optimistic);
        }
        debug_assert!(next.len() <= self.max_upload_slots);

        let decision = ChokeDecision {
            unchoke: next.difference(&self.unchoked).copied().collect(),
            choke: self.unchoked.difference(&next).copied().collect(),
        };
        self.unchoked = next;
        decision
    }

    /// Forgets a disconnected peer without issuing a CHOKE for it.
    pub fn forget(&mut self, addr: SocketAddr) {
        self.unchoked.remove(&addr);
        if self.optimistic == Some(addr) {
            self.optimistic = None;
        }
    }
}

/// Weighted random draw for the optimistic slot: freshly connected peers
/// weigh [`FRESH_PEER_WEIGHT`] times as much.
fn pick_optimistic(
    pool: &[&ChokeCandidate],
    now: Instant,
) -> Option<SocketAddr> {
    if pool.is_empty() {
        return None;
    }
    let weight = |c: &ChokeCandidate| -> u32 {
        if now.duration_since(c.connected_at) < FRESH_PEER_AGE {
            FRESH_PEER_WEIGHT
        } else {
            1
        }
    };
    let total: u32 = pool.iter().map(|c| weight(c)).sum();
    let mut draw = rand::thread_rng().gen_range(0..total);
    for candidate in pool.iter().copied() {
        let w = weight(candidate);
        if draw < w {
            return Some(candidate.addr);
        }
        draw -= w;
    }
    unreachable!("draw is bounded by the weight total")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([10, 0, 0, 1], port).into()
    }

    fn candidate(
        port: u16,
        interested: bool,
        download_rate: u64,
        now: Instant,
    ) -> ChokeCandidate {
        ChokeCandidate {
            addr: addr(port),
            peer_interested: interested,
            download_rate,
            upload_rate: 0,
            connected_at: now - Duration::from_secs(600),
        }
    }

    #[test]
    fn test_top_uploaders_get_regular_slots() {
        let now = Instant::now();
        let mut choker = Choker::new(4, Duration::from_secs(30));
        let candidates = vec![
            candidate(1, true, 100, now),
            candidate(2, true, 900, now),
            candidate(3, true, 500, now),
            candidate(4, true, 300, now),
            candidate(5, true, 10, now),
        ];
        let decision = choker.tick(&candidates, false, now);

        // 3 regular slots go to the 3 fastest, plus one optimistic pick
        assert_eq!(decision.choke, vec![]);
        assert!(decision.unchoke.contains(&addr(2)));
        assert!(decision.unchoke.contains(&addr(3)));
        assert!(decision.unchoke.contains(&addr(4)));
        assert!(choker.unchoked().len() <= 4);
    }

    #[test]
    fn test_uninterested_peers_never_unchoked() {
        let now = Instant::now();
        let mut choker = Choker::new(4, Duration::from_secs(30));
        let candidates = vec![
            candidate(1, false, 1000, now),
            candidate(2, true, 10, now),
        ];
        let decision = choker.tick(&candidates, false, now);
        assert!(!decision.unchoke.contains(&addr(1)));
        assert!(decision.unchoke.contains(&addr(2)));
    }

    #[test]
    fn test_slot_loss_issues_choke() {
        let now = Instant::now();
        let mut choker = Choker::new(2, Duration::from_secs(30));
        let round1 = vec![
            candidate(1, true, 900, now),
            candidate(2, true, 800, now),
        ];
        choker.tick(&round1, false, now);

        // a faster newcomer displaces the slower peer on the next round
        let later = now + Duration::from_secs(10);
        let round2 = vec![
            candidate(1, true, 100, later),
            candidate(2, true, 800, later),
            candidate(3, true, 950, later),
        ];
        let decision = choker.tick(&round2, false, later);
        // with 1 regular slot + 1 optimistic, peer 3 must now hold the
        // regular slot
        assert!(choker.unchoked().contains(&addr(3)));
        assert!(decision.unchoke.contains(&addr(3)));
        assert!(choker.unchoked().len() <= 2);
        // everything that was unchoked and lost its slot got a choke
        for choked in &decision.choke {
            assert!(!choker.unchoked().contains(choked));
        }
    }

    #[test]
    fn test_seeding_ranks_by_upload() {
        let now = Instant::now();
        let mut choker = Choker::new(2, Duration::from_secs(30));
        let mut a = candidate(1, true, 0, now);
        a.upload_rate = 100;
        let mut b = candidate(2, true, 0, now);
        b.upload_rate = 900;
        let decision = choker.tick(&[a, b], true, now);
        assert!(decision.unchoke.contains(&addr(2)));
    }

    #[test]
    fn test_optimistic_rotation_cadence() {
        let now = Instant::now();
        let mut choker = Choker::new(2, Duration::from_secs(30));
        // one regular slot, so the optimistic pool is everyone below it
        let candidates: Vec<ChokeCandidate> = (1..=5)
            .map(|p| candidate(p, true, 1000 - p as u64, now))
            .collect();
        choker.tick(&candidates, false, now);
        let first_optimistic = choker.optimistic;
        assert!(first_optimistic.is_some());

        // within the interval the optimistic pick persists
        let soon = now + Duration::from_secs(10);
        choker.tick(&candidates, false, soon);
        assert_eq!(choker.optimistic, first_optimistic);

        // after the interval a rotation happens (the winner may repeat,
        // but the rotation timestamp must advance)
        let later = now + Duration::from_secs(31);
        choker.tick(&candidates, false, later);
        assert_eq!(choker.last_optimistic_rotation, Some(later));
    }

    #[test]
    fn test_forget_disconnected_peer() {
        let now = Instant::now();
        let mut choker = Choker::new(2, Duration::from_secs(30));
        choker.tick(&[candidate(1, true, 10, now)], false, now);
        assert!(!choker.unchoked().is_empty());
        choker.forget(addr(1));
        assert!(choker.unchoked().is_empty());
    }
}
