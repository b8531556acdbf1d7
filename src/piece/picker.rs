//! Piece selection: ordering the candidate pieces a peer can serve.
//!
//! The picker is a pure ordering component. The store hands it the
//! candidate set (pieces the peer has, that we still need, with their
//! rarity and effective priority) and the picker sorts it according to the
//! configured strategy. Every strategy honors priority first and never
//! sees do-not-download pieces, which the store filters out beforehand.

use std::collections::VecDeque;
use std::time::Instant;

use crate::conf::PieceSelection;
use crate::piece::FilePriority;
use crate::PieceIndex;

/// A piece the peer can serve, with the swarm state the strategies rank by.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Candidate {
    pub index: PieceIndex,
    /// How many connected peers advertise the piece.
    pub rarity: usize,
    /// The max priority of the selected files the piece overlaps.
    pub priority: FilePriority,
}

/// Swarm-level inputs to an ordering decision.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PickContext {
    /// The first needed piece that is not yet complete; base of the
    /// sequential window.
    pub next_needed: PieceIndex,
    /// Completed fraction of the needed pieces, `0.0..=1.0`.
    pub completed_fraction: f64,
    /// The requesting peer's download rate, normalized against the fastest
    /// peer in the torrent, `0.0..=1.0`.
    pub peer_bandwidth_norm: f64,
    /// Fraction of the sequential window that is available from at least
    /// one connected peer.
    pub window_availability: f64,
    /// The number of connected peers, used to normalize rarity.
    pub peer_count: usize,
}

/// How many recent piece completions the adaptive strategy observes.
const ADAPTIVE_WINDOW: usize = 16;

/// Orders candidates per the configured strategy. Holds the bits of state
/// some strategies carry between calls.
#[derive(Debug)]
pub(crate) struct PiecePicker {
    selection: PieceSelection,
    /// Round-robin cursor: the index the next cycle starts at.
    cursor: PieceIndex,
    /// Sliding window over the sequential strategy, in pieces.
    sequential_window: usize,
    /// Window availability below this falls back to rarest-first.
    sequential_fallback_threshold: f64,
    /// Timestamps of recent piece completions, newest last.
    recent_completions: VecDeque<Instant>,
}

impl PiecePicker {
    pub fn new(
        selection: PieceSelection,
        sequential_window: usize,
        sequential_fallback_threshold: f64,
    ) -> Self {
        Self {
            selection,
            cursor: 0,
            sequential_window,
            sequential_fallback_threshold,
            recent_completions: VecDeque::with_capacity(ADAPTIVE_WINDOW),
        }
    }

    pub fn sequential_window(&self) -> usize {
        self.sequential_window
    }

    /// Feeds a piece completion into the adaptive strategy's observation
    /// window.
    pub fn record_completion(&mut self, now: Instant) {
        if self.recent_completions.len() == ADAPTIVE_WINDOW {
            self.recent_completions.pop_front();
        }
        self.recent_completions.push_back(now);
    }

    /// Sorts the candidates so that the most preferable piece comes first.
    pub fn order(&mut self, candidates: &mut [Candidate], ctx: &PickContext) {
        match self.effective_selection(ctx) {
            PieceSelection::RoundRobin => {
                let cursor = self.cursor;
                candidates.sort_by_key(|c| {
                    // pieces at or past the cursor first, then wrap around
                    (
                        std::cmp::Reverse(c.priority),
                        c.index < cursor,
                        c.index,
                    )
                });
                if let Some(first) = candidates.first() {
                    self.cursor = first.index + 1;
                }
            }
            PieceSelection::RarestFirst => {
                candidates.sort_by_key(|c| {
                    (std::cmp::Reverse(c.priority), c.rarity, c.index)
                });
            }
            PieceSelection::Sequential => {
                let window_end =
                    ctx.next_needed + self.sequential_window;
                candidates.sort_by_key(|c| {
                    (
                        std::cmp::Reverse(c.priority),
                        // outside-window pieces sort last
                        c.index < ctx.next_needed || c.index >= window_end,
                        c.index,
                    )
                });
            }
            PieceSelection::BandwidthWeightedRarest { weight } => {
                let peer_count = ctx.peer_count.max(1) as f64;
                let score = |c: &Candidate| {
                    let rarity_norm =
                        (c.rarity as f64 / peer_count).min(1.0);
                    weight * (1.0 - rarity_norm)
                        + (1.0 - weight) * ctx.peer_bandwidth_norm
                };
                candidates.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(
                            score(b)
                                .partial_cmp(&score(a))
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                        .then(a.index.cmp(&b.index))
                });
            }
            // the two composite strategies resolve to one of the above in
            // `effective_selection` and never reach here
            PieceSelection::ProgressiveRarest { .. }
            | PieceSelection::AdaptiveHybrid => unreachable!(),
        }
    }

    /// Resolves composite strategies to a concrete ordering for this tick.
    fn effective_selection(&self, ctx: &PickContext) -> PieceSelection {
        match self.selection {
            PieceSelection::Sequential => {
                if ctx.window_availability
                    < self.sequential_fallback_threshold
                {
                    // the window is too scarce this tick, take what the
                    // swarm has
                    PieceSelection::RarestFirst
                } else {
                    PieceSelection::Sequential
                }
            }
            PieceSelection::ProgressiveRarest { progress_threshold } => {
                if ctx.completed_fraction < progress_threshold {
                    PieceSelection::Sequential
                } else {
                    PieceSelection::RarestFirst
                }
            }
            PieceSelection::AdaptiveHybrid => {
                // with a full observation window and steady progress we
                // can afford in-order pieces; a stalling or cold swarm
                // gets rarest-first to maximize availability
                let steady = self.recent_completions.len()
                    == ADAPTIVE_WINDOW
                    && self
                        .recent_completions
                        .back()
                        .map(|last| last.elapsed().as_secs() < 10)
                        .unwrap_or(false);
                if steady {
                    PieceSelection::Sequential
                } else {
                    PieceSelection::RarestFirst
                }
            }
            other => other,
        }
    }
}
