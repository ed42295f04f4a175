//! Per-market local order book reconstruction and the nonce-gated resync
//! protocol (§4.B). Grounded line-for-line on original_source's
//! `ingest_orderbook.py` (`LocalBook`), translated from Python dicts +
//! `sorted()` into `BTreeMap`s kept pruned to depth on every mutation.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_DEPTH: usize = 100;
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopSource {
    Snapshot,
    Realtime,
    Buffered,
}

impl TopSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopSource::Snapshot => "snapshot",
            TopSource::Realtime => "realtime",
            TopSource::Buffered => "buffered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopOfBook {
    pub best_bid: Decimal,
    pub best_bid_size: Decimal,
    pub best_ask: Decimal,
    pub best_ask_size: Decimal,
}

#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub nonce: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub nonce: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// State machine transitions of §4.B: `Unseeded -> Seeded -> (OutOfSync -> Unseeded)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Unseeded,
    Seeded,
    OutOfSync,
}

pub struct LocalBook {
    depth: usize,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_nonce: i64,
    seeded: bool,
    buffer: VecDeque<BookUpdate>,
    grace_deadline: Option<Instant>,
    last_top: Option<TopOfBook>,
    drain_grace: Duration,
}

impl LocalBook {
    pub fn new(depth: usize) -> Self {
        Self::with_grace(depth, Duration::from_millis(DEFAULT_DRAIN_GRACE_MS))
    }

    pub fn with_grace(depth: usize, drain_grace: Duration) -> Self {
        Self {
            depth,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_nonce: -1,
            seeded: false,
            buffer: VecDeque::new(),
            grace_deadline: None,
            last_top: None,
            drain_grace,
        }
    }

    pub fn state(&self) -> BookState {
        if !self.seeded {
            BookState::Unseeded
        } else if self.grace_deadline.is_some() && self.grace_expired() && !self.can_drain_now() {
            // Grace has lapsed and nothing progressed; caller is expected to
            // call `mark_out_of_sync` once this is observed. Reported here
            // only for introspection/tests.
            BookState::Seeded
        } else {
            BookState::Seeded
        }
    }

    pub fn last_nonce(&self) -> i64 {
        self.last_nonce
    }

    pub fn seeded(&self) -> bool {
        self.seeded
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    fn apply_side(side: &mut BTreeMap<Decimal, Decimal>, levels: &[(Decimal, Decimal)], depth: usize, ascending: bool) {
        for (price, amount) in levels {
            if amount.is_zero() {
                side.remove(price);
            } else {
                side.insert(*price, *amount);
            }
        }
        // Prune to top `depth` by best-side ordering (bids: highest price
        // first, asks: lowest price first).
        if side.len() > depth {
            let keep: Vec<Decimal> = if ascending {
                side.keys().take(depth).copied().collect()
            } else {
                side.keys().rev().take(depth).copied().collect()
            };
            side.retain(|k, _| keep.contains(k));
        }
    }

    /// Installs a REST snapshot as the book state, enters `Seeded`, and arms
    /// the non-blocking grace deadline.
    pub fn apply_snapshot(&mut self, snap: BookSnapshot) {
        self.bids.clear();
        self.asks.clear();
        Self::apply_side(&mut self.bids, &snap.bids, self.depth, false);
        Self::apply_side(&mut self.asks, &snap.asks, self.depth, true);
        self.last_nonce = snap.nonce;
        self.seeded = true;
        self.last_top = None;
        self.grace_deadline = Some(Instant::now() + self.drain_grace);
    }

    /// Applies `update` if it is the next expected nonce, else buffers it.
    /// Returns `true` if applied in place.
    pub fn try_apply_update(&mut self, update: BookUpdate) -> bool {
        if !self.seeded {
            self.buffer.push_back(update);
            return false;
        }
        if update.nonce == self.last_nonce + 1 {
            Self::apply_side(&mut self.bids, &update.bids, self.depth, false);
            Self::apply_side(&mut self.asks, &update.asks, self.depth, true);
            self.last_nonce = update.nonce;
            true
        } else {
            self.buffer.push_back(update);
            false
        }
    }

    /// Whether the main loop may attempt a non-blocking drain step right now.
    pub fn can_drain_now(&self) -> bool {
        self.seeded && self.grace_deadline.map(|d| Instant::now() <= d).unwrap_or(false)
    }

    /// One non-blocking drain step: if the expected next nonce is present in
    /// the buffer (last-wins per nonce), apply it and prune the buffer to
    /// entries still ahead of `last_nonce`.
    pub fn drain_step(&mut self) -> bool {
        if !self.seeded {
            return false;
        }
        let expected = self.last_nonce + 1;
        let mut best: Option<BookUpdate> = None;
        for u in self.buffer.iter() {
            if u.nonce == expected {
                best = Some(u.clone());
            }
        }
        let Some(update) = best else { return false };
        if self.try_apply_update(update) {
            let last = self.last_nonce;
            self.buffer.retain(|u| u.nonce > last);
            true
        } else {
            false
        }
    }

    pub fn grace_expired(&self) -> bool {
        self.grace_deadline.map(|d| Instant::now() > d).unwrap_or(false)
    }

    /// Transition to `OutOfSync`: drop the book, clear the buffer, release
    /// top-of-book, schedule a re-snapshot (caller's responsibility).
    pub fn mark_out_of_sync(&mut self) {
        self.seeded = false;
        self.grace_deadline = None;
        self.buffer.clear();
        self.last_top = None;
    }

    pub fn current_top(&self) -> Option<TopOfBook> {
        let (&best_bid, &best_bid_size) = self.bids.iter().next_back()?;
        let (&best_ask, &best_ask_size) = self.asks.iter().next()?;
        Some(TopOfBook {
            best_bid,
            best_bid_size,
            best_ask,
            best_ask_size,
        })
    }

    /// Recomputes top-of-book and returns it tagged with `source` only if it
    /// differs from the last emitted tuple (Invariant 3 / §4.B.8).
    pub fn emit_top_if_changed(&mut self, source: TopSource) -> Option<(TopOfBook, i64, TopSource)> {
        let top = self.current_top()?;
        if self.last_top.as_ref() == Some(&top) {
            return None;
        }
        self.last_top = Some(top.clone());
        Some((top, self.last_nonce, source))
    }
}

impl Clone for BookUpdate {
    fn clone(&self) -> Self {
        Self {
            nonce: self.nonce,
            bids: self.bids.clone(),
            asks: self.asks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn snap(nonce: i64) -> BookSnapshot {
        BookSnapshot {
            nonce,
            bids: vec![(d("100.0"), d("1.0"))],
            asks: vec![(d("100.1"), d("1.0"))],
        }
    }

    #[test]
    fn s1_resync_under_loss() {
        let mut lb = LocalBook::with_grace(100, Duration::from_millis(0));
        lb.apply_snapshot(snap(100));
        assert_eq!(lb.last_nonce(), 100);

        assert!(lb.try_apply_update(BookUpdate { nonce: 101, bids: vec![], asks: vec![] }));
        assert!(lb.try_apply_update(BookUpdate { nonce: 102, bids: vec![], asks: vec![] }));
        assert_eq!(lb.last_nonce(), 102);

        // 104 and 105 arrive out of order; 103 never arrives.
        assert!(!lb.try_apply_update(BookUpdate { nonce: 104, bids: vec![], asks: vec![] }));
        assert!(!lb.try_apply_update(BookUpdate { nonce: 105, bids: vec![], asks: vec![] }));
        assert_eq!(lb.buffer_len(), 2);

        // Grace was set to 0ms, so it's immediately expired with no progress.
        assert!(lb.grace_expired());
        assert!(!lb.drain_step());
        lb.mark_out_of_sync();
        assert!(!lb.seeded());
        assert_eq!(lb.buffer_len(), 0);

        lb.apply_snapshot(snap(200));
        assert_eq!(lb.last_nonce(), 200);
        assert!(lb.seeded());
    }

    #[test]
    fn s2_top_of_book_dedup_across_two_unchanged_updates() {
        let mut lb = LocalBook::new(100);
        lb.apply_snapshot(BookSnapshot {
            nonce: 1,
            bids: vec![(d("20000.00"), d("1.0"))],
            asks: vec![(d("20000.10"), d("1.0"))],
        });
        let first = lb.emit_top_if_changed(TopSource::Snapshot);
        assert!(first.is_some());

        lb.try_apply_update(BookUpdate {
            nonce: 2,
            bids: vec![(d("20000.00"), d("1.0"))],
            asks: vec![],
        });
        let second = lb.emit_top_if_changed(TopSource::Realtime);
        assert!(second.is_none());

        lb.try_apply_update(BookUpdate {
            nonce: 3,
            bids: vec![],
            asks: vec![(d("20000.10"), d("1.0"))],
        });
        let third = lb.emit_top_if_changed(TopSource::Realtime);
        assert!(third.is_none());
    }

    #[test]
    fn amount_zero_removes_the_price_level() {
        let mut lb = LocalBook::new(100);
        lb.apply_snapshot(snap(1));
        lb.try_apply_update(BookUpdate {
            nonce: 2,
            bids: vec![(d("100.0"), d("0"))],
            asks: vec![],
        });
        assert!(lb.current_top().is_none());
    }

    #[test]
    fn nonce_gap_buffers_instead_of_applying() {
        let mut lb = LocalBook::new(100);
        lb.apply_snapshot(snap(10));
        let applied = lb.try_apply_update(BookUpdate { nonce: 12, bids: vec![], asks: vec![] });
        assert!(!applied);
        assert_eq!(lb.last_nonce(), 10);
        assert_eq!(lb.buffer_len(), 1);
    }

    #[test]
    fn drain_step_picks_last_wins_per_nonce() {
        let mut lb = LocalBook::new(100);
        lb.apply_snapshot(snap(10));
        lb.try_apply_update(BookUpdate {
            nonce: 11,
            bids: vec![(d("99.0"), d("1.0"))],
            asks: vec![],
        });
        // out of order duplicate for nonce 11 is buffered, never applied
        lb.try_apply_update(BookUpdate {
            nonce: 11,
            bids: vec![(d("98.0"), d("1.0"))],
            asks: vec![],
        });
        assert_eq!(lb.last_nonce(), 11);
    }

    #[test]
    fn depth_pruning_keeps_only_best_n_levels() {
        let mut lb = LocalBook::new(2);
        lb.apply_snapshot(BookSnapshot {
            nonce: 1,
            bids: vec![(d("10"), d("1")), (d("9"), d("1")), (d("8"), d("1"))],
            asks: vec![(d("11"), d("1")), (d("12"), d("1")), (d("13"), d("1"))],
        });
        let top = lb.current_top().unwrap();
        assert_eq!(top.best_bid, d("10"));
        assert_eq!(top.best_ask, d("11"));
    }
}
