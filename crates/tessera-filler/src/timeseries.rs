//! Fixed-capacity time series keyed by a monotonic clock.
//!
//! The window is divided into a fixed number of epochs; reports fold
//! into the entry for the current epoch, and entries age out as the
//! clock advances. Everything is driven by the injected
//! [`Clock`], so tests control time completely.

use alloc::vec::Vec;
use core::time::Duration;

use tessera_core::Clock;

// =============================================================================
// EPOCH ENTRY
// =============================================================================

/// One aggregate slot of a time series.
pub trait EpochEntry: Clone {
    /// The sample type folded into an entry.
    type Update;

    /// The empty aggregate.
    fn nil() -> Self;

    /// Fold one sample into this entry.
    fn report(&mut self, update: Self::Update);

    /// True if no sample has been folded in.
    fn empty(&self) -> bool;
}

// =============================================================================
// TIME SERIES TRACKER
// =============================================================================

/// Circular buffer of `EPOCHS` per-epoch aggregates.
#[derive(Debug)]
pub struct TimeSeriesTracker<E: EpochEntry, const EPOCHS: usize> {
    clock: Clock,
    epoch_ticks: i64,
    entries: Vec<E>,
    /// Absolute epoch number of the entry at `head`.
    current_epoch: i64,
    head: usize,
}

impl<E: EpochEntry, const EPOCHS: usize> TimeSeriesTracker<E, EPOCHS> {
    /// A tracker covering `window`, divided into `EPOCHS` epochs.
    pub fn new(clock: Clock, window: Duration) -> Self {
        let epoch_ticks = (clock.ticks_for(window) / EPOCHS as i64).max(1);
        let mut entries = Vec::with_capacity(EPOCHS);
        entries.resize_with(EPOCHS, E::nil);
        Self {
            clock,
            epoch_ticks,
            entries,
            current_epoch: clock.now() / epoch_ticks,
            head: 0,
        }
    }

    /// Length of one epoch in clock ticks.
    #[inline]
    pub fn epoch_ticks(&self) -> i64 {
        self.epoch_ticks
    }

    /// Advance to the epoch the clock is in, discarding entries that
    /// aged out. Returns true if at least one boundary was crossed.
    fn update_clock(&mut self) -> bool {
        let epoch = self.clock.now() / self.epoch_ticks;
        if epoch <= self.current_epoch {
            return false;
        }
        let delta = (epoch - self.current_epoch) as usize;
        if delta >= EPOCHS {
            for e in &mut self.entries {
                *e = E::nil();
            }
            self.head = 0;
        } else {
            for _ in 0..delta {
                self.head = (self.head + 1) % EPOCHS;
                self.entries[self.head] = E::nil();
            }
        }
        self.current_epoch = epoch;
        true
    }

    /// Fold `update` into the current epoch's entry, creating new
    /// epochs as time has advanced. Returns true iff the report
    /// crossed an epoch boundary.
    pub fn report(&mut self, update: E::Update) -> bool {
        let crossed = self.update_clock();
        self.entries[self.head].report(update);
        crossed
    }

    /// The entry `offset` epochs before the current one.
    ///
    /// Does not advance the clock; offset 0 is the current epoch.
    pub fn entry_at_offset(&self, offset: usize) -> &E {
        debug_assert!(offset < EPOCHS);
        &self.entries[(self.head + EPOCHS - offset) % EPOCHS]
    }

    /// Walk up to `n` most recent entries, newest first (`None` = all).
    ///
    /// The callback receives the entry's age in epochs (0 = current)
    /// and the tick timestamp of its epoch start.
    pub fn iter_backwards(&self, n: Option<usize>, mut f: impl FnMut(usize, i64, &E)) {
        let limit = n.unwrap_or(EPOCHS).min(EPOCHS);
        for offset in 0..limit {
            let ts = (self.current_epoch - offset as i64) * self.epoch_ticks;
            f(offset, ts, self.entry_at_offset(offset));
        }
    }

    /// Walk entries chronologically, oldest first, optionally skipping
    /// empty ones. The callback receives the age in epochs.
    pub fn iter(&self, skip_empty: bool, mut f: impl FnMut(usize, i64, &E)) {
        for offset in (0..EPOCHS).rev() {
            let e = self.entry_at_offset(offset);
            if skip_empty && e.empty() {
                continue;
            }
            let ts = (self.current_epoch - offset as i64) * self.epoch_ticks;
            f(offset, ts, e);
        }
    }

    /// Convert a tick timestamp to milliseconds for reporting.
    #[inline]
    pub fn ticks_to_ms(&self, ticks: i64) -> i64 {
        self.clock.ticks_to_ms(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::clock as test_clock;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct SumEntry {
        total: u64,
        reports: usize,
    }

    impl EpochEntry for SumEntry {
        type Update = u64;

        fn nil() -> Self {
            SumEntry {
                total: 0,
                reports: 0,
            }
        }

        fn report(&mut self, update: u64) {
            self.total += update;
            self.reports += 1;
        }

        fn empty(&self) -> bool {
            self.reports == 0
        }
    }

    const WINDOW: Duration = Duration::from_secs(16);

    #[test]
    fn folds_within_an_epoch() {
        test_clock::reset();
        let mut t: TimeSeriesTracker<SumEntry, 16> =
            TimeSeriesTracker::new(test_clock::get(), WINDOW);
        assert!(!t.report(3));
        assert!(!t.report(4));
        assert_eq!(t.entry_at_offset(0).total, 7);
    }

    #[test]
    fn crossing_epochs_creates_fresh_entries() {
        test_clock::reset();
        let mut t: TimeSeriesTracker<SumEntry, 16> =
            TimeSeriesTracker::new(test_clock::get(), WINDOW);
        t.report(5);
        test_clock::advance(Duration::from_secs(1));
        assert!(t.report(7));
        assert_eq!(t.entry_at_offset(0).total, 7);
        assert_eq!(t.entry_at_offset(1).total, 5);
    }

    #[test]
    fn entries_age_out_of_the_window() {
        test_clock::reset();
        let mut t: TimeSeriesTracker<SumEntry, 16> =
            TimeSeriesTracker::new(test_clock::get(), WINDOW);
        t.report(5);
        // 17 epochs later the old entry has been recycled.
        test_clock::advance(Duration::from_secs(17));
        t.report(1);
        let mut totals = 0;
        t.iter_backwards(None, |_, _, e| totals += e.total);
        assert_eq!(totals, 1);
    }

    #[test]
    fn iter_backwards_orders_newest_first() {
        test_clock::reset();
        let mut t: TimeSeriesTracker<SumEntry, 16> =
            TimeSeriesTracker::new(test_clock::get(), WINDOW);
        for v in 1..=3u64 {
            t.report(v);
            test_clock::advance(Duration::from_secs(1));
        }
        // Clock sits one epoch past the last report.
        t.report(4);
        let mut seen = alloc::vec::Vec::new();
        t.iter_backwards(Some(4), |offset, _, e| seen.push((offset, e.total)));
        assert_eq!(seen, alloc::vec![(0, 4), (1, 3), (2, 2), (3, 1)]);
    }

    #[test]
    fn iter_skips_empty_entries() {
        test_clock::reset();
        let mut t: TimeSeriesTracker<SumEntry, 16> =
            TimeSeriesTracker::new(test_clock::get(), WINDOW);
        t.report(2);
        test_clock::advance(Duration::from_secs(3));
        t.report(9);
        let mut seen = alloc::vec::Vec::new();
        t.iter(true, |_, _, e| seen.push(e.total));
        assert_eq!(seen, alloc::vec![2, 9]);
    }
}
