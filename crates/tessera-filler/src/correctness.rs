//! Evaluates skipped-release decisions against later demand peaks.
//!
//! Whenever the release policy declines to return pages because recent
//! demand suggests they will be needed again, the skipped amount is
//! recorded here. When a new demand peak arrives, past decisions whose
//! justifying peak it reaches are credited as correct; decisions still
//! inside their evaluation window stay pending.

use core::ops::AddAssign;
use core::time::Duration;

use tessera_core::{Clock, Length};

use crate::timeseries::{EpochEntry, TimeSeriesTracker};

// =============================================================================
// DECISION
// =============================================================================

/// Aggregate of release decisions that were skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkippedSubreleaseDecision {
    /// Pages we decided not to release.
    pub pages: Length,
    /// Number of times we skipped.
    pub count: usize,
}

impl SkippedSubreleaseDecision {
    /// A single skip of `pages`.
    pub fn one(pages: Length) -> Self {
        Self { pages, count: 1 }
    }
}

impl AddAssign for SkippedSubreleaseDecision {
    fn add_assign(&mut self, rhs: Self) {
        self.pages += rhs.pages;
        self.count += rhs.count;
    }
}

// =============================================================================
// EPOCH ENTRY
// =============================================================================

/// One sample folded into the correctness time series.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SkippedSubreleaseUpdate {
    /// A decision made at this time step: how much did we decide not
    /// to release?
    pub decision: SkippedSubreleaseDecision,
    /// The demand peak that justified the skip. Future demand must
    /// reach this for the decision to be correct.
    pub num_pages_at_decision: Length,
    /// Epochs after the decision before it is judged incorrect.
    pub correctness_interval_epochs: i64,
    /// A demand peak confirmed at this time step. Decisions in earlier
    /// epochs justified by a peak at or below this are settled and
    /// must not be credited again.
    pub confirmed_peak: Length,
}

#[derive(Debug, Clone)]
pub(crate) struct SkippedSubreleaseEntry {
    decisions: SkippedSubreleaseDecision,
    max_num_pages_at_decision: Length,
    correctness_interval_epochs: i64,
    max_confirmed_peak: Length,
}

impl EpochEntry for SkippedSubreleaseEntry {
    type Update = SkippedSubreleaseUpdate;

    fn nil() -> Self {
        Self {
            decisions: SkippedSubreleaseDecision::default(),
            max_num_pages_at_decision: Length::ZERO,
            correctness_interval_epochs: 0,
            max_confirmed_peak: Length::ZERO,
        }
    }

    fn report(&mut self, update: SkippedSubreleaseUpdate) {
        self.decisions += update.decision;
        self.correctness_interval_epochs = self
            .correctness_interval_epochs
            .max(update.correctness_interval_epochs);
        self.max_num_pages_at_decision = self
            .max_num_pages_at_decision
            .max(update.num_pages_at_decision);
        self.max_confirmed_peak = self.max_confirmed_peak.max(update.confirmed_peak);
    }

    fn empty(&self) -> bool {
        self.decisions.count == 0
            && self.max_num_pages_at_decision == Length::ZERO
            && self.max_confirmed_peak == Length::ZERO
    }
}

// =============================================================================
// CORRECTNESS TRACKER
// =============================================================================

/// Tracks correctness of skipped release decisions over time.
#[derive(Debug)]
pub struct SkippedSubreleaseCorrectnessTracker<const EPOCHS: usize> {
    epoch_length: Duration,
    /// The largest peak processed this epoch, so repeated peak reports
    /// within one epoch do not double-credit decisions.
    last_confirmed_peak: Length,
    total_skipped: SkippedSubreleaseDecision,
    correctly_skipped: SkippedSubreleaseDecision,
    pending_skipped: SkippedSubreleaseDecision,
    tracker: TimeSeriesTracker<SkippedSubreleaseEntry, EPOCHS>,
}

impl<const EPOCHS: usize> SkippedSubreleaseCorrectnessTracker<EPOCHS> {
    /// A tracker over `window`, divided into `EPOCHS` epochs.
    pub fn new(clock: Clock, window: Duration) -> Self {
        Self {
            epoch_length: window / EPOCHS as u32,
            last_confirmed_peak: Length::ZERO,
            total_skipped: SkippedSubreleaseDecision::default(),
            correctly_skipped: SkippedSubreleaseDecision::default(),
            pending_skipped: SkippedSubreleaseDecision::default(),
            tracker: TimeSeriesTracker::new(clock, window),
        }
    }

    /// Record a skipped release of `skipped_pages`, justified by
    /// `peak_pages` of recent demand. The decision is judged against
    /// peaks arriving within `expected_time_until_next_peak`.
    pub fn report_skipped_subrelease_pages(
        &mut self,
        skipped_pages: Length,
        peak_pages: Length,
        expected_time_until_next_peak: Duration,
    ) {
        self.total_skipped += SkippedSubreleaseDecision::one(skipped_pages);
        self.pending_skipped += SkippedSubreleaseDecision::one(skipped_pages);

        let update = SkippedSubreleaseUpdate {
            decision: SkippedSubreleaseDecision::one(skipped_pages),
            num_pages_at_decision: peak_pages,
            correctness_interval_epochs: (expected_time_until_next_peak.as_secs_f64()
                / self.epoch_length.as_secs_f64()) as i64,
            confirmed_peak: Length::ZERO,
        };
        self.tracker.report(update);
    }

    /// Process a new demand peak: credit past decisions it confirms
    /// and recompute the pending set.
    pub fn report_updated_peak(&mut self, current_peak: Length) {
        // Record this peak for the current epoch (so we don't
        // double-count correct predictions later) and advance the
        // tracker.
        let update = SkippedSubreleaseUpdate {
            confirmed_peak: current_peak,
            ..SkippedSubreleaseUpdate::default()
        };
        if self.tracker.report(update) {
            self.last_confirmed_peak = Length::ZERO;
        }

        // Recompute currently pending decisions.
        self.pending_skipped = SkippedSubreleaseDecision::default();

        let mut largest_peak_already_confirmed = self.last_confirmed_peak;
        let correctly_skipped = &mut self.correctly_skipped;
        let pending_skipped = &mut self.pending_skipped;

        self.tracker.iter_backwards(None, |offset, _ts, e| {
            // Decisions in the current epoch are not judged yet.
            if offset == 0 {
                return;
            }

            if e.decisions.count > 0
                && e.max_num_pages_at_decision > largest_peak_already_confirmed
                && (offset as i64) <= e.correctness_interval_epochs
            {
                if e.max_num_pages_at_decision <= current_peak {
                    // Confirmed correct, and not settled by any
                    // earlier peak.
                    *correctly_skipped += e.decisions;
                } else {
                    *pending_skipped += e.decisions;
                }
            }

            // Peaks confirmed in this epoch settled any older decision
            // they reach; remember them so we do not credit twice.
            largest_peak_already_confirmed =
                largest_peak_already_confirmed.max(e.max_confirmed_peak);
        });

        self.last_confirmed_peak = self.last_confirmed_peak.max(current_peak);
    }

    /// Everything ever skipped.
    #[inline]
    pub fn total_skipped(&self) -> SkippedSubreleaseDecision {
        self.total_skipped
    }

    /// Decisions confirmed correct by a later peak.
    #[inline]
    pub fn correctly_skipped(&self) -> SkippedSubreleaseDecision {
        self.correctly_skipped
    }

    /// Decisions still awaiting a confirming peak.
    #[inline]
    pub fn pending_skipped(&self) -> SkippedSubreleaseDecision {
        self.pending_skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::clock as test_clock;

    const WINDOW: Duration = Duration::from_secs(600);
    const EPOCHS: usize = 600; // 1s epochs

    fn tracker() -> SkippedSubreleaseCorrectnessTracker<EPOCHS> {
        test_clock::reset();
        SkippedSubreleaseCorrectnessTracker::new(test_clock::get(), WINDOW)
    }

    #[test]
    fn confirming_peak_credits_decision() {
        let mut t = tracker();
        t.report_skipped_subrelease_pages(Length(40), Length(100), Duration::from_secs(60));
        assert_eq!(t.pending_skipped().pages, Length(40));

        test_clock::advance(Duration::from_secs(1));
        t.report_updated_peak(Length(110));
        assert_eq!(t.correctly_skipped().pages, Length(40));
        assert_eq!(t.pending_skipped().pages, Length::ZERO);
        assert_eq!(t.total_skipped().pages, Length(40));
    }

    #[test]
    fn low_peak_keeps_decision_pending() {
        let mut t = tracker();
        t.report_skipped_subrelease_pages(Length(40), Length(100), Duration::from_secs(60));
        test_clock::advance(Duration::from_secs(1));
        t.report_updated_peak(Length(90));
        assert_eq!(t.correctly_skipped().pages, Length::ZERO);
        assert_eq!(t.pending_skipped().pages, Length(40));
    }

    #[test]
    fn decision_expires_after_its_interval() {
        let mut t = tracker();
        t.report_skipped_subrelease_pages(Length(40), Length(100), Duration::from_secs(2));
        test_clock::advance(Duration::from_secs(5));
        t.report_updated_peak(Length(200));
        // Too late: offset exceeds the correctness interval.
        assert_eq!(t.correctly_skipped().pages, Length::ZERO);
        assert_eq!(t.pending_skipped().pages, Length::ZERO);
        // But the total still remembers the skip.
        assert_eq!(t.total_skipped().pages, Length(40));
    }

    #[test]
    fn repeated_peaks_do_not_double_credit() {
        let mut t = tracker();
        t.report_skipped_subrelease_pages(Length(40), Length(100), Duration::from_secs(60));
        test_clock::advance(Duration::from_secs(1));
        t.report_updated_peak(Length(110));
        assert_eq!(t.correctly_skipped().pages, Length(40));
        // A second peak in the same epoch must not credit again.
        t.report_updated_peak(Length(120));
        assert_eq!(t.correctly_skipped().pages, Length(40));
        assert_eq!(t.correctly_skipped().count, 1);
    }

    #[test]
    fn correctness_totals_are_bounded_by_total_skipped() {
        let mut t = tracker();
        for _ in 0..3 {
            t.report_skipped_subrelease_pages(Length(10), Length(50), Duration::from_secs(120));
            test_clock::advance(Duration::from_secs(1));
            t.report_updated_peak(Length(45));
        }
        let total = t.total_skipped();
        let settled = t.correctly_skipped();
        let pending = t.pending_skipped();
        assert!(settled.pages + pending.pages <= total.pages);
        assert!(settled.count + pending.count <= total.count);
    }
}
