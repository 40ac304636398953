//! Statistics: release accounting, span histograms, and the filler
//! time-series tracker feeding the skip-release policy.

use core::time::Duration;

use tessera_core::{safe_div, Clock, HugeLength, Length};

use crate::correctness::{SkippedSubreleaseCorrectnessTracker, SkippedSubreleaseDecision};
use crate::report::{PbtxtRegion, Printer};
use crate::timeseries::{EpochEntry, TimeSeriesTracker};

// =============================================================================
// SPAN STATS
// =============================================================================

/// Free runs at least this long count as large spans.
pub const MAX_SMALL_SPAN_PAGES: usize = 64;

/// Histogram of small free spans by length, split by backed state.
#[derive(Debug, Clone)]
pub struct SmallSpanStats {
    /// Count of backed free spans of each length.
    pub normal_length: [usize; MAX_SMALL_SPAN_PAGES],
    /// Count of released free spans of each length.
    pub returned_length: [usize; MAX_SMALL_SPAN_PAGES],
}

impl Default for SmallSpanStats {
    fn default() -> Self {
        Self {
            normal_length: [0; MAX_SMALL_SPAN_PAGES],
            returned_length: [0; MAX_SMALL_SPAN_PAGES],
        }
    }
}

/// Aggregate of large free spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargeSpanStats {
    /// Number of large spans.
    pub spans: usize,
    /// Backed pages across large spans.
    pub normal_pages: Length,
    /// Released pages across large spans.
    pub returned_pages: Length,
}

/// Byte-level summary of a backing store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackingStats {
    /// Bytes obtained from the system.
    pub system_bytes: usize,
    /// Bytes free but still backed.
    pub free_bytes: usize,
    /// Bytes returned to the system.
    pub unmapped_bytes: usize,
}

impl core::ops::AddAssign for BackingStats {
    fn add_assign(&mut self, rhs: Self) {
        self.system_bytes += rhs.system_bytes;
        self.free_bytes += rhs.free_bytes;
        self.unmapped_bytes += rhs.unmapped_bytes;
    }
}

// =============================================================================
// SKIP INTERVALS
// =============================================================================

/// Time intervals configuring the skip-release policy.
///
/// All zero disables the policy. When `peak_interval` is set it takes
/// priority; otherwise the short/long pair drives the demand
/// computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipSubreleaseIntervals {
    /// Locates the recent demand peak.
    pub peak_interval: Duration,
    /// Locates recent short-term demand fluctuation.
    pub short_interval: Duration,
    /// Locates the recent long-term demand trend.
    pub long_interval: Duration,
}

impl SkipSubreleaseIntervals {
    /// Is the peak interval configured?
    #[inline]
    pub fn is_peak_interval_set(&self) -> bool {
        self.peak_interval != Duration::ZERO
    }

    /// Is the skip-release policy enabled at all?
    #[inline]
    pub fn enabled(&self) -> bool {
        self.peak_interval != Duration::ZERO
            || self.short_interval != Duration::ZERO
            || self.long_interval != Duration::ZERO
    }
}

// =============================================================================
// SUBRELEASE STATS
// =============================================================================

/// Release accounting, split into a current-epoch bucket and
/// cumulative-since-startup totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubreleaseStats {
    /// Pages released, cumulative since startup.
    pub total_pages_subreleased: Length,
    /// Pages released from partially-released huge pages, cumulative.
    pub total_partial_alloc_pages_subreleased: Length,
    /// Pages released in the current epoch.
    pub num_pages_subreleased: Length,
    /// Pages released from partial allocs in the current epoch.
    pub num_partial_alloc_pages_subreleased: Length,
    /// Huge pages broken by a first subrelease, cumulative.
    pub total_hugepages_broken: HugeLength,
    /// Huge pages broken in the current epoch.
    pub num_hugepages_broken: HugeLength,
    /// Pages released while the memory limit was hit, cumulative.
    pub total_pages_subreleased_due_to_limit: Length,
    /// Huge pages broken while the memory limit was hit, cumulative.
    pub total_hugepages_broken_due_to_limit: HugeLength,
    is_limit_hit: bool,
}

impl SubreleaseStats {
    /// Roll the current-epoch counts into the cumulative totals.
    pub fn reset(&mut self) {
        self.total_pages_subreleased += self.num_pages_subreleased;
        self.total_partial_alloc_pages_subreleased += self.num_partial_alloc_pages_subreleased;
        self.total_hugepages_broken += self.num_hugepages_broken;
        self.num_pages_subreleased = Length::ZERO;
        self.num_partial_alloc_pages_subreleased = Length::ZERO;
        self.num_hugepages_broken = HugeLength::ZERO;
    }

    /// Must be called at the beginning of each release request.
    #[inline]
    pub fn set_limit_hit(&mut self, value: bool) {
        self.is_limit_hit = value;
    }

    /// Only well-defined while a release request set it earlier.
    #[inline]
    pub fn limit_hit(&self) -> bool {
        self.is_limit_hit
    }
}

// =============================================================================
// FILLER STATS
// =============================================================================

/// Huge page classes sampled by the filler time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugePageType {
    /// Neither donated nor released.
    Regular,
    /// Freshly donated from larger allocations.
    Donated,
    /// Partially released to the OS.
    PartialReleased,
    /// Fully released, then possibly reused.
    Released,
}

/// Number of [`HugePageType`] variants.
pub const HUGE_PAGE_TYPES: usize = 4;

impl HugePageType {
    /// Table index for per-type arrays.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            HugePageType::Regular => 0,
            HugePageType::Donated => 1,
            HugePageType::PartialReleased => 2,
            HugePageType::Released => 3,
        }
    }
}

/// One sample of the filler's state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FillerStats {
    /// Pages currently demanded (allocated) from the filler.
    pub num_pages: Length,
    /// Backed free pages.
    pub free_pages: Length,
    /// Released free pages.
    pub unmapped_pages: Length,
    /// Allocated pages living on subreleased huge pages.
    pub used_pages_in_subreleased_huge_pages: Length,
    /// Huge page counts by class.
    pub huge_pages: [HugeLength; HUGE_PAGE_TYPES],
    /// Pages released since the previous sample.
    pub num_pages_subreleased: Length,
    /// Pages released from partial allocs since the previous sample.
    pub num_partial_alloc_pages_subreleased: Length,
    /// Huge pages broken since the previous sample.
    pub num_hugepages_broken: HugeLength,
}

impl FillerStats {
    /// Huge pages across all classes.
    pub fn total_huge_pages(&self) -> HugeLength {
        let mut total = HugeLength::ZERO;
        for hp in self.huge_pages {
            total += hp;
        }
        total
    }
}

/// The four envelope points sampled within each epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsAt {
    MinDemand,
    MaxDemand,
    MinHugePages,
    MaxHugePages,
}

const STATS_AT_COUNT: usize = 4;
const STATS_AT_LABELS: [&str; STATS_AT_COUNT] = [
    "at_minimum_demand",
    "at_maximum_demand",
    "at_minimum_huge_pages",
    "at_maximum_huge_pages",
];

impl StatsAt {
    #[inline]
    const fn index(self) -> usize {
        match self {
            StatsAt::MinDemand => 0,
            StatsAt::MaxDemand => 1,
            StatsAt::MinHugePages => 2,
            StatsAt::MaxHugePages => 3,
        }
    }
}

/// Per-epoch aggregate: the envelope samples plus epoch minima and
/// release counts.
#[derive(Debug, Clone)]
pub(crate) struct FillerStatsEntry {
    stats: [FillerStats; STATS_AT_COUNT],
    min_free_pages: Length,
    min_free_backed_pages: Length,
    num_pages_subreleased: Length,
    num_partial_alloc_pages_subreleased: Length,
    num_hugepages_broken: HugeLength,
}

impl FillerStatsEntry {
    #[inline]
    fn at(&self, point: StatsAt) -> &FillerStats {
        &self.stats[point.index()]
    }
}

impl EpochEntry for FillerStatsEntry {
    type Update = FillerStats;

    fn nil() -> Self {
        Self {
            stats: [FillerStats::default(); STATS_AT_COUNT],
            min_free_pages: Length::MAX,
            min_free_backed_pages: Length::MAX,
            num_pages_subreleased: Length::ZERO,
            num_partial_alloc_pages_subreleased: Length::ZERO,
            num_hugepages_broken: HugeLength::ZERO,
        }
    }

    fn report(&mut self, e: FillerStats) {
        if self.empty() {
            self.stats = [e; STATS_AT_COUNT];
        }

        if e.num_pages < self.at(StatsAt::MinDemand).num_pages {
            self.stats[StatsAt::MinDemand.index()] = e;
        }
        if e.num_pages > self.at(StatsAt::MaxDemand).num_pages {
            self.stats[StatsAt::MaxDemand.index()] = e;
        }
        if e.total_huge_pages() < self.at(StatsAt::MinHugePages).total_huge_pages() {
            self.stats[StatsAt::MinHugePages.index()] = e;
        }
        if e.total_huge_pages() > self.at(StatsAt::MaxHugePages).total_huge_pages() {
            self.stats[StatsAt::MaxHugePages.index()] = e;
        }

        self.min_free_pages = self.min_free_pages.min(e.free_pages + e.unmapped_pages);
        self.min_free_backed_pages = self.min_free_backed_pages.min(e.free_pages);

        self.num_pages_subreleased += e.num_pages_subreleased;
        self.num_partial_alloc_pages_subreleased += e.num_partial_alloc_pages_subreleased;
        self.num_hugepages_broken += e.num_hugepages_broken;
    }

    fn empty(&self) -> bool {
        self.min_free_pages == Length::MAX
    }
}

/// Minimum free pages observed over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberOfFreePages {
    /// All free pages, backed or not.
    pub free: Length,
    /// Only the backed ones.
    pub free_backed: Length,
}

// =============================================================================
// FILLER STATS TRACKER
// =============================================================================

/// Tracks filler statistics over a time window.
///
/// Collects the filler's state at four "interesting points" within
/// each epoch (min/max page demand, min/max huge page count) to
/// approximate the envelope of each metric, and feeds the
/// skip-release policy and its correctness evaluation.
#[derive(Debug)]
pub struct FillerStatsTracker<const EPOCHS: usize> {
    /// Peaks within this interval evaluate skipped releases, and the
    /// realized-fragmentation summary covers it.
    summary_interval: Duration,
    window: Duration,
    epoch_length: Duration,
    tracker: TimeSeriesTracker<FillerStatsEntry, EPOCHS>,
    skipped_subrelease_correctness: SkippedSubreleaseCorrectnessTracker<EPOCHS>,
    /// Most recent skip intervals, for reporting only.
    last_skip_subrelease_intervals: SkipSubreleaseIntervals,
    last_next_peak_interval: Duration,
}

impl<const EPOCHS: usize> FillerStatsTracker<EPOCHS> {
    /// A tracker over `window` with the given summary interval.
    pub fn new(clock: Clock, window: Duration, summary_interval: Duration) -> Self {
        assert!(summary_interval <= window);
        Self {
            summary_interval,
            window,
            epoch_length: window / EPOCHS as u32,
            tracker: TimeSeriesTracker::new(clock, window),
            skipped_subrelease_correctness: SkippedSubreleaseCorrectnessTracker::new(
                clock, window,
            ),
            last_skip_subrelease_intervals: SkipSubreleaseIntervals::default(),
            last_next_peak_interval: Duration::ZERO,
        }
    }

    /// How many epochs cover `d`, capped at the window.
    #[inline]
    fn epochs_in(&self, d: Duration) -> usize {
        ((d.as_secs_f64() / self.epoch_length.as_secs_f64()) as usize).min(EPOCHS)
    }

    /// Fold one sample. When the sample closes an epoch and skipped
    /// decisions are pending, the just-finished epoch's demand peak is
    /// handed to the correctness tracker.
    pub fn report(&mut self, stats: FillerStats) {
        if self.tracker.report(stats) && self.pending_skipped().count > 0 {
            let prior_peak = self
                .tracker
                .entry_at_offset(1)
                .at(StatsAt::MaxDemand)
                .num_pages;
            self.skipped_subrelease_correctness
                .report_updated_peak(stats.num_pages.max(prior_peak));
        }
    }

    /// The maximum demand seen within the last `peak_interval`.
    pub fn get_recent_peak(&mut self, peak_interval: Duration) -> Length {
        self.last_skip_subrelease_intervals.peak_interval =
            peak_interval.min(self.epoch_length * EPOCHS as u32);
        let mut max_demand_pages = Length::ZERO;

        self.tracker
            .iter_backwards(Some(self.epochs_in(peak_interval)), |_, _, e| {
                if !e.empty() {
                    max_demand_pages = max_demand_pages.max(e.at(StatsAt::MaxDemand).num_pages);
                }
            });

        max_demand_pages
    }

    /// Demand requirement for skip-release: the sum of the largest
    /// short-term fluctuation (max minus min demand within
    /// `short_interval`) and the long-term trend (largest minimum
    /// demand within `long_interval`), capped at the largest demand
    /// peak in the whole window so a synthetic sum cannot exceed
    /// anything ever observed.
    pub fn get_recent_demand(&mut self, short_interval: Duration, long_interval: Duration) -> Length {
        if short_interval != Duration::ZERO && long_interval != Duration::ZERO {
            assert!(short_interval <= long_interval);
        }
        let max_window = self.epoch_length * EPOCHS as u32;
        self.last_skip_subrelease_intervals.short_interval = short_interval.min(max_window);
        self.last_skip_subrelease_intervals.long_interval = long_interval.min(max_window);

        let mut short_term_fluctuation = Length::ZERO;
        let mut long_term_trend = Length::ZERO;

        self.tracker
            .iter_backwards(Some(self.epochs_in(short_interval)), |_, _, e| {
                if !e.empty() {
                    let diff =
                        e.at(StatsAt::MaxDemand).num_pages - e.at(StatsAt::MinDemand).num_pages;
                    short_term_fluctuation = short_term_fluctuation.max(diff);
                }
            });
        self.tracker
            .iter_backwards(Some(self.epochs_in(long_interval)), |_, _, e| {
                if !e.empty() {
                    long_term_trend = long_term_trend.max(e.at(StatsAt::MinDemand).num_pages);
                }
            });

        let mut demand_peak = Length::ZERO;
        self.tracker.iter_backwards(None, |_, _, e| {
            if !e.empty() {
                demand_peak = demand_peak.max(e.at(StatsAt::MaxDemand).num_pages);
            }
        });

        demand_peak.min(short_term_fluctuation + long_term_trend)
    }

    /// Record a skipped release evaluated over the summary interval.
    pub fn report_skipped_subrelease_pages(&mut self, pages: Length, peak_pages: Length) {
        self.report_skipped_subrelease_pages_over(pages, peak_pages, self.summary_interval);
    }

    /// Record a skipped release evaluated over a caller-chosen
    /// interval.
    pub fn report_skipped_subrelease_pages_over(
        &mut self,
        pages: Length,
        peak_pages: Length,
        next_peak_interval: Duration,
    ) {
        if pages == Length::ZERO {
            return;
        }
        self.last_next_peak_interval = next_peak_interval;
        self.skipped_subrelease_correctness.report_skipped_subrelease_pages(
            pages,
            peak_pages,
            next_peak_interval,
        );
    }

    /// Everything ever skipped.
    #[inline]
    pub fn total_skipped(&self) -> SkippedSubreleaseDecision {
        self.skipped_subrelease_correctness.total_skipped()
    }

    /// Skips confirmed correct by later peaks.
    #[inline]
    pub fn correctly_skipped(&self) -> SkippedSubreleaseDecision {
        self.skipped_subrelease_correctness.correctly_skipped()
    }

    /// Skips still awaiting confirmation.
    #[inline]
    pub fn pending_skipped(&self) -> SkippedSubreleaseDecision {
        self.skipped_subrelease_correctness.pending_skipped()
    }

    /// Minimum free pages throughout the last `w`.
    pub fn min_free_pages(&self, w: Duration) -> NumberOfFreePages {
        let mut mins = NumberOfFreePages {
            free: Length::MAX,
            free_backed: Length::MAX,
        };

        self.tracker
            .iter_backwards(Some(self.epochs_in(w)), |_, _, e| {
                if !e.empty() {
                    mins.free = mins.free.min(e.min_free_pages);
                    mins.free_backed = mins.free_backed.min(e.min_free_backed_pages);
                }
            });

        if mins.free == Length::MAX {
            mins.free = Length::ZERO;
        }
        if mins.free_backed == Length::MAX {
            mins.free_backed = Length::ZERO;
        }
        mins
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    /// Append the human-readable time-series summary.
    pub fn print(&self, out: &mut Printer<'_>) {
        let free_pages = self.min_free_pages(self.summary_interval);
        out.print(format_args!(
            "HugePageFiller: time series over {} min interval\n\n",
            self.summary_interval.as_secs() / 60
        ));

        // Realized fragmentation is equivalent to backed minimum free
        // pages over the summary interval.
        out.print(format_args!(
            "HugePageFiller: realized fragmentation: {:.1} MiB\n",
            free_pages.free_backed.in_mib()
        ));
        out.print(format_args!(
            "HugePageFiller: minimum free pages: {} ({} backed)\n",
            free_pages.free, free_pages.free_backed
        ));

        let mut at_peak_demand: Option<FillerStatsEntry> = None;
        let mut at_peak_hps: Option<FillerStatsEntry> = None;

        self.tracker
            .iter_backwards(Some(self.epochs_in(self.summary_interval)), |_, _, e| {
                if e.empty() {
                    return;
                }
                if at_peak_demand.as_ref().map_or(true, |best| {
                    best.at(StatsAt::MaxDemand).num_pages < e.at(StatsAt::MaxDemand).num_pages
                }) {
                    at_peak_demand = Some(e.clone());
                }
                if at_peak_hps.as_ref().map_or(true, |best| {
                    best.at(StatsAt::MaxHugePages).total_huge_pages()
                        < e.at(StatsAt::MaxHugePages).total_huge_pages()
                }) {
                    at_peak_hps = Some(e.clone());
                }
            });

        for (label, entry) in [("peak demand", at_peak_demand), ("peak hps", at_peak_hps)] {
            let Some(e) = entry else { continue };
            let s = e.at(StatsAt::MaxDemand);
            out.print(format_args!(
                "HugePageFiller: at {label}: {} pages (and {} free, {} unmapped)\n",
                s.num_pages, s.free_pages, s.unmapped_pages
            ));
            out.print(format_args!(
                "HugePageFiller: at {label}: {} hps ({} regular, {} donated, {} partial, {} released)\n",
                s.total_huge_pages(),
                s.huge_pages[HugePageType::Regular.index()],
                s.huge_pages[HugePageType::Donated.index()],
                s.huge_pages[HugePageType::PartialReleased.index()],
                s.huge_pages[HugePageType::Released.index()]
            ));
        }

        out.print(format_args!(
            "\nHugePageFiller: Since the start of the execution, {} subreleases ({} pages) were skipped due to either recent ({}s) peaks, or the sum of short-term ({}s) fluctuations and long-term ({}s) trends.\n",
            self.total_skipped().count,
            self.total_skipped().pages,
            self.last_skip_subrelease_intervals.peak_interval.as_secs(),
            self.last_skip_subrelease_intervals.short_interval.as_secs(),
            self.last_skip_subrelease_intervals.long_interval.as_secs()
        ));

        let skipped_pages = self.total_skipped().pages - self.pending_skipped().pages;
        let correctly_skipped_pages_pct =
            100.0 * safe_div(self.correctly_skipped().pages, skipped_pages);
        let skipped_count = self.total_skipped().count - self.pending_skipped().count;
        let correctly_skipped_count_pct = if skipped_count == 0 {
            0.0
        } else {
            100.0 * self.correctly_skipped().count as f64 / skipped_count as f64
        };

        out.print(format_args!(
            "HugePageFiller: {:.4}% of decisions confirmed correct, {} pending ({:.4}% of pages, {} pending), as per anticipated {}s realized fragmentation.\n",
            correctly_skipped_count_pct,
            self.pending_skipped().count,
            correctly_skipped_pages_pct,
            self.pending_skipped().pages,
            self.last_next_peak_interval.as_secs()
        ));

        // Release history over the whole window.
        let mut total_subreleased = Length::ZERO;
        let mut total_partial = Length::ZERO;
        let mut total_broken = HugeLength::ZERO;
        self.tracker.iter(true, |_, _, e| {
            total_subreleased += e.num_pages_subreleased;
            total_partial += e.num_partial_alloc_pages_subreleased;
            total_broken += e.num_hugepages_broken;
        });
        out.print(format_args!(
            "HugePageFiller: Subrelease stats last {} min: total {} pages subreleased ({} pages from partial allocs), {} hugepages broken\n",
            self.window.as_secs() / 60,
            total_subreleased,
            total_partial,
            total_broken
        ));
    }

    /// Emit the skip-release and time-series sub-regions.
    pub fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) {
        {
            let mut skip = hpaa.sub_region("filler_skipped_subrelease");
            skip.print_i64(
                "skipped_subrelease_interval_ms",
                self.last_skip_subrelease_intervals.peak_interval.as_millis() as i64,
            );
            skip.print_i64(
                "skipped_subrelease_short_interval_ms",
                self.last_skip_subrelease_intervals.short_interval.as_millis() as i64,
            );
            skip.print_i64(
                "skipped_subrelease_long_interval_ms",
                self.last_skip_subrelease_intervals.long_interval.as_millis() as i64,
            );
            skip.print_i64(
                "skipped_subrelease_pages",
                self.total_skipped().pages.raw() as i64,
            );
            skip.print_i64(
                "correctly_skipped_subrelease_pages",
                self.correctly_skipped().pages.raw() as i64,
            );
            skip.print_i64(
                "pending_skipped_subrelease_pages",
                self.pending_skipped().pages.raw() as i64,
            );
            skip.print_i64("skipped_subrelease_count", self.total_skipped().count as i64);
            skip.print_i64(
                "correctly_skipped_subrelease_count",
                self.correctly_skipped().count as i64,
            );
            skip.print_i64(
                "pending_skipped_subrelease_count",
                self.pending_skipped().count as i64,
            );
            skip.print_i64(
                "next_peak_interval_ms",
                self.last_next_peak_interval.as_millis() as i64,
            );
        }

        let mut filler_stats = hpaa.sub_region("filler_stats_timeseries");
        filler_stats.print_i64("window_ms", self.epoch_length.as_millis() as i64);
        filler_stats.print_i64("epochs", EPOCHS as i64);

        let free_pages = self.min_free_pages(self.summary_interval);
        filler_stats.print_i64(
            "min_free_pages_interval_ms",
            self.summary_interval.as_millis() as i64,
        );
        filler_stats.print_i64("min_free_pages", free_pages.free.raw() as i64);
        filler_stats.print_i64("min_free_backed_pages", free_pages.free_backed.raw() as i64);

        let tracker = &self.tracker;
        tracker.iter(true, |offset, ts, e| {
            let mut region = filler_stats.sub_region("measurements");
            region.print_i64("epoch", offset as i64);
            region.print_i64("timestamp_ms", tracker.ticks_to_ms(ts));
            region.print_i64("min_free_pages", e.min_free_pages.raw() as i64);
            region.print_i64(
                "min_free_backed_pages",
                e.min_free_backed_pages.raw() as i64,
            );
            region.print_i64(
                "num_pages_subreleased",
                e.num_pages_subreleased.raw() as i64,
            );
            region.print_i64("num_hugepages_broken", e.num_hugepages_broken.raw() as i64);
            region.print_i64(
                "partial_alloc_pages_subreleased",
                e.num_partial_alloc_pages_subreleased.raw() as i64,
            );
            for (i, label) in STATS_AT_LABELS.iter().enumerate() {
                let mut m = region.sub_region(label);
                let stats = &e.stats[i];
                m.print_i64("num_pages", stats.num_pages.raw() as i64);
                m.print_i64(
                    "regular_huge_pages",
                    stats.huge_pages[HugePageType::Regular.index()].raw() as i64,
                );
                m.print_i64(
                    "donated_huge_pages",
                    stats.huge_pages[HugePageType::Donated.index()].raw() as i64,
                );
                m.print_i64(
                    "partial_released_huge_pages",
                    stats.huge_pages[HugePageType::PartialReleased.index()].raw() as i64,
                );
                m.print_i64(
                    "released_huge_pages",
                    stats.huge_pages[HugePageType::Released.index()].raw() as i64,
                );
                m.print_i64(
                    "used_pages_in_subreleased_huge_pages",
                    stats.used_pages_in_subreleased_huge_pages.raw() as i64,
                );
            }
        });
    }
}
