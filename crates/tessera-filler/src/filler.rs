//! The huge page filler: dense placement of small runs onto huge
//! pages, and the adaptive release policy.

use alloc::collections::BinaryHeap;
use core::cmp::Ordering;
use core::time::Duration;

use tessera_core::{
    safe_div, AccessDensity, AllocInfo, Clock, HugeLength, Length, PageId, Unback,
    DENSITY_COUNT, PAGES_PER_HUGE_PAGE,
};

use crate::lists::{HintedTrackerLists, TrackerArena, TrackerId};
use crate::report::{PbtxtRegion, Printer};
use crate::stats::{
    BackingStats, FillerStats, FillerStatsTracker, HugePageType, LargeSpanStats,
    SkipSubreleaseIntervals, SmallSpanStats, SubreleaseStats,
};
use crate::tracker::PageTracker;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Maximum chunks a longest-free bucket is subdivided into.
pub const CHUNKS: usize = 16;

/// Candidate huge pages examined per release iteration.
pub const CANDIDATES_FOR_RELEASING_MEMORY: usize = PAGES_PER_HUGE_PAGE;

/// Fraction of free pages in partially-released huge pages targeted
/// when partial-alloc release is requested.
pub const PARTIAL_ALLOC_PAGES_RELEASE: f64 = 0.1;

/// Epochs of the filler time series.
const STATS_EPOCHS: usize = 600;

/// Window of the filler time series.
const STATS_WINDOW: Duration = Duration::from_secs(600);

/// Summary interval for realized fragmentation and skip evaluation.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(300);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Whether sparse and dense spans share placement tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocsOption {
    /// Same tables for sparse and dense spans.
    UnifiedAllocs,
    /// Separate tables for sparse and dense spans.
    SeparateAllocs,
}

/// Construction-time configuration of the filler.
#[derive(Debug, Clone, Copy)]
pub struct FillerConfig {
    /// Sparse/dense table layout.
    pub allocs_option: AllocsOption,
    /// Chunks each longest-free bucket is subdivided into, by
    /// quantized allocation count. Must be in `1..=CHUNKS`.
    pub chunks_per_alloc: usize,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            allocs_option: AllocsOption::SeparateAllocs,
            chunks_per_alloc: 8,
        }
    }
}

/// Huge page counts per tracker class.
///
/// Each array is indexed by density, with one extra slot for the
/// sparse + dense sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct HugePageFillerStats {
    /// Huge pages in the fully-released tables.
    pub n_fully_released: [HugeLength; DENSITY_COUNT + 1],
    /// Huge pages in the partially-released tables.
    pub n_partial_released: [HugeLength; DENSITY_COUNT + 1],
    /// Fully or partially released huge pages.
    pub n_released: [HugeLength; DENSITY_COUNT + 1],
    /// All huge pages of a density.
    pub n_total: [HugeLength; DENSITY_COUNT + 1],
    /// Huge pages with no free pages left.
    pub n_full: [HugeLength; DENSITY_COUNT + 1],
    /// Partially allocated, not released huge pages.
    pub n_partial: [HugeLength; DENSITY_COUNT + 1],
}

/// Successful placement from [`HugePageFiller::try_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryGetResult {
    /// The tracker hosting the run.
    pub tracker: TrackerId,
    /// First page of the run.
    pub page: PageId,
    /// True if the run touches pages that were released to the OS.
    pub from_released: bool,
}

// =============================================================================
// RELEASE CANDIDATES
// =============================================================================

/// Release ordering: fewer used pages first, dense spans last.
///
/// `Ord` is arranged so the "greatest" candidate is the worst one to
/// release from, which makes a max-heap a bounded best-K queue.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    used: Length,
    dense: bool,
    id: TrackerId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.used == other.used && self.dense == other.dense
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.used
            .cmp(&other.used)
            .then(self.dense.cmp(&other.dense))
    }
}

// =============================================================================
// HUGE PAGE FILLER
// =============================================================================

/// Tracks a set of unfilled huge pages and fulfills allocations with
/// the goal of filling some huge pages as tightly as possible while
/// emptying out the remainder.
///
/// The API is deliberately a "try": on failure the caller obtains a
/// fresh huge page upstream and contributes it. All entry points
/// assume the caller's page-heap lock is held.
#[derive(Debug)]
pub struct HugePageFiller<U: Unback> {
    arena: TrackerArena,

    /// Huge pages from which nothing has been released, keyed by
    /// longest free run and quantized allocation count.
    regular_alloc: [HintedTrackerLists; DENSITY_COUNT],
    /// Freshly donated tails of multi-huge-page allocations, keyed by
    /// longest free run. Sparse placements only.
    donated_alloc: HintedTrackerLists,
    /// Partially released huge pages: some free pages backed, some
    /// returned to the OS.
    regular_alloc_partial_released: [HintedTrackerLists; DENSITY_COUNT],
    /// Fully released huge pages: every free page is returned.
    regular_alloc_released: [HintedTrackerLists; DENSITY_COUNT],

    /// Allocated pages on huge pages in the released tables.
    n_used_released: [Length; DENSITY_COUNT],
    /// Allocated pages on huge pages in the partially-released tables.
    n_used_partial_released: [Length; DENSITY_COUNT],
    /// Huge pages that went from fully released back to fully backed.
    n_was_released: [HugeLength; DENSITY_COUNT],

    pages_allocated: [Length; DENSITY_COUNT],
    size: HugeLength,
    unmapped: Length,
    /// Pages eagerly unmapped (whole huge pages on free) but not yet
    /// claimed by a release request.
    unmapping_unaccounted: Length,

    chunks_per_alloc: usize,
    allocs_option: AllocsOption,

    subrelease_stats: SubreleaseStats,
    stats_tracker: FillerStatsTracker<STATS_EPOCHS>,
    unback: U,
}

impl<U: Unback> HugePageFiller<U> {
    /// A filler driven by `clock`, releasing memory through `unback`.
    pub fn new(clock: Clock, config: FillerConfig, unback: U) -> Self {
        assert!(config.chunks_per_alloc > 0 && config.chunks_per_alloc <= CHUNKS);
        // One bucket per longest-free value, including the entirely
        // free case, subdivided by allocation-count chunk.
        let regular_lists = (PAGES_PER_HUGE_PAGE + 1) * config.chunks_per_alloc;
        let donated_lists = PAGES_PER_HUGE_PAGE + 1;
        Self {
            arena: TrackerArena::new(),
            regular_alloc: [
                HintedTrackerLists::new(regular_lists),
                HintedTrackerLists::new(regular_lists),
            ],
            donated_alloc: HintedTrackerLists::new(donated_lists),
            regular_alloc_partial_released: [
                HintedTrackerLists::new(regular_lists),
                HintedTrackerLists::new(regular_lists),
            ],
            regular_alloc_released: [
                HintedTrackerLists::new(regular_lists),
                HintedTrackerLists::new(regular_lists),
            ],
            n_used_released: [Length::ZERO; DENSITY_COUNT],
            n_used_partial_released: [Length::ZERO; DENSITY_COUNT],
            n_was_released: [HugeLength::ZERO; DENSITY_COUNT],
            pages_allocated: [Length::ZERO; DENSITY_COUNT],
            size: HugeLength::ZERO,
            unmapped: Length::ZERO,
            unmapping_unaccounted: Length::ZERO,
            chunks_per_alloc: config.chunks_per_alloc,
            allocs_option: config.allocs_option,
            subrelease_stats: SubreleaseStats::default(),
            stats_tracker: FillerStatsTracker::new(clock, STATS_WINDOW, SUMMARY_INTERVAL),
            unback,
        }
    }

    /// Huge pages under management.
    #[inline]
    pub fn size(&self) -> HugeLength {
        self.size
    }

    /// Borrow a tracker. The handle must be live.
    #[inline]
    pub fn tracker(&self, id: TrackerId) -> &PageTracker {
        &self.arena[id]
    }

    // =========================================================================
    // PLACEMENT
    // =========================================================================

    /// Find `n` contiguous pages on an existing huge page.
    ///
    /// Selection prefers, in order: regular huge pages, donated ones
    /// (sparse only), partially released, fully released. Within a
    /// table, the shortest longest-free run that still fits wins;
    /// ties go to huge pages with more live allocations. Returns
    /// `None` when nothing fits; the caller should obtain a new huge
    /// page and [`contribute`](Self::contribute) it.
    pub fn try_get(&mut self, n: Length, info: AllocInfo) -> Option<TryGetResult> {
        assert!(n > Length::ZERO);
        debug_assert!(n.raw() < PAGES_PER_HUGE_PAGE);

        let density = self.density_for(info.density);
        let ti = density.index();
        let mut was_released = false;

        // The tables are ordered so the first non-empty list at or
        // after the fit hint is the best choice; later lists can
        // always satisfy what earlier ones could.
        let id = if let Some((id, li)) = self.regular_alloc[ti].get_least(self.list_for(n, 0)) {
            debug_assert!(!self.arena[id].donated());
            self.regular_alloc[ti].remove(&mut self.arena, id, li);
            id
        } else if let Some((id, li)) = (density == AccessDensity::Sparse)
            .then(|| self.donated_alloc.get_least(n.raw()))
            .flatten()
        {
            self.donated_alloc.remove(&mut self.arena, id, li);
            id
        } else if let Some((id, li)) =
            self.regular_alloc_partial_released[ti].get_least(self.list_for(n, 0))
        {
            debug_assert!(!self.arena[id].donated());
            was_released = true;
            let used = self.arena[id].used_pages();
            debug_assert!(self.n_used_partial_released[ti] >= used);
            self.n_used_partial_released[ti] -= used;
            self.regular_alloc_partial_released[ti].remove(&mut self.arena, id, li);
            id
        } else if let Some((id, li)) =
            self.regular_alloc_released[ti].get_least(self.list_for(n, 0))
        {
            debug_assert!(!self.arena[id].donated());
            was_released = true;
            let used = self.arena[id].used_pages();
            debug_assert!(self.n_used_released[ti] >= used);
            self.n_used_released[ti] -= used;
            self.regular_alloc_released[ti].remove(&mut self.arena, id, li);
            id
        } else {
            return None;
        };

        debug_assert!(self.arena[id].longest_free_range() >= n);
        // A dense-table hit implies the tracker itself is dense; this
        // also rules out donated trackers on the dense path.
        debug_assert!(density == AccessDensity::Sparse || self.arena[id].has_dense_spans());

        let page_allocation = self.arena[id].get(n);
        self.add_to_filler_list(id);
        self.pages_allocated[ti] += n;

        // If it was in a released state earlier and is fully backed
        // again, note the transition once.
        if was_released && !self.arena[id].released() && !self.arena[id].was_released() {
            self.arena[id].set_was_released(true);
            self.n_was_released[ti] += HugeLength(1);
        }

        debug_assert!(was_released || page_allocation.previously_unbacked == Length::ZERO);
        debug_assert!(self.unmapped >= page_allocation.previously_unbacked);
        self.unmapped -= page_allocation.previously_unbacked;
        debug_assert!(!self.arena[id].donated());
        self.update_stats_tracker();

        Some(TryGetResult {
            tracker: id,
            page: page_allocation.page,
            from_released: was_released,
        })
    }

    /// Return `[p, p + n)` to the tracker.
    ///
    /// When the huge page becomes entirely free the tracker is handed
    /// back to the caller; a partially-released one is fully unbacked
    /// first so upper layers keep working in whole huge pages.
    pub fn put(&mut self, id: TrackerId, p: PageId, n: Length) -> Option<PageTracker> {
        self.remove_from_filler_list(id);
        self.arena[id].put(p, n);

        let ti = if self.arena[id].has_dense_spans() {
            AccessDensity::Dense.index()
        } else {
            AccessDensity::Sparse.index()
        };
        debug_assert!(self.pages_allocated[ti] >= n);
        self.pages_allocated[ti] -= n;

        if self.arena[id].longest_free_range() == Length(PAGES_PER_HUGE_PAGE) {
            debug_assert_eq!(self.arena[id].nallocs(), 0);
            self.size -= HugeLength(1);

            if self.arena[id].released() {
                let free_pages = self.arena[id].free_pages();
                let released_pages = self.arena[id].released_pages();
                debug_assert!(free_pages >= released_pages);
                debug_assert!(self.unmapped >= released_pages);
                self.unmapped -= released_pages;

                if free_pages > released_pages {
                    // Unback the remainder of the huge page. The
                    // filler's state is already consistent, so the
                    // primitive may block here.
                    let location = self.arena[id].location();
                    match self.unback.unback(location.page_range()) {
                        Ok(()) => {
                            self.unmapping_unaccounted += free_pages - released_pages;
                        }
                        Err(_) => {
                            log::warn!(
                                "HugePageFiller: failed to unback emptied huge page {:?}",
                                location
                            );
                        }
                    }
                }
            }

            if self.arena[id].was_released() {
                self.arena[id].set_was_released(false);
                let di = if self.arena[id].has_dense_spans() {
                    AccessDensity::Dense.index()
                } else {
                    AccessDensity::Sparse.index()
                };
                self.n_was_released[di] -= HugeLength(1);
            }

            self.update_stats_tracker();
            return Some(self.arena.remove(id));
        }

        self.add_to_filler_list(id);
        self.update_stats_tracker();
        None
    }

    /// Hand a tracker to the filler. A donated tracker came from the
    /// tail of a multi-huge-page allocation and is kept at the lowest
    /// placement priority so it may yet be reassembled. Contributing
    /// released trackers is not permitted.
    pub fn contribute(&mut self, pt: PageTracker, donated: bool, info: AllocInfo) -> TrackerId {
        assert_eq!(pt.released_pages(), Length::ZERO);

        let density = self.density_for(info.density);
        let ti = density.index();
        self.pages_allocated[ti] += pt.used_pages();
        debug_assert!(!(density == AccessDensity::Dense && donated));

        let id = self.arena.insert(pt);
        if donated {
            debug_assert!(self.arena[id].was_donated());
            self.donate_to_filler_list(id);
        } else {
            if density == AccessDensity::Dense {
                self.arena[id].set_has_dense_spans();
            }
            self.add_to_filler_list(id);
        }

        self.size += HugeLength(1);
        self.update_stats_tracker();
        id
    }

    // =========================================================================
    // STATISTICS QUERIES
    // =========================================================================

    /// Pages allocated for one density class.
    #[inline]
    pub fn pages_allocated_for(&self, density: AccessDensity) -> Length {
        self.pages_allocated[density.index()]
    }

    /// Pages allocated across both density classes.
    #[inline]
    pub fn pages_allocated(&self) -> Length {
        self.pages_allocated[0] + self.pages_allocated[1]
    }

    /// Alias for [`pages_allocated`](Self::pages_allocated).
    #[inline]
    pub fn used_pages(&self) -> Length {
        self.pages_allocated()
    }

    /// Pages returned to the OS.
    #[inline]
    pub fn unmapped_pages(&self) -> Length {
        self.unmapped
    }

    /// Backed free pages.
    pub fn free_pages(&self) -> Length {
        self.size.in_pages() - self.used_pages() - self.unmapped
    }

    /// Allocated pages on fully-released huge pages.
    pub fn used_pages_in_released(&self) -> Length {
        debug_assert!(
            self.n_used_released[0]
                <= HugeLength(self.regular_alloc_released[0].size()).in_pages()
        );
        debug_assert!(
            self.n_used_released[1]
                <= HugeLength(self.regular_alloc_released[1].size()).in_pages()
        );
        self.n_used_released[0] + self.n_used_released[1]
    }

    /// Allocated pages on partially-released huge pages.
    pub fn used_pages_in_partial_released(&self) -> Length {
        debug_assert!(
            self.n_used_partial_released[0]
                <= HugeLength(self.regular_alloc_partial_released[0].size()).in_pages()
        );
        debug_assert!(
            self.n_used_partial_released[1]
                <= HugeLength(self.regular_alloc_partial_released[1].size()).in_pages()
        );
        self.n_used_partial_released[0] + self.n_used_partial_released[1]
    }

    /// Allocated pages on any subreleased huge page.
    pub fn used_pages_in_any_subreleased(&self) -> Length {
        self.used_pages_in_released() + self.used_pages_in_partial_released()
    }

    /// Huge pages that were fully released and later refilled.
    pub fn previously_released_huge_pages(&self) -> HugeLength {
        self.n_was_released[0] + self.n_was_released[1]
    }

    /// Free pages on huge pages in the released tables.
    pub fn free_pages_in_partial_allocs(&self) -> Length {
        let list_pages = HugeLength(
            self.regular_alloc_partial_released[0].size()
                + self.regular_alloc_partial_released[1].size()
                + self.regular_alloc_released[0].size()
                + self.regular_alloc_released[1].size(),
        )
        .in_pages();
        list_pages - self.used_pages_in_any_subreleased() - self.unmapped
    }

    /// Fraction of live memory on intact (never-subreleased) huge
    /// pages.
    pub fn hugepage_frac(&self) -> f64 {
        let used = self.used_pages();
        let used_on_released = self.used_pages_in_any_subreleased();
        debug_assert!(used >= used_on_released);
        let used_on_huge = used.saturating_sub(used_on_released);

        let denom = if used > Length::ZERO { used } else { Length(1) };
        let frac = safe_div(used_on_huge, denom);
        debug_assert!((0.0..=1.0).contains(&frac));
        frac.clamp(0.0, 1.0)
    }

    /// Byte-level summary.
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.size.in_bytes(),
            free_bytes: self.free_pages().in_bytes(),
            unmapped_bytes: self.unmapped_pages().in_bytes(),
        }
    }

    /// Release accounting snapshot.
    #[inline]
    pub fn subrelease_stats(&self) -> &SubreleaseStats {
        &self.subrelease_stats
    }

    /// Skipped-release decision totals, for tests and reporting.
    #[inline]
    pub fn stats_tracker(&self) -> &FillerStatsTracker<STATS_EPOCHS> {
        &self.stats_tracker
    }

    /// Huge page counts per tracker class.
    pub fn get_stats(&self) -> HugePageFillerStats {
        let mut stats = HugePageFillerStats::default();

        // Full lists are exactly the zero-longest-free buckets.
        for chunk in 0..self.chunks_per_alloc {
            let i = self.list_for(Length::ZERO, chunk);
            stats.n_full[0] += HugeLength(self.regular_alloc[0].list_len(i));
            stats.n_full[1] += HugeLength(self.regular_alloc[1].list_len(i));
        }
        stats.n_full[DENSITY_COUNT] = stats.n_full[0] + stats.n_full[1];

        // Donated allocs are only used for sparse placements.
        stats.n_total[AccessDensity::Sparse.index()] = HugeLength(self.donated_alloc.size());
        for ti in 0..DENSITY_COUNT {
            stats.n_fully_released[ti] = HugeLength(self.regular_alloc_released[ti].size());
            stats.n_partial_released[ti] =
                HugeLength(self.regular_alloc_partial_released[ti].size());
            stats.n_released[ti] = stats.n_fully_released[ti] + stats.n_partial_released[ti];
            stats.n_total[ti] += stats.n_released[ti] + HugeLength(self.regular_alloc[ti].size());
            stats.n_partial[ti] = stats.n_total[ti] - stats.n_released[ti] - stats.n_full[ti];
        }

        stats.n_fully_released[DENSITY_COUNT] =
            stats.n_fully_released[0] + stats.n_fully_released[1];
        stats.n_partial_released[DENSITY_COUNT] =
            stats.n_partial_released[0] + stats.n_partial_released[1];
        stats.n_released[DENSITY_COUNT] = stats.n_released[0] + stats.n_released[1];
        stats.n_total[DENSITY_COUNT] = self.size;
        stats.n_partial[DENSITY_COUNT] =
            self.size - stats.n_released[DENSITY_COUNT] - stats.n_full[DENSITY_COUNT];
        stats
    }

    /// Accumulate free-span histograms across every tracker.
    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        // The first chunks_per_alloc regular lists are known full.
        self.donated_alloc.iter(&self.arena, 0, |id| {
            self.arena[id].add_span_stats(small.as_deref_mut(), large.as_deref_mut());
        });
        for ti in 0..DENSITY_COUNT {
            self.regular_alloc[ti].iter(&self.arena, self.chunks_per_alloc, |id| {
                self.arena[id].add_span_stats(small.as_deref_mut(), large.as_deref_mut());
            });
            self.regular_alloc_partial_released[ti].iter(&self.arena, 0, |id| {
                self.arena[id].add_span_stats(small.as_deref_mut(), large.as_deref_mut());
            });
            self.regular_alloc_released[ti].iter(&self.arena, 0, |id| {
                self.arena[id].add_span_stats(small.as_deref_mut(), large.as_deref_mut());
            });
        }
    }

    // =========================================================================
    // RELEASE
    // =========================================================================

    /// How much of `desired` remains after the skip-release policy.
    ///
    /// We do not release pages if that would push the mapped total
    /// under either the recent demand peak or the sum of short-term
    /// fluctuation and long-term trend. Note the subtlety: current
    /// *mapped* pages are compared against recent *demand*, so a large
    /// free surplus is still released when demand sits below the
    /// requirement.
    pub fn get_desired_subrelease_pages(
        &mut self,
        desired: Length,
        total_released: Length,
        intervals: SkipSubreleaseIntervals,
    ) -> Length {
        debug_assert!(total_released < desired);
        if !intervals.enabled() {
            return desired;
        }
        self.update_stats_tracker();

        let required_pages = if intervals.is_peak_interval_set() {
            self.stats_tracker.get_recent_peak(intervals.peak_interval)
        } else {
            self.stats_tracker
                .get_recent_demand(intervals.short_interval, intervals.long_interval)
        };

        let current_pages = self.used_pages() + self.free_pages();

        if required_pages == Length::ZERO {
            return desired;
        }

        let new_desired = if required_pages >= current_pages {
            total_released
        } else {
            total_released + (current_pages - required_pages)
        };
        if new_desired >= desired {
            return desired;
        }

        // The remaining target after skipping should not exceed the
        // free pages; compute against the minimum to avoid relying on
        // the peak always covering used pages.
        let releasable_pages = self.free_pages().min(new_desired - total_released);
        let skipped_pages =
            (self.free_pages() - releasable_pages).min(desired - new_desired);
        self.stats_tracker.report_skipped_subrelease_pages(
            skipped_pages,
            current_pages.min(required_pages),
        );
        log::debug!(
            "HugePageFiller: skip-release kept {} pages mapped (required {})",
            skipped_pages,
            required_pages
        );
        new_desired
    }

    /// Release up to `desired` pages, emptiest huge pages first.
    ///
    /// The target may be raised to cover free pages on
    /// partially-released huge pages, reduced by the skip policy
    /// (unless the memory limit was hit), and overshot when eager
    /// whole-huge-page unmaps are claimed. Returns pages released.
    pub fn release_pages(
        &mut self,
        mut desired: Length,
        intervals: SkipSubreleaseIntervals,
        release_partial_alloc_pages: bool,
        hit_limit: bool,
    ) -> Length {
        let mut total_released = Length::ZERO;

        let release_all_from_partial_allocs = release_partial_alloc_pages && !hit_limit;
        if release_all_from_partial_allocs {
            let from_partial = ceil_fraction(
                self.free_pages_in_partial_allocs().raw(),
                PARTIAL_ALLOC_PAGES_RELEASE,
            );
            desired = desired.max(Length(from_partial));
        }

        // Claim credit for eager unmaps performed on free.
        if self.unmapping_unaccounted > Length::ZERO {
            let n = self.unmapping_unaccounted;
            self.unmapping_unaccounted = Length::ZERO;
            self.subrelease_stats.num_pages_subreleased += n;
            total_released += n;
        }

        if total_released >= desired {
            return total_released;
        }

        // When the limit was hit, release everything asked for: an
        // out-of-memory condition may be imminent.
        if intervals.enabled() && !hit_limit {
            desired = self.get_desired_subrelease_pages(desired, total_released, intervals);
            if desired <= total_released {
                return total_released;
            }
        }

        self.subrelease_stats.set_limit_hit(hit_limit);

        // First pass: huge pages that already lost part of their free
        // pages to the OS. The fully-released tables hold nothing
        // releasable.
        while total_released < desired {
            let mut heap = BinaryHeap::new();
            self.select_candidates(&mut heap, 0, self.chunks_per_alloc);
            let released =
                self.release_candidates(heap, desired - total_released);
            self.subrelease_stats.num_partial_alloc_pages_subreleased += released;
            if released == Length::ZERO {
                break;
            }
            total_released += released;
        }

        // Second pass: break up intact huge pages, sparse first (they
        // are expected to empty sooner), donated last.
        while total_released < desired {
            let mut heap = BinaryHeap::new();
            self.select_candidates(&mut heap, 1, self.chunks_per_alloc);
            let released =
                self.release_candidates(heap, desired - total_released);
            if released == Length::ZERO {
                break;
            }
            total_released += released;
        }

        total_released
    }

    /// Gather up to [`CANDIDATES_FOR_RELEASING_MEMORY`] release
    /// candidates. Pass 0 draws from the partially-released tables,
    /// pass 1 from the regular and donated tables.
    fn select_candidates(&self, heap: &mut BinaryHeap<Candidate>, pass: usize, start: usize) {
        let arena = &self.arena;
        let mut push = |id: TrackerId| {
            let pt = &arena[id];
            debug_assert!(pt.free_pages() > Length::ZERO);
            debug_assert!(pt.free_pages() > pt.released_pages());
            let cand = Candidate {
                used: pt.used_pages(),
                dense: pt.has_dense_spans(),
                id,
            };
            if heap.len() < CANDIDATES_FOR_RELEASING_MEMORY {
                heap.push(cand);
            } else if let Some(worst) = heap.peek() {
                if cand < *worst {
                    heap.pop();
                    heap.push(cand);
                }
            }
        };

        if pass == 0 {
            self.regular_alloc_partial_released[0].iter(arena, start, &mut push);
            self.regular_alloc_partial_released[1].iter(arena, start, &mut push);
        } else {
            self.regular_alloc[0].iter(arena, start, &mut push);
            self.regular_alloc[1].iter(arena, start, &mut push);
            self.donated_alloc.iter(arena, 0, &mut push);
        }
    }

    /// Release from the candidates, emptiest first, until `target`
    /// pages have come back. Returns pages released.
    fn release_candidates(&mut self, heap: BinaryHeap<Candidate>, target: Length) -> Length {
        let candidates = heap.into_sorted_vec();

        let mut total_released = Length::ZERO;
        let mut total_broken = HugeLength::ZERO;
        #[cfg(debug_assertions)]
        let mut last = Length::ZERO;

        for cand in candidates {
            if total_released >= target {
                break;
            }
            let id = cand.id;
            debug_assert!(self.arena[id].free_pages() > Length::ZERO);
            debug_assert!(self.arena[id].free_pages() > self.arena[id].released_pages());
            #[cfg(debug_assertions)]
            {
                // The sort produced a non-decreasing used-page order.
                debug_assert!(last <= self.arena[id].used_pages());
                last = self.arena[id].used_pages();
            }

            if self.arena[id].unbroken() {
                total_broken += HugeLength(1);
            }
            self.remove_from_filler_list(id);
            let ret = self.arena[id].release_free(&mut self.unback);
            self.unmapped += ret;
            debug_assert!(self.unmapped >= self.arena[id].released_pages());
            total_released += ret;
            self.add_to_filler_list(id);
        }

        self.subrelease_stats.num_pages_subreleased += total_released;
        self.subrelease_stats.num_hugepages_broken += total_broken;
        if self.subrelease_stats.limit_hit() {
            self.subrelease_stats.total_pages_subreleased_due_to_limit += total_released;
            self.subrelease_stats.total_hugepages_broken_due_to_limit += total_broken;
        }
        if total_released > Length::ZERO {
            log::debug!(
                "HugePageFiller: subreleased {} pages, broke {} huge pages",
                total_released,
                total_broken
            );
        }
        total_released
    }

    // =========================================================================
    // LIST MAINTENANCE
    // =========================================================================

    /// Map a requested density onto a table.
    #[inline]
    fn density_for(&self, density: AccessDensity) -> AccessDensity {
        if self.allocs_option == AllocsOption::SeparateAllocs && density.is_dense() {
            AccessDensity::Dense
        } else {
            AccessDensity::Sparse
        }
    }

    /// Which chunk should this tracker be in? More allocations map to
    /// lower (more preferred) chunks, spaced logarithmically; a single
    /// allocation gets the largest chunk index.
    fn index_for(&self, id: TrackerId) -> usize {
        let na = self.arena[id].nallocs().max(1);
        // usize::BITS - 1 - ceil(log2(na))
        let neg_ceil_log = (2 * na - 1).leading_zeros() as usize;
        let offset = (usize::BITS as usize - 1) - (self.chunks_per_alloc - 1);
        let i = neg_ceil_log.max(offset) - offset;
        debug_assert!(i < self.chunks_per_alloc);
        i
    }

    /// List index for a longest-free bucket and chunk.
    #[inline]
    fn list_for(&self, longest: Length, chunk: usize) -> usize {
        debug_assert!(chunk < self.chunks_per_alloc);
        longest.raw() * self.chunks_per_alloc + chunk
    }

    /// Which density table does this tracker belong to?
    #[inline]
    fn table_density(&self, id: TrackerId) -> usize {
        if self.allocs_option == AllocsOption::SeparateAllocs && self.arena[id].has_dense_spans()
        {
            AccessDensity::Dense.index()
        } else {
            AccessDensity::Sparse.index()
        }
    }

    fn remove_from_filler_list(&mut self, id: TrackerId) {
        let longest = self.arena[id].longest_free_range();

        if self.arena[id].donated() {
            self.donated_alloc.remove(&mut self.arena, id, longest.raw());
            return;
        }

        let chunk = self.index_for(id);
        let i = self.list_for(longest, chunk);
        let ti = self.table_density(id);

        if !self.arena[id].released() {
            self.regular_alloc[ti].remove(&mut self.arena, id, i);
        } else if self.arena[id].free_pages() <= self.arena[id].released_pages() {
            let used = self.arena[id].used_pages();
            debug_assert!(self.n_used_released[ti] >= used);
            self.n_used_released[ti] -= used;
            self.regular_alloc_released[ti].remove(&mut self.arena, id, i);
        } else {
            let used = self.arena[id].used_pages();
            debug_assert!(self.n_used_partial_released[ti] >= used);
            self.n_used_partial_released[ti] -= used;
            self.regular_alloc_partial_released[ti].remove(&mut self.arena, id, i);
        }
    }

    fn add_to_filler_list(&mut self, id: TrackerId) {
        // Once used in any way, a donated alloc degenerates into a
        // regular one. The algorithm keeps filling it (we were
        // desperate enough to start), which preserves the other
        // donated huge pages.
        self.arena[id].set_donated(false);

        let chunk = self.index_for(id);
        let longest = self.arena[id].longest_free_range();
        let i = self.list_for(longest, chunk);
        let ti = self.table_density(id);

        if !self.arena[id].released() {
            self.regular_alloc[ti].add(&mut self.arena, id, i);
        } else if self.arena[id].free_pages() <= self.arena[id].released_pages() {
            let used = self.arena[id].used_pages();
            self.n_used_released[ti] += used;
            self.regular_alloc_released[ti].add(&mut self.arena, id, i);
        } else {
            let used = self.arena[id].used_pages();
            self.n_used_partial_released[ti] += used;
            self.regular_alloc_partial_released[ti].add(&mut self.arena, id, i);
        }
    }

    fn donate_to_filler_list(&mut self, id: TrackerId) {
        let longest = self.arena[id].longest_free_range();
        // Released trackers are never donated.
        debug_assert!(!self.arena[id].released());
        self.arena[id].set_donated(true);
        self.donated_alloc.add(&mut self.arena, id, longest.raw());
    }

    /// Sample the filler state into the time-series tracker.
    fn update_stats_tracker(&mut self) {
        let mut stats = FillerStats {
            num_pages: self.pages_allocated(),
            free_pages: self.free_pages(),
            unmapped_pages: self.unmapped_pages(),
            used_pages_in_subreleased_huge_pages: self.n_used_released[0]
                + self.n_used_released[1]
                + self.n_used_partial_released[0]
                + self.n_used_partial_released[1],
            num_pages_subreleased: self.subrelease_stats.num_pages_subreleased,
            num_partial_alloc_pages_subreleased: self
                .subrelease_stats
                .num_partial_alloc_pages_subreleased,
            num_hugepages_broken: self.subrelease_stats.num_hugepages_broken,
            ..FillerStats::default()
        };
        stats.huge_pages[HugePageType::Donated.index()] = HugeLength(self.donated_alloc.size());
        for ti in 0..DENSITY_COUNT {
            stats.huge_pages[HugePageType::Regular.index()] +=
                HugeLength(self.regular_alloc[ti].size());
            stats.huge_pages[HugePageType::PartialReleased.index()] +=
                HugeLength(self.regular_alloc_partial_released[ti].size());
            stats.huge_pages[HugePageType::Released.index()] +=
                HugeLength(self.regular_alloc_released[ti].size());
        }
        self.stats_tracker.report(stats);
        self.subrelease_stats.reset();
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    /// Append the human-readable report; `everything` adds fullness
    /// histograms and the time series.
    pub fn print(&self, out: &mut Printer<'_>, everything: bool) {
        out.print(format_args!(
            "HugePageFiller: densely pack small requests into hugepages\n"
        ));
        let stats = self.get_stats();

        // A full donated list is impossible: an entirely-used huge
        // page would never have been donated.
        debug_assert_eq!(self.donated_alloc.list_len(0), 0);

        out.print(format_args!(
            "HugePageFiller: Overall, {} total, {} full, {} partial, {} released ({} partially), 0 quarantined\n",
            self.size(),
            stats.n_full[DENSITY_COUNT],
            stats.n_partial[DENSITY_COUNT],
            stats.n_released[DENSITY_COUNT],
            stats.n_partial_released[DENSITY_COUNT]
        ));
        for (ti, blurb) in [
            (AccessDensity::Sparse.index(), "sparsely-accessed"),
            (AccessDensity::Dense.index(), "densely-accessed"),
        ] {
            out.print(format_args!(
                "HugePageFiller: those with {} spans, {} total, {} full, {} partial, {} released ({} partially), 0 quarantined\n",
                blurb,
                stats.n_total[ti],
                stats.n_full[ti],
                stats.n_partial[ti],
                stats.n_released[ti],
                stats.n_partial_released[ti]
            ));
        }

        out.print(format_args!(
            "HugePageFiller: {} pages free in {} hugepages, {:.4} free\n",
            self.free_pages(),
            self.size(),
            safe_div(self.free_pages(), self.size.in_pages())
        ));

        let n_nonfull = stats.n_partial[DENSITY_COUNT] + stats.n_partial_released[DENSITY_COUNT];
        debug_assert!(self.free_pages() <= n_nonfull.in_pages());
        out.print(format_args!(
            "HugePageFiller: among non-fulls, {:.4} free\n",
            safe_div(self.free_pages(), n_nonfull.in_pages())
        ));

        out.print(format_args!(
            "HugePageFiller: {} used pages in subreleased hugepages ({} of them in partially released)\n",
            self.used_pages_in_any_subreleased(),
            self.used_pages_in_partial_released()
        ));

        out.print(format_args!(
            "HugePageFiller: {} hugepages partially released, {:.4} released\n",
            stats.n_released[DENSITY_COUNT],
            safe_div(self.unmapped_pages(), stats.n_released[DENSITY_COUNT].in_pages())
        ));
        out.print(format_args!(
            "HugePageFiller: {:.4} of used pages hugepageable\n",
            self.hugepage_frac()
        ));
        out.print(format_args!(
            "HugePageFiller: {} hugepages were previously released, but later became full.\n",
            self.previously_released_huge_pages()
        ));

        out.print(format_args!(
            "HugePageFiller: Since startup, {} pages subreleased, {} hugepages broken, ({} pages, {} hugepages due to reaching the memory limit)\n",
            self.subrelease_stats.total_pages_subreleased,
            self.subrelease_stats.total_hugepages_broken,
            self.subrelease_stats.total_pages_subreleased_due_to_limit,
            self.subrelease_stats.total_hugepages_broken_due_to_limit
        ));

        if !everything {
            return;
        }

        let mut usage = UsageInfo::new();
        self.record_usage(&mut usage);
        out.print(format_args!("\n"));
        out.print(format_args!("HugePageFiller: fullness histograms\n"));
        usage.print(out);

        out.print(format_args!("\n"));
        self.stats_tracker.print(out);
    }

    /// Emit the machine-readable report.
    pub fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) {
        let stats = self.get_stats();
        debug_assert_eq!(self.donated_alloc.list_len(0), 0);

        hpaa.print_i64(
            "filler_full_huge_pages",
            stats.n_full[DENSITY_COUNT].raw() as i64,
        );
        hpaa.print_i64(
            "filler_partial_huge_pages",
            stats.n_partial[DENSITY_COUNT].raw() as i64,
        );
        hpaa.print_i64(
            "filler_released_huge_pages",
            stats.n_released[DENSITY_COUNT].raw() as i64,
        );
        hpaa.print_i64(
            "filler_partially_released_huge_pages",
            stats.n_partial_released[DENSITY_COUNT].raw() as i64,
        );

        for (ti, field) in [
            (
                AccessDensity::Sparse.index(),
                "filler_sparsely_accessed_alloc_stats",
            ),
            (
                AccessDensity::Dense.index(),
                "filler_densely_accessed_alloc_stats",
            ),
        ] {
            let mut alloc_region = hpaa.sub_region(field);
            alloc_region.print_i64("full_huge_pages", stats.n_full[ti].raw() as i64);
            alloc_region.print_i64("partial_huge_pages", stats.n_partial[ti].raw() as i64);
            alloc_region.print_i64("released_huge_pages", stats.n_released[ti].raw() as i64);
            alloc_region.print_i64(
                "partially_released_huge_pages",
                stats.n_partial_released[ti].raw() as i64,
            );
        }

        hpaa.print_i64("filler_free_pages", self.free_pages().raw() as i64);
        hpaa.print_i64(
            "filler_used_pages_in_subreleased",
            self.used_pages_in_any_subreleased().raw() as i64,
        );
        hpaa.print_i64(
            "filler_used_pages_in_partial_released",
            self.used_pages_in_partial_released().raw() as i64,
        );
        hpaa.print_i64(
            "filler_unmapped_bytes",
            (stats.n_released[DENSITY_COUNT].raw() as f64
                * safe_div(
                    self.unmapped_pages(),
                    stats.n_released[DENSITY_COUNT].in_pages(),
                )) as i64,
        );
        hpaa.print_i64(
            "filler_hugepageable_used_bytes",
            (self.hugepage_frac()
                * (self.pages_allocated[0].in_bytes() + self.pages_allocated[1].in_bytes())
                    as f64) as i64,
        );
        hpaa.print_i64(
            "filler_previously_released_huge_pages",
            self.previously_released_huge_pages().raw() as i64,
        );
        hpaa.print_i64(
            "filler_num_pages_subreleased",
            self.subrelease_stats.total_pages_subreleased.raw() as i64,
        );
        hpaa.print_i64(
            "filler_num_hugepages_broken",
            self.subrelease_stats.total_hugepages_broken.raw() as i64,
        );
        hpaa.print_i64(
            "filler_num_pages_subreleased_due_to_limit",
            self.subrelease_stats
                .total_pages_subreleased_due_to_limit
                .raw() as i64,
        );
        hpaa.print_i64(
            "filler_num_hugepages_broken_due_to_limit",
            self.subrelease_stats
                .total_hugepages_broken_due_to_limit
                .raw() as i64,
        );

        let mut usage = UsageInfo::new();
        self.record_usage(&mut usage);
        usage.print_in_pbtxt(hpaa);

        self.stats_tracker.print_in_pbtxt(hpaa);
    }

    fn record_usage(&self, usage: &mut UsageInfo) {
        self.donated_alloc.iter(&self.arena, 0, |id| {
            usage.record(&self.arena[id], TrackerClass::Donated);
        });
        let classes = [
            (
                &self.regular_alloc,
                TrackerClass::SparseRegular,
                TrackerClass::DenseRegular,
            ),
            (
                &self.regular_alloc_partial_released,
                TrackerClass::SparsePartialReleased,
                TrackerClass::DensePartialReleased,
            ),
            (
                &self.regular_alloc_released,
                TrackerClass::SparseReleased,
                TrackerClass::DenseReleased,
            ),
        ];
        for (tables, sparse_class, dense_class) in classes {
            tables[AccessDensity::Sparse.index()].iter(&self.arena, 0, |id| {
                usage.record(&self.arena[id], sparse_class);
            });
            tables[AccessDensity::Dense.index()].iter(&self.arena, 0, |id| {
                usage.record(&self.arena[id], dense_class);
            });
        }
    }
}

/// `ceil(x * f)` without a float ceil intrinsic.
fn ceil_fraction(x: usize, f: f64) -> usize {
    let v = x as f64 * f;
    let t = v as usize;
    if (t as f64) < v {
        t + 1
    } else {
        t
    }
}

// =============================================================================
// FULLNESS HISTOGRAMS
// =============================================================================

/// Tracker classes reported separately in the fullness histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerClass {
    SparseRegular,
    DenseRegular,
    Donated,
    SparsePartialReleased,
    DensePartialReleased,
    SparseReleased,
    DenseReleased,
}

const TRACKER_CLASSES: usize = 7;

impl TrackerClass {
    const ALL: [TrackerClass; TRACKER_CLASSES] = [
        TrackerClass::SparseRegular,
        TrackerClass::DenseRegular,
        TrackerClass::Donated,
        TrackerClass::SparsePartialReleased,
        TrackerClass::DensePartialReleased,
        TrackerClass::SparseReleased,
        TrackerClass::DenseReleased,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    fn describe(self) -> &'static str {
        match self {
            TrackerClass::SparseRegular => "sparsely-accessed regular",
            TrackerClass::DenseRegular => "densely-accessed regular",
            TrackerClass::Donated => "donated",
            TrackerClass::SparsePartialReleased => "sparsely-accessed partial released",
            TrackerClass::DensePartialReleased => "densely-accessed partial released",
            TrackerClass::SparseReleased => "sparsely-accessed released",
            TrackerClass::DenseReleased => "densely-accessed released",
        }
    }

    fn alloc_type(self) -> &'static str {
        match self {
            TrackerClass::SparseRegular | TrackerClass::DenseRegular => "REGULAR",
            TrackerClass::Donated => "DONATED",
            TrackerClass::SparsePartialReleased | TrackerClass::DensePartialReleased => "PARTIAL",
            TrackerClass::SparseReleased | TrackerClass::DenseReleased => "RELEASED",
        }
    }

    fn object_type(self) -> &'static str {
        match self {
            TrackerClass::SparseRegular
            | TrackerClass::Donated
            | TrackerClass::SparsePartialReleased
            | TrackerClass::SparseReleased => "SPARSELY_ACCESSED",
            TrackerClass::DenseRegular
            | TrackerClass::DensePartialReleased
            | TrackerClass::DenseReleased => "DENSELY_ACCESSED",
        }
    }
}

/// Histograms of huge page fullness.
///
/// Nearly empty and nearly full huge pages are the interesting ones,
/// so there are four one-wide buckets at each end and sixteen even
/// buckets across the middle.
struct UsageInfo {
    free_page_histo: [[usize; UsageInfo::BUCKET_CAPACITY]; TRACKER_CLASSES],
    longest_free_histo: [[usize; UsageInfo::BUCKET_CAPACITY]; TRACKER_CLASSES],
    nalloc_histo: [[usize; UsageInfo::BUCKET_CAPACITY]; TRACKER_CLASSES],
    bucket_bounds: [usize; UsageInfo::BUCKET_CAPACITY],
    buckets_size: usize,
}

impl UsageInfo {
    const BUCKET_CAPACITY: usize = 4 + 16 + 4;

    fn new() -> Self {
        let mut bounds = [0usize; Self::BUCKET_CAPACITY];
        let mut size = 0;

        let mut i = 0;
        while i <= 4 && i < PAGES_PER_HUGE_PAGE {
            bounds[size] = i;
            size += 1;
            i += 1;
        }
        if i < PAGES_PER_HUGE_PAGE - 4 {
            const STEP: usize = PAGES_PER_HUGE_PAGE / 16;
            // Round up to the next step boundary (STEP is a power of
            // two).
            i = ((i - 1) | (STEP - 1)) + 1;
            while i < PAGES_PER_HUGE_PAGE - 4 {
                bounds[size] = i;
                size += 1;
                i += STEP;
            }
            i = PAGES_PER_HUGE_PAGE - 4;
        }
        while i < PAGES_PER_HUGE_PAGE {
            bounds[size] = i;
            size += 1;
            i += 1;
        }
        assert!(size <= Self::BUCKET_CAPACITY);

        Self {
            free_page_histo: [[0; Self::BUCKET_CAPACITY]; TRACKER_CLASSES],
            longest_free_histo: [[0; Self::BUCKET_CAPACITY]; TRACKER_CLASSES],
            nalloc_histo: [[0; Self::BUCKET_CAPACITY]; TRACKER_CLASSES],
            bucket_bounds: bounds,
            buckets_size: size,
        }
    }

    fn bucket_num(&self, page: usize) -> usize {
        let bounds = &self.bucket_bounds[..self.buckets_size];
        let i = bounds.partition_point(|&b| b <= page);
        debug_assert!(i > 0);
        i - 1
    }

    fn record(&mut self, pt: &PageTracker, class: TrackerClass) {
        let free = PAGES_PER_HUGE_PAGE - pt.used_pages().raw();
        let lf = pt.longest_free_range().raw();
        let nalloc = pt.nallocs();
        let c = class.index();
        // Buckets have to differ: nalloc is in [1, 256] while the page
        // counts are in [0, 255].
        self.free_page_histo[c][self.bucket_num(free)] += 1;
        self.longest_free_histo[c][self.bucket_num(lf)] += 1;
        self.nalloc_histo[c][self.bucket_num(nalloc.saturating_sub(1))] += 1;
    }

    fn print(&self, out: &mut Printer<'_>) {
        for class in TrackerClass::ALL {
            self.print_histo(
                out,
                &self.free_page_histo[class.index()],
                class,
                "hps with a<= # of free pages <b",
                0,
            );
        }

        // For donated huge pages the allocation count is one and the
        // longest free range equals the free page count, so the next
        // two say nothing new.
        for class in TrackerClass::ALL {
            if class == TrackerClass::Donated {
                continue;
            }
            self.print_histo(
                out,
                &self.longest_free_histo[class.index()],
                class,
                "hps with a<= longest free range <b",
                0,
            );
        }

        for class in TrackerClass::ALL {
            if class == TrackerClass::Donated {
                continue;
            }
            self.print_histo(
                out,
                &self.nalloc_histo[class.index()],
                class,
                "hps with a<= # of allocations <b",
                1,
            );
        }
    }

    fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) {
        for class in TrackerClass::ALL {
            let mut scoped = hpaa.sub_region("filler_tracker");
            scoped.print_raw("type", class.alloc_type());
            scoped.print_raw("objects", class.object_type());
            self.print_histo_in_pbtxt(
                &mut scoped,
                &self.free_page_histo[class.index()],
                "free_pages_histogram",
                0,
            );
            self.print_histo_in_pbtxt(
                &mut scoped,
                &self.longest_free_histo[class.index()],
                "longest_free_range_histogram",
                0,
            );
            self.print_histo_in_pbtxt(
                &mut scoped,
                &self.nalloc_histo[class.index()],
                "allocations_histogram",
                1,
            );
        }
    }

    fn print_histo(
        &self,
        out: &mut Printer<'_>,
        histo: &[usize; Self::BUCKET_CAPACITY],
        class: TrackerClass,
        blurb: &str,
        offset: usize,
    ) {
        out.print(format_args!(
            "\nHugePageFiller: # of {} {}",
            class.describe(),
            blurb
        ));
        for i in 0..self.buckets_size {
            if i % 6 == 0 {
                out.print(format_args!("\nHugePageFiller:"));
            }
            out.print(format_args!(
                " <{:3}<={:6}",
                self.bucket_bounds[i] + offset,
                histo[i]
            ));
        }
        out.print(format_args!("\n"));
    }

    fn print_histo_in_pbtxt(
        &self,
        scoped: &mut PbtxtRegion<'_>,
        histo: &[usize; Self::BUCKET_CAPACITY],
        key: &str,
        offset: usize,
    ) {
        for i in 0..self.buckets_size {
            let mut hist = scoped.sub_region(key);
            hist.print_i64("lower_bound", (self.bucket_bounds[i] + offset) as i64);
            let upper = if i == self.buckets_size - 1 {
                self.bucket_bounds[i]
            } else {
                self.bucket_bounds[i + 1] - 1
            };
            hist.print_i64("upper_bound", (upper + offset) as i64);
            hist.print_i64("value", histo[i] as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::clock as test_clock;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use tessera_core::{Error, HugePage, PageRange, Result};

    /// Scripted unback: records calls, optionally failing some.
    #[derive(Default)]
    struct FakeUnback {
        calls: RefCell<Vec<PageRange>>,
        fail_next: RefCell<usize>,
    }

    impl Unback for &FakeUnback {
        fn unback(&mut self, r: PageRange) -> Result<()> {
            let mut fail = self.fail_next.borrow_mut();
            if *fail > 0 {
                *fail -= 1;
                return Err(Error::UnbackFailed);
            }
            self.calls.borrow_mut().push(r);
            Ok(())
        }
    }

    const SPARSE: AllocInfo = AllocInfo {
        objects: 1,
        density: AccessDensity::Sparse,
    };
    const DENSE: AllocInfo = AllocInfo {
        objects: 64,
        density: AccessDensity::Dense,
    };

    fn filler(unback: &FakeUnback) -> HugePageFiller<&FakeUnback> {
        test_clock::reset();
        HugePageFiller::new(test_clock::get(), FillerConfig::default(), unback)
    }

    fn no_intervals() -> SkipSubreleaseIntervals {
        SkipSubreleaseIntervals::default()
    }

    /// Check the filler-wide accounting invariants.
    fn check_accounting(f: &HugePageFiller<&FakeUnback>) {
        assert_eq!(
            f.free_pages(),
            f.size().in_pages() - f.used_pages() - f.unmapped_pages()
        );
        let stats = f.get_stats();
        assert_eq!(
            stats.n_total[DENSITY_COUNT].raw(),
            f.size().raw()
        );
    }

    #[test]
    fn empty_tracker_roundtrip() {
        // Contribute an empty sparse tracker, allocate half of it,
        // free it back; the emptied tracker is handed back.
        let ub = FakeUnback::default();
        let mut f = filler(&ub);
        let id = f.contribute(PageTracker::new(HugePage(5), false), false, SPARSE);
        assert_eq!(f.size(), HugeLength(1));

        let got = f.try_get(Length(128), SPARSE).expect("fits");
        assert_eq!(got.tracker, id);
        assert_eq!(got.page, HugePage(5).first_page());
        assert!(!got.from_released);
        assert_eq!(f.used_pages(), Length(128));
        check_accounting(&f);

        let pt = f.put(got.tracker, got.page, Length(128)).expect("now empty");
        assert_eq!(pt.location(), HugePage(5));
        assert_eq!(f.size(), HugeLength::ZERO);
        assert_eq!(f.used_pages(), Length::ZERO);
        check_accounting(&f);
    }

    #[test]
    fn head_of_target_list_wins() {
        // Two equally-loaded trackers: the most recently contributed
        // one sits at the head of the shared list and is chosen.
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        let mut a = PageTracker::new(HugePage(1), false);
        a.get(Length(8));
        let mut b = PageTracker::new(HugePage(2), false);
        b.get(Length(8));
        let _id_a = f.contribute(a, false, SPARSE);
        let id_b = f.contribute(b, false, SPARSE);

        let got = f.try_get(Length(200), SPARSE).expect("fits");
        assert_eq!(got.tracker, id_b);
        check_accounting(&f);
    }

    #[test]
    fn tighter_fit_preferred() {
        // A tracker with a shorter longest-free run that still fits
        // beats an emptier one.
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        let mut tight = PageTracker::new(HugePage(1), false);
        tight.get(Length(200)); // longest free 56
        let mut roomy = PageTracker::new(HugePage(2), false);
        roomy.get(Length(8)); // longest free 248
        let id_tight = f.contribute(tight, false, SPARSE);
        let _id_roomy = f.contribute(roomy, false, SPARSE);

        let got = f.try_get(Length(40), SPARSE).expect("fits");
        assert_eq!(got.tracker, id_tight);
    }

    #[test]
    fn donated_used_only_as_last_resort() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        // A donated tail with 200 free pages and a regular tracker
        // with only a 56-page hole.
        let mut donated = PageTracker::new(HugePage(1), true);
        donated.get(Length(56)); // head consumed by the originating alloc
        let id_donated = f.contribute(donated, true, SPARSE);

        let mut regular = PageTracker::new(HugePage(2), false);
        regular.get(Length(200));
        let id_regular = f.contribute(regular, false, SPARSE);

        // Fits in both, but a donated tail loses to any regular
        // tracker that fits, whatever its longest free run.
        let got = f.try_get(Length(40), SPARSE).expect("fits");
        assert_eq!(got.tracker, id_regular);

        // A request only the donated tail can hold falls through to
        // it.
        let got = f.try_get(Length(100), SPARSE).expect("fits");
        assert_eq!(got.tracker, id_donated);
        assert!(!f.tracker(id_donated).donated());
        check_accounting(&f);
    }

    #[test]
    fn dense_and_sparse_do_not_mix() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        let mut dense = PageTracker::new(HugePage(1), false);
        dense.get(Length(8));
        let id_dense = f.contribute(dense, false, DENSE);
        assert!(f.tracker(id_dense).has_dense_spans());

        // A sparse request cannot land on the dense tracker.
        assert!(f.try_get(Length(8), SPARSE).is_none());
        // A dense one can.
        let got = f.try_get(Length(8), DENSE).expect("fits");
        assert_eq!(got.tracker, id_dense);
        assert_eq!(f.pages_allocated_for(AccessDensity::Dense), Length(16));
        assert_eq!(f.pages_allocated_for(AccessDensity::Sparse), Length::ZERO);
    }

    #[test]
    fn release_pages_from_middle_hole() {
        // Fill a huge page with three runs, free the middle one, then
        // ask for 32 pages back.
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        let mut pt = PageTracker::new(HugePage(0), false);
        let _a = pt.get(Length(96));
        let b = pt.get(Length(64));
        let _c = pt.get(Length(96));
        assert_eq!(b.page, PageId(96));
        let id = f.contribute(pt, false, SPARSE);
        f.put(id, b.page, Length(64));
        check_accounting(&f);

        let released = f.release_pages(Length(32), no_intervals(), false, false);
        // The whole free hole comes back in one tracker release.
        assert_eq!(released, Length(64));
        assert_eq!(f.unmapped_pages(), Length(64));
        let stats = f.get_stats();
        assert_eq!(stats.n_released[AccessDensity::Sparse.index()], HugeLength(1));
        assert_eq!(f.used_pages_in_any_subreleased(), Length(192));
        assert!(!f.tracker(id).unbroken());
        check_accounting(&f);

        // Refilling the hole reclaims released pages.
        let got = f.try_get(Length(64), SPARSE).expect("fits");
        assert_eq!(got.tracker, id);
        assert!(got.from_released);
        assert_eq!(f.unmapped_pages(), Length::ZERO);
        assert_eq!(f.previously_released_huge_pages(), HugeLength(1));
        check_accounting(&f);
    }

    #[test]
    fn release_prefers_emptier_trackers() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        // Tracker A: 200 used; tracker B: 8 used.
        let mut a = PageTracker::new(HugePage(1), false);
        a.get(Length(200));
        let mut b = PageTracker::new(HugePage(2), false);
        b.get(Length(8));
        f.contribute(a, false, SPARSE);
        f.contribute(b, false, SPARSE);

        // Ask for a few pages: only the emptiest candidate should be
        // touched.
        let released = f.release_pages(Length(10), no_intervals(), false, false);
        assert_eq!(released, Length(248));
        let ranges = ub.calls.borrow();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, HugePage(2).first_page() + Length(8));
        check_accounting(&f);
    }

    #[test]
    fn release_handles_unback_failure() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        let mut a = PageTracker::new(HugePage(1), false);
        a.get(Length(200));
        let id = f.contribute(a, false, SPARSE);
        *ub.fail_next.borrow_mut() = 1;

        let released = f.release_pages(Length(16), no_intervals(), false, false);
        assert_eq!(released, Length::ZERO);
        assert_eq!(f.unmapped_pages(), Length::ZERO);
        assert!(f.tracker(id).unbroken());
        check_accounting(&f);

        // The next pass succeeds.
        let released = f.release_pages(Length(16), no_intervals(), false, false);
        assert_eq!(released, Length(56));
        check_accounting(&f);
    }

    #[test]
    fn skip_subrelease_respects_recent_peak() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        // Fill a huge page, then drop demand to 64 pages. The peak of
        // 256 demanded pages was observed while everything was
        // allocated, and current mapped pages equal that peak, so
        // nothing may be released.
        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(96));
        let b = pt.get(Length(96));
        pt.get(Length(64));
        let id = f.contribute(pt, false, SPARSE);
        f.put(id, a.page, Length(96));
        f.put(id, b.page, Length(96));

        let intervals = SkipSubreleaseIntervals {
            peak_interval: Duration::from_secs(60),
            ..SkipSubreleaseIntervals::default()
        };
        let released = f.release_pages(Length(200), intervals, false, false);
        assert_eq!(released, Length::ZERO);
        assert!(f.stats_tracker().total_skipped().pages > Length::ZERO);

        // hit_limit overrides the skip policy entirely.
        let released = f.release_pages(Length(200), intervals, false, true);
        assert_eq!(released, Length(192));
        assert_eq!(
            f.subrelease_stats().total_pages_subreleased_due_to_limit,
            Length(192)
        );
        check_accounting(&f);
    }

    #[test]
    fn emptied_partially_released_page_is_fully_unbacked() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        let mut pt = PageTracker::new(HugePage(3), false);
        let a = pt.get(Length(128));
        let b = pt.get(Length(128));
        let id = f.contribute(pt, false, SPARSE);
        f.put(id, a.page, Length(128));
        // Release the first half.
        let released = f.release_pages(Length(64), no_intervals(), false, false);
        assert_eq!(released, Length(128));

        // Free the rest: the huge page empties while 128 pages are
        // still backed, so the whole huge page is unbacked eagerly.
        let pt = f.put(id, b.page, Length(128)).expect("empty");
        assert_eq!(pt.released_pages(), Length(128));
        assert_eq!(f.unmapped_pages(), Length::ZERO);
        assert_eq!(f.size(), HugeLength::ZERO);
        let whole = ub
            .calls
            .borrow()
            .iter()
            .any(|r| r.len == Length(PAGES_PER_HUGE_PAGE));
        assert!(whole, "expected a whole-huge-page unback");

        // The eager unmap is claimed by the next release call.
        let claimed = f.release_pages(Length(1), no_intervals(), false, false);
        assert_eq!(claimed, Length(128));
        check_accounting(&f);
    }

    #[test]
    fn partial_alloc_release_raises_target() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);

        // Build a partially released tracker with 100 free backed
        // pages.
        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(100));
        let b = pt.get(Length(56));
        pt.get(Length(100));
        let id = f.contribute(pt, false, SPARSE);
        f.put(id, a.page, Length(100));
        let released = f.release_pages(Length(100), no_intervals(), false, false);
        assert_eq!(released, Length(100));
        // Now free 56 more backed pages on the same (released) huge
        // page.
        f.put(id, b.page, Length(56));
        assert_eq!(f.free_pages_in_partial_allocs(), Length(56));

        // desired = 0, but partial-alloc release asks for ceil(0.1 *
        // 56) = 6 pages, and releasing the tracker returns all 56.
        let released = f.release_pages(Length::ZERO, no_intervals(), true, false);
        assert_eq!(released, Length(56));
        check_accounting(&f);
    }

    #[test]
    fn round_trip_restores_counters() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);
        f.contribute(PageTracker::new(HugePage(7), false), false, SPARSE);

        // An anchor run keeps the tracker alive across the loop.
        let anchor = f.try_get(Length(16), SPARSE).expect("fits");
        let before_used = f.used_pages();
        let before_free = f.free_pages();
        for _ in 0..4 {
            let got = f.try_get(Length(32), SPARSE).expect("fits");
            assert!(f.put(got.tracker, got.page, Length(32)).is_none());
        }
        assert_eq!(f.used_pages(), before_used);
        assert_eq!(f.free_pages(), before_free);

        let pt = f.put(anchor.tracker, anchor.page, Length(16)).expect("empty");
        assert_eq!(pt.location(), HugePage(7));
        assert_eq!(f.size(), HugeLength::ZERO);
        check_accounting(&f);
    }

    #[test]
    fn hugepage_frac_tracks_subreleased_share() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);
        assert_eq!(f.hugepage_frac(), 0.0);

        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(128));
        pt.get(Length(64));
        let id = f.contribute(pt, false, SPARSE);
        assert_eq!(f.hugepage_frac(), 1.0);

        f.put(id, a.page, Length(128));
        f.release_pages(Length(128), no_intervals(), false, false);
        // 64 used pages, all on a subreleased huge page.
        assert_eq!(f.hugepage_frac(), 0.0);
    }

    #[test]
    fn print_reports_are_well_formed() {
        let ub = FakeUnback::default();
        let mut f = filler(&ub);
        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(100));
        pt.get(Length(56));
        let id = f.contribute(pt, false, SPARSE);
        f.put(id, a.page, Length(100));
        f.release_pages(Length(50), no_intervals(), false, false);

        let mut buf = String::new();
        let mut out = Printer::new(&mut buf);
        f.print(&mut out, true);
        for needle in [
            "densely pack small requests",
            "fullness histograms",
            "hugepageable",
            "realized fragmentation",
        ] {
            assert!(buf.contains(needle), "missing {needle}");
        }

        let mut buf = String::new();
        {
            let mut root = PbtxtRegion::new(&mut buf);
            f.print_in_pbtxt(&mut root);
        }
        for key in [
            "filler_full_huge_pages",
            "filler_partial_huge_pages",
            "filler_released_huge_pages",
            "filler_partially_released_huge_pages",
            "filler_sparsely_accessed_alloc_stats",
            "filler_densely_accessed_alloc_stats",
            "filler_skipped_subrelease",
            "filler_stats_timeseries",
            "filler_tracker",
            "free_pages_histogram",
        ] {
            assert!(buf.contains(key), "missing key {key}");
        }
    }
}
