//! Fixed-size multi-huge-page regions for medium-large allocations.
//!
//! A region helps with allocations too large for the filler but too
//! small to round up to whole huge pages: lengths that would fit a
//! huge page but rarely fit the available gaps, and lengths just past
//! one that would fragment badly if rounded. Unlike a page tracker, a
//! region crosses many huge pages, backs them on demand, and can give
//! idle ones back.

use alloc::vec;
use alloc::vec::Vec;

use tessera_core::{
    Clock, HugeLength, HugePage, HugeRange, Length, PageId, PageRange, Unback,
    PAGES_PER_HUGE_PAGE,
};

use crate::range::RangeTracker;
use crate::report::{PbtxtRegion, Printer};
use crate::stats::{BackingStats, LargeSpanStats, SmallSpanStats, MAX_SMALL_SPAN_PAGES};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Huge pages per region: 1 GiB of 2 MiB huge pages.
pub const REGION_HUGE_PAGES: usize = 512;

/// Small pages per region.
pub const REGION_PAGES: usize = REGION_HUGE_PAGES * PAGES_PER_HUGE_PAGE;

/// When regions are preferred for large allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionUsageOption {
    /// Use allocation slack to decide when regions host large
    /// allocations; frees eagerly unback emptied huge pages.
    Default,
    /// Route all large allocations at regions; frees keep huge pages
    /// backed and release happens only through explicit release
    /// calls.
    UseForAllLargeAllocs,
}

// =============================================================================
// HUGE REGION
// =============================================================================

/// Allocations from a fixed 1 GiB window, with per-huge-page backing
/// state.
#[derive(Debug)]
pub struct HugeRegion {
    location: HugeRange,
    tracker: RangeTracker,
    /// Pages used within each huge page.
    pages_used: Vec<Length>,
    /// Is each huge page currently backed?
    backed: Vec<bool>,
    /// Cycle stamp of the last allocation activity per huge page.
    last_touched: Vec<i64>,
    nbacked: HugeLength,
    /// Lifetime total of huge pages unbacked from this region.
    total_unbacked: HugeLength,
    clock: Clock,
}

impl HugeRegion {
    /// Region extent as a huge page count.
    pub const SIZE: HugeLength = HugeLength(REGION_HUGE_PAGES);

    /// A region over `location`, which must be unbacked and exactly
    /// [`SIZE`](Self::SIZE) long.
    pub fn new(location: HugeRange, clock: Clock) -> Self {
        assert_eq!(location.len, Self::SIZE);
        let now = clock.now();
        Self {
            location,
            tracker: RangeTracker::new(REGION_PAGES),
            pages_used: vec![Length::ZERO; REGION_HUGE_PAGES],
            backed: vec![false; REGION_HUGE_PAGES],
            last_touched: vec![now; REGION_HUGE_PAGES],
            nbacked: HugeLength::ZERO,
            total_unbacked: HugeLength::ZERO,
            clock,
        }
    }

    /// If available, claim a run of `n` free pages. The second result
    /// is true iff part of the run is currently unbacked and the
    /// caller must arrange backing.
    pub fn maybe_get(&mut self, n: Length) -> Option<(PageId, bool)> {
        if n > self.longest_free() {
            return None;
        }
        let index = Length(self.tracker.find_and_mark(n.raw()));
        let page = self.location.first_page() + index;
        let from_released = self.inc(page, n);
        Some((page, from_released))
    }

    /// Return `[p, p + n)` claimed by an earlier
    /// [`maybe_get`](Self::maybe_get). With `release` set, huge pages
    /// emptied by this free are unbacked through `unback`.
    pub fn put(&mut self, p: PageId, n: Length, release: bool, unback: &mut dyn Unback) {
        let index = p - self.location.first_page();
        self.tracker.unmark(index.raw(), n.raw());
        self.dec(p, n, release, unback);
    }

    /// Unback `release_fraction` (clamped to `[0, 1]`) of the
    /// free-but-backed huge pages, at least one. Returns huge pages
    /// released.
    pub fn release(&mut self, release_fraction: f64, unback: &mut dyn Unback) -> HugeLength {
        let free_yet_backed = self.free_backed().raw();
        let to_release = ceil_fraction(free_yet_backed, release_fraction.clamp(0.0, 1.0)).max(1);

        let mut marked = HugeLength::ZERO;
        let mut should_unback = vec![false; REGION_HUGE_PAGES];
        for i in 0..REGION_HUGE_PAGES {
            if self.backed[i] && self.pages_used[i] == Length::ZERO {
                should_unback[i] = true;
                marked += HugeLength(1);
            }
            if marked.raw() >= to_release {
                break;
            }
        }
        self.unback_hugepages(&mut should_unback, unback)
    }

    /// Is `p` located in this region?
    #[inline]
    pub fn contains(&self, p: PageId) -> bool {
        self.location.contains(p)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Pages currently allocated.
    #[inline]
    pub fn used_pages(&self) -> Length {
        Length(self.tracker.used())
    }

    /// Backed free pages.
    pub fn free_pages(&self) -> Length {
        Self::SIZE.in_pages() - self.unmapped_pages() - self.used_pages()
    }

    /// Unbacked pages.
    pub fn unmapped_pages(&self) -> Length {
        (Self::SIZE - self.nbacked).in_pages()
    }

    /// Longest contiguous free run, backed or not.
    #[inline]
    pub fn longest_free(&self) -> Length {
        Length(self.tracker.longest_free())
    }

    /// Huge pages currently backed.
    pub fn backed(&self) -> HugeLength {
        let mut b = HugeLength::ZERO;
        for &flag in &self.backed {
            if flag {
                b += HugeLength(1);
            }
        }
        b
    }

    /// Huge pages fully free yet still backed: release candidates.
    pub fn free_backed(&self) -> HugeLength {
        let mut r = HugeLength::ZERO;
        for i in 0..REGION_HUGE_PAGES {
            if self.backed[i] && self.pages_used[i] == Length::ZERO {
                r += HugeLength(1);
            }
        }
        r
    }

    /// Byte-level summary.
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.location.len.in_bytes(),
            free_bytes: self.free_pages().in_bytes(),
            unmapped_bytes: self.unmapped_pages().in_bytes(),
        }
    }

    /// Accumulate free-span histograms. Free ranges crossing huge
    /// pages with different backing states are truncated so each
    /// reported span is either fully backed or fully released.
    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        let mut free_seen = Length::ZERO;
        let mut unmapped_seen = Length::ZERO;
        let mut index = 0;
        while let Some((start, run)) = self.tracker.next_free_range(index) {
            let mut p = self.location.first_page() + Length(start);
            let mut remaining = run;

            while remaining > 0 {
                let hp = HugePage::containing(p);
                let i = (hp - self.location.start).raw();
                let is_backed = self.backed[i];
                // Extend across huge pages while the backing state
                // stays the same.
                let mut n = 0;
                let mut q = p;
                let mut left = remaining;
                let mut j = i;
                while left > 0 && self.backed[j] == is_backed {
                    let lim = (self.location.start + HugeLength(j + 1)).first_page();
                    let here = Length(left).min(lim - q);
                    n += here.raw();
                    left -= here.raw();
                    q = q + here;
                    if left == 0 {
                        break;
                    }
                    j += 1;
                    debug_assert!(j < REGION_HUGE_PAGES);
                }

                if is_backed {
                    free_seen += Length(n);
                } else {
                    unmapped_seen += Length(n);
                }
                if n < MAX_SMALL_SPAN_PAGES {
                    if let Some(small) = small.as_deref_mut() {
                        if is_backed {
                            small.normal_length[n] += 1;
                        } else {
                            small.returned_length[n] += 1;
                        }
                    }
                } else if let Some(large) = large.as_deref_mut() {
                    large.spans += 1;
                    if is_backed {
                        large.normal_pages += Length(n);
                    } else {
                        large.returned_pages += Length(n);
                    }
                }

                p = p + Length(n);
                remaining -= n;
            }

            index = start + run;
        }
        debug_assert_eq!(free_seen, self.free_pages());
        debug_assert_eq!(unmapped_seen, self.unmapped_pages());
    }

    /// Append the human-readable line for this region.
    pub fn print(&self, out: &mut Printer<'_>) {
        let kib_used = self.used_pages().in_bytes() / 1024;
        let kib_free = self.free_pages().in_bytes() / 1024;
        let kib_longest_free = self.longest_free().in_bytes() / 1024;
        let unbacked = Self::SIZE - self.backed();
        out.print(format_args!(
            "HugeRegion: {} KiB used, {} KiB free, {} KiB contiguous space, {} MiB unbacked, {} MiB unbacked lifetime\n",
            kib_used,
            kib_free,
            kib_longest_free,
            unbacked.in_mib(),
            self.total_unbacked.in_mib()
        ));
    }

    /// Emit the machine-readable fields for this region.
    pub fn print_in_pbtxt(&self, detail: &mut PbtxtRegion<'_>) {
        detail.print_i64("used_bytes", self.used_pages().in_bytes() as i64);
        detail.print_i64("free_bytes", self.free_pages().in_bytes() as i64);
        detail.print_i64(
            "longest_free_range_bytes",
            self.longest_free().in_bytes() as i64,
        );
        let unbacked = Self::SIZE - self.backed();
        detail.print_i64("unbacked_bytes", unbacked.in_bytes() as i64);
        detail.print_i64("total_unbacked_bytes", self.total_unbacked.in_bytes() as i64);
        detail.print_i64(
            "backed_fully_free_bytes",
            self.free_backed().in_bytes() as i64,
        );
    }

    // =========================================================================
    // BACKING BOOKKEEPING
    // =========================================================================

    /// Account `[p, p + n)` as allocated. Returns true iff any touched
    /// huge page had to transition to backed.
    fn inc(&mut self, p: PageId, n: Length) -> bool {
        let mut should_back = false;
        let now = self.clock.now();
        let mut p = p;
        let mut n = n;
        while n > Length::ZERO {
            let hp = HugePage::containing(p);
            let i = (hp - self.location.start).raw();
            let lim = (hp + HugeLength(1)).first_page();
            let here = n.min(lim - p);
            if self.pages_used[i] == Length::ZERO && !self.backed[i] {
                self.backed[i] = true;
                should_back = true;
                self.nbacked += HugeLength(1);
                self.last_touched[i] = now;
            }
            self.pages_used[i] += here;
            debug_assert!(self.pages_used[i] <= Length(PAGES_PER_HUGE_PAGE));
            p = p + here;
            n -= here;
        }
        should_back
    }

    /// Account `[p, p + n)` as freed; with `release`, unback huge
    /// pages that became empty.
    fn dec(&mut self, p: PageId, n: Length, release: bool, unback: &mut dyn Unback) {
        let now = self.clock.now();
        let mut should_unback = vec![false; REGION_HUGE_PAGES];
        let mut p = p;
        let mut n = n;
        while n > Length::ZERO {
            let hp = HugePage::containing(p);
            let i = (hp - self.location.start).raw();
            let lim = (hp + HugeLength(1)).first_page();
            let here = n.min(lim - p);
            debug_assert!(here > Length::ZERO);
            debug_assert!(self.pages_used[i] >= here);
            debug_assert!(self.backed[i]);
            self.last_touched[i] = average_whens(
                here,
                now,
                Length(PAGES_PER_HUGE_PAGE) - self.pages_used[i],
                self.last_touched[i],
            );
            self.pages_used[i] -= here;
            if self.pages_used[i] == Length::ZERO {
                should_unback[i] = true;
            }
            p = p + here;
            n -= here;
        }
        if release {
            self.unback_hugepages(&mut should_unback, unback);
        }
    }

    /// Unback the marked huge pages in contiguous runs. A run the
    /// primitive declines stays marked backed.
    fn unback_hugepages(
        &mut self,
        should_unback: &mut [bool],
        unback: &mut dyn Unback,
    ) -> HugeLength {
        let now = self.clock.now();
        let mut released = HugeLength::ZERO;
        let mut i = 0;
        while i < REGION_HUGE_PAGES {
            if !should_unback[i] {
                i += 1;
                continue;
            }
            let mut j = i;
            while j < REGION_HUGE_PAGES && should_unback[j] {
                j += 1;
            }

            let hl = HugeLength(j - i);
            let start = self.location.start + HugeLength(i);
            let range = PageRange::new(start.first_page(), hl.in_pages());
            match unback.unback(range) {
                Ok(()) => {
                    self.nbacked -= hl;
                    self.total_unbacked += hl;
                    released += hl;
                    for k in i..j {
                        debug_assert!(should_unback[k]);
                        self.backed[k] = false;
                        self.last_touched[k] = now;
                    }
                }
                Err(_) => {
                    log::warn!(
                        "HugeRegion: failed to unback {} huge pages at {:?}",
                        hl,
                        start
                    );
                }
            }
            i = j;
        }
        released
    }
}

/// Page-weighted average of two last-touched stamps.
fn average_whens(a: Length, a_when: i64, b: Length, b_when: i64) -> i64 {
    let aw = a.raw() as f64 * a_when as f64;
    let bw = b.raw() as f64 * b_when as f64;
    ((aw + bw) / (a.raw() + b.raw()) as f64) as i64
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
// HUGE REGION SET
// =============================================================================

/// A set of regions, allocated from most-fragmented first.
///
/// Regions are kept ordered by ascending longest free run, so the
/// tightest region that can hold a request is tried before roomier
/// ones. Every allocation or free nudges its region back into place.
#[derive(Debug)]
pub struct HugeRegionSet<U: Unback> {
    regions: Vec<HugeRegion>,
    /// Region indices, ascending by longest free run.
    order: Vec<usize>,
    usage_option: RegionUsageOption,
    unback: U,
}

impl<U: Unback> HugeRegionSet<U> {
    /// An empty set releasing memory through `unback`.
    pub fn new(usage_option: RegionUsageOption, unback: U) -> Self {
        Self {
            regions: Vec::new(),
            order: Vec::new(),
            usage_option,
            unback,
        }
    }

    /// Number of regions in the set.
    #[inline]
    pub fn active_regions(&self) -> usize {
        self.regions.len()
    }

    /// Are regions preferred for all large allocations?
    #[inline]
    pub fn use_huge_region_more_often(&self) -> bool {
        self.usage_option == RegionUsageOption::UseForAllLargeAllocs
    }

    /// Add a region to the set.
    pub fn contribute(&mut self, region: HugeRegion) {
        let ri = self.regions.len();
        self.regions.push(region);
        let pos = self
            .order
            .iter()
            .position(|&other| {
                self.regions[ri].longest_free() < self.regions[other].longest_free()
            })
            .unwrap_or(self.order.len());
        self.order.insert(pos, ri);
    }

    /// If some region can hold `n` pages, claim a run. The second
    /// result is true iff part of the run is currently unbacked.
    pub fn maybe_get(&mut self, n: Length) -> Option<(PageId, bool)> {
        for pos in 0..self.order.len() {
            let ri = self.order[pos];
            if let Some((page, from_released)) = self.regions[ri].maybe_get(n) {
                self.fix(pos);
                return Some((page, from_released));
            }
        }
        None
    }

    /// Route a free to the region containing it, if any. Frees unback
    /// emptied huge pages eagerly unless regions are in
    /// use-more-often mode, where release happens only through
    /// [`release_pages`](Self::release_pages).
    pub fn maybe_put(&mut self, p: PageId, n: Length) -> bool {
        let release = !self.use_huge_region_more_often();
        for pos in 0..self.order.len() {
            let ri = self.order[pos];
            if self.regions[ri].contains(p) {
                self.regions[ri].put(p, n, release, &mut self.unback);
                self.fix(pos);
                return true;
            }
        }
        false
    }

    /// Release up to `release_fraction` of the free-but-backed huge
    /// pages from each region. Returns pages released.
    pub fn release_pages(&mut self, release_fraction: f64) -> Length {
        let mut released = Length::ZERO;
        for region in &mut self.regions {
            released += region.release(release_fraction, &mut self.unback).in_pages();
        }
        released
    }

    /// Huge pages fully free yet backed, across all regions.
    pub fn free_backed(&self) -> HugeLength {
        let mut pages = HugeLength::ZERO;
        for region in &self.regions {
            pages += region.free_backed();
        }
        pages
    }

    /// Byte-level summary across all regions.
    pub fn stats(&self) -> BackingStats {
        let mut stats = BackingStats::default();
        for region in &self.regions {
            stats += region.stats();
        }
        stats
    }

    /// Accumulate free-span histograms across all regions.
    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        for region in &self.regions {
            region.add_span_stats(small.as_deref_mut(), large.as_deref_mut());
        }
    }

    /// Append the human-readable report for the set.
    pub fn print(&self, out: &mut Printer<'_>) {
        out.print(format_args!(
            "HugeRegionSet: 1 MiB+ allocations best-fit into {} MiB slabs\n",
            HugeRegion::SIZE.in_mib()
        ));
        out.print(format_args!(
            "HugeRegionSet: {} total regions\n",
            self.regions.len()
        ));

        let mut total_free = Length::ZERO;
        let mut total_backed = HugeLength::ZERO;
        let mut total_free_backed = HugeLength::ZERO;
        for &ri in &self.order {
            let region = &self.regions[ri];
            region.print(out);
            total_free += region.free_pages();
            total_backed += region.backed();
            total_free_backed += region.free_backed();
        }

        out.print(format_args!(
            "HugeRegionSet: {} hugepages backed, {} backed and free, out of {} total\n",
            total_backed,
            total_free_backed,
            HugeRegion::SIZE.raw() * self.regions.len()
        ));

        let in_pages = total_backed.in_pages();
        out.print(format_args!(
            "HugeRegionSet: {} pages free in backed region, {:.4} free\n",
            total_free,
            tessera_core::safe_div(total_free, in_pages)
        ));
    }

    /// Emit the machine-readable report for the set.
    pub fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) {
        hpaa.print_i64("min_huge_region_alloc_size", 1024 * 1024);
        hpaa.print_i64("huge_region_size", HugeRegion::SIZE.in_bytes() as i64);
        for &ri in &self.order {
            let mut detail = hpaa.sub_region("huge_region_details");
            self.regions[ri].print_in_pbtxt(&mut detail);
        }
    }

    /// Restore the ascending-longest-free order around `pos` after a
    /// region's fragmentation changed.
    fn fix(&mut self, pos: usize) {
        let mut pos = pos;
        // Rise toward the front while strictly more fragmented than
        // the predecessor.
        while pos > 0 && self.better_to_alloc(self.order[pos], self.order[pos - 1]) {
            self.order.swap(pos, pos - 1);
            pos -= 1;
        }
        // Fall toward the back while the successor is more fragmented.
        while pos + 1 < self.order.len() && self.better_to_alloc(self.order[pos + 1], self.order[pos])
        {
            self.order.swap(pos, pos + 1);
            pos += 1;
        }
    }

    #[inline]
    fn better_to_alloc(&self, a: usize, b: usize) -> bool {
        self.regions[a].longest_free() < self.regions[b].longest_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::clock as test_clock;
    use alloc::string::String;
    use core::cell::RefCell;
    use tessera_core::{Error, Result};

    #[derive(Default)]
    struct FakeUnback {
        calls: RefCell<Vec<PageRange>>,
        fail: RefCell<bool>,
    }

    impl Unback for &FakeUnback {
        fn unback(&mut self, r: PageRange) -> Result<()> {
            if *self.fail.borrow() {
                return Err(Error::UnbackFailed);
            }
            self.calls.borrow_mut().push(r);
            Ok(())
        }
    }

    fn region_at(hp: usize) -> HugeRegion {
        HugeRegion::new(
            HugeRange::new(HugePage(hp), HugeRegion::SIZE),
            test_clock::get(),
        )
    }

    fn check_conservation(r: &HugeRegion) {
        assert_eq!(
            r.used_pages() + r.free_pages() + r.unmapped_pages(),
            HugeRegion::SIZE.in_pages()
        );
    }

    #[test]
    fn lazy_backing_on_first_get() {
        test_clock::reset();
        let mut r = region_at(0);
        assert_eq!(r.backed(), HugeLength::ZERO);
        check_conservation(&r);

        let (page, from_released) = r.maybe_get(Length(100)).expect("fits");
        assert_eq!(page, PageId(0));
        assert!(from_released);
        assert_eq!(r.backed(), HugeLength(1));
        assert_eq!(r.used_pages(), Length(100));
        check_conservation(&r);

        // A second allocation on the same huge page is already backed.
        let (_, from_released) = r.maybe_get(Length(50)).expect("fits");
        assert!(!from_released);
        check_conservation(&r);
    }

    #[test]
    fn get_spanning_huge_pages_backs_them_all() {
        test_clock::reset();
        let mut r = region_at(0);
        let n = Length(PAGES_PER_HUGE_PAGE * 3 + 10);
        let (page, from_released) = r.maybe_get(n).expect("fits");
        assert_eq!(page, PageId(0));
        assert!(from_released);
        assert_eq!(r.backed(), HugeLength(4));
        check_conservation(&r);
    }

    #[test]
    fn put_with_release_unbacks_emptied_huge_pages() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut r = region_at(0);
        let n = Length(PAGES_PER_HUGE_PAGE * 2);
        let (page, _) = r.maybe_get(n).expect("fits");

        let mut unback = &ub;
        r.put(page, n, true, &mut unback);
        assert_eq!(r.used_pages(), Length::ZERO);
        assert_eq!(r.backed(), HugeLength::ZERO);
        assert_eq!(r.unmapped_pages(), HugeRegion::SIZE.in_pages());
        // Both huge pages came back in one contiguous call.
        assert_eq!(ub.calls.borrow().len(), 1);
        assert_eq!(ub.calls.borrow()[0].len, Length(PAGES_PER_HUGE_PAGE * 2));
        check_conservation(&r);
    }

    #[test]
    fn put_without_release_keeps_backing() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut r = region_at(0);
        let (page, _) = r.maybe_get(Length(PAGES_PER_HUGE_PAGE)).expect("fits");

        let mut unback = &ub;
        r.put(page, Length(PAGES_PER_HUGE_PAGE), false, &mut unback);
        assert_eq!(r.free_backed(), HugeLength(1));
        assert!(ub.calls.borrow().is_empty());

        // An explicit release picks the idle huge page up.
        let released = r.release(1.0, &mut unback);
        assert_eq!(released, HugeLength(1));
        assert_eq!(r.free_backed(), HugeLength::ZERO);
        check_conservation(&r);
    }

    #[test]
    fn release_fraction_is_a_ceiling_with_minimum_one() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut r = region_at(0);
        // Back three huge pages, then idle them.
        let n = Length(PAGES_PER_HUGE_PAGE * 3);
        let (page, _) = r.maybe_get(n).expect("fits");
        let mut unback = &ub;
        r.put(page, n, false, &mut unback);
        assert_eq!(r.free_backed(), HugeLength(3));

        // ceil(0.4 * 3) = 2.
        assert_eq!(r.release(0.4, &mut unback), HugeLength(2));
        // A tiny fraction still releases one.
        assert_eq!(r.release(0.01, &mut unback), HugeLength(1));
        assert_eq!(r.free_backed(), HugeLength::ZERO);
    }

    #[test]
    fn failed_unback_keeps_pages_backed() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut r = region_at(0);
        let (page, _) = r.maybe_get(Length(PAGES_PER_HUGE_PAGE)).expect("fits");
        *ub.fail.borrow_mut() = true;

        let mut unback = &ub;
        r.put(page, Length(PAGES_PER_HUGE_PAGE), true, &mut unback);
        assert_eq!(r.backed(), HugeLength(1));
        assert_eq!(r.free_backed(), HugeLength(1));
        check_conservation(&r);

        *ub.fail.borrow_mut() = false;
        assert_eq!(r.release(1.0, &mut unback), HugeLength(1));
        check_conservation(&r);
    }

    #[test]
    fn span_stats_split_by_backing() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut r = region_at(0);
        // Back two huge pages, free them, release only the first.
        let n = Length(PAGES_PER_HUGE_PAGE * 2);
        let (page, _) = r.maybe_get(n).expect("fits");
        // Keep a sentinel allocation on the second huge page so it
        // stays backed, then free it without release.
        let (sentinel, _) = r.maybe_get(Length(1)).expect("fits");
        assert_eq!(sentinel, page + n);
        let mut unback = &ub;
        r.put(page, n, true, &mut unback);
        r.put(sentinel, Length(1), false, &mut unback);

        let mut small = SmallSpanStats::default();
        let mut large = LargeSpanStats::default();
        r.add_span_stats(Some(&mut small), Some(&mut large));
        // One free run covers the whole region: two huge pages
        // unbacked, one backed, the rest unbacked.
        assert!(large.returned_pages > Length::ZERO);
        assert_eq!(large.normal_pages, Length(PAGES_PER_HUGE_PAGE));
        check_conservation(&r);
    }

    #[test]
    fn set_prefers_most_fragmented_region() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut set = HugeRegionSet::new(RegionUsageOption::Default, &ub);

        // Region A keeps a 500-page tail, region B a 100-page tail.
        let mut a = region_at(0);
        a.maybe_get(Length(REGION_PAGES - 500)).expect("fits");
        let mut b = region_at(REGION_HUGE_PAGES);
        b.maybe_get(Length(REGION_PAGES - 100)).expect("fits");
        set.contribute(a);
        set.contribute(b);
        assert_eq!(set.active_regions(), 2);

        // Both fit 50 pages; the tighter region (B) wins.
        let (page, _) = set.maybe_get(Length(50)).expect("fits");
        let b_first = HugePage(REGION_HUGE_PAGES).first_page();
        assert!(page >= b_first, "allocated from the roomier region");
    }

    #[test]
    fn set_routes_puts_by_address() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut set = HugeRegionSet::new(RegionUsageOption::Default, &ub);
        set.contribute(region_at(0));
        set.contribute(region_at(REGION_HUGE_PAGES));

        let (page, _) = set.maybe_get(Length(64)).expect("fits");
        assert!(set.maybe_put(page, Length(64)));
        // A page outside both regions is not ours.
        assert!(!set.maybe_put(PageId(3 * REGION_PAGES), Length(1)));
    }

    #[test]
    fn set_use_more_often_defers_release() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut set = HugeRegionSet::new(RegionUsageOption::UseForAllLargeAllocs, &ub);
        set.contribute(region_at(0));

        let n = Length(PAGES_PER_HUGE_PAGE);
        let (page, _) = set.maybe_get(n).expect("fits");
        assert!(set.maybe_put(page, n));
        // Not unbacked on free.
        assert_eq!(set.free_backed(), HugeLength(1));
        assert!(ub.calls.borrow().is_empty());

        // Explicit release does it.
        assert_eq!(set.release_pages(1.0), n);
        assert_eq!(set.free_backed(), HugeLength::ZERO);
    }

    #[test]
    fn set_reorders_after_churn() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut set = HugeRegionSet::new(RegionUsageOption::Default, &ub);
        let mut a = region_at(0);
        a.maybe_get(Length(REGION_PAGES - 100)).expect("fits");
        set.contribute(a);
        set.contribute(region_at(REGION_HUGE_PAGES));

        // The tight region fills completely; the next allocation has
        // to come from the roomy one.
        let (p1, _) = set.maybe_get(Length(100)).expect("fits");
        assert!(p1 < HugePage(REGION_HUGE_PAGES).first_page());
        let (p2, _) = set.maybe_get(Length(100)).expect("fits");
        assert!(p2 >= HugePage(REGION_HUGE_PAGES).first_page());
    }

    #[test]
    fn set_reports_are_well_formed() {
        test_clock::reset();
        let ub = FakeUnback::default();
        let mut set = HugeRegionSet::new(RegionUsageOption::Default, &ub);
        set.contribute(region_at(0));
        set.maybe_get(Length(1000)).expect("fits");

        let mut buf = String::new();
        let mut out = Printer::new(&mut buf);
        set.print(&mut out);
        assert!(buf.contains("HugeRegionSet: 1 total regions"));
        assert!(buf.contains("HugeRegion:"));

        let mut buf = String::new();
        {
            let mut root = PbtxtRegion::new(&mut buf);
            set.print_in_pbtxt(&mut root);
        }
        for key in [
            "min_huge_region_alloc_size",
            "huge_region_size",
            "huge_region_details",
            "used_bytes",
            "backed_fully_free_bytes",
        ] {
            assert!(buf.contains(key), "missing {key}");
        }
    }
}
