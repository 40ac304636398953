//! Per-huge-page allocation and release state.

use bitflags::bitflags;
use tessera_core::{
    HugePage, Length, PageId, PageRange, Unback, PAGES_PER_HUGE_PAGE,
};

use crate::lists::ListLink;
use crate::range::{Bitmap, RangeTracker};
use crate::stats::{LargeSpanStats, SmallSpanStats, MAX_SMALL_SPAN_PAGES};

// =============================================================================
// TRACKER FLAGS
// =============================================================================

bitflags! {
    /// Lifecycle flags of a page tracker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrackerFlags: u8 {
        /// Currently sitting in the donated list.
        const DONATED = 1 << 0;
        /// Came from the tail of a multi-huge-page allocation.
        /// Immutable after creation.
        const WAS_DONATED = 1 << 1;
        /// Was fully released at some point, then refilled.
        const WAS_RELEASED = 1 << 2;
        /// Originating oversized allocation was freed but the huge
        /// page could not be reassembled.
        const ABANDONED = 1 << 3;
        /// At least one subrelease has succeeded on this huge page.
        const BROKEN = 1 << 4;
        /// A dense placement has happened here. Latches on.
        const DENSE_SPANS = 1 << 5;
    }
}

// =============================================================================
// PAGE TRACKER
// =============================================================================

/// Result of [`PageTracker::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocation {
    /// First page of the claimed run.
    pub page: PageId,
    /// Pages of the claimed run that were released to the OS and are
    /// being touched back in. The caller must account for them as
    /// re-backed.
    pub previously_unbacked: Length,
}

/// Tracks the allocation and released state of every small page within
/// a single huge page.
///
/// Two bitmaps: the allocation bitmap (inside [`RangeTracker`], set =
/// allocated) and the released bitmap (set = returned to the OS).
/// Released pages are always free; `released_count <= free`. All
/// mutation happens under the caller's page-heap lock.
#[derive(Debug)]
pub struct PageTracker {
    location: HugePage,
    free: RangeTracker,
    /// Bitmap of pages released to the OS.
    ///
    /// Marked before any lock is dropped to release memory, so the
    /// bitmap never claims less than the OS state. A huge page counts
    /// as released until the bitmap is fully drained again by `get`.
    released_by_page: Bitmap,
    /// Cached `released_by_page.count_range(0, PAGES_PER_HUGE_PAGE)`.
    released_count: u16,
    abandoned_count: u16,
    flags: TrackerFlags,
    pub(crate) link: ListLink,
}

const _: () = assert!(PAGES_PER_HUGE_PAGE < u16::MAX as usize);

impl PageTracker {
    /// A tracker for huge page `location`, entirely free and backed.
    pub fn new(location: HugePage, was_donated: bool) -> Self {
        Self {
            location,
            free: RangeTracker::new(PAGES_PER_HUGE_PAGE),
            released_by_page: Bitmap::new(PAGES_PER_HUGE_PAGE),
            released_count: 0,
            abandoned_count: 0,
            flags: if was_donated {
                TrackerFlags::WAS_DONATED
            } else {
                TrackerFlags::empty()
            },
            link: ListLink::default(),
        }
    }

    /// The huge page whose availability is being tracked.
    #[inline]
    pub fn location(&self) -> HugePage {
        self.location
    }

    /// Claim the earliest run of `n` free pages.
    ///
    /// Requires a free range of at least `n` pages; the absence of one
    /// is a caller bug.
    pub fn get(&mut self, n: Length) -> PageAllocation {
        let index = self.free.find_and_mark(n.raw());
        self.debug_check_released_count();

        let mut unbacked = 0;
        if self.released_count > 0 {
            unbacked = self.released_by_page.count_range(index, n.raw());
            self.released_by_page.clear_range(index, n.raw());
            debug_assert!(self.released_count as usize >= unbacked);
            self.released_count -= unbacked as u16;
        }

        self.debug_check_released_count();
        PageAllocation {
            page: self.location.first_page() + Length(index),
            previously_unbacked: Length(unbacked),
        }
    }

    /// Free the run `[p, p + n)` claimed by an earlier [`get`].
    ///
    /// No unbacking happens here; released state is untouched.
    ///
    /// [`get`]: PageTracker::get
    pub fn put(&mut self, p: PageId, n: Length) {
        let index = p - self.location.first_page();
        self.free.unmark(index.raw(), n.raw());
    }

    /// Return every backed free page to the OS via `unback`.
    ///
    /// Walks the intersections of backed runs (clear bits of the
    /// released bitmap) with free runs. Ranges the primitive declines
    /// stay backed and unmarked, so releasing state and OS state never
    /// diverge. Returns the number of pages unbacked.
    pub fn release_free(&mut self, unback: &mut dyn Unback) -> Length {
        let mut count = 0;
        let mut index = 0;
        while let Some((start, n)) = self.released_by_page.next_free_range(index) {
            index = start;
            // Look for freed pages within this still-backed range.
            let overlap = self
                .free
                .next_free_range(index)
                .filter(|&(free_index, _)| free_index < index + n);
            match overlap {
                Some((free_index, free_n)) => {
                    let end = (free_index + free_n).min(index + n);
                    let length = end - free_index;
                    debug_assert_eq!(self.released_by_page.count_range(free_index, length), 0);
                    let p = self.location.first_page() + Length(free_index);
                    if unback.unback(PageRange::new(p, Length(length))).is_ok() {
                        self.flags.insert(TrackerFlags::BROKEN);
                        self.released_by_page.set_range(free_index, length);
                        count += length;
                    }
                    index = end;
                }
                None => {
                    // No free pages overlap this backed range; move to
                    // the next one.
                    index = start + n;
                }
            }
        }

        self.released_count += count as u16;
        debug_assert!((self.released_count as usize) <= PAGES_PER_HUGE_PAGE);
        self.debug_check_released_count();
        Length(count)
    }

    /// Accumulate free-span histograms, classifying each maximal free
    /// run by its backed/released state.
    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        let mut index = 0;
        while let Some((start, run)) = self.free.next_free_range(index) {
            index = start;
            let is_released = self.released_by_page.get(index);
            // Truncate the run at the point where the released state
            // flips.
            let end = if index >= PAGES_PER_HUGE_PAGE - 1 {
                PAGES_PER_HUGE_PAGE
            } else if is_released {
                self.released_by_page
                    .find_clear(index + 1)
                    .unwrap_or(PAGES_PER_HUGE_PAGE)
            } else {
                self.released_by_page
                    .find_set(index + 1)
                    .unwrap_or(PAGES_PER_HUGE_PAGE)
            };
            let n = run.min(end - index);
            debug_assert!(n > 0);

            if n < MAX_SMALL_SPAN_PAGES {
                if let Some(small) = small.as_deref_mut() {
                    if is_released {
                        small.returned_length[n] += 1;
                    } else {
                        small.normal_length[n] += 1;
                    }
                }
            } else if let Some(large) = large.as_deref_mut() {
                large.spans += 1;
                if is_released {
                    large.returned_pages += Length(n);
                } else {
                    large.normal_pages += Length(n);
                }
            }

            index += n;
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Longest contiguous free run.
    #[inline]
    pub fn longest_free_range(&self) -> Length {
        Length(self.free.longest_free())
    }

    /// Number of live runs handed out by [`get`](PageTracker::get).
    #[inline]
    pub fn nallocs(&self) -> usize {
        self.free.allocs()
    }

    /// Pages currently allocated.
    #[inline]
    pub fn used_pages(&self) -> Length {
        Length(self.free.used())
    }

    /// Pages currently free (backed or released).
    #[inline]
    pub fn free_pages(&self) -> Length {
        Length(self.free.free())
    }

    /// Pages currently returned to the OS.
    #[inline]
    pub fn released_pages(&self) -> Length {
        Length(self.released_count as usize)
    }

    /// True if any unused pages have been returned to the OS.
    #[inline]
    pub fn released(&self) -> bool {
        self.released_count > 0
    }

    /// True while no subrelease has ever succeeded here.
    #[inline]
    pub fn unbroken(&self) -> bool {
        !self.flags.contains(TrackerFlags::BROKEN)
    }

    /// True if no pages are allocated.
    #[inline]
    pub fn empty(&self) -> bool {
        self.free.used() == 0
    }

    // =========================================================================
    // FLAGS
    // =========================================================================

    /// Is the tracker currently on the donated list?
    ///
    /// Only meaningful while the tracker is held by a filler list.
    #[inline]
    pub fn donated(&self) -> bool {
        self.flags.contains(TrackerFlags::DONATED)
    }

    /// Set or clear the donated flag. Donated status is lost when
    /// further allocations are placed on the tracker.
    #[inline]
    pub fn set_donated(&mut self, status: bool) {
        self.flags.set(TrackerFlags::DONATED, status);
    }

    /// Was the huge page given to the filler in the donated state?
    /// Never cleared, so the layer above can track persistent
    /// donations.
    #[inline]
    pub fn was_donated(&self) -> bool {
        self.flags.contains(TrackerFlags::WAS_DONATED)
    }

    /// Did this tracker go from fully released back to fully backed?
    #[inline]
    pub fn was_released(&self) -> bool {
        self.flags.contains(TrackerFlags::WAS_RELEASED)
    }

    /// Set or clear the was-released flag.
    #[inline]
    pub fn set_was_released(&mut self, status: bool) {
        self.flags.set(TrackerFlags::WAS_RELEASED, status);
    }

    /// Was the originating allocation of this donated page freed while
    /// other allocations kept the huge page alive?
    #[inline]
    pub fn abandoned(&self) -> bool {
        self.flags.contains(TrackerFlags::ABANDONED)
    }

    /// Set or clear the abandoned flag.
    #[inline]
    pub fn set_abandoned(&mut self, status: bool) {
        self.flags.set(TrackerFlags::ABANDONED, status);
    }

    /// Pages left behind by the originating oversized allocation.
    ///
    /// Requires [`was_donated`](PageTracker::was_donated).
    #[inline]
    pub fn abandoned_count(&self) -> Length {
        Length(self.abandoned_count as usize)
    }

    /// Record the abandoned page count.
    #[inline]
    pub fn set_abandoned_count(&mut self, count: Length) {
        debug_assert!(self.was_donated());
        self.abandoned_count = count.raw() as u16;
    }

    /// Has a dense placement ever happened here?
    #[inline]
    pub fn has_dense_spans(&self) -> bool {
        self.flags.contains(TrackerFlags::DENSE_SPANS)
    }

    /// Latch the dense-spans flag.
    #[inline]
    pub fn set_has_dense_spans(&mut self) {
        self.flags.insert(TrackerFlags::DENSE_SPANS);
    }

    #[inline]
    fn debug_check_released_count(&self) {
        debug_assert_eq!(
            self.released_by_page.count_range(0, PAGES_PER_HUGE_PAGE),
            self.released_count as usize
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use tessera_core::Error;

    fn ok_unback(_: PageRange) -> tessera_core::Result<()> {
        Ok(())
    }

    #[test]
    fn conservation() {
        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(100));
        assert_eq!(a.page, PageId(0));
        assert_eq!(a.previously_unbacked, Length::ZERO);
        assert_eq!(pt.used_pages() + pt.free_pages(), Length(PAGES_PER_HUGE_PAGE));
        assert_eq!(pt.nallocs(), 1);
        pt.put(a.page, Length(100));
        assert!(pt.empty());
        assert_eq!(pt.longest_free_range(), Length(PAGES_PER_HUGE_PAGE));
    }

    #[test]
    fn release_free_marks_only_free_pages() {
        let mut pt = PageTracker::new(HugePage(2), false);
        let a = pt.get(Length(256));
        pt.put(a.page + Length(64), Length(64));

        let mut seen = Vec::new();
        let mut unback = |r: PageRange| {
            seen.push(r);
            Ok(())
        };
        let released = pt.release_free(&mut unback);
        assert_eq!(released, Length(64));
        assert_eq!(pt.released_pages(), Length(64));
        assert!(pt.released());
        assert!(!pt.unbroken());
        // One contiguous free run, released in one call.
        assert_eq!(
            seen,
            alloc::vec![PageRange::new(HugePage(2).first_page() + Length(64), Length(64))]
        );
    }

    #[test]
    fn release_free_failure_leaves_state() {
        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(256));
        pt.put(a.page, Length(32));
        pt.put(a.page + Length(128), Length(32));

        // Fail the first range, allow the second.
        let mut calls = 0;
        let mut unback = |_: PageRange| {
            calls += 1;
            if calls == 1 {
                Err(Error::UnbackFailed)
            } else {
                Ok(())
            }
        };
        let released = pt.release_free(&mut unback);
        assert_eq!(calls, 2);
        assert_eq!(released, Length(32));
        assert_eq!(pt.released_pages(), Length(32));
        // The failed range is still backed-free: a second pass picks
        // it up.
        let mut all_ok = ok_unback;
        assert_eq!(pt.release_free(&mut all_ok), Length(32));
        assert_eq!(pt.released_pages(), Length(64));
    }

    #[test]
    fn get_reclaims_released_pages() {
        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(256));
        pt.put(a.page, Length(64));
        let mut unback = ok_unback;
        assert_eq!(pt.release_free(&mut unback), Length(64));

        // The earliest fitting run overlaps the released prefix.
        let b = pt.get(Length(16));
        assert_eq!(b.page, PageId(0));
        assert_eq!(b.previously_unbacked, Length(16));
        assert_eq!(pt.released_pages(), Length(48));
    }

    #[test]
    fn span_stats_split_by_released_state() {
        let mut pt = PageTracker::new(HugePage(0), false);
        let a = pt.get(Length(256));
        // Free [0, 8) and [128, 224), then release both.
        pt.put(a.page, Length(8));
        pt.put(a.page + Length(128), Length(96));
        let mut unback = ok_unback;
        assert_eq!(pt.release_free(&mut unback), Length(104));

        // A 16-page request skips the 8-page hole and claims
        // [128, 144) out of the released run; freeing it again leaves
        // that piece backed.
        let b = pt.get(Length(16));
        assert_eq!(b.page, PageId(128));
        assert_eq!(b.previously_unbacked, Length(16));
        pt.put(b.page, Length(16));

        let mut small = SmallSpanStats::default();
        let mut large = LargeSpanStats::default();
        pt.add_span_stats(Some(&mut small), Some(&mut large));
        // [0, 8) released, [128, 144) backed, [144, 224) released.
        assert_eq!(small.returned_length[8], 1);
        assert_eq!(small.normal_length[16], 1);
        assert_eq!(large.spans, 1);
        assert_eq!(large.returned_pages, Length(80));
        assert_eq!(large.normal_pages, Length::ZERO);
    }

    #[test]
    fn dense_spans_latch() {
        let mut pt = PageTracker::new(HugePage(0), false);
        assert!(!pt.has_dense_spans());
        pt.set_has_dense_spans();
        assert!(pt.has_dense_spans());
    }

    #[test]
    fn abandoned_count_roundtrip() {
        let mut pt = PageTracker::new(HugePage(0), true);
        assert!(pt.was_donated());
        pt.set_abandoned(true);
        pt.set_abandoned_count(Length(17));
        assert!(pt.abandoned());
        assert_eq!(pt.abandoned_count(), Length(17));
    }
}
