//! Tracker storage and hinted freelists.
//!
//! Page trackers live in a slab arena and are referred to by stable
//! [`TrackerId`]s. The filler's freelists are intrusive doubly-linked
//! lists threaded through the trackers' link fields, grouped into an
//! array of lists with a summary bitmap so the least non-empty list at
//! or after a hint is found with one bit scan.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use crate::range::Bitmap;
use crate::tracker::PageTracker;

// =============================================================================
// TRACKER ID
// =============================================================================

/// Stable handle to a [`PageTracker`] in a [`TrackerArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerId(u32);

impl TrackerId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Intrusive list linkage embedded in each tracker.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ListLink {
    prev: Option<TrackerId>,
    next: Option<TrackerId>,
}

// =============================================================================
// TRACKER ARENA
// =============================================================================

/// Slab of page trackers with a free list of vacant slots.
///
/// Handles stay valid until the tracker is removed; slots are reused
/// afterwards.
#[derive(Debug, Default)]
pub struct TrackerArena {
    slots: Vec<Option<PageTracker>>,
    vacant: Vec<u32>,
    len: usize,
}

impl TrackerArena {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live trackers.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no trackers are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a tracker, returning its handle.
    pub fn insert(&mut self, pt: PageTracker) -> TrackerId {
        self.len += 1;
        if let Some(slot) = self.vacant.pop() {
            debug_assert!(self.slots[slot as usize].is_none());
            self.slots[slot as usize] = Some(pt);
            TrackerId(slot)
        } else {
            self.slots.push(Some(pt));
            TrackerId((self.slots.len() - 1) as u32)
        }
    }

    /// Remove a tracker, invalidating its handle.
    pub fn remove(&mut self, id: TrackerId) -> PageTracker {
        let pt = self.slots[id.index()]
            .take()
            .expect("removing a vacant tracker slot");
        self.vacant.push(id.0);
        self.len -= 1;
        pt
    }
}

impl Index<TrackerId> for TrackerArena {
    type Output = PageTracker;

    #[inline]
    fn index(&self, id: TrackerId) -> &PageTracker {
        self.slots[id.index()].as_ref().expect("vacant tracker slot")
    }
}

impl IndexMut<TrackerId> for TrackerArena {
    #[inline]
    fn index_mut(&mut self, id: TrackerId) -> &mut PageTracker {
        self.slots[id.index()].as_mut().expect("vacant tracker slot")
    }
}

// =============================================================================
// HINTED TRACKER LISTS
// =============================================================================

/// Head and tail of one intrusive list.
#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<TrackerId>,
    tail: Option<TrackerId>,
    len: usize,
}

/// An array of intrusive tracker lists plus a bitmap of which lists
/// are non-empty.
///
/// List indices are a quality key: lower indices are preferred for
/// allocation, and every list at a higher index can satisfy any
/// request a lower one could. [`get_least`](Self::get_least) is one
/// summary-bitmap scan.
#[derive(Debug)]
pub struct HintedTrackerLists {
    lists: Vec<ListHead>,
    nonempty: Bitmap,
    size: usize,
}

impl HintedTrackerLists {
    /// `n` empty lists.
    pub fn new(n: usize) -> Self {
        let mut lists = Vec::new();
        lists.resize_with(n, ListHead::default);
        Self {
            lists,
            nonempty: Bitmap::new(n),
            size: 0,
        }
    }

    /// Total trackers across all lists.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of trackers in list `i`.
    #[inline]
    pub fn list_len(&self, i: usize) -> usize {
        self.lists[i].len
    }

    /// Peek the head of the lowest-indexed non-empty list with index
    /// >= `start`. Returns the tracker and its list index.
    pub fn get_least(&self, start: usize) -> Option<(TrackerId, usize)> {
        let i = self.nonempty.find_set(start)?;
        let head = self.lists[i].head;
        debug_assert!(head.is_some());
        head.map(|id| (id, i))
    }

    /// Push `id` onto the front of list `i`.
    pub fn add(&mut self, arena: &mut TrackerArena, id: TrackerId, i: usize) {
        let old_head = self.lists[i].head;
        arena[id].link = ListLink {
            prev: None,
            next: old_head,
        };
        match old_head {
            Some(h) => arena[h].link.prev = Some(id),
            None => self.lists[i].tail = Some(id),
        }
        self.lists[i].head = Some(id);
        self.lists[i].len += 1;
        if self.lists[i].len == 1 {
            self.nonempty.set_bit(i);
        }
        self.size += 1;
    }

    /// Unlink `id` from list `i`.
    pub fn remove(&mut self, arena: &mut TrackerArena, id: TrackerId, i: usize) {
        debug_assert!(self.lists[i].len > 0);
        let link = arena[id].link;
        match link.prev {
            Some(p) => arena[p].link.next = link.next,
            None => {
                debug_assert_eq!(self.lists[i].head, Some(id));
                self.lists[i].head = link.next;
            }
        }
        match link.next {
            Some(n) => arena[n].link.prev = link.prev,
            None => {
                debug_assert_eq!(self.lists[i].tail, Some(id));
                self.lists[i].tail = link.prev;
            }
        }
        arena[id].link = ListLink::default();
        self.lists[i].len -= 1;
        if self.lists[i].len == 0 {
            self.nonempty.clear_bit(i);
        }
        self.size -= 1;
    }

    /// Visit every tracker in every list with index >= `start`, heads
    /// to tails, in list order.
    pub fn iter(&self, arena: &TrackerArena, start: usize, mut f: impl FnMut(TrackerId)) {
        let mut i = start;
        while let Some(list) = self.nonempty.find_set(i) {
            let mut cur = self.lists[list].head;
            while let Some(id) = cur {
                cur = arena[id].link.next;
                f(id);
            }
            i = list + 1;
        }
    }
}
