//! The abstract OS memory-release primitive.

use crate::error::Result;
use crate::types::PageRange;

/// Returns a range of pages to the operating system.
///
/// The contract mirrors `madvise(MADV_DONTNEED)`: on success the pages
/// stop consuming physical memory but the mapping remains reservable,
/// and touching them later faults fresh zero pages back in. On failure
/// the implementation must leave the range untouched; callers keep
/// accounting the pages as backed and will retry on a later pass.
///
/// Implementations may block. When the filler invokes this for a whole
/// huge page from a free path, its own bookkeeping is already
/// consistent, so an implementation that drops a caller-held heap lock
/// around the syscall observes a well-formed allocator.
pub trait Unback {
    /// Release `r` to the OS.
    fn unback(&mut self, r: PageRange) -> Result<()>;
}

impl<F: FnMut(PageRange) -> Result<()>> Unback for F {
    fn unback(&mut self, r: PageRange) -> Result<()> {
        self(r)
    }
}
