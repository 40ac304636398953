//! # Tessera Filler
//!
//! Densely packs small allocations into huge pages, and adaptively
//! returns unused memory to the operating system.
//!
//! The two public mechanisms are:
//!
//! - [`HugePageFiller`](filler::HugePageFiller): places runs of small
//!   pages onto partially-filled huge pages, decides when to
//!   *subrelease* (return part of a huge page to the OS), and keeps a
//!   time-series record used to evaluate whether skipping a release
//!   was the right call.
//! - [`HugeRegionSet`](region::HugeRegionSet): fixed 1 GiB arenas for
//!   allocations too large for the filler but too small to round up to
//!   whole huge pages, with lazy backing and fragmentation-ordered
//!   placement.
//!
//! Both are single-threaded by contract: the caller serializes all
//! entry behind its page-heap lock. The OS release primitive is
//! abstract (see [`tessera_core::Unback`]) and injected at
//! construction, which keeps the crate testable without touching real
//! mappings.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod correctness;
pub mod filler;
pub mod lists;
pub mod range;
pub mod region;
pub mod report;
pub mod stats;
pub mod timeseries;
pub mod tracker;

// Re-exports for convenience
pub use filler::{AllocsOption, FillerConfig, HugePageFiller, TryGetResult};
pub use lists::TrackerId;
pub use region::{HugeRegion, HugeRegionSet, RegionUsageOption};
pub use stats::SkipSubreleaseIntervals;
pub use tracker::PageTracker;

#[cfg(test)]
pub(crate) mod test_util {
    //! Shared test scaffolding: a scripted clock.

    /// A thread-local fake clock. Each test runs on its own thread,
    /// so tests never see each other's time.
    pub(crate) mod clock {
        use core::cell::Cell;
        use core::time::Duration;
        use tessera_core::Clock;

        std::thread_local! {
            static NOW: Cell<i64> = Cell::new(0);
        }

        /// Ticks per second of the fake clock.
        pub const FREQ: f64 = 1_000_000.0;

        fn now() -> i64 {
            NOW.with(|c| c.get())
        }

        fn freq() -> f64 {
            FREQ
        }

        /// The scripted clock for the current test thread.
        pub fn get() -> Clock {
            Clock { now, freq }
        }

        /// Rewind the clock to zero.
        pub fn reset() {
            NOW.with(|c| c.set(0));
        }

        /// Advance the clock by `d`.
        pub fn advance(d: Duration) {
            NOW.with(|c| c.set(c.get() + (d.as_secs_f64() * FREQ) as i64));
        }
    }
}
