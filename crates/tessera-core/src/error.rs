//! Error handling for the tessera allocator stack.
//!
//! Errors here are conditions the allocator can observe and continue
//! from. Caller contract violations (freeing a range that was never
//! handed out, allocating past a tracker's longest free run) are not
//! errors; they are bugs, and the implementation asserts on them.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Tessera result type alias.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Unified error type for the allocator crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The OS declined to release a range of pages.
    ///
    /// The affected pages stay backed and accounted as backed; release
    /// passes skip them and retry later.
    UnbackFailed,
    /// Invalid parameter provided.
    InvalidParameter,
    /// No region or huge page can satisfy the request.
    Exhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnbackFailed => write!(f, "failed to return pages to the OS"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::Exhausted => write!(f, "no space available"),
        }
    }
}
