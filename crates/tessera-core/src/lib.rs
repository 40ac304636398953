//! # Tessera Core
//!
//! Foundational types and traits for the tessera huge page allocator.
//!
//! This crate provides the typed units (pages, huge pages, lengths),
//! the error type, the injectable monotonic clock, and the abstract
//! memory-release primitive shared by the allocator crates.
//!
//! ## Design Principles
//!
//! 1. **Typed units**: page counts and page indices are distinct types,
//!    so unit mixups fail to compile
//! 2. **No hidden state**: clocks and OS primitives are injected,
//!    never ambient
//! 3. **`no_std` first**: everything here works without an allocator

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod clock;
pub mod error;
pub mod types;
pub mod unback;

// Re-exports for convenience
pub use clock::Clock;
pub use error::{Error, Result};
pub use types::*;
pub use unback::Unback;
