//! Diagnostic output plumbing.
//!
//! Two sinks: a free-form text [`Printer`] for the human-readable
//! report, and a [`PbtxtRegion`] emitter producing nested
//! `key: value` regions with stable field names for machine
//! consumption. Printing is advisory; formatter errors are swallowed
//! and never disturb allocator state.

use core::fmt;

// =============================================================================
// PRINTER
// =============================================================================

/// Append-only text sink for the human-readable statistics report.
pub struct Printer<'a> {
    out: &'a mut dyn fmt::Write,
}

impl<'a> Printer<'a> {
    /// Wrap a formatter sink.
    pub fn new(out: &'a mut dyn fmt::Write) -> Self {
        Self { out }
    }

    /// Append formatted text, ignoring sink errors.
    #[inline]
    pub fn print(&mut self, args: fmt::Arguments<'_>) {
        let _ = self.out.write_fmt(args);
    }
}

// =============================================================================
// PBTXT REGION
// =============================================================================

/// Emitter for one `name { key: value ... }` region of pbtxt output.
///
/// Sub-regions borrow the parent; the closing brace is written when
/// the sub-region is dropped.
pub struct PbtxtRegion<'a> {
    out: &'a mut dyn fmt::Write,
    depth: usize,
}

impl<'a> PbtxtRegion<'a> {
    /// The root region. Emits no braces of its own.
    pub fn new(out: &'a mut dyn fmt::Write) -> Self {
        Self { out, depth: 0 }
    }

    #[inline]
    fn indent(&self) -> usize {
        self.depth * 2
    }

    /// Emit an integer field.
    pub fn print_i64(&mut self, key: &str, value: i64) {
        let _ = writeln!(self.out, "{:1$}{key}: {value}", "", self.indent());
    }

    /// Emit a bare (unquoted) field value, e.g. an enumerator name.
    pub fn print_raw(&mut self, key: &str, value: &str) {
        let _ = writeln!(self.out, "{:1$}{key}: {value}", "", self.indent());
    }

    /// Open a nested region. The region closes when dropped.
    pub fn sub_region(&mut self, name: &str) -> PbtxtRegion<'_> {
        let _ = writeln!(self.out, "{:1$}{name} {{", "", self.indent());
        PbtxtRegion {
            out: self.out,
            depth: self.depth + 1,
        }
    }
}

impl Drop for PbtxtRegion<'_> {
    fn drop(&mut self) {
        if self.depth > 0 {
            let _ = writeln!(self.out, "{:1$}}}", "", (self.depth - 1) * 2);
        }
    }
}
