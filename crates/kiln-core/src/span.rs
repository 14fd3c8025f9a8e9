//! Source location tracking for diagnostics.
//!
//! Provides [`Span`], the start position of a bound node in its source file.

use std::fmt;

/// A span of source code, represented by its starting position.
///
/// Spans order by line, then column, which is what the diagnostics sink
/// relies on when it sorts a program's diagnostics for presentation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Span {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed, byte-based).
    pub col: u32,
    /// Length in bytes.
    pub len: u32,
}

impl Span {
    /// Create a new span from a line, column, and length.
    #[inline]
    pub fn new(line: u32, col: u32, len: u32) -> Self {
        Self { line, col, len }
    }

    /// Create a zero-length span at a position.
    #[inline]
    pub fn point(line: u32, col: u32) -> Self {
        Self { line, col, len: 0 }
    }

    /// Whether this span carries no location (compiler-synthesized code).
    #[inline]
    pub fn is_synthesized(&self) -> bool {
        self.line == 0
    }

    /// Merge two spans into one that starts at the earlier span.
    #[inline]
    pub fn merge(self, other: Span) -> Span {
        let (first, second) = if other < self { (other, self) } else { (self, other) };
        if first.line == second.line {
            let end_col = (second.col + second.len).max(first.col + first.len);
            Span::new(first.line, first.col, end_col - first.col)
        } else {
            Span::new(first.line, first.col, first.len + second.len)
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_order_by_line_then_column() {
        let mut spans = vec![Span::point(3, 1), Span::point(1, 9), Span::point(1, 2)];
        spans.sort();
        assert_eq!(spans, vec![Span::point(1, 2), Span::point(1, 9), Span::point(3, 1)]);
    }

    #[test]
    fn merge_is_order_independent() {
        let a = Span::new(1, 5, 3);
        let b = Span::new(1, 10, 3);
        assert_eq!(a.merge(b), b.merge(a));
        assert_eq!(a.merge(b), Span::new(1, 5, 8));
    }

    #[test]
    fn default_span_is_synthesized() {
        assert!(Span::default().is_synthesized());
        assert!(!Span::point(1, 1).is_synthesized());
        assert_eq!(format!("{}", Span::new(3, 15, 5)), "3:15");
    }
}
