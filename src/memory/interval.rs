use std::fmt;

/// A half-open byte range `[offset, offset + length)` inside one arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    pub offset: usize,
    pub length: usize,
}

impl Interval {
    #[must_use]
    pub const fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// Build an interval from its start and (exclusive) end.
    #[must_use]
    pub const fn from_bounds(start: usize, end: usize) -> Self {
        Self {
            offset: start,
            length: end.saturating_sub(start),
        }
    }

    /// Exclusive end offset.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True when `other` lies entirely inside `self`.
    #[must_use]
    pub const fn contains(&self, other: &Interval) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// True when the two ranges share at least one byte.
    #[must_use]
    pub const fn overlaps(&self, other: &Interval) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.offset < other.end()
            && other.offset < self.end()
    }

    /// True when one range ends exactly where the other starts.
    #[must_use]
    pub const fn touches(&self, other: &Interval) -> bool {
        self.end() == other.offset || other.end() == self.offset
    }

    /// Sub-range relative to this interval's start.
    #[must_use]
    pub const fn slice(&self, start: usize, length: usize) -> Interval {
        Interval::new(self.offset + start, length)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}
