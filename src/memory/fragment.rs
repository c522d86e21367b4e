//! Move-only views over reserved arena bytes.
//!
//! A [`BufferFragment`] exists only while its interval is reserved. Splitting
//! yields two disjoint fragments, merging consumes both inputs, and releasing
//! consumes the fragment, so a released range can never be read again and no
//! range can be released twice. A fragment dropped without an explicit
//! [`release`](BufferFragment::release) gives its range back on drop, which
//! keeps error paths from leaking arena space.

use super::{Arena, Interval};
use crate::error::{Result, ShardError};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::warn;

static EMPTY_ARENA: LazyLock<Arc<Arena>> = LazyLock::new(|| Arena::new(0));

pub struct BufferFragment {
    arena: Arc<Arena>,
    interval: Interval,
}

impl BufferFragment {
    pub(crate) fn from_reserved(arena: Arc<Arena>, interval: Interval) -> Self {
        Self { arena, interval }
    }

    /// The shared zero-length fragment.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            arena: Arc::clone(&EMPTY_ARENA),
            interval: Interval::default(),
        }
    }

    /// Allocate a standalone arena of exactly `length` bytes and return a
    /// fragment that owns all of it.
    #[must_use]
    pub fn create(length: usize) -> Self {
        let arena = Arena::new(length);
        let interval = Interval::new(0, length);
        // A fresh tracker has nothing reserved, so this cannot overlap.
        if let Err(err) = arena.tracker().reserve(interval) {
            warn!(error = %err, "fresh arena refused its own range");
        }
        Self { arena, interval }
    }

    /// Standalone fragment holding a copy of `bytes`.
    #[must_use]
    pub fn copy_of(bytes: &[u8]) -> Self {
        let mut fragment = Self::create(bytes.len());
        fragment.as_mut_slice().copy_from_slice(bytes);
        fragment
    }

    /// Reserve `interval` of `arena` now.
    ///
    /// # Errors
    /// `RangeUnavailable` if any of it is taken.
    pub fn reserve(arena: &Arc<Arena>, interval: Interval) -> Result<Self> {
        arena.tracker().reserve(interval)?;
        Ok(Self::from_reserved(Arc::clone(arena), interval))
    }

    /// Reserve `interval` of `arena`, waiting until it is free.
    ///
    /// # Errors
    /// `CapacityExceeded` if the interval lies past the arena end.
    pub async fn reserve_async(arena: &Arc<Arena>, interval: Interval) -> Result<Self> {
        let granted = arena.tracker().reserve_async(interval).await?;
        Ok(Self::from_reserved(Arc::clone(arena), granted))
    }

    /// Give the range back to the tracker.
    ///
    /// # Errors
    /// `NotReserved` if the tracker no longer knows the range.
    pub fn release(mut self) -> Result<()> {
        let interval = std::mem::take(&mut self.interval);
        self.arena.tracker().release(interval)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interval.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interval.is_empty()
    }

    #[must_use]
    pub fn interval(&self) -> Interval {
        self.interval
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: this fragment holds the reservation for `interval` and only
        // hands out shared views while borrowed immutably.
        unsafe { self.arena.bytes(self.interval) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: this fragment holds the reservation exclusively and `&mut self`
        // rules out any other live view of it.
        unsafe { self.arena.bytes_mut(self.interval) }
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.as_slice().iter().copied()
    }

    /// True when both fragments view the same arena.
    #[must_use]
    pub fn same_arena(&self, other: &BufferFragment) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena)
    }

    /// True when `other` can be merged into `self` in either order.
    #[must_use]
    pub fn is_mergeable(&self, other: &BufferFragment) -> bool {
        self.is_empty()
            || other.is_empty()
            || (self.same_arena(other) && self.interval.touches(&other.interval))
    }

    /// True when `other` starts exactly where `self` ends.
    #[must_use]
    pub fn is_followed_by(&self, other: &BufferFragment) -> bool {
        self.is_empty()
            || other.is_empty()
            || (self.same_arena(other) && self.interval.end() == other.interval.offset)
    }

    /// Detach the interval so dropping `self` releases nothing.
    fn disarm(mut self) -> (Arc<Arena>, Interval) {
        let interval = std::mem::take(&mut self.interval);
        (Arc::clone(&self.arena), interval)
    }

    /// Merge two byte-contiguous fragments of the same arena, in either order.
    /// Returns both inputs untouched when they cannot be merged.
    pub fn try_merge(self, other: BufferFragment) -> Result<Self, (Self, Self)> {
        if !self.is_mergeable(&other) {
            return Err((self, other));
        }
        if other.is_empty() {
            return Ok(self);
        }
        if self.is_empty() {
            return Ok(other);
        }
        let (arena, left) = self.disarm();
        let (_, right) = other.disarm();
        let merged = Interval::from_bounds(left.offset.min(right.offset), left.end().max(right.end()));
        Ok(Self::from_reserved(arena, merged))
    }

    /// Merge that faults when the fragments are not contiguous.
    ///
    /// # Errors
    /// `NotContiguous`.
    pub fn merge(self, other: BufferFragment) -> Result<Self> {
        self.try_merge(other).map_err(|(left, right)| ShardError::NotContiguous {
            left: left.interval,
            right: right.interval,
        })
    }

    /// Merge with every mergeable candidate until nothing more merges.
    ///
    /// Returns the merged fragment and the candidates that never touched it,
    /// in their original relative order.
    pub fn try_merge_all(self, candidates: Vec<BufferFragment>) -> (Self, Vec<BufferFragment>) {
        let mut merged = self;
        let mut rest = candidates;
        loop {
            let Some(pos) = rest.iter().position(|c| merged.is_mergeable(c)) else {
                return (merged, rest);
            };
            let candidate = rest.remove(pos);
            merged = match merged.try_merge(candidate) {
                Ok(m) => m,
                Err((m, c)) => {
                    rest.insert(pos, c);
                    return (m, rest);
                }
            };
        }
    }

    /// Split into `[0, at)` and `[at, len)`. Either side may be empty.
    ///
    /// # Errors
    /// `OutOfRange` when `at > len`.
    pub fn split(self, at: usize) -> Result<(Self, Self)> {
        if at > self.len() {
            return Err(ShardError::OutOfRange {
                index: at,
                length: self.len(),
            });
        }
        let (arena, interval) = self.disarm();
        let left = Interval::new(interval.offset, at);
        let right = Interval::from_bounds(interval.offset + at, interval.end());
        Ok((
            Self::from_reserved(Arc::clone(&arena), left),
            Self::from_reserved(arena, right),
        ))
    }

    /// Shrink `self` to `[0, at)` and return `[at, len)`.
    ///
    /// # Errors
    /// `OutOfRange` when `at > len`.
    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        if at > self.len() {
            return Err(ShardError::OutOfRange {
                index: at,
                length: self.len(),
            });
        }
        let tail = Interval::from_bounds(self.interval.offset + at, self.interval.end());
        self.interval.length = at;
        Ok(Self::from_reserved(Arc::clone(&self.arena), tail))
    }
}

impl Drop for BufferFragment {
    fn drop(&mut self) {
        if self.interval.is_empty() {
            return;
        }
        let interval = std::mem::take(&mut self.interval);
        if let Err(err) = self.arena.tracker().release(interval) {
            warn!(%interval, error = %err, "dropped fragment could not be released");
        }
    }
}

impl Default for BufferFragment {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BufferFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferFragment")
            .field("interval", &self.interval)
            .field("arena_capacity", &self.arena.capacity())
            .finish()
    }
}

impl AsRef<[u8]> for BufferFragment {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
