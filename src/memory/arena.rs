//! The shared backing buffer and its regions.
//!
//! An [`Arena`] owns one fixed-capacity byte buffer plus the
//! [`IntervalTracker`] that decides who may touch which bytes. The buffer is
//! split into a *read region*, filled by the storage reader, and a *scratch
//! region*, used by transforms that need to copy bytes (line carries,
//! partition groups). Keeping them apart means a reader that has filled its
//! region can never starve the transforms that would free it.

use super::{BufferFragment, Interval, IntervalTracker};
use crate::error::{Result, ShardError};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub struct Arena {
    cells: Box<[UnsafeCell<u8>]>,
    tracker: IntervalTracker,
    read: Interval,
    scratch: Interval,
}

// SAFETY: bytes are only reachable through `BufferFragment`, which owns a
// reserved interval exclusively. The tracker never grants overlapping
// intervals, so no two threads can alias the same byte mutably.
unsafe impl Sync for Arena {}

impl Arena {
    /// Arena whose read and scratch regions both span the whole buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let whole = Interval::new(0, capacity);
        Arc::new(Self::build(capacity, whole, whole))
    }

    /// Arena whose first `read_bytes` bytes form the read region and whose
    /// remainder forms the scratch region.
    ///
    /// # Errors
    /// `CapacityExceeded` when `read_bytes` is larger than `capacity`.
    pub fn with_regions(capacity: usize, read_bytes: usize) -> Result<Arc<Self>> {
        if read_bytes > capacity {
            return Err(ShardError::CapacityExceeded {
                requested: read_bytes,
                available: capacity,
            });
        }
        let read = Interval::new(0, read_bytes);
        let scratch = Interval::from_bounds(read_bytes, capacity);
        Ok(Arc::new(Self::build(capacity, read, scratch)))
    }

    fn build(capacity: usize, read: Interval, scratch: Interval) -> Self {
        let zeroed = vec![0u8; capacity].into_boxed_slice();
        // SAFETY: `UnsafeCell<u8>` is `repr(transparent)` over `u8`, so the
        // slice layout is identical.
        let cells = unsafe { Box::from_raw(Box::into_raw(zeroed) as *mut [UnsafeCell<u8>]) };
        Self {
            cells,
            tracker: IntervalTracker::new(capacity),
            read,
            scratch,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub(crate) fn tracker(&self) -> &IntervalTracker {
        &self.tracker
    }

    /// Bytes currently held by live fragments.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.tracker.reserved_bytes()
    }

    /// Reserved blocks, sorted by offset.
    #[must_use]
    pub fn reserved_intervals(&self) -> Vec<Interval> {
        self.tracker.reserved_intervals()
    }

    /// Reservations still waiting for space.
    #[must_use]
    pub fn pending_waiters(&self) -> usize {
        self.tracker.pending_waiters()
    }

    /// Region reserved for raw chunks coming from storage.
    #[must_use]
    pub fn read_region(self: &Arc<Self>) -> ArenaRegion {
        ArenaRegion::new(Arc::clone(self), self.read)
    }

    /// Region reserved for copies made by transforms.
    #[must_use]
    pub fn scratch_region(self: &Arc<Self>) -> ArenaRegion {
        ArenaRegion::new(Arc::clone(self), self.scratch)
    }

    /// Region spanning the whole arena.
    #[must_use]
    pub fn whole(self: &Arc<Self>) -> ArenaRegion {
        ArenaRegion::new(Arc::clone(self), Interval::new(0, self.capacity()))
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.cells.as_ptr())
    }

    /// # Safety
    /// The caller must hold the reservation for `interval` and must not hand
    /// out a mutable view of it at the same time.
    pub(crate) unsafe fn bytes(&self, interval: Interval) -> &[u8] {
        debug_assert!(interval.end() <= self.capacity());
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe { std::slice::from_raw_parts(self.base().add(interval.offset), interval.length) }
    }

    /// # Safety
    /// The caller must hold the reservation for `interval` exclusively.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, interval: Interval) -> &mut [u8] {
        debug_assert!(interval.end() <= self.capacity());
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.base().add(interval.offset), interval.length) }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("scratch", &self.scratch)
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

/// An unreserved view of part of an arena that fragments are carved from.
#[derive(Clone, Debug)]
pub struct ArenaRegion {
    arena: Arc<Arena>,
    interval: Interval,
}

impl ArenaRegion {
    fn new(arena: Arc<Arena>, interval: Interval) -> Self {
        Self { arena, interval }
    }

    #[must_use]
    pub fn interval(&self) -> Interval {
        self.interval
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
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// The first `length` bytes of this region and the rest, as two regions
    /// whose reservations never compete for the same bytes.
    ///
    /// # Errors
    /// `OutOfRange` if `length` exceeds the region size.
    pub fn split_at(&self, length: usize) -> Result<(ArenaRegion, ArenaRegion)> {
        if length > self.len() {
            return Err(ShardError::OutOfRange {
                index: length,
                length: self.len(),
            });
        }
        let head = self.interval.slice(0, length);
        let rest = Interval::from_bounds(head.end(), self.interval.end());
        Ok((
            ArenaRegion::new(Arc::clone(&self.arena), head),
            ArenaRegion::new(Arc::clone(&self.arena), rest),
        ))
    }

    /// Reserve the first free `length` bytes of this region, waiting for
    /// releases if the region is currently full.
    ///
    /// # Errors
    /// `CapacityExceeded` if `length` exceeds the region size.
    pub async fn reserve_sub_fragment(&self, length: usize) -> Result<BufferFragment> {
        let interval = self.arena.tracker().reserve_within(self.interval, length).await?;
        Ok(BufferFragment::from_reserved(Arc::clone(&self.arena), interval))
    }

    /// Like [`reserve_sub_fragment`](Self::reserve_sub_fragment) but faults
    /// with `ReservationTimeout` after `timeout`.
    ///
    /// # Errors
    /// `ReservationTimeout` or `CapacityExceeded`.
    pub async fn reserve_sub_fragment_timeout(
        &self,
        length: usize,
        timeout: Duration,
    ) -> Result<BufferFragment> {
        let interval = self
            .arena
            .tracker()
            .reserve_within_timeout(self.interval, length, timeout)
            .await?;
        Ok(BufferFragment::from_reserved(Arc::clone(&self.arena), interval))
    }
}
