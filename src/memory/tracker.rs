//! Interval bookkeeping for one fixed-capacity arena.
//!
//! The tracker never touches bytes. It records which ranges of the arena are
//! reserved, keeps that set sorted, disjoint and eagerly merged, and parks
//! callers whose requested range is not free yet. Every successful release
//! re-evaluates the parked waiters in arrival order; a waiter that can be
//! satisfied is granted its range while the lock is held and woken after the
//! lock is dropped.

use super::Interval;
use crate::error::{Result, ShardError};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Cheaply clonable handle to the reservation state of one arena.
#[derive(Clone)]
pub struct IntervalTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    capacity: usize,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    /// Sorted by offset, pairwise disjoint, adjacent blocks merged.
    reserved: Vec<Interval>,
    /// Parked requests in arrival order.
    waiters: Vec<Waiter>,
}

#[derive(Clone, Copy, Debug)]
enum Request {
    Exact(Interval),
    Within { parent: Interval, length: usize },
}

struct Waiter {
    request: Request,
    grant: oneshot::Sender<Interval>,
}

type Grant = (oneshot::Sender<Interval>, Interval);

impl TrackerState {
    fn is_free(&self, interval: &Interval) -> bool {
        if interval.is_empty() {
            return true;
        }
        let idx = self.reserved.partition_point(|b| b.end() <= interval.offset);
        self.reserved
            .get(idx)
            .is_none_or(|block| block.offset >= interval.end())
    }

    fn insert(&mut self, interval: Interval) -> Result<()> {
        if interval.is_empty() {
            return Ok(());
        }
        if !self.is_free(&interval) {
            return Err(ShardError::RangeUnavailable { interval });
        }

        let pos = self.reserved.partition_point(|b| b.offset < interval.offset);
        let merge_prev = pos > 0 && self.reserved[pos - 1].end() == interval.offset;
        let merge_next = pos < self.reserved.len() && self.reserved[pos].offset == interval.end();

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.reserved.remove(pos);
                self.reserved[pos - 1].length += interval.length + next.length;
            }
            (true, false) => self.reserved[pos - 1].length += interval.length,
            (false, true) => {
                let next = &mut self.reserved[pos];
                next.offset = interval.offset;
                next.length += interval.length;
            }
            (false, false) => self.reserved.insert(pos, interval),
        }
        Ok(())
    }

    fn remove(&mut self, interval: Interval) -> Result<()> {
        if interval.is_empty() {
            return Ok(());
        }
        let first = self.covering_block(&interval)?;
        self.carve(first, interval);
        Ok(())
    }

    /// Index of the block holding `interval.offset`, after checking that the
    /// whole interval is covered by consecutive reserved blocks. Nothing is
    /// mutated when the check fails.
    fn covering_block(&self, interval: &Interval) -> Result<usize> {
        let not_reserved = || ShardError::NotReserved {
            interval: *interval,
        };
        let first = self
            .reserved
            .partition_point(|b| b.offset <= interval.offset)
            .checked_sub(1)
            .ok_or_else(not_reserved)?;

        let mut cursor = interval.offset;
        let mut idx = first;
        while cursor < interval.end() {
            let block = self.reserved.get(idx).ok_or_else(not_reserved)?;
            if block.offset > cursor || block.end() <= cursor {
                return Err(not_reserved());
            }
            cursor = block.end().min(interval.end());
            idx += 1;
        }
        Ok(first)
    }

    /// Cut `interval` out of the block at `idx`, carrying whatever extends past
    /// that block over to the next one.
    fn carve(&mut self, idx: usize, interval: Interval) {
        let block = self.reserved[idx];
        let cut_end = block.end().min(interval.end());
        let left = Interval::from_bounds(block.offset, interval.offset);
        let right = Interval::from_bounds(cut_end, block.end());

        let kept: Vec<Interval> = [left, right].into_iter().filter(|i| !i.is_empty()).collect();
        let kept_len = kept.len();
        self.reserved.splice(idx..=idx, kept);

        if cut_end < interval.end() {
            self.carve(idx + kept_len, Interval::from_bounds(cut_end, interval.end()));
        }
    }

    /// First free sub-range of exactly `length` bytes inside `parent`.
    fn first_fit(&self, parent: &Interval, length: usize) -> Option<Interval> {
        let mut cursor = parent.offset;
        let start = self.reserved.partition_point(|b| b.end() <= parent.offset);
        for block in &self.reserved[start..] {
            if block.offset >= parent.end() {
                break;
            }
            let gap_end = block.offset.min(parent.end());
            if gap_end.saturating_sub(cursor) >= length {
                return Some(Interval::new(cursor, length));
            }
            cursor = cursor.max(block.end());
        }
        (parent.end().saturating_sub(cursor) >= length).then(|| Interval::new(cursor, length))
    }

    fn try_grant(&mut self, request: Request) -> Option<Interval> {
        let interval = match request {
            Request::Exact(interval) => self.is_free(&interval).then_some(interval)?,
            Request::Within { parent, length } => self.first_fit(&parent, length)?,
        };
        self.insert(interval).ok().map(|()| interval)
    }

    fn collect_grants(&mut self) -> Vec<Grant> {
        let mut ready = Vec::new();
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if waiter.grant.is_closed() {
                continue;
            }
            match self.try_grant(waiter.request) {
                Some(interval) => ready.push((waiter.grant, interval)),
                None => self.waiters.push(waiter),
            }
        }
        ready
    }
}

impl IntervalTracker {
    /// Create a tracker for an arena of `capacity` bytes with nothing reserved.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                capacity,
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Snapshot of the reserved blocks, sorted by offset.
    #[must_use]
    pub fn reserved_intervals(&self) -> Vec<Interval> {
        self.inner.state.lock().reserved.clone()
    }

    /// Total number of reserved bytes.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.inner.state.lock().reserved.iter().map(|b| b.length).sum()
    }

    /// Number of reservations still waiting for space.
    #[must_use]
    pub fn pending_waiters(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    #[must_use]
    pub fn is_free(&self, interval: &Interval) -> bool {
        self.inner.state.lock().is_free(interval)
    }

    fn check_bounds(&self, interval: &Interval) -> Result<()> {
        if interval.end() > self.inner.capacity {
            return Err(ShardError::CapacityExceeded {
                requested: interval.end(),
                available: self.inner.capacity,
            });
        }
        Ok(())
    }

    /// Reserve `interval` now, failing if any byte of it is taken.
    ///
    /// # Errors
    /// `RangeUnavailable` on overlap, `CapacityExceeded` past the arena end.
    pub fn reserve(&self, interval: Interval) -> Result<()> {
        self.check_bounds(&interval)?;
        self.inner.state.lock().insert(interval)?;
        trace!(%interval, "reserved");
        Ok(())
    }

    /// Release exactly `interval`, then grant every parked request that now fits.
    ///
    /// # Errors
    /// `NotReserved` if any byte of `interval` is not currently reserved.
    pub fn release(&self, interval: Interval) -> Result<()> {
        let ready = {
            let mut state = self.inner.state.lock();
            state.remove(interval)?;
            if state.waiters.is_empty() {
                Vec::new()
            } else {
                state.collect_grants()
            }
        };
        trace!(%interval, woken = ready.len(), "released");
        self.dispatch(ready);
        Ok(())
    }

    fn dispatch(&self, ready: Vec<Grant>) {
        for (grant, interval) in ready {
            // The waiter stopped listening after it was granted; hand the range back.
            if let Err(interval) = grant.send(interval)
                && let Err(err) = self.release(interval)
            {
                warn!(%interval, error = %err, "failed to return an unclaimed grant");
            }
        }
    }

    /// Reserve `interval`, waiting until it is entirely free.
    pub fn reserve_async(&self, interval: Interval) -> Reservation {
        if let Err(err) = self.check_bounds(&interval) {
            return Reservation::ready(self.clone(), Err(err));
        }
        self.park(Request::Exact(interval))
    }

    /// Reserve the first free `length`-byte range inside `parent`, waiting if
    /// none is free yet.
    pub fn reserve_within(&self, parent: Interval, length: usize) -> Reservation {
        if let Err(err) = self.check_bounds(&parent) {
            return Reservation::ready(self.clone(), Err(err));
        }
        if length > parent.length {
            let err = ShardError::CapacityExceeded {
                requested: length,
                available: parent.length,
            };
            return Reservation::ready(self.clone(), Err(err));
        }
        self.park(Request::Within { parent, length })
    }

    /// [`reserve_within`](Self::reserve_within) bounded by `timeout`.
    ///
    /// # Errors
    /// `ReservationTimeout` when nothing was granted in time, plus the errors
    /// of `reserve_within`.
    pub async fn reserve_within_timeout(
        &self,
        parent: Interval,
        length: usize,
        timeout: Duration,
    ) -> Result<Interval> {
        match tokio::time::timeout(timeout, self.reserve_within(parent, length)).await {
            Ok(granted) => granted,
            Err(_) => Err(ShardError::ReservationTimeout {
                length,
                waited: timeout,
            }),
        }
    }

    fn park(&self, request: Request) -> Reservation {
        let mut state = self.inner.state.lock();
        if let Some(interval) = state.try_grant(request) {
            return Reservation::ready(self.clone(), Ok(interval));
        }
        let (grant, rx) = oneshot::channel();
        state.waiters.push(Waiter { request, grant });
        debug!(?request, waiting = state.waiters.len(), "reservation parked");
        Reservation {
            tracker: self.clone(),
            state: ReservationState::Pending(rx),
        }
    }
}

/// A reservation that resolves once its range has been granted.
///
/// Dropping an unresolved reservation withdraws it; a range granted after the
/// drop is released again instead of leaking.
#[must_use = "a reservation does nothing unless awaited"]
pub struct Reservation {
    tracker: IntervalTracker,
    state: ReservationState,
}

enum ReservationState {
    Ready(Result<Interval>),
    Pending(oneshot::Receiver<Interval>),
    Done,
}

impl Reservation {
    fn ready(tracker: IntervalTracker, outcome: Result<Interval>) -> Self {
        Self {
            tracker,
            state: ReservationState::Ready(outcome),
        }
    }
}

impl Future for Reservation {
    type Output = Result<Interval>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, ReservationState::Done) {
            ReservationState::Ready(outcome) => Poll::Ready(outcome),
            ReservationState::Pending(mut rx) => match Pin::new(&mut rx).poll(cx) {
                Poll::Ready(Ok(interval)) => Poll::Ready(Ok(interval)),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ShardError::ReservationAbandoned)),
                Poll::Pending => {
                    this.state = ReservationState::Pending(rx);
                    Poll::Pending
                }
            },
            ReservationState::Done => Poll::Ready(Err(ShardError::ReservationAbandoned)),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let unclaimed = match &mut self.state {
            ReservationState::Ready(Ok(interval)) => Some(*interval),
            ReservationState::Pending(rx) => {
                rx.close();
                rx.try_recv().ok()
            }
            _ => None,
        };
        if let Some(interval) = unclaimed
            && let Err(err) = self.tracker.release(interval)
        {
            warn!(%interval, error = %err, "failed to release a dropped reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(offset: usize, length: usize) -> Interval {
        Interval::new(offset, length)
    }

    #[test]
    fn adjacent_reservations_merge() {
        let t = IntervalTracker::new(100);
        t.reserve(iv(10, 10)).unwrap();
        t.reserve(iv(30, 10)).unwrap();
        t.reserve(iv(20, 10)).unwrap();
        assert_eq!(t.reserved_intervals(), vec![iv(10, 30)]);

        t.reserve(iv(40, 5)).unwrap();
        t.reserve(iv(5, 5)).unwrap();
        assert_eq!(t.reserved_intervals(), vec![iv(5, 40)]);
    }

    #[test]
    fn overlapping_reserve_fails_without_mutation() {
        let t = IntervalTracker::new(100);
        t.reserve(iv(10, 10)).unwrap();
        let err = t.reserve(iv(15, 10)).unwrap_err();
        assert!(matches!(err, ShardError::RangeUnavailable { .. }));
        assert_eq!(t.reserved_intervals(), vec![iv(10, 10)]);
    }

    #[test]
    fn release_splits_covering_block() {
        let t = IntervalTracker::new(100);
        t.reserve(iv(0, 50)).unwrap();
        t.release(iv(10, 5)).unwrap();
        assert_eq!(t.reserved_intervals(), vec![iv(0, 10), iv(15, 35)]);
        t.release(iv(0, 10)).unwrap();
        t.release(iv(40, 10)).unwrap();
        assert_eq!(t.reserved_intervals(), vec![iv(15, 25)]);
    }

    #[test]
    fn release_of_unreserved_range_faults() {
        let t = IntervalTracker::new(100);
        t.reserve(iv(0, 10)).unwrap();
        t.reserve(iv(20, 10)).unwrap();

        let spans_gap = t.release(iv(5, 20)).unwrap_err();
        assert!(matches!(spans_gap, ShardError::NotReserved { .. }));
        let outside = t.release(iv(50, 1)).unwrap_err();
        assert!(matches!(outside, ShardError::NotReserved { .. }));
        assert_eq!(t.reserved_intervals(), vec![iv(0, 10), iv(20, 10)]);

        t.release(iv(0, 10)).unwrap();
        assert!(t.release(iv(0, 10)).is_err(), "double release must fault");
    }

    #[test]
    fn zero_length_is_a_no_op() {
        let t = IntervalTracker::new(10);
        t.reserve(iv(3, 0)).unwrap();
        t.release(iv(7, 0)).unwrap();
        assert!(t.reserved_intervals().is_empty());
    }

    #[test]
    fn first_fit_skips_small_gaps() {
        let t = IntervalTracker::new(100);
        t.reserve(iv(0, 10)).unwrap();
        t.reserve(iv(12, 10)).unwrap();
        let state = t.inner.state.lock();
        assert_eq!(state.first_fit(&iv(0, 100), 2), Some(iv(10, 2)));
        assert_eq!(state.first_fit(&iv(0, 100), 3), Some(iv(22, 3)));
        assert_eq!(state.first_fit(&iv(5, 10), 3), None);
        assert_eq!(state.first_fit(&iv(90, 10), 10), Some(iv(90, 10)));
    }

    #[test]
    fn reservation_past_capacity_faults() {
        let t = IntervalTracker::new(16);
        let err = t.reserve(iv(10, 10)).unwrap_err();
        assert!(matches!(err, ShardError::CapacityExceeded { .. }));
    }
}
