//! Tests for the arena, the interval tracker, and buffer fragments.

use anyhow::Result;
use reshard::{Arena, BufferFragment, Interval, IntervalTracker, ShardError, SharedFragment};
use std::time::Duration;

#[test]
fn test_reserve_and_release_keep_blocks_disjoint() -> Result<()> {
    let tracker = IntervalTracker::new(100);
    tracker.reserve(Interval::new(0, 10))?;
    tracker.reserve(Interval::new(20, 10))?;
    tracker.reserve(Interval::new(10, 10))?;
    assert_eq!(tracker.reserved_intervals(), vec![Interval::new(0, 30)]);

    tracker.release(Interval::new(5, 10))?;
    assert_eq!(
        tracker.reserved_intervals(),
        vec![Interval::new(0, 5), Interval::new(15, 15)]
    );
    assert_eq!(tracker.reserved_bytes(), 20);
    Ok(())
}

#[test]
fn test_failed_calls_leave_state_untouched() -> Result<()> {
    let tracker = IntervalTracker::new(50);
    tracker.reserve(Interval::new(10, 10))?;

    let overlap = tracker.reserve(Interval::new(15, 10));
    assert!(matches!(overlap, Err(ShardError::RangeUnavailable { .. })));

    let gap = tracker.release(Interval::new(5, 10));
    assert!(matches!(gap, Err(ShardError::NotReserved { .. })));

    let past_end = tracker.reserve(Interval::new(45, 10));
    assert!(matches!(past_end, Err(ShardError::CapacityExceeded { .. })));

    assert_eq!(tracker.reserved_intervals(), vec![Interval::new(10, 10)]);
    Ok(())
}

#[test]
fn test_release_spanning_two_adjacent_grants() -> Result<()> {
    let tracker = IntervalTracker::new(40);
    tracker.reserve(Interval::new(0, 10))?;
    tracker.reserve(Interval::new(10, 10))?;
    // Merged eagerly, so a release across the old boundary is fine.
    tracker.release(Interval::new(5, 10))?;
    assert_eq!(
        tracker.reserved_intervals(),
        vec![Interval::new(0, 5), Interval::new(15, 5)]
    );
    Ok(())
}

#[tokio::test]
async fn test_parked_waiter_is_granted_on_release() -> Result<()> {
    let arena = Arena::new(32);
    let region = arena.whole();
    let held = region.reserve_sub_fragment(32).await?;

    let waiter = tokio::spawn({
        let region = region.clone();
        async move { region.reserve_sub_fragment(16).await }
    });
    while arena.pending_waiters() == 0 {
        tokio::task::yield_now().await;
    }

    held.release()?;
    let granted = waiter.await??;
    assert_eq!(granted.interval(), Interval::new(0, 16));
    assert_eq!(arena.reserved_bytes(), 16);
    Ok(())
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() -> Result<()> {
    let tracker = IntervalTracker::new(10);
    tracker.reserve(Interval::new(0, 10))?;

    let first = tracker.reserve_within(Interval::new(0, 10), 6);
    let second = tracker.reserve_within(Interval::new(0, 10), 4);
    tracker.release(Interval::new(0, 10))?;

    assert_eq!(first.await?, Interval::new(0, 6));
    assert_eq!(second.await?, Interval::new(6, 4));
    Ok(())
}

#[tokio::test]
async fn test_exact_reservation_waits_for_its_whole_range() -> Result<()> {
    let arena = Arena::new(16);
    let low = BufferFragment::reserve(&arena, Interval::new(0, 8))?;
    let high = BufferFragment::reserve(&arena, Interval::new(8, 8))?;

    let waiter = tokio::spawn({
        let arena = arena.clone();
        async move { BufferFragment::reserve_async(&arena, Interval::new(4, 8)).await }
    });
    while arena.pending_waiters() == 0 {
        tokio::task::yield_now().await;
    }

    // Half of the range is free now, which is not enough.
    low.release()?;
    assert_eq!(arena.pending_waiters(), 1);
    assert!(!waiter.is_finished());

    high.release()?;
    let mut granted = waiter.await??;
    assert_eq!(granted.interval(), Interval::new(4, 8));
    granted.as_mut_slice().fill(b'z');
    assert_eq!(arena.reserved_intervals(), vec![Interval::new(4, 8)]);
    Ok(())
}

#[tokio::test]
async fn test_within_waiter_needs_enough_contiguous_bytes() -> Result<()> {
    let tracker = IntervalTracker::new(20);
    tracker.reserve(Interval::new(0, 20))?;
    let pending = tracker.reserve_within(Interval::new(0, 20), 8);
    assert_eq!(tracker.pending_waiters(), 1);

    // Eight bytes are free, but in two runs of four.
    tracker.release(Interval::new(0, 4))?;
    tracker.release(Interval::new(10, 4))?;
    assert_eq!(tracker.pending_waiters(), 1);

    tracker.release(Interval::new(4, 6))?;
    assert_eq!(tracker.pending_waiters(), 0);
    assert_eq!(pending.await?, Interval::new(0, 8));
    assert_eq!(
        tracker.reserved_intervals(),
        vec![Interval::new(0, 8), Interval::new(14, 6)]
    );
    Ok(())
}

#[test]
fn test_live_fragment_range_cannot_be_taken_again() -> Result<()> {
    let arena = Arena::new(8);
    let mut first = BufferFragment::reserve(&arena, Interval::new(0, 4))?;
    first.as_mut_slice().copy_from_slice(b"keep");

    let second = BufferFragment::reserve(&arena, Interval::new(2, 4));
    assert!(matches!(second, Err(ShardError::RangeUnavailable { .. })));
    assert_eq!(first.as_slice(), b"keep");
    assert_eq!(arena.reserved_bytes(), 4);

    drop(first);
    let mut second = BufferFragment::reserve(&arena, Interval::new(0, 4))?;
    second.as_mut_slice().copy_from_slice(b"next");
    assert_eq!(arena.reserved_intervals(), vec![Interval::new(0, 4)]);
    Ok(())
}

#[tokio::test]
async fn test_split_regions_do_not_share_bytes() -> Result<()> {
    let arena = Arena::with_regions(30, 10)?;
    let (carry, copies) = arena.scratch_region().split_at(8)?;
    assert_eq!(carry.interval(), Interval::new(10, 8));
    assert_eq!(copies.interval(), Interval::new(18, 12));
    assert!(arena.scratch_region().split_at(21).is_err());

    let held = carry.reserve_sub_fragment(8).await?;
    let copy = copies.reserve_sub_fragment(12).await?;
    assert_eq!(copy.interval(), Interval::new(18, 12));
    assert!(matches!(
        carry.reserve_sub_fragment(9).await,
        Err(ShardError::CapacityExceeded { .. })
    ));
    drop((held, copy));
    assert_eq!(arena.reserved_bytes(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_scratch_reservation_times_out_without_leaking() -> Result<()> {
    let arena = Arena::new(8);
    let region = arena.whole();
    let held = region.reserve_sub_fragment(8).await?;

    let outcome = region
        .reserve_sub_fragment_timeout(4, Duration::from_secs(5))
        .await;
    assert!(matches!(
        outcome,
        Err(ShardError::ReservationTimeout { length: 4, .. })
    ));

    held.release()?;
    assert_eq!(arena.reserved_bytes(), 0);
    assert_eq!(arena.pending_waiters(), 0);
    Ok(())
}

#[tokio::test]
async fn test_request_larger_than_region_fails_fast() -> Result<()> {
    let arena = Arena::with_regions(100, 40)?;
    let outcome = arena.read_region().reserve_sub_fragment(41).await;
    assert!(matches!(outcome, Err(ShardError::CapacityExceeded { .. })));
    Ok(())
}

#[tokio::test]
async fn test_regions_do_not_overlap() -> Result<()> {
    let arena = Arena::with_regions(100, 40)?;
    let read = arena.read_region().reserve_sub_fragment(40).await?;
    let scratch = arena.scratch_region().reserve_sub_fragment(60).await?;
    assert_eq!(read.interval(), Interval::new(0, 40));
    assert_eq!(scratch.interval(), Interval::new(40, 60));
    Ok(())
}

#[test]
fn test_fragment_split_merge_and_release() -> Result<()> {
    let arena = Arena::new(16);
    let mut fragment = BufferFragment::reserve(&arena, Interval::new(0, 12))?;
    fragment.as_mut_slice().copy_from_slice(b"hello\nworld\n");

    let (left, right) = fragment.split(6)?;
    assert_eq!(left.as_slice(), b"hello\n");
    assert_eq!(right.as_slice(), b"world\n");
    assert!(left.is_followed_by(&right));
    assert!(!right.is_followed_by(&left));

    let joined = right.merge(left)?;
    assert_eq!(joined.as_slice(), b"hello\nworld\n");
    joined.release()?;
    assert_eq!(arena.reserved_bytes(), 0);
    Ok(())
}

#[test]
fn test_merge_all_returns_untouched_candidates_in_order() -> Result<()> {
    let arena = Arena::new(30);
    let base = BufferFragment::reserve(&arena, Interval::new(10, 5))?;
    let after = BufferFragment::reserve(&arena, Interval::new(15, 5))?;
    let far = BufferFragment::reserve(&arena, Interval::new(25, 2))?;
    let before = BufferFragment::reserve(&arena, Interval::new(5, 5))?;
    let other = BufferFragment::create(3);

    let (merged, rest) = base.try_merge_all(vec![far, after, other, before]);
    assert_eq!(merged.interval(), Interval::new(5, 15));
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].interval(), Interval::new(25, 2));
    assert_eq!(rest[1].len(), 3);
    Ok(())
}

#[test]
fn test_copy_of_owns_its_bytes() {
    let fragment = BufferFragment::copy_of(b"abc");
    assert_eq!(fragment.as_slice(), b"abc");
    assert_eq!(fragment.arena().capacity(), 3);
    assert_eq!(fragment.iter().collect::<Vec<_>>(), b"abc".to_vec());
}

#[test]
fn test_shared_fragment_released_by_last_owner() -> Result<()> {
    let arena = Arena::new(8);
    let fragment = BufferFragment::reserve(&arena, Interval::new(0, 8))?;
    let shared = SharedFragment::new(fragment, 3)?;
    let copies: Vec<SharedFragment> = (0..3).map(|_| shared.clone()).collect();

    assert!(!copies[0].dispose()?);
    assert!(!copies[1].dispose()?);
    assert_eq!(shared.read(<[u8]>::len), Some(8));
    assert!(copies[2].dispose()?);

    assert_eq!(shared.read(<[u8]>::len), None);
    assert_eq!(arena.reserved_bytes(), 0);
    assert!(shared.dispose().is_err());
    Ok(())
}
