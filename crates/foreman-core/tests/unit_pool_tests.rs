use foreman_core::{ForemanError, PacketSource, UnitPool, WorkItem};

#[test]
fn take_truncates_at_unit_boundaries() {
    let mut pool = UnitPool::new([10, 20]);
    assert_eq!(pool.total(), 30);

    let first = pool.take(15).expect("first take");
    assert_eq!(
        first,
        WorkItem {
            unit: 0,
            first: 0,
            count: 10
        }
    );

    let second = pool.take(15).expect("second take");
    assert_eq!(
        second,
        WorkItem {
            unit: 1,
            first: 0,
            count: 15
        }
    );

    let third = pool.take(15).expect("third take");
    assert_eq!(
        third,
        WorkItem {
            unit: 1,
            first: 15,
            count: 5
        }
    );

    assert_eq!(pool.remaining(), 0);
    assert!(pool.take(1).is_none());
}

#[test]
fn zero_sized_units_are_skipped() {
    let mut pool = UnitPool::new([0, 5, 0, 7]);
    assert_eq!(pool.total(), 12);

    let first = pool.take(100).expect("first take");
    assert_eq!(first.unit, 1);
    assert_eq!(first.count, 5);

    let second = pool.take(100).expect("second take");
    assert_eq!(second.unit, 3);
    assert_eq!(second.count, 7);

    assert!(pool.take(1).is_none());
}

#[test]
fn reservations_never_overlap_and_cover_the_dataset() {
    let mut pool = UnitPool::new([17, 3, 41, 9]);
    let mut items: Vec<WorkItem> = Vec::new();

    // Uneven request sizes to exercise boundary truncation.
    let mut step = 0usize;
    while let Some(item) = pool.take([7, 1, 13, 4][step % 4]) {
        items.push(item);
        step += 1;
    }

    let issued: u64 = items.iter().map(|item| item.count).sum();
    assert_eq!(issued, pool.total());
    assert_eq!(pool.remaining(), 0);

    for (idx, a) in items.iter().enumerate() {
        for b in items.iter().skip(idx + 1) {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn take_zero_reserves_nothing() {
    let mut pool = UnitPool::single(10);
    assert!(pool.take(0).is_none());
    assert_eq!(pool.assigned(), 0);
}

#[test]
fn processed_tracks_reports_and_rejects_overflow() -> Result<(), Box<dyn std::error::Error>> {
    let mut pool = UnitPool::single(10);
    let item = pool.take(6).expect("take");
    pool.mark_processed(item.count)?;
    assert_eq!(pool.processed(), 6);

    // More reported than ever assigned is a fatal accounting error.
    let result = pool.mark_processed(5);
    assert!(matches!(result, Err(ForemanError::InvariantViolation(_))));
    assert_eq!(pool.processed(), 6);

    Ok(())
}

#[test]
fn remaining_follows_the_assignment_cursor() {
    let mut pool = UnitPool::new([4, 4]);
    assert_eq!(pool.remaining(), 8);

    pool.take(3).expect("take");
    assert_eq!(pool.remaining(), 5);
    assert_eq!(pool.assigned(), 3);
    assert_eq!(pool.processed(), 0);

    pool.take(5).expect("take");
    assert_eq!(pool.remaining(), 4);

    pool.take(4).expect("take");
    assert_eq!(pool.remaining(), 0);
}
