use crate::error::ForemanError;
use crate::types::{Result, WorkItem};

/// Abstraction over a partitionable dataset.
///
/// Implementations hand out contiguous, never-overlapping ranges and track
/// how much of the dataset has been assigned and completed. Access is
/// serialized by the scheduler; implementations do not need interior
/// synchronization.
pub trait PacketSource: Send {
    /// Total entries in the dataset, fixed at construction.
    fn total(&self) -> u64;

    /// Entries reserved by issued packets so far.
    fn assigned(&self) -> u64;

    /// Entries completed and counted toward the total.
    fn processed(&self) -> u64;

    /// Entries not yet handed out.
    fn remaining(&self) -> u64 {
        self.total().saturating_sub(self.assigned())
    }

    /// Reserves up to `n` entries from the next unassigned region.
    ///
    /// The range may be truncated at a unit boundary; units with nothing
    /// left are skipped transparently. Returns `None` only when no
    /// unassigned entries remain (or `n` is zero).
    fn take(&mut self, n: u64) -> Option<WorkItem>;

    /// Counts `n` reported entries toward the processed total.
    ///
    /// Completing more entries than were ever assigned is a fatal
    /// invariant violation.
    fn mark_processed(&mut self, n: u64) -> Result<()>;
}

/// One partitionable unit: a file, tree, or similar element with a known
/// entry count and a cursor over how much of it has been assigned.
#[derive(Debug, Clone)]
pub struct Unit {
    id: u64,
    total: u64,
    cursor: u64,
}

impl Unit {
    pub fn new(id: u64, total: u64) -> Self {
        Self {
            id,
            total,
            cursor: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn left(&self) -> u64 {
        self.total - self.cursor
    }
}

/// Default [`PacketSource`]: an ordered unit list with monotonic cursors.
#[derive(Debug)]
pub struct UnitPool {
    units: Vec<Unit>,
    current: usize,
    total: u64,
    assigned: u64,
    processed: u64,
}

impl UnitPool {
    /// Builds a pool from per-unit entry counts, in dataset order.
    pub fn new(unit_sizes: impl IntoIterator<Item = u64>) -> Self {
        let units: Vec<Unit> = unit_sizes
            .into_iter()
            .enumerate()
            .map(|(id, total)| Unit::new(id as u64, total))
            .collect();
        let total = units.iter().map(Unit::total).sum();

        Self {
            units,
            current: 0,
            total,
            assigned: 0,
            processed: 0,
        }
    }

    /// Builds a pool over a single unit of `total` entries.
    pub fn single(total: u64) -> Self {
        Self::new([total])
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }
}

impl PacketSource for UnitPool {
    fn total(&self) -> u64 {
        self.total
    }

    fn assigned(&self) -> u64 {
        self.assigned
    }

    fn processed(&self) -> u64 {
        self.processed
    }

    fn take(&mut self, n: u64) -> Option<WorkItem> {
        if n == 0 {
            return None;
        }

        while let Some(unit) = self.units.get_mut(self.current) {
            if unit.left() == 0 {
                self.current += 1;
                continue;
            }

            let count = n.min(unit.left());
            let item = WorkItem {
                unit: unit.id,
                first: unit.cursor,
                count,
            };
            unit.cursor += count;
            self.assigned += count;
            if unit.left() == 0 {
                self.current += 1;
            }
            return Some(item);
        }

        None
    }

    fn mark_processed(&mut self, n: u64) -> Result<()> {
        let processed = self.processed.saturating_add(n);
        if processed > self.assigned {
            return Err(ForemanError::InvariantViolation(format!(
                "processed count {processed} exceeds assigned count {}",
                self.assigned
            )));
        }
        self.processed = processed;
        Ok(())
    }
}
