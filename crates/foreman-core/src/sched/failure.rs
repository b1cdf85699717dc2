use std::collections::BTreeSet;

use crate::types::{FailedPacket, WorkerId};

/// Append-only record of packets that could not be completed, plus the set
/// of workers excluded from future scheduling.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failed: Vec<FailedPacket>,
    dead: BTreeSet<WorkerId>,
    threshold: Option<usize>,
}

impl FailureTracker {
    pub fn new(threshold: Option<usize>) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Records a lost packet. Failed packets are never rescheduled; the
    /// list is surfaced at run end for the controlling layer to judge.
    pub fn record(&mut self, failed: FailedPacket) {
        self.failed.push(failed);
    }

    /// Excludes a worker from all future scheduling.
    pub fn mark_dead(&mut self, worker: &WorkerId) {
        self.dead.insert(worker.clone());
    }

    pub fn is_dead(&self, worker: &WorkerId) -> bool {
        self.dead.contains(worker)
    }

    pub fn failed(&self) -> &[FailedPacket] {
        &self.failed
    }

    /// Entries lost across all failed packets.
    pub fn entries_lost(&self) -> u64 {
        self.failed.iter().map(|failed| failed.item.count).sum()
    }

    pub fn threshold_exceeded(&self) -> bool {
        self.threshold
            .is_some_and(|threshold| self.failed.len() > threshold)
    }
}
