use crate::core::rate::RateWindow;
use crate::types::{WorkItem, WorkerId, WorkerSummary};

/// Per-worker scheduling record.
///
/// Created when a worker joins the scheduling round, mutated only by the
/// packetizer on receipt of a worker report, and retired when the worker is
/// marked bad or the run ends. `processed` counts entries by master-side
/// accounting so each packet is counted exactly once.
#[derive(Debug)]
pub struct WorkerStat {
    id: WorkerId,
    /// Entries completed by this worker; non-decreasing across reports.
    pub processed: u64,
    /// Packets completed by this worker.
    pub packets: u64,
    /// Size of the packet currently or most recently issued.
    pub last_issued: u64,
    /// Packet this worker currently holds, if any.
    pub in_flight: Option<WorkItem>,
    /// Cumulative bytes read, as reported by the worker.
    pub bytes_read: u64,
    /// Cumulative CPU seconds, as reported by the worker.
    pub cpu_time: f64,
    /// Run-clock second of the last ingested report (creation time at first).
    pub last_report_at: f64,
    /// Cleared when the worker is marked dead or bad.
    pub alive: bool,
    /// Consecutive failed reports; reset on success.
    pub strikes: u32,
    /// Set while the silence heuristic is zeroing this worker's speed.
    pub stalled: bool,
    history: RateWindow,
}

impl WorkerStat {
    /// Creates a record for a worker joining at run-clock second `now`.
    ///
    /// A zero-reference sample gives the first real report a baseline.
    pub fn new(id: WorkerId, circularity: usize, now: f64) -> Self {
        let mut history = RateWindow::new(circularity);
        history.record(0.0, 0);

        Self {
            id,
            processed: 0,
            packets: 0,
            last_issued: 0,
            in_flight: None,
            bytes_read: 0,
            cpu_time: 0.0,
            last_report_at: now,
            alive: true,
            strikes: 0,
            stalled: false,
            history,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Appends a (processing time, cumulative processed) sample.
    pub fn record_sample(&mut self, proc_time: f64, processed: u64) {
        self.history.record(proc_time, processed);
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    /// Windowed throughput estimate, ignoring the silence heuristic.
    pub fn raw_speed(&self) -> f64 {
        if !self.alive {
            return 0.0;
        }
        self.history.speed()
    }

    /// Throughput estimate with the silence heuristic applied.
    ///
    /// A worker with no report for longer than `stall_after` run-clock
    /// seconds is treated as having zero speed so it stops receiving large
    /// packets, without being removed from the pool.
    pub fn effective_speed(&self, now: f64, stall_after: f64) -> f64 {
        if !self.alive {
            return 0.0;
        }
        if now - self.last_report_at > stall_after {
            return 0.0;
        }
        self.history.speed()
    }

    /// Entries this worker is still expected to deliver for its in-flight
    /// packet, assuming its current speed holds.
    pub fn busy_estimate(&self, now: f64, stall_after: f64) -> f64 {
        if self.in_flight.is_none() {
            return 0.0;
        }
        let speed = self.effective_speed(now, stall_after);
        ((self.last_report_at - now) * speed + self.last_issued as f64).max(0.0)
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            worker: self.id.clone(),
            processed: self.processed,
            packets: self.packets,
            bytes_read: self.bytes_read,
            cpu_time: self.cpu_time,
            speed: self.raw_speed(),
            alive: self.alive,
        }
    }
}
