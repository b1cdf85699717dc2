use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ForemanError;

pub type Result<T> = std::result::Result<T, ForemanError>;

/// Identity of a remote worker process.
///
/// The transport layer assigns these; the scheduler treats them as opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A packet: a contiguous sub-range of one partitionable unit.
///
/// Packets are the unit of work handed to one worker for one processing
/// step. A packet is immutable once issued; ownership transfers to the
/// requesting worker until it reports completion or is declared dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identifier of the unit this range belongs to.
    pub unit: u64,
    /// First entry of the range within the unit.
    pub first: u64,
    /// Number of entries in the range.
    pub count: u64,
}

impl WorkItem {
    /// One past the last entry of the range.
    pub fn end(&self) -> u64 {
        self.first.saturating_add(self.count)
    }

    /// Returns true when both ranges cover at least one common entry.
    pub fn overlaps(&self, other: &WorkItem) -> bool {
        self.unit == other.unit && self.first < other.end() && other.first < self.end()
    }
}

/// Completion statistics a worker attaches to its next packet request.
///
/// `proc_time`/`cpu_time`/`bytes_read` are cumulative for the worker, not
/// per-packet. The whole report is absent on a worker's very first request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Request round-trip latency measured by the worker.
    pub latency: Duration,
    /// Cumulative processing time in seconds.
    pub proc_time: f64,
    /// Cumulative CPU time in seconds.
    pub cpu_time: f64,
    /// Cumulative bytes read from the dataset.
    pub bytes_read: u64,
    /// Worker-side cumulative entry count; advisory, master accounting wins.
    pub entries: Option<u64>,
    /// Set when the previous packet failed on the worker.
    pub error: Option<String>,
}

impl WorkerReport {
    /// Creates a successful report with the given cumulative processing time.
    pub fn new(proc_time: f64) -> Self {
        Self {
            proc_time,
            ..Self::default()
        }
    }

    pub fn with_bytes_read(mut self, bytes_read: u64) -> Self {
        self.bytes_read = bytes_read;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

/// Scheduler answer to a packet request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketResponse {
    /// A packet to process.
    Work(WorkItem),
    /// The run is over for this worker; it will not receive further packets.
    NoMoreWork,
    /// Nothing to hand out right now; ask again shortly.
    RetryLater,
}

/// Why a packet could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailReason {
    /// The worker holding the packet died or disconnected.
    WorkerDied,
    /// The worker reported a processing error.
    WorkerError(String),
    /// The run was aborted while the packet was in flight.
    Aborted,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerDied => f.write_str("worker died"),
            Self::WorkerError(message) => write!(f, "worker error: {message}"),
            Self::Aborted => f.write_str("run aborted"),
        }
    }
}

/// A packet whose entries were lost; never rescheduled, surfaced at run end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPacket {
    pub item: WorkItem,
    pub worker: WorkerId,
    pub reason: FailReason,
}

/// Per-worker totals included in the final run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker: WorkerId,
    /// Entries this worker completed.
    pub processed: u64,
    /// Packets this worker completed.
    pub packets: u64,
    /// Cumulative bytes read, as reported by the worker.
    pub bytes_read: u64,
    /// Cumulative CPU seconds, as reported by the worker.
    pub cpu_time: f64,
    /// Last throughput estimate in entries per second.
    pub speed: f64,
    pub alive: bool,
}

/// Final accounting for one scheduling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Entries in the dataset.
    pub total: u64,
    /// Entries completed and counted exactly once.
    pub processed: u64,
    /// Bytes read across all workers.
    pub bytes_read: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Packets that could not be completed; a warning, not a fatal error.
    pub failed: Vec<FailedPacket>,
    /// Set when the failed-packet count crossed the configured threshold.
    pub failure_threshold_exceeded: bool,
    pub workers: Vec<WorkerSummary>,
}

impl RunSummary {
    /// Entries lost to failed packets.
    pub fn entries_lost(&self) -> u64 {
        self.failed.iter().map(|failed| failed.item.count).sum()
    }

    /// Flattens the summary into sorted key/value pairs for rendering.
    pub fn to_flat_map(&self) -> BTreeMap<String, ReportValue> {
        let mut out = BTreeMap::new();
        out.insert("run.total".to_string(), ReportValue::U64(self.total));
        out.insert(
            "run.processed".to_string(),
            ReportValue::U64(self.processed),
        );
        out.insert(
            "run.bytes_read".to_string(),
            ReportValue::U64(self.bytes_read),
        );
        out.insert(
            "run.elapsed".to_string(),
            ReportValue::Duration(self.elapsed),
        );
        out.insert(
            "run.failed_packets".to_string(),
            ReportValue::U64(self.failed.len() as u64),
        );
        out.insert(
            "run.entries_lost".to_string(),
            ReportValue::U64(self.entries_lost()),
        );
        out.insert(
            "run.failure_threshold_exceeded".to_string(),
            ReportValue::Bool(self.failure_threshold_exceeded),
        );
        out.insert(
            "run.worker_count".to_string(),
            ReportValue::U64(self.workers.len() as u64),
        );

        for worker in &self.workers {
            let prefix = format!("worker.{}", worker.worker);
            out.insert(
                format!("{prefix}.processed"),
                ReportValue::U64(worker.processed),
            );
            out.insert(
                format!("{prefix}.packets"),
                ReportValue::U64(worker.packets),
            );
            out.insert(
                format!("{prefix}.bytes_read"),
                ReportValue::U64(worker.bytes_read),
            );
            out.insert(
                format!("{prefix}.cpu_time"),
                ReportValue::F64(worker.cpu_time),
            );
            out.insert(format!("{prefix}.speed"), ReportValue::F64(worker.speed));
            out.insert(format!("{prefix}.alive"), ReportValue::Bool(worker.alive));
        }

        out
    }
}

/// Extensible scalar value used by summary exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReportValue {
    U64(u64),
    F64(f64),
    Duration(Duration),
    Bool(bool),
    Text(String),
}

impl fmt::Display for ReportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U64(value) => write!(f, "{value}"),
            Self::F64(value) => write!(f, "{value:.3}"),
            Self::Duration(value) => write!(f, "{:.3}s", value.as_secs_f64()),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}
