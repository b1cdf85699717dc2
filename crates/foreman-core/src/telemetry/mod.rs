use crate::types::{FailReason, WorkerId};

pub mod feedback;
pub mod progress;

pub use feedback::{Feedback, FeedbackQueue, FeedbackSet};
pub use progress::{
    FnProgressSink, NoopProgress, ProgressReporter, ProgressSample, ProgressSink,
};

/// Telemetry contract for the scheduling loop.
///
/// The packetizer calls these hooks as it issues, accounts, and fails
/// packets. The sink object is passed in at construction and owned by the
/// run; there is no process-wide stats registry.
pub trait SchedulerTelemetry: Send + Sync {
    fn on_packet_issued(&self, worker: &WorkerId, size: u64);
    fn on_packet_reported(&self, worker: &WorkerId, size: u64, proc_time: f64);
    fn on_packet_failed(&self, worker: &WorkerId, reason: &FailReason, size: u64);
    fn on_worker_dead(&self, worker: &WorkerId);
    fn on_stall(&self, worker: &WorkerId, silent_for: f64);
}

/// Default telemetry implementation that reports scheduling events through
/// `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSchedulerTelemetry;

impl SchedulerTelemetry for DefaultSchedulerTelemetry {
    fn on_packet_issued(&self, worker: &WorkerId, size: u64) {
        tracing::debug!(worker = %worker, size, "packet issued");
    }

    fn on_packet_reported(&self, worker: &WorkerId, size: u64, proc_time: f64) {
        tracing::debug!(worker = %worker, size, proc_time, "packet reported");
    }

    fn on_packet_failed(&self, worker: &WorkerId, reason: &FailReason, size: u64) {
        tracing::warn!(worker = %worker, %reason, size, "packet failed");
    }

    fn on_worker_dead(&self, worker: &WorkerId) {
        tracing::warn!(worker = %worker, "worker excluded from scheduling");
    }

    fn on_stall(&self, worker: &WorkerId, silent_for: f64) {
        tracing::warn!(worker = %worker, silent_for, "worker silent; speed zeroed");
    }
}
