pub mod config;
pub mod core;
pub mod error;
pub mod sched;
pub mod source;
pub mod telemetry;
pub mod types;

pub use config::{PacketizerOptions, ProgressOptions};
pub use core::{RateWindow, WorkerStat};
pub use error::ForemanError;
pub use sched::{
    AdaptiveSizer, Dispatcher, FixedSizer, PacketSizer, Packetizer, RunState, ScheduleView,
    SchedulerClient, SchedulerCommand, SchedulerSnapshot, SizingPolicy,
};
pub use source::{PacketSource, Unit, UnitPool};
pub use telemetry::{
    DefaultSchedulerTelemetry, Feedback, FeedbackQueue, FeedbackSet, FnProgressSink, NoopProgress,
    ProgressReporter, ProgressSample, ProgressSink, SchedulerTelemetry,
};
pub use types::{
    FailReason, FailedPacket, PacketResponse, ReportValue, Result, RunSummary, WorkItem, WorkerId,
    WorkerReport, WorkerSummary,
};
