pub mod dispatch;
pub mod failure;
pub mod packetizer;
pub mod sizing;

pub use dispatch::{Dispatcher, SchedulerClient, SchedulerCommand};
pub use failure::FailureTracker;
pub use packetizer::{Packetizer, RunState, SchedulerSnapshot};
pub use sizing::{AdaptiveSizer, FixedSizer, PacketSizer, ScheduleView, SizingPolicy};
