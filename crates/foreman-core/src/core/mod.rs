pub mod rate;
pub mod worker;

pub use rate::RateWindow;
pub use worker::WorkerStat;
