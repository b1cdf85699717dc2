use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ForemanError;
use crate::sched::sizing::SizingPolicy;
use crate::types::Result;

/// Knobs that drive packet sizing and failure handling.
///
/// Constructed with [`Default`] or from an opaque name/value configuration
/// bag handed down by the controlling layer (see [`PacketizerOptions::from_bag`]).
#[derive(Debug, Clone)]
pub struct PacketizerOptions {
    /// Target per-packet processing time; drives packet sizing granularity.
    pub time_limit: Duration,
    /// Packet size used while a worker has no usable speed estimate.
    pub calibration_packet: u64,
    /// Capacity of the per-worker throughput sample history.
    pub circularity: usize,
    /// Consecutive failed reports after which a worker is marked bad.
    pub max_worker_failures: u32,
    /// Failed-packet count above which the summary flags escalation.
    pub failure_threshold: Option<usize>,
    /// Packet sizing policy.
    pub sizing: SizingPolicy,
}

impl Default for PacketizerOptions {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(1),
            calibration_packet: 5,
            circularity: 8,
            max_worker_failures: 3,
            failure_threshold: None,
            sizing: SizingPolicy::Adaptive,
        }
    }
}

impl PacketizerOptions {
    /// Reads scheduling knobs from a name/value configuration bag.
    ///
    /// Recognized keys: `timeLimit` (seconds), `circularityDepth`,
    /// `calibrationPacket`, `maxWorkerFailures`, `failureThreshold`,
    /// `strategy` (`adaptive` or `fixed`), `packetSize` (fixed strategy).
    /// Unknown keys are ignored.
    pub fn from_bag(bag: &BTreeMap<String, String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(raw) = bag.get("timeLimit") {
            let seconds = parse_value::<f64>("timeLimit", raw)?;
            if seconds <= 0.0 {
                return Err(ForemanError::InvalidConfig(
                    "timeLimit must be positive".to_string(),
                ));
            }
            options.time_limit = Duration::from_secs_f64(seconds);
        }
        if let Some(raw) = bag.get("circularityDepth") {
            let depth = parse_value::<usize>("circularityDepth", raw)?;
            if depth < 2 {
                return Err(ForemanError::InvalidConfig(
                    "circularityDepth must be at least 2".to_string(),
                ));
            }
            options.circularity = depth;
        }
        if let Some(raw) = bag.get("calibrationPacket") {
            options.calibration_packet = parse_value("calibrationPacket", raw)?;
        }
        if let Some(raw) = bag.get("maxWorkerFailures") {
            options.max_worker_failures = parse_value("maxWorkerFailures", raw)?;
        }
        if let Some(raw) = bag.get("failureThreshold") {
            options.failure_threshold = Some(parse_value("failureThreshold", raw)?);
        }
        if let Some(raw) = bag.get("strategy") {
            options.sizing = match raw.as_str() {
                "adaptive" => SizingPolicy::Adaptive,
                "fixed" => {
                    let size = match bag.get("packetSize") {
                        Some(raw_size) => parse_value("packetSize", raw_size)?,
                        None => options.calibration_packet,
                    };
                    SizingPolicy::Fixed(size)
                }
                other => {
                    return Err(ForemanError::InvalidConfig(format!(
                        "unknown strategy {other:?}"
                    )));
                }
            };
        }

        Ok(options)
    }

    /// Silence threshold after which a worker's speed is treated as zero.
    pub fn stall_after(&self) -> Duration {
        self.time_limit.saturating_mul(4)
    }
}

/// Knobs for the periodic progress reporter.
#[derive(Debug, Clone)]
pub struct ProgressOptions {
    /// Tick period for progress emission.
    pub period: Duration,
    /// Emit one last sample when the reporter stops before completion.
    pub emit_final: bool,
    /// Capacity of the rate sample history used for instantaneous rates.
    pub circularity: usize,
}

impl Default for ProgressOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
            emit_final: true,
            circularity: 8,
        }
    }
}

impl ProgressOptions {
    /// Reads reporter knobs from a name/value configuration bag.
    ///
    /// Recognized keys: `progressPeriod` (milliseconds), `circularityDepth`.
    pub fn from_bag(bag: &BTreeMap<String, String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(raw) = bag.get("progressPeriod") {
            let millis = parse_value::<u64>("progressPeriod", raw)?;
            if millis == 0 {
                return Err(ForemanError::InvalidConfig(
                    "progressPeriod must be positive".to_string(),
                ));
            }
            options.period = Duration::from_millis(millis);
        }
        if let Some(raw) = bag.get("circularityDepth") {
            let depth = parse_value::<usize>("circularityDepth", raw)?;
            if depth < 2 {
                return Err(ForemanError::InvalidConfig(
                    "circularityDepth must be at least 2".to_string(),
                ));
            }
            options.circularity = depth;
        }

        Ok(options)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ForemanError::InvalidConfig(format!("invalid value {raw:?} for {key}")))
}
