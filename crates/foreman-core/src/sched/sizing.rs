/// Inputs a sizing policy sees when one worker asks for its next packet.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleView {
    /// Entries not yet handed out.
    pub remaining: u64,
    /// Workers currently participating in the round.
    pub worker_count: usize,
    /// Summed speed of all workers with a positive estimate, in entries/s.
    pub sum_speed: f64,
    /// Entries other workers are still expected to deliver for packets in
    /// flight before they go idle.
    pub sum_busy: f64,
    /// Target per-packet processing time in seconds.
    pub time_limit: f64,
    /// Packet size used while a worker has no usable speed estimate.
    pub calibration_packet: u64,
}

impl ScheduleView {
    /// Bootstrap packet size for a worker without a speed estimate.
    pub fn calibration_size(&self) -> u64 {
        let per_worker = self.remaining / self.worker_count.max(1) as u64;
        self.calibration_packet.min(per_worker).max(1)
    }
}

/// Pluggable packet sizing policy.
///
/// The scheduler clamps whatever a policy returns to `[1, remaining]`.
pub trait PacketSizer: Send {
    fn next_size(&self, speed: f64, samples: usize, view: &ScheduleView) -> u64;
}

/// Selects a sizing policy from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingPolicy {
    /// Throughput-driven sizing via [`AdaptiveSizer`].
    Adaptive,
    /// Constant packet size via [`FixedSizer`].
    Fixed(u64),
}

impl SizingPolicy {
    pub fn build(self) -> Box<dyn PacketSizer> {
        match self {
            Self::Adaptive => Box::new(AdaptiveSizer),
            Self::Fixed(size) => Box::new(FixedSizer::new(size)),
        }
    }
}

/// Sizes packets so every worker stays busy until a common target finish
/// time.
///
/// The projected time to drain the job is `(remaining + busy) / sum_speed`;
/// issuing `min(projection, time_limit) * speed` to the requester keeps a
/// slow worker from holding a huge leftover chunk at the very end, which is
/// where the tail latency of a run comes from.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveSizer;

impl PacketSizer for AdaptiveSizer {
    fn next_size(&self, speed: f64, samples: usize, view: &ScheduleView) -> u64 {
        if samples < 2 {
            return view.calibration_size();
        }

        if speed > 0.0 {
            // The requester can absorb the whole tail within one time limit.
            if view.remaining as f64 / speed < view.time_limit {
                return view.remaining;
            }

            if view.sum_speed > 0.0 {
                let opt_time = (view.remaining as f64 + view.sum_busy) / view.sum_speed;
                return (opt_time.min(view.time_limit) * speed).round() as u64;
            }

            return (view.time_limit * speed).round() as u64;
        }

        // No valid speed yet (or just recovered): re-calibrate.
        view.calibration_size()
    }
}

/// Issues constant-size packets regardless of worker throughput.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizer {
    size: u64,
}

impl FixedSizer {
    pub fn new(size: u64) -> Self {
        Self { size: size.max(1) }
    }
}

impl PacketSizer for FixedSizer {
    fn next_size(&self, _speed: f64, _samples: usize, _view: &ScheduleView) -> u64 {
        self.size
    }
}
