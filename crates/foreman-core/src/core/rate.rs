/// Bounded circular buffer of (time, cumulative count) samples.
///
/// Derives an instantaneous throughput from the oldest and newest samples
/// still in the window. Overwriting the oldest sample on overflow is what
/// keeps the estimate moving with recent behavior.
#[derive(Debug, Clone)]
pub struct RateWindow {
    samples: Vec<(f64, u64)>,
    capacity: usize,
    head: usize,
}

impl RateWindow {
    /// Creates a window holding up to `capacity` samples (at least 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Appends a sample, overwriting the oldest one when the window is full.
    pub fn record(&mut self, time: f64, count: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push((time, count));
            return;
        }

        self.samples[self.head] = (time, count);
        self.head = (self.head + 1) % self.capacity;
    }

    /// Oldest sample still in the window.
    pub fn oldest(&self) -> Option<(f64, u64)> {
        if self.samples.len() < self.capacity {
            return self.samples.first().copied();
        }
        self.samples.get(self.head).copied()
    }

    /// Most recently recorded sample.
    pub fn newest(&self) -> Option<(f64, u64)> {
        if self.samples.len() < self.capacity {
            return self.samples.last().copied();
        }
        let newest = (self.head + self.capacity - 1) % self.capacity;
        self.samples.get(newest).copied()
    }

    /// Throughput over the window in counts per second.
    ///
    /// Returns 0 with fewer than two samples (bootstrap state) or when the
    /// time delta is not positive.
    pub fn speed(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let (Some((t_old, c_old)), Some((t_new, c_new))) = (self.oldest(), self.newest()) else {
            return 0.0;
        };

        let dt = t_new - t_old;
        if dt <= 0.0 {
            return 0.0;
        }

        c_new.saturating_sub(c_old) as f64 / dt
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.head = 0;
    }
}
