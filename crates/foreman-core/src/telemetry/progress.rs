use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Sender};
use serde::{Deserialize, Serialize};

use crate::config::ProgressOptions;
use crate::core::rate::RateWindow;
use crate::sched::packetizer::Packetizer;
use crate::telemetry::feedback::{FeedbackQueue, FeedbackSet};
use crate::types::Result;

/// Aggregate progress computed fresh on each reporter tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// Entries in the dataset.
    pub total: u64,
    /// Entries completed so far.
    pub processed: u64,
    /// Bytes read across all workers.
    pub bytes_read: u64,
    /// Time from scheduler construction to the first issued packet.
    pub init_time: Duration,
    /// Time since the first issued packet.
    pub proc_time: Duration,
    /// Instantaneous entry rate in entries per second.
    pub evt_rate: f64,
    /// Instantaneous read rate in bytes per second.
    pub byte_rate: f64,
    /// Set on the terminal sample, which is emitted exactly once.
    pub done: bool,
}

/// Receives progress samples and merged feedback on the reporter cadence.
///
/// Emission failures are logged and skipped on the next tick; they never
/// stall the scheduling loop.
pub trait ProgressSink: Send {
    fn on_progress(&mut self, sample: &ProgressSample) -> Result<()>;

    fn on_feedback(&mut self, _feedback: &FeedbackSet) -> Result<()> {
        Ok(())
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&mut self, _sample: &ProgressSample) -> Result<()> {
        Ok(())
    }
}

/// Adapter turning a closure into a [`ProgressSink`].
pub struct FnProgressSink<F> {
    pub callback: F,
}

impl<F> ProgressSink for FnProgressSink<F>
where
    F: FnMut(&ProgressSample) + Send,
{
    fn on_progress(&mut self, sample: &ProgressSample) -> Result<()> {
        (self.callback)(sample);
        Ok(())
    }
}

/// Periodic, cancellable progress reporter.
///
/// Runs on a dedicated thread with an explicit stop channel; each tick it
/// holds the scheduler lock only long enough to snapshot the aggregate
/// counters, then computes instantaneous rates over a bounded sample window
/// and emits through the sink. The terminal sample (processed == total) is
/// emitted exactly once; later ticks are suppressed.
pub struct ProgressReporter {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Spawns the reporter thread.
    pub fn spawn<S>(
        shared: Arc<Mutex<Packetizer>>,
        feedback: Arc<FeedbackQueue>,
        options: ProgressOptions,
        sink: S,
    ) -> Self
    where
        S: ProgressSink + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::spawn(move || {
            let ticker = tick(options.period);
            let mut state = ReporterState::new(&options, sink);

            loop {
                select! {
                    recv(ticker) -> _ => {
                        state.tick(&shared, &feedback);
                    }
                    recv(stop_rx) -> _ => {
                        if options.emit_final {
                            state.tick(&shared, &feedback);
                        }
                        break;
                    }
                }
            }
        });

        Self { stop_tx, handle }
    }

    /// Signals the reporter to stop and waits for the thread to exit.
    ///
    /// When `emit_final` is set, one last sample is emitted on the way out
    /// unless the terminal sample already went.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::warn!("progress reporter thread panicked");
        }
    }
}

struct ReporterState<S> {
    sink: S,
    events: RateWindow,
    bytes: RateWindow,
    aggregate: FeedbackSet,
    started_at: Instant,
    done_emitted: bool,
}

impl<S: ProgressSink> ReporterState<S> {
    fn new(options: &ProgressOptions, sink: S) -> Self {
        Self {
            sink,
            events: RateWindow::new(options.circularity),
            bytes: RateWindow::new(options.circularity),
            aggregate: FeedbackSet::new(),
            started_at: Instant::now(),
            done_emitted: false,
        }
    }

    fn tick(&mut self, shared: &Arc<Mutex<Packetizer>>, feedback: &Arc<FeedbackQueue>) {
        // Short critical section: snapshot only, no emission under lock.
        let snapshot = lock_unpoisoned(shared).snapshot();

        let now = self.started_at.elapsed().as_secs_f64();
        self.events.record(now, snapshot.processed);
        self.bytes.record(now, snapshot.bytes_read);

        if snapshot.done && self.done_emitted {
            return;
        }

        let pending = feedback.drain();
        if !pending.is_empty() {
            for object in pending {
                if let Err(error) = self.aggregate.absorb(object) {
                    tracing::warn!(%error, "feedback merge failed; object dropped");
                }
            }
            if let Err(error) = self.sink.on_feedback(&self.aggregate) {
                tracing::warn!(%error, "feedback forwarding failed; skipped");
            }
        }

        let sample = ProgressSample {
            total: snapshot.total,
            processed: snapshot.processed,
            bytes_read: snapshot.bytes_read,
            init_time: snapshot.init_time,
            proc_time: snapshot.proc_time,
            evt_rate: self.events.speed(),
            byte_rate: self.bytes.speed(),
            done: snapshot.done,
        };

        if let Err(error) = self.sink.on_progress(&sample) {
            tracing::warn!(%error, "progress emission failed; skipped");
            return;
        }

        if snapshot.done {
            self.done_emitted = true;
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
