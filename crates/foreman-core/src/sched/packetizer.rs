use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PacketizerOptions;
use crate::core::worker::WorkerStat;
use crate::error::ForemanError;
use crate::sched::failure::FailureTracker;
use crate::sched::sizing::{PacketSizer, ScheduleView};
use crate::source::PacketSource;
use crate::telemetry::{DefaultSchedulerTelemetry, SchedulerTelemetry};
use crate::types::{
    FailReason, FailedPacket, PacketResponse, Result, RunSummary, WorkerId, WorkerReport,
};

/// Phase of a scheduling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No worker has a usable speed estimate yet.
    Calibrating,
    /// Packet sizes are derived from estimated per-worker throughput.
    Steady,
    /// Nothing left to hand out; in-flight packets may still report.
    Draining,
    /// Every issued packet has reported or failed.
    Done,
}

/// Point-in-time aggregate of scheduling state, cheap to take under lock.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub total: u64,
    pub processed: u64,
    pub assigned: u64,
    pub bytes_read: u64,
    /// Packets currently held by workers.
    pub in_flight: usize,
    pub workers: usize,
    /// Time from construction to the first issued packet.
    pub init_time: Duration,
    /// Time since the first issued packet.
    pub proc_time: Duration,
    pub state: RunState,
    pub done: bool,
}

/// Adaptive work packetizer.
///
/// Owns one [`WorkerStat`] per active worker and a [`PacketSource`]; on each
/// worker request it folds the worker's report for its previous packet into
/// state, recomputes throughput estimates, and issues an optimally sized
/// next packet or a terminal signal. All methods assume serialized access
/// (see the dispatch module); nothing here blocks on I/O.
pub struct Packetizer {
    source: Box<dyn PacketSource>,
    sizer: Box<dyn PacketSizer>,
    options: PacketizerOptions,
    telemetry: Arc<dyn SchedulerTelemetry>,
    workers: BTreeMap<WorkerId, WorkerStat>,
    failures: FailureTracker,
    started_at: Instant,
    first_issue: Option<Duration>,
    stopped: bool,
}

impl Packetizer {
    /// Creates a packetizer using the default telemetry implementation.
    pub fn new(source: Box<dyn PacketSource>, options: PacketizerOptions) -> Self {
        Self::with_telemetry(source, options, Arc::new(DefaultSchedulerTelemetry))
    }

    /// Creates a packetizer with a custom telemetry backend.
    pub fn with_telemetry(
        source: Box<dyn PacketSource>,
        options: PacketizerOptions,
        telemetry: Arc<dyn SchedulerTelemetry>,
    ) -> Self {
        let sizer = options.sizing.build();
        let failures = FailureTracker::new(options.failure_threshold);

        Self {
            source,
            sizer,
            options,
            telemetry,
            workers: BTreeMap::new(),
            failures,
            started_at: Instant::now(),
            first_issue: None,
            stopped: false,
        }
    }

    /// Handles one "next packet" request from a worker.
    ///
    /// `report` carries the worker's statistics for its previous packet and
    /// is absent on the worker's very first request. The report is folded in
    /// before any scheduling decision, so a stop or death signal can never
    /// lose completed work.
    pub fn next_packet(
        &mut self,
        worker: &WorkerId,
        report: Option<WorkerReport>,
    ) -> Result<PacketResponse> {
        let now = self.now_secs();

        if self.failures.is_dead(worker) {
            return Ok(PacketResponse::NoMoreWork);
        }

        if !self.workers.contains_key(worker) {
            // Nothing new joins a stopped run.
            if self.stopped {
                return Ok(PacketResponse::NoMoreWork);
            }
            self.workers.insert(
                worker.clone(),
                WorkerStat::new(worker.clone(), self.options.circularity, now),
            );
        }

        match report {
            Some(report) => self.ingest_report(worker, report, now)?,
            // A repeat request without a report means the worker lost its
            // in-flight packet; account it as failed, not as completed.
            None => self.fail_in_flight(worker, "no report for issued packet")?,
        }
        if self.failures.is_dead(worker) {
            return Ok(PacketResponse::NoMoreWork);
        }

        if self.stopped {
            return Ok(PacketResponse::NoMoreWork);
        }

        if self.source.remaining() == 0 {
            return Ok(if self.is_done() {
                PacketResponse::NoMoreWork
            } else {
                PacketResponse::RetryLater
            });
        }

        self.refresh_stalls(now);

        let view = self.schedule_view(worker, now);
        let (speed, samples) = {
            let stat = self.stat(worker)?;
            (
                stat.effective_speed(now, self.stall_secs()),
                stat.sample_count(),
            )
        };
        let size = self
            .sizer
            .next_size(speed, samples, &view)
            .clamp(1, view.remaining);

        let item = self.source.take(size).ok_or_else(|| {
            ForemanError::InvariantViolation(
                "packet source exhausted while entries remained".to_string(),
            )
        })?;

        if self.first_issue.is_none() {
            self.first_issue = Some(self.started_at.elapsed());
        }

        let stat = self.stat_mut(worker)?;
        stat.in_flight = Some(item);
        stat.last_issued = item.count;
        self.telemetry.on_packet_issued(worker, item.count);

        Ok(PacketResponse::Work(item))
    }

    /// Marks a worker dead: its in-flight packet is recorded as failed and
    /// it is excluded from all future scheduling. Idempotent.
    pub fn mark_dead(&mut self, worker: &WorkerId) {
        if self.failures.is_dead(worker) {
            return;
        }
        self.failures.mark_dead(worker);

        if let Some(stat) = self.workers.get_mut(worker) {
            stat.alive = false;
            if let Some(item) = stat.in_flight.take() {
                let failed = FailedPacket {
                    item,
                    worker: worker.clone(),
                    reason: FailReason::WorkerDied,
                };
                self.telemetry
                    .on_packet_failed(worker, &FailReason::WorkerDied, item.count);
                self.failures.record(failed);
            }
        }
        self.telemetry.on_worker_dead(worker);
    }

    /// Stops the run.
    ///
    /// Graceful stop lets in-flight packets report but issues nothing new;
    /// abort also discards in-flight packets, recording each as failed.
    pub fn stop(&mut self, abort: bool) {
        self.stopped = true;
        tracing::info!(abort, "stop requested");

        if abort {
            for (worker, stat) in self.workers.iter_mut() {
                if let Some(item) = stat.in_flight.take() {
                    self.telemetry
                        .on_packet_failed(worker, &FailReason::Aborted, item.count);
                    self.failures.record(FailedPacket {
                        item,
                        worker: worker.clone(),
                        reason: FailReason::Aborted,
                    });
                }
            }
        }
    }

    /// True once every issued packet has reported or failed and nothing is
    /// left to hand out.
    pub fn is_done(&self) -> bool {
        let drained = self.stopped || self.source.remaining() == 0;
        drained && self.workers.values().all(|stat| stat.in_flight.is_none())
    }

    pub fn state(&self) -> RunState {
        if self.is_done() {
            RunState::Done
        } else if self.stopped || self.source.remaining() == 0 {
            RunState::Draining
        } else if self.workers.values().any(|stat| stat.sample_count() >= 2) {
            RunState::Steady
        } else {
            RunState::Calibrating
        }
    }

    pub fn options(&self) -> &PacketizerOptions {
        &self.options
    }

    pub fn worker_stat(&self, worker: &WorkerId) -> Option<&WorkerStat> {
        self.workers.get(worker)
    }

    /// Aggregates counters for progress reporting; read-only and cheap.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let now = self.started_at.elapsed();
        let (init_time, proc_time) = match self.first_issue {
            Some(first) => (first, now.saturating_sub(first)),
            None => (now, Duration::ZERO),
        };

        SchedulerSnapshot {
            total: self.source.total(),
            processed: self.source.processed(),
            assigned: self.source.assigned(),
            bytes_read: self.workers.values().map(|stat| stat.bytes_read).sum(),
            in_flight: self
                .workers
                .values()
                .filter(|stat| stat.in_flight.is_some())
                .count(),
            workers: self.workers.len(),
            init_time,
            proc_time,
            state: self.state(),
            done: self.is_done(),
        }
    }

    /// Final accounting, including the failed-packet list.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            total: self.source.total(),
            processed: self.source.processed(),
            bytes_read: self.workers.values().map(|stat| stat.bytes_read).sum(),
            elapsed: self.started_at.elapsed(),
            failed: self.failures.failed().to_vec(),
            failure_threshold_exceeded: self.failures.threshold_exceeded(),
            workers: self.workers.values().map(WorkerStat::summary).collect(),
        }
    }

    fn ingest_report(&mut self, worker: &WorkerId, report: WorkerReport, now: f64) -> Result<()> {
        {
            let stat = self.stat_mut(worker)?;
            stat.last_report_at = now;
            stat.stalled = false;
            stat.cpu_time = stat.cpu_time.max(report.cpu_time);
            stat.bytes_read = stat.bytes_read.max(report.bytes_read);
        }

        if let Some(message) = report.error {
            return self.fail_in_flight(worker, message);
        }

        let stat = self.stat_mut(worker)?;
        let Some(item) = stat.in_flight.take() else {
            // No packet in flight (first contact, or after an abort).
            return Ok(());
        };

        stat.processed = stat.processed.saturating_add(item.count);
        stat.packets += 1;
        stat.strikes = 0;
        let processed = stat.processed;
        stat.record_sample(report.proc_time, processed);

        self.source
            .mark_processed(item.count)
            .map_err(|err| err.with_context(format!("report from worker {worker}")))?;
        self.telemetry
            .on_packet_reported(worker, item.count, report.proc_time);

        Ok(())
    }

    /// Records the worker's in-flight packet as failed and applies a
    /// strike; the worker is marked bad once it collects too many.
    fn fail_in_flight(&mut self, worker: &WorkerId, message: impl Into<String>) -> Result<()> {
        let max_strikes = self.options.max_worker_failures;
        let stat = self.stat_mut(worker)?;
        let Some(item) = stat.in_flight.take() else {
            return Ok(());
        };

        stat.strikes += 1;
        let strike_out = stat.strikes >= max_strikes;
        if strike_out {
            stat.alive = false;
        }

        let reason = FailReason::WorkerError(message.into());
        self.telemetry.on_packet_failed(worker, &reason, item.count);
        self.failures.record(FailedPacket {
            item,
            worker: worker.clone(),
            reason,
        });
        if strike_out {
            self.failures.mark_dead(worker);
            self.telemetry.on_worker_dead(worker);
        }

        Ok(())
    }

    /// Applies the silence heuristic: a worker with no report for longer
    /// than four time limits is treated as having zero speed until it
    /// reports again.
    fn refresh_stalls(&mut self, now: f64) {
        let stall_after = self.stall_secs();
        for (worker, stat) in self.workers.iter_mut() {
            let silent_for = now - stat.last_report_at;
            let stalled = stat.alive && silent_for > stall_after && stat.raw_speed() > 0.0;
            if stalled && !stat.stalled {
                stat.stalled = true;
                self.telemetry.on_stall(worker, silent_for);
            } else if !stalled {
                stat.stalled = false;
            }
        }
    }

    fn schedule_view(&self, requester: &WorkerId, now: f64) -> ScheduleView {
        let stall_after = self.stall_secs();
        let mut sum_speed = 0.0;
        let mut sum_busy = 0.0;
        let mut worker_count = 0usize;

        for (worker, stat) in &self.workers {
            if !stat.alive {
                continue;
            }
            worker_count += 1;

            let speed = stat.effective_speed(now, stall_after);
            if speed > 0.0 {
                sum_speed += speed;
            }
            if worker != requester {
                sum_busy += stat.busy_estimate(now, stall_after);
            }
        }

        ScheduleView {
            remaining: self.source.remaining(),
            worker_count: worker_count.max(1),
            sum_speed,
            sum_busy,
            time_limit: self.options.time_limit.as_secs_f64(),
            calibration_packet: self.options.calibration_packet,
        }
    }

    fn stat(&self, worker: &WorkerId) -> Result<&WorkerStat> {
        self.workers
            .get(worker)
            .ok_or_else(|| ForemanError::InvariantViolation(format!("no record for {worker}")))
    }

    fn stat_mut(&mut self, worker: &WorkerId) -> Result<&mut WorkerStat> {
        self.workers
            .get_mut(worker)
            .ok_or_else(|| ForemanError::InvariantViolation(format!("no record for {worker}")))
    }

    fn now_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    fn stall_secs(&self) -> f64 {
        self.options.stall_after().as_secs_f64()
    }
}
