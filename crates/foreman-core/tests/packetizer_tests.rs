use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use foreman_core::{
    FailReason, PacketResponse, Packetizer, PacketizerOptions, RunState, SchedulerTelemetry,
    UnitPool, WorkItem, WorkerId, WorkerReport,
};

fn packetizer(total: u64, options: PacketizerOptions) -> Packetizer {
    Packetizer::new(Box::new(UnitPool::single(total)), options)
}

/// Drives one synthetic worker with a fixed throughput, without sleeping:
/// reported processing times are derived from the configured speed.
struct SimWorker {
    id: WorkerId,
    speed: f64,
    proc_time: f64,
    processed: u64,
    pending: Option<u64>,
    issued: u64,
    done: bool,
}

impl SimWorker {
    fn new(id: &str, speed: f64) -> Self {
        Self {
            id: WorkerId::from(id),
            speed,
            proc_time: 0.0,
            processed: 0,
            pending: None,
            issued: 0,
            done: false,
        }
    }

    fn report(&mut self) -> Option<WorkerReport> {
        let count = self.pending.take()?;
        self.proc_time += count as f64 / self.speed;
        self.processed += count;
        Some(WorkerReport::new(self.proc_time).with_bytes_read(self.processed * 64))
    }

    fn request(
        &mut self,
        scheduler: &mut Packetizer,
    ) -> Result<PacketResponse, Box<dyn std::error::Error>> {
        let report = self.report();
        let response = scheduler.next_packet(&self.id, report)?;
        match &response {
            PacketResponse::Work(item) => {
                self.pending = Some(item.count);
                self.issued += item.count;
            }
            PacketResponse::NoMoreWork => self.done = true,
            PacketResponse::RetryLater => {}
        }
        Ok(response)
    }
}

fn run_to_completion(
    scheduler: &mut Packetizer,
    workers: &mut [SimWorker],
) -> Result<Vec<WorkItem>, Box<dyn std::error::Error>> {
    let mut items = Vec::new();

    while workers.iter().any(|worker| !worker.done) {
        for worker in workers.iter_mut() {
            if worker.done {
                continue;
            }
            if let PacketResponse::Work(item) = worker.request(scheduler)? {
                items.push(item);
            }
        }
    }

    Ok(items)
}

#[test]
fn first_packets_are_calibration_sized() -> Result<(), Box<dyn std::error::Error>> {
    for (total, worker_count) in [(1000u64, 4usize), (7, 3), (3, 8)] {
        let mut scheduler = packetizer(total, PacketizerOptions::default());
        let bound = 5u64.max(total.div_ceil(worker_count as u64));

        for idx in 0..worker_count {
            let worker = WorkerId::new(format!("0.{idx}"));
            match scheduler.next_packet(&worker, None)? {
                PacketResponse::Work(item) => {
                    assert!(item.count >= 1);
                    assert!(
                        item.count <= bound,
                        "first packet {} exceeds bound {bound}",
                        item.count
                    );
                }
                // Tiny datasets can run out before every worker calibrates.
                PacketResponse::RetryLater | PacketResponse::NoMoreWork => {}
            }
        }
    }

    Ok(())
}

#[test]
fn steady_state_issue_follows_the_time_limit() -> Result<(), Box<dyn std::error::Error>> {
    // total=1000, two workers, time_limit=1s: after both calibrate at
    // speed 5, each steady-state grant stays at round(1s * 5) = 5.
    let mut scheduler = packetizer(1000, PacketizerOptions::default());
    let a = WorkerId::from("0.0");
    let b = WorkerId::from("0.1");

    let PacketResponse::Work(first_a) = scheduler.next_packet(&a, None)? else {
        panic!("expected calibration packet for a");
    };
    assert_eq!(first_a.count, 5);

    let PacketResponse::Work(first_b) = scheduler.next_packet(&b, None)? else {
        panic!("expected calibration packet for b");
    };
    assert_eq!(first_b.count, 5);

    let PacketResponse::Work(second_a) = scheduler.next_packet(&a, Some(WorkerReport::new(1.0)))?
    else {
        panic!("expected steady-state packet for a");
    };
    assert_eq!(second_a.count, 5);
    assert_eq!(scheduler.state(), RunState::Steady);

    let PacketResponse::Work(second_b) = scheduler.next_packet(&b, Some(WorkerReport::new(1.0)))?
    else {
        panic!("expected steady-state packet for b");
    };
    assert_eq!(second_b.count, 5);

    Ok(())
}

#[test]
fn full_run_conserves_entries_without_overlap() -> Result<(), Box<dyn std::error::Error>> {
    let total = 5_000u64;
    let mut scheduler = packetizer(total, PacketizerOptions::default());
    let mut workers = vec![
        SimWorker::new("0.0", 50.0),
        SimWorker::new("0.1", 100.0),
        SimWorker::new("0.2", 25.0),
    ];

    let items = run_to_completion(&mut scheduler, &mut workers)?;

    assert!(scheduler.is_done());
    assert_eq!(scheduler.state(), RunState::Done);

    let summary = scheduler.summary();
    assert_eq!(summary.processed, total);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.bytes_read, total * 64);

    let issued: u64 = items.iter().map(|item| item.count).sum();
    assert_eq!(issued, total);
    for (idx, a) in items.iter().enumerate() {
        for b in items.iter().skip(idx + 1) {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }

    Ok(())
}

#[test]
fn per_worker_progress_is_monotonic() -> Result<(), Box<dyn std::error::Error>> {
    let mut scheduler = packetizer(2_000, PacketizerOptions::default());
    let mut workers = vec![SimWorker::new("0.0", 40.0), SimWorker::new("0.1", 60.0)];
    let mut last_seen = [0u64; 2];

    while workers.iter().any(|worker| !worker.done) {
        for (idx, worker) in workers.iter_mut().enumerate() {
            if worker.done {
                continue;
            }
            worker.request(&mut scheduler)?;

            let processed = scheduler
                .worker_stat(&worker.id)
                .map(|stat| stat.processed)
                .unwrap_or(0);
            assert!(
                processed >= last_seen[idx],
                "worker {idx} went backwards: {processed} < {}",
                last_seen[idx]
            );
            last_seen[idx] = processed;
        }
    }

    Ok(())
}

#[test]
fn steady_state_grants_track_relative_speeds() -> Result<(), Box<dyn std::error::Error>> {
    let total = 50_000u64;
    let mut scheduler = packetizer(total, PacketizerOptions::default());
    let mut workers = vec![SimWorker::new("fast", 80.0), SimWorker::new("slow", 40.0)];

    run_to_completion(&mut scheduler, &mut workers)?;

    let fast = workers[0].issued as f64;
    let slow = workers[1].issued as f64;
    let ratio = fast / slow;
    assert!(
        (1.8..=2.2).contains(&ratio),
        "issue ratio {ratio:.2} strayed from 2:1"
    );

    Ok(())
}

#[test]
fn dead_worker_is_excluded_and_its_packet_is_lost() -> Result<(), Box<dyn std::error::Error>> {
    let total = 200u64;
    let mut scheduler = packetizer(total, PacketizerOptions::default());
    let mut alpha = SimWorker::new("0.0", 50.0);
    let mut beta = SimWorker::new("0.1", 50.0);

    alpha.request(&mut scheduler)?;
    beta.request(&mut scheduler)?;

    // Beta dies holding its calibration packet.
    let lost = beta.pending.expect("beta should hold a packet");
    scheduler.mark_dead(&beta.id);

    let summary = scheduler.summary();
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].reason, FailReason::WorkerDied);
    assert_eq!(summary.entries_lost(), lost);

    // No packet ever goes to a dead worker again, report or not.
    assert_eq!(
        scheduler.next_packet(&beta.id, Some(WorkerReport::new(0.1)))?,
        PacketResponse::NoMoreWork
    );

    let mut rest = vec![alpha];
    run_to_completion(&mut scheduler, &mut rest)?;

    let summary = scheduler.summary();
    assert_eq!(summary.processed + summary.entries_lost(), total);
    assert!(scheduler.is_done());

    Ok(())
}

#[test]
fn error_reports_fail_packets_and_strike_workers_out() -> Result<(), Box<dyn std::error::Error>> {
    let options = PacketizerOptions {
        max_worker_failures: 2,
        ..PacketizerOptions::default()
    };
    let mut scheduler = packetizer(100, options);
    let worker = WorkerId::from("0.0");

    assert!(matches!(
        scheduler.next_packet(&worker, None)?,
        PacketResponse::Work(_)
    ));

    // First failure: packet is lost but the worker stays schedulable.
    let response =
        scheduler.next_packet(&worker, Some(WorkerReport::new(0.5).with_error("tree unreadable")))?;
    assert!(matches!(response, PacketResponse::Work(_)));
    assert_eq!(scheduler.summary().failed.len(), 1);

    // Second failure strikes the worker out.
    let response =
        scheduler.next_packet(&worker, Some(WorkerReport::new(0.9).with_error("tree unreadable")))?;
    assert_eq!(response, PacketResponse::NoMoreWork);

    let summary = scheduler.summary();
    assert_eq!(summary.failed.len(), 2);
    assert!(summary
        .failed
        .iter()
        .all(|failed| matches!(failed.reason, FailReason::WorkerError(_))));
    assert_eq!(summary.processed, 0);

    Ok(())
}

#[test]
fn graceful_stop_drains_in_flight_reports() -> Result<(), Box<dyn std::error::Error>> {
    let mut scheduler = packetizer(1_000, PacketizerOptions::default());
    let mut worker = SimWorker::new("0.0", 100.0);

    worker.request(&mut scheduler)?;
    let in_flight = worker.pending.expect("worker should hold a packet");

    scheduler.stop(false);
    assert!(!scheduler.is_done());
    assert_eq!(scheduler.state(), RunState::Draining);

    // The final report is still folded in before the dismissal.
    assert_eq!(worker.request(&mut scheduler)?, PacketResponse::NoMoreWork);

    let summary = scheduler.summary();
    assert_eq!(summary.processed, in_flight);
    assert!(summary.failed.is_empty());
    assert!(scheduler.is_done());

    Ok(())
}

#[test]
fn abort_discards_in_flight_packets() -> Result<(), Box<dyn std::error::Error>> {
    let mut scheduler = packetizer(1_000, PacketizerOptions::default());
    let mut worker = SimWorker::new("0.0", 100.0);

    worker.request(&mut scheduler)?;
    let in_flight = worker.pending.expect("worker should hold a packet");

    scheduler.stop(true);
    assert!(scheduler.is_done());

    let summary = scheduler.summary();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.entries_lost(), in_flight);
    assert_eq!(summary.failed[0].reason, FailReason::Aborted);

    // A late report no longer has a packet to account against.
    assert_eq!(worker.request(&mut scheduler)?, PacketResponse::NoMoreWork);
    assert_eq!(scheduler.summary().processed, 0);

    Ok(())
}

#[test]
fn draining_pool_answers_retry_later_until_done() -> Result<(), Box<dyn std::error::Error>> {
    let mut scheduler = packetizer(10, PacketizerOptions::default());
    let a = WorkerId::from("0.0");
    let b = WorkerId::from("0.1");

    let PacketResponse::Work(first) = scheduler.next_packet(&a, None)? else {
        panic!("expected work for a");
    };
    assert_eq!(first.count, 5);

    let PacketResponse::Work(_) = scheduler.next_packet(&b, None)? else {
        panic!("expected work for b");
    };

    // Fast worker absorbs the tail within one time limit.
    let PacketResponse::Work(tail) = scheduler.next_packet(&a, Some(WorkerReport::new(0.05)))?
    else {
        panic!("expected tail packet for a");
    };
    assert_eq!(scheduler.state(), RunState::Draining);
    assert!(tail.count > 0);

    // Nothing left to hand out while b's packet is still in flight.
    let late = WorkerId::from("0.2");
    assert_eq!(
        scheduler.next_packet(&late, None)?,
        PacketResponse::RetryLater
    );

    let report_b = WorkerReport::new(0.2);
    assert_eq!(
        scheduler.next_packet(&b, Some(report_b))?,
        PacketResponse::RetryLater
    );

    let report_a = WorkerReport::new(0.1);
    assert_eq!(
        scheduler.next_packet(&a, Some(report_a))?,
        PacketResponse::NoMoreWork
    );
    assert!(scheduler.is_done());
    assert_eq!(scheduler.summary().processed, 10);

    Ok(())
}

#[derive(Default)]
struct StallRecorder {
    stalls: Mutex<Vec<(WorkerId, f64)>>,
}

impl SchedulerTelemetry for StallRecorder {
    fn on_packet_issued(&self, _worker: &WorkerId, _size: u64) {}
    fn on_packet_reported(&self, _worker: &WorkerId, _size: u64, _proc_time: f64) {}
    fn on_packet_failed(&self, _worker: &WorkerId, _reason: &FailReason, _size: u64) {}
    fn on_worker_dead(&self, _worker: &WorkerId) {}

    fn on_stall(&self, worker: &WorkerId, silent_for: f64) {
        self.stalls
            .lock()
            .expect("stall mutex poisoned")
            .push((worker.clone(), silent_for));
    }
}

#[test]
fn silent_worker_is_flagged_as_stalled() -> Result<(), Box<dyn std::error::Error>> {
    let options = PacketizerOptions {
        time_limit: Duration::from_millis(5),
        ..PacketizerOptions::default()
    };
    let telemetry = Arc::new(StallRecorder::default());
    let mut scheduler = Packetizer::with_telemetry(
        Box::new(UnitPool::single(100_000)),
        options,
        Arc::clone(&telemetry) as Arc<dyn SchedulerTelemetry>,
    );

    let mut quiet = SimWorker::new("quiet", 1_000.0);
    let mut busy = SimWorker::new("busy", 1_000.0);

    // Both calibrate and report once so speeds are known.
    quiet.request(&mut scheduler)?;
    busy.request(&mut scheduler)?;
    quiet.request(&mut scheduler)?;
    busy.request(&mut scheduler)?;

    // "quiet" now sits on its packet past four time limits.
    thread::sleep(Duration::from_millis(40));
    busy.request(&mut scheduler)?;

    let stalls = telemetry.stalls.lock().expect("stall mutex poisoned");
    assert!(
        stalls.iter().any(|(worker, _)| worker == &quiet.id),
        "quiet worker was never flagged"
    );
    assert!(stalls.iter().all(|(worker, _)| worker != &busy.id));

    Ok(())
}
