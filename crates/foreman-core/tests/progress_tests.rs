use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use foreman_core::{
    Feedback, FeedbackQueue, FeedbackSet, FnProgressSink, ForemanError, PacketResponse, Packetizer,
    PacketizerOptions, ProgressOptions, ProgressReporter, ProgressSample, ProgressSink, UnitPool,
    WorkerId, WorkerReport,
};

fn shared_packetizer(total: u64) -> Arc<Mutex<Packetizer>> {
    Arc::new(Mutex::new(Packetizer::new(
        Box::new(UnitPool::single(total)),
        PacketizerOptions::default(),
    )))
}

fn collecting_sink(
    samples: Arc<Mutex<Vec<ProgressSample>>>,
) -> FnProgressSink<impl FnMut(&ProgressSample) + Send> {
    FnProgressSink {
        callback: move |sample: &ProgressSample| {
            samples.lock().expect("sample mutex poisoned").push(sample.clone());
        },
    }
}

fn options(period_ms: u64) -> ProgressOptions {
    ProgressOptions {
        period: Duration::from_millis(period_ms),
        ..ProgressOptions::default()
    }
}

#[test]
fn reporter_emits_periodic_samples() {
    let shared = shared_packetizer(1_000);
    let samples = Arc::new(Mutex::new(Vec::new()));
    let reporter = ProgressReporter::spawn(
        Arc::clone(&shared),
        Arc::new(FeedbackQueue::new()),
        options(10),
        collecting_sink(Arc::clone(&samples)),
    );

    thread::sleep(Duration::from_millis(80));
    reporter.stop();

    let samples = samples.lock().expect("sample mutex poisoned");
    assert!(samples.len() >= 3, "only {} samples emitted", samples.len());
    assert!(samples.iter().all(|sample| sample.total == 1_000));
    assert!(samples.iter().all(|sample| !sample.done));
    assert!(samples
        .windows(2)
        .all(|pair| pair[1].processed >= pair[0].processed));
}

#[test]
fn terminal_sample_is_emitted_exactly_once() -> Result<(), Box<dyn std::error::Error>> {
    let shared = shared_packetizer(20);
    let samples = Arc::new(Mutex::new(Vec::new()));
    let reporter = ProgressReporter::spawn(
        Arc::clone(&shared),
        Arc::new(FeedbackQueue::new()),
        options(10),
        collecting_sink(Arc::clone(&samples)),
    );

    // Drive one worker to completion through the shared state.
    let worker = WorkerId::from("0.0");
    let mut proc_time = 0.0;
    let mut report: Option<WorkerReport> = None;
    loop {
        let response = {
            let mut scheduler = shared.lock().expect("scheduler mutex poisoned");
            scheduler.next_packet(&worker, report.take())?
        };
        match response {
            PacketResponse::Work(item) => {
                proc_time += item.count as f64 / 100.0;
                report = Some(WorkerReport::new(proc_time));
            }
            PacketResponse::RetryLater => thread::sleep(Duration::from_millis(1)),
            PacketResponse::NoMoreWork => break,
        }
    }

    // Leave plenty of ticks after completion, then stop (which would force
    // one more emission if the terminal sample had not gone out already).
    thread::sleep(Duration::from_millis(80));
    reporter.stop();

    let samples = samples.lock().expect("sample mutex poisoned");
    let done_count = samples.iter().filter(|sample| sample.done).count();
    assert_eq!(done_count, 1, "terminal sample emitted {done_count} times");

    let last = samples.last().expect("at least one sample");
    assert!(last.done);
    assert_eq!(last.processed, 20);

    Ok(())
}

struct FlakySink {
    failures_left: usize,
    samples: Arc<Mutex<Vec<ProgressSample>>>,
}

impl ProgressSink for FlakySink {
    fn on_progress(&mut self, sample: &ProgressSample) -> foreman_core::Result<()> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(ForemanError::Dispatch("sink offline".to_string()));
        }
        self.samples
            .lock()
            .expect("sample mutex poisoned")
            .push(sample.clone());
        Ok(())
    }
}

#[test]
fn sink_failures_are_skipped_not_fatal() {
    let shared = shared_packetizer(100);
    let samples = Arc::new(Mutex::new(Vec::new()));
    let reporter = ProgressReporter::spawn(
        Arc::clone(&shared),
        Arc::new(FeedbackQueue::new()),
        options(10),
        FlakySink {
            failures_left: 2,
            samples: Arc::clone(&samples),
        },
    );

    thread::sleep(Duration::from_millis(80));
    reporter.stop();

    let samples = samples.lock().expect("sample mutex poisoned");
    assert!(
        !samples.is_empty(),
        "reporter never recovered from sink failures"
    );
}

struct CounterFeedback {
    name: String,
    value: u64,
}

impl Feedback for CounterFeedback {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, other: &dyn Feedback) -> foreman_core::Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<CounterFeedback>()
            .ok_or_else(|| ForemanError::Feedback("counter merged with non-counter".to_string()))?;
        self.value += other.value;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct FeedbackProbe {
    seen: Arc<Mutex<Vec<(String, u64)>>>,
}

impl ProgressSink for FeedbackProbe {
    fn on_progress(&mut self, _sample: &ProgressSample) -> foreman_core::Result<()> {
        Ok(())
    }

    fn on_feedback(&mut self, feedback: &FeedbackSet) -> foreman_core::Result<()> {
        let mut seen = self.seen.lock().expect("probe mutex poisoned");
        seen.clear();
        for name in feedback.names() {
            let value = feedback
                .get(name)
                .and_then(|object| object.as_any().downcast_ref::<CounterFeedback>())
                .map(|counter| counter.value)
                .unwrap_or(0);
            seen.push((name.to_string(), value));
        }
        Ok(())
    }
}

#[test]
fn feedback_objects_merge_by_name_and_forward() {
    let shared = shared_packetizer(100);
    let queue = Arc::new(FeedbackQueue::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let reporter = ProgressReporter::spawn(
        Arc::clone(&shared),
        Arc::clone(&queue),
        options(10),
        FeedbackProbe {
            seen: Arc::clone(&seen),
        },
    );

    queue.post(Box::new(CounterFeedback {
        name: "hits".to_string(),
        value: 3,
    }));
    queue.post(Box::new(CounterFeedback {
        name: "hits".to_string(),
        value: 4,
    }));
    queue.post(Box::new(CounterFeedback {
        name: "misses".to_string(),
        value: 1,
    }));

    thread::sleep(Duration::from_millis(60));
    reporter.stop();

    let seen = seen.lock().expect("probe mutex poisoned");
    assert_eq!(
        seen.as_slice(),
        [("hits".to_string(), 7), ("misses".to_string(), 1)]
    );
}
