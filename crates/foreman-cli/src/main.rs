use std::any::Any;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use foreman_core::{
    Dispatcher, Feedback, FeedbackSet, PacketResponse, Packetizer, PacketizerOptions,
    ProgressOptions, ProgressReporter, ProgressSample, ProgressSink, RunSummary, SchedulerClient,
    SizingPolicy, UnitPool, WorkerId, WorkerReport,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Adaptive work packetizer simulator",
    long_about = "Drive a scheduling run over synthetic workers and watch packet \
                  sizes adapt to their throughput."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated scheduling round and print progress and a summary.
    Simulate {
        /// Total number of entries in the synthetic dataset.
        #[arg(long, default_value_t = 100_000)]
        total: u64,

        /// Number of partitionable units the dataset splits into.
        #[arg(long, default_value_t = 8)]
        units: u64,

        /// Number of simulated workers (defaults to CPU count).
        #[arg(long, default_value_t = num_cpus::get())]
        workers: usize,

        /// Worker speeds in entries/second, cycled over the pool.
        #[arg(long, default_value = "40000,20000,10000")]
        speeds: String,

        /// Bytes read per processed entry (feeds the byte-rate stats).
        #[arg(long, default_value_t = 64)]
        entry_bytes: u64,

        /// Target per-packet processing time in milliseconds.
        #[arg(long, default_value_t = 1000)]
        time_limit_ms: u64,

        /// Progress emission period in milliseconds.
        #[arg(long, default_value_t = 500)]
        progress_ms: u64,

        /// Sample-history depth for throughput estimates.
        #[arg(long, default_value_t = 8)]
        circularity: usize,

        /// Packet sizing strategy.
        #[arg(long, value_enum, default_value_t = StrategyArg::Adaptive)]
        strategy: StrategyArg,

        /// Packet size when using the fixed strategy.
        #[arg(long, default_value_t = 500)]
        packet_size: u64,

        /// Kill this worker index mid-run to exercise failure handling.
        #[arg(long)]
        kill: Option<usize>,

        /// Delay before the kill signal, in milliseconds.
        #[arg(long, default_value_t = 500)]
        kill_after_ms: u64,

        /// Print the final summary as JSON on stdout.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Adaptive,
    Fixed,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            total,
            units,
            workers,
            speeds,
            entry_bytes,
            time_limit_ms,
            progress_ms,
            circularity,
            strategy,
            packet_size,
            kill,
            kill_after_ms,
            json,
        } => simulate_command(SimulateArgs {
            total,
            units,
            workers: workers.max(1),
            speeds: parse_speeds(&speeds)?,
            entry_bytes,
            time_limit: Duration::from_millis(time_limit_ms.max(1)),
            progress_period: Duration::from_millis(progress_ms.max(50)),
            circularity,
            sizing: match strategy {
                StrategyArg::Adaptive => SizingPolicy::Adaptive,
                StrategyArg::Fixed => SizingPolicy::Fixed(packet_size.max(1)),
            },
            kill,
            kill_after: Duration::from_millis(kill_after_ms),
            json,
        }),
    }
}

struct SimulateArgs {
    total: u64,
    units: u64,
    workers: usize,
    speeds: Vec<f64>,
    entry_bytes: u64,
    time_limit: Duration,
    progress_period: Duration,
    circularity: usize,
    sizing: SizingPolicy,
    kill: Option<usize>,
    kill_after: Duration,
    json: bool,
}

fn simulate_command(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        total = args.total,
        workers = args.workers,
        "starting simulated run"
    );

    let options = PacketizerOptions {
        time_limit: args.time_limit,
        circularity: args.circularity.max(2),
        sizing: args.sizing,
        ..PacketizerOptions::default()
    };

    let scheduler = Packetizer::new(Box::new(unit_pool(args.total, args.units)), options);
    let dispatcher = Dispatcher::spawn(scheduler);
    let reporter = ProgressReporter::spawn(
        dispatcher.shared(),
        dispatcher.feedback(),
        ProgressOptions {
            period: args.progress_period,
            circularity: args.circularity.max(2),
            ..ProgressOptions::default()
        },
        CliProgress::default(),
    );

    let mut handles = Vec::with_capacity(args.workers);
    let mut kill_flags = Vec::with_capacity(args.workers);
    for idx in 0..args.workers {
        let client = dispatcher.client();
        let id = WorkerId::new(format!("0.{idx}"));
        let speed = args.speeds[idx % args.speeds.len()];
        let entry_bytes = args.entry_bytes;
        let killed = Arc::new(AtomicBool::new(false));
        kill_flags.push(Arc::clone(&killed));
        handles.push(thread::spawn(move || {
            run_worker(client, id, speed, entry_bytes, killed);
        }));
    }

    if let Some(victim) = args.kill.filter(|victim| *victim < args.workers) {
        let dead_id = WorkerId::new(format!("0.{victim}"));
        let flag = Arc::clone(&kill_flags[victim]);
        let kill_client = dispatcher.client();
        let kill_after = args.kill_after;
        thread::spawn(move || {
            thread::sleep(kill_after);
            flag.store(true, Ordering::Release);
            let _ = kill_client.mark_dead(dead_id);
        });
    }

    for handle in handles {
        if handle.join().is_err() {
            eprintln!("warning: a worker thread panicked");
        }
    }

    reporter.stop();
    eprintln!();

    let summary = dispatcher.finish()?;
    print_summary(&summary, args.json)?;

    Ok(())
}

fn unit_pool(total: u64, units: u64) -> UnitPool {
    let units = units.clamp(1, total.max(1));
    let base = total / units;
    let remainder = total % units;
    UnitPool::new((0..units).map(|idx| base + u64::from(idx < remainder)))
}

fn run_worker(
    client: SchedulerClient,
    id: WorkerId,
    speed: f64,
    entry_bytes: u64,
    killed: Arc<AtomicBool>,
) {
    let mut proc_time = 0.0;
    let mut processed = 0u64;
    let mut report: Option<WorkerReport> = None;

    loop {
        if killed.load(Ordering::Acquire) {
            break;
        }

        match client.next_packet(id.clone(), report.take()) {
            Ok(PacketResponse::Work(item)) => {
                let cost = item.count as f64 / speed;
                thread::sleep(Duration::from_secs_f64(cost));
                proc_time += cost;
                processed += item.count;
                report =
                    Some(WorkerReport::new(proc_time).with_bytes_read(processed * entry_bytes));

                let _ = client.post_feedback(Box::new(EntryCounter {
                    value: item.count,
                }));
            }
            Ok(PacketResponse::RetryLater) => thread::sleep(Duration::from_millis(10)),
            Ok(PacketResponse::NoMoreWork) | Err(_) => break,
        }
    }
}

/// Demo feedback object: a mergeable counter of entries seen by workers.
struct EntryCounter {
    value: u64,
}

impl Feedback for EntryCounter {
    fn name(&self) -> &str {
        "entries_seen"
    }

    fn merge_from(&mut self, other: &dyn Feedback) -> foreman_core::Result<()> {
        if let Some(other) = other.as_any().downcast_ref::<EntryCounter>() {
            self.value += other.value;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct CliProgress {
    entries_seen: u64,
}

impl ProgressSink for CliProgress {
    fn on_progress(&mut self, sample: &ProgressSample) -> foreman_core::Result<()> {
        let percent = if sample.total > 0 {
            sample.processed as f64 / sample.total as f64 * 100.0
        } else {
            100.0
        };

        eprint!(
            "\r\x1b[2K[{percent:6.2}%] {}/{} entries | {} evt/s | {}/s read | fb {} | elapsed {}",
            sample.processed,
            sample.total,
            format_rate(sample.evt_rate),
            format_bytes_rate(sample.byte_rate),
            self.entries_seen,
            format_duration(sample.init_time + sample.proc_time),
        );
        io::stderr().flush()?;
        Ok(())
    }

    fn on_feedback(&mut self, feedback: &FeedbackSet) -> foreman_core::Result<()> {
        if let Some(counter) = feedback
            .get("entries_seen")
            .and_then(|object| object.as_any().downcast_ref::<EntryCounter>())
        {
            self.entries_seen = counter.value;
        }
        Ok(())
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        for (key, value) in summary.to_flat_map() {
            println!("{key} = {value}");
        }
    }

    if !summary.failed.is_empty() {
        eprintln!(
            "warning: {} packet(s) with {} entries could not be completed",
            summary.failed.len(),
            summary.entries_lost()
        );
        for failed in &summary.failed {
            eprintln!(
                "  unit {} [{}..{}) on {}: {}",
                failed.item.unit,
                failed.item.first,
                failed.item.end(),
                failed.worker,
                failed.reason
            );
        }
    }
    if summary.failure_threshold_exceeded {
        eprintln!("warning: failed-packet threshold exceeded; escalate this run");
    }

    Ok(())
}

fn parse_speeds(raw: &str) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
    let speeds: Vec<f64> = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("invalid speed list {raw:?}"))?;

    if speeds.is_empty() || speeds.iter().any(|speed| *speed <= 0.0) {
        return Err(format!("speeds must be positive: {raw:?}").into());
    }
    Ok(speeds)
}

fn format_rate(rate: f64) -> String {
    if rate >= 1_000_000.0 {
        format!("{:.1}M", rate / 1_000_000.0)
    } else if rate >= 1_000.0 {
        format!("{:.1}k", rate / 1_000.0)
    } else {
        format!("{rate:.0}")
    }
}

fn format_bytes_rate(rate: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = rate;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    if total_secs >= 60 {
        format!("{}m{:02}s", total_secs / 60, total_secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
