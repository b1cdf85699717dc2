use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::ForemanError;
use crate::sched::packetizer::Packetizer;
use crate::telemetry::feedback::{Feedback, FeedbackQueue};
use crate::types::{PacketResponse, Result, RunSummary, WorkerId, WorkerReport};

/// Control messages for the serialized scheduling loop.
///
/// Every mutation of scheduling state flows through this stream, processed
/// strictly one at a time, so a stop or death signal can never race an
/// in-flight scheduling decision.
pub enum SchedulerCommand {
    NextPacket {
        worker: WorkerId,
        report: Option<WorkerReport>,
        reply: Sender<Result<PacketResponse>>,
    },
    MarkDead {
        worker: WorkerId,
    },
    Stop {
        abort: bool,
    },
    PostFeedback(Box<dyn Feedback>),
}

/// Runs a [`Packetizer`] on its own thread behind a command channel.
///
/// Transports talk to the scheduler through cloneable [`SchedulerClient`]
/// handles; the progress reporter reads through the shared state. Dropping
/// every client and calling [`Dispatcher::finish`] ends the loop.
pub struct Dispatcher {
    shared: Arc<Mutex<Packetizer>>,
    feedback: Arc<FeedbackQueue>,
    tx: Sender<SchedulerCommand>,
    handle: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawns the scheduling thread.
    pub fn spawn(packetizer: Packetizer) -> Self {
        let shared = Arc::new(Mutex::new(packetizer));
        let feedback = Arc::new(FeedbackQueue::new());
        let (tx, rx) = unbounded();

        let loop_shared = Arc::clone(&shared);
        let loop_feedback = Arc::clone(&feedback);
        let handle = thread::spawn(move || {
            run_scheduler_loop(rx, loop_shared, loop_feedback);
        });

        Self {
            shared,
            feedback,
            tx,
            handle,
        }
    }

    /// Creates a request handle for a worker transport.
    pub fn client(&self) -> SchedulerClient {
        SchedulerClient {
            tx: self.tx.clone(),
        }
    }

    /// Shared scheduler state, for read-only snapshotting (progress).
    pub fn shared(&self) -> Arc<Mutex<Packetizer>> {
        Arc::clone(&self.shared)
    }

    /// Feedback hand-off queue consumed by the progress reporter.
    pub fn feedback(&self) -> Arc<FeedbackQueue> {
        Arc::clone(&self.feedback)
    }

    /// Injects a stop signal into the command stream.
    pub fn stop(&self, abort: bool) {
        let _ = self.tx.send(SchedulerCommand::Stop { abort });
    }

    /// Injects a worker-death signal into the command stream.
    pub fn mark_dead(&self, worker: WorkerId) {
        let _ = self.tx.send(SchedulerCommand::MarkDead { worker });
    }

    /// Ends the scheduling loop and returns the final run accounting.
    ///
    /// Outstanding [`SchedulerClient`] handles keep the loop alive; their
    /// requests are still served until the last one is dropped.
    pub fn finish(self) -> Result<RunSummary> {
        drop(self.tx);
        self.handle
            .join()
            .map_err(|_| ForemanError::Dispatch("scheduler thread panicked".to_string()))?;

        let summary = lock_unpoisoned(&self.shared).summary();
        Ok(summary)
    }
}

/// Cheap cloneable handle a worker transport uses to request packets.
#[derive(Clone)]
pub struct SchedulerClient {
    tx: Sender<SchedulerCommand>,
}

impl SchedulerClient {
    /// Requests the next packet for `worker`, folding in the report for its
    /// previous packet. Blocks only for the serialized in-memory decision.
    pub fn next_packet(
        &self,
        worker: WorkerId,
        report: Option<WorkerReport>,
    ) -> Result<PacketResponse> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(SchedulerCommand::NextPacket {
                worker,
                report,
                reply: reply_tx,
            })
            .map_err(|_| ForemanError::Dispatch("scheduler loop has stopped".to_string()))?;

        reply_rx
            .recv()
            .map_err(|_| ForemanError::Dispatch("scheduler dropped the request".to_string()))?
    }

    pub fn mark_dead(&self, worker: WorkerId) -> Result<()> {
        self.tx
            .send(SchedulerCommand::MarkDead { worker })
            .map_err(|_| ForemanError::Dispatch("scheduler loop has stopped".to_string()))
    }

    pub fn stop(&self, abort: bool) -> Result<()> {
        self.tx
            .send(SchedulerCommand::Stop { abort })
            .map_err(|_| ForemanError::Dispatch("scheduler loop has stopped".to_string()))
    }

    /// Posts a partial intermediate result for merge and forwarding on the
    /// progress cadence.
    pub fn post_feedback(&self, object: Box<dyn Feedback>) -> Result<()> {
        self.tx
            .send(SchedulerCommand::PostFeedback(object))
            .map_err(|_| ForemanError::Dispatch("scheduler loop has stopped".to_string()))
    }
}

fn run_scheduler_loop(
    rx: Receiver<SchedulerCommand>,
    shared: Arc<Mutex<Packetizer>>,
    feedback: Arc<FeedbackQueue>,
) {
    while let Ok(command) = rx.recv() {
        match command {
            SchedulerCommand::NextPacket {
                worker,
                report,
                reply,
            } => {
                let result = lock_unpoisoned(&shared).next_packet(&worker, report);
                // The requester may have gone away; that is its problem.
                let _ = reply.send(result);
            }
            SchedulerCommand::MarkDead { worker } => {
                lock_unpoisoned(&shared).mark_dead(&worker);
            }
            SchedulerCommand::Stop { abort } => {
                lock_unpoisoned(&shared).stop(abort);
            }
            SchedulerCommand::PostFeedback(object) => {
                feedback.post(object);
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
