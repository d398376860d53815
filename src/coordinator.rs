//! Single-consumer actor owning the dispatcher.
//!
//! The splitter (through [`DispatchHandle`]) and the worker transports only
//! ever post [`Event`]s into one bounded inbox; the coordinator applies them
//! in arrival order and delivers the resulting assignments.

use crate::dispatch::{Assignment, Dispatcher, WorkerId};
use crate::header::FilterSpec;
use crate::splitter::{ChunkFile, ChunkSink, SplitSummary};
use crate::transport::{WorkerChannel, WorkerStatus};
use crate::{IngestError, IngestResult};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Everything that can change dispatcher state.
#[derive(Debug, Clone)]
pub enum Event {
    Filter(FilterSpec),
    Enqueue(ChunkFile),
    Worker(WorkerId, WorkerStatus),
    SplitFinished(SplitSummary),
}

/// Splitter-side handle posting into the coordinator inbox.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Event>,
}

impl DispatchHandle {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub async fn split_finished(&self, summary: SplitSummary) -> IngestResult<()> {
        self.post(Event::SplitFinished(summary)).await
    }

    async fn post(&self, event: Event) -> IngestResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| IngestError::DispatcherClosed)
    }
}

impl ChunkSink for DispatchHandle {
    async fn filter_resolved(&mut self, filter: FilterSpec) -> IngestResult<()> {
        self.post(Event::Filter(filter)).await
    }

    async fn chunk_written(&mut self, chunk: ChunkFile) -> IngestResult<()> {
        self.post(Event::Enqueue(chunk)).await
    }
}

/// Counters at the time the coordinator stopped.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunReport {
    pub assigned: u64,
    pub finished: u64,
    pub split: Option<SplitSummary>,
    /// Whether every assigned chunk was accounted for with all workers idle.
    pub drained: bool,
}

pub struct Coordinator<C> {
    dispatcher: Dispatcher,
    channel: C,
    inbox: mpsc::Receiver<Event>,
    stall_after: Option<Duration>,
    exit_when_drained: bool,
    split: Option<SplitSummary>,
    drained: bool,
    started: Instant,
}

impl<C: WorkerChannel> Coordinator<C> {
    pub fn new(channel: C, inbox: mpsc::Receiver<Event>) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            channel,
            inbox,
            stall_after: None,
            exit_when_drained: false,
            split: None,
            drained: false,
            started: Instant::now(),
        }
    }

    /// Periodically log chunks in flight for longer than `threshold`.
    pub fn stall_after(mut self, threshold: Option<Duration>) -> Self {
        self.stall_after = threshold;
        self
    }

    /// Stop once the splitter is done and every worker is idle.
    pub fn exit_when_drained(mut self, exit: bool) -> Self {
        self.exit_when_drained = exit;
        self
    }

    /// Apply events until the inbox closes (or the run drains, if enabled).
    pub async fn run(mut self) -> IngestResult<RunReport> {
        let period = self.stall_after.unwrap_or(Duration::from_secs(60));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.inbox.recv() => {
                    let Some(event) = event else {
                        debug!("Coordinator inbox closed");
                        break;
                    };
                    if self.handle(event).await? {
                        break;
                    }
                }
                _ = ticker.tick(), if self.stall_after.is_some() => self.report_stalled(period),
            }
        }

        Ok(RunReport {
            assigned: self.dispatcher.assigned_total(),
            finished: self.dispatcher.finished_total(),
            split: self.split,
            drained: self.drained,
        })
    }

    /// Returns true when the run should stop.
    async fn handle(&mut self, event: Event) -> IngestResult<bool> {
        match event {
            Event::Filter(filter) => {
                let assignments = self.dispatcher.set_filter(filter)?;
                self.deliver(assignments).await;
            }
            Event::Enqueue(chunk) => {
                debug!(chunk = chunk.id, path = %chunk.path.display(), "Queued chunk");
                let assignments = self.dispatcher.enqueue(chunk.path);
                self.deliver(assignments).await;
            }
            Event::Worker(worker, WorkerStatus::Ready) => {
                info!(%worker, "Worker ready");
                let was_busy = self.dispatcher.is_busy(worker);
                let assignments = self.dispatcher.on_worker_ready(worker);
                self.deliver(assignments).await;
                // An abandoned chunk can be the last one in flight.
                if was_busy && self.dispatcher.is_drained() {
                    self.all_loaded();
                }
            }
            Event::Worker(worker, WorkerStatus::Finished(file)) => {
                let done = self.dispatcher.on_worker_finished(worker, &file);
                if let Some(latency) = done.latency {
                    info!(
                        %worker,
                        file = %file.display(),
                        took_ms = latency.as_millis() as u64,
                        "Chunk loaded"
                    );
                }
                info!(
                    free = self.dispatcher.free_count(),
                    elapsed_mins = self.started.elapsed().as_secs_f64() / 60.0,
                    "Worker idle"
                );
                self.deliver(done.assignments).await;
                if done.drained {
                    self.all_loaded();
                }
            }
            Event::SplitFinished(summary) => {
                info!(chunks = summary.chunks, lines = summary.lines, "Splitter finished");
                self.split = Some(summary);
            }
        }

        Ok(self.exit_when_drained && self.split.is_some() && self.dispatcher.is_drained())
    }

    fn all_loaded(&mut self) {
        self.drained = true;
        info!(
            assigned = self.dispatcher.assigned_total(),
            finished = self.dispatcher.finished_total(),
            "All queued chunks loaded; every worker is idle"
        );
    }

    async fn deliver(&mut self, assignments: Vec<Assignment>) {
        for assignment in assignments {
            info!(
                worker = %assignment.worker,
                file = %assignment.file.display(),
                "Sending work"
            );
            if let Err(e) = self.channel.send(&assignment).await {
                // No retry: the chunk stays in progress for that worker.
                warn!(
                    worker = %assignment.worker,
                    file = %assignment.file.display(),
                    error = %e,
                    "Failed to send assignment"
                );
            }
        }
    }

    fn report_stalled(&self, threshold: Duration) {
        for (worker, file, age) in self.dispatcher.stalled(threshold) {
            warn!(
                %worker,
                file = %file.display(),
                age_secs = age.as_secs(),
                "Chunk still in progress"
            );
        }
    }
}
