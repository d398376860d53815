//! Free-worker pool and pending-chunk queue.
//!
//! The dispatcher is a plain state machine: every operation mutates the pool
//! or the queue and then runs one assignment pass, returning the pairings the
//! caller must deliver. It never talks to a transport itself, so exactly one
//! owner (the coordinator) serializes all state changes.

use crate::header::FilterSpec;
use crate::{IngestError, IngestResult};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Opaque identity of one worker (a process id for spawned workers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One chunk paired with one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker: WorkerId,
    pub file: PathBuf,
    pub filter: FilterSpec,
}

/// Outcome of a worker reporting a finished chunk.
#[derive(Debug, Default)]
pub struct Finished {
    /// Time since assignment; `None` if the chunk was not in flight.
    pub latency: Option<Duration>,
    pub assignments: Vec<Assignment>,
    /// Every worker idle, queue empty, and at least one chunk assigned so far.
    pub drained: bool,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    filter: FilterSpec,
    free: Vec<WorkerId>,
    busy: HashMap<WorkerId, PathBuf>,
    pending: VecDeque<PathBuf>,
    in_progress: HashMap<PathBuf, Instant>,
    assigned_total: u64,
    finished_total: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all pool, queue and in-flight state, including the filter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Install the column filter. It can be set once per run.
    pub fn set_filter(&mut self, filter: FilterSpec) -> IngestResult<Vec<Assignment>> {
        if !self.filter.is_empty() {
            return Err(IngestError::FilterAlreadyResolved);
        }
        self.filter = filter;
        Ok(self.assign())
    }

    pub fn enqueue(&mut self, file: PathBuf) -> Vec<Assignment> {
        self.pending.push_back(file);
        self.assign()
    }

    /// A worker came up, or announced it is idle again.
    pub fn on_worker_ready(&mut self, worker: WorkerId) -> Vec<Assignment> {
        if let Some(abandoned) = self.busy.remove(&worker) {
            // No retry: the chunk stays unloaded.
            self.in_progress.remove(&abandoned);
            warn!(%worker, file = %abandoned.display(), "Worker reported ready while busy; chunk abandoned");
        }
        self.release(worker);
        self.assign()
    }

    pub fn on_worker_finished(&mut self, worker: WorkerId, file: &Path) -> Finished {
        let Some(expected) = self.busy.remove(&worker) else {
            if self.free.contains(&worker) {
                debug!(%worker, file = %file.display(), "Idle worker reported a finished chunk");
            } else {
                warn!(%worker, file = %file.display(), "Finished from a worker that never reported ready; ignored");
            }
            return Finished::default();
        };
        self.finished_total += 1;

        let latency = if expected == file {
            self.in_progress.remove(file).map(|start| start.elapsed())
        } else {
            self.in_progress.remove(&expected);
            warn!(%worker, expected = %expected.display(), got = %file.display(), "Worker finished a different chunk than assigned");
            None
        };
        self.release(worker);

        let assignments = self.assign();
        Finished {
            latency,
            assignments,
            drained: self.is_drained() && self.assigned_total > 0,
        }
    }

    /// In-flight chunks assigned longer than `threshold` ago.
    pub fn stalled(&self, threshold: Duration) -> Vec<(WorkerId, PathBuf, Duration)> {
        let now = Instant::now();
        let mut stalled: Vec<_> = self
            .busy
            .iter()
            .filter_map(|(worker, file)| {
                let age = now.duration_since(*self.in_progress.get(file)?);
                (age >= threshold).then(|| (*worker, file.clone(), age))
            })
            .collect();
        stalled.sort_by_key(|(worker, _, _)| *worker);
        stalled
    }

    /// Pair `min(pending, free)` queued chunks with free workers.
    fn assign(&mut self) -> Vec<Assignment> {
        if self.pending.is_empty() || self.free.is_empty() || self.filter.is_empty() {
            return Vec::new();
        }

        let k = self.pending.len().min(self.free.len());
        let files: Vec<PathBuf> = self.pending.drain(..k).collect();
        let workers: Vec<WorkerId> = self.free.drain(..k).collect();

        let now = Instant::now();
        let assignments: Vec<Assignment> = workers
            .into_iter()
            .zip(files)
            .map(|(worker, file)| {
                self.in_progress.insert(file.clone(), now);
                self.busy.insert(worker, file.clone());
                Assignment {
                    worker,
                    file,
                    filter: self.filter.clone(),
                }
            })
            .collect();
        self.assigned_total += assignments.len() as u64;

        debug!(
            assigned = assignments.len(),
            pending = self.pending.len(),
            free = self.free.len(),
            "Assignment pass"
        );
        assignments
    }

    fn release(&mut self, worker: WorkerId) {
        if self.free.contains(&worker) {
            debug!(%worker, "Worker already free");
            return;
        }
        self.free.push(worker);
    }

    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn is_busy(&self, worker: WorkerId) -> bool {
        self.busy.contains_key(&worker)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn worker_count(&self) -> usize {
        self.free.len() + self.busy.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    pub fn assigned_total(&self) -> u64 {
        self.assigned_total
    }

    pub fn finished_total(&self) -> u64 {
        self.finished_total
    }

    /// No queued chunks and no worker busy.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.busy.is_empty()
    }
}
