//! Worker transports: how assignments reach workers and status comes back.
//!
//! Wire format, one JSON object per line:
//! - out: `{"type":"process:msg","topic":"SIRENE-INVADER","data":{"FILE":..,"FILTER":[..]}}`
//! - in: `{"READY":true}` or `{"FILE":".."}` (an optional `"PID"` is ignored)

use crate::coordinator::Event;
use crate::dispatch::{Assignment, WorkerId};
use crate::header::FilterSpec;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

/// Message type and topic every assignment is tagged with.
pub const MESSAGE_TYPE: &str = "process:msg";
pub const ASSIGNMENT_TOPIC: &str = "SIRENE-INVADER";

#[derive(Debug, Error)]
pub enum TransportError {
    /// Worker process could not be started
    #[error("Failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("Worker {0} is no longer accepting assignments")]
    Closed(WorkerId),

    #[error("Worker pipe error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("Malformed worker message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Status reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Finished(PathBuf),
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(rename = "READY", default)]
    ready: bool,
    #[serde(rename = "FILE")]
    file: Option<PathBuf>,
    #[serde(rename = "PID")]
    _pid: Option<u32>,
}

/// Parse one status line.
pub fn parse_status(line: &str) -> Result<WorkerStatus, TransportError> {
    let raw: RawStatus = serde_json::from_str(line)?;
    match (raw.ready, raw.file) {
        (true, _) => Ok(WorkerStatus::Ready),
        (false, Some(file)) => Ok(WorkerStatus::Finished(file)),
        (false, None) => Err(TransportError::Json(<serde_json::Error as serde::de::Error>::custom(
            "expected READY or FILE",
        ))),
    }
}

#[derive(Debug, Serialize)]
struct AssignmentData<'a> {
    #[serde(rename = "FILE")]
    file: &'a Path,
    #[serde(rename = "FILTER")]
    filter: &'a FilterSpec,
}

#[derive(Debug, Serialize)]
struct AssignmentMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    topic: &'static str,
    data: AssignmentData<'a>,
}

/// Encode an assignment as one wire line (no trailing newline).
pub fn encode_assignment(assignment: &Assignment) -> Result<String, TransportError> {
    let msg = AssignmentMessage {
        kind: MESSAGE_TYPE,
        topic: ASSIGNMENT_TOPIC,
        data: AssignmentData {
            file: &assignment.file,
            filter: &assignment.filter,
        },
    };
    Ok(serde_json::to_string(&msg)?)
}

/// Delivers assignments to individual workers.
#[allow(async_fn_in_trait)]
pub trait WorkerChannel {
    async fn send(&mut self, assignment: &Assignment) -> Result<(), TransportError>;
}

/// In-process workers fed through tokio channels.
#[derive(Debug, Default)]
pub struct LocalTransport {
    workers: HashMap<WorkerId, mpsc::Sender<Assignment>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker and get the receiving end of its assignment inbox.
    pub fn register(&mut self, worker: WorkerId, capacity: usize) -> mpsc::Receiver<Assignment> {
        let (tx, rx) = mpsc::channel(capacity);
        self.workers.insert(worker, tx);
        rx
    }
}

impl WorkerChannel for LocalTransport {
    async fn send(&mut self, assignment: &Assignment) -> Result<(), TransportError> {
        let worker = assignment.worker;
        self.workers
            .get(&worker)
            .ok_or(TransportError::UnknownWorker(worker))?
            .send(assignment.clone())
            .await
            .map_err(|_| TransportError::Closed(worker))
    }
}

/// Worker processes spoken to over their stdin/stdout.
pub struct ProcessTransport {
    stdins: HashMap<WorkerId, FramedWrite<ChildStdin, LinesCodec>>,
    children: Vec<Child>,
}

impl ProcessTransport {
    /// Spawn `count` copies of `program`. Status lines from each worker are
    /// forwarded to `inbox` tagged with that worker's id (its pid).
    pub fn spawn(
        program: &str,
        args: &[String],
        count: usize,
        inbox: mpsc::Sender<Event>,
    ) -> Result<Self, TransportError> {
        let mut stdins = HashMap::with_capacity(count);
        let mut children = Vec::with_capacity(count);

        for _ in 0..count {
            let spawn_err = |source: std::io::Error| TransportError::Spawn {
                program: program.to_string(),
                source,
            };
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(spawn_err)?;

            let missing = |what: &str| {
                spawn_err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    format!("worker has no {what}"),
                ))
            };
            // Pids of live children are distinct; an exited child has none.
            let worker = WorkerId(child.id().ok_or_else(|| missing("process id"))?);
            let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
            let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

            tokio::spawn(forward_status(worker, stdout, inbox.clone()));
            stdins.insert(worker, FramedWrite::new(stdin, LinesCodec::new()));
            children.push(child);
            debug!(%worker, "Spawned worker");
        }

        info!(workers = count, program, "Worker pool started");
        Ok(Self { stdins, children })
    }

    pub fn worker_count(&self) -> usize {
        self.children.len()
    }
}

impl WorkerChannel for ProcessTransport {
    async fn send(&mut self, assignment: &Assignment) -> Result<(), TransportError> {
        let line = encode_assignment(assignment)?;
        let stdin = self
            .stdins
            .get_mut(&assignment.worker)
            .ok_or(TransportError::UnknownWorker(assignment.worker))?;
        stdin.send(line).await?;
        Ok(())
    }
}

async fn forward_status(worker: WorkerId, stdout: ChildStdout, inbox: mpsc::Sender<Event>) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(%worker, error = %e, "Worker stdout unreadable");
                break;
            }
        };
        match parse_status(&line) {
            Ok(status) => {
                if inbox.send(Event::Worker(worker, status)).await.is_err() {
                    break;
                }
            }
            // Workers may log to stdout; only protocol lines matter.
            Err(_) => debug!(%worker, %line, "Ignoring non-protocol line"),
        }
    }
    debug!(%worker, "Worker stdout closed");
}
