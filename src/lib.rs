//! Record-aligned splitting of a registry extract plus a worker-pool dispatcher.
//!
//! - Splitter: fixed-size windows cut at the last line terminator, header resolved once.
//! - Dispatcher: free pool + FIFO queue, `min(pending, free)` assignments per pass.
//! - Coordinator: single-consumer actor serializing every state change.
//!
//! Data shape:
//! - `FilterSpec` (column positions, required-list order)
//! - `ChunkFile { id, path, bytes, lines, crc32 }` per written chunk
//! - `Assignment { worker, file, filter }` per dispatched chunk
#![cfg_attr(docsrs, feature(doc_cfg))]
//
pub mod config;
mod coordinator;
mod dispatch;
#[cfg(feature = "fast_local")]
mod fast;
mod header;
mod io;
mod splitter;
pub mod transport;

pub use crate::coordinator::{Coordinator, DispatchHandle, Event, RunReport};
pub use crate::dispatch::{Assignment, Dispatcher, Finished, WorkerId};
#[cfg(feature = "fast_local")]
pub use crate::fast::split_mapped;
pub use crate::header::{decode_header, resolve_filter, tokenize_header, FilterSpec, SIRENE_FIELDS};
pub use crate::io::{build_source_reader, source_from_path, SourceMeta};
pub use crate::splitter::{
    plan_window, ChunkFile, ChunkLog, ChunkSink, ChunkSplitter, SplitConfig, SplitSummary,
    WindowPlan,
};

use std::path::PathBuf;
use thiserror::Error;

use crate::transport::TransportError;

/// Error type returned by this crate when not using `anyhow`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Missing required header field: {0}")]
    MissingField(String),
    #[error("Malformed header: expected exactly one row, tokenizer returned {rows}")]
    MalformedHeader { rows: usize },
    #[error("Chunk too small or not line-delimited: no terminator in {len} bytes at offset {offset}")]
    NotLineDelimited { offset: u64, len: usize },
    #[error("Column filter already resolved for this run")]
    FilterAlreadyResolved,
    #[error("Source file doesn't exist: {}", .0.display())]
    SourceMissing(PathBuf),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Dispatcher inbox closed")]
    DispatcherClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
}

impl IngestError {
    /// True when the worker transport could not be brought up at all.
    pub fn is_transport_setup(&self) -> bool {
        matches!(self, IngestError::Transport(TransportError::Spawn { .. }))
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
