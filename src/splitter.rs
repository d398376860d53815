//! Fixed-window splitter that never cuts a record in half.
//!
//! Each window is read from the current offset, cut at its last line
//! terminator, and the next window starts right after that terminator. The
//! first window also carries the header line, which resolves the column
//! filter before any chunk is written.

use crate::header::{decode_header, resolve_filter, tokenize_header, FilterSpec, SIRENE_FIELDS};
use crate::{IngestError, IngestResult};
use bytes::{Buf, BytesMut};
use crc32fast::Hasher as Crc32;
use memchr::{memchr, memchr_iter, memrchr};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Splitter configuration.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Bytes requested per window (default: 10 MiB).
    pub window_size: usize,
    /// Directory receiving chunk files; created if missing.
    pub out_dir: PathBuf,
    /// Chunk files are named `<prefix>-<id>.csv`.
    pub chunk_prefix: String,
    pub delimiter: u8,
    pub terminator: u8,
    /// Character set of the header line.
    pub charset: &'static encoding_rs::Encoding,
    /// Field names resolved into the `FilterSpec`, in wire order.
    pub required_fields: Vec<String>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            window_size: 10 * 1024 * 1024,
            out_dir: PathBuf::from("./data/generated"),
            chunk_prefix: "CSV".to_string(),
            delimiter: b',',
            terminator: b'\n',
            charset: encoding_rs::UTF_8,
            required_fields: SIRENE_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SplitConfig {
    pub fn window_size(mut self, bytes: usize) -> Self {
        self.window_size = bytes;
        self
    }

    pub fn out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = dir.into();
        self
    }

    pub fn required_fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.required_fields = fields.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Reject settings no split can make progress with.
    pub fn validate(&self) -> IngestResult<()> {
        if self.window_size == 0 {
            return Err(IngestError::Config("window size must be positive".into()));
        }
        if self.required_fields.is_empty() {
            return Err(IngestError::Config(
                "at least one required field is needed".into(),
            ));
        }
        if self.delimiter == self.terminator {
            return Err(IngestError::Config(
                "delimiter and line terminator must differ".into(),
            ));
        }
        Ok(())
    }

    /// Path of the chunk file with the given id.
    pub fn chunk_path(&self, id: u64) -> PathBuf {
        self.out_dir.join(format!("{}-{}.csv", self.chunk_prefix, id))
    }
}

/// A chunk file that has been written and synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFile {
    pub id: u64,
    pub path: PathBuf,
    pub bytes: u64,
    pub lines: u64,
    pub crc32: u32,
}

/// Totals for one splitter run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitSummary {
    pub chunks: u64,
    pub lines: u64,
    pub bytes: u64,
}

/// Where a window gets cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    /// Header line bytes, first window only (terminator excluded).
    pub header: Option<Range<usize>>,
    /// Bytes written to the chunk: data start up to the last terminator (excluded).
    pub data: Range<usize>,
    /// Bytes to advance the read offset by (through the last terminator).
    pub consumed: usize,
}

/// Plan the cut of one window. `offset` is only used for error reporting.
pub fn plan_window(
    window: &[u8],
    with_header: bool,
    terminator: u8,
    offset: u64,
) -> IngestResult<WindowPlan> {
    let last = memrchr(terminator, window).ok_or(IngestError::NotLineDelimited {
        offset,
        len: window.len(),
    })?;

    let (header, start) = if with_header {
        // a terminator exists, so the forward scan finds one at or before `last`
        let first = memchr(terminator, window).unwrap_or(last);
        (Some(0..first), first + 1)
    } else {
        (None, 0)
    };

    Ok(WindowPlan {
        header,
        data: start.min(last)..last,
        consumed: last + 1,
    })
}

/// Receives the outputs of a splitter run, in order.
#[allow(async_fn_in_trait)]
pub trait ChunkSink {
    /// Called once, before the first chunk.
    async fn filter_resolved(&mut self, filter: FilterSpec) -> IngestResult<()>;

    /// Called after each chunk file is durable.
    async fn chunk_written(&mut self, chunk: ChunkFile) -> IngestResult<()>;
}

/// Sink that just records what the splitter produced.
#[derive(Debug, Default)]
pub struct ChunkLog {
    pub filter: Option<FilterSpec>,
    pub chunks: Vec<ChunkFile>,
}

impl ChunkSink for ChunkLog {
    async fn filter_resolved(&mut self, filter: FilterSpec) -> IngestResult<()> {
        if self.filter.is_some() {
            return Err(IngestError::FilterAlreadyResolved);
        }
        self.filter = Some(filter);
        Ok(())
    }

    async fn chunk_written(&mut self, chunk: ChunkFile) -> IngestResult<()> {
        self.chunks.push(chunk);
        Ok(())
    }
}

pub struct ChunkSplitter {
    config: SplitConfig,
}

impl ChunkSplitter {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Split `reader` into chunk files, reporting the filter and every chunk to `sink`.
    pub async fn run<R, S>(&self, mut reader: R, sink: &mut S) -> IngestResult<SplitSummary>
    where
        R: AsyncRead + Unpin,
        S: ChunkSink,
    {
        self.config.validate()?;
        let window_size = self.config.window_size;
        self.prepare_out_dir().await?;

        let mut buf = BytesMut::with_capacity(window_size);
        let mut offset = 0u64;
        let mut filter_resolved = false;
        let mut summary = SplitSummary::default();

        loop {
            // Carry-over from the previous window stays at the front of `buf`.
            while buf.len() < window_size {
                let want = (window_size - buf.len()) as u64;
                let n = (&mut reader).take(want).read_buf(&mut buf).await?;
                if n == 0 {
                    break;
                }
            }
            if buf.is_empty() {
                break;
            }

            let plan = plan_window(&buf, !filter_resolved, self.config.terminator, offset)?;
            if let Some(header) = plan.header.clone() {
                let filter = self.resolve_header(&buf[header]).await?;
                sink.filter_resolved(filter).await?;
                filter_resolved = true;
            }

            if let Some(chunk) = self
                .write_chunk(summary.chunks, &buf[plan.data.clone()])
                .await?
            {
                summary.chunks += 1;
                summary.lines += chunk.lines;
                summary.bytes += chunk.bytes;
                sink.chunk_written(chunk).await?;
            }

            offset += plan.consumed as u64;
            buf.advance(plan.consumed);
        }

        info!(
            chunks = summary.chunks,
            lines = summary.lines,
            bytes = summary.bytes,
            "Finished splitting source"
        );
        Ok(summary)
    }

    pub(crate) async fn prepare_out_dir(&self) -> IngestResult<()> {
        tokio::fs::create_dir_all(&self.config.out_dir).await?;
        Ok(())
    }

    /// Decode, tokenize and resolve the header line.
    pub(crate) async fn resolve_header(&self, raw: &[u8]) -> IngestResult<FilterSpec> {
        let text = decode_header(raw, self.config.charset);
        let rows = tokenize_header(&text, self.config.delimiter).await?;
        let filter = resolve_filter(&rows, &self.config.required_fields)?;
        info!(filter = ?filter.positions(), "Resolved column filter from header");
        Ok(filter)
    }

    /// Write one chunk and sync it. Empty slices produce no file.
    pub(crate) async fn write_chunk(&self, id: u64, data: &[u8]) -> IngestResult<Option<ChunkFile>> {
        if data.is_empty() {
            return Ok(None);
        }
        let path = self.config.chunk_path(id);
        write_synced(&path, data).await?;

        let mut crc = Crc32::new();
        crc.update(data);
        let chunk = ChunkFile {
            id,
            path,
            bytes: data.len() as u64,
            lines: memchr_iter(self.config.terminator, data).count() as u64 + 1,
            crc32: crc.finalize(),
        };
        debug!(chunk = chunk.id, path = %chunk.path.display(), bytes = chunk.bytes, "Wrote chunk");
        Ok(Some(chunk))
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await
}
