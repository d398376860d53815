//! Run configuration for the ingest process.
//!
//! Binaries build an [`IngestConfig`] from their command line and call
//! [`IngestConfig::validate`] before anything touches the filesystem.

use crate::splitter::SplitConfig;
use crate::{IngestError, IngestResult};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on the worker pool size.
const MAX_WORKERS: usize = 1024;

/// Smallest accepted window; anything below cannot hold a real registry line.
pub const MIN_WINDOW_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Extract to split (plain, `.gz` or `.zst`).
    pub source: PathBuf,
    pub split: SplitConfig,
    /// Number of worker processes (default: one per CPU).
    pub workers: usize,
    /// Worker program and its arguments.
    pub worker_cmd: Vec<String>,
    /// Capacity of the coordinator inbox.
    pub inbox_capacity: usize,
    /// Log chunks in flight for longer than this.
    pub stall_after: Option<Duration>,
    /// Exit once the split is done and every worker is idle.
    pub exit_when_drained: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("./StockEtablissement.csv"),
            split: SplitConfig::default(),
            workers: num_cpus::get().max(1),
            worker_cmd: Vec::new(),
            inbox_capacity: 1024,
            stall_after: None,
            exit_when_drained: false,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> IngestResult<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(IngestError::Config(format!(
                "worker count {} must be between 1 and {MAX_WORKERS}",
                self.workers
            )));
        }
        check_window_size(self.split.window_size)?;
        self.split.validate()?;
        if self.inbox_capacity == 0 {
            return Err(IngestError::Config("inbox capacity must be positive".into()));
        }
        Ok(())
    }

    /// Program and arguments of the worker command, if one is set.
    pub fn worker_program(&self) -> Option<(&str, &[String])> {
        let (program, args) = self.worker_cmd.split_first()?;
        Some((program.as_str(), args))
    }
}

/// Window sizes below [`MIN_WINDOW_SIZE`] are refused up front.
pub fn check_window_size(bytes: usize) -> IngestResult<()> {
    if bytes < MIN_WINDOW_SIZE {
        return Err(IngestError::Config(format!(
            "window size {bytes} is below the minimum of {MIN_WINDOW_SIZE} bytes"
        )));
    }
    Ok(())
}

/// Parse a byte size such as `10M`, `512K` or `4096`.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    let mult = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        other => return Err(format!("unknown size unit '{other}'")),
    };
    n.checked_mul(mult)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

/// Resolve a charset label (`utf-8`, `latin1`, `windows-1252`, ...).
pub fn parse_charset(label: &str) -> Result<&'static encoding_rs::Encoding, String> {
    encoding_rs::Encoding::for_label(label.as_bytes())
        .ok_or_else(|| format!("unknown charset '{label}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = IngestConfig::default();
        config.validate().unwrap();
        assert_eq!(config.split.window_size, 10 * 1024 * 1024);
        assert_eq!(config.split.required_fields.len(), 12);
        assert!(config.workers >= 1);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = IngestConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));

        config.workers = 2;
        config.split.window_size = 8;
        assert!(config.validate().is_err());

        config.split.window_size = 0;
        assert!(config.validate().is_err());

        config.split.window_size = 1 << 20;
        config.split.delimiter = b'\n';
        assert!(config.validate().is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("10M"), Ok(10 * 1024 * 1024));
        assert_eq!(parse_size("512kb"), Ok(512 * 1024));
        assert!(parse_size("ten").is_err());
        assert!(parse_size("3X").is_err());
    }

    #[test]
    fn charsets() {
        assert_eq!(parse_charset("utf-8").unwrap(), encoding_rs::UTF_8);
        assert_eq!(parse_charset("latin1").unwrap(), encoding_rs::WINDOWS_1252);
        assert!(parse_charset("klingon").is_err());
    }

    #[test]
    fn worker_program_splits_args() {
        let config = IngestConfig {
            worker_cmd: vec!["node".into(), "worker.js".into()],
            ..Default::default()
        };
        let (program, args) = config.worker_program().unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, ["worker.js".to_string()]);
        assert!(IngestConfig::default().worker_program().is_none());
    }
}
