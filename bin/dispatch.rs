//! Long-lived ingest process: start the worker pool, split the extract, and
//! keep dispatching chunks until interrupted.

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use sirene_ingest::config::{parse_charset, parse_size, IngestConfig};
use sirene_ingest::transport::ProcessTransport;
use sirene_ingest::{
    source_from_path, ChunkSplitter, Coordinator, DispatchHandle, IngestError, IngestResult,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit status when the worker transport cannot be brought up.
const EXIT_TRANSPORT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sirene_ingest=info".parse().expect("static directive")),
        )
        .init();

    let config = match config_from_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_transport_setup() => {
            error!("{e}");
            ExitCode::from(EXIT_TRANSPORT)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn config_from_args() -> anyhow::Result<IngestConfig> {
    let matches = Command::new("dispatch")
        .about("Split a registry extract into chunks and feed them to a pool of worker processes")
        .arg(Arg::new("path").long("path").value_parser(clap::value_parser!(PathBuf)).default_value("./StockEtablissement.csv"))
        .arg(Arg::new("out-dir").long("out-dir").value_parser(clap::value_parser!(PathBuf)).default_value("./data/generated"))
        .arg(Arg::new("window").long("window").help("Window size, e.g. 10M or 65536").value_parser(parse_size).default_value("10M"))
        .arg(Arg::new("required").long("required").help("Required header field (repeatable; defaults to the SIRENE list)").action(ArgAction::Append))
        .arg(Arg::new("delim").long("delim").default_value(","))
        .arg(Arg::new("charset").long("charset").value_parser(parse_charset).default_value("utf-8"))
        .arg(Arg::new("workers").long("workers").short('w').help("Worker processes (default: one per CPU)").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("stall-after").long("stall-after").help("Warn about chunks in progress for longer than N seconds").value_parser(clap::value_parser!(u64)))
        .arg(Arg::new("exit-when-drained").long("exit-when-drained").help("Exit once every chunk is loaded").action(ArgAction::SetTrue))
        .arg(Arg::new("worker").help("Worker command and arguments").num_args(1..).last(true).required(true))
        .get_matches();

    let mut config = IngestConfig {
        source: matches.get_one::<PathBuf>("path").unwrap().clone(),
        worker_cmd: matches.get_many::<String>("worker").unwrap().cloned().collect(),
        stall_after: matches.get_one::<u64>("stall-after").map(|s| Duration::from_secs(*s)),
        exit_when_drained: matches.get_flag("exit-when-drained"),
        ..Default::default()
    };
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.workers = *workers;
    }
    config.split = config
        .split
        .window_size(*matches.get_one::<usize>("window").unwrap())
        .out_dir(matches.get_one::<PathBuf>("out-dir").unwrap().clone());
    config.split.delimiter = *matches
        .get_one::<String>("delim")
        .unwrap()
        .as_bytes()
        .first()
        .context("--delim must not be empty")?;
    config.split.charset = *matches.get_one("charset").unwrap();
    if let Some(required) = matches.get_many::<String>("required") {
        config.split.required_fields = required.cloned().collect();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(config: IngestConfig) -> IngestResult<()> {
    let (program, args) = config
        .worker_program()
        .ok_or_else(|| IngestError::Config("no worker command given".into()))?;

    let (tx, rx) = mpsc::channel(config.inbox_capacity);
    let transport = ProcessTransport::spawn(program, args, config.workers, tx.clone())?;
    let coordinator = Coordinator::new(transport, rx)
        .stall_after(config.stall_after)
        .exit_when_drained(config.exit_when_drained);

    let splitter = ChunkSplitter::new(config.split.clone());
    let mut handle = DispatchHandle::new(tx);
    let split = async {
        let (reader, _meta) = source_from_path(&config.source).await?;
        let summary = splitter.run(reader, &mut handle).await?;
        handle.split_finished(summary).await?;
        // Inbox stays open through the worker pipes only.
        drop(handle);
        Ok::<_, IngestError>(())
    };

    tokio::select! {
        res = async { tokio::try_join!(split, coordinator.run()) } => {
            let ((), report) = res?;
            info!(assigned = report.assigned, finished = report.finished, "Dispatcher stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }
    Ok(())
}
