use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use sirene_ingest::config::{check_window_size, parse_charset, parse_size};
use sirene_ingest::{source_from_path, ChunkLog, ChunkSplitter, SplitConfig, SplitSummary};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sirene_ingest=info".parse()?),
        )
        .init();

    let matches = Command::new("split")
        .about("Split an extract into record-aligned chunk files without dispatching them")
        .arg(Arg::new("path").long("path").value_parser(clap::value_parser!(PathBuf)).required(true))
        .arg(Arg::new("out-dir").long("out-dir").value_parser(clap::value_parser!(PathBuf)).default_value("./data/generated"))
        .arg(Arg::new("window").long("window").help("Window size, e.g. 10M or 65536").value_parser(parse_size).default_value("10M"))
        .arg(Arg::new("required").long("required").help("Required header field (repeatable; defaults to the SIRENE list)").action(ArgAction::Append))
        .arg(Arg::new("delim").long("delim").default_value(","))
        .arg(Arg::new("charset").long("charset").help("Header character set").value_parser(parse_charset).default_value("utf-8"))
        .arg(Arg::new("verify").long("verify").help("Print the combined CRC32 of all chunks").action(ArgAction::SetTrue))
        .arg(Arg::new("fast-local").long("fast-local").help("Split through a memory map (local uncompressed files; feature: fast_local)").action(ArgAction::SetTrue))
        .get_matches();

    let path = matches.get_one::<PathBuf>("path").unwrap().clone();
    let delim = matches.get_one::<String>("delim").unwrap();
    let mut config = SplitConfig::default()
        .window_size(*matches.get_one::<usize>("window").unwrap())
        .out_dir(matches.get_one::<PathBuf>("out-dir").unwrap().clone());
    config.delimiter = *delim
        .as_bytes()
        .first()
        .context("--delim must not be empty")?;
    config.charset = *matches.get_one("charset").unwrap();
    if let Some(required) = matches.get_many::<String>("required") {
        config.required_fields = required.cloned().collect();
    }
    check_window_size(config.window_size).context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;

    let splitter = ChunkSplitter::new(config);
    let mut log = ChunkLog::default();
    let start = Instant::now();

    #[cfg(feature = "fast_local")]
    if matches.get_flag("fast-local") && path.extension().and_then(|s| s.to_str()) == Some("csv") {
        // Mapped path, then exit early
        let summary = sirene_ingest::split_mapped(&path, &splitter, &mut log).await?;
        report(&path, summary, &log, start, matches.get_flag("verify"));
        return Ok(());
    }

    let (reader, _meta) = source_from_path(&path).await?;
    let summary = splitter.run(reader, &mut log).await?;
    report(&path, summary, &log, start, matches.get_flag("verify"));
    Ok(())
}

fn report(path: &Path, summary: SplitSummary, log: &ChunkLog, start: Instant, verify: bool) {
    let elapsed = start.elapsed().as_secs_f64();
    let rps = (summary.lines as f64) / elapsed;
    let filter = log
        .filter
        .as_ref()
        .map(|f| f.positions().to_vec())
        .unwrap_or_default();
    println!(
        "source={} chunks={} lines={} filter={:?}\nelapsed={:.1}s lines/sec={:.0}",
        path.display(),
        summary.chunks,
        summary.lines,
        filter,
        elapsed,
        rps
    );

    if verify {
        // XOR of per-chunk CRCs
        let crc = log.chunks.iter().fold(0u32, |acc, c| acc ^ c.crc32);
        println!("crc=0x{crc:08x}");
    }
}
