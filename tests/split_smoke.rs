use async_compression::tokio::write::GzipEncoder;
use sirene_ingest::{
    source_from_path, ChunkLog, ChunkSplitter, IngestError, SplitConfig, SIRENE_FIELDS,
};
use std::path::Path;
use tokio::io::AsyncWriteExt;

fn data_lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{i},name-{i}")).collect()
}

fn extract(header: &str, lines: &[String]) -> String {
    let mut out = format!("{header}\n");
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Every line of every chunk, in chunk-id order.
fn recovered_lines(log: &ChunkLog) -> anyhow::Result<Vec<String>> {
    let mut chunks = log.chunks.clone();
    chunks.sort_by_key(|c| c.id);
    let mut lines = Vec::new();
    for chunk in chunks {
        let text = std::fs::read_to_string(&chunk.path)?;
        lines.extend(text.split('\n').map(str::to_string));
    }
    Ok(lines)
}

async fn split_file(path: &Path, config: SplitConfig) -> sirene_ingest::IngestResult<ChunkLog> {
    let (reader, _meta) = source_from_path(path).await?;
    let mut log = ChunkLog::default();
    ChunkSplitter::new(config).run(reader, &mut log).await?;
    Ok(log)
}

#[tokio::test]
async fn tiny_window_recovers_every_line() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("tiny.csv");
    let lines = data_lines(5);
    std::fs::write(&src, extract("id,name", &lines))?;

    let config = SplitConfig::default()
        .window_size(64)
        .out_dir(dir.path().join("chunks"))
        .required_fields(&["id"]);
    let log = split_file(&src, config).await?;

    assert_eq!(log.filter.as_ref().map(|f| f.positions().to_vec()), Some(vec![0]));
    assert_eq!(recovered_lines(&log)?, lines);
    let ids: Vec<u64> = log.chunks.iter().map(|c| c.id).collect();
    assert_eq!(ids, (0..log.chunks.len() as u64).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn any_window_size_keeps_records_whole() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("extract.csv");
    let lines = data_lines(300);
    std::fs::write(&src, extract("id,name", &lines))?;

    for window in [32, 64, 100, 1000, 4096, 1 << 20] {
        let out = dir.path().join(format!("w{window}"));
        let config = SplitConfig::default()
            .window_size(window)
            .out_dir(&out)
            .required_fields(&["name", "id"]);
        let log = split_file(&src, config).await?;

        assert_eq!(log.filter.as_ref().unwrap().positions(), &[1, 0]);
        assert_eq!(recovered_lines(&log)?, lines, "window {window}");
        let total: u64 = log.chunks.iter().map(|c| c.lines).sum();
        assert_eq!(total, 300);
        for chunk in &log.chunks {
            assert!(chunk.bytes as usize <= window);
            let text = std::fs::read_to_string(&chunk.path)?;
            assert!(!text.contains("id,name"), "header leaked into {:?}", chunk.path);
        }
    }
    Ok(())
}

#[tokio::test]
async fn missing_field_writes_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("extract.csv");
    std::fs::write(&src, extract("id,name", &data_lines(50)))?;

    let out = dir.path().join("chunks");
    let config = SplitConfig::default()
        .window_size(128)
        .out_dir(&out)
        .required_fields(&["id", "siren"]);
    let err = split_file(&src, config).await.unwrap_err();

    assert!(matches!(err, IngestError::MissingField(ref f) if f == "siren"));
    assert_eq!(std::fs::read_dir(&out)?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn record_longer_than_window_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("wide.csv");
    let wide = vec![format!("1,{}", "x".repeat(200))];
    std::fs::write(&src, extract("id,name", &wide))?;

    let config = SplitConfig::default()
        .window_size(64)
        .out_dir(dir.path().join("chunks"))
        .required_fields(&["id"]);
    let err = split_file(&src, config).await.unwrap_err();
    assert!(matches!(err, IngestError::NotLineDelimited { offset: 8, len: 64 }));
    Ok(())
}

#[tokio::test]
async fn splits_gzip_extract_with_sirene_header() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let gz = dir.path().join("StockEtablissement.csv.gz");

    // BOM, extra columns, CRLF header: the resolver must still find every field
    let mut header = vec!["\u{feff}siren".to_string(), "statut".to_string()];
    header.extend(SIRENE_FIELDS[1..].iter().rev().map(|s| s.to_string()));
    let header = format!("{}\r", header.join(","));
    let lines: Vec<String> = (0..1_000)
        .map(|i| format!("{:09},{}", i, vec!["v"; 12].join(",")))
        .collect();

    let mut enc = GzipEncoder::new(tokio::fs::File::create(&gz).await?);
    enc.write_all(extract(&header, &lines).as_bytes()).await?;
    enc.shutdown().await?;

    let config = SplitConfig::default()
        .window_size(4096)
        .out_dir(dir.path().join("chunks"));
    let log = split_file(&gz, config).await?;

    // siren at 0, the rest reversed after the extra column
    let mut expected = vec![0];
    expected.extend((0..11).map(|i| 12 - i));
    assert_eq!(log.filter.as_ref().unwrap().positions(), expected.as_slice());
    assert_eq!(recovered_lines(&log)?, lines);
    Ok(())
}
