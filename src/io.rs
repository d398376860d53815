use crate::{IngestError, IngestResult};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};

#[derive(Debug, Clone, Default)]
pub struct SourceMeta {
    /// e.g. "gzip", "zstd", or empty for a plain extract
    pub content_encoding: String,
    /// just the file name (used for extension fallback)
    pub name_hint: String,
}

impl SourceMeta {
    pub fn is_gzip(&self) -> bool {
        self.content_encoding.eq_ignore_ascii_case("gzip") || self.name_hint.ends_with(".gz")
    }

    pub fn is_zstd(&self) -> bool {
        self.content_encoding.eq_ignore_ascii_case("zstd") || self.name_hint.ends_with(".zst")
    }
}

/// Wrap a raw reader with decompression chosen from `meta`.
/// The splitter windows over whatever bytes come out of this reader.
pub fn build_source_reader<R>(raw: R, meta: &SourceMeta) -> Box<dyn AsyncRead + Unpin + Send>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Use a larger buffer for fewer syscalls (1 MiB)
    let buf = BufReader::with_capacity(1 << 20, raw);
    if meta.is_gzip() {
        Box::new(GzipDecoder::new(buf))
    } else if meta.is_zstd() {
        Box::new(ZstdDecoder::new(buf))
    } else {
        Box::new(buf)
    }
}

/// Open a local extract, picking decompression from its extension.
pub async fn source_from_path(
    path: &Path,
) -> IngestResult<(Box<dyn AsyncRead + Unpin + Send>, SourceMeta)> {
    if !tokio::fs::try_exists(path).await? {
        return Err(IngestError::SourceMissing(path.to_path_buf()));
    }
    let file = File::open(path).await?;
    let name_hint = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let content_encoding = match path.extension().and_then(|s| s.to_str()) {
        Some("gz") => "gzip",
        Some("zst") => "zstd",
        _ => "",
    };
    let meta = SourceMeta {
        content_encoding: content_encoding.into(),
        name_hint,
    };

    Ok((build_source_reader(file, &meta), meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_from_hint_or_encoding() {
        let meta = SourceMeta {
            name_hint: "StockEtablissement.csv.gz".into(),
            ..Default::default()
        };
        assert!(meta.is_gzip());
        assert!(!meta.is_zstd());

        let meta = SourceMeta {
            content_encoding: "ZSTD".into(),
            name_hint: "extract".into(),
        };
        assert!(meta.is_zstd());

        assert!(!SourceMeta::default().is_gzip());
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = source_from_path(&dir.path().join("absent.csv"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::SourceMissing(_)));
    }
}
