use super::{send_row, strip_cr, Loader};
use crate::artifact::{DownloadedArtifactInfo, RowData};
use anyhow::Context;
use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use std::io::BufRead;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One row per line of a plain text file
#[derive(Debug, Clone)]
pub struct LineLoader {
    max_line_bytes: usize,
}

impl LineLoader {
    pub const IDENTIFIER: &'static str = "line";

    /// Maximum number of bytes allowed for one line, not counting the newline
    pub fn max_line_bytes(mut self, n: usize) -> Self {
        self.max_line_bytes = n.max(1);
        self
    }
}

impl Default for LineLoader {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[async_trait]
impl Loader for LineLoader {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        info: &DownloadedArtifactInfo,
        tx: Sender<RowData>,
    ) -> anyhow::Result<()> {
        let file = File::open(&info.local_path)
            .await
            .with_context(|| format!("Failed to open {}", info.local_path.display()))?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut lines = 0u64;

        loop {
            line.clear();
            let (n, fits) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                read = read_bounded_line(&mut reader, &mut line, self.max_line_bytes) => read
                    .with_context(|| format!("Failed to read {}", info.local_path.display()))?,
            };
            if n == 0 {
                break;
            }
            if !fits {
                anyhow::bail!(
                    "line {} of {} exceeded max_line_bytes ({})",
                    lines + 1,
                    info.name(),
                    self.max_line_bytes
                );
            }

            let text = strip_cr(line.strip_suffix(b"\n").unwrap_or(&line[..]));
            if text.is_empty() {
                continue;
            }
            lines += 1;
            let row = RowData::new(String::from_utf8_lossy(text).into_owned());
            if !send_row(&tx, cancel, row).await {
                break;
            }
        }

        debug!(artifact = info.name(), lines, "Loaded lines");
        Ok(())
    }
}

/// Read one line into `line`, buffering at most `max + 1` bytes of it.
///
/// Returns the bytes read and whether the line fit in `max` bytes.
async fn read_bounded_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader.take(max as u64 + 1).read_until(b'\n', line).await?;
    let fits = line.ends_with(b"\n") || line.len() <= max;
    Ok((n, fits))
}

/// One row per line of a gzip-compressed file.
///
/// Concatenated gzip members are decoded as one stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipLineLoader;

impl GzipLineLoader {
    pub const IDENTIFIER: &'static str = "gzip_line";
}

#[async_trait]
impl Loader for GzipLineLoader {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        info: &DownloadedArtifactInfo,
        tx: Sender<RowData>,
    ) -> anyhow::Result<()> {
        let path = info.local_path.clone();
        let name = info.name().to_string();
        let cancel = cancel.clone();

        // flate2 decodes synchronously, so run the whole read on the blocking pool
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let reader = std::io::BufReader::new(MultiGzDecoder::new(file));
            let mut lines = 0u64;

            for line in reader.split(b'\n') {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let line = line.with_context(|| format!("Failed to decompress {}", name))?;
                let text = strip_cr(&line);
                if text.is_empty() {
                    continue;
                }
                lines += 1;
                let row = RowData::new(String::from_utf8_lossy(text).into_owned());
                if tx.blocking_send(row).is_err() {
                    break;
                }
            }

            debug!(artifact = %name, lines, "Loaded gzip lines");
            Ok(())
        })
        .await
        .context("Gzip line loader task failed")?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactInfo;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tokio::sync::mpsc;

    async fn collect(loader: &dyn Loader, path: &std::path::Path) -> anyhow::Result<Vec<RowData>> {
        let info = DownloadedArtifactInfo::new(ArtifactInfo::new("test"), path, 0);
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let (result, rows) = tokio::join!(loader.load(&cancel, &info, tx), async {
            let mut rows = Vec::new();
            while let Some(row) = rx.recv().await {
                rows.push(row);
            }
            rows
        });
        result.map(|_| rows)
    }

    #[tokio::test]
    async fn test_line_loader_strips_cr_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "first\r\n\nsecond\nthird").unwrap();

        let rows = collect(&LineLoader::default(), &path).await.unwrap();
        let lines: Vec<_> = rows.iter().map(|r| r.data.as_str().unwrap()).collect();
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_line_loader_rejects_long_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "0123456789\n").unwrap();

        let err = collect(&LineLoader::default().max_line_bytes(4), &path)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max_line_bytes"));
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "0123\n4567").unwrap();

        let rows = collect(&LineLoader::default().max_line_bytes(4), &path).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_line_is_not_buffered_whole() {
        let mut input = vec![b'x'; 1024 * 1024];
        input.push(b'\n');
        let mut reader = BufReader::new(&input[..]);
        let mut line = Vec::new();

        let (n, fits) = read_bounded_line(&mut reader, &mut line, 8).await.unwrap();
        assert!(!fits);
        assert_eq!(n, 9);
        assert_eq!(line.len(), 9);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let err = collect(&LineLoader::default(), std::path::Path::new("/nonexistent/x.log"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to open"));
    }

    #[tokio::test]
    async fn test_gzip_line_loader_reads_concatenated_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log.gz");
        let mut bytes = Vec::new();
        for chunk in ["one\ntwo\n", "three\n"] {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(chunk.as_bytes()).unwrap();
            bytes.extend(enc.finish().unwrap());
        }
        std::fs::write(&path, bytes).unwrap();

        let rows = collect(&GzipLineLoader, &path).await.unwrap();
        let lines: Vec<_> = rows.iter().map(|r| r.data.as_str().unwrap()).collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_gzip_line_loader_rejects_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log.gz");
        std::fs::write(&path, "not gzip at all\n").unwrap();
        assert!(collect(&GzipLineLoader, &path).await.is_err());
    }
}
