use super::{object_value, send_row, Loader};
use crate::artifact::{DownloadedArtifactInfo, RowData};
use anyhow::Context;
use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use std::io::Read;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The whole file as one row
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectLoader;

impl ObjectLoader {
    pub const IDENTIFIER: &'static str = "object";
}

#[async_trait]
impl Loader for ObjectLoader {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        info: &DownloadedArtifactInfo,
        tx: Sender<RowData>,
    ) -> anyhow::Result<()> {
        let content = tokio::fs::read(&info.local_path)
            .await
            .with_context(|| format!("Failed to read {}", info.local_path.display()))?;
        debug!(artifact = info.name(), bytes = content.len(), "Loaded object");
        send_row(&tx, cancel, RowData::new(object_value(&content))).await;
        Ok(())
    }
}

/// The whole decompressed file as one row
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipObjectLoader;

impl GzipObjectLoader {
    pub const IDENTIFIER: &'static str = "gzip_object";
}

#[async_trait]
impl Loader for GzipObjectLoader {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        info: &DownloadedArtifactInfo,
        tx: Sender<RowData>,
    ) -> anyhow::Result<()> {
        let compressed = tokio::fs::read(&info.local_path)
            .await
            .with_context(|| format!("Failed to read {}", info.local_path.display()))?;

        let content = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            let mut decoder = MultiGzDecoder::new(compressed.as_slice());
            let mut content = Vec::new();
            decoder
                .read_to_end(&mut content)
                .context("Failed to decompress gzip data")?;
            Ok(content)
        })
        .await
        .context("Gzip object loader task failed")??;

        debug!(artifact = info.name(), bytes = content.len(), "Loaded gzip object");
        send_row(&tx, cancel, RowData::new(object_value(&content))).await;
        Ok(())
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

    async fn load_one(loader: &dyn Loader, path: &std::path::Path) -> RowData {
        let info = DownloadedArtifactInfo::new(ArtifactInfo::new("obj"), path, 0);
        let (tx, mut rx) = mpsc::channel(1);
        loader
            .load(&CancellationToken::new(), &info, tx)
            .await
            .unwrap();
        let row = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());
        row
    }

    #[tokio::test]
    async fn test_object_loader_parses_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, r#"{"Records": [{"id": 1}, {"id": 2}]}"#).unwrap();

        let row = load_one(&ObjectLoader, &path).await;
        assert_eq!(row.data["Records"][1]["id"], 2);
    }

    #[tokio::test]
    async fn test_gzip_object_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json.gz");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"plain text body").unwrap();
        std::fs::write(&path, enc.finish().unwrap()).unwrap();

        let row = load_one(&GzipObjectLoader, &path).await;
        assert_eq!(row.data, serde_json::json!("plain text body"));
    }
}
