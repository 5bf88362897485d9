//! Chunk output

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One batch of enriched rows, serialized as JSON lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub execution_id: String,
    pub chunk_number: u64,
    pub row_count: usize,
    /// One JSON document per line, each line terminated by `\n`
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl Chunk {
    /// Iterate the rows as raw JSON lines
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.data
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
    }
}

/// Durably persists chunks. A chunk is durable once `write_chunk` returns `Ok`.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    async fn write_chunk(&self, cancel: &CancellationToken, chunk: &Chunk) -> anyhow::Result<()>;
}

/// Writes each chunk to `{dir}/{execution_id}-{chunk_number}.jsonl`
#[derive(Debug, Clone)]
pub struct JsonlFileWriter {
    dir: PathBuf,
}

impl JsonlFileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, execution_id: &str, chunk_number: u64) -> PathBuf {
        self.dir.join(format!("{execution_id}-{chunk_number}.jsonl"))
    }
}

#[async_trait]
impl ChunkWriter for JsonlFileWriter {
    async fn write_chunk(&self, cancel: &CancellationToken, chunk: &Chunk) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!(rowpipe_common::SdkError::Cancelled);
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.chunk_path(&chunk.execution_id, chunk.chunk_number);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &chunk.data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;

        debug!(
            path = %path.display(),
            chunk_number = chunk.chunk_number,
            rows = chunk.row_count,
            "Wrote chunk"
        );
        Ok(())
    }
}
