//! Progress events emitted by the collector

use crate::artifact::{ArtifactInfo, DownloadedArtifactInfo};
use crate::status::StatusSnapshot;
use crate::timing::TimingReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Started {
        execution_id: String,
        table: String,
        partition: String,
    },
    ArtifactDiscovered {
        execution_id: String,
        info: ArtifactInfo,
    },
    ArtifactDownloaded {
        execution_id: String,
        info: DownloadedArtifactInfo,
    },
    ArtifactExtracted {
        execution_id: String,
        artifact: String,
        rows: u64,
    },
    RowExtracted {
        execution_id: String,
        artifact: String,
        row_number: u64,
    },
    Status {
        execution_id: String,
        status: StatusSnapshot,
    },
    ChunkWritten {
        execution_id: String,
        chunk_number: u64,
        rows: usize,
    },
    Error {
        execution_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<String>,
        error: String,
    },
    Completed {
        execution_id: String,
        status: StatusSnapshot,
        timing: TimingReport,
        cancelled: bool,
    },
}

impl Event {
    pub fn execution_id(&self) -> &str {
        match self {
            Event::Started { execution_id, .. }
            | Event::ArtifactDiscovered { execution_id, .. }
            | Event::ArtifactDownloaded { execution_id, .. }
            | Event::ArtifactExtracted { execution_id, .. }
            | Event::RowExtracted { execution_id, .. }
            | Event::Status { execution_id, .. }
            | Event::ChunkWritten { execution_id, .. }
            | Event::Error { execution_id, .. }
            | Event::Completed { execution_id, .. } => execution_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Started { .. } => "started",
            Event::ArtifactDiscovered { .. } => "artifact_discovered",
            Event::ArtifactDownloaded { .. } => "artifact_downloaded",
            Event::ArtifactExtracted { .. } => "artifact_extracted",
            Event::RowExtracted { .. } => "row_extracted",
            Event::Status { .. } => "status",
            Event::ChunkWritten { .. } => "chunk_written",
            Event::Error { .. } => "error",
            Event::Completed { .. } => "completed",
        }
    }
}

/// Receives collector events. An `Err` is reported back to the emitter.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn notify(&self, event: Event) -> anyhow::Result<()>;
}

/// Forwards events over a channel, e.g. to the process-boundary transport
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<Event>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Observer for ChannelObserver {
    async fn notify(&self, event: Event) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| anyhow::anyhow!("event receiver closed, dropped {}", e.0.kind()))
    }
}
