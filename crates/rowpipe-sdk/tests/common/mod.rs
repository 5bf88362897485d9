//! Shared fixtures for collector integration tests
//!
//! - [`MemorySource`]: artifacts held in memory, with optional download delays
//! - [`MemoryLoader`]: emits the JSON lines of an artifact, optionally failing
//! - [`MemoryWriter`]: keeps every chunk it is given, optionally failing some
//! - [`RecordingObserver`]: keeps every event it is given

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use rowpipe_sdk::prelude::*;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

pub type Contents = Arc<HashMap<String, Vec<String>>>;

/// `rows` JSON lines per artifact, each carrying its artifact name and sequence number
pub fn contents(artifacts: &[(&str, usize)]) -> Contents {
    Arc::new(
        artifacts
            .iter()
            .map(|(name, rows)| {
                let lines = (0..*rows)
                    .map(|seq| serde_json::json!({"artifact": name, "seq": seq}).to_string())
                    .collect();
                (name.to_string(), lines)
            })
            .collect(),
    )
}

pub struct MemorySource {
    names: Vec<String>,
    contents: Contents,
    download_delay: Option<Duration>,
    delays: HashMap<String, Duration>,
    downloads: Mutex<HashMap<String, usize>>,
}

impl MemorySource {
    pub fn new(contents: Contents) -> Self {
        let mut names: Vec<_> = contents.keys().cloned().collect();
        names.sort();
        Self {
            names,
            contents,
            download_delay: None,
            delays: HashMap::new(),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    pub fn download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    /// Delay downloads of one artifact only
    pub fn delay_for(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn download_count(&self, name: &str) -> usize {
        self.downloads.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    fn identifier(&self) -> &str {
        "memory"
    }

    async fn discover_artifacts(
        &self,
        _cancel: &CancellationToken,
        callbacks: &dyn ArtifactCallbacks,
    ) -> anyhow::Result<()> {
        for name in &self.names {
            callbacks.on_artifact_discovered(ArtifactInfo::new(name.clone())).await?;
        }
        Ok(())
    }

    async fn download_artifact(
        &self,
        _cancel: &CancellationToken,
        info: &ArtifactInfo,
    ) -> anyhow::Result<DownloadedArtifactInfo> {
        if let Some(delay) = self.delays.get(&info.name).copied().or(self.download_delay) {
            tokio::time::sleep(delay).await;
        }
        *self.downloads.lock().unwrap().entry(info.name.clone()).or_default() += 1;
        let size = self.contents[&info.name].iter().map(|l| l.len() as u64 + 1).sum();
        Ok(DownloadedArtifactInfo::new(info.clone(), Path::new(&info.name), size))
    }
}

pub struct MemoryLoader {
    contents: Contents,
    /// Artifact name to the number of rows sent before failing
    failures: HashMap<String, usize>,
}

impl MemoryLoader {
    pub fn new(contents: Contents) -> Self {
        Self {
            contents,
            failures: HashMap::new(),
        }
    }

    pub fn fail_after(mut self, name: &str, rows: usize) -> Self {
        self.failures.insert(name.to_string(), rows);
        self
    }
}

#[async_trait]
impl Loader for MemoryLoader {
    fn identifier(&self) -> &str {
        "memory"
    }

    async fn load(
        &self,
        _cancel: &CancellationToken,
        downloaded: &DownloadedArtifactInfo,
        tx: Sender<RowData>,
    ) -> anyhow::Result<()> {
        let fail_at = self.failures.get(downloaded.name()).copied();
        for (i, line) in self.contents[downloaded.name()].iter().enumerate() {
            if fail_at == Some(i) {
                anyhow::bail!("corrupt input at line {}", i + 1);
            }
            if tx.send(RowData::new(line.clone())).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWriter {
    chunks: Mutex<Vec<Chunk>>,
    /// Chunk numbers whose write fails
    failing: HashSet<u64>,
}

impl MemoryWriter {
    pub fn fail_chunk(mut self, chunk_number: u64) -> Self {
        self.failing.insert(chunk_number);
        self
    }

    /// Chunks ordered by chunk number
    pub fn chunks(&self) -> Vec<Chunk> {
        let mut chunks = self.chunks.lock().unwrap().clone();
        chunks.sort_by_key(|c| c.chunk_number);
        chunks
    }

    /// Every written row, in chunk order
    pub fn rows(&self) -> Vec<Value> {
        self.chunks()
            .iter()
            .flat_map(|c| {
                c.lines()
                    .map(|line| serde_json::from_slice(line).unwrap())
                    .collect::<Vec<Value>>()
            })
            .collect()
    }
}

#[async_trait]
impl ChunkWriter for MemoryWriter {
    async fn write_chunk(&self, _cancel: &CancellationToken, chunk: &Chunk) -> anyhow::Result<()> {
        if self.failing.contains(&chunk.chunk_number) {
            anyhow::bail!("disk full");
        }
        self.chunks.lock().unwrap().push(chunk.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl Observer for RecordingObserver {
    async fn notify(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub fn table() -> Arc<dyn Table> {
    table_with(DynamicTableConfig::new("test_log"))
}

pub fn table_with(config: DynamicTableConfig) -> Arc<dyn Table> {
    Arc::new(DynamicTable::new(config).unwrap())
}

/// Artifacts whose lines are given verbatim
pub fn raw_contents(artifacts: &[(&str, Vec<Value>)]) -> Contents {
    Arc::new(
        artifacts
            .iter()
            .map(|(name, lines)| {
                (name.to_string(), lines.iter().map(|l| l.to_string()).collect())
            })
            .collect(),
    )
}

pub fn config(chunk_size: usize) -> CollectorConfig {
    CollectorConfig {
        chunk_size,
        max_concurrency: 4,
        execution_id: Some("exec-1".to_string()),
        ..Default::default()
    }
}

/// Artifact names seen among the rows, with sequence numbers in output order
pub fn sequences(rows: &[Value]) -> HashMap<String, Vec<u64>> {
    let mut seen: HashMap<String, Vec<u64>> = HashMap::new();
    for row in rows {
        let name = row["artifact"].as_str().unwrap().to_string();
        seen.entry(name).or_default().push(row["seq"].as_u64().unwrap());
    }
    seen
}

pub fn names(rows: &[Value]) -> HashSet<String> {
    sequences(rows).into_keys().collect()
}
