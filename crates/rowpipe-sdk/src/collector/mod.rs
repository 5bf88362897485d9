//! Collection orchestrator
//!
//! A [`Collector`] wires one table and one source together for a partition.
//! Each call to [`Collector::collect`] is one run:
//!
//! 1. the source discovers artifacts and reports them through
//!    [`ArtifactCallbacks`];
//! 2. artifacts the collection state has already seen are skipped, the rest
//!    wait for a gate slot and are downloaded on their own task;
//! 3. each download is marked collected and extracted on another task, its
//!    rows mapped, enriched, validated, and buffered;
//! 4. full buffers are written as chunks, followed by a state checkpoint;
//! 5. once all work has drained, the final partial chunk is written and the
//!    state saved.
//!
//! Every admitted artifact holds a [`WorkGuard`] from admission until its
//! extraction ends, so the run waits for exactly the work it started.

mod extract;

use crate::artifact::{ArtifactInfo, DownloadedArtifactInfo};
use crate::buffer::{PendingChunk, RowBuffer};
use crate::config::CollectorConfig;
use crate::gate::{ConcurrencyGate, GateSlot, SemaphoreGate, TokenBucketGate};
use crate::loader::{Loader, LoaderCache, LoaderKind};
use crate::mapper::Mapper;
use crate::observer::{Event, Observer};
use crate::pattern::Layout;
use crate::source::{ArtifactCallbacks, ArtifactSource};
use crate::state::{CollectionState, TimeRangeCollectionState};
use crate::status::{StatusSnapshot, StatusTracker};
use crate::table::Table;
use crate::timing::{Phase, Timing, TimingReport};
use crate::tracker::{WorkGuard, WorkTracker};
use crate::writer::{ChunkWriter, JsonlFileWriter};
use async_trait::async_trait;
use rowpipe_common::{Result, SdkError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub execution_id: String,
    pub status: StatusSnapshot,
    pub timing: TimingReport,
    pub cancelled: bool,
}

impl CollectionSummary {
    pub fn rows_written(&self) -> u64 {
        self.status.rows_written
    }

    pub fn chunks_written(&self) -> u64 {
        self.status.chunks_written
    }

    pub fn errors(&self) -> u64 {
        self.status.errors
    }
}

pub struct CollectorBuilder {
    table: Arc<dyn Table>,
    source: Arc<dyn ArtifactSource>,
    partition: String,
    config: CollectorConfig,
    gate: Option<Arc<dyn ConcurrencyGate>>,
    state: Option<Arc<dyn CollectionState>>,
    writer: Option<Arc<dyn ChunkWriter>>,
    observers: Vec<Arc<dyn Observer>>,
    loader: Option<Arc<dyn Loader>>,
    loaders: Option<Arc<LoaderCache>>,
    mappers: Vec<Arc<dyn Mapper>>,
}

impl CollectorBuilder {
    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gate(mut self, gate: Arc<dyn ConcurrencyGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn state(mut self, state: Arc<dyn CollectionState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn ChunkWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Use this loader for every artifact instead of inferring one
    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Share inferred loaders with other collectors
    pub fn loader_cache(mut self, cache: Arc<LoaderCache>) -> Self {
        self.loaders = Some(cache);
        self
    }

    /// Append a mapper; mappers run in the order they are added
    pub fn mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mappers.push(mapper);
        self
    }

    /// Validate the configuration and assemble the collector.
    ///
    /// Unset collaborators get defaults: a gate from `max_concurrency` and
    /// `rate_limit`, time-range state (loaded from `state_path` when set),
    /// and a JSONL writer into `output_dir`.
    pub async fn build(self) -> Result<Collector> {
        self.config.validate()?;
        if self.partition.trim().is_empty() {
            return Err(SdkError::config("partition name must not be empty"));
        }

        let supported = self.table.supported_sources();
        let source_type = self.source.identifier().to_string();
        if !supported.is_empty() && !supported.contains(&source_type) {
            return Err(SdkError::UnsupportedSource {
                table: self.table.identifier().to_string(),
                source_type,
            });
        }

        let gate: Arc<dyn ConcurrencyGate> = match (self.gate, &self.config.rate_limit) {
            (Some(gate), _) => gate,
            (None, Some(rate)) => Arc::new(
                TokenBucketGate::new(rate.fill_rate, rate.burst)?
                    .with_max_concurrency(self.config.max_concurrency)?,
            ),
            (None, None) => Arc::new(SemaphoreGate::new(self.config.max_concurrency)?),
        };

        let granularity = self.source.granularity();
        let trunk_fields = self.source.layout().map(Layout::trunk_fields).unwrap_or_default();
        let state: Arc<dyn CollectionState> = match (self.state, &self.config.state_path) {
            (Some(state), _) => state,
            (None, Some(path)) => Arc::new(
                TimeRangeCollectionState::load(path, granularity)
                    .await?
                    .with_trunk_fields(trunk_fields),
            ),
            (None, None) => {
                Arc::new(TimeRangeCollectionState::new(granularity).with_trunk_fields(trunk_fields))
            }
        };

        let writer = self
            .writer
            .unwrap_or_else(|| Arc::new(JsonlFileWriter::new(self.config.output_dir.clone())));

        Ok(Collector {
            inner: Arc::new(CollectorInner {
                table: self.table,
                source: self.source,
                partition: self.partition,
                config: self.config,
                gate,
                state,
                writer,
                observers: self.observers,
                loader: self.loader,
                loaders: self.loaders.unwrap_or_default(),
                mappers: self.mappers,
            }),
        })
    }
}

struct CollectorInner {
    table: Arc<dyn Table>,
    source: Arc<dyn ArtifactSource>,
    partition: String,
    config: CollectorConfig,
    gate: Arc<dyn ConcurrencyGate>,
    state: Arc<dyn CollectionState>,
    writer: Arc<dyn ChunkWriter>,
    observers: Vec<Arc<dyn Observer>>,
    loader: Option<Arc<dyn Loader>>,
    loaders: Arc<LoaderCache>,
    mappers: Vec<Arc<dyn Mapper>>,
}

impl CollectorInner {
    fn resolve_loader(&self, info: &ArtifactInfo) -> Arc<dyn Loader> {
        if let Some(loader) = &self.loader {
            return loader.clone();
        }
        let kind = self
            .config
            .loader
            .unwrap_or_else(|| LoaderKind::infer(info, self.config.whole_object));
        self.loaders.get(kind)
    }
}

/// Collects one partition of one table from one source
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("table", &self.inner.table.identifier())
            .field("source", &self.inner.source.identifier())
            .field("partition", &self.inner.partition)
            .finish_non_exhaustive()
    }
}

impl Collector {
    pub fn builder(table: Arc<dyn Table>, source: Arc<dyn ArtifactSource>) -> CollectorBuilder {
        CollectorBuilder {
            table,
            source,
            partition: "default".to_string(),
            config: CollectorConfig::default(),
            gate: None,
            state: None,
            writer: None,
            observers: Vec::new(),
            loader: None,
            loaders: None,
            mappers: Vec::new(),
        }
    }

    pub fn state(&self) -> Arc<dyn CollectionState> {
        self.inner.state.clone()
    }

    pub fn loader_cache(&self) -> Arc<LoaderCache> {
        self.inner.loaders.clone()
    }

    /// Run one collection.
    ///
    /// Per-artifact failures are reported as `Event::Error` and counted in
    /// the summary; only a failure to start the run is returned as `Err`.
    /// After cancellation the run still waits for in-flight work to unwind.
    /// Rows already buffered are then written and the state saved, since
    /// their artifacts are marked collected.
    pub async fn collect(&self, cancel: CancellationToken) -> Result<CollectionSummary> {
        let inner = &self.inner;
        let execution_id = inner
            .config
            .execution_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let run = Run {
            collector: inner.clone(),
            ctx: Arc::new(RunContext {
                execution_id: execution_id.clone(),
                cancel: cancel.clone(),
                tracker: WorkTracker::new(),
                status: StatusTracker::new(inner.config.status_interval()),
                timing: Timing::new(),
                buffer: RowBuffer::new(inner.config.chunk_size),
                write_cancel: CancellationToken::new(),
            }),
        };

        info!(
            execution_id = %execution_id,
            table = inner.table.identifier(),
            partition = %inner.partition,
            source = inner.source.identifier(),
            "Starting collection"
        );
        run.emit(Event::Started {
            execution_id: execution_id.clone(),
            table: inner.table.identifier().to_string(),
            partition: inner.partition.clone(),
        })
        .await?;

        // held through discovery so the counter cannot drain between artifacts
        let discovery = run.ctx.tracker.start();
        let discovered = {
            let _timer = run.ctx.timing.start(Phase::Discover);
            inner.source.discover_artifacts(&cancel, &run).await
        };
        drop(discovery);
        if let Err(e) = discovered {
            if cancel.is_cancelled() {
                debug!(execution_id = %execution_id, "Discovery stopped by cancellation");
            } else {
                run.report_error(None, format!("discovery failed: {e:#}")).await;
            }
        }

        run.ctx.tracker.wait_idle().await;

        let cancelled = cancel.is_cancelled();
        if let Some(pending) = run.ctx.buffer.take_remaining() {
            if let Err(e) = run.flush(pending).await {
                run.report_error(None, format!("final chunk failed: {e}")).await;
            }
        }
        if let Err(e) = inner.state.save().await {
            run.report_error(None, format!("saving collection state failed: {e}"))
                .await;
        }
        if let Err(e) = inner.source.close().await {
            warn!(execution_id = %execution_id, error = %e, "Failed to close source");
        }

        run.broadcast_status(true).await;
        let summary = CollectionSummary {
            execution_id: execution_id.clone(),
            status: run.ctx.status.snapshot(),
            timing: run.ctx.timing.report(),
            cancelled,
        };
        if let Err(e) = run
            .emit(Event::Completed {
                execution_id: execution_id.clone(),
                status: summary.status.clone(),
                timing: summary.timing.clone(),
                cancelled,
            })
            .await
        {
            warn!(execution_id = %execution_id, error = %e, "Failed to emit completion event");
        }

        info!(
            execution_id = %execution_id,
            discovered = summary.status.artifacts_discovered,
            skipped = summary.status.artifacts_skipped,
            rows = summary.status.rows_written,
            chunks = summary.status.chunks_written,
            errors = summary.status.errors,
            cancelled,
            "Collection finished"
        );
        Ok(summary)
    }
}

struct RunContext {
    execution_id: String,
    cancel: CancellationToken,
    tracker: WorkTracker,
    status: StatusTracker,
    timing: Timing,
    buffer: RowBuffer,
    /// Passed to the writer instead of `cancel`: rows swapped out of the
    /// buffer belong to collected artifacts and are always written
    write_cancel: CancellationToken,
}

/// One run's view of the collector; cloned into every task it spawns
#[derive(Clone)]
struct Run {
    collector: Arc<CollectorInner>,
    ctx: Arc<RunContext>,
}

impl Run {
    async fn emit(&self, event: Event) -> Result<()> {
        for observer in &self.collector.observers {
            observer.notify(event.clone()).await?;
        }
        Ok(())
    }

    async fn report_error(&self, artifact: Option<&str>, message: String) {
        warn!(
            execution_id = %self.ctx.execution_id,
            artifact = artifact.unwrap_or("-"),
            error = %message,
            "Collection error"
        );
        self.ctx.status.on_error(match artifact {
            Some(name) => format!("{name}: {message}"),
            None => message.clone(),
        });
        let event = Event::Error {
            execution_id: self.ctx.execution_id.clone(),
            artifact: artifact.map(str::to_string),
            error: message,
        };
        if let Err(e) = self.emit(event).await {
            warn!(error = %e, "Failed to emit error event");
        }
    }

    async fn broadcast_status(&self, force: bool) {
        if !self.ctx.status.should_broadcast(force) {
            return;
        }
        let event = Event::Status {
            execution_id: self.ctx.execution_id.clone(),
            status: self.ctx.status.snapshot(),
        };
        if let Err(e) = self.emit(event).await {
            warn!(error = %e, "Failed to emit status event");
        }
    }

    async fn download(self, info: ArtifactInfo, guard: WorkGuard, slot: GateSlot) {
        let _slot = slot;
        let cancel = &self.ctx.cancel;
        let result = {
            let _timer = self.ctx.timing.start(Phase::Download);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(anyhow::Error::new(SdkError::Cancelled)),
                downloaded = self.collector.source.download_artifact(cancel, &info) => downloaded,
            }
        };

        match result {
            Ok(downloaded) => self.on_artifact_downloaded(downloaded, guard).await,
            Err(_) if cancel.is_cancelled() => {
                debug!(artifact = %info.name, "Download cancelled");
            }
            Err(e) => {
                self.report_error(Some(&info.name), format!("download failed: {e:#}"))
                    .await;
            }
        }
    }

    /// Mark the artifact collected and hand it to an extraction task, which
    /// takes over the work guard
    async fn on_artifact_downloaded(&self, downloaded: DownloadedArtifactInfo, guard: WorkGuard) {
        self.ctx.status.on_downloaded(downloaded.size);
        if let Err(e) = self.collector.state.on_collected(&downloaded.info) {
            self.report_error(Some(downloaded.name()), format!("updating collection state failed: {e}"))
                .await;
            return;
        }
        debug!(artifact = downloaded.name(), bytes = downloaded.size, "Downloaded artifact");

        let run = self.clone();
        let task_info = downloaded.clone();
        tokio::spawn(async move { run.extract(task_info, guard).await });

        let event = Event::ArtifactDownloaded {
            execution_id: self.ctx.execution_id.clone(),
            info: downloaded,
        };
        if let Err(e) = self.emit(event).await {
            warn!(error = %e, "Failed to emit download event");
        }
        self.broadcast_status(false).await;
    }

    /// Write one chunk, announce it, then checkpoint the collection state.
    ///
    /// Only a failed write is returned; a failed checkpoint is reported and
    /// retried by the next one.
    async fn flush(&self, pending: PendingChunk) -> Result<()> {
        let _timer = self.ctx.timing.start(Phase::Write);
        let chunk = pending.into_chunk(&self.ctx.execution_id)?;
        self.collector
            .writer
            .write_chunk(&self.ctx.write_cancel, &chunk)
            .await?;
        self.ctx.status.on_chunk_written(chunk.row_count as u64);
        info!(
            execution_id = %chunk.execution_id,
            chunk_number = chunk.chunk_number,
            rows = chunk.row_count,
            "Chunk written"
        );

        let chunk_number = chunk.chunk_number;
        let event = Event::ChunkWritten {
            execution_id: chunk.execution_id,
            chunk_number,
            rows: chunk.row_count,
        };
        if let Err(e) = self.emit(event).await {
            warn!(chunk_number, error = %e, "Failed to emit chunk event");
        }

        if let Err(e) = self.collector.state.save().await {
            self.report_error(None, format!("checkpoint after chunk {chunk_number} failed: {e}"))
                .await;
        }
        self.broadcast_status(false).await;
        Ok(())
    }
}

#[async_trait]
impl ArtifactCallbacks for Run {
    async fn on_artifact_discovered(&self, info: ArtifactInfo) -> Result<()> {
        self.ctx.status.on_discovered(&info.name);
        if !self.collector.state.should_collect(&info) {
            self.ctx.status.on_skipped();
            debug!(artifact = %info.name, "Already collected, skipping");
            return Ok(());
        }

        let guard = self.ctx.tracker.start();
        let slot = match GateSlot::acquire(self.collector.gate.clone(), &self.ctx.cancel).await {
            Ok(slot) => slot,
            Err(e) => {
                drop(guard);
                self.report_error(Some(&info.name), format!("admission failed: {e}"))
                    .await;
                return Err(e);
            }
        };

        let run = self.clone();
        let task_info = info.clone();
        tokio::spawn(async move { run.download(task_info, guard, slot).await });

        self.emit(Event::ArtifactDiscovered {
            execution_id: self.ctx.execution_id.clone(),
            info,
        })
        .await?;
        self.broadcast_status(false).await;
        Ok(())
    }

    fn collection_state(&self) -> Arc<dyn CollectionState> {
        self.collector.state.clone()
    }
}
