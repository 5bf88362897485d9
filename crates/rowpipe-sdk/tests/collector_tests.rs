//! End-to-end collector runs against in-memory sources and writers

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{contents, Contents, MemoryLoader, MemorySource, MemoryWriter, RecordingObserver};
use rowpipe_sdk::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    collector: Collector,
    source: Arc<MemorySource>,
    writer: Arc<MemoryWriter>,
    observer: Arc<RecordingObserver>,
}

async fn harness(artifacts: &[(&str, usize)], chunk_size: usize) -> Result<Harness> {
    harness_with(artifacts, common::config(chunk_size), |loader| loader, |b| b).await
}

async fn harness_with(
    artifacts: &[(&str, usize)],
    config: CollectorConfig,
    loader: impl FnOnce(MemoryLoader) -> MemoryLoader,
    customize: impl FnOnce(CollectorBuilder) -> CollectorBuilder,
) -> Result<Harness> {
    harness_from(contents(artifacts), common::table(), config, loader, customize).await
}

async fn harness_from(
    contents: Contents,
    table: Arc<dyn Table>,
    config: CollectorConfig,
    loader: impl FnOnce(MemoryLoader) -> MemoryLoader,
    customize: impl FnOnce(CollectorBuilder) -> CollectorBuilder,
) -> Result<Harness> {
    let source = Arc::new(MemorySource::new(contents.clone()));
    let writer = Arc::new(MemoryWriter::default());
    let observer = Arc::new(RecordingObserver::default());

    let builder = Collector::builder(table, source.clone())
        .partition("p1")
        .config(config)
        .writer(writer.clone())
        .observer(observer.clone())
        .loader(Arc::new(loader(MemoryLoader::new(contents))))
        .mapper(Arc::new(JsonMapper));
    let collector = customize(builder).build().await?;

    Ok(Harness {
        collector,
        source,
        writer,
        observer,
    })
}

async fn run(collector: &Collector) -> Result<CollectionSummary> {
    let summary = tokio::time::timeout(RUN_TIMEOUT, collector.collect(CancellationToken::new()))
        .await
        .expect("collection did not finish")?;
    Ok(summary)
}

/// `(artifact, message)` of every error event, in order
fn error_events(events: impl IntoIterator<Item = Event>) -> Vec<(Option<String>, String)> {
    events
        .into_iter()
        .filter_map(|e| match e {
            Event::Error { artifact, error, .. } => Some((artifact, error)),
            _ => None,
        })
        .collect()
}

/// Delegates to an in-memory state but can never persist it
struct ReadOnlyState(TimeRangeCollectionState);

#[async_trait]
impl CollectionState for ReadOnlyState {
    fn granularity(&self) -> Option<Granularity> {
        self.0.granularity()
    }

    fn should_collect(&self, info: &ArtifactInfo) -> bool {
        self.0.should_collect(info)
    }

    fn on_collected(&self, info: &ArtifactInfo) -> rowpipe_sdk::prelude::Result<()> {
        self.0.on_collected(info)
    }

    fn register_path(&self, path: &str, metadata: &HashMap<String, String>) {
        self.0.register_path(path, metadata)
    }

    fn should_traverse(&self, path: &str) -> bool {
        self.0.should_traverse(path)
    }

    async fn save(&self) -> rowpipe_sdk::prelude::Result<()> {
        Err(SdkError::config("state store is read-only"))
    }
}

#[tokio::test]
async fn test_run_completes_once_after_all_artifacts() -> Result<()> {
    let h = harness(&[("a", 3), ("b", 3), ("c", 3), ("d", 3), ("e", 3)], 4).await?;
    let summary = run(&h.collector).await?;

    assert!(!summary.cancelled);
    assert_eq!(summary.rows_written(), 15);
    assert_eq!(summary.chunks_written(), 4);
    assert_eq!(summary.errors(), 0);
    assert_eq!(summary.status.artifacts_extracted, 5);

    let kinds = h.observer.kinds();
    assert_eq!(kinds.first(), Some(&"started"));
    assert_eq!(kinds.last(), Some(&"completed"));
    assert_eq!(h.observer.count("completed"), 1);
    assert_eq!(h.observer.count("artifact_extracted"), 5);
    assert_eq!(h.observer.count("chunk_written"), 4);
    assert_eq!(h.observer.count("row_extracted"), 15);
    Ok(())
}

#[tokio::test]
async fn test_exact_chunk_size_writes_one_chunk() -> Result<()> {
    let h = harness(&[("a", 10)], 10).await?;
    run(&h.collector).await?;

    let chunks = h.writer.chunks();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_number, 0);
    assert_eq!(chunks[0].row_count, 10);
    assert_eq!(chunks[0].execution_id, "exec-1");
    Ok(())
}

#[tokio::test]
async fn test_one_row_over_chunk_size_writes_two_chunks() -> Result<()> {
    let h = harness(&[("a", 11)], 10).await?;
    run(&h.collector).await?;

    let chunks = h.writer.chunks();
    let layout: Vec<_> = chunks.iter().map(|c| (c.chunk_number, c.row_count)).collect();
    assert_eq!(layout, vec![(0, 10), (1, 1)]);
    Ok(())
}

#[tokio::test]
async fn test_rows_keep_order_within_artifact() -> Result<()> {
    let h = harness(&[("a", 50), ("b", 50), ("c", 50)], 7).await?;
    run(&h.collector).await?;

    let rows = h.writer.rows();
    assert_eq!(rows.len(), 150);
    for (name, seqs) in common::sequences(&rows) {
        let expected: Vec<u64> = (0..50).collect();
        assert_eq!(seqs, expected, "rows of {name} out of order");
    }
    Ok(())
}

#[tokio::test]
async fn test_rows_carry_common_fields() -> Result<()> {
    let h = harness(&[("a", 2)], 10).await?;
    run(&h.collector).await?;

    for row in h.writer.rows() {
        assert_eq!(row["tp_table"], "test_log");
        assert_eq!(row["tp_partition"], "p1");
        assert_eq!(row["tp_source_type"], "memory");
        assert_eq!(row["tp_index"], "default");
        assert!(!row["tp_id"].as_str().unwrap().is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_loader_failure_reports_one_error() -> Result<()> {
    let h = harness_with(
        &[("a", 5), ("b", 5), ("c", 5)],
        common::config(100),
        |loader| loader.fail_after("b", 2),
        |b| b,
    )
    .await?;
    let summary = run(&h.collector).await?;

    let errors = error_events(h.observer.events());
    assert_eq!(errors.len(), 1, "expected one error event: {errors:?}");
    assert_eq!(errors[0].0.as_deref(), Some("b"));
    assert!(errors[0].1.contains("corrupt input at line 3"));

    assert_eq!(summary.errors(), 1);
    assert_eq!(summary.status.artifacts_extracted, 2);
    // rows sent before the failure are kept
    assert_eq!(summary.rows_written(), 12);
    assert_eq!(common::sequences(&h.writer.rows())["b"], vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn test_loader_failing_before_first_row_reports_one_error() -> Result<()> {
    let h = harness_with(
        &[("a", 5), ("b", 5), ("c", 5)],
        common::config(100),
        |loader| loader.fail_after("b", 0),
        |b| b,
    )
    .await?;
    let summary = run(&h.collector).await?;

    let errors = error_events(h.observer.events());
    assert_eq!(errors.len(), 1, "expected one error event: {errors:?}");
    assert_eq!(errors[0].0.as_deref(), Some("b"));
    assert!(errors[0].1.contains("corrupt input at line 1"));

    assert_eq!(summary.status.artifacts_extracted, 2);
    assert_eq!(summary.rows_written(), 10);
    assert!(!common::names(&h.writer.rows()).contains("b"));
    assert_eq!(h.observer.count("completed"), 1);
    Ok(())
}

#[tokio::test]
async fn test_enrichment_failure_stops_only_that_artifact() -> Result<()> {
    let ts = "2024-06-01T12:00:00Z";
    let contents = common::raw_contents(&[
        ("a", vec![json!({"artifact": "a", "seq": 0, "ts": ts}), json!({"artifact": "a", "seq": 1, "ts": ts})]),
        (
            "b",
            vec![
                json!({"artifact": "b", "seq": 0, "ts": ts}),
                json!({"artifact": "b", "seq": 1, "ts": "yesterday"}),
                json!({"artifact": "b", "seq": 2, "ts": ts}),
            ],
        ),
        ("c", vec![json!({"artifact": "c", "seq": 0, "ts": ts})]),
    ]);
    let table = common::table_with(DynamicTableConfig::new("test_log").timestamp_field("ts"));
    let h = harness_from(contents, table, common::config(100), |l| l, |b| b).await?;
    let summary = run(&h.collector).await?;

    let errors = error_events(h.observer.events());
    assert_eq!(errors.len(), 1, "expected one error event: {errors:?}");
    assert_eq!(errors[0].0.as_deref(), Some("b"));
    assert!(errors[0].1.contains("enriching row of b"));

    assert_eq!(summary.errors(), 1);
    assert_eq!(summary.status.artifacts_extracted, 2);
    let seqs = common::sequences(&h.writer.rows());
    assert_eq!(seqs["a"], vec![0, 1]);
    assert_eq!(seqs["b"], vec![0]);
    assert_eq!(seqs["c"], vec![0]);
    Ok(())
}

#[tokio::test]
async fn test_failed_chunk_write_keeps_reading_artifact() -> Result<()> {
    let writer = Arc::new(MemoryWriter::default().fail_chunk(0));
    let h = harness_with(&[("a", 5)], common::config(2), |l| l, |b| b.writer(writer.clone())).await?;
    let summary = run(&h.collector).await?;

    let errors = error_events(h.observer.events());
    assert_eq!(errors.len(), 1, "expected one error event: {errors:?}");
    assert_eq!(errors[0].0.as_deref(), Some("a"));
    assert!(errors[0].1.contains("writing chunk 0 failed"));

    // rows after the lost chunk still arrive
    assert_eq!(common::sequences(&writer.rows())["a"], vec![2, 3, 4]);
    assert_eq!(summary.rows_written(), 3);
    assert_eq!(summary.chunks_written(), 2);
    assert_eq!(h.observer.count("chunk_written"), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_checkpoint_still_announces_chunk() -> Result<()> {
    let state = Arc::new(ReadOnlyState(TimeRangeCollectionState::new(None)));
    let h = harness_with(&[("a", 4)], common::config(2), |l| l, |b| b.state(state)).await?;
    let summary = run(&h.collector).await?;

    let kinds = h.observer.kinds();
    let first_chunk = kinds.iter().position(|k| *k == "chunk_written").unwrap();
    let first_error = kinds.iter().position(|k| *k == "error").unwrap();
    assert!(first_chunk < first_error, "event order: {kinds:?}");

    // two checkpoints after chunks plus the final save
    let errors = error_events(h.observer.events());
    assert_eq!(errors.len(), 3, "{errors:?}");
    assert!(errors.iter().all(|(artifact, _)| artifact.is_none()));
    assert!(errors[0].1.contains("checkpoint after chunk 0 failed"));

    assert_eq!(summary.rows_written(), 4);
    assert_eq!(summary.status.artifacts_extracted, 1);
    assert_eq!(common::sequences(&h.writer.rows())["a"], vec![0, 1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn test_skip_header_drops_first_row_of_each_artifact() -> Result<()> {
    let config = CollectorConfig {
        skip_header: true,
        ..common::config(100)
    };
    let h = harness_with(&[("a", 3), ("b", 2)], config, |l| l, |b| b).await?;
    let summary = run(&h.collector).await?;

    assert_eq!(summary.rows_written(), 3);
    let seqs = common::sequences(&h.writer.rows());
    assert_eq!(seqs["a"], vec![1, 2]);
    assert_eq!(seqs["b"], vec![1]);
    Ok(())
}

fn record_batches() -> Contents {
    let record = |seq: u64| json!({"artifact": "a", "seq": seq});
    common::raw_contents(&[(
        "a",
        vec![
            json!({"records": [record(0), record(1)]}),
            json!({"records": [record(2)]}),
            json!({"other": true}),
        ],
    )])
}

#[tokio::test]
async fn test_table_extractor_splits_units_into_rows() -> Result<()> {
    let table = common::table_with(DynamicTableConfig::new("test_log").records_pointer("/records"));
    let h = harness_from(record_batches(), table, common::config(100), |l| l, |b| b).await?;
    let summary = run(&h.collector).await?;

    assert_eq!(summary.errors(), 0);
    assert_eq!(summary.rows_written(), 3);
    assert_eq!(common::sequences(&h.writer.rows())["a"], vec![0, 1, 2]);
    assert_eq!(h.observer.count("row_extracted"), 3);
    Ok(())
}

#[tokio::test]
async fn test_skip_header_applies_after_extraction() -> Result<()> {
    let table = common::table_with(DynamicTableConfig::new("test_log").records_pointer("/records"));
    let config = CollectorConfig {
        skip_header: true,
        ..common::config(100)
    };
    let h = harness_from(record_batches(), table, config, |l| l, |b| b).await?;
    run(&h.collector).await?;

    assert_eq!(common::sequences(&h.writer.rows())["a"], vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_second_run_skips_collected_artifacts() -> Result<()> {
    let h = harness(&[("a", 2), ("b", 2), ("c", 2)], 10).await?;

    let first = run(&h.collector).await?;
    assert_eq!(first.status.artifacts_downloaded, 3);

    let second = run(&h.collector).await?;
    assert_eq!(second.status.artifacts_discovered, 3);
    assert_eq!(second.status.artifacts_skipped, 3);
    assert_eq!(second.status.artifacts_downloaded, 0);
    assert_eq!(second.rows_written(), 0);
    for name in ["a", "b", "c"] {
        assert_eq!(h.source.download_count(name), 1);
    }
    Ok(())
}

#[tokio::test]
async fn test_each_artifact_downloaded_or_skipped() -> Result<()> {
    let state = Arc::new(TimeRangeCollectionState::new(None));
    state.on_collected(&ArtifactInfo::new("b"))?;
    state.on_collected(&ArtifactInfo::new("d"))?;

    let h = harness_with(
        &[("a", 1), ("b", 1), ("c", 1), ("d", 1), ("e", 1)],
        common::config(10),
        |loader| loader,
        |builder| builder.state(state.clone()),
    )
    .await?;
    let summary = run(&h.collector).await?;

    let status = &summary.status;
    assert_eq!(status.artifacts_discovered, 5);
    assert_eq!(status.artifacts_skipped, 2);
    assert_eq!(status.artifacts_downloaded, 3);
    for (name, expected) in [("a", 1), ("b", 0), ("c", 1), ("d", 0), ("e", 1)] {
        assert_eq!(h.source.download_count(name), expected, "downloads of {name}");
    }
    let written = common::names(&h.writer.rows());
    assert!(!written.contains("b") && !written.contains("d"));
    Ok(())
}

#[tokio::test]
async fn test_cancel_unwinds_and_releases_gate() -> Result<()> {
    let contents = contents(&[("a", 1), ("b", 1), ("c", 1), ("d", 1), ("e", 1)]);
    let source = Arc::new(MemorySource::new(contents.clone()).download_delay(Duration::from_secs(3600)));
    let writer = Arc::new(MemoryWriter::default());
    let gate = Arc::new(SemaphoreGate::new(2)?);
    let (observer, mut events) = ChannelObserver::channel(1000);

    let collector = Collector::builder(common::table(), source)
        .config(common::config(10))
        .gate(gate.clone())
        .writer(writer.clone())
        .observer(Arc::new(observer))
        .loader(Arc::new(MemoryLoader::new(contents)))
        .build()
        .await?;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let collector = collector.clone();
        let cancel = cancel.clone();
        async move { collector.collect(cancel).await }
    });

    // both slots taken, discovery is now blocked on the gate
    let mut discovered = 0;
    while discovered < 2 {
        let event = events.recv().await.expect("collector stopped early");
        if matches!(event, Event::ArtifactDiscovered { .. }) {
            discovered += 1;
        }
    }
    assert_eq!(gate.in_flight(), 2);
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancelled run did not return")??;
    assert!(summary.cancelled);
    assert_eq!(gate.available(), gate.capacity());
    assert!(writer.chunks().is_empty());

    // the artifact waiting for a slot is reported; cancelled downloads are not
    let mut rest = Vec::new();
    while let Ok(event) = events.try_recv() {
        rest.push(event);
    }
    let errors = error_events(rest);
    assert_eq!(summary.errors(), 1);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert_eq!(errors[0].0.as_deref(), Some("c"));
    assert!(errors[0].1.contains("admission failed"));
    Ok(())
}

#[tokio::test]
async fn test_cancel_writes_rows_already_buffered() -> Result<()> {
    let contents = contents(&[("a", 1), ("slow", 1)]);
    let source = Arc::new(MemorySource::new(contents.clone()).delay_for("slow", Duration::from_secs(3600)));
    let writer = Arc::new(MemoryWriter::default());
    let (observer, mut events) = ChannelObserver::channel(1000);

    let collector = Collector::builder(common::table(), source.clone())
        .config(common::config(10))
        .writer(writer.clone())
        .observer(Arc::new(observer))
        .loader(Arc::new(MemoryLoader::new(contents)))
        .mapper(Arc::new(JsonMapper))
        .build()
        .await?;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let collector = collector.clone();
        let cancel = cancel.clone();
        async move { collector.collect(cancel).await }
    });

    loop {
        match events.recv().await.expect("collector stopped early") {
            Event::ArtifactExtracted { artifact, .. } if artifact == "a" => break,
            _ => {}
        }
    }
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancelled run did not return")??;
    assert!(summary.cancelled);
    assert_eq!(summary.rows_written(), 1);
    assert_eq!(common::sequences(&writer.rows())["a"], vec![0]);
    assert_eq!(source.download_count("slow"), 0);

    let state = collector.state();
    assert!(!state.should_collect(&ArtifactInfo::new("a")));
    assert!(state.should_collect(&ArtifactInfo::new("slow")));
    Ok(())
}

#[tokio::test]
async fn test_observer_sees_same_execution_id() -> Result<()> {
    let h = harness(&[("a", 1), ("b", 1)], 10).await?;
    let summary = run(&h.collector).await?;
    assert_eq!(summary.execution_id, "exec-1");
    assert!(h
        .observer
        .events()
        .iter()
        .all(|e| e.execution_id() == "exec-1"));
    Ok(())
}

#[tokio::test]
async fn test_build_rejects_empty_partition() {
    let contents = contents(&[("a", 1)]);
    let result = Collector::builder(common::table(), Arc::new(MemorySource::new(contents)))
        .partition("  ")
        .build()
        .await;
    assert!(matches!(result, Err(SdkError::Config(_))));
}
