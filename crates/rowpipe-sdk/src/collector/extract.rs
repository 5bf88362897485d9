use super::Run;
use crate::artifact::{ArtifactInfo, DownloadedArtifactInfo, RowData};
use crate::mapper::Extractor;
use crate::observer::Event;
use crate::table::Row;
use crate::timing::Phase;
use crate::tracker::WorkGuard;
use anyhow::Context;
use chrono::{DateTime, Utc};
use rowpipe_common::types::SourceEnrichment;
use rowpipe_common::{Result, SdkError};
use std::fmt;
use std::time::Instant;
use tokio::sync::mpsc::{self, Receiver};
use tracing::debug;

/// Per-row failures of one artifact, reported once as a count and the first error
#[derive(Debug, Default)]
struct RowErrors {
    count: u64,
    first: Option<String>,
}

impl RowErrors {
    fn record(&mut self, error: impl fmt::Display) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(error.to_string());
        }
    }

    fn summary(&self) -> Option<String> {
        self.first
            .as_ref()
            .map(|first| format!("{} row(s) failed, first error: {}", self.count, first))
    }
}

#[derive(Debug, Default)]
struct ConsumeOutcome {
    rows: u64,
    row_errors: RowErrors,
    /// Chunks this artifact filled that could not be written
    write_errors: Vec<String>,
    /// Error that stopped the stream early
    failure: Option<SdkError>,
}

impl Run {
    /// Stream one downloaded artifact through loader, mappers, enrichment and
    /// the buffer. The work guard is released when this returns.
    pub(super) async fn extract(self, downloaded: DownloadedArtifactInfo, _guard: WorkGuard) {
        let _timer = self.ctx.timing.start(Phase::Extract);
        let cancel = self.ctx.cancel.clone();
        let loader = self.collector.resolve_loader(&downloaded.info);
        let (tx, rx) = mpsc::channel(self.collector.config.row_channel_capacity);

        debug!(artifact = downloaded.name(), loader = loader.identifier(), "Extracting");
        let (loaded, outcome) = tokio::join!(
            loader.load(&cancel, &downloaded, tx),
            self.consume(&downloaded.info, rx),
        );

        if cancel.is_cancelled() {
            debug!(artifact = downloaded.name(), rows = outcome.rows, "Extraction cancelled");
            return;
        }

        let mut failures = Vec::new();
        if let Some(failure) = &outcome.failure {
            failures.push(failure.to_string());
        }
        failures.extend(outcome.write_errors.iter().cloned());
        if let Err(e) = &loaded {
            failures.push(format!("loader '{}' failed: {e:#}", loader.identifier()));
        }
        if let Some(summary) = outcome.row_errors.summary() {
            failures.push(summary);
        }

        if failures.is_empty() {
            self.ctx.status.on_extracted();
            debug!(artifact = downloaded.name(), rows = outcome.rows, "Extracted artifact");
            let event = Event::ArtifactExtracted {
                execution_id: self.ctx.execution_id.clone(),
                artifact: downloaded.name().to_string(),
                rows: outcome.rows,
            };
            if let Err(e) = self.emit(event).await {
                self.report_error(Some(downloaded.name()), e.to_string()).await;
            }
        } else {
            self.report_error(Some(downloaded.name()), failures.join("; "))
                .await;
        }
        self.broadcast_status(false).await;
    }

    /// Drain the loader channel in order. Stops early on the first
    /// enrichment or validation failure; a failed chunk write is recorded
    /// and the stream goes on.
    async fn consume(&self, info: &ArtifactInfo, mut rx: Receiver<RowData>) -> ConsumeOutcome {
        let mut outcome = ConsumeOutcome::default();
        let extractor = self.collector.table.extractor();
        let mut skip_header = self.collector.config.skip_header;

        loop {
            let unit = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    outcome.failure = Some(SdkError::Cancelled);
                    break;
                }
                unit = rx.recv() => match unit {
                    Some(unit) => unit,
                    None => break,
                },
            };
            self.ctx.status.on_row_received();

            let rows = match self.transform(extractor.as_deref(), unit) {
                Ok(rows) => rows,
                Err(e) => {
                    outcome.row_errors.record(format_args!("{e:#}"));
                    continue;
                }
            };

            for mut row in rows {
                if skip_header {
                    skip_header = false;
                    continue;
                }
                outcome.rows += 1;
                let enrichment = match row.enrichment.take() {
                    Some(overrides) => info.enrichment.overlay(overrides),
                    None => info.enrichment.clone(),
                };

                if !self.collector.observers.is_empty() {
                    let event = Event::RowExtracted {
                        execution_id: self.ctx.execution_id.clone(),
                        artifact: info.name.clone(),
                        row_number: outcome.rows,
                    };
                    if let Err(e) = self.emit(event).await {
                        outcome.row_errors.record(e);
                    }
                }

                let enriched = match self.enrich(info, row, enrichment) {
                    Ok(enriched) => enriched,
                    Err(e) => {
                        outcome.failure = Some(e);
                        return outcome;
                    }
                };
                self.ctx.status.on_row_enriched();

                if let Some(pending) = self.ctx.buffer.push(enriched) {
                    let chunk_number = pending.chunk_number;
                    if let Err(e) = self.flush(pending).await {
                        outcome
                            .write_errors
                            .push(format!("writing chunk {chunk_number} failed: {e}"));
                    }
                }
            }
        }

        outcome
    }

    /// Table extractor first, then every mapper in order
    fn transform(&self, extractor: Option<&dyn Extractor>, unit: RowData) -> anyhow::Result<Vec<RowData>> {
        let mut rows = match extractor {
            Some(extractor) => extractor
                .extract(unit)
                .with_context(|| format!("extractor '{}'", extractor.identifier()))?,
            None => vec![unit],
        };

        for mapper in &self.collector.mappers {
            let mut mapped = Vec::with_capacity(rows.len());
            for row in rows {
                mapped.extend(
                    mapper
                        .map(row)
                        .with_context(|| format!("mapper '{}'", mapper.identifier()))?,
                );
            }
            rows = mapped;
        }
        Ok(rows)
    }

    /// Stamp run and artifact fields, let the table build the row, and validate it
    fn enrich(
        &self,
        info: &ArtifactInfo,
        row: RowData,
        mut enrichment: SourceEnrichment,
    ) -> Result<Box<dyn Row>> {
        let started = Instant::now();
        let fields = &mut enrichment.common_fields;
        fields.tp_table = self.collector.table.identifier().to_string();
        fields.tp_partition = self.collector.partition.clone();
        if fields.tp_source_type.is_empty() {
            fields.tp_source_type = self.collector.source.identifier().to_string();
        }
        if fields.tp_index.is_empty() {
            if let Some(index) = &info.index {
                fields.tp_index = index.clone();
            }
        }
        if fields.tp_timestamp == DateTime::<Utc>::UNIX_EPOCH {
            if let Some(ts) = info.timestamp {
                fields.set_timestamp(ts);
            }
        }

        let row = self
            .collector
            .table
            .enrich_row(row, enrichment)
            .map_err(|e| SdkError::Other(e.context(format!("enriching row of {}", info.name))))?;
        row.common_fields().validate()?;

        self.ctx.timing.add_active(Phase::Enrich, started.elapsed());
        Ok(row)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_row_errors_keep_first_message() {
        let mut errors = RowErrors::default();
        assert!(errors.summary().is_none());
        errors.record("bad json");
        errors.record("worse json");
        assert_eq!(
            errors.summary().unwrap(),
            "2 row(s) failed, first error: bad json"
        );
    }
}
