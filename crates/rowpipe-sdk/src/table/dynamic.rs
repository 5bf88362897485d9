use super::{Row, Table};
use crate::artifact::RowData;
use crate::mapper::{ArrayExtractor, Extractor};
use crate::pattern::{epoch_to_datetime, parse_timestamp};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rowpipe_common::types::{CommonFields, SourceEnrichment};
use rowpipe_common::{Result, SdkError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;

const DEFAULT_INDEX: &str = "default";

/// Configuration for a table whose columns are whatever the rows contain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicTableConfig {
    pub name: String,
    /// Field holding the event time (RFC 3339, HTTP date or unix seconds/millis)
    #[serde(default)]
    pub timestamp_field: Option<String>,
    /// Field holding the index key; falls back to the artifact's index
    #[serde(default)]
    pub index_field: Option<String>,
    /// JSON pointer to an array of records inside each decoded unit
    #[serde(default)]
    pub records_pointer: Option<String>,
    #[serde(default)]
    pub supported_sources: Vec<String>,
}

impl DynamicTableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp_field: None,
            index_field: None,
            records_pointer: None,
            supported_sources: Vec::new(),
        }
    }

    pub fn timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn index_field(mut self, field: impl Into<String>) -> Self {
        self.index_field = Some(field.into());
        self
    }

    pub fn records_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.records_pointer = Some(pointer.into());
        self
    }
}

/// A JSON object row with the common fields flattened alongside its columns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicRow {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

impl Row for DynamicRow {
    fn common_fields(&self) -> &CommonFields {
        &self.common
    }

    fn write_json(&self, out: &mut dyn Write) -> serde_json::Result<()> {
        serde_json::to_writer(out, self)
    }
}

pub struct DynamicTable {
    config: DynamicTableConfig,
    extractor: Option<Arc<dyn Extractor>>,
}

impl DynamicTable {
    pub fn new(config: DynamicTableConfig) -> Result<Self> {
        if config.name.trim().is_empty() {
            return Err(SdkError::config("table name must not be empty"));
        }
        let extractor = match &config.records_pointer {
            Some(pointer) => Some(Arc::new(ArrayExtractor::new(pointer.clone())?) as Arc<dyn Extractor>),
            None => None,
        };
        Ok(Self { config, extractor })
    }

    pub fn config(&self) -> &DynamicTableConfig {
        &self.config
    }

    fn event_time(&self, columns: &Map<String, Value>) -> anyhow::Result<Option<DateTime<Utc>>> {
        let Some(field) = &self.config.timestamp_field else {
            return Ok(None);
        };
        let value = columns
            .get(field)
            .with_context(|| format!("row has no '{}' field", field))?;
        let ts = match value {
            Value::String(s) => parse_timestamp(s),
            Value::Number(n) => n.as_i64().and_then(epoch_to_datetime),
            _ => None,
        };
        ts.map(Some)
            .with_context(|| format!("'{}' is not a valid timestamp: {}", field, value))
    }
}

impl std::fmt::Debug for DynamicTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicTable")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Table for DynamicTable {
    fn identifier(&self) -> &str {
        &self.config.name
    }

    fn supported_sources(&self) -> Vec<String> {
        self.config.supported_sources.clone()
    }

    fn extractor(&self) -> Option<Arc<dyn Extractor>> {
        self.extractor.clone()
    }

    fn enrich_row(&self, row: RowData, enrichment: SourceEnrichment) -> anyhow::Result<Box<dyn Row>> {
        let mut columns = match row.data {
            Value::Object(map) => map,
            Value::String(text) => Map::from_iter([("message".to_string(), Value::String(text))]),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        // tp_* names belong to the common fields
        columns.retain(|key, _| !key.starts_with("tp_"));

        let mut common = enrichment.common_fields;
        common.tp_id = uuid::Uuid::new_v4().to_string();
        common.tp_ingest_timestamp = Utc::now();

        if let Some(ts) = self.event_time(&columns)? {
            common.set_timestamp(ts);
        } else if common.tp_timestamp == DateTime::<Utc>::UNIX_EPOCH {
            common.set_timestamp(common.tp_ingest_timestamp);
        }

        let index = self
            .config
            .index_field
            .as_ref()
            .and_then(|field| columns.get(field))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        if let Some(index) = index {
            common.tp_index = index;
        } else if common.tp_index.is_empty() {
            common.tp_index = DEFAULT_INDEX.to_string();
        }

        Ok(Box::new(DynamicRow { common, columns }))
    }
}
