//! Artifact and row data types that flow through the collection pipeline

use chrono::{DateTime, Utc};
use rowpipe_common::types::SourceEnrichment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A discoverable unit of source data (file, object, log stream)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Name used to locate the artifact (e.g. a path or object key)
    pub name: String,
    /// Name as reported by the source, before any local renaming
    pub original_name: String,
    /// Properties parsed from the artifact path using the source layout
    pub properties: HashMap<String, String>,
    /// Timestamp derived from the properties, when the layout has time fields
    pub timestamp: Option<DateTime<Utc>>,
    /// Index key used for every row of this artifact
    pub index: Option<String>,
    /// Enrichment inherited by every row of this artifact
    pub enrichment: SourceEnrichment,
}

impl ArtifactInfo {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            original_name: name.clone(),
            name,
            ..Default::default()
        }
    }

    pub fn with_enrichment(mut self, enrichment: SourceEnrichment) -> Self {
        self.enrichment = enrichment;
        self
    }

    /// Attach the properties parsed from the artifact path.
    ///
    /// The timestamp is derived from the time fields and the `index`
    /// property, when present, becomes the index key.
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.timestamp = crate::pattern::timestamp_from_properties(&properties);
        if let Some(index) = properties.get("index") {
            self.index = Some(index.clone());
        }
        self.enrichment.metadata.extend(properties.clone());
        self.properties = properties;
        self
    }

    /// File extension(s) of the artifact name, lowercased (e.g. "jsonl.gz")
    pub fn extension(&self) -> String {
        let file_name = self.name.rsplit('/').next().unwrap_or(&self.name);
        match file_name.split_once('.') {
            Some((_, ext)) => ext.to_lowercase(),
            None => String::new(),
        }
    }
}

/// An artifact whose content is available in local storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedArtifactInfo {
    pub info: ArtifactInfo,
    pub local_path: PathBuf,
    pub size: u64,
}

impl DownloadedArtifactInfo {
    pub fn new(info: ArtifactInfo, local_path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            info,
            local_path: local_path.into(),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

/// One decoded unit produced by a loader
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    /// Raw payload; line loaders emit `Value::String`
    pub data: serde_json::Value,
    /// Per-row enrichment overriding the artifact's enrichment
    pub enrichment: Option<SourceEnrichment>,
}

impl RowData {
    pub fn new(data: impl Into<serde_json::Value>) -> Self {
        Self {
            data: data.into(),
            enrichment: None,
        }
    }

    pub fn with_enrichment(mut self, enrichment: SourceEnrichment) -> Self {
        self.enrichment = Some(enrichment);
        self
    }

    /// Replace the payload, keeping any per-row enrichment
    pub fn map_data(self, data: serde_json::Value) -> Self {
        Self {
            data,
            enrichment: self.enrichment,
        }
    }
}
