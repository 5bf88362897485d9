//! Common types used across rowpipe

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, SdkError};

/// Standardized metadata attached to every collected row.
///
/// Sources fill in what they know about an artifact (source type, name,
/// location), the collector stamps run-scoped values (table, partition) and
/// the table's enrichment fills in the per-row values (id, timestamps, index).
/// A row is only accepted into the output buffer once [`CommonFields::validate`]
/// passes.
///
/// # Examples
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use rowpipe_common::types::CommonFields;
///
/// let ts = Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 0).unwrap();
/// let mut fields = CommonFields {
///     tp_id: "cq2l4c1o0000".to_string(),
///     tp_source_type: "file".to_string(),
///     tp_table: "access_log".to_string(),
///     tp_partition: "prod".to_string(),
///     tp_index: "default".to_string(),
///     tp_ingest_timestamp: Utc::now(),
///     ..Default::default()
/// };
/// fields.set_timestamp(ts);
/// assert!(fields.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommonFields {
    /// Unique row identifier
    #[serde(default)]
    pub tp_id: String,

    /// Identifier of the source the row was collected from (e.g. "file")
    #[serde(default)]
    pub tp_source_type: String,

    /// Time the row was collected
    #[serde(default)]
    pub tp_ingest_timestamp: DateTime<Utc>,

    /// Time the event described by the row occurred
    #[serde(default)]
    pub tp_timestamp: DateTime<Utc>,

    /// Table the row belongs to
    #[serde(default)]
    pub tp_table: String,

    /// Partition the row was collected for
    #[serde(default)]
    pub tp_partition: String,

    /// Index key used to shard rows inside a partition
    #[serde(default)]
    pub tp_index: String,

    /// Event date, always truncated to midnight UTC
    #[serde(default)]
    pub tp_date: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_source_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_destination_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_source_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_source_location: Option<String>,

    // Searchable tag arrays
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tp_akas: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tp_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tp_tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tp_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tp_emails: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tp_usernames: Vec<String>,
}

impl CommonFields {
    /// Set the event timestamp and derive `tp_date` from it
    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.tp_timestamp = timestamp;
        self.tp_date = truncate_to_day(timestamp);
    }

    /// Check that every mandatory field is populated.
    ///
    /// All offending fields are reported at once rather than the first one.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if self.tp_id.is_empty() {
            missing.push("tp_id");
        }
        if self.tp_source_type.is_empty() {
            missing.push("tp_source_type");
        }
        if is_zero(&self.tp_ingest_timestamp) {
            missing.push("tp_ingest_timestamp");
        }
        if is_zero(&self.tp_timestamp) {
            missing.push("tp_timestamp");
        }
        if self.tp_table.is_empty() {
            missing.push("tp_table");
        }
        if self.tp_partition.is_empty() {
            missing.push("tp_partition");
        }
        if self.tp_index.is_empty() {
            missing.push("tp_index");
        }
        if is_zero(&self.tp_date) || truncate_to_day(self.tp_date) != self.tp_date {
            missing.push("tp_date");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SdkError::Validation {
                fields: missing.into_iter().map(String::from).collect(),
            })
        }
    }

    /// Copy every source-level value that is set on `other` onto `self`.
    ///
    /// Row-level fields (id, timestamps, index) are never touched.
    pub fn merge_source_fields(&mut self, other: &CommonFields) {
        if !other.tp_source_type.is_empty() {
            self.tp_source_type = other.tp_source_type.clone();
        }
        if !other.tp_table.is_empty() {
            self.tp_table = other.tp_table.clone();
        }
        if !other.tp_partition.is_empty() {
            self.tp_partition = other.tp_partition.clone();
        }
        if other.tp_source_name.is_some() {
            self.tp_source_name = other.tp_source_name.clone();
        }
        if other.tp_source_location.is_some() {
            self.tp_source_location = other.tp_source_location.clone();
        }
        self.tp_tags
            .extend(other.tp_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Enrichment a source attaches to every row of one artifact
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceEnrichment {
    /// Source-level common fields
    pub common_fields: CommonFields,

    /// Free-form metadata, e.g. the properties parsed from the artifact path
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SourceEnrichment {
    pub fn new(common_fields: CommonFields) -> Self {
        Self {
            common_fields,
            metadata: HashMap::new(),
        }
    }

    /// This enrichment with every value set on a per-row override layered on top
    pub fn overlay(&self, row: SourceEnrichment) -> SourceEnrichment {
        let mut merged = self.clone();
        let fields = &mut merged.common_fields;
        fields.merge_source_fields(&row.common_fields);
        if !row.common_fields.tp_index.is_empty() {
            fields.tp_index = row.common_fields.tp_index;
        }
        if !is_zero(&row.common_fields.tp_timestamp) {
            fields.set_timestamp(row.common_fields.tp_timestamp);
        }
        merged.metadata.extend(row.metadata);
        merged
    }
}

/// Truncate a timestamp to midnight UTC of the same day
pub fn truncate_to_day(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .duration_trunc(TimeDelta::days(1))
        .unwrap_or(timestamp)
}

fn is_zero(timestamp: &DateTime<Utc>) -> bool {
    *timestamp == DateTime::<Utc>::UNIX_EPOCH
}
