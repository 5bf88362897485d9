//! Tables turn raw rows into enriched, typed rows

mod dynamic;

pub use dynamic::{DynamicRow, DynamicTable, DynamicTableConfig};

use crate::artifact::RowData;
use crate::mapper::Extractor;
use rowpipe_common::types::{CommonFields, SourceEnrichment};
use std::fmt;
use std::io::Write;
use std::sync::Arc;

/// An enriched row ready for the output buffer
pub trait Row: Send + Sync + fmt::Debug {
    fn common_fields(&self) -> &CommonFields;

    /// Serialize as a single JSON document without a trailing newline
    fn write_json(&self, out: &mut dyn Write) -> serde_json::Result<()>;
}

pub trait Table: Send + Sync {
    /// Table name, stamped onto every row as `tp_table`
    fn identifier(&self) -> &str;

    /// Source identifiers this table can collect from; empty accepts any
    fn supported_sources(&self) -> Vec<String> {
        Vec::new()
    }

    /// Splits each decoded unit before the mappers run
    fn extractor(&self) -> Option<Arc<dyn Extractor>> {
        None
    }

    /// Build the output row.
    ///
    /// `enrichment` arrives with `tp_table`, `tp_partition` and the
    /// artifact-level fields already set.
    fn enrich_row(&self, row: RowData, enrichment: SourceEnrichment) -> anyhow::Result<Box<dyn Row>>;
}
