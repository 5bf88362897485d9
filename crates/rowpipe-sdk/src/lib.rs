//! Rowpipe SDK
//!
//! Collects artifacts from a source, streams them through loaders and
//! mappers, enriches every row for a table, and writes the rows out in
//! fixed-size JSONL chunks.
//!
//! # Example
//!
//! ```no_run
//! use rowpipe_sdk::prelude::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let table = Arc::new(DynamicTable::new(DynamicTableConfig::new("access_log"))?);
//!     let source = Arc::new(FileSystemSource::new(
//!         FileSourceConfig::new("./logs")
//!             .layout("%{YEAR:year}/%{MONTHNUM:month}/%{DATA:name}.jsonl"),
//!     )?);
//!
//!     let collector = Collector::builder(table, source)
//!         .partition("prod")
//!         .mapper(Arc::new(JsonMapper))
//!         .build()
//!         .await?;
//!     let summary = collector.collect(CancellationToken::new()).await?;
//!     println!("wrote {} rows", summary.rows_written());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod artifact;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod filter;
pub mod gate;
pub mod loader;
pub mod mapper;
pub mod observer;
pub mod pattern;
pub mod registry;
pub mod source;
pub mod state;
pub mod status;
pub mod table;
pub mod timing;
pub mod tracker;
pub mod writer;

pub use collector::{CollectionSummary, Collector, CollectorBuilder};
pub use config::CollectorConfig;
pub use registry::{PartitionConfig, PluginConfig, PluginRegistry};
pub use rowpipe_common::{Result, SdkError};

/// Commonly used types
pub mod prelude {
    pub use crate::artifact::{ArtifactInfo, DownloadedArtifactInfo, RowData};
    pub use crate::collector::{CollectionSummary, Collector, CollectorBuilder};
    pub use crate::config::{CollectorConfig, RateLimitConfig};
    pub use crate::gate::{ConcurrencyGate, SemaphoreGate, TokenBucketGate};
    pub use crate::loader::{Loader, LoaderKind};
    pub use crate::mapper::{Extractor, JsonMapper, Mapper, PatternMapper};
    pub use crate::observer::{ChannelObserver, Event, Observer};
    pub use crate::registry::{PartitionConfig, PluginConfig, PluginRegistry};
    pub use crate::source::{ArtifactCallbacks, ArtifactSource, FileSourceConfig, FileSystemSource};
    pub use crate::state::{CollectionState, Granularity, TimeRangeCollectionState};
    pub use crate::table::{DynamicTable, DynamicTableConfig, Row, Table};
    pub use crate::writer::{Chunk, ChunkWriter, JsonlFileWriter};
    pub use rowpipe_common::types::{CommonFields, SourceEnrichment};
    pub use rowpipe_common::{Result, SdkError};
}
