//! rowpipe Common Library
//!
//! Shared types, logging, and error handling for the rowpipe workspace.
//!
//! # Overview
//!
//! This crate provides functionality used by every rowpipe plugin:
//!
//! - **Error Handling**: [`SdkError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Types**: the standardized `tp_*` row metadata ([`types::CommonFields`])
//!   and the per-artifact [`types::SourceEnrichment`]
//!
//! # Example
//!
//! ```no_run
//! use rowpipe_common::types::{CommonFields, SourceEnrichment};
//!
//! let enrichment = SourceEnrichment::new(CommonFields {
//!     tp_source_type: "file".to_string(),
//!     ..Default::default()
//! });
//! assert_eq!(enrichment.common_fields.tp_source_type, "file");
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SdkError};
