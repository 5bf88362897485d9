//! Row transformation stages between the loader and enrichment
//!
//! An [`Extractor`] splits one decoded unit into many (e.g. the `Records`
//! array of a CloudTrail object), a [`Mapper`] reshapes each unit. Both may
//! return zero rows to drop the input.

mod array;
mod json;
mod pattern;

pub use array::ArrayExtractor;
pub use json::JsonMapper;
pub use pattern::PatternMapper;

use crate::artifact::RowData;

pub trait Mapper: Send + Sync {
    fn identifier(&self) -> &str;

    fn map(&self, row: RowData) -> anyhow::Result<Vec<RowData>>;
}

pub trait Extractor: Send + Sync {
    fn identifier(&self) -> &str;

    fn extract(&self, row: RowData) -> anyhow::Result<Vec<RowData>>;
}
