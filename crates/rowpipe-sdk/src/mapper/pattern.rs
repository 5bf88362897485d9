use super::Mapper;
use crate::artifact::RowData;
use crate::pattern::Pattern;
use rowpipe_common::Result;
use serde_json::{Map, Value};

/// Parses text rows with a grok-style pattern into an object of captures.
///
/// Lines that do not match are an error for that row.
#[derive(Debug, Clone)]
pub struct PatternMapper {
    pattern: Pattern,
}

impl PatternMapper {
    pub const IDENTIFIER: &'static str = "pattern";

    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Pattern::compile(pattern)?,
        })
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }
}

impl Mapper for PatternMapper {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn map(&self, row: RowData) -> anyhow::Result<Vec<RowData>> {
        let Some(text) = row.data.as_str() else {
            anyhow::bail!("pattern mapper expects text rows, got {}", row.data);
        };
        let Some(captures) = self.pattern.captures(text) else {
            anyhow::bail!("row does not match '{}'", self.pattern.source());
        };

        let object: Map<String, Value> = captures
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Ok(vec![row.map_data(Value::Object(object))])
    }
}
