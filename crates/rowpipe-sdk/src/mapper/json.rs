use super::Mapper;
use crate::artifact::RowData;
use anyhow::Context;
use serde_json::Value;

/// Parses string rows as JSON; rows that are already structured pass through
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMapper;

impl JsonMapper {
    pub const IDENTIFIER: &'static str = "json";
}

impl Mapper for JsonMapper {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn map(&self, row: RowData) -> anyhow::Result<Vec<RowData>> {
        let parsed = match &row.data {
            Value::String(text) => {
                serde_json::from_str(text).with_context(|| format!("Invalid JSON row: {}", preview(text)))?
            }
            _ => return Ok(vec![row]),
        };
        Ok(vec![row.map_data(parsed)])
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
