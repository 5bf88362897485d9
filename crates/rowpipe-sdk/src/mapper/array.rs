use super::Extractor;
use crate::artifact::RowData;
use rowpipe_common::{Result, SdkError};
use serde_json::Value;

/// Emits one row per element of the array at a JSON pointer (e.g. `/Records`)
#[derive(Debug, Clone)]
pub struct ArrayExtractor {
    pointer: String,
}

impl ArrayExtractor {
    pub const IDENTIFIER: &'static str = "array";

    pub fn new(pointer: impl Into<String>) -> Result<Self> {
        let pointer = pointer.into();
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(SdkError::config(format!(
                "JSON pointer must be empty or start with '/': {pointer}"
            )));
        }
        Ok(Self { pointer })
    }
}

impl Extractor for ArrayExtractor {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn extract(&self, row: RowData) -> anyhow::Result<Vec<RowData>> {
        let RowData { data, enrichment } = row;
        let mut data = match data {
            Value::String(text) => serde_json::from_str(&text)?,
            other => other,
        };

        match data.pointer_mut(&self.pointer).map(Value::take) {
            Some(Value::Array(items)) => Ok(items
                .into_iter()
                .map(|item| RowData {
                    data: item,
                    enrichment: enrichment.clone(),
                })
                .collect()),
            // a missing array means an object with no records
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(other) => anyhow::bail!(
                "expected an array at '{}', found {}",
                self.pointer,
                type_name(&other)
            ),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
