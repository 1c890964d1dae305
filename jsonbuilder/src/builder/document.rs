//! The built document and its JSON serialization.

use std::fs;
use std::path::Path;

use log::info;
use serde_json::Value as Json;

use crate::error::JsonBuilderResult;
use crate::models::Value;

/// Result of a build.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    value: Value,
}

impl Document {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Dates become ISO strings, NaN becomes null, anything else without a
    /// JSON form becomes its string rendering.
    pub fn to_json(&self) -> Json {
        self.value.to_json()
    }

    /// Serialize to text; `pretty` uses two-space indentation.
    pub fn to_json_string(&self, pretty: bool) -> JsonBuilderResult<String> {
        info!("Dumping tree to JSON");
        let text = if pretty {
            serde_json::to_string_pretty(&self.value)?
        } else {
            serde_json::to_string(&self.value)?
        };
        Ok(text)
    }

    /// Write the serialized document to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>, pretty: bool) -> JsonBuilderResult<()> {
        let path = path.as_ref();
        let text = self.to_json_string(pretty)?;
        fs::write(path, text)?;
        info!("Wrote {}", path.display());
        Ok(())
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}
