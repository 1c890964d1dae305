//! The format file: mapping tree plus build configuration.

use std::fs;
use std::path::Path;

use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{JsonBuilderResult, MappingError};
use crate::table::TableOptions;

/// Everything a build needs besides the table.
///
/// Unknown top-level keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Format {
    /// Root node description. Parsed into a node tree by
    /// [`parse_mapping`](super::parse_mapping).
    #[serde(default = "empty_mapping")]
    pub mapping: Json,

    /// Definitions installed before anything else runs.
    #[serde(default)]
    pub functions: Vec<String>,

    /// Whole-table transforms, applied in order before the build.
    #[serde(default)]
    pub df_transforms: Vec<String>,

    /// Keep column headers exactly as they appear in the file.
    #[serde(default)]
    pub raw_header: bool,

    /// Options for the table loader.
    #[serde(default)]
    pub table_kwargs: TableOptions,
}

fn empty_mapping() -> Json {
    Json::Object(serde_json::Map::new())
}

impl Default for Format {
    fn default() -> Self {
        Self {
            mapping: empty_mapping(),
            functions: Vec::new(),
            df_transforms: Vec::new(),
            raw_header: false,
            table_kwargs: TableOptions::default(),
        }
    }
}

impl Format {
    /// Wrap a bare mapping description.
    pub fn with_mapping(mapping: Json) -> Self {
        Self {
            mapping,
            ..Self::default()
        }
    }

    pub fn from_json(json: Json) -> Result<Self, MappingError> {
        Ok(serde_json::from_value(json)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, MappingError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a format file.
    pub fn from_path(path: impl AsRef<Path>) -> JsonBuilderResult<Self> {
        let path = path.as_ref();
        info!("Reading format file {}", path.display());
        let text = fs::read_to_string(path).map_err(|e| {
            error!("Failed to read format file {}: {}", path.display(), e);
            e
        })?;
        Self::from_json_str(&text).map_err(|e| {
            error!("Invalid format file {}: {}", path.display(), e);
            e.into()
        })
    }
}
