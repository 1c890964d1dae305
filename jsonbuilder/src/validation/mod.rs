//! JSON Schema validation of built documents.
//!
//! Schemas are supplied by the caller (for example `build --schema`) and
//! checked with JSON Schema Draft 7. Validation reports every violation, not
//! just the first.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use jsonbuilder::validation::validate;
//!
//! let schema = json!({
//!     "type": "array",
//!     "items": { "type": "object", "required": ["id"] }
//! });
//!
//! assert!(validate(&schema, &json!([{ "id": "USD" }])).is_ok());
//! assert!(validate(&schema, &json!([{ "ccy": "USD" }])).is_err());
//! ```

use std::fs;
use std::path::Path;

use log::{error, info, warn};
use serde_json::Value;

use crate::builder::Document;
use crate::error::JsonBuilderResult;

/// Validate `data` against `schema`.
///
/// Returns every violation as a message. An invalid schema is reported as a
/// single message.
pub fn validate(schema: &Value, data: &Value) -> Result<(), Vec<String>> {
    let validator =
        jsonschema::draft7::new(schema).map_err(|e| vec![format!("invalid schema: {}", e)])?;

    let errors: Vec<String> = validator.iter_errors(data).map(|e| e.to_string()).collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Like [`validate`], without the messages.
pub fn is_valid(schema: &Value, data: &Value) -> bool {
    jsonschema::draft7::is_valid(schema, data)
}

/// Read a schema file.
pub fn load_schema(path: impl AsRef<Path>) -> JsonBuilderResult<Value> {
    let path = path.as_ref();
    info!("Reading schema {}", path.display());
    let text = fs::read_to_string(path).map_err(|e| {
        error!("Failed to read schema {}: {}", path.display(), e);
        e
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Validate a built document, logging each violation.
pub fn validate_document(schema: &Value, document: &Document) -> Result<(), Vec<String>> {
    validate(schema, &document.to_json()).map_err(|errors| {
        for message in &errors {
            warn!("Schema violation: {}", message);
        }
        errors
    })
}
