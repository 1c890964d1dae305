//! # jsonbuilder - structured JSON documents from tabular data
//!
//! A format file describes the output document as a tree of object, array and
//! primitive nodes. Each node can narrow the rows it sees (`filter`), fan out
//! over groups or rows (`group_by`, `iterate`), read a column of the current
//! row, and rewrite its value with an expression (`transmute`).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ CSV / Excel │────▶│    Table    │────▶│    Tree     │────▶│  JSON text  │
//! │  (any enc)  │     │ (transforms)│     │  (mapping)  │     │ (document)  │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use jsonbuilder::{BuildOptions, Format, Table, Tree};
//! use serde_json::json;
//!
//! let format = Format::with_mapping(json!({
//!     "type": "array",
//!     "children": [{
//!         "type": "object",
//!         "iterate": true,
//!         "children": [{ "name": "id", "column": "ccy" }]
//!     }]
//! }));
//! let table = Table::new(
//!     vec!["ccy".into()],
//!     vec![vec!["USD".into()], vec!["EUR".into()]],
//! )
//! .unwrap();
//!
//! let tree = Tree::from_table(&format, table, &BuildOptions::default()).unwrap();
//! let doc = tree.build().unwrap();
//! assert_eq!(doc.to_json(), json!([{ "id": "USD" }, { "id": "EUR" }]));
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Error types per layer
//! - [`models`] - Runtime values and calendar deltas
//! - [`table`] - In-memory table and file loader
//! - [`expr`] - Expression language for filters and transmutes
//! - [`mapping`] - Format file and mapping node tree
//! - [`builder`] - Tree building and the output document
//! - [`infer`] - Mapping inference from an example document
//! - [`validation`] - JSON Schema validation of output

// Core modules
pub mod error;
pub mod models;

// Input
pub mod table;

// Expressions
pub mod expr;

// Mapping and building
pub mod builder;
pub mod mapping;

// Tooling
pub mod infer;
pub mod validation;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    BuildError, Error, ExprError, JsonBuilderResult, MappingError, SetupError, TableError,
};

// =============================================================================
// Re-exports - Values and tables
// =============================================================================

pub use models::{Delta, Map, Value};
pub use table::{load_table, Column, Row, Table, TableOptions};

// =============================================================================
// Re-exports - Expressions
// =============================================================================

pub use expr::{Bindings, Evaluator, Interpreter};

// =============================================================================
// Re-exports - Mapping and building
// =============================================================================

pub use builder::{BuildOptions, Document, Tree};
pub use mapping::{parse_mapping, Format, Node, NodeKind};

// =============================================================================
// Re-exports - Tooling
// =============================================================================

pub use infer::{infer_format, json_to_mapping};
pub use validation::{is_valid, load_schema, validate, validate_document};
