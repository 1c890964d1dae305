//! Error types for the jsonbuilder pipeline.
//!
//! One enum per layer, innermost first:
//!
//! - [`TableError`] - loading and manipulating the tabular dataset
//! - [`ExprError`] - compiling and running filter/transmute expressions
//! - [`MappingError`] - turning a mapping description into a node tree
//! - [`SetupError`] - registered functions and pre-build table transforms
//! - [`BuildError`] - the tree-building pass itself
//! - [`Error`] - top-level, returned by [`crate::Tree`]
//!
//! Conversions are provided via `From` so `?` works across boundaries.
//! Nothing in the pipeline recovers locally: every error aborts the build.

use thiserror::Error;

// =============================================================================
// Table Errors
// =============================================================================

/// Errors while loading or reshaping a table.
#[derive(Debug, Error)]
pub enum TableError {
    /// Failed to read the source file.
    #[error("failed to read table: {0}")]
    Io(#[from] std::io::Error),

    /// Delimited text could not be parsed.
    #[error("invalid delimited text: {0}")]
    Csv(#[from] csv::Error),

    /// Workbook could not be parsed.
    #[cfg(feature = "excel")]
    #[error("invalid workbook: {0}")]
    Excel(#[from] calamine::Error),

    /// Source is empty (no header line).
    #[error("table is empty")]
    Empty,

    /// The file extension names a format this build cannot read.
    #[error("unsupported table format '{0}' (enable the `excel` feature for workbooks)")]
    UnsupportedFormat(String),

    /// Requested sheet does not exist.
    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    /// Delimiter option is not a single ASCII character.
    #[error("invalid delimiter '{0}': expected a single ASCII character")]
    Delimiter(String),

    /// Unknown text encoding requested.
    #[error("unknown encoding: {0}")]
    Encoding(String),

    /// A row has a different width than the header.
    #[error("row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// A referenced column does not exist.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// A column does not line up with the table it is merged into.
    #[error("column '{name}' has {found} values, table has {expected} rows")]
    ColumnLength {
        name: String,
        expected: usize,
        found: usize,
    },
}

// =============================================================================
// Expression Errors
// =============================================================================

/// Errors from the expression evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// Source text does not parse.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    /// A name is not bound anywhere.
    #[error("name '{0}' is not defined")]
    UnknownName(String),

    /// A called function does not exist.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Operand or argument of the wrong type.
    #[error("type error: {0}")]
    Type(String),

    /// Wrong number of arguments.
    #[error("{function}() takes {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },

    /// Attribute, key or index lookup failed.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// Malformed calendar-offset token.
    #[error("invalid delta-string: {0}")]
    InvalidDeltaString(String),

    /// Unparseable date.
    #[error("invalid date: {0}")]
    InvalidDate(String),

    /// Invalid regular expression.
    #[error("invalid regex: {0}")]
    Regex(String),

    /// Arithmetic failure (division by zero, overflow, date out of range).
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    /// Too many nested function calls.
    #[error("maximum call depth ({0}) exceeded")]
    RecursionLimit(usize),

    /// Table-level operation failed inside an expression.
    #[error("table error: {0}")]
    Table(String),
}

impl From<TableError> for ExprError {
    fn from(err: TableError) -> Self {
        ExprError::Table(err.to_string())
    }
}

// =============================================================================
// Mapping Errors
// =============================================================================

/// Errors while parsing a mapping description into a node tree.
#[derive(Debug, Error)]
pub enum MappingError {
    /// `type` names something other than object/array/primitive.
    #[error("invalid node type: '{0}'")]
    InvalidNodeType(String),

    /// A node description is not a JSON object, or a field has the wrong shape.
    #[error("invalid node at {path}: {message}")]
    InvalidNode { path: String, message: String },

    /// A field that the node kind cannot use.
    #[error("field '{field}' is not allowed on {kind} node at {path}")]
    FieldNotAllowed {
        path: String,
        kind: &'static str,
        field: &'static str,
    },

    /// Children of an object must be named.
    #[error("child of object node at {0} has no name")]
    MissingName(String),

    /// Filter or transmute expression failed to compile.
    #[error("failed to compile {field} '{expression}' at {path}: {source}")]
    Compile {
        path: String,
        field: &'static str,
        expression: String,
        #[source]
        source: ExprError,
    },

    /// Format file is not valid JSON for the expected shape.
    #[error("invalid mapping description: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Setup Errors
// =============================================================================

/// Errors raised before the build: registered functions and table transforms.
#[derive(Debug, Error)]
pub enum SetupError {
    /// A registered function failed to compile (or its definition failed to run).
    #[error("failed to load function '{source_text}': {source}")]
    FunctionCompile {
        source_text: String,
        #[source]
        source: ExprError,
    },

    /// A table transform failed to evaluate.
    #[error("failed to apply transform '{expression}': {source}")]
    Transform {
        expression: String,
        #[source]
        source: ExprError,
    },

    /// A table transform returned something other than a table or a column.
    #[error(
        "invalid return type from df_transform: {expression}\nwith return type: {found}\nshould be one of: column, table"
    )]
    TransformType { expression: String, found: String },

    /// A returned column could not be merged into the table.
    #[error("failed to merge column from transform '{expression}': {source}")]
    Merge {
        expression: String,
        #[source]
        source: TableError,
    },
}

// =============================================================================
// Build Errors
// =============================================================================

/// Errors during the tree-building pass. All are fatal.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Filter expression failed.
    #[error("failed to apply filter '{expression}' on {node} ({}): {source}", row_label(.row))]
    FilterEvaluation {
        node: String,
        expression: String,
        row: Option<usize>,
        #[source]
        source: ExprError,
    },

    /// Column missing from the current row.
    #[error("failed to fetch data from column '{column}' while building {node} ({})", row_label(.row))]
    ColumnLookup {
        node: String,
        column: String,
        row: Option<usize>,
    },

    /// Transmute expression failed.
    #[error("failed to transmute {node} ({}): '{expression}': {source}", row_label(.row))]
    TransmuteEvaluation {
        node: String,
        expression: String,
        row: Option<usize>,
        #[source]
        source: ExprError,
    },

    /// Group-by failed (unknown column).
    #[error("failed to group_by {columns:?} on {node}: {source}")]
    GroupBy {
        node: String,
        columns: Vec<String>,
        #[source]
        source: TableError,
    },

    /// A phase needs a row-set but the parent iterates row by row.
    #[error("cannot {phase} on {node}: no row-set in scope (parent iterates row by row)")]
    MissingRowSet { node: String, phase: &'static str },
}

fn row_label(row: &Option<usize>) -> String {
    match row {
        Some(index) => format!("row {}", index),
        None => "no row".to_string(),
    }
}

// =============================================================================
// Top-level Errors
// =============================================================================

/// Top-level error returned by [`crate::Tree`] and the CLI helpers.
#[derive(Debug, Error)]
pub enum Error {
    /// Table loading error.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Mapping parse error.
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Function/transform setup error.
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),

    /// Build error.
    #[error("build error: {0}")]
    Build(#[from] BuildError),

    /// Expression error outside of a node (e.g. a standalone delta).
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for table operations.
pub type TableResult<T> = Result<T, TableError>;

/// Result type for expression operations.
pub type ExprResult<T> = Result<T, ExprError>;

/// Result type for mapping parsing.
pub type MappingResult<T> = Result<T, MappingError>;

/// Result type for pre-build setup.
pub type SetupResult<T> = Result<T, SetupError>;

/// Result type for the build pass.
pub type BuildResult<T> = Result<T, BuildError>;

/// Result type for top-level operations.
pub type JsonBuilderResult<T> = Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_chain() {
        let table_err = TableError::Empty;
        let err: Error = table_err.into();
        assert!(err.to_string().contains("empty"));

        let build_err = BuildError::ColumnLookup {
            node: "$.curves[].id".into(),
            column: "ccy".into(),
            row: Some(3),
        };
        let err: Error = build_err.into();
        let msg = err.to_string();
        assert!(msg.contains("ccy"));
        assert!(msg.contains("row 3"));
    }

    #[test]
    fn test_transmute_error_format() {
        let err = BuildError::TransmuteEvaluation {
            node: "$.rate".into(),
            expression: "x * 100".into(),
            row: None,
            source: ExprError::Type("cannot multiply str and int".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("$.rate"));
        assert!(msg.contains("no row"));
        assert!(msg.contains("x * 100"));
    }

    #[test]
    fn test_transform_type_names_expression() {
        let err = SetupError::TransformType {
            expression: "len(df)".into(),
            found: "int".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("len(df)"));
        assert!(msg.contains("int"));
    }
}
