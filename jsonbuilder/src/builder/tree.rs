//! Build orchestration.
//!
//! A [`Tree`] is prepared in a fixed order: the evaluator's base environment
//! (reference date, then the format's `functions`), the mapping, the table,
//! and finally the `df_transforms`. Every step is fatal on failure, so a
//! constructed tree is always ready to build.

use std::path::Path;

use chrono::NaiveDate;
use log::{debug, error, info};

use super::engine::Engine;
use super::snapshot::snapshot;
use super::Document;
use crate::error::{JsonBuilderResult, SetupError, SetupResult};
use crate::expr::{Bindings, Evaluator, Interpreter};
use crate::mapping::{parse_mapping, Format, Node};
use crate::models::Value;
use crate::table::{load_table, Table};

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Value of `today`; the current local date when unset.
    pub date: Option<NaiveDate>,
    /// 1-based row to centre the diagnostic snapshots on.
    pub inspect_row: Option<usize>,
}

impl BuildOptions {
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_inspect_row(mut self, row: usize) -> Self {
        self.inspect_row = Some(row);
        self
    }

    fn interpreter(&self) -> Interpreter {
        match self.date {
            Some(date) => Interpreter::new(date),
            None => Interpreter::default(),
        }
    }
}

/// A parsed mapping bound to a prepared table.
#[derive(Debug)]
pub struct Tree<E: Evaluator = Interpreter> {
    evaluator: E,
    root: Node<E::Program>,
    table: Table,
    snapshots: Vec<Table>,
}

impl Tree<Interpreter> {
    /// Load the table at `table_path` and prepare a tree for `format`.
    pub fn new(
        format: &Format,
        table_path: impl AsRef<Path>,
        options: &BuildOptions,
    ) -> JsonBuilderResult<Self> {
        let mut evaluator = options.interpreter();
        load_functions(&mut evaluator, &format.functions)?;
        let root = parse_mapping(&format.mapping, &evaluator)?;

        let table_path = table_path.as_ref();
        info!("Loading table {}", table_path.display());
        let table =
            load_table(table_path, &format.table_kwargs, format.raw_header).map_err(|e| {
                error!("Failed to load table {}: {}", table_path.display(), e);
                e
            })?;

        Self::prepare(evaluator, root, table, format, options.inspect_row)
    }

    /// Prepare a tree over an already loaded table.
    pub fn from_table(
        format: &Format,
        table: Table,
        options: &BuildOptions,
    ) -> JsonBuilderResult<Self> {
        Self::with_evaluator(options.interpreter(), format, table, options.inspect_row)
    }
}

impl<E: Evaluator> Tree<E> {
    /// Prepare a tree with a caller-supplied evaluator.
    pub fn with_evaluator(
        mut evaluator: E,
        format: &Format,
        table: Table,
        inspect_row: Option<usize>,
    ) -> JsonBuilderResult<Self> {
        load_functions(&mut evaluator, &format.functions)?;
        let root = parse_mapping(&format.mapping, &evaluator)?;
        Self::prepare(evaluator, root, table, format, inspect_row)
    }

    fn prepare(
        evaluator: E,
        root: Node<E::Program>,
        table: Table,
        format: &Format,
        inspect_row: Option<usize>,
    ) -> JsonBuilderResult<Self> {
        let mut tree = Self {
            evaluator,
            root,
            table,
            snapshots: Vec::new(),
        };
        tree.transform_table(&format.df_transforms, inspect_row)?;
        Ok(tree)
    }

    /// Apply every transform in order, taking a snapshot before each one
    /// and after the last.
    fn transform_table(
        &mut self,
        transforms: &[String],
        inspect_row: Option<usize>,
    ) -> SetupResult<()> {
        if !transforms.is_empty() {
            info!("Transforming table ({} step(s))", transforms.len());
        }
        for expression in transforms {
            self.snapshots.push(snapshot(&self.table, inspect_row));
            self.table = apply_transform(&self.evaluator, &self.table, expression).map_err(|e| {
                error!("{}", e);
                e
            })?;
            debug!(
                "Table after '{}': {} row(s), columns {:?}",
                expression,
                self.table.len(),
                self.table.columns()
            );
        }
        self.snapshots.push(snapshot(&self.table, inspect_row));
        Ok(())
    }

    /// Build the document. The tree is left unchanged, so repeated builds
    /// produce the same output.
    pub fn build(&self) -> JsonBuilderResult<Document> {
        info!("Building tree");
        let value = Engine::new(&self.evaluator).build_root(&self.root, self.table.clone())?;
        Ok(Document::new(value))
    }

    pub fn root(&self) -> &Node<E::Program> {
        &self.root
    }

    /// The table after all transforms.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Diagnostic views of the table: one before each transform, one after
    /// the last.
    pub fn snapshots(&self) -> &[Table] {
        &self.snapshots
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }
}

fn load_functions<E: Evaluator>(evaluator: &mut E, functions: &[String]) -> SetupResult<()> {
    for source in functions {
        let names = evaluator.define(source).map_err(|e| {
            let err = SetupError::FunctionCompile {
                source_text: source.clone(),
                source: e,
            };
            error!("{}", err);
            err
        })?;
        debug!("Loaded function(s) {:?}", names);
    }
    Ok(())
}

fn apply_transform<E: Evaluator>(
    evaluator: &E,
    table: &Table,
    expression: &str,
) -> SetupResult<Table> {
    let transform_error = |source| SetupError::Transform {
        expression: expression.to_string(),
        source,
    };
    let program = evaluator.compile(expression).map_err(transform_error)?;
    let bindings = Bindings::new().with("df", Value::Table(table.clone()));
    match evaluator.run(&program, &bindings).map_err(transform_error)? {
        Value::Table(table) => Ok(table),
        Value::Column(column) => {
            table
                .with_column(column)
                .map_err(|source| SetupError::Merge {
                    expression: expression.to_string(),
                    source,
                })
        }
        other => Err(SetupError::TransformType {
            expression: expression.to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BuildError, Error, MappingError};
    use serde_json::json;
    use std::fs;

    fn rates() -> Table {
        Table::new(
            vec!["ccy".into(), "tenor".into(), "rate".into()],
            vec![
                vec!["USD".into(), "1m".into(), Value::Float(5.1)],
                vec!["EUR".into(), "1m".into(), Value::Float(3.9)],
                vec!["USD".into(), "3m".into(), Value::Float(5.2)],
            ],
        )
        .unwrap()
    }

    fn fixed_date() -> BuildOptions {
        BuildOptions::default().with_date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
    }

    #[test]
    fn test_end_to_end_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let table_path = dir.path().join("rates.csv");
        fs::write(&table_path, "Ccy;Tenor;Rate\nUSD;1m;5.1\nEUR;3m;3.9\n").unwrap();
        let format = Format::from_json(json!({
            "mapping": {"type": "array", "children": [{
                "type": "object",
                "iterate": true,
                "children": [
                    {"name": "id", "column": "ccy"},
                    {"name": "maturity", "column": "tenor", "transmute": "today + delta(x)"},
                    {"name": "bp", "column": "rate", "transmute": "bp(x)"}
                ]
            }]},
            "functions": ["def bp(x): round(x * 100)"]
        }))
        .unwrap();

        let tree = Tree::new(&format, &table_path, &fixed_date()).unwrap();
        let doc = tree.build().unwrap();
        assert_eq!(
            doc.to_json(),
            json!([
                {"id": "USD", "maturity": "2024-02-29", "bp": 510},
                {"id": "EUR", "maturity": "2024-04-30", "bp": 390}
            ])
        );
        assert_eq!(tree.snapshots().len(), 1);
    }

    #[test]
    fn test_transforms_replace_and_merge() {
        let format = Format::from_json(json!({
            "mapping": {"type": "array", "children": [
                {"iterate": true, "transmute": "r.ccy + ':' + r.label"}
            ]},
            "df_transforms": [
                "df[df.rate > 4]",
                "assign(df, label=upper(df.tenor))"
            ]
        }))
        .unwrap();
        let tree = Tree::from_table(&format, rates(), &fixed_date()).unwrap();

        assert_eq!(tree.snapshots().len(), 3);
        assert_eq!(tree.snapshots()[0].len(), 3);
        assert_eq!(tree.snapshots()[1].len(), 2);
        assert!(tree.table().has_column("label"));
        assert_eq!(tree.build().unwrap().to_json(), json!(["USD:1M", "USD:3M"]));
    }

    #[test]
    fn test_column_transform_merges_by_name() {
        let format = Format::from_json(json!({
            "df_transforms": ["col(df, 'rate') * 2"]
        }))
        .unwrap();
        let tree = Tree::from_table(&format, rates(), &fixed_date()).unwrap();
        assert_eq!(tree.table().columns(), ["ccy", "tenor", "rate"]);
        assert_eq!(
            tree.table().column("rate").unwrap().values,
            vec![Value::Float(10.2), Value::Float(7.8), Value::Float(10.4)]
        );
    }

    #[test]
    fn test_transform_with_wrong_type() {
        let format = Format::from_json(json!({"df_transforms": ["len(df)"]})).unwrap();
        let err = Tree::from_table(&format, rates(), &fixed_date()).unwrap_err();
        match err {
            Error::Setup(SetupError::TransformType { expression, found }) => {
                assert_eq!(expression, "len(df)");
                assert_eq!(found, "int");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_function_compile_failure_is_fatal() {
        let format = Format::from_json(json!({"functions": ["def broken(x): x +"]})).unwrap();
        assert!(matches!(
            Tree::from_table(&format, rates(), &fixed_date()),
            Err(Error::Setup(SetupError::FunctionCompile { .. }))
        ));
    }

    #[test]
    fn test_invalid_node_type_is_fatal() {
        let format = Format::with_mapping(json!({"type": "matrix"}));
        assert!(matches!(
            Tree::from_table(&format, rates(), &fixed_date()),
            Err(Error::Mapping(MappingError::InvalidNodeType(_)))
        ));
    }

    #[test]
    fn test_build_errors_surface() {
        let format = Format::with_mapping(json!({"type": "array", "children": [
            {"iterate": true, "column": "missing"}
        ]}));
        let tree = Tree::from_table(&format, rates(), &fixed_date()).unwrap();
        assert!(matches!(
            tree.build(),
            Err(Error::Build(BuildError::ColumnLookup { .. }))
        ));
    }

    #[test]
    fn test_reference_date_is_today() {
        let format = Format::with_mapping(json!({"transmute": "today"}));
        let tree = Tree::from_table(&format, rates(), &fixed_date()).unwrap();
        assert_eq!(tree.build().unwrap().to_json(), json!("2024-01-31"));
    }

    #[test]
    fn test_inspect_row_snapshots() {
        let options = fixed_date().with_inspect_row(2);
        let format = Format::from_json(json!({"df_transforms": ["df"]})).unwrap();
        let tree = Tree::from_table(&format, rates(), &options).unwrap();
        for snap in tree.snapshots() {
            let idx: Vec<usize> = snap.iter().map(|r| r.index()).collect();
            assert_eq!(idx, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_repeated_builds_match() {
        let format = Format::with_mapping(json!({"type": "object", "children": [
            {"name": "groups", "type": "array", "children": [
                {"type": "object", "group_by": "ccy", "children": [
                    {"name": "ccy", "column": "ccy"},
                    {"name": "n", "transmute": "len(df)"}
                ]}
            ]}
        ]}));
        let tree = Tree::from_table(&format, rates(), &fixed_date()).unwrap();
        let first = tree.build().unwrap().to_json_string(true).unwrap();
        let second = tree.build().unwrap().to_json_string(true).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            tree.build().unwrap().to_json(),
            json!({"groups": [{"ccy": "USD", "n": 2}, {"ccy": "EUR", "n": 1}]})
        );
    }
}
