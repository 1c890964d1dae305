//! The four-phase node protocol: filter, iterate, build, transmute.
//!
//! Row context travels down the recursion as an explicit [`Scope`]; nodes
//! hold no evaluation state, so one activation can never observe another's
//! rows or value.

use std::sync::Arc;

use log::{debug, error};

use crate::error::{BuildError, BuildResult};
use crate::expr::{Bindings, Evaluator};
use crate::mapping::{Node, NodeKind};
use crate::models::{Map, Value};
use crate::table::{Row, Table};

/// Rows visible to one activation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Current row-set; `None` inside a row-by-row iteration.
    pub rows: Option<Arc<Table>>,
    /// Current row; `None` before any row is selected or after an empty filter.
    pub row: Option<Row>,
}

impl Scope {
    /// Whole table, no current row.
    pub fn root(table: Table) -> Self {
        Self {
            rows: Some(Arc::new(table)),
            row: None,
        }
    }

    fn row_index(&self) -> Option<usize> {
        self.row.as_ref().map(Row::index)
    }
}

/// Walks a node tree against a table.
pub struct Engine<'a, E: Evaluator> {
    evaluator: &'a E,
}

impl<'a, E: Evaluator> Engine<'a, E> {
    pub fn new(evaluator: &'a E) -> Self {
        Self { evaluator }
    }

    /// Evaluate the root node: filter, then build once.
    ///
    /// The root does not iterate; `iterate` and `group_by` only take effect
    /// on nodes below it.
    pub fn build_root(&self, root: &Node<E::Program>, table: Table) -> BuildResult<Value> {
        let scope = self.filter(root, Scope::root(table))?;
        self.build(root, &scope)
    }

    /// Run every activation of `node` and collect the values produced.
    pub fn activate(&self, node: &Node<E::Program>, scope: Scope) -> BuildResult<Vec<Value>> {
        let scope = self.filter(node, scope)?;
        let activations = self.iterate(node, scope)?;
        debug!("{}: {} activation(s)", node.path, activations.len());
        activations
            .iter()
            .map(|activation| self.build(node, activation))
            .collect()
    }

    /// Phase 1: narrow the row-set with the node's filter.
    fn filter(&self, node: &Node<E::Program>, scope: Scope) -> BuildResult<Scope> {
        let Some(filter) = &node.filter else {
            return Ok(scope);
        };
        let rows = require_rows(node, &scope, "filter")?;

        let kept = rows
            .filter_rows(|row| {
                let bindings = Bindings::new()
                    .with("r", Value::Row(row.clone()))
                    .expose_row(row.clone());
                self.evaluator
                    .run(&filter.program, &bindings)
                    .and_then(|value| value.truthy())
                    .map_err(|source| BuildError::FilterEvaluation {
                        node: node.path.clone(),
                        expression: filter.source.clone(),
                        row: Some(row.index()),
                        source,
                    })
            })
            .map_err(log_failure)?;

        debug!(
            "{}: filter kept {} of {} row(s)",
            node.path,
            kept.len(),
            rows.len()
        );
        Ok(Scope {
            row: kept.first().cloned(),
            rows: Some(Arc::new(kept)),
        })
    }

    /// Phase 2: split the scope into activations.
    fn iterate(&self, node: &Node<E::Program>, scope: Scope) -> BuildResult<Vec<Scope>> {
        if !node.group_by.is_empty() {
            let rows = require_rows(node, &scope, "group_by")?;
            let groups = rows
                .group_by(&node.group_by)
                .map_err(|source| BuildError::GroupBy {
                    node: node.path.clone(),
                    columns: node.group_by.clone(),
                    source,
                })
                .map_err(log_failure)?;
            return Ok(groups
                .into_iter()
                .map(|group| Scope {
                    row: group.first().cloned(),
                    rows: Some(Arc::new(group)),
                })
                .collect());
        }

        if node.iterate {
            let rows = require_rows(node, &scope, "iterate")?;
            return Ok(rows
                .iter()
                .map(|row| Scope {
                    rows: None,
                    row: Some(row.clone()),
                })
                .collect());
        }

        Ok(vec![scope])
    }

    /// Phases 3 and 4 for one activation.
    fn build(&self, node: &Node<E::Program>, scope: &Scope) -> BuildResult<Value> {
        let value = match &node.kind {
            NodeKind::Object { children } => {
                let mut map = Map::new();
                for child in children {
                    let key = child.name.as_deref().unwrap_or_default();
                    for value in self.activate(child, scope.clone())? {
                        map.insert(key, value);
                    }
                }
                Value::Map(map)
            }
            NodeKind::Array { children } => {
                let mut items = Vec::new();
                for child in children {
                    items.extend(self.activate(child, scope.clone())?);
                }
                Value::List(items)
            }
            NodeKind::Primitive { value, column } => match (column, &scope.row) {
                (Some(column), Some(row)) => row.get(column).cloned().ok_or_else(|| {
                    log_failure(BuildError::ColumnLookup {
                        node: node.label().to_string(),
                        column: column.clone(),
                        row: Some(row.index()),
                    })
                })?,
                _ => value.clone(),
            },
        };
        self.transmute(node, value, scope)
    }

    fn transmute(&self, node: &Node<E::Program>, value: Value, scope: &Scope) -> BuildResult<Value> {
        let Some(transmute) = &node.transmute else {
            return Ok(value);
        };
        let bindings = Bindings::new()
            .with("x", value)
            .with("r", scope.row.clone().map(Value::Row).unwrap_or_default())
            .with(
                "df",
                scope
                    .rows
                    .as_ref()
                    .map(|rows| Value::Table(Table::clone(rows)))
                    .unwrap_or_default(),
            );
        self.evaluator
            .run(&transmute.program, &bindings)
            .map_err(|source| {
                log_failure(BuildError::TransmuteEvaluation {
                    node: node.path.clone(),
                    expression: transmute.source.clone(),
                    row: scope.row_index(),
                    source,
                })
            })
    }
}

fn require_rows<'s, P>(
    node: &Node<P>,
    scope: &'s Scope,
    phase: &'static str,
) -> BuildResult<&'s Table> {
    scope.rows.as_deref().ok_or_else(|| {
        log_failure(BuildError::MissingRowSet {
            node: node.path.clone(),
            phase,
        })
    })
}

fn log_failure(err: BuildError) -> BuildError {
    error!("{}", err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Interpreter;
    use crate::mapping::parse_mapping;
    use serde_json::{json, Value as Json};

    fn curves() -> Table {
        Table::new(
            vec!["curve".into(), "ccy".into(), "tenor".into(), "rate".into()],
            vec![
                vec!["SOFR".into(), "USD".into(), "1m".into(), Value::Float(5.1)],
                vec!["ESTR".into(), "EUR".into(), "1m".into(), Value::Float(3.9)],
                vec!["SOFR".into(), "USD".into(), "3m".into(), Value::Float(5.2)],
                vec![Value::Null, "GBP".into(), "1m".into(), Value::Float(4.5)],
                vec!["ESTR".into(), "EUR".into(), "3m".into(), Value::Float(3.8)],
            ],
        )
        .unwrap()
    }

    fn build(mapping: Json, table: Table) -> BuildResult<Json> {
        let interp = Interpreter::default();
        let root = parse_mapping(&mapping, &interp).unwrap();
        Engine::new(&interp)
            .build_root(&root, table)
            .map(|value| value.to_json())
    }

    #[test]
    fn test_iterate_inside_array_wrapper() {
        let table = Table::new(
            vec!["ccy".into()],
            vec![vec!["USD".into()], vec!["EUR".into()]],
        )
        .unwrap();
        let out = build(
            json!({"type": "array", "children": [
                {"type": "object", "iterate": true, "children": [{"name": "id", "column": "ccy"}]}
            ]}),
            table,
        )
        .unwrap();
        assert_eq!(out, json!([{"id": "USD"}, {"id": "EUR"}]));
    }

    #[test]
    fn test_structure_mirrors_mapping_without_selection() {
        let out = build(
            json!({"type": "object", "children": [
                {"name": "version", "value": 2},
                {"name": "tags", "type": "array", "children": [{"value": "a"}, {"value": "b"}]},
                {"name": "meta", "type": "object", "children": [{"name": "empty", "type": "array"}]},
                {"name": "nothing"}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(
            out,
            json!({"version": 2, "tags": ["a", "b"], "meta": {"empty": []}, "nothing": null})
        );
    }

    #[test]
    fn test_root_column_without_row_keeps_literal() {
        let out = build(json!({"column": "ccy", "value": "fallback"}), curves()).unwrap();
        assert_eq!(out, json!("fallback"));
    }

    #[test]
    fn test_group_by_first_seen_order_and_nested_iterate() {
        let out = build(
            json!({"type": "array", "children": [{
                "type": "object",
                "group_by": "curve",
                "children": [
                    {"name": "id", "column": "curve"},
                    {"name": "points", "type": "array", "children": [
                        {"iterate": true, "column": "tenor"}
                    ]}
                ]
            }]}),
            curves(),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"id": "SOFR", "points": ["1m", "3m"]},
                {"id": "ESTR", "points": ["1m", "3m"]}
            ])
        );
    }

    #[test]
    fn test_group_by_wins_over_iterate() {
        let out = build(
            json!({"type": "array", "children": [
                {"group_by": ["ccy"], "iterate": true, "column": "ccy"}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(out, json!(["USD", "EUR", "GBP"]));
    }

    #[test]
    fn test_filter_sets_first_row_and_empty_filter() {
        let out = build(
            json!({"type": "object", "children": [
                {"name": "eur", "filter": "ccy == 'EUR'", "column": "rate"},
                {"name": "none", "filter": "ccy == 'JPY'", "column": "rate", "value": 0},
                {"name": "jpy", "type": "array", "filter": "ccy == 'JPY'", "children": [
                    {"iterate": true, "column": "rate"}
                ]}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(out, json!({"eur": 3.9, "none": 0, "jpy": []}));
    }

    #[test]
    fn test_empty_filter_on_object_keeps_children_literals() {
        let out = build(
            json!({"type": "object", "children": [{
                "name": "o",
                "type": "object",
                "filter": "ccy == 'JPY'",
                "children": [
                    {"name": "r", "column": "rate"},
                    {"name": "k", "value": 1}
                ]
            }]}),
            curves(),
        )
        .unwrap();
        assert_eq!(out, json!({"o": {"r": null, "k": 1}}));
    }

    #[test]
    fn test_filter_sees_row_binding() {
        let out = build(
            json!({"type": "array", "children": [
                {"filter": "r.rate > 5 and r.Index > 1", "iterate": true, "column": "tenor"}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(out, json!(["3m"]));
    }

    #[test]
    fn test_duplicate_names_overwrite_in_place() {
        let out = build(
            json!({"type": "object", "children": [
                {"name": "a", "value": 1},
                {"name": "b", "value": 2},
                {"name": "a", "value": 3}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(serde_json::to_string(&out).unwrap(), r#"{"a":3,"b":2}"#);
    }

    #[test]
    fn test_iterating_object_child_keeps_last_activation() {
        let out = build(
            json!({"type": "object", "children": [
                {"name": "last", "iterate": true, "column": "ccy"}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(out, json!({"last": "EUR"}));
    }

    #[test]
    fn test_transmute_bindings() {
        let out = build(
            json!({"type": "array", "children": [
                {"type": "object", "group_by": "ccy", "filter": "notnull(curve)",
                 "transmute": "{'ccy': x['ccy'], 'n': len(df), 'first': r.tenor}",
                 "children": [{"name": "ccy", "column": "ccy"}]},
                {"iterate": true, "filter": "ccy == 'GBP'", "column": "rate",
                 "transmute": "str(x) + (' no set' if df == None else '')"}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"ccy": "USD", "n": 2, "first": "1m"},
                {"ccy": "EUR", "n": 2, "first": "1m"},
                "4.5 no set"
            ])
        );
    }

    #[test]
    fn test_primitive_value_does_not_leak_between_activations() {
        let out = build(
            json!({"type": "array", "children": [
                {"iterate": true, "transmute": "x if x != None else r.ccy"}
            ]}),
            curves(),
        )
        .unwrap();
        assert_eq!(out, json!(["USD", "EUR", "USD", "GBP", "EUR"]));
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let err = build(
            json!({"type": "array", "children": [{"iterate": true, "column": "nope"}]}),
            curves(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::ColumnLookup { ref column, row: Some(1), .. } if column == "nope"
        ));
    }

    #[test]
    fn test_filter_and_transmute_failures_are_fatal() {
        let err = build(
            json!({"type": "array", "children": [{"filter": "rate > 'x'", "column": "ccy"}]}),
            curves(),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::FilterEvaluation { row: Some(1), .. }));

        let err = build(
            json!({"type": "array", "children": [
                {"iterate": true, "column": "ccy", "transmute": "x + 1"}
            ]}),
            curves(),
        )
        .unwrap_err();
        match err {
            BuildError::TransmuteEvaluation { node, expression, row, .. } => {
                assert_eq!(node, "$[]");
                assert_eq!(expression, "x + 1");
                assert_eq!(row, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_row_set_required_inside_iteration() {
        let err = build(
            json!({"type": "array", "children": [
                {"type": "array", "iterate": true, "children": [
                    {"group_by": "ccy", "column": "ccy"}
                ]}
            ]}),
            curves(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingRowSet { phase: "group_by", .. }
        ));
    }

    #[test]
    fn test_group_by_unknown_column() {
        let err = build(
            json!({"type": "array", "children": [{"group_by": "nope"}]}),
            curves(),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::GroupBy { .. }));
    }

    #[test]
    fn test_build_is_idempotent() {
        let mapping = json!({"type": "array", "children": [
            {"type": "object", "group_by": "ccy", "children": [
                {"name": "ccy", "column": "ccy"},
                {"name": "max", "transmute": "max(df.rate)"}
            ]}
        ]});
        let interp = Interpreter::default();
        let root = parse_mapping(&mapping, &interp).unwrap();
        let engine = Engine::new(&interp);
        let first = engine.build_root(&root, curves()).unwrap();
        let second = engine.build_root(&root, curves()).unwrap();
        assert_eq!(first.to_json(), second.to_json());
        assert_eq!(first.to_json()[0], json!({"ccy": "USD", "max": 5.2}));
    }
}
