//! Mapping node tree.
//!
//! A mapping description is a JSON object per node:
//!
//! ```json
//! { "type": "array", "children": [
//!     { "type": "object", "iterate": true, "children": [
//!         { "name": "id", "column": "ccy" },
//!         { "name": "rate", "column": "rate", "transmute": "x * 100" }
//!     ]}
//! ]}
//! ```
//!
//! Parsing turns it into a closed [`Node`] tree: the kind decides which
//! fields are meaningful, and a field a kind cannot use is rejected instead of
//! ignored. Filter and transmute expressions are compiled once, here.

use log::{debug, error, info};
use serde::Deserialize;
use serde_json::Value as Json;

use crate::error::{MappingError, MappingResult};
use crate::expr::Evaluator;
use crate::models::Value;

/// Source text of an expression together with its compiled form.
#[derive(Debug, Clone)]
pub struct Compiled<P> {
    pub source: String,
    pub program: P,
}

/// One parsed mapping node.
#[derive(Debug, Clone)]
pub struct Node<P> {
    /// Key in the parent object; always set for children of an object.
    pub name: Option<String>,
    /// Location in the mapping (`$`, `$.curves[].id`), used in diagnostics.
    pub path: String,
    pub filter: Option<Compiled<P>>,
    /// Non-empty when the node groups its row-set.
    pub group_by: Vec<String>,
    pub iterate: bool,
    pub transmute: Option<Compiled<P>>,
    pub kind: NodeKind<P>,
}

#[derive(Debug, Clone)]
pub enum NodeKind<P> {
    /// Builds a map from named children.
    Object { children: Vec<Node<P>> },
    /// Builds a list from every value its children produce.
    Array { children: Vec<Node<P>> },
    /// A literal, or a column of the current row.
    Primitive { value: Value, column: Option<String> },
}

impl<P> NodeKind<P> {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Object { .. } => "object",
            NodeKind::Array { .. } => "array",
            NodeKind::Primitive { .. } => "primitive",
        }
    }

    pub fn children(&self) -> &[Node<P>] {
        match self {
            NodeKind::Object { children } | NodeKind::Array { children } => children,
            NodeKind::Primitive { .. } => &[],
        }
    }
}

impl<P> Node<P> {
    /// Name if set, otherwise the path.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }

    /// Number of nodes in this subtree.
    pub fn count(&self) -> usize {
        1 + self.kind.children().iter().map(Node::count).sum::<usize>()
    }
}

/// `group_by` accepts one column name or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Columns {
    One(String),
    Many(Vec<String>),
}

/// Raw node description; unrecognized keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Description {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    value: Option<Json>,
    column: Option<String>,
    filter: Option<String>,
    group_by: Option<Columns>,
    iterate: bool,
    transmute: Option<String>,
    children: Option<Vec<Json>>,
}

/// Parse a mapping description into a node tree, compiling its expressions
/// with `evaluator`.
pub fn parse_mapping<E: Evaluator>(
    description: &Json,
    evaluator: &E,
) -> MappingResult<Node<E::Program>> {
    info!("Parsing mapping");
    let root = parse_node(description, "$".to_string(), evaluator).map_err(|e| {
        error!("{}", e);
        e
    })?;
    debug!("Parsed {} mapping nodes", root.count());
    Ok(root)
}

fn parse_node<E: Evaluator>(
    json: &Json,
    path: String,
    evaluator: &E,
) -> MappingResult<Node<E::Program>> {
    if !json.is_object() {
        return Err(MappingError::InvalidNode {
            path,
            message: "expected a JSON object".to_string(),
        });
    }
    let description: Description =
        serde_json::from_value(json.clone()).map_err(|e| MappingError::InvalidNode {
            path: path.clone(),
            message: e.to_string(),
        })?;

    let compile = |field: &'static str, source: Option<String>| -> MappingResult<_> {
        source
            .map(|source| {
                evaluator
                    .compile(&source)
                    .map(|program| Compiled {
                        source: source.clone(),
                        program,
                    })
                    .map_err(|e| MappingError::Compile {
                        path: path.clone(),
                        field,
                        expression: source.clone(),
                        source: e,
                    })
            })
            .transpose()
    };
    let filter = compile("filter", description.filter)?;
    let transmute = compile("transmute", description.transmute)?;

    let group_by = match description.group_by {
        None => Vec::new(),
        Some(Columns::One(column)) => vec![column],
        Some(Columns::Many(columns)) => columns,
    };

    let not_allowed = |kind: &'static str, field: &'static str| MappingError::FieldNotAllowed {
        path: path.clone(),
        kind,
        field,
    };

    let kind = match description.kind.as_deref() {
        None | Some("primitive") => {
            if description.children.as_ref().is_some_and(|c| !c.is_empty()) {
                return Err(not_allowed("primitive", "children"));
            }
            NodeKind::Primitive {
                value: description
                    .value
                    .as_ref()
                    .map(Value::from_json)
                    .unwrap_or_default(),
                column: description.column,
            }
        }
        Some(kind @ ("object" | "array")) => {
            let label = if kind == "object" { "object" } else { "array" };
            if description.column.is_some() {
                return Err(not_allowed(label, "column"));
            }
            if description.value.is_some() {
                return Err(not_allowed(label, "value"));
            }
            let children = description.children.unwrap_or_default();
            let children = if kind == "object" {
                let mut parsed = Vec::with_capacity(children.len());
                for child in &children {
                    let name = child
                        .get("name")
                        .and_then(Json::as_str)
                        .ok_or_else(|| MappingError::MissingName(path.clone()))?;
                    parsed.push(parse_node(child, format!("{}.{}", path, name), evaluator)?);
                }
                NodeKind::Object { children: parsed }
            } else {
                let parsed = children
                    .iter()
                    .map(|child| parse_node(child, format!("{}[]", path), evaluator))
                    .collect::<MappingResult<Vec<_>>>()?;
                NodeKind::Array { children: parsed }
            };
            children
        }
        Some(other) => return Err(MappingError::InvalidNodeType(other.to_string())),
    };

    Ok(Node {
        name: description.name,
        path,
        filter,
        group_by,
        iterate: description.iterate,
        transmute,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Interpreter;
    use serde_json::json;

    fn parse(json: Json) -> MappingResult<Node<<Interpreter as Evaluator>::Program>> {
        parse_mapping(&json, &Interpreter::default())
    }

    #[test]
    fn test_kinds_and_order() {
        let root = parse(json!({
            "type": "object",
            "children": [
                {"name": "b", "value": 1},
                {"name": "a", "type": "array", "children": [{"column": "x"}]},
                {"name": "c", "type": "primitive", "column": "y"}
            ]
        }))
        .unwrap();
        assert_eq!(root.kind.label(), "object");
        let names: Vec<&str> = root.kind.children().iter().map(Node::label).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        let array = &root.kind.children()[1];
        assert_eq!(array.kind.label(), "array");
        assert_eq!(array.kind.children()[0].path, "$.a[]");
        assert!(matches!(
            &root.kind.children()[0].kind,
            NodeKind::Primitive { value: Value::Int(1), column: None }
        ));
        assert_eq!(root.count(), 5);
    }

    #[test]
    fn test_invalid_type_names_value() {
        let err = parse(json!({"type": "tuple"})).unwrap_err();
        assert!(matches!(&err, MappingError::InvalidNodeType(t) if t == "tuple"));
        assert!(err.to_string().contains("tuple"));

        let nested = parse(json!({"type": "array", "children": [{"type": "set"}]}));
        assert!(matches!(nested, Err(MappingError::InvalidNodeType(_))));
    }

    #[test]
    fn test_nonsensical_fields_rejected() {
        assert!(matches!(
            parse(json!({"type": "object", "column": "ccy"})),
            Err(MappingError::FieldNotAllowed { field: "column", .. })
        ));
        assert!(matches!(
            parse(json!({"type": "array", "value": []})),
            Err(MappingError::FieldNotAllowed { field: "value", .. })
        ));
        assert!(matches!(
            parse(json!({"column": "ccy", "children": [{"value": 1}]})),
            Err(MappingError::FieldNotAllowed { field: "children", .. })
        ));
    }

    #[test]
    fn test_object_children_need_names() {
        assert!(matches!(
            parse(json!({"type": "object", "children": [{"value": 1}]})),
            Err(MappingError::MissingName(p)) if p == "$"
        ));
        // array children may be anonymous
        assert!(parse(json!({"type": "array", "children": [{"value": 1}]})).is_ok());
    }

    #[test]
    fn test_selection_fields() {
        let root = parse(json!({
            "type": "array",
            "filter": "ccy == 'USD'",
            "group_by": "curve",
            "iterate": true,
            "transmute": "x[0]"
        }))
        .unwrap();
        assert_eq!(root.group_by, vec!["curve"]);
        assert!(root.iterate);
        assert_eq!(root.filter.as_ref().unwrap().source, "ccy == 'USD'");
        assert_eq!(root.transmute.as_ref().unwrap().source, "x[0]");

        let many = parse(json!({"type": "array", "group_by": ["a", "b"]})).unwrap();
        assert_eq!(many.group_by, vec!["a", "b"]);
    }

    #[test]
    fn test_compile_errors_carry_path() {
        let err = parse(json!({
            "type": "object",
            "children": [{"name": "rate", "transmute": "x *"}]
        }))
        .unwrap_err();
        match err {
            MappingError::Compile { path, field, expression, .. } => {
                assert_eq!(path, "$.rate");
                assert_eq!(field, "transmute");
                assert_eq!(expression, "x *");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_fields_ignored_and_bad_shapes_rejected() {
        assert!(parse(json!({"name": "x", "comment": "free text"})).is_ok());
        assert!(matches!(
            parse(json!({"iterate": "yes"})),
            Err(MappingError::InvalidNode { .. })
        ));
        assert!(matches!(
            parse(json!(["not", "an", "object"])),
            Err(MappingError::InvalidNode { .. })
        ));
    }
}
