//! Mapping inference from an example document.
//!
//! Objects become object nodes with one named child per key, arrays become
//! array nodes holding each distinct element shape once, and scalars become
//! bare primitive nodes. The result is a starting point for a hand-written
//! format file: it has the right shape but no columns, filters or iteration.

use log::debug;
use serde_json::{json, Map, Value as Json};

/// Wrap the inferred mapping in a format document (`{"mapping": ...}`).
pub fn infer_format(example: &Json) -> Json {
    json!({ "mapping": json_to_mapping(example) })
}

/// Infer the mapping node that would produce `example`.
pub fn json_to_mapping(example: &Json) -> Json {
    Json::Object(analyze(example, Map::new()))
}

fn analyze(node: &Json, mut mapping: Map<String, Json>) -> Map<String, Json> {
    match node {
        Json::Object(fields) => {
            let children = fields
                .iter()
                .map(|(name, value)| {
                    let mut named = Map::new();
                    named.insert("name".to_string(), Json::String(name.clone()));
                    Json::Object(analyze(value, named))
                })
                .collect();
            mapping.insert("type".to_string(), json!("object"));
            mapping.insert("children".to_string(), Json::Array(children));
        }
        Json::Array(items) => {
            let mut children: Vec<Json> = Vec::new();
            for item in items {
                let child = Json::Object(analyze(item, Map::new()));
                if !children.contains(&child) {
                    children.push(child);
                }
            }
            debug!(
                "Array of {} element(s) has {} distinct shape(s)",
                items.len(),
                children.len()
            );
            mapping.insert("type".to_string(), json!("array"));
            mapping.insert("children".to_string(), Json::Array(children));
        }
        _ => {}
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Interpreter;
    use crate::mapping::parse_mapping;

    fn curves() -> Json {
        json!([
            {"action": "ADD_IR", "currency": "USD_SOFR", "ir_curves": [
                {"points": [{"date": "2019-05-18", "df": 3.96}, {"date": "2020-05-18", "df": 3.8}],
                 "identifier": "USD_SOFR"}
            ]},
            {"action": "ADD_IR", "currency": "EUR_ESTR", "ir_curves": [
                {"points": [{"date": "2019-05-18", "df": 3.96}], "identifier": "EUR_ESTR"}
            ]}
        ])
    }

    #[test]
    fn test_array_shapes_are_deduplicated() {
        let mapping = json_to_mapping(&curves());
        assert_eq!(
            mapping,
            json!({"type": "array", "children": [
                {"type": "object", "children": [
                    {"name": "action"},
                    {"name": "currency"},
                    {"name": "ir_curves", "type": "array", "children": [
                        {"type": "object", "children": [
                            {"name": "points", "type": "array", "children": [
                                {"type": "object", "children": [{"name": "date"}, {"name": "df"}]}
                            ]},
                            {"name": "identifier"}
                        ]}
                    ]}
                ]}
            ]})
        );
    }

    #[test]
    fn test_name_comes_first() {
        let mapping = json_to_mapping(&json!({"a": {"b": 1}}));
        let child = &mapping["children"][0];
        let keys: Vec<&String> = child.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["name", "type", "children"]);
    }

    #[test]
    fn test_scalars_and_mixed_arrays() {
        assert_eq!(json_to_mapping(&json!(3)), json!({}));
        assert_eq!(
            json_to_mapping(&json!([1, "x", {"k": null}, 2])),
            json!({"type": "array", "children": [
                {},
                {"type": "object", "children": [{"name": "k"}]}
            ]})
        );
    }

    #[test]
    fn test_inferred_format_parses() {
        let format = infer_format(&curves());
        assert!(format["mapping"].is_object());
        let root = parse_mapping(&format["mapping"], &Interpreter::default()).unwrap();
        assert_eq!(root.kind.label(), "array");
    }
}
