//! Dynamic values flowing through the builder.
//!
//! - [`Value`] - cell values, expression results and document nodes
//! - [`Map`] - insertion-ordered string-keyed map (JSON object)
//! - [`Delta`] - calendar offset (`3m`, `1y6m`, `o/n`)
//!
//! A built document is a `Value` tree made of `Null`, scalars, `List` and `Map`.
//! The other variants (rows, tables, columns, functions, deltas) only appear
//! while expressions run; if one ends up in the document it is written out as
//! its display string.

pub mod delta;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::error::{ExprError, ExprResult};
use crate::expr::Function;
use crate::table::{Column, Row, Table};

pub use delta::Delta;

// =============================================================================
// Ordered Map
// =============================================================================

/// String-keyed map that remembers insertion order.
///
/// Re-inserting an existing key replaces the value in place, so the key keeps
/// its original position. Lookups go through a key index.
#[derive(Clone, Default)]
pub struct Map {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite; returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        match self.index.get(&key) {
            Some(&slot) => Some(std::mem::replace(&mut self.entries[slot].1, value)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl PartialEq for Map {
    /// Key order does not matter for equality.
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl FromIterator<(String, Value)> for Map {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut map = Map::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for Map {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// =============================================================================
// Value
// =============================================================================

/// Any value an expression can produce or a document can contain.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    Delta(Delta),
    List(Vec<Value>),
    Map(Map),
    Row(Row),
    Table(Table),
    Column(Column),
    Function(Arc<Function>),
}

impl Value {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Date(_) => "date",
            Value::Delta(_) => "delta",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Row(_) => "row",
            Value::Table(_) => "table",
            Value::Column(_) => "column",
            Value::Function(_) => "function",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness: empty, zero and null are false.
    ///
    /// A column has no single truth value and is rejected.
    pub fn truthy(&self) -> ExprResult<bool> {
        Ok(match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Date(_) | Value::Row(_) | Value::Function(_) => true,
            Value::Delta(d) => !d.is_zero(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Table(table) => !table.is_empty(),
            Value::Column(_) => {
                return Err(ExprError::Type(
                    "the truth value of a column is ambiguous".to_string(),
                ))
            }
        })
    }

    /// Numeric view of ints, floats and bools.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`.
    ///
    /// `Ok(None)` when either side is null (every comparison is false);
    /// incomparable types are a type error.
    pub fn compare(&self, other: &Value) -> ExprResult<Option<Ordering>> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Ok(None),
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::Date(a), Value::Date(b)) => Ok(Some(a.cmp(b))),
            (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Some(Ordering::Equal) => continue,
                        other => return Ok(other),
                    }
                }
                Ok(Some(a.len().cmp(&b.len())))
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Ok(x.partial_cmp(&y)),
                _ => Err(ExprError::Type(format!(
                    "cannot order {} and {}",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }

    /// Total order for sorting: comparable values by [`Value::compare`],
    /// everything else by type.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match self.compare(other) {
            Ok(Some(ord)) => ord,
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => 0,
            Value::Str(_) => 1,
            Value::Date(_) => 2,
            Value::Delta(_) => 3,
            Value::List(_) => 4,
            Value::Map(_) => 5,
            Value::Row(_) | Value::Table(_) | Value::Column(_) | Value::Function(_) => 6,
            Value::Null => 7,
        }
    }

    /// Quoted form used inside lists and dicts.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\'', "\\'")),
            Value::Date(d) => format!("'{}'", d),
            other => other.to_string(),
        }
    }

    /// Convert a JSON value (e.g. a literal `value` in a mapping).
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => Value::Map(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to a JSON value with document serialization rules.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
            other => Json::String(other.to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Delta(a), Value::Delta(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Row(a), Value::Row(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Column(a), Value::Column(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn fmt_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", fmt_float(*x)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Delta(d) => write!(f, "{}", d),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Map(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Row(row) => {
                let parts: Vec<String> = row
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.repr()))
                    .collect();
                write!(f, "Row(Index={}, {})", row.index(), parts.join(", "))
            }
            Value::Table(table) => write!(f, "{}", table),
            Value::Column(column) => {
                let parts: Vec<String> = column.values.iter().map(Value::repr).collect();
                write!(f, "{}: [{}]", column.name, parts.join(", "))
            }
            Value::Function(func) => write!(f, "{}", func),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) if x.is_finite() => serializer.serialize_f64(*x),
            Value::Float(_) => serializer.serialize_none(),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map.iter() {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            other => serializer.collect_str(other),
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<Delta> for Value {
    fn from(d: Delta) -> Self {
        Value::Delta(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl From<Row> for Value {
    fn from(row: Row) -> Self {
        Value::Row(row)
    }
}

impl From<Table> for Value {
    fn from(table: Table) -> Self {
        Value::Table(table)
    }
}

impl From<Column> for Value {
    fn from(column: Column) -> Self {
        Value::Column(column)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_overwrite_keeps_position() {
        let mut map = Map::new();
        map.insert("a", Value::Int(1));
        map.insert("b", Value::Int(2));
        assert_eq!(map.insert("a", Value::Int(3)), Some(Value::Int(1)));
        let keys: Vec<&str> = map.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_map_index_tracks_many_keys() {
        let map: Map = (0..2_000)
            .rev()
            .map(|i| (format!("k{}", i), Value::Int(i)))
            .collect();
        assert_eq!(map.len(), 2_000);
        assert_eq!(map.keys().next(), Some("k1999"));
        assert_eq!(map.get("k7"), Some(&Value::Int(7)));
        assert!(map.contains_key("k0"));
        assert!(!map.contains_key("k2000"));

        let mut map = map;
        map.insert("k1999", Value::Null);
        assert_eq!(map.values().next(), Some(&Value::Null));
        assert_eq!(map.len(), 2_000);
        let last = map.into_iter().last();
        assert_eq!(last, Some(("k0".to_string(), Value::Int(0))));
    }

    #[test]
    fn test_serialize_document_rules() {
        let mut map = Map::new();
        map.insert("z", Value::Float(f64::NAN));
        map.insert("a", Value::Date(NaiveDate::from_ymd_opt(2021, 3, 4).unwrap()));
        map.insert("d", Value::Delta(Delta::months(3)));
        map.insert("n", Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Null]));
        let text = serde_json::to_string(&Value::Map(map)).unwrap();
        assert_eq!(text, r#"{"z":null,"a":"2021-03-04","d":"3m","n":[1,2.5,null]}"#);
    }

    #[test]
    fn test_to_json_matches_serialize() {
        let value = Value::List(vec![
            Value::from("x"),
            Value::Float(f64::INFINITY),
            Value::Bool(false),
        ]);
        let via_serde: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&value).unwrap()).unwrap();
        assert_eq!(value.to_json(), via_serde);
        assert_eq!(value.to_json(), json!(["x", null, false]));
    }

    #[test]
    fn test_from_json_keeps_order() {
        let json = json!({"b": 1, "a": [true, 1.5, "s", null]});
        let value = Value::from_json(&json);
        match &value {
            Value::Map(map) => {
                let keys: Vec<&str> = map.keys().collect();
                assert_eq!(keys, vec!["b", "a"]);
            }
            other => panic!("expected map, got {other:?}"),
        }
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_numeric_equality_and_ordering() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_eq!(Value::Null, Value::Null);
        assert_eq!(
            Value::Int(1).compare(&Value::Float(1.5)).unwrap(),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Int(1)).unwrap(), None);
        assert!(Value::from("a").compare(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy().unwrap());
        assert!(!Value::from("").truthy().unwrap());
        assert!(Value::Float(0.1).truthy().unwrap());
        assert!(!Value::List(vec![]).truthy().unwrap());
        assert!(Value::Column(Column::new("c", vec![])).truthy().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Float(0.25).to_string(), "0.25");
        assert_eq!(Value::Null.to_string(), "None");
        assert_eq!(
            Value::List(vec![Value::from("a"), Value::Int(1)]).to_string(),
            "['a', 1]"
        );
    }
}
