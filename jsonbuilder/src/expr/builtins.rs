//! Builtin function library.
//!
//! Scalar functions also accept a column and apply element-wise; nulls inside
//! a column pass through untouched unless the function is about nulls.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

use super::interpreter::{contains as member, Interpreter};
use super::{Bindings, Evaluator};
use crate::error::{ExprError, ExprResult};
use crate::models::{Delta, Value};
use crate::table::{Column, Table};

const NAMES: &[&str] = &[
    "abs", "assign", "bool", "coalesce", "col", "concat", "contains", "date", "day", "delta",
    "drop", "endswith", "first", "float", "get", "head", "index", "int", "isnull", "join", "keys",
    "len", "lower", "map", "max", "mean", "min", "month", "notnull", "query", "re.match",
    "re.search", "re.sub", "rename", "replace", "round", "select", "sort", "split", "startswith",
    "str", "strftime", "strip", "sum", "tail", "translate", "unique", "upper", "weekday", "where",
    "year",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%d-%b-%Y", "%d %b %Y", "%d %B %Y",
    "%b %d, %Y", "%B %d, %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

static REGEX_CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(Default::default);

pub(super) fn exists(name: &str) -> bool {
    NAMES.contains(&name)
}

pub(super) fn call(
    interp: &Interpreter,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExprResult<Value> {
    match name {
        // conversions
        "str" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            map_all(x, |v| Ok(Value::Str(v.to_string())))
        }
        "int" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            map_present(x, to_int)
        }
        "float" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            map_present(x, to_float)
        }
        "bool" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            map_all(x, |v| Ok(Value::Bool(v.truthy()?)))
        }

        // strings
        "upper" | "lower" => {
            let [s] = bind(name, ["s"], args, kwargs)?;
            map_present(s, |v| {
                let text = expect_str(name, &v)?;
                Ok(Value::Str(if name == "upper" {
                    text.to_uppercase()
                } else {
                    text.to_lowercase()
                }))
            })
        }
        "strip" => {
            let [s, chars] = bind(name, ["s", "chars?"], args, kwargs)?;
            let chars = optional_string(name, chars)?;
            map_present(s, |v| {
                let text = expect_str(name, &v)?;
                Ok(Value::from(match &chars {
                    Some(set) => text.trim_matches(|c| set.contains(c)),
                    None => text.trim(),
                }))
            })
        }
        "replace" => {
            let [s, old, new] = bind(name, ["s", "old", "new"], args, kwargs)?;
            let (old, new) = (expect_string(name, old)?, expect_string(name, new)?);
            map_present(s, |v| Ok(Value::Str(expect_str(name, &v)?.replace(&old, &new))))
        }
        "split" => {
            let [s, sep] = bind(name, ["s", "sep?"], args, kwargs)?;
            let sep = optional_string(name, sep)?;
            if sep.as_deref() == Some("") {
                return Err(ExprError::Type("split(): empty separator".to_string()));
            }
            map_present(s, |v| {
                let text = expect_str(name, &v)?;
                let parts: Vec<Value> = match &sep {
                    Some(sep) => text.split(sep.as_str()).map(Value::from).collect(),
                    None => text.split_whitespace().map(Value::from).collect(),
                };
                Ok(Value::List(parts))
            })
        }
        "join" => {
            let [sep, values] = bind(name, ["sep", "items"], args, kwargs)?;
            let sep = expect_string(name, sep)?;
            let parts: Vec<String> = items(name, values)?
                .into_iter()
                .map(|v| match v {
                    Value::Str(s) => s,
                    other => other.to_string(),
                })
                .collect();
            Ok(Value::Str(parts.join(&sep)))
        }
        "startswith" | "endswith" => {
            let [s, affix] = bind(name, ["s", "affix"], args, kwargs)?;
            let affix = expect_string(name, affix)?;
            map_present(s, |v| {
                let text = expect_str(name, &v)?;
                Ok(Value::Bool(if name == "startswith" {
                    text.starts_with(affix.as_str())
                } else {
                    text.ends_with(affix.as_str())
                }))
            })
        }
        "contains" => {
            let [container, item] = bind(name, ["container", "item"], args, kwargs)?;
            match container {
                Value::Column(_) | Value::Str(_) => {
                    let sub = expect_string(name, item)?;
                    map_present(container, |v| {
                        Ok(Value::Bool(expect_str(name, &v)?.contains(sub.as_str())))
                    })
                }
                other => Ok(Value::Bool(member(&other, &item)?)),
            }
        }
        "len" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            let n = match &x {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Row(row) => row.columns().len(),
                Value::Table(table) => table.len(),
                Value::Column(column) => column.len(),
                other => return Err(wrong_type(name, other)),
            };
            Ok(Value::Int(n as i64))
        }

        // regular expressions
        "re.sub" => {
            let [pattern, repl, s, count] =
                bind(name, ["pattern", "repl", "string", "count?"], args, kwargs)?;
            let re = regex(&expect_string(name, pattern)?)?;
            let repl = backref_replacement(&expect_string(name, repl)?);
            let count = match count {
                Value::Null => 0,
                other => expect_int(name, &other)?.max(0) as usize,
            };
            map_present(s, |v| {
                let text = expect_str(name, &v)?;
                Ok(Value::Str(re.replacen(text, count, repl.as_str()).into_owned()))
            })
        }
        "re.match" | "re.search" => {
            let [pattern, s] = bind(name, ["pattern", "string"], args, kwargs)?;
            let re = regex(&expect_string(name, pattern)?)?;
            map_present(s, |v| {
                let text = expect_str(name, &v)?;
                Ok(match re.find(text) {
                    Some(m) if name == "re.search" || m.start() == 0 => Value::from(m.as_str()),
                    _ => Value::Null,
                })
            })
        }

        // numbers
        "abs" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            map_present(x, |v| match v {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| ExprError::Arithmetic("integer overflow".to_string())),
                Value::Bool(b) => Ok(Value::Int(b as i64)),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(wrong_type(name, &other)),
            })
        }
        "round" => {
            let [x, ndigits] = bind(name, ["x", "ndigits?"], args, kwargs)?;
            let ndigits = match ndigits {
                Value::Null => None,
                other => Some(expect_int(name, &other)?),
            };
            map_present(x, |v| round(v, ndigits))
        }
        "min" | "max" => {
            no_kwargs(name, &kwargs)?;
            let candidates = match <[Value; 1]>::try_from(args) {
                Ok([single @ (Value::List(_) | Value::Column(_))]) => items(name, single)?,
                Ok([single]) => vec![single],
                Err(args) => args,
            };
            let mut best: Option<Value> = None;
            for value in candidates.into_iter().filter(|v| !v.is_null()) {
                best = Some(match best {
                    None => value,
                    Some(current) => {
                        let ord = value.compare(&current)?;
                        let better = if name == "min" {
                            ord.is_some_and(|o| o.is_lt())
                        } else {
                            ord.is_some_and(|o| o.is_gt())
                        };
                        if better {
                            value
                        } else {
                            current
                        }
                    }
                });
            }
            best.ok_or_else(|| ExprError::Type(format!("{}() arg is an empty sequence", name)))
        }
        "sum" => {
            let [values] = bind(name, ["items"], args, kwargs)?;
            let values: Vec<Value> = items(name, values)?
                .into_iter()
                .filter(|v| !v.is_null())
                .collect();
            if values.iter().all(|v| v.as_i64().is_some()) {
                let mut total: i64 = 0;
                for v in &values {
                    total = v
                        .as_i64()
                        .and_then(|i| total.checked_add(i))
                        .ok_or_else(|| ExprError::Arithmetic("integer overflow".to_string()))?;
                }
                return Ok(Value::Int(total));
            }
            let mut total = 0.0;
            for v in &values {
                total += v.as_f64().ok_or_else(|| wrong_type(name, v))?;
            }
            Ok(Value::Float(total))
        }
        "mean" => {
            let [values] = bind(name, ["items"], args, kwargs)?;
            let numbers = items(name, values)?
                .iter()
                .filter(|v| !is_missing(v))
                .map(|v| v.as_f64().ok_or_else(|| wrong_type(name, v)))
                .collect::<ExprResult<Vec<f64>>>()?;
            if numbers.is_empty() {
                return Ok(Value::Null);
            }
            Ok(Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64))
        }

        // nulls
        "isnull" | "notnull" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            let want = name == "isnull";
            map_all(x, |v| Ok(Value::Bool(is_missing(&v) == want)))
        }
        "coalesce" => {
            no_kwargs(name, &kwargs)?;
            coalesce(args)
        }

        // dates and deltas
        "date" => {
            let [x, format] = bind(name, ["x", "format?"], args, kwargs)?;
            let format = optional_string(name, format)?;
            map_present(x, |v| to_date(v, format.as_deref()).map(Value::Date))
        }
        "delta" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            match x {
                Value::Column(_) => map_present(x, to_delta),
                other => to_delta(other),
            }
        }
        "year" | "month" | "day" | "weekday" => {
            let [x] = bind(name, ["d"], args, kwargs)?;
            map_present(x, |v| match v {
                Value::Date(d) => Ok(Value::Int(match name {
                    "year" => d.year() as i64,
                    "month" => d.month() as i64,
                    "day" => d.day() as i64,
                    _ => d.weekday().num_days_from_monday() as i64,
                })),
                other => Err(wrong_type(name, &other)),
            })
        }
        "strftime" => {
            let [x, format] = bind(name, ["d", "format"], args, kwargs)?;
            let format = expect_string(name, format)?;
            map_present(x, |v| match v {
                Value::Date(d) => {
                    let mut out = String::new();
                    write!(out, "{}", d.format(&format)).map_err(|_| {
                        ExprError::Type(format!("invalid date format '{}'", format))
                    })?;
                    Ok(Value::Str(out))
                }
                other => Err(wrong_type(name, &other)),
            })
        }
        "translate" => {
            let [x, mapping] = bind(name, ["x", "mapping"], args, kwargs)?;
            let mapping = match mapping {
                Value::Map(map) => map,
                other => return Err(wrong_type(name, &other)),
            };
            map_present(x, |v| {
                let key = match &v {
                    Value::Str(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(mapping.get(&key).cloned().unwrap_or(v))
            })
        }

        // collections
        "get" => {
            let [container, key, default] =
                bind(name, ["container", "key", "default?"], args, kwargs)?;
            get(container, key, default)
        }
        "keys" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            let keys: Vec<Value> = match &x {
                Value::Map(map) => map.keys().map(Value::from).collect(),
                Value::Row(row) => row.columns().iter().map(|c| Value::from(c.as_str())).collect(),
                Value::Table(table) => table
                    .columns()
                    .iter()
                    .map(|c| Value::from(c.as_str()))
                    .collect(),
                other => return Err(wrong_type(name, other)),
            };
            Ok(Value::List(keys))
        }
        "first" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            Ok(match x {
                Value::List(items) => items.into_iter().next().unwrap_or_default(),
                Value::Column(column) => column.values.into_iter().next().unwrap_or_default(),
                Value::Table(table) => table.first().cloned().map(Value::Row).unwrap_or_default(),
                Value::Str(s) => s.chars().next().map(|c| Value::Str(c.to_string())).unwrap_or_default(),
                other => return Err(wrong_type(name, &other)),
            })
        }
        "unique" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            let mut seen: Vec<Value> = Vec::new();
            for value in items(name, x)? {
                if !seen.contains(&value) {
                    seen.push(value);
                }
            }
            Ok(Value::List(seen))
        }

        // tables
        "col" => {
            let [x, column] = bind(name, ["df", "name"], args, kwargs)?;
            let column = expect_string(name, column)?;
            match x {
                Value::Table(table) => Ok(Value::Column(table.column(&column)?)),
                Value::Row(row) => row
                    .get(&column)
                    .cloned()
                    .ok_or_else(|| ExprError::Lookup(format!("row has no column '{}'", column))),
                other => Err(wrong_type(name, &other)),
            }
        }
        "rename" => {
            let [x, mapping] = bind(name, ["x", "mapping"], args, kwargs)?;
            match (x, mapping) {
                (Value::Table(table), Value::Map(map)) => {
                    let pairs = map
                        .iter()
                        .map(|(old, new)| Ok((old.to_string(), expect_str(name, new)?.to_string())))
                        .collect::<ExprResult<Vec<_>>>()?;
                    Ok(Value::Table(table.rename(&pairs)?))
                }
                (Value::Column(column), Value::Str(new)) => {
                    Ok(Value::Column(Column::new(new, column.values)))
                }
                (other, _) => Err(wrong_type(name, &other)),
            }
        }
        "map" => {
            let [x, f] = bind(name, ["x", "f"], args, kwargs)?;
            let apply = |v: Value| -> ExprResult<Value> {
                match &f {
                    Value::Function(_) => interp.call(&f, vec![v], Vec::new()),
                    Value::Map(map) => {
                        let key = match &v {
                            Value::Str(s) => s.clone(),
                            other => other.to_string(),
                        };
                        Ok(map.get(&key).cloned().unwrap_or_default())
                    }
                    other => Err(wrong_type(name, other)),
                }
            };
            match x {
                Value::Column(column) => Ok(Value::Column(Column::new(
                    column.name,
                    column
                        .values
                        .into_iter()
                        .map(apply)
                        .collect::<ExprResult<_>>()?,
                ))),
                Value::List(items) => Ok(Value::List(
                    items.into_iter().map(apply).collect::<ExprResult<_>>()?,
                )),
                other => Err(wrong_type(name, &other)),
            }
        }
        "assign" => assign(interp, args, kwargs),
        "where" => {
            let [x, condition] = bind(name, ["df", "condition"], args, kwargs)?;
            let table = expect_table(name, x)?;
            let kept = match condition {
                Value::Column(mask) => mask_rows(&table, &mask)?,
                Value::List(flags) => mask_rows(&table, &Column::new("mask", flags))?,
                f @ Value::Function(_) => table.filter_rows(|row| {
                    interp
                        .call(&f, vec![Value::Row(row.clone())], Vec::new())?
                        .truthy()
                })?,
                other => return Err(wrong_type(name, &other)),
            };
            Ok(Value::Table(kept))
        }
        "query" => {
            let [x, expression] = bind(name, ["df", "expr"], args, kwargs)?;
            let table = expect_table(name, x)?;
            let program = interp.compile(&expect_string(name, expression)?)?;
            let kept = table.filter_rows(|row| {
                let bindings = Bindings::new()
                    .with("r", Value::Row(row.clone()))
                    .expose_row(row.clone());
                interp.run(&program, &bindings)?.truthy()
            })?;
            Ok(Value::Table(kept))
        }
        "select" | "drop" => {
            no_kwargs(name, &kwargs)?;
            let mut args = args.into_iter();
            let table = expect_table(name, args.next().unwrap_or_default())?;
            let columns = column_names(name, args)?;
            Ok(Value::Table(if name == "select" {
                table.select(&columns)?
            } else {
                table.drop_columns(&columns)?
            }))
        }
        "head" | "tail" => {
            let [x, n] = bind(name, ["x", "n?"], args, kwargs)?;
            let n = match n {
                Value::Null => 5,
                other => expect_int(name, &other)?.max(0) as usize,
            };
            let take = |len: usize| {
                if name == "head" {
                    0..n.min(len)
                } else {
                    len.saturating_sub(n)..len
                }
            };
            match x {
                Value::Table(table) => Ok(Value::Table(if name == "head" {
                    table.head(n)
                } else {
                    table.tail(n)
                })),
                Value::List(items) => Ok(Value::List(items[take(items.len())].to_vec())),
                Value::Column(column) => {
                    let range = take(column.len());
                    Ok(Value::Column(Column::new(column.name, column.values[range].to_vec())))
                }
                other => Err(wrong_type(name, &other)),
            }
        }
        "sort" => {
            let [x, by, descending] = bind(name, ["x", "by?", "descending?"], args, kwargs)?;
            let descending = descending.truthy()?;
            let order = |a: &Value, b: &Value| {
                if descending {
                    b.sort_cmp(a)
                } else {
                    a.sort_cmp(b)
                }
            };
            match x {
                Value::Table(table) => {
                    let by = expect_string(name, by)?;
                    Ok(Value::Table(table.sort_by(&by, descending)?))
                }
                Value::List(mut items) => {
                    items.sort_by(order);
                    Ok(Value::List(items))
                }
                Value::Column(mut column) => {
                    column.values.sort_by(order);
                    Ok(Value::Column(column))
                }
                other => Err(wrong_type(name, &other)),
            }
        }
        "concat" => {
            let [a, b] = bind(name, ["a", "b"], args, kwargs)?;
            let (a, b) = (expect_table(name, a)?, expect_table(name, b)?);
            Ok(Value::Table(a.concat(&b)?))
        }
        "index" => {
            let [x] = bind(name, ["x"], args, kwargs)?;
            match x {
                Value::Table(table) => Ok(Value::Column(Column::new(
                    "index",
                    table.iter().map(|r| Value::Int(r.index() as i64)).collect(),
                ))),
                Value::Row(row) => Ok(Value::Int(row.index() as i64)),
                other => Err(wrong_type(name, &other)),
            }
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

// =============================================================================
// Argument handling
// =============================================================================

/// Match arguments against `params`. A trailing `?` marks an optional
/// parameter; missing optionals come back as null.
fn bind<const N: usize>(
    function: &str,
    params: [&str; N],
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExprResult<[Value; N]> {
    let required = params.iter().filter(|p| !p.ends_with('?')).count();
    let found = args.len() + kwargs.len();
    let arity = || ExprError::Arity {
        function: function.to_string(),
        expected: if required == N {
            N.to_string()
        } else {
            format!("{} to {}", required, N)
        },
        found,
    };
    if args.len() > N {
        return Err(arity());
    }

    let mut slots: [Option<Value>; N] = std::array::from_fn(|_| None);
    for (slot, value) in slots.iter_mut().zip(args) {
        *slot = Some(value);
    }
    for (key, value) in kwargs {
        let pos = params
            .iter()
            .position(|p| p.trim_end_matches('?') == key)
            .ok_or_else(|| {
                ExprError::Type(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    function, key
                ))
            })?;
        if slots[pos].is_some() {
            return Err(ExprError::Type(format!(
                "{}() got multiple values for argument '{}'",
                function, key
            )));
        }
        slots[pos] = Some(value);
    }
    if params
        .iter()
        .zip(&slots)
        .any(|(p, slot)| slot.is_none() && !p.ends_with('?'))
    {
        return Err(arity());
    }
    Ok(slots.map(Option::unwrap_or_default))
}

fn no_kwargs(function: &str, kwargs: &[(String, Value)]) -> ExprResult<()> {
    match kwargs.first() {
        Some((key, _)) => Err(ExprError::Type(format!(
            "{}() got an unexpected keyword argument '{}'",
            function, key
        ))),
        None => Ok(()),
    }
}

fn wrong_type(function: &str, value: &Value) -> ExprError {
    ExprError::Type(format!(
        "{}() does not accept '{}'",
        function,
        value.type_name()
    ))
}

fn expect_str<'a>(function: &str, value: &'a Value) -> ExprResult<&'a str> {
    value.as_str().ok_or_else(|| wrong_type(function, value))
}

fn expect_string(function: &str, value: Value) -> ExprResult<String> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(wrong_type(function, &other)),
    }
}

fn optional_string(function: &str, value: Value) -> ExprResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        other => expect_string(function, other).map(Some),
    }
}

fn expect_int(function: &str, value: &Value) -> ExprResult<i64> {
    value.as_i64().ok_or_else(|| wrong_type(function, value))
}

fn expect_table(function: &str, value: Value) -> ExprResult<Table> {
    match value {
        Value::Table(table) => Ok(table),
        other => Err(wrong_type(function, &other)),
    }
}

fn items(function: &str, value: Value) -> ExprResult<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items),
        Value::Column(column) => Ok(column.values),
        other => Err(wrong_type(function, &other)),
    }
}

/// Column names given either as separate arguments or as one list.
fn column_names(function: &str, args: impl Iterator<Item = Value>) -> ExprResult<Vec<String>> {
    let mut names = Vec::new();
    for arg in args {
        match arg {
            Value::List(items) => {
                for item in items {
                    names.push(expect_string(function, item)?);
                }
            }
            other => names.push(expect_string(function, other)?),
        }
    }
    Ok(names)
}

/// Apply `f` to a scalar, or to every element of a column.
fn map_all(value: Value, f: impl Fn(Value) -> ExprResult<Value>) -> ExprResult<Value> {
    match value {
        Value::Column(column) => Ok(Value::Column(Column::new(
            column.name,
            column.values.into_iter().map(f).collect::<ExprResult<_>>()?,
        ))),
        other => f(other),
    }
}

/// Like [`map_all`], but nulls pass through without calling `f`.
fn map_present(value: Value, f: impl Fn(Value) -> ExprResult<Value>) -> ExprResult<Value> {
    map_all(value, |v| if v.is_null() { Ok(Value::Null) } else { f(v) })
}

fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Float(f) => f.is_nan(),
        _ => false,
    }
}

// =============================================================================
// Implementations
// =============================================================================

fn to_int(value: Value) -> ExprResult<Value> {
    match value {
        Value::Int(_) => Ok(value),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
        Value::Float(f) => Err(ExprError::Type(format!("cannot convert {} to int", f))),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ExprError::Type(format!("invalid literal for int(): '{}'", s))),
        other => Err(wrong_type("int", &other)),
    }
}

fn to_float(value: Value) -> ExprResult<Value> {
    match value {
        Value::Float(_) => Ok(value),
        Value::Int(_) | Value::Bool(_) => Ok(Value::Float(value.as_f64().unwrap_or_default())),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| ExprError::Type(format!("could not convert string to float: '{}'", s))),
        other => Err(wrong_type("float", &other)),
    }
}

fn round_half_even(x: f64) -> f64 {
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        x.round()
    }
}

fn round(value: Value, ndigits: Option<i64>) -> ExprResult<Value> {
    match (value, ndigits) {
        (Value::Int(i), None) => Ok(Value::Int(i)),
        (Value::Int(i), Some(n)) if n >= 0 => Ok(Value::Int(i)),
        (Value::Bool(b), _) => Ok(Value::Int(b as i64)),
        (Value::Float(f), None) if f.is_finite() => Ok(Value::Int(round_half_even(f) as i64)),
        (Value::Float(f), None) => Err(ExprError::Type(format!("cannot round {} to int", f))),
        (value, Some(n)) => {
            let x = value.as_f64().ok_or_else(|| wrong_type("round", &value))?;
            let factor = 10f64.powi(n.clamp(-308, 308) as i32);
            Ok(Value::Float(round_half_even(x * factor) / factor))
        }
        (other, None) => Err(wrong_type("round", &other)),
    }
}

fn coalesce(args: Vec<Value>) -> ExprResult<Value> {
    let length = args.iter().find_map(|a| match a {
        Value::Column(c) => Some((c.name.clone(), c.len())),
        _ => None,
    });
    let Some((name, len)) = length else {
        return Ok(args.into_iter().find(|v| !is_missing(v)).unwrap_or_default());
    };
    if let Some(Value::Column(c)) = args
        .iter()
        .find(|a| matches!(a, Value::Column(c) if c.len() != len))
    {
        return Err(ExprError::Type(format!(
            "coalesce(): column '{}' has {} values, expected {}",
            c.name,
            c.len(),
            len
        )));
    }
    let values = (0..len)
        .map(|i| {
            args.iter()
                .map(|a| match a {
                    Value::Column(c) => &c.values[i],
                    scalar => scalar,
                })
                .find(|v| !is_missing(v))
                .cloned()
                .unwrap_or_default()
        })
        .collect();
    Ok(Value::Column(Column::new(name, values)))
}

/// Parse a date from text.
///
/// With `format`, only that format (date or date-time) is tried. Otherwise a
/// fixed list of common layouts, including compact `YYYYMMDD`.
pub fn parse_date(text: &str, format: Option<&str>) -> ExprResult<NaiveDate> {
    let text = text.trim();
    let invalid = || ExprError::InvalidDate(text.to_string());

    if format.map_or(true, |f| f == "%Y%m%d") && text.len() == 8 {
        if let Some(date) = compact_date(text) {
            return Ok(date);
        }
    }

    let (dates, datetimes): (&[&str], &[&str]) = match &format {
        Some(f) => (std::slice::from_ref(f), std::slice::from_ref(f)),
        None => (DATE_FORMATS, DATETIME_FORMATS),
    };
    dates
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
        .or_else(|| {
            datetimes
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
                .map(|dt| dt.date())
        })
        .ok_or_else(invalid)
}

fn compact_date(text: &str) -> Option<NaiveDate> {
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = text.get(0..4)?.parse().ok()?;
    let month = text.get(4..6)?.parse().ok()?;
    let day = text.get(6..8)?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn to_date(value: Value, format: Option<&str>) -> ExprResult<NaiveDate> {
    match value {
        Value::Date(d) => Ok(d),
        Value::Str(s) => parse_date(&s, format),
        Value::Int(i) => compact_date(&i.to_string()).ok_or_else(|| ExprError::InvalidDate(i.to_string())),
        other => Err(wrong_type("date", &other)),
    }
}

fn to_delta(value: Value) -> ExprResult<Value> {
    match value {
        Value::Str(s) => Delta::parse(&s).map(Value::Delta),
        Value::Delta(d) => Ok(Value::Delta(d)),
        other => Err(ExprError::Type(format!(
            "Invalid delta-object: expected str or delta, got '{}'",
            other.type_name()
        ))),
    }
}

fn get(container: Value, key: Value, default: Value) -> ExprResult<Value> {
    let key_string = || match &key {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(match &container {
        Value::Null => default,
        Value::Map(map) => map.get(&key_string()).cloned().unwrap_or(default),
        Value::Row(row) => row.get(&key_string()).cloned().unwrap_or(default),
        Value::Table(table) => match table.column(&key_string()) {
            Ok(column) => Value::Column(column),
            Err(_) => default,
        },
        Value::List(items) => {
            let i = expect_int("get", &key)?;
            let pos = if i < 0 { items.len() as i64 + i } else { i };
            usize::try_from(pos)
                .ok()
                .and_then(|p| items.get(p))
                .cloned()
                .unwrap_or(default)
        }
        other => return Err(wrong_type("get", other)),
    })
}

fn assign(interp: &Interpreter, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> ExprResult<Value> {
    let found = args.len() + kwargs.len();
    let mut args = args.into_iter();
    let mut table = expect_table("assign", args.next().unwrap_or_default())?;

    let mut columns: Vec<(String, Value)> = Vec::new();
    match (args.next(), args.next(), args.next()) {
        (None, None, None) => {}
        (Some(name), Some(value), None) => columns.push((expect_string("assign", name)?, value)),
        _ => {
            return Err(ExprError::Arity {
                function: "assign".to_string(),
                expected: "1 or 3 positional".to_string(),
                found,
            })
        }
    }
    columns.extend(kwargs);

    for (name, value) in columns {
        let value = match value {
            f @ Value::Function(_) => interp.call(&f, vec![Value::Table(table.clone())], Vec::new())?,
            other => other,
        };
        let column = match value {
            Value::Column(c) => Column::new(name, c.values),
            Value::List(items) => Column::new(name, items),
            scalar => Column::new(name, vec![scalar; table.len()]),
        };
        table = table.with_column(column)?;
    }
    Ok(Value::Table(table))
}

/// Keep rows whose flag in `mask` is true; nulls count as false.
pub(crate) fn mask_rows(table: &Table, mask: &Column) -> ExprResult<Table> {
    if mask.len() != table.len() {
        return Err(ExprError::Type(format!(
            "boolean mask has {} values, table has {} rows",
            mask.len(),
            table.len()
        )));
    }
    let mut flags = mask.values.iter();
    table.filter_rows(|_| match flags.next() {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Null) | None => Ok(false),
        Some(other) => Err(ExprError::Type(format!(
            "boolean mask holds '{}'",
            other.type_name()
        ))),
    })
}

fn regex(pattern: &str) -> ExprResult<Regex> {
    let mut cache = REGEX_CACHE
        .lock()
        .map_err(|_| ExprError::Regex("regex cache poisoned".to_string()))?;
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern).map_err(|e| ExprError::Regex(e.to_string()))?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Rewrite `\1` and `\g<name>` group references for the regex crate.
fn backref_replacement(repl: &str) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{}}}", group));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let group: String = chars.by_ref().take_while(|&c| c != '>').collect();
                        out.push_str(&format!("${{{}}}", group));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}
