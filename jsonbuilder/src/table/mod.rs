//! In-memory tabular dataset.
//!
//! A [`Table`] is an ordered list of [`Row`]s sharing one header. Rows keep the
//! 1-based index they were loaded with, so filtered or grouped subsets still
//! report the original position in diagnostics. Rows are reference counted,
//! which keeps row-set narrowing (filter, group-by) cheap.

pub mod loader;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::error::{TableError, TableResult};
use crate::models::{Map, Value};

pub use loader::{load_table, normalize_header, parse_delimited, sniff_delimiter, TableOptions};

/// Column names plus a name -> position index.
#[derive(Debug, PartialEq)]
pub struct Header {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Header {
    pub fn new(names: Vec<String>) -> Self {
        let mut positions = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            // First occurrence wins for duplicated headers.
            positions.entry(name.clone()).or_insert(i);
        }
        Self { names, positions }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One row of a [`Table`].
#[derive(Debug, Clone)]
pub struct Row {
    index: usize,
    header: Arc<Header>,
    cells: Arc<[Value]>,
}

impl Row {
    /// Stable 1-based position in the loaded table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cell value for `column`, if the column exists.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.header.position(column).and_then(|i| self.cells.get(i))
    }

    pub fn columns(&self) -> &[String] {
        self.header.names()
    }

    pub fn cells(&self) -> &[Value] {
        &self.cells
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.header
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.cells.iter())
    }

    /// Column name -> value, in column order.
    pub fn to_map(&self) -> Map {
        self.iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.header.names() == other.header.names()
            && self.cells == other.cells
    }
}

/// A named sequence of values, e.g. one column pulled out of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered rows with named columns.
#[derive(Debug, Clone)]
pub struct Table {
    header: Arc<Header>,
    rows: Vec<Row>,
}

impl Table {
    /// Build a table from column names and row-major cells.
    ///
    /// Rows are indexed from 1 in the given order.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> TableResult<Self> {
        let header = Arc::new(Header::new(columns));
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, cells)| {
                if cells.len() != header.len() {
                    return Err(TableError::RaggedRow {
                        row: i + 1,
                        expected: header.len(),
                        found: cells.len(),
                    });
                }
                Ok(Row {
                    index: i + 1,
                    header: Arc::clone(&header),
                    cells: cells.into(),
                })
            })
            .collect::<TableResult<Vec<_>>>()?;
        Ok(Self { header, rows })
    }

    /// A table with columns but no rows.
    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            header: Arc::new(Header::new(columns)),
            rows: Vec::new(),
        }
    }

    fn subset(&self, rows: Vec<Row>) -> Self {
        Self {
            header: Arc::clone(&self.header),
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        self.header.names()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.header.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Keep rows for which `predicate` returns `Ok(true)`, in order.
    ///
    /// The first predicate error aborts the filter.
    pub fn filter_rows<F, E>(&self, mut predicate: F) -> Result<Self, E>
    where
        F: FnMut(&Row) -> Result<bool, E>,
    {
        let mut kept = Vec::new();
        for row in &self.rows {
            if predicate(row)? {
                kept.push(row.clone());
            }
        }
        Ok(self.subset(kept))
    }

    /// Partition rows by the distinct combinations of `columns`.
    ///
    /// Groups come out in first-seen order, rows inside a group keep table
    /// order. Rows with a null in any key column belong to no group.
    pub fn group_by(&self, columns: &[String]) -> TableResult<Vec<Self>> {
        let positions = columns
            .iter()
            .map(|c| {
                self.header
                    .position(c)
                    .ok_or_else(|| TableError::UnknownColumn(c.clone()))
            })
            .collect::<TableResult<Vec<_>>>()?;

        let mut slots: HashMap<Vec<GroupKey>, usize> = HashMap::new();
        let mut groups: Vec<Vec<Row>> = Vec::new();

        for row in &self.rows {
            let cells: Vec<&Value> = positions.iter().map(|&p| &row.cells[p]).collect();
            if cells.iter().any(|v| v.is_null()) {
                continue;
            }
            let key = cells.into_iter().map(GroupKey::from).collect();
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(row.clone());
        }

        Ok(groups.into_iter().map(|rows| self.subset(rows)).collect())
    }

    pub fn head(&self, n: usize) -> Self {
        self.subset(self.rows.iter().take(n).cloned().collect())
    }

    pub fn tail(&self, n: usize) -> Self {
        let skip = self.rows.len().saturating_sub(n);
        self.subset(self.rows.iter().skip(skip).cloned().collect())
    }

    /// First `n` rows followed by the last `n`; the whole table when they
    /// would overlap.
    pub fn head_tail(&self, n: usize) -> Self {
        if self.rows.len() <= 2 * n {
            return self.clone();
        }
        let mut rows = self.rows[..n].to_vec();
        rows.extend_from_slice(&self.rows[self.rows.len() - n..]);
        self.subset(rows)
    }

    /// Rows at positions `start..end` (clamped to the table).
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.rows.len());
        let start = start.min(end);
        self.subset(self.rows[start..end].to_vec())
    }

    /// Rows of `self` followed by rows of `other`; headers must match.
    pub fn concat(&self, other: &Self) -> TableResult<Self> {
        if self.columns() != other.columns() {
            let missing = other
                .columns()
                .iter()
                .find(|c| !self.has_column(c))
                .or_else(|| self.columns().iter().find(|c| !other.has_column(c)))
                .cloned()
                .unwrap_or_default();
            return Err(TableError::UnknownColumn(missing));
        }
        let mut rows = self.rows.clone();
        rows.extend(other.rows.iter().map(|r| Row {
            index: r.index,
            header: Arc::clone(&self.header),
            cells: Arc::clone(&r.cells),
        }));
        Ok(self.subset(rows))
    }

    /// Values of one column, in row order.
    pub fn column(&self, name: &str) -> TableResult<Column> {
        let pos = self
            .header
            .position(name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))?;
        let values = self.rows.iter().map(|r| r.cells[pos].clone()).collect();
        Ok(Column::new(name, values))
    }

    /// Replace the column with the same name, or append it.
    pub fn with_column(&self, column: Column) -> TableResult<Self> {
        let found = column.len();
        if found != self.rows.len() {
            return Err(TableError::ColumnLength {
                name: column.name,
                expected: self.rows.len(),
                found,
            });
        }

        let existing = self.header.position(&column.name);
        let mut names = self.header.names().to_vec();
        if existing.is_none() {
            names.push(column.name.clone());
        }
        let header = Arc::new(Header::new(names));

        let rows = self
            .rows
            .iter()
            .zip(column.values)
            .map(|(row, value)| {
                let mut cells = row.cells.to_vec();
                match existing {
                    Some(pos) => cells[pos] = value,
                    None => cells.push(value),
                }
                Row {
                    index: row.index,
                    header: Arc::clone(&header),
                    cells: cells.into(),
                }
            })
            .collect();

        Ok(Self { header, rows })
    }

    /// Keep only `names`, in the given order.
    pub fn select(&self, names: &[String]) -> TableResult<Self> {
        let positions = names
            .iter()
            .map(|n| {
                self.header
                    .position(n)
                    .ok_or_else(|| TableError::UnknownColumn(n.clone()))
            })
            .collect::<TableResult<Vec<_>>>()?;
        Ok(self.project(names.to_vec(), &positions))
    }

    /// Remove `names`; every name must exist.
    pub fn drop_columns(&self, names: &[String]) -> TableResult<Self> {
        if let Some(missing) = names.iter().find(|n| !self.has_column(n)) {
            return Err(TableError::UnknownColumn(missing.clone()));
        }
        let (kept, positions): (Vec<String>, Vec<usize>) = self
            .header
            .names()
            .iter()
            .enumerate()
            .filter(|(_, n)| !names.contains(n))
            .map(|(i, n)| (n.clone(), i))
            .unzip();
        Ok(self.project(kept, &positions))
    }

    /// Rename columns by `(old, new)` pairs; names not listed are kept.
    pub fn rename(&self, mapping: &[(String, String)]) -> TableResult<Self> {
        if let Some((missing, _)) = mapping.iter().find(|(old, _)| !self.has_column(old)) {
            return Err(TableError::UnknownColumn(missing.clone()));
        }
        let names = self
            .header
            .names()
            .iter()
            .map(|name| {
                mapping
                    .iter()
                    .find(|(old, _)| old == name)
                    .map(|(_, new)| new.clone())
                    .unwrap_or_else(|| name.clone())
            })
            .collect();
        let positions: Vec<usize> = (0..self.header.len()).collect();
        Ok(self.project(names, &positions))
    }

    fn project(&self, names: Vec<String>, positions: &[usize]) -> Self {
        let header = Arc::new(Header::new(names));
        let rows = self
            .rows
            .iter()
            .map(|row| Row {
                index: row.index,
                header: Arc::clone(&header),
                cells: positions.iter().map(|&p| row.cells[p].clone()).collect(),
            })
            .collect();
        Self { header, rows }
    }

    /// Stable sort by one column. Nulls go last.
    pub fn sort_by(&self, name: &str, descending: bool) -> TableResult<Self> {
        let pos = self
            .header
            .position(name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))?;
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| {
            let (x, y) = (&a.cells[pos], &b.cells[pos]);
            match (x.is_null(), y.is_null()) {
                (true, true) => std::cmp::Ordering::Equal,
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => {
                    let ord = x.sort_cmp(y);
                    if descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
            }
        });
        Ok(self.subset(rows))
    }

    /// Rows as ordered maps (column -> value).
    pub fn to_records(&self) -> Vec<Map> {
        self.rows.iter().map(Row::to_map).collect()
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.columns() == other.columns() && self.rows == other.rows
    }
}

impl fmt::Display for Table {
    /// Aligned text grid with the row index in the first column.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows.is_empty() {
            return write!(
                f,
                "Empty table\nColumns: [{}]\nIndex: []",
                self.columns().join(", ")
            );
        }

        let mut grid: Vec<Vec<String>> = Vec::with_capacity(self.rows.len() + 1);
        let mut head = vec![String::new()];
        head.extend(self.columns().iter().cloned());
        grid.push(head);
        for row in &self.rows {
            let mut line = vec![row.index.to_string()];
            line.extend(row.cells.iter().map(|v| match v {
                Value::Null => "NaN".to_string(),
                other => other.to_string(),
            }));
            grid.push(line);
        }

        let widths: Vec<usize> = (0..grid[0].len())
            .map(|c| grid.iter().map(|l| l[c].chars().count()).max().unwrap_or(0))
            .collect();

        for (i, line) in grid.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let cells: Vec<String> = line
                .iter()
                .zip(&widths)
                .map(|(cell, &w)| format!("{:<w$}", cell, w = w))
                .collect();
            write!(f, "{}", cells.join("  ").trim_end())?;
        }
        Ok(())
    }
}

/// Hashable form of a key cell. Integral floats share the integer's key, so
/// `1` and `1.0` land in one group as they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Date(NaiveDate),
    Other(String),
}

impl From<&Value> for GroupKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Bool(b) => GroupKey::Bool(*b),
            Value::Int(i) => GroupKey::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                GroupKey::Int(*f as i64)
            }
            Value::Float(f) if f.is_nan() => GroupKey::Float(f64::NAN.to_bits()),
            Value::Float(f) => GroupKey::Float(f.to_bits()),
            Value::Str(s) => GroupKey::Str(s.clone()),
            Value::Date(d) => GroupKey::Date(*d),
            other => GroupKey::Other(format!("{}:{}", other.type_name(), other.repr())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(
            vec!["ccy".into(), "tenor".into(), "rate".into()],
            vec![
                vec!["USD".into(), "1m".into(), Value::Float(1.5)],
                vec!["EUR".into(), "1m".into(), Value::Float(0.5)],
                vec!["USD".into(), "3m".into(), Value::Float(1.7)],
                vec![Value::Null, "6m".into(), Value::Float(2.0)],
                vec!["EUR".into(), "3m".into(), Value::Float(0.6)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rows_are_indexed_from_one() {
        let t = sample();
        let idx: Vec<usize> = t.iter().map(Row::index).collect();
        assert_eq!(idx, vec![1, 2, 3, 4, 5]);
        assert_eq!(t.rows()[0].get("ccy"), Some(&Value::from("USD")));
        assert_eq!(t.rows()[0].get("missing"), None);
    }

    #[test]
    fn test_ragged_row_rejected() {
        let err = Table::new(vec!["a".into(), "b".into()], vec![vec![Value::Int(1)]]).unwrap_err();
        assert!(matches!(err, TableError::RaggedRow { row: 1, expected: 2, found: 1 }));
    }

    #[test]
    fn test_filter_keeps_original_index() {
        let t = sample();
        let out = t
            .filter_rows(|r| Ok::<_, TableError>(r.get("ccy") == Some(&Value::from("EUR"))))
            .unwrap();
        let idx: Vec<usize> = out.iter().map(Row::index).collect();
        assert_eq!(idx, vec![2, 5]);
    }

    #[test]
    fn test_group_by_first_seen_order_skips_null_keys() {
        let t = sample();
        let groups = t.group_by(&["ccy".to_string()]).unwrap();
        assert_eq!(groups.len(), 2);
        let first: Vec<usize> = groups[0].iter().map(Row::index).collect();
        let second: Vec<usize> = groups[1].iter().map(Row::index).collect();
        assert_eq!(first, vec![1, 3]);
        assert_eq!(second, vec![2, 5]);
    }

    #[test]
    fn test_group_by_multiple_columns() {
        let t = sample();
        let groups = t.group_by(&["tenor".to_string(), "ccy".to_string()]).unwrap();
        let sizes: Vec<usize> = groups.iter().map(Table::len).collect();
        assert_eq!(sizes, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_group_by_keys_follow_value_equality() {
        let t = Table::new(
            vec!["k".into()],
            vec![
                vec![Value::Int(1)],
                vec![Value::from("1")],
                vec![Value::Float(1.0)],
                vec![Value::Float(1.5)],
                vec![Value::Bool(true)],
                vec![Value::Float(1.5)],
            ],
        )
        .unwrap();
        let groups = t.group_by(&["k".to_string()]).unwrap();
        let members: Vec<Vec<usize>> = groups
            .iter()
            .map(|g| g.iter().map(Row::index).collect())
            .collect();
        assert_eq!(members, vec![vec![1, 3], vec![2], vec![4, 6], vec![5]]);
    }

    #[test]
    fn test_group_by_unknown_column() {
        let err = sample().group_by(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, TableError::UnknownColumn(c) if c == "nope"));
    }

    #[test]
    fn test_with_column_replaces_and_appends() {
        let t = sample();
        let flags = Column::new("flag", vec![Value::Bool(true); 5]);
        let t2 = t.with_column(flags).unwrap();
        assert_eq!(t2.columns().len(), 4);
        assert_eq!(t2.rows()[4].get("flag"), Some(&Value::Bool(true)));
        assert_eq!(t2.rows()[4].index(), 5);

        let ccy = Column::new("ccy", vec![Value::from("X"); 5]);
        let t3 = t2.with_column(ccy).unwrap();
        assert_eq!(t3.columns().len(), 4);
        assert_eq!(t3.rows()[0].get("ccy"), Some(&Value::from("X")));

        let short = Column::new("short", vec![Value::Null]);
        assert!(matches!(
            t.with_column(short),
            Err(TableError::ColumnLength { name, expected: 5, found: 1 }) if name == "short"
        ));
    }

    #[test]
    fn test_head_tail_slice() {
        let t = sample();
        assert_eq!(t.head(2).len(), 2);
        assert_eq!(t.tail(2).rows()[0].index(), 4);
        assert_eq!(t.slice(1, 3).rows()[1].index(), 3);
        assert_eq!(t.slice(4, 99).len(), 1);
        assert_eq!(t.head(2).concat(&t.tail(1)).unwrap().len(), 3);
        let edges: Vec<usize> = t.head_tail(2).iter().map(Row::index).collect();
        assert_eq!(edges, vec![1, 2, 4, 5]);
        assert_eq!(t.head_tail(3).len(), 5);
    }

    #[test]
    fn test_select_drop_sort() {
        let t = sample();
        let sel = t.select(&["rate".to_string(), "ccy".to_string()]).unwrap();
        assert_eq!(sel.columns(), &["rate".to_string(), "ccy".to_string()]);
        let dropped = t.drop_columns(&["tenor".to_string()]).unwrap();
        assert_eq!(dropped.columns(), &["ccy".to_string(), "rate".to_string()]);
        let sorted = t.sort_by("rate", false).unwrap();
        let idx: Vec<usize> = sorted.iter().map(Row::index).collect();
        assert_eq!(idx, vec![2, 5, 1, 3, 4]);
    }

    #[test]
    fn test_rename_keeps_cells() {
        let t = sample();
        let renamed = t
            .rename(&[("ccy".to_string(), "currency".to_string())])
            .unwrap();
        assert_eq!(renamed.columns()[0], "currency");
        assert_eq!(renamed.rows()[0].get("currency"), t.rows()[0].get("ccy"));
        assert!(t.rename(&[("nope".to_string(), "x".to_string())]).is_err());
    }

    #[test]
    fn test_display_grid() {
        let t = sample().head(1);
        let text = t.to_string();
        assert!(text.starts_with("   ccy"));
        assert!(text.contains("1  USD"));
        let empty = Table::empty(vec!["a".into()]);
        assert!(empty.to_string().contains("Empty table"));
    }
}
