//! Bounded views of the table kept for inspection while transforms run.

use crate::table::Table;

/// Tables longer than this are reduced to their head and tail.
pub const SNAPSHOT_THRESHOLD: usize = 40;
/// Rows kept from each end of a long table.
pub const SNAPSHOT_EDGE: usize = 20;

/// Take a snapshot of `table`.
///
/// With `inspect_row` set to a 1-based row strictly inside the table, the
/// snapshot is that row with its two neighbours (`inspect_row - 1` through
/// `inspect_row + 1`). Otherwise a long table is cut to its first and last
/// [`SNAPSHOT_EDGE`] rows and a short one is copied whole.
pub fn snapshot(table: &Table, inspect_row: Option<usize>) -> Table {
    match inspect_row {
        Some(row) if row > 1 && row < table.len() => table.slice(row - 2, row + 1),
        _ if table.len() > SNAPSHOT_THRESHOLD => table.head_tail(SNAPSHOT_EDGE),
        _ => table.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    fn numbered(n: i64) -> Table {
        Table::new(
            vec!["n".into()],
            (1..=n).map(|i| vec![Value::Int(i)]).collect(),
        )
        .unwrap()
    }

    fn values(table: &Table) -> Vec<Value> {
        table.column("n").unwrap().values
    }

    #[test]
    fn test_short_table_copied_whole() {
        let table = numbered(40);
        assert_eq!(snapshot(&table, None), table);
    }

    #[test]
    fn test_long_table_head_and_tail() {
        let snap = snapshot(&numbered(50), None);
        assert_eq!(snap.len(), 40);
        let values = values(&snap);
        assert_eq!(values[19], Value::Int(20));
        assert_eq!(values[20], Value::Int(31));
    }

    #[test]
    fn test_inspect_row_window() {
        let snap = snapshot(&numbered(50), Some(10));
        assert_eq!(
            values(&snap),
            vec![Value::Int(9), Value::Int(10), Value::Int(11)]
        );
        assert_eq!(snap.rows()[0].index(), 9);
    }

    #[test]
    fn test_inspect_row_out_of_range_falls_back() {
        let table = numbered(5);
        assert_eq!(snapshot(&table, Some(1)), table);
        assert_eq!(snapshot(&table, Some(5)), table);
        assert_eq!(snapshot(&numbered(45), Some(45)).len(), 40);
    }
}
