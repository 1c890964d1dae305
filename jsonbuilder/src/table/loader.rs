//! Delimited text and workbook loading with encoding and delimiter auto-detection.
//!
//! Produces a typed [`Table`]: every column is inferred independently (integers,
//! floats, booleans, otherwise strings), blank cells become nulls.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::Table;
use crate::error::{TableError, TableResult};
use crate::models::Value;

/// Delimiters tried by [`sniff_delimiter`], in tie-break order.
const DELIMITER_CANDIDATES: [char; 4] = [',', ';', '\t', '|'];

/// How much of the decoded text is inspected when sniffing the delimiter.
const SNIFF_CHARS: usize = 10_000;

/// Cell texts treated as missing values.
const NA_VALUES: [&str; 12] = [
    "", "NA", "N/A", "n/a", "NaN", "nan", "-NaN", "-nan", "null", "NULL", "#N/A", "<NA>",
];

/// Extensions handled by the workbook loader.
const WORKBOOK_EXTENSIONS: [&str; 5] = ["xlsx", "xls", "xlsm", "xlsb", "ods"];

/// Sheet selector: position in the workbook or sheet name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SheetRef {
    Index(usize),
    Name(String),
}

/// Loader options, read from the `table_kwargs` section of a format file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    /// Field delimiter; sniffed when absent.
    #[serde(alias = "delimiter")]
    pub sep: Option<String>,

    /// Text encoding label (`utf-8`, `latin1`, `cp1252`, ...); detected when absent.
    pub encoding: Option<String>,

    /// Workbook sheet; defaults to the first sheet.
    pub sheet_name: Option<SheetRef>,

    /// Records skipped before the header record (blank lines never count).
    pub skiprows: usize,

    /// `"str"` keeps every cell as text.
    pub dtype: Option<String>,

    /// Anything else; reported and ignored.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TableOptions {
    pub fn keep_strings(&self) -> bool {
        matches!(self.dtype.as_deref(), Some("str") | Some("string") | Some("object"))
    }

    pub fn delimiter(&self) -> TableResult<Option<u8>> {
        match self.sep.as_deref() {
            None => Ok(None),
            Some("\\t") => Ok(Some(b'\t')),
            Some(sep) => {
                let mut chars = sep.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii() => Ok(Some(c as u8)),
                    _ => Err(TableError::Delimiter(sep.to_string())),
                }
            }
        }
    }
}

/// Load a table from `path`.
///
/// Workbook extensions go straight to the workbook loader. Anything else is
/// parsed as delimited text; if that fails and workbook support is compiled in,
/// the workbook loader gets a second try.
pub fn load_table(path: &Path, options: &TableOptions, raw_header: bool) -> TableResult<Table> {
    info!("Loading table {}", path.display());

    for key in options.extra.keys() {
        warn!("Ignoring unsupported table option '{}'", key);
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let table = if WORKBOOK_EXTENSIONS.contains(&extension.as_str()) {
        load_workbook(path, options, raw_header)
    } else {
        load_delimited_file(path, options, raw_header).or_else(|err| {
            if cfg!(feature = "excel") {
                debug!("Delimited parse failed ({}), trying workbook loader", err);
                load_workbook(path, options, raw_header).map_err(|_| err)
            } else {
                Err(err)
            }
        })
    };

    match table {
        Ok(table) => {
            info!(
                "Loaded {} rows x {} columns",
                table.len(),
                table.columns().len()
            );
            Ok(table)
        }
        Err(err) => {
            error!("Failed to load table {}: {}", path.display(), err);
            Err(err)
        }
    }
}

fn load_delimited_file(path: &Path, options: &TableOptions, raw_header: bool) -> TableResult<Table> {
    let bytes = std::fs::read(path)?;
    let content = match options.encoding.as_deref() {
        Some(label) => decode_content(&bytes, label)?,
        None => {
            let encoding = detect_encoding(&bytes);
            debug!("Detected encoding {}", encoding);
            decode_content(&bytes, &encoding)?
        }
    };
    let delimiter = match options.delimiter()? {
        Some(d) => d,
        None => {
            let sniffed = sniff_delimiter(&content);
            debug!("Sniffed delimiter {:?}", sniffed);
            sniffed as u8
        }
    };
    parse_delimited(&content, delimiter, options, raw_header)
}

/// Detect the encoding of raw bytes using chardet.
pub fn detect_encoding(bytes: &[u8]) -> String {
    let (charset, _, _) = chardet::detect(bytes);
    match charset.to_lowercase().as_str() {
        "" | "ascii" | "utf-8" | "utf8" => "utf-8".to_string(),
        "iso-8859-1" | "iso-8859-15" | "latin-1" | "latin1" => "iso-8859-1".to_string(),
        "windows-1252" | "cp1252" => "windows-1252".to_string(),
        other => other.to_string(),
    }
}

/// Decode bytes with the encoding named by `label`.
///
/// UTF-8 falls back to lossy decoding; labels unknown to `encoding_rs` fail.
pub fn decode_content(bytes: &[u8], label: &str) -> TableResult<String> {
    let lower = label.to_lowercase();
    match lower.as_str() {
        "utf-8" | "utf8" | "ascii" => Ok(String::from_utf8_lossy(bytes).into_owned()),
        "latin1" | "latin-1" => Ok(encoding_rs::WINDOWS_1252.decode(bytes).0.into_owned()),
        _ => {
            let encoding = encoding_rs::Encoding::for_label(lower.as_bytes())
                .ok_or_else(|| TableError::Encoding(label.to_string()))?;
            Ok(encoding.decode(bytes).0.into_owned())
        }
    }
}

/// Pick the delimiter occurring most often in the head of `content`.
///
/// Ties go to the candidate listed first; no candidate at all gives `,`.
pub fn sniff_delimiter(content: &str) -> char {
    let head: String = content.chars().take(SNIFF_CHARS).collect();
    let mut best = DELIMITER_CANDIDATES[0];
    let mut best_count = 0;
    for candidate in DELIMITER_CANDIDATES {
        let count = head.matches(candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Lower-case a header, trimming it and turning `-` and spaces into `_`.
pub fn normalize_header(name: &str) -> String {
    name.trim().to_lowercase().replace(['-', ' '], "_")
}

/// Parse delimited text into a typed table.
///
/// The first line after `skiprows` is the header. Blank lines are skipped,
/// short lines are padded with nulls, long lines are an error.
pub fn parse_delimited(
    content: &str,
    delimiter: u8,
    options: &TableOptions,
    raw_header: bool,
) -> TableResult<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(content.trim_start_matches('\u{feff}').as_bytes());

    let mut records = reader.records().skip(options.skiprows);

    let header = records.next().ok_or(TableError::Empty)??;
    let columns: Vec<String> = header
        .iter()
        .map(|h| if raw_header { h.to_string() } else { normalize_header(h) })
        .collect();

    let mut cells: Vec<Vec<String>> = vec![Vec::new(); columns.len()];
    let mut row_count = 0;
    for record in records {
        let record = record?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        row_count += 1;
        if record.len() > columns.len() {
            return Err(TableError::RaggedRow {
                row: row_count,
                expected: columns.len(),
                found: record.len(),
            });
        }
        for (i, column) in cells.iter_mut().enumerate() {
            column.push(record.get(i).unwrap_or("").to_string());
        }
    }

    let typed: Vec<Vec<Value>> = cells
        .into_iter()
        .map(|raw| {
            if options.keep_strings() {
                raw.into_iter().map(text_cell).collect()
            } else {
                infer_column(raw)
            }
        })
        .collect();

    Table::new(columns, transpose(typed, row_count))
}

fn transpose(columns: Vec<Vec<Value>>, row_count: usize) -> Vec<Vec<Value>> {
    let mut rows: Vec<Vec<Value>> = (0..row_count)
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, value) in rows.iter_mut().zip(column) {
            row.push(value);
        }
    }
    rows
}

fn is_na(text: &str) -> bool {
    NA_VALUES.contains(&text.trim())
}

fn text_cell(text: String) -> Value {
    if is_na(&text) {
        Value::Null
    } else {
        Value::Str(text)
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "True" | "TRUE" | "true" => Some(true),
        "False" | "FALSE" | "false" => Some(false),
        _ => None,
    }
}

/// Type one column of raw cell text.
///
/// All integers without blanks stay integers; numbers with blanks or decimals
/// become floats; booleans stay booleans; anything else is text.
fn infer_column(raw: Vec<String>) -> Vec<Value> {
    let present: Vec<&str> = raw.iter().map(|s| s.trim()).filter(|s| !is_na(s)).collect();
    if present.is_empty() {
        return raw.into_iter().map(|_| Value::Null).collect();
    }
    let has_blanks = present.len() < raw.len();

    if !has_blanks && present.iter().all(|s| s.parse::<i64>().is_ok()) {
        return raw
            .iter()
            .map(|s| s.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::Null))
            .collect();
    }
    if present.iter().all(|s| s.parse::<f64>().is_ok()) {
        return raw
            .iter()
            .map(|s| match s.trim().parse::<f64>() {
                Ok(f) if !is_na(s) => Value::Float(f),
                _ => Value::Null,
            })
            .collect();
    }
    if present.iter().all(|s| parse_bool(s).is_some()) {
        return raw
            .iter()
            .map(|s| parse_bool(s).map(Value::Bool).unwrap_or(Value::Null))
            .collect();
    }
    raw.into_iter().map(text_cell).collect()
}

#[cfg(feature = "excel")]
fn load_workbook(path: &Path, options: &TableOptions, raw_header: bool) -> TableResult<Table> {
    use calamine::{open_workbook_auto, Data, Reader};

    let mut workbook = open_workbook_auto(path)?;
    let sheets = workbook.sheet_names().to_vec();
    let sheet = match &options.sheet_name {
        None => sheets.first().cloned().ok_or(TableError::Empty)?,
        Some(SheetRef::Index(i)) => sheets
            .get(*i)
            .cloned()
            .ok_or_else(|| TableError::SheetNotFound(i.to_string()))?,
        Some(SheetRef::Name(name)) => {
            if !sheets.contains(name) {
                return Err(TableError::SheetNotFound(name.clone()));
            }
            name.clone()
        }
    };
    debug!("Reading sheet '{}'", sheet);

    let range = workbook.worksheet_range(&sheet)?;
    let mut rows = range.rows().skip(options.skiprows);
    let header = rows.next().ok_or(TableError::Empty)?;
    let columns: Vec<String> = header
        .iter()
        .map(|c| {
            let text = cell_text(c);
            if raw_header {
                text
            } else {
                normalize_header(&text)
            }
        })
        .collect();

    let mut cells: Vec<Vec<Value>> = vec![Vec::new(); columns.len()];
    let mut row_count = 0;
    for row in rows {
        if row.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        row_count += 1;
        for (i, column) in cells.iter_mut().enumerate() {
            let cell = row.get(i).unwrap_or(&Data::Empty);
            column.push(if options.keep_strings() {
                match cell {
                    Data::Empty => Value::Null,
                    other => Value::Str(cell_text(other)),
                }
            } else {
                cell_value(cell)
            });
        }
    }

    let typed = cells.into_iter().map(integral_column).collect();
    Table::new(columns, transpose(typed, row_count))
}

#[cfg(not(feature = "excel"))]
fn load_workbook(path: &Path, _options: &TableOptions, _raw_header: bool) -> TableResult<Table> {
    Err(TableError::UnsupportedFormat(
        path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string(),
    ))
}

#[cfg(feature = "excel")]
fn cell_text(c: &calamine::Data) -> String {
    match c {
        calamine::Data::String(s) => s.clone(),
        calamine::Data::Float(f) if f.fract() == 0.0 => (*f as i64).to_string(),
        other => other.to_string(),
    }
}

#[cfg(feature = "excel")]
fn cell_value(c: &calamine::Data) -> Value {
    use calamine::Data;

    match c {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::String(s) => text_cell(s.clone()),
        Data::Int(i) => Value::Int(*i),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => serial_to_date(dt.as_f64()),
        Data::DateTimeIso(s) => chrono::NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or_else(|_| Value::Str(s.clone())),
        Data::DurationIso(s) => Value::Str(s.clone()),
    }
}

/// Workbook serial date (days since 1899-12-30) to a calendar date.
#[cfg(feature = "excel")]
fn serial_to_date(serial: f64) -> Value {
    chrono::NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(serial.floor() as i64)))
        .map(Value::Date)
        .unwrap_or(Value::Float(serial))
}

/// Workbooks store every number as a float; whole-number columns without
/// blanks become integer columns.
#[cfg(feature = "excel")]
fn integral_column(values: Vec<Value>) -> Vec<Value> {
    let integral = !values.is_empty()
        && values.iter().all(|v| match v {
            Value::Int(_) => true,
            Value::Float(f) => f.fract() == 0.0 && f.abs() < i64::MAX as f64,
            _ => false,
        });
    if !integral {
        return values;
    }
    values
        .into_iter()
        .map(|v| match v {
            Value::Float(f) => Value::Int(f as i64),
            other => other,
        })
        .collect()
}
