// 📂 Tabular Data Loader
// Discovers spreadsheet files, reads them through one reader per format and
// normalizes them into typed datasets.

use crate::config::AgentConfig;
use crate::dataset::{Cell, Dataset, DatasetKind, NormalizationReport, Row};
use crate::error::AgentError;
use crate::schema::{normalize_header, resolve_roles, ColumnRole};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub type DatasetMap = BTreeMap<DatasetKind, Dataset>;

// ============================================================================
// RAW TABLE
// ============================================================================

/// Output of a reader, before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl RawTable {
    /// Pad or cut every row to the header width
    fn squared(mut self) -> Self {
        let width = self.headers.len();
        for row in &mut self.rows {
            row.resize(width, Cell::Empty);
        }
        self
    }
}

// ============================================================================
// READERS
// ============================================================================

/// TableReader - one implementation per file format
pub trait TableReader: Send + Sync {
    /// Read the first table in the file
    fn read(&self, path: &Path) -> Result<RawTable>;

    /// Format name for logs
    fn format(&self) -> &'static str;
}

pub struct CsvReader;

impl TableReader for CsvReader {
    fn read(&self, path: &Path) -> Result<RawTable> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;

        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed to read CSV headers in {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for (line_num, result) in reader.records().enumerate() {
            let record = result.with_context(|| {
                format!("Failed to parse CSV line {} in {}", line_num + 2, path.display())
            })?;
            rows.push(record.iter().map(Cell::from_text).collect());
        }

        Ok(RawTable { headers, rows }.squared())
    }

    fn format(&self) -> &'static str {
        "csv"
    }
}

/// Array of objects, or `{ "data": [...] }`
pub struct JsonReader;

impl TableReader for JsonReader {
    fn read(&self, path: &Path) -> Result<RawTable> {
        use serde_json::Value;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;
        let json: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON from {}", path.display()))?;

        let items = match &json {
            Value::Array(items) => items,
            Value::Object(obj) => obj
                .get("data")
                .and_then(|d| d.as_array())
                .ok_or_else(|| anyhow!("JSON missing 'data' array"))?,
            _ => return Err(anyhow!("JSON must be an array of records")),
        };

        let mut headers: Vec<String> = Vec::new();
        for item in items {
            if let Some(obj) = item.as_object() {
                for key in obj.keys() {
                    if !headers.contains(key) {
                        headers.push(key.clone());
                    }
                }
            }
        }

        let rows = items
            .iter()
            .filter_map(|item| item.as_object())
            .map(|obj| {
                headers
                    .iter()
                    .map(|h| match obj.get(h) {
                        None | Some(Value::Null) => Cell::Empty,
                        Some(Value::Number(n)) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty),
                        Some(Value::String(s)) => Cell::from_text(s),
                        Some(other) => Cell::Text(other.to_string()),
                    })
                    .collect()
            })
            .collect();

        Ok(RawTable { headers, rows })
    }

    fn format(&self) -> &'static str {
        "json"
    }
}

/// First worksheet of an Excel workbook
#[cfg(feature = "xlsx")]
pub struct XlsxReader;

#[cfg(feature = "xlsx")]
impl TableReader for XlsxReader {
    fn read(&self, path: &Path) -> Result<RawTable> {
        use calamine::{open_workbook_auto, Data, Reader};

        let mut workbook = open_workbook_auto(path)
            .with_context(|| format!("Failed to open workbook: {}", path.display()))?;

        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| anyhow!("Workbook has no worksheets: {}", path.display()))?
            .with_context(|| format!("Failed to read first worksheet of {}", path.display()))?;

        let mut sheet_rows = range.rows();
        let headers: Vec<String> = match sheet_rows.next() {
            Some(header_row) => header_row.iter().map(|c| c.to_string().trim().to_string()).collect(),
            None => return Ok(RawTable::default()),
        };

        let rows = sheet_rows
            .map(|row| {
                row.iter()
                    .map(|cell| match cell {
                        Data::Int(i) => Cell::Number(*i as f64),
                        Data::Float(f) => Cell::Number(*f),
                        Data::String(s) => Cell::from_text(s),
                        Data::Bool(b) => Cell::Text(b.to_string()),
                        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
                            .map(Cell::Date)
                            .unwrap_or(Cell::Empty),
                        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::from_text(s),
                        Data::Error(_) | Data::Empty => Cell::Empty,
                    })
                    .collect()
            })
            .collect();

        Ok(RawTable { headers, rows }.squared())
    }

    fn format(&self) -> &'static str {
        "xlsx"
    }
}

/// Pick a reader from the file extension
pub fn reader_for(path: &Path) -> Option<Box<dyn TableReader>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())?;

    match ext.as_str() {
        "csv" => Some(Box::new(CsvReader)),
        "json" => Some(Box::new(JsonReader)),
        #[cfg(feature = "xlsx")]
        "xlsx" | "xlsm" | "xls" => Some(Box::new(XlsxReader)),
        _ => None,
    }
}

// ============================================================================
// VALUE PARSING
// ============================================================================

/// `"$1,234.50 MXN"` → 1234.5, `"(100)"` → -100
pub fn parse_amount(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Number(n) if n.is_finite() => Some(*n),
        Cell::Text(s) => {
            let mut cleaned: String = s
                .to_lowercase()
                .replace("mxn", "")
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' ' | '\u{a0}'))
                .collect();

            let negative = cleaned.starts_with('(') && cleaned.ends_with(')');
            if negative {
                cleaned = cleaned[1..cleaned.len() - 1].to_string();
            }

            cleaned
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(|n| if negative { -n } else { n })
        }
        _ => None,
    }
}

/// Leading integer of a payment-terms cell (`"30 días"` → 30)
fn parse_days(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Number(n) if n.is_finite() => Some(*n),
        Cell::Text(s) => {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<f64>().ok()
        }
        _ => None,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d.%m.%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Excel stores dates as days since 1899-12-30
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(serial.floor() as u64))
}

pub fn parse_date(cell: &Cell) -> Option<NaiveDate> {
    match cell {
        Cell::Date(d) => Some(*d),
        Cell::Number(n) => excel_serial_to_date(*n),
        Cell::Text(s) => {
            let s = s.trim();
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .or_else(|| {
                    DATETIME_FORMATS
                        .iter()
                        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                        .map(|dt| dt.date())
                })
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
                .or_else(|| s.parse::<f64>().ok().and_then(excel_serial_to_date))
        }
        Cell::Empty => None,
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Turn a raw table into a dataset. Steps, in order:
/// (a) headers + roles, (b) missing values, (c) dates, (d) amounts.
pub fn normalize(kind: DatasetKind, source_file: &str, raw: RawTable) -> Dataset {
    let raw = raw.squared();
    let columns: Vec<String> = raw.headers.iter().map(|h| normalize_header(h)).collect();
    let roles = resolve_roles(kind, &columns);
    let mut report = NormalizationReport {
        rows_read: raw.rows.len(),
        ..NormalizationReport::default()
    };

    let amount_idx = roles.get(&ColumnRole::Amount).copied();
    let date_idx = roles.get(&ColumnRole::Date).copied();

    // (b) missing values
    let critical: Vec<usize> = match kind {
        DatasetKind::Invoices => [ColumnRole::Counterparty, ColumnRole::Date, ColumnRole::Amount]
            .iter()
            .filter_map(|role| roles.get(role).copied())
            .collect(),
        DatasetKind::FixedExpenses | DatasetKind::BankStatement => Vec::new(),
    };

    let mut rows: Vec<Row> = Vec::with_capacity(raw.rows.len());
    for mut row in raw.rows {
        if row.iter().all(Cell::is_empty) {
            report.dropped_missing_fields += 1;
            continue;
        }
        if critical.iter().any(|idx| row.get(*idx).map_or(true, Cell::is_empty)) {
            report.dropped_missing_fields += 1;
            continue;
        }
        if let Some(idx) = amount_idx {
            if row[idx].is_empty() {
                row[idx] = Cell::Number(0.0);
                report.amounts_zero_filled += 1;
            }
        }
        rows.push(row);
    }

    // (c) dates
    if let Some(idx) = date_idx {
        let before = rows.len();
        rows = rows
            .into_iter()
            .filter_map(|mut row| {
                let parsed = parse_date(&row[idx])?;
                row[idx] = Cell::Date(parsed);
                Some(row)
            })
            .collect();
        report.dropped_bad_dates = before - rows.len();
    }

    // (d) amounts and other numeric roles
    for (role, idx) in roles.iter() {
        if !role.is_numeric() {
            continue;
        }
        for row in rows.iter_mut() {
            let cell = &mut row[*idx];
            match role {
                ColumnRole::PaymentTerms => {
                    *cell = parse_days(cell).map(Cell::Number).unwrap_or(Cell::Empty);
                }
                ColumnRole::Amount => match parse_amount(cell) {
                    Some(n) => *cell = Cell::Number(n),
                    None => {
                        *cell = Cell::Number(0.0);
                        report.amounts_coerced += 1;
                    }
                },
                _ => {
                    *cell = parse_amount(cell).map(Cell::Number).unwrap_or(Cell::Empty);
                }
            }
        }
    }

    if report.rows_dropped() > 0 {
        warn!("{} ({}): {}", kind, source_file, report.summary());
    } else {
        debug!("{} ({}): {}", kind, source_file, report.summary());
    }

    Dataset {
        kind,
        source_file: source_file.to_string(),
        columns,
        original_columns: raw.headers,
        rows,
        roles,
        report,
    }
}

// ============================================================================
// DISCOVERY + LOADING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFile {
    pub kind: DatasetKind,
    pub path: PathBuf,
    pub file_name: String,
}

/// One line of the data-directory report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOverview {
    pub dataset: DatasetKind,
    pub file_name: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub missing_roles: Vec<ColumnRole>,
    pub error: Option<String>,
}

pub struct DataLoader {
    directory: PathBuf,
    config: AgentConfig,
}

impl DataLoader {
    pub fn new(config: &AgentConfig) -> Self {
        DataLoader {
            directory: config.data_directory.clone(),
            config: config.clone(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Scan the data directory; first file (by name) per dataset kind wins
    pub fn discover(&self) -> Result<Vec<DataFile>, AgentError> {
        let entries = fs::read_dir(&self.directory).map_err(|e| {
            AgentError::data_unavailable(self.directory.display().to_string(), e.to_string())
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| self.config.supports_extension(e))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut seen = BTreeSet::new();
        let mut files = Vec::new();
        for path in paths {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string();

            match DatasetKind::detect(&file_name) {
                Some(kind) if seen.insert(kind) => files.push(DataFile { kind, path, file_name }),
                Some(kind) => debug!("ignoring {} ({} already discovered)", file_name, kind),
                None => debug!("ignoring unrecognized file {}", file_name),
            }
        }

        info!("discovered {} data files in {}", files.len(), self.directory.display());
        Ok(files)
    }

    pub fn locate(&self, kind: DatasetKind) -> Result<DataFile, AgentError> {
        self.discover()?
            .into_iter()
            .find(|f| f.kind == kind)
            .ok_or_else(|| {
                AgentError::data_unavailable(
                    kind.typical_file(),
                    format!("no {} file in {}", kind, self.directory.display()),
                )
            })
    }

    pub fn load(&self, kind: DatasetKind) -> Result<Dataset, AgentError> {
        let file = self.locate(kind)?;
        self.load_file(&file)
    }

    pub fn load_file(&self, file: &DataFile) -> Result<Dataset, AgentError> {
        let reader = reader_for(&file.path).ok_or_else(|| {
            AgentError::data_unavailable(&file.file_name, "unsupported file format")
        })?;

        let raw = reader
            .read(&file.path)
            .map_err(|e| AgentError::data_unavailable(&file.file_name, format!("{:#}", e)))?;

        let dataset = normalize(file.kind, &file.file_name, raw);
        info!(
            "loaded {} from {} ({}): {} rows, {} columns",
            file.kind,
            file.file_name,
            reader.format(),
            dataset.row_count(),
            dataset.columns.len()
        );
        Ok(dataset)
    }

    /// Every requested dataset must load
    pub fn load_all(&self, kinds: &BTreeSet<DatasetKind>) -> Result<DatasetMap, AgentError> {
        let files = self.discover()?;
        let mut map = DatasetMap::new();
        for kind in kinds {
            let file = files.iter().find(|f| f.kind == *kind).ok_or_else(|| {
                AgentError::data_unavailable(
                    kind.typical_file(),
                    format!("no {} file in {}", kind, self.directory.display()),
                )
            })?;
            map.insert(*kind, self.load_file(file)?);
        }
        Ok(map)
    }

    /// Load what is available; fails only when nothing loads
    pub fn load_available(&self, kinds: &BTreeSet<DatasetKind>) -> Result<DatasetMap, AgentError> {
        let files = self.discover()?;
        let mut map = DatasetMap::new();
        let mut failures = Vec::new();

        for kind in kinds {
            match files.iter().find(|f| f.kind == *kind) {
                Some(file) => match self.load_file(file) {
                    Ok(dataset) => {
                        map.insert(*kind, dataset);
                    }
                    Err(e) => {
                        warn!("skipping {}: {}", kind, e);
                        failures.push(e.to_string());
                    }
                },
                None => failures.push(format!("no {} file", kind)),
            }
        }

        if map.is_empty() {
            return Err(AgentError::data_unavailable(
                self.directory.display().to_string(),
                failures.join("; "),
            ));
        }
        Ok(map)
    }

    /// Files, row counts and unresolved roles for every discovered dataset
    pub fn overview(&self) -> Result<Vec<SourceOverview>, AgentError> {
        let files = self.discover()?;
        Ok(files
            .iter()
            .map(|file| match self.load_file(file) {
                Ok(ds) => SourceOverview {
                    dataset: file.kind,
                    file_name: file.file_name.clone(),
                    rows: ds.row_count(),
                    missing_roles: [ColumnRole::Amount, ColumnRole::Date]
                        .into_iter()
                        .filter(|r| !ds.has_role(*r))
                        .collect(),
                    columns: ds.original_columns,
                    error: None,
                },
                Err(e) => SourceOverview {
                    dataset: file.kind,
                    file_name: file.file_name.clone(),
                    rows: 0,
                    columns: Vec::new(),
                    missing_roles: Vec::new(),
                    error: Some(e.user_message()),
                },
            })
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
