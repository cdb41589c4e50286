// 📋 Dataset Model
// Normalized in-memory tables built by the loader

use crate::schema::ColumnRole;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// ============================================================================
// DATASET KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Invoices,
    FixedExpenses,
    BankStatement,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 3] = [
        DatasetKind::Invoices,
        DatasetKind::FixedExpenses,
        DatasetKind::BankStatement,
    ];

    /// Canonical dataset name
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Invoices => "invoices",
            DatasetKind::FixedExpenses => "fixed_expenses",
            DatasetKind::BankStatement => "bank_statement",
        }
    }

    /// File name the business usually keeps this data in
    pub fn typical_file(&self) -> &'static str {
        match self {
            DatasetKind::Invoices => "facturas.xlsx",
            DatasetKind::FixedExpenses => "gastos_fijos.xlsx",
            DatasetKind::BankStatement => "Estado_cuenta.xlsx",
        }
    }

    /// Detect the dataset kind from a file name
    pub fn detect(file_name: &str) -> Option<DatasetKind> {
        let lower = file_name.to_lowercase();

        if lower.contains("factura") || lower.contains("invoice") {
            return Some(DatasetKind::Invoices);
        }
        if lower.contains("gasto") || lower.contains("expense") {
            return Some(DatasetKind::FixedExpenses);
        }
        if lower.contains("estado")
            || lower.contains("cuenta")
            || lower.contains("banco")
            || lower.contains("statement")
        {
            return Some(DatasetKind::BankStatement);
        }
        None
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// CELL / ROW
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Empty,
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl Cell {
    /// Build a cell from raw text, empty after trimming means missing
    pub fn from_text(raw: &str) -> Cell {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Cell::Empty
        } else {
            Cell::Text(trimmed.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(n) => n.is_nan(),
            Cell::Date(_) => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Display text; `None` for empty cells
    pub fn display(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => Some(s.clone()),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

pub type Row = Vec<Cell>;

// ============================================================================
// NORMALIZATION REPORT
// ============================================================================

/// What normalization did to the raw table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationReport {
    pub rows_read: usize,
    pub dropped_missing_fields: usize,
    pub dropped_bad_dates: usize,
    pub amounts_zero_filled: usize,
    pub amounts_coerced: usize,
}

impl NormalizationReport {
    pub fn rows_dropped(&self) -> usize {
        self.dropped_missing_fields + self.dropped_bad_dates
    }

    pub fn summary(&self) -> String {
        format!(
            "{} rows read, {} dropped (missing fields {}, bad dates {}), {} amounts zero-filled, {} coerced",
            self.rows_read,
            self.rows_dropped(),
            self.dropped_missing_fields,
            self.dropped_bad_dates,
            self.amounts_zero_filled,
            self.amounts_coerced
        )
    }
}

// ============================================================================
// DATASET
// ============================================================================

/// One normalized table. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub kind: DatasetKind,
    pub source_file: String,
    /// Normalized headers, in file order
    pub columns: Vec<String>,
    /// Original headers, same order as `columns`
    pub original_columns: Vec<String>,
    pub rows: Vec<Row>,
    pub roles: HashMap<ColumnRole, usize>,
    pub report: NormalizationReport,
}

impl Dataset {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_role(&self, role: ColumnRole) -> bool {
        self.roles.contains_key(&role)
    }

    pub fn role_index(&self, role: ColumnRole) -> Option<usize> {
        self.roles.get(&role).copied()
    }

    /// Original header text for a role, as it appears in the source file
    pub fn role_header(&self, role: ColumnRole) -> Option<&str> {
        self.role_index(role)
            .and_then(|idx| self.original_columns.get(idx))
            .map(String::as_str)
    }

    pub fn cell<'a>(&self, row: &'a Row, role: ColumnRole) -> Option<&'a Cell> {
        self.role_index(role).and_then(|idx| row.get(idx))
    }

    /// Amount of a row (0 when the role is absent; normalized rows are numeric)
    pub fn amount(&self, row: &Row) -> f64 {
        self.cell(row, ColumnRole::Amount)
            .and_then(Cell::as_f64)
            .unwrap_or(0.0)
    }

    pub fn date(&self, row: &Row) -> Option<NaiveDate> {
        self.cell(row, ColumnRole::Date).and_then(Cell::as_date)
    }

    pub fn month_of(&self, row: &Row) -> Option<u32> {
        self.date(row).map(|d| d.month())
    }

    pub fn text(&self, row: &Row, role: ColumnRole) -> Option<String> {
        self.cell(row, role).and_then(Cell::display)
    }

    /// Column → value view of a row (for record traceability)
    pub fn record(&self, row: &Row) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .zip(row.iter())
            .map(|(col, cell)| (col.clone(), cell.display().unwrap_or_else(|| "N/A".to_string())))
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
