// 🧮 Aggregation Engine
// Typed per-category analyses over normalized datasets.
// Every number carries the dataset, columns and filter it came from.

use crate::dataset::{Dataset, DatasetKind, Row};
use crate::error::AgentError;
use crate::loader::DatasetMap;
use crate::question::{Category, Direction, Month, Question};
use crate::schema::ColumnRole;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

// ============================================================================
// PRIMITIVES
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AmountStats {
    pub total: f64,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl AmountStats {
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut stats = AmountStats::default();
        for v in values {
            if stats.count == 0 {
                stats.min = v;
                stats.max = v;
            } else {
                stats.min = stats.min.min(v);
                stats.max = stats.max.max(v);
            }
            stats.total += v;
            stats.count += 1;
        }
        if stats.count > 0 {
            stats.mean = stats.total / stats.count as f64;
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub sum: f64,
    pub count: usize,
    pub mean: f64,
}

impl GroupStats {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.mean = self.sum / self.count as f64;
    }
}

/// A source row kept whole for traceability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub amount: f64,
    pub date: Option<NaiveDate>,
    /// Counterparty, expense category or description, whichever the dataset has
    pub label: Option<String>,
    /// Invoice folio
    pub reference: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn from_row(ds: &Dataset, row: &Row) -> Self {
        let label = [ColumnRole::Counterparty, ColumnRole::Category, ColumnRole::Description]
            .iter()
            .find_map(|role| ds.text(row, *role));

        Record {
            amount: ds.amount(row),
            date: ds.date(row),
            label,
            reference: ds.text(row, ColumnRole::Folio),
            fields: ds.record(row),
        }
    }
}

pub fn total(ds: &Dataset, rows: &[&Row]) -> f64 {
    rows.iter().map(|row| ds.amount(row)).sum()
}

pub fn average(ds: &Dataset, rows: &[&Row]) -> Option<f64> {
    (!rows.is_empty()).then(|| total(ds, rows) / rows.len() as f64)
}

/// Largest amount; first row wins ties
pub fn max_record(ds: &Dataset, rows: &[&Row]) -> Option<Record> {
    extreme(ds, rows, |candidate, best| candidate > best)
}

/// Smallest amount; first row wins ties
pub fn min_record(ds: &Dataset, rows: &[&Row]) -> Option<Record> {
    extreme(ds, rows, |candidate, best| candidate < best)
}

fn extreme(ds: &Dataset, rows: &[&Row], better: impl Fn(f64, f64) -> bool) -> Option<Record> {
    let mut best: Option<&Row> = None;
    for row in rows {
        match best {
            Some(current) if !better(ds.amount(row), ds.amount(current)) => {}
            _ => best = Some(*row),
        }
    }
    best.map(|row| Record::from_row(ds, row))
}

pub fn stats(ds: &Dataset, rows: &[&Row]) -> AmountStats {
    AmountStats::from_values(rows.iter().map(|row| ds.amount(row)))
}

/// Group amounts by the text of a role; absent keys group under "N/A"
pub fn group_by(ds: &Dataset, rows: &[&Row], role: ColumnRole) -> BTreeMap<String, GroupStats> {
    group_with(rows, |row| key_text(ds, row, role), |row| Some(ds.amount(row)))
}

fn group_with<K: Ord>(
    rows: &[&Row],
    key: impl Fn(&Row) -> K,
    value: impl Fn(&Row) -> Option<f64>,
) -> BTreeMap<K, GroupStats> {
    let mut groups: BTreeMap<K, GroupStats> = BTreeMap::new();
    for row in rows {
        if let Some(v) = value(row) {
            groups.entry(key(row)).or_default().push(v);
        }
    }
    groups
}

fn key_text(ds: &Dataset, row: &Row, role: ColumnRole) -> String {
    ds.text(row, role).unwrap_or_else(|| "N/A".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub key: String,
    pub stats: GroupStats,
}

/// Sum descending, ties by key
pub fn rank_by_sum(groups: &BTreeMap<String, GroupStats>) -> Vec<Group> {
    let mut ranked: Vec<Group> = groups
        .iter()
        .map(|(key, stats)| Group { key: key.clone(), stats: *stats })
        .collect();
    ranked.sort_by(|a, b| {
        b.stats
            .sum
            .partial_cmp(&a.stats.sum)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    ranked
}

/// Mean descending, ties by key
pub fn rank_by_mean(groups: &BTreeMap<String, GroupStats>) -> Vec<Group> {
    let mut ranked: Vec<Group> = groups
        .iter()
        .map(|(key, stats)| Group { key: key.clone(), stats: *stats })
        .collect();
    ranked.sort_by(|a, b| {
        b.stats
            .mean
            .partial_cmp(&a.stats.mean)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    ranked
}

// ============================================================================
// FILTERS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub month: Option<Month>,
    pub direction: Option<Direction>,
}

impl Filter {
    pub fn from_question(question: &Question) -> Self {
        Filter {
            month: question.month,
            direction: question.direction,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(direction) = self.direction {
            parts.push(format!("tipo \"{}\"", direction.literal()));
        }
        if let Some(month) = self.month {
            parts.push(format!("mes \"{}\"", month));
        }
        if parts.is_empty() {
            "sin filtro".to_string()
        } else {
            parts.join(" y ")
        }
    }

    /// Roles the filter reads
    fn roles(&self) -> Vec<ColumnRole> {
        let mut roles = Vec::new();
        if self.direction.is_some() {
            roles.push(ColumnRole::Type);
        }
        if self.month.is_some() {
            roles.push(ColumnRole::Date);
        }
        roles
    }

    /// Rows matching the filter, in file order
    pub fn apply<'a>(&self, ds: &'a Dataset) -> Result<Vec<&'a Row>, AgentError> {
        for role in self.roles() {
            require(ds, role)?;
        }

        Ok(ds
            .rows
            .iter()
            .filter(|row| {
                self.month
                    .map_or(true, |m| ds.month_of(row) == Some(m.number()))
            })
            .filter(|row| {
                self.direction.map_or(true, |d| {
                    ds.text(row, ColumnRole::Type)
                        .and_then(|t| Direction::from_literal(&t))
                        == Some(d)
                })
            })
            .collect())
    }
}

fn require(ds: &Dataset, role: ColumnRole) -> Result<usize, AgentError> {
    ds.role_index(role)
        .ok_or_else(|| AgentError::missing_column(ds.name(), role.name()))
}

fn non_empty<'a>(ds: &Dataset, rows: Vec<&'a Row>, filter: &Filter) -> Result<Vec<&'a Row>, AgentError> {
    if rows.is_empty() {
        Err(AgentError::empty_result(ds.name(), filter.describe()))
    } else {
        Ok(rows)
    }
}

fn dataset(datasets: &DatasetMap, kind: DatasetKind) -> Result<&Dataset, AgentError> {
    datasets
        .get(&kind)
        .ok_or_else(|| AgentError::data_unavailable(kind.typical_file(), "dataset was not loaded"))
}

/// No rows at all is an empty result before any column check
fn with_rows(ds: &Dataset) -> Result<&Dataset, AgentError> {
    if ds.is_empty() {
        Err(AgentError::empty_result(ds.name(), Filter::default().describe()))
    } else {
        Ok(ds)
    }
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Which dataset, columns and filter a number came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub dataset: DatasetKind,
    pub file: String,
    pub columns: Vec<String>,
    pub filter: String,
}

impl SourceRef {
    pub fn new(ds: &Dataset, roles: &[ColumnRole], filter: &Filter) -> Self {
        SourceRef {
            dataset: ds.kind,
            file: ds.source_file.clone(),
            columns: roles
                .iter()
                .filter_map(|role| ds.role_header(*role).map(str::to_string))
                .collect(),
            filter: filter.describe(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionTotals {
    pub receivable: GroupStats,
    pub payable: GroupStats,
}

impl DirectionTotals {
    fn collect(ds: &Dataset, rows: &[&Row]) -> Option<Self> {
        ds.role_index(ColumnRole::Type)?;
        let mut totals = DirectionTotals::default();
        for row in rows {
            match ds.text(row, ColumnRole::Type).and_then(|t| Direction::from_literal(&t)) {
                Some(Direction::Receivable) => totals.receivable.push(ds.amount(row)),
                Some(Direction::Payable) => totals.payable.push(ds.amount(row)),
                None => {}
            }
        }
        Some(totals)
    }

    pub fn get(&self, direction: Direction) -> GroupStats {
        match direction {
            Direction::Receivable => self.receivable,
            Direction::Payable => self.payable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub dataset: DatasetKind,
    pub file: String,
    pub stats: AmountStats,
}

/// One variant per category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Analysis {
    DirectionMax {
        direction: Direction,
        max: Record,
        stats: AmountStats,
    },
    InvoiceMax {
        max: Record,
        stats: AmountStats,
        by_direction: Option<DirectionTotals>,
    },
    Total {
        filter: Filter,
        stats: AmountStats,
        by_direction: Option<DirectionTotals>,
    },
    Average {
        filter: Filter,
        stats: AmountStats,
        max: Record,
        min: Record,
    },
    TotalByTypeAndMonth {
        direction: Direction,
        month: Month,
        stats: AmountStats,
        month_totals: DirectionTotals,
    },
    FixedExpenses {
        stats: AmountStats,
        max: Record,
        by_category: BTreeMap<String, GroupStats>,
    },
    CashFlow {
        month: Option<Month>,
        inflows: AmountStats,
        outflows: AmountStats,
        net: f64,
        movements: usize,
        closing_balance: Option<f64>,
    },
    ByProviderMax {
        direction: Direction,
        top: Group,
        groups: BTreeMap<String, GroupStats>,
        total: f64,
    },
    MonthWithMostInvoices {
        direction: Option<Direction>,
        top_month: Month,
        top: GroupStats,
        months: BTreeMap<u32, GroupStats>,
        total_count: usize,
    },
    PaymentTermsByProvider {
        top: Group,
        /// Mean payment-terms days per provider
        groups: BTreeMap<String, GroupStats>,
    },
    General {
        datasets: Vec<DatasetSummary>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub category: Category,
    pub analysis: Analysis,
    pub sources: Vec<SourceRef>,
}

// ============================================================================
// ENTRY POINT
// ============================================================================

pub fn aggregate(question: &Question, datasets: &DatasetMap) -> Result<AggregationResult, AgentError> {
    debug!("aggregating {} over {} datasets", question.category, datasets.len());

    let (analysis, sources) = match question.category {
        Category::PayableMax => direction_max(question, datasets, Direction::Payable)?,
        Category::ReceivableMax => direction_max(question, datasets, Direction::Receivable)?,
        Category::InvoiceMax => invoice_max(question, datasets)?,
        Category::TotalAmount => filtered_total(question, datasets)?,
        Category::AverageAmount => filtered_average(question, datasets)?,
        Category::TotalByTypeAndMonth => match (question.direction, question.month) {
            (Some(direction), Some(month)) => total_by_type_and_month(datasets, direction, month)?,
            _ => filtered_total(question, datasets)?,
        },
        Category::FixedExpenses => fixed_expenses(datasets)?,
        Category::CashFlow => cash_flow(question, datasets)?,
        Category::ByProviderMax => by_provider_max(question, datasets)?,
        Category::MonthWithMostInvoices => month_with_most_invoices(question, datasets)?,
        Category::PaymentTermsByProvider => payment_terms_by_provider(datasets)?,
        Category::General => general(datasets)?,
    };

    Ok(AggregationResult {
        category: question.category,
        analysis,
        sources,
    })
}

type Computed = (Analysis, Vec<SourceRef>);

fn direction_max(question: &Question, datasets: &DatasetMap, direction: Direction) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Amount)?;
    let filter = Filter::from_question(question).with_direction(direction);
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let max = max_record(ds, &rows).ok_or_else(|| AgentError::empty_result(ds.name(), filter.describe()))?;
    let source = SourceRef::new(
        ds,
        &[ColumnRole::Amount, ColumnRole::Type, ColumnRole::Counterparty, ColumnRole::Date],
        &filter,
    );

    Ok((
        Analysis::DirectionMax {
            direction,
            max,
            stats: stats(ds, &rows),
        },
        vec![source],
    ))
}

fn invoice_max(question: &Question, datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Amount)?;
    let filter = Filter::from_question(question);
    let rows = filter.apply(ds)?;

    let max = max_record(ds, &rows).ok_or_else(|| AgentError::empty_result(ds.name(), filter.describe()))?;

    let mut roles = vec![ColumnRole::Amount, ColumnRole::Type, ColumnRole::Counterparty];
    roles.extend(filter.roles().into_iter().filter(|r| *r != ColumnRole::Type));
    Ok((
        Analysis::InvoiceMax {
            max,
            stats: stats(ds, &rows),
            by_direction: DirectionTotals::collect(ds, &rows),
        },
        vec![SourceRef::new(ds, &roles, &filter)],
    ))
}

fn filtered_total(question: &Question, datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Amount)?;
    let filter = Filter::from_question(question);
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let mut roles = vec![ColumnRole::Amount];
    roles.extend(filter.roles());
    Ok((
        Analysis::Total {
            filter,
            stats: stats(ds, &rows),
            by_direction: DirectionTotals::collect(ds, &rows),
        },
        vec![SourceRef::new(ds, &roles, &filter)],
    ))
}

fn filtered_average(question: &Question, datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Amount)?;
    let filter = Filter::from_question(question);
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let empty = || AgentError::empty_result(ds.name(), filter.describe());
    let max = max_record(ds, &rows).ok_or_else(empty)?;
    let min = min_record(ds, &rows).ok_or_else(empty)?;

    let mut roles = vec![ColumnRole::Amount];
    roles.extend(filter.roles());
    Ok((
        Analysis::Average {
            filter,
            stats: stats(ds, &rows),
            max,
            min,
        },
        vec![SourceRef::new(ds, &roles, &filter)],
    ))
}

fn total_by_type_and_month(datasets: &DatasetMap, direction: Direction, month: Month) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Amount)?;
    let filter = Filter {
        month: Some(month),
        direction: Some(direction),
    };
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let month_only = Filter {
        month: Some(month),
        direction: None,
    };
    let month_rows = month_only.apply(ds)?;
    let month_totals = DirectionTotals::collect(ds, &month_rows).unwrap_or_default();

    Ok((
        Analysis::TotalByTypeAndMonth {
            direction,
            month,
            stats: stats(ds, &rows),
            month_totals,
        },
        vec![SourceRef::new(
            ds,
            &[ColumnRole::Amount, ColumnRole::Type, ColumnRole::Date],
            &filter,
        )],
    ))
}

fn fixed_expenses(datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::FixedExpenses)?)?;
    require(ds, ColumnRole::Amount)?;
    let filter = Filter::default();
    let rows: Vec<&Row> = ds.rows.iter().collect();

    let max = max_record(ds, &rows).ok_or_else(|| AgentError::empty_result(ds.name(), filter.describe()))?;
    let by_category = if ds.has_role(ColumnRole::Category) {
        group_by(ds, &rows, ColumnRole::Category)
    } else {
        BTreeMap::new()
    };

    Ok((
        Analysis::FixedExpenses {
            stats: stats(ds, &rows),
            max,
            by_category,
        },
        vec![SourceRef::new(ds, &[ColumnRole::Amount, ColumnRole::Category], &filter)],
    ))
}

fn cash_flow(question: &Question, datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::BankStatement)?)?;
    require(ds, ColumnRole::Amount)?;
    let filter = Filter {
        month: question.month,
        direction: None,
    };
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let amounts: Vec<f64> = rows.iter().map(|row| ds.amount(row)).collect();
    let inflows = AmountStats::from_values(amounts.iter().copied().filter(|a| *a > 0.0));
    let outflows = AmountStats::from_values(amounts.iter().copied().filter(|a| *a < 0.0));
    let closing_balance = rows
        .last()
        .and_then(|row| ds.cell(row, ColumnRole::Balance))
        .and_then(|cell| cell.as_f64());

    let mut roles = vec![ColumnRole::Amount, ColumnRole::Balance];
    roles.extend(filter.roles());
    Ok((
        Analysis::CashFlow {
            month: filter.month,
            inflows,
            outflows,
            net: inflows.total + outflows.total,
            movements: rows.len(),
            closing_balance,
        },
        vec![SourceRef::new(ds, &roles, &filter)],
    ))
}

fn by_provider_max(question: &Question, datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Amount)?;
    require(ds, ColumnRole::Counterparty)?;
    let direction = question.effective_direction().unwrap_or(Direction::Payable);
    let filter = Filter::from_question(question).with_direction(direction);
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let groups = group_by(ds, &rows, ColumnRole::Counterparty);
    let top = rank_by_sum(&groups)
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::empty_result(ds.name(), filter.describe()))?;

    let mut roles = vec![ColumnRole::Counterparty, ColumnRole::Amount];
    roles.extend(filter.roles());
    Ok((
        Analysis::ByProviderMax {
            direction,
            top,
            groups,
            total: total(ds, &rows),
        },
        vec![SourceRef::new(ds, &roles, &filter)],
    ))
}

fn month_with_most_invoices(question: &Question, datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Amount)?;
    require(ds, ColumnRole::Date)?;
    let filter = Filter {
        month: None,
        direction: question.direction,
    };
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let months = group_with(
        &rows,
        |row| ds.month_of(row).unwrap_or(0),
        |row| ds.month_of(row).map(|_| ds.amount(row)),
    );

    // Highest count; BTreeMap order makes the earliest month win ties
    let mut best: Option<(u32, GroupStats)> = None;
    for (number, group) in &months {
        if best.map_or(true, |(_, b)| group.count > b.count) {
            best = Some((*number, *group));
        }
    }
    let (top_month, top) = best
        .and_then(|(n, g)| Month::new(n).map(|m| (m, g)))
        .ok_or_else(|| AgentError::empty_result(ds.name(), filter.describe()))?;

    let mut roles = vec![ColumnRole::Date, ColumnRole::Amount];
    roles.extend(filter.roles());
    Ok((
        Analysis::MonthWithMostInvoices {
            direction: filter.direction,
            top_month,
            top,
            total_count: rows.len(),
            months,
        },
        vec![SourceRef::new(ds, &roles, &filter)],
    ))
}

fn payment_terms_by_provider(datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let ds = with_rows(dataset(datasets, DatasetKind::Invoices)?)?;
    require(ds, ColumnRole::Counterparty)?;
    require(ds, ColumnRole::PaymentTerms)?;

    // Payables only when the type column exists
    let filter = if ds.has_role(ColumnRole::Type) {
        Filter::default().with_direction(Direction::Payable)
    } else {
        Filter::default()
    };
    let rows = filter.apply(ds)?;

    let groups = group_with(
        &rows,
        |row| key_text(ds, row, ColumnRole::Counterparty),
        |row| ds.cell(row, ColumnRole::PaymentTerms).and_then(|c| c.as_f64()),
    );
    let top = rank_by_mean(&groups)
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::empty_result(ds.name(), filter.describe()))?;

    let mut roles = vec![ColumnRole::Counterparty, ColumnRole::PaymentTerms];
    roles.extend(filter.roles());
    Ok((
        Analysis::PaymentTermsByProvider { top, groups },
        vec![SourceRef::new(ds, &roles, &filter)],
    ))
}

fn general(datasets: &DatasetMap) -> Result<Computed, AgentError> {
    let filter = Filter::default();
    let mut summaries = Vec::new();
    let mut sources = Vec::new();

    for ds in datasets.values() {
        if !ds.has_role(ColumnRole::Amount) {
            warn!("{} has no amount column, left out of the overview", ds.name());
            continue;
        }
        if ds.is_empty() {
            continue;
        }
        let rows: Vec<&Row> = ds.rows.iter().collect();
        summaries.push(DatasetSummary {
            dataset: ds.kind,
            file: ds.source_file.clone(),
            stats: stats(ds, &rows),
        });
        sources.push(SourceRef::new(ds, &[ColumnRole::Amount], &filter));
    }

    if summaries.is_empty() {
        return Err(AgentError::empty_result("all", filter.describe()));
    }
    Ok((Analysis::General { datasets: summaries }, sources))
}

// ============================================================================
// BREAKDOWNS (extra analysis requested during model escalation)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Breakdown {
    ByCounterparty,
    ByMonth,
    ByPaymentTerms,
    ByCategory,
}

impl Breakdown {
    pub fn dataset(&self) -> DatasetKind {
        match self {
            Breakdown::ByCategory => DatasetKind::FixedExpenses,
            Breakdown::ByCounterparty | Breakdown::ByMonth | Breakdown::ByPaymentTerms => DatasetKind::Invoices,
        }
    }

    /// Best-effort reading of a free-text request
    pub fn from_request(request: &str) -> Option<Breakdown> {
        let lower = request.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has(&["termino", "término", "terms", "plazo"]) {
            Some(Breakdown::ByPaymentTerms)
        } else if has(&["proveedor", "cliente", "counterparty", "provider", "client"]) {
            Some(Breakdown::ByCounterparty)
        } else if has(&["mes", "month"]) {
            Some(Breakdown::ByMonth)
        } else if has(&["categor", "gasto", "expense"]) {
            Some(Breakdown::ByCategory)
        } else {
            None
        }
    }
}

impl fmt::Display for Breakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Breakdown::ByCounterparty => "por proveedor/cliente",
            Breakdown::ByMonth => "por mes",
            Breakdown::ByPaymentTerms => "por términos de pago",
            Breakdown::ByCategory => "por categoría",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownTable {
    pub breakdown: Breakdown,
    pub groups: BTreeMap<String, GroupStats>,
    pub source: SourceRef,
}

pub fn breakdown(kind: Breakdown, question: &Question, datasets: &DatasetMap) -> Result<BreakdownTable, AgentError> {
    let ds = with_rows(dataset(datasets, kind.dataset())?)?;
    let filter = match kind {
        Breakdown::ByCategory => Filter::default(),
        _ => Filter::from_question(question),
    };
    let rows = non_empty(ds, filter.apply(ds)?, &filter)?;

    let (groups, roles) = match kind {
        Breakdown::ByCounterparty => {
            require(ds, ColumnRole::Counterparty)?;
            require(ds, ColumnRole::Amount)?;
            (
                group_by(ds, &rows, ColumnRole::Counterparty),
                vec![ColumnRole::Counterparty, ColumnRole::Amount],
            )
        }
        Breakdown::ByMonth => {
            require(ds, ColumnRole::Date)?;
            require(ds, ColumnRole::Amount)?;
            let groups = group_with(
                &rows,
                |row| {
                    ds.month_of(row)
                        .and_then(Month::new)
                        .map(|m| m.name().to_string())
                        .unwrap_or_else(|| "N/A".to_string())
                },
                |row| Some(ds.amount(row)),
            );
            (groups, vec![ColumnRole::Date, ColumnRole::Amount])
        }
        Breakdown::ByPaymentTerms => {
            require(ds, ColumnRole::Counterparty)?;
            require(ds, ColumnRole::PaymentTerms)?;
            let groups = group_with(
                &rows,
                |row| key_text(ds, row, ColumnRole::Counterparty),
                |row| ds.cell(row, ColumnRole::PaymentTerms).and_then(|c| c.as_f64()),
            );
            (groups, vec![ColumnRole::Counterparty, ColumnRole::PaymentTerms])
        }
        Breakdown::ByCategory => {
            require(ds, ColumnRole::Category)?;
            require(ds, ColumnRole::Amount)?;
            (
                group_by(ds, &rows, ColumnRole::Category),
                vec![ColumnRole::Category, ColumnRole::Amount],
            )
        }
    };

    Ok(BreakdownTable {
        breakdown: kind,
        groups,
        source: SourceRef::new(ds, &roles, &filter),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::dataset::Cell;
    use crate::loader::{normalize, RawTable};

    fn text(s: &str) -> Cell {
        Cell::from_text(s)
    }

    /// (tipo, contraparte, fecha, monto)
    fn invoices(rows: &[(&str, &str, &str, &str)]) -> Dataset {
        let raw = RawTable {
            headers: vec![
                "Tipo".into(),
                "Cliente/Proveedor".into(),
                "Fecha de Emisión".into(),
                "Monto (MXN)".into(),
            ],
            rows: rows
                .iter()
                .map(|(t, c, d, m)| vec![text(t), text(c), text(d), text(m)])
                .collect(),
        };
        normalize(DatasetKind::Invoices, "facturas.csv", raw)
    }

    fn map(datasets: Vec<Dataset>) -> DatasetMap {
        datasets.into_iter().map(|ds| (ds.kind, ds)).collect()
    }

    fn sample() -> DatasetMap {
        map(vec![invoices(&[
            ("Por pagar", "ACME", "2024-05-02", "100"),
            ("Por pagar", "Globex", "2024-05-20", "300"),
            ("Por cobrar", "Initech", "2024-05-10", "50000"),
            ("Por cobrar", "Initech", "2024-06-10", "70000"),
            ("Por pagar", "ACME", "2024-06-01", "250"),
            ("Cancelada", "Umbrella", "2024-06-03", "999"),
        ])])
    }

    #[test]
    fn test_payable_max_scenario() {
        let data = map(vec![invoices(&[
            ("Por pagar", "ACME", "2024-01-01", "100"),
            ("Por pagar", "Globex", "2024-01-02", "300"),
        ])]);
        let q = classify("¿Cuál es la factura por pagar más alta?");
        let result = aggregate(&q, &data).unwrap();
        match result.analysis {
            Analysis::DirectionMax { max, stats, direction } => {
                assert_eq!(direction, Direction::Payable);
                assert_eq!(max.amount, 300.0);
                assert_eq!(max.label.as_deref(), Some("Globex"));
                assert_eq!(stats.count, 2);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_invoice_superlative_with_bare_verb_stays_in_direction() {
        let data = map(vec![invoices(&[
            ("Por pagar", "ACME", "2024-01-01", "100"),
            ("Por cobrar", "Initech", "2024-01-02", "90000"),
        ])]);
        let q = classify("¿Cuál es la factura más alta que debo pagar?");
        match aggregate(&q, &data).unwrap().analysis {
            Analysis::DirectionMax { max, direction, .. } => {
                assert_eq!(direction, Direction::Payable);
                assert_eq!(max.label.as_deref(), Some("ACME"));
                assert_eq!(max.amount, 100.0);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_invoice_max_honors_month() {
        let q = classify("¿Cuál fue la factura más alta de junio?");
        assert_eq!(q.category, Category::InvoiceMax);
        let result = aggregate(&q, &sample()).unwrap();
        match result.analysis {
            Analysis::InvoiceMax { max, stats, .. } => {
                assert_eq!(max.amount, 70000.0);
                assert_eq!(stats.count, 3);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
        assert!(result.sources[0].filter.contains("junio"));
    }

    #[test]
    fn test_receivable_total_in_may_scenario() {
        let data = map(vec![invoices(&[
            ("Por cobrar", "Initech", "2024-05-10", "50000"),
            ("Por cobrar", "Initech", "2024-06-10", "70000"),
        ])]);
        let q = classify("total de facturas por cobrar en mayo");
        let result = aggregate(&q, &data).unwrap();
        match result.analysis {
            Analysis::TotalByTypeAndMonth { stats, month, direction, .. } => {
                assert_eq!(stats.total, 50000.0);
                assert_eq!(stats.count, 1);
                assert_eq!(month.number(), 5);
                assert_eq!(direction, Direction::Receivable);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_total_equals_column_sum() {
        let data = sample();
        let q = classify("dame el total de las facturas");
        let result = aggregate(&q, &data).unwrap();
        let expected: f64 = data[&DatasetKind::Invoices]
            .rows
            .iter()
            .map(|r| data[&DatasetKind::Invoices].amount(r))
            .sum();
        match result.analysis {
            Analysis::Total { stats, by_direction, .. } => {
                assert_eq!(stats.total, expected);
                assert_eq!(stats.count, 6);
                // "Cancelada" lands in neither bucket
                let totals = by_direction.unwrap();
                assert_eq!(totals.payable.sum + totals.receivable.sum, expected - 999.0);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_max_tie_keeps_first_row() {
        let ds = invoices(&[
            ("Por pagar", "First", "2024-01-01", "500"),
            ("Por pagar", "Second", "2024-01-02", "500"),
        ]);
        let rows: Vec<&Row> = ds.rows.iter().collect();
        assert_eq!(max_record(&ds, &rows).unwrap().label.as_deref(), Some("First"));
        assert_eq!(min_record(&ds, &rows).unwrap().label.as_deref(), Some("First"));
    }

    #[test]
    fn test_month_filter_ignores_year() {
        let ds = invoices(&[
            ("Por pagar", "A", "2023-05-01", "10"),
            ("Por pagar", "B", "2024-05-01", "20"),
            ("Por pagar", "C", "2024-04-30", "40"),
        ]);
        let filter = Filter {
            month: Month::new(5),
            direction: None,
        };
        let rows = filter.apply(&ds).unwrap();
        assert_eq!(total(&ds, &rows), 30.0);
    }

    #[test]
    fn test_direction_filter_is_case_insensitive() {
        let ds = invoices(&[
            ("POR PAGAR ", "A", "2024-01-01", "10"),
            ("por pagar", "B", "2024-01-01", "20"),
            ("pagada", "C", "2024-01-01", "40"),
        ]);
        let rows = Filter::default().with_direction(Direction::Payable).apply(&ds).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_group_by_and_ranking() {
        let ds = invoices(&[
            ("Por pagar", "B", "2024-01-01", "100"),
            ("Por pagar", "A", "2024-01-01", "100"),
            ("Por pagar", "C", "2024-01-01", "50"),
            ("Por pagar", "C", "2024-01-01", "25"),
        ]);
        let rows: Vec<&Row> = ds.rows.iter().collect();
        let groups = group_by(&ds, &rows, ColumnRole::Counterparty);
        assert_eq!(groups["C"].count, 2);
        assert_eq!(groups["C"].mean, 37.5);

        let ranked: Vec<String> = rank_by_sum(&groups).into_iter().map(|g| g.key).collect();
        assert_eq!(ranked, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_provider_max_defaults_to_payables() {
        let q = classify("¿Qué proveedor tiene el mayor monto?");
        let result = aggregate(&q, &sample()).unwrap();
        match result.analysis {
            Analysis::ByProviderMax { direction, top, .. } => {
                assert_eq!(direction, Direction::Payable);
                assert_eq!(top.key, "ACME");
                assert_eq!(top.stats.sum, 350.0);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_month_with_most_invoices_tie_goes_to_earliest() {
        let q = classify("¿En qué mes hubo más facturas?");
        let result = aggregate(&q, &sample()).unwrap();
        match result.analysis {
            Analysis::MonthWithMostInvoices { top_month, top, total_count, .. } => {
                assert_eq!(top_month.number(), 5);
                assert_eq!(top.count, 3);
                assert_eq!(total_count, 6);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_empty_filter_is_empty_result() {
        let q = classify("total de facturas por pagar en diciembre");
        let err = aggregate(&q, &sample()).unwrap_err();
        assert!(err.is_empty_result());
    }

    #[test]
    fn test_missing_amount_column() {
        let raw = RawTable {
            headers: vec!["Tipo".into(), "Cliente".into(), "Valor".into()],
            rows: vec![vec![text("Por pagar"), text("A"), text("10")]],
        };
        let data = map(vec![normalize(DatasetKind::Invoices, "facturas.csv", raw)]);
        let q = classify("¿Cuál es la factura por pagar más alta?");
        let err = aggregate(&q, &data).unwrap_err();
        assert_eq!(err, AgentError::missing_column("invoices", "amount"));
    }

    #[test]
    fn test_cash_flow_split() {
        let raw = RawTable {
            headers: vec!["Fecha".into(), "Monto de la transacción (MXN)".into(), "Saldo (MXN)".into()],
            rows: vec![
                vec![text("2024-01-01"), text("1000"), text("1000")],
                vec![text("2024-01-02"), text("-300"), text("700")],
                vec![text("2024-01-03"), text("-200"), text("500")],
            ],
        };
        let data = map(vec![normalize(DatasetKind::BankStatement, "Estado_cuenta.csv", raw)]);
        let q = classify("¿Cómo está mi flujo de efectivo?");
        match aggregate(&q, &data).unwrap().analysis {
            Analysis::CashFlow { inflows, outflows, net, movements, closing_balance, .. } => {
                assert_eq!(inflows.total, 1000.0);
                assert_eq!(outflows.total, -500.0);
                assert_eq!(net, 500.0);
                assert_eq!(movements, 3);
                assert_eq!(closing_balance, Some(500.0));
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_cash_flow_blank_closing_balance_is_unknown() {
        let raw = RawTable {
            headers: vec!["Fecha".into(), "Monto de la transacción (MXN)".into(), "Saldo (MXN)".into()],
            rows: vec![
                vec![text("2024-01-01"), text("1000"), text("1000")],
                vec![text("2024-01-02"), text("-300"), Cell::Empty],
            ],
        };
        let data = map(vec![normalize(DatasetKind::BankStatement, "Estado_cuenta.csv", raw)]);
        let q = classify("¿Cómo está mi flujo de efectivo?");
        match aggregate(&q, &data).unwrap().analysis {
            Analysis::CashFlow { closing_balance, net, .. } => {
                assert_eq!(closing_balance, None);
                assert_eq!(net, 700.0);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_payment_terms_by_provider() {
        let raw = RawTable {
            headers: vec![
                "Tipo".into(),
                "Cliente/Proveedor".into(),
                "Fecha de Emisión".into(),
                "Monto (MXN)".into(),
                "Términos de pago".into(),
            ],
            rows: vec![
                vec![text("Por pagar"), text("ACME"), text("2024-01-01"), text("10"), text("30 días")],
                vec![text("Por pagar"), text("ACME"), text("2024-01-02"), text("10"), text("60")],
                vec![text("Por pagar"), text("Globex"), text("2024-01-03"), text("10"), text("30")],
                vec![text("Por cobrar"), text("Initech"), text("2024-01-04"), text("10"), text("90")],
            ],
        };
        let data = map(vec![normalize(DatasetKind::Invoices, "facturas.csv", raw)]);
        let q = classify("¿Qué proveedor tiene los términos de pago más generosos?");
        match aggregate(&q, &data).unwrap().analysis {
            Analysis::PaymentTermsByProvider { top, groups } => {
                assert_eq!(top.key, "ACME");
                assert_eq!(top.stats.mean, 45.0);
                assert!(!groups.contains_key("Initech"));
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_general_skips_missing_datasets() {
        let q = classify("háblame de mi negocio por favor");
        let result = aggregate(&q, &sample()).unwrap();
        match result.analysis {
            Analysis::General { datasets } => {
                assert_eq!(datasets.len(), 1);
                assert_eq!(datasets[0].dataset, DatasetKind::Invoices);
            }
            other => panic!("unexpected analysis {:?}", other),
        }
    }

    #[test]
    fn test_sources_name_columns_and_filter() {
        let q = classify("total de facturas por cobrar en mayo");
        let result = aggregate(&q, &sample()).unwrap();
        let source = &result.sources[0];
        assert_eq!(source.dataset, DatasetKind::Invoices);
        assert_eq!(source.file, "facturas.csv");
        assert!(source.columns.contains(&"Monto (MXN)".to_string()));
        assert_eq!(source.filter, "tipo \"Por cobrar\" y mes \"mayo\"");
    }

    #[test]
    fn test_breakdown_by_counterparty() {
        let q = classify("¿Cuál es la factura por pagar más alta?");
        let table = breakdown(Breakdown::ByCounterparty, &q, &sample()).unwrap();
        assert_eq!(table.groups["ACME"].sum, 350.0);
        assert!(!table.groups.contains_key("Initech"));
    }

    #[test]
    fn test_breakdown_from_request() {
        assert_eq!(Breakdown::from_request("agrupar por proveedor"), Some(Breakdown::ByCounterparty));
        assert_eq!(Breakdown::from_request("desglose por mes"), Some(Breakdown::ByMonth));
        assert_eq!(Breakdown::from_request("términos de pago"), Some(Breakdown::ByPaymentTerms));
        assert_eq!(Breakdown::from_request("algo distinto"), None);
    }
}
