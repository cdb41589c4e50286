// 🖨️ Response Formatter
// Four-section text report: summary, detail, sources, insights.
// Rendering never fails; absent values print as "N/A" or 0.

use crate::aggregation::{
    rank_by_mean, rank_by_sum, AggregationResult, AmountStats, Analysis, Breakdown, BreakdownTable,
    DirectionTotals, GroupStats, Record, SourceRef,
};
use crate::error::AgentError;
use crate::question::{Direction, Month, Question};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

pub const SUMMARY_HEADER: &str = "📊 Executive Summary";
pub const DETAIL_HEADER: &str = "📈 Detailed Analysis";
pub const SOURCES_HEADER: &str = "🔍 Data Sources Used";
pub const INSIGHTS_HEADER: &str = "💡 Key Insights";

/// Ranked lists are cut to this many entries
const TOP_N: usize = 5;

// ============================================================================
// NUMBER RENDERING
// ============================================================================

/// `1234.5` → `$1,234.50 MXN`, `-1234.5` → `-$1,234.50 MXN`.
/// Rounds half away from zero, only here.
pub fn format_money(value: f64) -> String {
    if !value.is_finite() {
        return "$0.00 MXN".to_string();
    }
    let cents = (value.abs() * 100.0).round() as u64;
    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{}${}.{:02} MXN", sign, group_thousands(cents / 100), cents % 100)
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Share of `part` in `whole`; a zero whole renders `0.0%`
pub fn format_percent(part: f64, whole: f64) -> String {
    if whole == 0.0 || !whole.is_finite() {
        return "0.0%".to_string();
    }
    format!("{:.1}%", part / whole * 100.0)
}

fn amount_regex() -> Option<&'static Regex> {
    static AMOUNT: OnceLock<Option<Regex>> = OnceLock::new();
    AMOUNT
        .get_or_init(|| Regex::new(r"-?\$[\d,]+(?:\.\d+)?").ok())
        .as_ref()
}

/// Every `$1,234.56` / `-$1,234.56` amount in the text, in order
pub fn extract_amounts(text: &str) -> Vec<f64> {
    let Some(re) = amount_regex() else {
        return Vec::new();
    };
    re.find_iter(text)
        .filter_map(|m| {
            let cleaned: String = m.as_str().chars().filter(|c| !matches!(c, '$' | ',')).collect();
            cleaned.parse::<f64>().ok()
        })
        .collect()
}

fn or_na(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or("N/A")
}

fn date_text(record: &Record) -> String {
    record
        .date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn month_name(number: u32) -> &'static str {
    Month::new(number).map(|m| m.name()).unwrap_or("N/A")
}

// ============================================================================
// RESPONSE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormattedResponse {
    pub summary: String,
    pub details: Vec<String>,
    pub sources: Vec<String>,
    pub insights: Vec<String>,
}

impl FormattedResponse {
    fn detail(&mut self, line: impl Into<String>) {
        self.details.push(line.into());
    }

    fn insight(&mut self, line: impl Into<String>) {
        self.insights.push(line.into());
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FormattedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", SUMMARY_HEADER)?;
        writeln!(f, "{}", self.summary)?;

        for (header, lines) in [
            (DETAIL_HEADER, &self.details),
            (SOURCES_HEADER, &self.sources),
            (INSIGHTS_HEADER, &self.insights),
        ] {
            writeln!(f)?;
            writeln!(f, "{}", header)?;
            if lines.is_empty() {
                writeln!(f, "- N/A")?;
            }
            for line in lines {
                writeln!(f, "- {}", line)?;
            }
        }
        Ok(())
    }
}

pub fn source_lines(sources: &[SourceRef]) -> Vec<String> {
    sources
        .iter()
        .map(|s| {
            let columns = if s.columns.is_empty() {
                "N/A".to_string()
            } else {
                s.columns.join(", ")
            };
            format!("{} ({}) | columnas: {} | filtro: {}", s.dataset, s.file, columns, s.filter)
        })
        .collect()
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Render the outcome of the Aggregate stage. Empty results become a
/// "no records" report; other errors become their user message.
pub fn format(question: &Question, outcome: &Result<AggregationResult, AgentError>) -> String {
    match outcome {
        Ok(result) => build(question, result).render(),
        Err(AgentError::EmptyResult { dataset, filter }) => format_empty(dataset, filter),
        Err(other) => other.user_message(),
    }
}

pub fn format_result(question: &Question, result: &AggregationResult) -> String {
    build(question, result).render()
}

pub fn format_empty(dataset: &str, filter: &str) -> String {
    FormattedResponse {
        summary: format!(
            "No hay registros que coincidan con el filtro {} en el conjunto de datos '{}'.",
            filter, dataset
        ),
        details: vec!["Registros encontrados: 0".to_string()],
        sources: vec![format!("{} | filtro: {}", dataset, filter)],
        insights: vec!["Prueba con otro mes u otro tipo de factura, o revisa que el archivo tenga datos.".to_string()],
    }
    .render()
}

/// Model narrative inside the same template; sources and insights stay computed
pub fn format_model_answer(question: &Question, result: &AggregationResult, narrative: &str) -> String {
    let computed = build(question, result);
    FormattedResponse {
        summary: format!("Análisis para: \"{}\"", question.text.trim()),
        details: narrative
            .lines()
            .map(|l| l.trim().trim_start_matches(&['-', '•'][..]).trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        sources: computed.sources,
        insights: computed.insights,
    }
    .render()
}

/// Deterministic report extended with a breakdown table
pub fn format_with_breakdown(question: &Question, result: &AggregationResult, table: &BreakdownTable) -> String {
    let mut response = build(question, result);
    response.details.extend(breakdown_lines(table));
    response.sources.extend(source_lines(std::slice::from_ref(&table.source)));
    response.render()
}

pub fn breakdown_lines(table: &BreakdownTable) -> Vec<String> {
    let mut lines = vec![format!("Desglose {}:", table.breakdown)];
    let ranked = match table.breakdown {
        Breakdown::ByPaymentTerms => rank_by_mean(&table.groups),
        _ => rank_by_sum(&table.groups),
    };
    for group in ranked.iter().take(TOP_N) {
        lines.push(match table.breakdown {
            Breakdown::ByPaymentTerms => {
                format!("  {}: {:.1} días en promedio ({} facturas)", group.key, group.stats.mean, group.stats.count)
            }
            _ => format!(
                "  {}: {} ({} registros)",
                group.key,
                format_money(group.stats.sum),
                group.stats.count
            ),
        });
    }
    lines
}

// ============================================================================
// PER-ANALYSIS TEMPLATES
// ============================================================================

pub fn build(question: &Question, result: &AggregationResult) -> FormattedResponse {
    let mut r = FormattedResponse {
        sources: source_lines(&result.sources),
        ..FormattedResponse::default()
    };

    match &result.analysis {
        Analysis::DirectionMax { direction, max, stats } => {
            r.summary = format!(
                "La factura {} más alta es de {} ({}).",
                direction.label(),
                format_money(max.amount),
                or_na(max.label.as_deref())
            );
            record_lines(&mut r, max);
            r.detail(format!("Total {}: {}", direction.label(), format_money(stats.total)));
            r.detail(format!("Facturas {}: {}", direction.label(), stats.count));
            r.detail(format!("Promedio {}: {}", direction.label(), format_money(stats.mean)));
            r.insight(format!(
                "Esta factura representa el {} del total {}",
                format_percent(max.amount, stats.total),
                direction.label()
            ));
            if stats.mean != 0.0 {
                r.insight(format!("Equivale a {:.1} veces el promedio", max.amount / stats.mean));
            }
        }
        Analysis::InvoiceMax { max, stats, by_direction } => {
            r.summary = format!(
                "La factura más alta es de {} ({}).",
                format_money(max.amount),
                or_na(max.label.as_deref())
            );
            record_lines(&mut r, max);
            if let Some(kind) = max.fields.get("tipo") {
                r.detail(format!("Tipo: {}", kind));
            }
            stats_lines(&mut r, stats);
            if let Some(totals) = by_direction {
                direction_lines(&mut r, totals);
            }
            r.insight(format!(
                "Esta factura representa el {} del monto total facturado",
                format_percent(max.amount, stats.total)
            ));
        }
        Analysis::Total { filter, stats, by_direction } => {
            r.summary = format!(
                "El total de facturas ({}) es de {}.",
                filter.describe(),
                format_money(stats.total)
            );
            stats_lines(&mut r, stats);
            if let Some(totals) = by_direction {
                direction_lines(&mut r, totals);
                r.insight(format!(
                    "Las facturas por cobrar representan el {} del total",
                    format_percent(totals.receivable.sum, stats.total)
                ));
                r.insight(format!(
                    "Posición neta (por cobrar - por pagar): {}",
                    format_money(totals.receivable.sum - totals.payable.sum)
                ));
            }
        }
        Analysis::Average { filter, stats, max, min } => {
            r.summary = format!(
                "El monto promedio de las facturas ({}) es de {}.",
                filter.describe(),
                format_money(stats.mean)
            );
            stats_lines(&mut r, stats);
            r.detail(format!("Factura más alta: {} ({})", format_money(max.amount), or_na(max.label.as_deref())));
            r.detail(format!("Factura más baja: {} ({})", format_money(min.amount), or_na(min.label.as_deref())));
            if stats.mean != 0.0 {
                r.insight(format!(
                    "La factura más alta equivale a {:.1} veces el promedio",
                    max.amount / stats.mean
                ));
            }
            r.insight(format!("Rango de montos: {}", format_money(max.amount - min.amount)));
        }
        Analysis::TotalByTypeAndMonth { direction, month, stats, month_totals } => {
            r.summary = format!(
                "El total de facturas {} en {} es de {}.",
                direction.label(),
                month,
                format_money(stats.total)
            );
            r.detail(format!("Total {} en {}: {}", direction.label(), month, format_money(stats.total)));
            r.detail(format!("Número de facturas: {}", stats.count));
            r.detail(format!("Promedio por factura: {}", format_money(stats.mean)));
            direction_lines(&mut r, month_totals);
            let month_total = month_totals.receivable.sum + month_totals.payable.sum;
            r.insight(format!(
                "Representa el {} de la facturación de {}",
                format_percent(stats.total, month_total),
                month
            ));
            let other = match direction {
                Direction::Receivable => Direction::Payable,
                Direction::Payable => Direction::Receivable,
            };
            r.insight(format!(
                "Diferencia frente a lo {} del mes: {}",
                other.label(),
                format_money(stats.total - month_totals.get(other).sum)
            ));
        }
        Analysis::FixedExpenses { stats, max, by_category } => {
            r.summary = format!("Tus gastos fijos suman {}.", format_money(stats.total));
            r.detail(format!("Total de gastos fijos: {}", format_money(stats.total)));
            r.detail(format!("Número de gastos: {}", stats.count));
            r.detail(format!("Promedio por gasto: {}", format_money(stats.mean)));
            r.detail(format!("Gasto más alto: {} ({})", format_money(max.amount), or_na(max.label.as_deref())));
            ranked_lines(&mut r, by_category, "registros");
            r.insight(format!(
                "El gasto más alto representa el {} del total",
                format_percent(max.amount, stats.total)
            ));
        }
        Analysis::CashFlow { month, inflows, outflows, net, movements, closing_balance } => {
            let period = month.map(|m| format!(" en {}", m)).unwrap_or_default();
            r.summary = format!("El flujo neto de efectivo{} es de {}.", period, format_money(*net));
            r.detail(format!("Ingresos: {} ({} movimientos)", format_money(inflows.total), inflows.count));
            r.detail(format!("Egresos: {} ({} movimientos)", format_money(outflows.total), outflows.count));
            r.detail(format!("Flujo neto: {}", format_money(*net)));
            r.detail(format!("Movimientos totales: {}", movements));
            r.detail(match closing_balance {
                Some(balance) => format!("Saldo final: {}", format_money(*balance)),
                None => "Saldo final: N/A".to_string(),
            });
            r.insight(format!(
                "Los egresos equivalen al {} de los ingresos",
                format_percent(outflows.total.abs(), inflows.total)
            ));
            r.insight(if *net >= 0.0 {
                "El flujo de efectivo es positivo".to_string()
            } else {
                "El flujo de efectivo es negativo; revisa los egresos más grandes".to_string()
            });
        }
        Analysis::ByProviderMax { direction, top, groups, total } => {
            let who = match direction {
                Direction::Payable => "proveedor",
                Direction::Receivable => "cliente",
            };
            r.summary = format!(
                "El {} con mayor monto ({}) es {} con {}.",
                who,
                direction.label(),
                top.key,
                format_money(top.stats.sum)
            );
            r.detail(format!("{}: {}", capitalize(who), top.key));
            r.detail(format!("Monto total: {}", format_money(top.stats.sum)));
            r.detail(format!("Número de facturas: {}", top.stats.count));
            ranked_lines(&mut r, groups, "facturas");
            r.insight(format!(
                "Concentra el {} del total {}",
                format_percent(top.stats.sum, *total),
                direction.label()
            ));
        }
        Analysis::MonthWithMostInvoices { direction, top_month, top, months, total_count } => {
            r.summary = format!("El mes con más facturas es {} ({} facturas).", top_month, top.count);
            if let Some(direction) = direction {
                r.detail(format!("Tipo: {}", direction.literal()));
            }
            for (number, group) in months {
                r.detail(format!(
                    "{}: {} facturas, {}",
                    month_name(*number),
                    group.count,
                    format_money(group.sum)
                ));
            }
            r.insight(format!(
                "{} concentra el {} de las facturas",
                capitalize(top_month.name()),
                format_percent(top.count as f64, *total_count as f64)
            ));
        }
        Analysis::PaymentTermsByProvider { top, groups } => {
            r.summary = format!(
                "El proveedor con los términos de pago más generosos es {} ({:.1} días en promedio).",
                top.key, top.stats.mean
            );
            for group in rank_by_mean(groups).iter().take(TOP_N) {
                r.detail(format!(
                    "{}: {:.1} días en promedio ({} facturas)",
                    group.key, group.stats.mean, group.stats.count
                ));
            }
            let all: f64 = groups.values().map(|g| g.sum).sum();
            let count: usize = groups.values().map(|g| g.count).sum();
            if count > 0 {
                r.insight(format!(
                    "El plazo promedio entre proveedores es de {:.1} días",
                    all / count as f64
                ));
            }
        }
        Analysis::General { datasets } => {
            r.summary = format!("Resumen general de {} fuentes de datos.", datasets.len());
            for summary in datasets {
                r.detail(format!(
                    "{}: {} registros, total {}, promedio {}",
                    summary.dataset,
                    summary.stats.count,
                    format_money(summary.stats.total),
                    format_money(summary.stats.mean)
                ));
            }
            r.insight(format!("Pregunta interpretada como consulta general: \"{}\"", question.text.trim()));
            r.insight("Pregunta por facturas, gastos fijos o flujo de efectivo para un análisis específico");
        }
    }

    r
}

fn record_lines(r: &mut FormattedResponse, record: &Record) {
    r.detail(format!("Contraparte: {}", or_na(record.label.as_deref())));
    r.detail(format!("Monto: {}", format_money(record.amount)));
    r.detail(format!("Fecha: {}", date_text(record)));
    if let Some(folio) = &record.reference {
        r.detail(format!("Folio: {}", folio));
    }
}

fn stats_lines(r: &mut FormattedResponse, stats: &AmountStats) {
    r.detail(format!("Total: {}", format_money(stats.total)));
    r.detail(format!("Número de facturas: {}", stats.count));
    r.detail(format!("Promedio: {}", format_money(stats.mean)));
    r.detail(format!("Mínimo: {}", format_money(stats.min)));
    r.detail(format!("Máximo: {}", format_money(stats.max)));
}

fn direction_lines(r: &mut FormattedResponse, totals: &DirectionTotals) {
    for direction in [Direction::Receivable, Direction::Payable] {
        let g = totals.get(direction);
        r.detail(format!("Total {}: {} ({} facturas)", direction.label(), format_money(g.sum), g.count));
    }
}

fn ranked_lines(r: &mut FormattedResponse, groups: &BTreeMap<String, GroupStats>, unit: &str) {
    for (i, group) in rank_by_sum(groups).iter().take(TOP_N).enumerate() {
        r.detail(format!(
            "{}. {}: {} ({} {})",
            i + 1,
            group.key,
            format_money(group.stats.sum),
            group.stats.count,
            unit
        ));
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::aggregate;
    use crate::classifier::classify;
    use crate::dataset::{Cell, DatasetKind};
    use crate::loader::{normalize, DatasetMap, RawTable};

    fn invoices(rows: &[(&str, &str, &str, &str)]) -> DatasetMap {
        let raw = RawTable {
            headers: vec!["Tipo".into(), "Cliente/Proveedor".into(), "Fecha".into(), "Monto (MXN)".into()],
            rows: rows
                .iter()
                .map(|(t, c, d, m)| vec![Cell::from_text(t), Cell::from_text(c), Cell::from_text(d), Cell::from_text(m)])
                .collect(),
        };
        let ds = normalize(DatasetKind::Invoices, "facturas.csv", raw);
        [(ds.kind, ds)].into_iter().collect()
    }

    #[test]
    fn test_format_money() {
        assert_eq!(format_money(1234.56), "$1,234.56 MXN");
        assert_eq!(format_money(-1234.5), "-$1,234.50 MXN");
        assert_eq!(format_money(0.0), "$0.00 MXN");
        assert_eq!(format_money(1_000_000.0), "$1,000,000.00 MXN");
        assert_eq!(format_money(999.999), "$1,000.00 MXN");
        assert_eq!(format_money(2.125), "$2.13 MXN");
        assert_eq!(format_money(-0.001), "$0.00 MXN");
        assert_eq!(format_money(f64::NAN), "$0.00 MXN");
    }

    #[test]
    fn test_format_percent_zero_whole() {
        assert_eq!(format_percent(5.0, 0.0), "0.0%");
        assert_eq!(format_percent(1.0, 4.0), "25.0%");
    }

    #[test]
    fn test_extract_amounts() {
        let text = "Total: $1,234.56 MXN, saldo -$20.00 MXN y 30% de $5";
        assert_eq!(extract_amounts(text), vec![1234.56, -20.0, 5.0]);
    }

    #[test]
    fn test_four_sections_in_order() {
        let data = invoices(&[("Por pagar", "ACME", "2024-01-01", "100"), ("Por pagar", "Globex", "2024-01-02", "300")]);
        let q = classify("¿Cuál es la factura por pagar más alta?");
        let text = format(&q, &aggregate(&q, &data));

        let positions: Vec<usize> = [SUMMARY_HEADER, DETAIL_HEADER, SOURCES_HEADER, INSIGHTS_HEADER]
            .iter()
            .map(|h| text.find(h).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_payable_max_detail_contains_amount() {
        let data = invoices(&[("Por pagar", "ACME", "2024-01-01", "100"), ("Por pagar", "Globex", "2024-01-02", "300")]);
        let q = classify("¿Cuál es la factura por pagar más alta?");
        let text = format(&q, &aggregate(&q, &data));

        let detail = &text[text.find(DETAIL_HEADER).unwrap()..text.find(SOURCES_HEADER).unwrap()];
        assert!(detail.contains("300.00"));
        assert!(text.contains("Globex"));
        assert!(text.contains("75.0%"));
    }

    #[test]
    fn test_round_trip_amounts() {
        let data = invoices(&[
            ("Por cobrar", "A", "2024-05-10", "50000.456"),
            ("Por cobrar", "B", "2024-05-11", "1234.5"),
            ("Por pagar", "C", "2024-05-12", "-10"),
        ]);
        let q = classify("total de facturas por cobrar en mayo");
        let result = aggregate(&q, &data).unwrap();
        let text = format_result(&q, &result);

        let amounts = extract_amounts(&text);
        let expected = match &result.analysis {
            Analysis::TotalByTypeAndMonth { stats, .. } => stats.total,
            other => panic!("unexpected analysis {:?}", other),
        };
        assert!(amounts.iter().any(|a| (a - expected).abs() <= 0.005));
        assert!(amounts.iter().any(|a| (a - (-10.0)).abs() <= 0.005));
    }

    #[test]
    fn test_empty_result_renders_no_records() {
        let q = classify("total de facturas por pagar en diciembre");
        let outcome = Err(AgentError::empty_result("invoices", "mes \"diciembre\""));
        let text = format(&q, &outcome);
        assert!(text.contains("No hay registros"));
        assert!(text.contains(INSIGHTS_HEADER));
    }

    #[test]
    fn test_other_errors_render_user_message() {
        let q = classify("¿Cuál es la factura por pagar más alta?");
        let outcome = Err(AgentError::missing_column("invoices", "amount"));
        assert_eq!(format(&q, &outcome), AgentError::missing_column("invoices", "amount").user_message());
    }

    #[test]
    fn test_model_answer_keeps_sources() {
        let data = invoices(&[("Por pagar", "ACME", "2024-01-01", "100")]);
        let q = classify("¿Cuál es la factura por pagar más alta?");
        let result = aggregate(&q, &data).unwrap();
        let text = format_model_answer(&q, &result, "- La factura más alta es de ACME.\n\n- Conviene revisarla.");

        assert!(text.contains("La factura más alta es de ACME."));
        assert!(text.contains("facturas.csv"));
        assert!(text.contains("Monto (MXN)"));
    }

    #[test]
    fn test_format_is_deterministic() {
        let data = invoices(&[("Por pagar", "ACME", "2024-01-01", "100"), ("Por pagar", "B", "2024-01-02", "100")]);
        let q = classify("¿Qué proveedor tiene el mayor monto?");
        assert_eq!(format(&q, &aggregate(&q, &data)), format(&q, &aggregate(&q, &data)));
    }
}
