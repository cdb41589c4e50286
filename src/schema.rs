// 📐 Shape Layer - Column Roles
// Header normalization + per-dataset synonym tables for semantic roles

use crate::dataset::DatasetKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// COLUMN ROLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// Monetary value
    Amount,
    /// Calendar date (issue date, movement date)
    Date,
    /// Invoice direction / movement type
    Type,
    /// Client or provider
    Counterparty,
    /// Expense category
    Category,
    /// Free-text description
    Description,
    /// Running account balance
    Balance,
    /// Invoice number
    Folio,
    /// Payment terms in days
    PaymentTerms,
}

impl ColumnRole {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnRole::Amount => "amount",
            ColumnRole::Date => "date",
            ColumnRole::Type => "type",
            ColumnRole::Counterparty => "counterparty",
            ColumnRole::Category => "category",
            ColumnRole::Description => "description",
            ColumnRole::Balance => "balance",
            ColumnRole::Folio => "folio",
            ColumnRole::PaymentTerms => "payment_terms",
        }
    }

    /// Roles holding money, coerced to numbers on load
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnRole::Amount | ColumnRole::Balance | ColumnRole::PaymentTerms)
    }
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// HEADER NORMALIZATION
// ============================================================================

/// `"Monto (MXN)"` → `"monto_mxn"`, `"Fecha de Emisión"` → `"fecha_de_emision"`.
/// Idempotent: underscores count as separators.
pub fn normalize_header(header: &str) -> String {
    let folded: String = header
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join("_")
}

// ============================================================================
// SYNONYM TABLES
// ============================================================================

/// Candidate normalized headers per role, in priority order.
pub fn role_candidates(kind: DatasetKind) -> Vec<(ColumnRole, &'static [&'static str])> {
    match kind {
        DatasetKind::Invoices => vec![
            entry(ColumnRole::Amount, &["monto_mxn", "monto", "importe_mxn", "importe", "total", "amount"]),
            entry(ColumnRole::Date, &["fecha_de_emision", "fecha_emision", "fecha", "date"]),
            entry(ColumnRole::Type, &["tipo", "tipo_de_factura", "direccion", "type"]),
            entry(
                ColumnRole::Counterparty,
                &["cliente_proveedor", "proveedor_cliente", "proveedor", "cliente", "contraparte", "vendedor"],
            ),
            entry(ColumnRole::Folio, &["folio_de_factura", "folio", "factura", "invoice"]),
            entry(
                ColumnRole::PaymentTerms,
                &["terminos_de_pago", "terminos_de_pago_dias", "terminos", "dias_de_credito", "plazo"],
            ),
            entry(ColumnRole::Description, &["descripcion", "concepto"]),
        ],
        DatasetKind::FixedExpenses => vec![
            entry(ColumnRole::Amount, &["monto_mxn", "monto", "importe_mxn", "importe", "amount"]),
            entry(ColumnRole::Category, &["gasto_fijo", "categoria", "rubro", "concepto"]),
            entry(ColumnRole::Date, &["fecha", "fecha_de_pago", "date"]),
            entry(ColumnRole::Counterparty, &["proveedor", "beneficiario"]),
            entry(ColumnRole::Description, &["descripcion"]),
        ],
        DatasetKind::BankStatement => vec![
            entry(
                ColumnRole::Amount,
                &["monto_de_la_transaccion_mxn", "monto_de_la_transaccion", "monto_mxn", "monto", "importe", "amount"],
            ),
            entry(ColumnRole::Date, &["fecha", "fecha_de_operacion", "date"]),
            entry(
                ColumnRole::Description,
                &["descripcion_de_la_transaccion", "descripcion", "concepto"],
            ),
            entry(ColumnRole::Balance, &["saldo_mxn", "saldo", "balance"]),
            entry(ColumnRole::Type, &["tipo", "tipo_de_movimiento"]),
        ],
    }
}

fn entry(
    role: ColumnRole,
    candidates: &'static [&'static str],
) -> (ColumnRole, &'static [&'static str]) {
    (role, candidates)
}

/// Resolve roles against normalized headers, first candidate present wins.
/// A column serves at most one role.
pub fn resolve_roles(kind: DatasetKind, columns: &[String]) -> HashMap<ColumnRole, usize> {
    let mut roles = HashMap::new();
    let mut taken = vec![false; columns.len()];

    for (role, candidates) in role_candidates(kind) {
        let hit = candidates.iter().find_map(|candidate| {
            columns
                .iter()
                .enumerate()
                .find(|(idx, col)| !taken[*idx] && col.as_str() == *candidate)
                .map(|(idx, _)| idx)
        });

        if let Some(idx) = hit {
            taken[idx] = true;
            roles.insert(role, idx);
        }
    }

    roles
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(headers: &[&str]) -> Vec<String> {
        headers.iter().map(|h| normalize_header(h)).collect()
    }

    #[test]
    fn test_normalize_header_variants() {
        assert_eq!(normalize_header("Monto (MXN)"), "monto_mxn");
        assert_eq!(normalize_header("monto_mxn"), "monto_mxn");
        assert_eq!(normalize_header("  Monto "), "monto");
        assert_eq!(normalize_header("Fecha de Emisión"), "fecha_de_emision");
        assert_eq!(normalize_header("Cliente/Proveedor"), "cliente_proveedor");
        assert_eq!(
            normalize_header("Monto de la transacción (MXN)"),
            "monto_de_la_transaccion_mxn"
        );
    }

    #[test]
    fn test_normalize_header_idempotent() {
        for h in ["Monto (MXN)", "Fecha de Emisión", "Saldo (MXN)", "__a__b__"] {
            let once = normalize_header(h);
            assert_eq!(normalize_header(&once), once);
        }
    }

    #[test]
    fn test_amount_synonyms_resolve_to_one_role() {
        for header in ["Monto (MXN)", "monto_mxn", "Monto"] {
            let roles = resolve_roles(DatasetKind::Invoices, &cols(&[header]));
            assert_eq!(roles.get(&ColumnRole::Amount), Some(&0), "header {}", header);
        }
    }

    #[test]
    fn test_candidate_priority() {
        // "monto_mxn" outranks plain "monto" even when it appears later
        let roles = resolve_roles(DatasetKind::Invoices, &cols(&["Monto", "Monto (MXN)"]));
        assert_eq!(roles.get(&ColumnRole::Amount), Some(&1));
    }

    #[test]
    fn test_invoice_schema() {
        let roles = resolve_roles(
            DatasetKind::Invoices,
            &cols(&["Folio de Factura", "Tipo", "Cliente/Proveedor", "Fecha de Emisión", "Monto (MXN)"]),
        );
        assert_eq!(roles.get(&ColumnRole::Folio), Some(&0));
        assert_eq!(roles.get(&ColumnRole::Type), Some(&1));
        assert_eq!(roles.get(&ColumnRole::Counterparty), Some(&2));
        assert_eq!(roles.get(&ColumnRole::Date), Some(&3));
        assert_eq!(roles.get(&ColumnRole::Amount), Some(&4));
    }

    #[test]
    fn test_bank_statement_schema() {
        let roles = resolve_roles(
            DatasetKind::BankStatement,
            &cols(&["Fecha", "Descripción de la transacción", "Monto de la transacción (MXN)", "Saldo (MXN)"]),
        );
        assert_eq!(roles.get(&ColumnRole::Amount), Some(&2));
        assert_eq!(roles.get(&ColumnRole::Balance), Some(&3));
        assert_eq!(roles.get(&ColumnRole::Description), Some(&1));
    }

    #[test]
    fn test_missing_amount_role() {
        let roles = resolve_roles(DatasetKind::Invoices, &cols(&["Cliente", "Fecha", "Valor"]));
        assert!(!roles.contains_key(&ColumnRole::Amount));
        assert!(roles.contains_key(&ColumnRole::Counterparty));
    }

    #[test]
    fn test_column_serves_one_role() {
        // "concepto" is a category candidate before a description candidate
        let roles = resolve_roles(DatasetKind::FixedExpenses, &cols(&["Concepto", "Monto"]));
        assert_eq!(roles.get(&ColumnRole::Category), Some(&0));
        assert!(!roles.contains_key(&ColumnRole::Description));
    }
}
