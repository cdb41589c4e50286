// ❓ Question Model
// Category enumeration + parameters extracted from the user's text

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// CATEGORY
// ============================================================================

/// Closed set of question intents. Extend by adding a case here; every
/// `match` on it (resolver, aggregation, formatter) must then handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    PayableMax,
    ReceivableMax,
    InvoiceMax,
    TotalAmount,
    AverageAmount,
    FixedExpenses,
    CashFlow,
    ByProviderMax,
    MonthWithMostInvoices,
    TotalByTypeAndMonth,
    PaymentTermsByProvider,
    General,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::PayableMax,
        Category::ReceivableMax,
        Category::InvoiceMax,
        Category::TotalAmount,
        Category::AverageAmount,
        Category::FixedExpenses,
        Category::CashFlow,
        Category::ByProviderMax,
        Category::MonthWithMostInvoices,
        Category::TotalByTypeAndMonth,
        Category::PaymentTermsByProvider,
        Category::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::PayableMax => "payable_max",
            Category::ReceivableMax => "receivable_max",
            Category::InvoiceMax => "invoice_max",
            Category::TotalAmount => "total_amount",
            Category::AverageAmount => "average_amount",
            Category::FixedExpenses => "fixed_expenses",
            Category::CashFlow => "cash_flow",
            Category::ByProviderMax => "by_provider_max",
            Category::MonthWithMostInvoices => "month_with_most_invoices",
            Category::TotalByTypeAndMonth => "total_by_type_and_month",
            Category::PaymentTermsByProvider => "payment_terms_by_provider",
            Category::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DIRECTION (invoice type)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Money owed to the business
    Receivable,
    /// Money the business owes
    Payable,
}

impl Direction {
    /// Literal value in the invoice type column
    pub fn literal(&self) -> &'static str {
        match self {
            Direction::Receivable => "Por cobrar",
            Direction::Payable => "Por pagar",
        }
    }

    /// Exact match against the type column (trimmed, case-insensitive)
    pub fn from_literal(value: &str) -> Option<Direction> {
        let value = value.trim().to_lowercase();
        match value.as_str() {
            "por cobrar" => Some(Direction::Receivable),
            "por pagar" => Some(Direction::Payable),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Direction::Receivable => "por cobrar",
            Direction::Payable => "por pagar",
        }
    }
}

// ============================================================================
// ENTITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Provider,
    Client,
}

impl Entity {
    pub fn label(&self) -> &'static str {
        match self {
            Entity::Provider => "proveedor",
            Entity::Client => "cliente",
        }
    }

    /// Providers bill us, clients owe us
    pub fn default_direction(&self) -> Direction {
        match self {
            Entity::Provider => Direction::Payable,
            Entity::Client => Direction::Receivable,
        }
    }
}

// ============================================================================
// MONTH
// ============================================================================

pub const MONTH_NAMES: [&str; 12] = [
    "enero", "febrero", "marzo", "abril", "mayo", "junio",
    "julio", "agosto", "septiembre", "octubre", "noviembre", "diciembre",
];

/// Calendar month, 1-12
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Month(u32);

impl Month {
    pub fn new(number: u32) -> Option<Month> {
        (1..=12).contains(&number).then_some(Month(number))
    }

    pub fn from_name(name: &str) -> Option<Month> {
        let name = name.trim().to_lowercase();
        MONTH_NAMES
            .iter()
            .position(|m| *m == name)
            .map(|idx| Month(idx as u32 + 1))
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        MONTH_NAMES[(self.0 - 1) as usize]
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// QUESTION
// ============================================================================

/// A classified question. Created by the classifier, never mutated after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub normalized: String,
    pub category: Category,
    pub month: Option<Month>,
    pub direction: Option<Direction>,
    pub entity: Option<Entity>,
    pub needs_clarification: bool,
    /// Id of the classification rule that fired
    pub rule_id: String,
}

impl Question {
    /// Direction requested explicitly, else implied by the entity
    pub fn effective_direction(&self) -> Option<Direction> {
        self.direction
            .or_else(|| self.entity.map(|e| e.default_direction()))
    }

    pub fn clarification_prompt(&self) -> String {
        format!(
            "Tu pregunta '{}' es muy breve. ¿Podrías ser más específico sobre qué información financiera necesitas?",
            self.text.trim()
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
