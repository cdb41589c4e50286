// 🏷️ Question Classifier - Rules as Data
// Ordered keyword rules mapping free text to a closed category set

use crate::question::{Category, Direction, Entity, Month, Question, MONTH_NAMES};
use tracing::debug;

/// Questions shorter than this are sent back for clarification
pub const MIN_QUESTION_WORDS: usize = 3;

// ============================================================================
// TEXT NORMALIZATION
// ============================================================================

/// Lower-case, fold accents, punctuation to spaces, single-space separated
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
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

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// SIGNALS (parameters extracted before rule matching)
// ============================================================================

#[derive(Debug, Clone)]
pub struct Signals {
    pub normalized: String,
    pub words: Vec<String>,
    pub month: Option<Month>,
    pub direction: Option<Direction>,
    pub entity: Option<Entity>,
}

impl Signals {
    pub fn extract(text: &str) -> Self {
        let normalized = normalize_text(text);
        let words: Vec<String> = normalized.split_whitespace().map(str::to_string).collect();

        let mut signals = Signals {
            normalized,
            words,
            month: None,
            direction: None,
            entity: None,
        };

        // First month in calendar order wins
        signals.month = MONTH_NAMES
            .iter()
            .find(|name| signals.has_word(name))
            .and_then(|name| Month::from_name(name));

        signals.direction = if signals.contains_keyword("por cobrar") {
            Some(Direction::Receivable)
        } else if signals.contains_keyword("por pagar") {
            Some(Direction::Payable)
        } else if signals.contains_keyword("cobrar") {
            Some(Direction::Receivable)
        } else if signals.contains_keyword("pagar") {
            Some(Direction::Payable)
        } else {
            None
        };

        signals.entity = if signals.contains_keyword("proveedor*") {
            Some(Entity::Provider)
        } else if signals.contains_keyword("cliente*") {
            Some(Entity::Client)
        } else {
            None
        };

        signals
    }

    fn has_word(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }

    /// Keyword forms:
    /// - `"por pagar"` phrase, matched on word boundaries
    /// - `"factura*"` any word starting with the prefix
    /// - `"mes"` whole word
    pub fn contains_keyword(&self, keyword: &str) -> bool {
        if let Some(prefix) = keyword.strip_suffix('*') {
            return self.words.iter().any(|w| w.starts_with(prefix));
        }
        if keyword.contains(' ') {
            let haystack = format!(" {} ", self.normalized);
            return haystack.contains(&format!(" {} ", keyword));
        }
        self.has_word(keyword)
    }

    fn any_keyword(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.contains_keyword(k))
    }
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

const SUPERLATIVES: &[&str] = &[
    "alta", "alto", "altas", "altos", "mayor", "mayores", "maxima", "maximo", "grande",
];

#[derive(Debug, Clone)]
pub struct IntentRule {
    /// Rule ID for tracking
    pub id: &'static str,

    pub category: Category,

    /// Every group must match; a group matches when any keyword appears
    pub all_of: Vec<Vec<&'static str>>,

    pub requires_month: bool,

    pub requires_direction: bool,

    /// Only fires for this extracted direction
    pub for_direction: Option<Direction>,

    /// Priority (higher = evaluated first)
    pub priority: i32,
}

impl IntentRule {
    fn new(id: &'static str, category: Category, priority: i32) -> Self {
        IntentRule {
            id,
            category,
            all_of: Vec::new(),
            requires_month: false,
            requires_direction: false,
            for_direction: None,
            priority,
        }
    }

    fn with_group(mut self, keywords: &[&'static str]) -> Self {
        self.all_of.push(keywords.to_vec());
        self
    }

    fn with_month(mut self) -> Self {
        self.requires_month = true;
        self
    }

    fn with_direction(mut self) -> Self {
        self.requires_direction = true;
        self
    }

    fn for_direction(mut self, direction: Direction) -> Self {
        self.for_direction = Some(direction);
        self
    }

    pub fn matches(&self, signals: &Signals) -> bool {
        if self.for_direction.is_some() && signals.direction != self.for_direction {
            return false;
        }
        if self.requires_month && signals.month.is_none() {
            return false;
        }
        if self.requires_direction && signals.direction.is_none() {
            return false;
        }
        self.all_of.iter().all(|group| signals.any_keyword(group))
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct QuestionClassifier {
    rules: Vec<IntentRule>,
}

impl QuestionClassifier {
    /// Classifier with the built-in rule table
    pub fn new() -> Self {
        QuestionClassifier::from_rules(default_rules())
    }

    /// Create a classifier from a list of rules
    pub fn from_rules(mut rules: Vec<IntentRule>) -> Self {
        // Sort by priority (higher first); stable so equal priorities keep order
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        QuestionClassifier { rules }
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    pub fn classify(&self, text: &str) -> Question {
        let signals = Signals::extract(text);

        // Clarification policy overrides every keyword match
        let (category, rule_id, needs_clarification) = if signals.words.len() < MIN_QUESTION_WORDS {
            (Category::General, "too_short", true)
        } else {
            self.rules
                .iter()
                .find(|rule| rule.matches(&signals))
                .map(|rule| (rule.category, rule.id, false))
                .unwrap_or((Category::General, "fallback", false))
        };

        debug!(
            "classified {:?} as {} (rule {}, month {:?}, direction {:?})",
            text, category, rule_id, signals.month, signals.direction
        );

        Question {
            text: text.trim().to_string(),
            normalized: signals.normalized,
            category,
            month: signals.month,
            direction: signals.direction,
            entity: signals.entity,
            needs_clarification,
            rule_id: rule_id.to_string(),
        }
    }
}

impl Default for QuestionClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience wrapper over the built-in rule table
pub fn classify(text: &str) -> Question {
    QuestionClassifier::new().classify(text)
}

/// Built-in rule table. Order (priority) is load-bearing: overlapping keyword
/// sets resolve to the most specific category first.
pub fn default_rules() -> Vec<IntentRule> {
    vec![
        IntentRule::new("payment_terms", Category::PaymentTermsByProvider, 120)
            .with_group(&["proveedor*", "cliente*"])
            .with_group(&["terminos", "termino", "generosos", "generoso", "plazo*", "credito"]),
        IntentRule::new("provider_max_amount", Category::ByProviderMax, 110)
            .with_group(&["proveedor*", "cliente*"])
            .with_group(&["mayor", "mas"])
            .with_group(&["monto*", "total*"]),
        IntentRule::new("month_most_invoices", Category::MonthWithMostInvoices, 100)
            .with_group(&["mes", "meses"])
            .with_group(&["mas", "mayor"])
            .with_group(&["factura*"]),
        IntentRule::new("total_type_month", Category::TotalByTypeAndMonth, 90)
            .with_group(&["total*", "suma*"])
            .with_month()
            .with_direction(),
        IntentRule::new("payable_max", Category::PayableMax, 80)
            .with_group(&["por pagar"])
            .with_group(SUPERLATIVES),
        IntentRule::new("payable_invoice_max", Category::PayableMax, 75)
            .with_group(&["factura*"])
            .with_group(SUPERLATIVES)
            .for_direction(Direction::Payable),
        IntentRule::new("receivable_max", Category::ReceivableMax, 70)
            .with_group(&["por cobrar"])
            .with_group(SUPERLATIVES),
        IntentRule::new("receivable_invoice_max", Category::ReceivableMax, 65)
            .with_group(&["factura*"])
            .with_group(SUPERLATIVES)
            .for_direction(Direction::Receivable),
        IntentRule::new("invoice_max", Category::InvoiceMax, 60)
            .with_group(&["factura*"])
            .with_group(SUPERLATIVES),
        IntentRule::new("fixed_expenses", Category::FixedExpenses, 50)
            .with_group(&["gasto*"]),
        IntentRule::new("cash_flow", Category::CashFlow, 40)
            .with_group(&[
                "flujo", "cuenta", "saldo", "banco*", "bancari*", "movimiento*", "ingreso*",
                "egreso*",
            ]),
        IntentRule::new("average", Category::AverageAmount, 30)
            .with_group(&["promedio*", "media"]),
        IntentRule::new("total", Category::TotalAmount, 20)
            .with_group(&["total*", "suma*"]),
    ]
}

// ============================================================================
// TESTS
// ============================================================================
