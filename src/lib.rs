// Finance Agent - Core Library
// Question answering over a small business's invoices, fixed expenses and
// bank statement. Used by the CLI, the API server and the tests.

pub mod error;
pub mod config;
pub mod question;
pub mod classifier;     // Question → category + filters
pub mod resolver;       // Category → datasets
pub mod dataset;
pub mod schema;         // Header normalization + column roles
pub mod loader;         // Spreadsheet discovery, readers, normalization
pub mod aggregation;
pub mod formatter;
pub mod orchestrator;
pub mod history;
pub mod llm;            // Model-backed assistant

// Re-export commonly used types
pub use error::AgentError;
pub use config::{AgentConfig, LlmConfig, DEFAULT_DATA_DIR};
pub use question::{Category, Direction, Entity, Month, Question};
pub use classifier::{classify, normalize_text, IntentRule, QuestionClassifier};
pub use resolver::resolve;
pub use dataset::{Cell, Dataset, DatasetKind, NormalizationReport};
pub use schema::{normalize_header, ColumnRole};
pub use loader::{DataFile, DataLoader, DatasetMap, RawTable, SourceOverview, TableReader};
pub use aggregation::{
    aggregate, AggregationResult, AmountStats, Analysis, Breakdown, BreakdownTable, GroupStats, Record,
    SourceRef,
};
pub use formatter::{extract_amounts, format_money, FormattedResponse};
pub use orchestrator::{Orchestrator, PipelineRun, Stage, Terminal};
pub use history::ConversationHistory;
pub use llm::{AnalysisModel, ModelAssistant, ModelPrompt, ModelReply, OpenAiModel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
