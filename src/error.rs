// 🚨 Error Taxonomy
// Every stage converts its internal failures into one of these kinds before
// handing control back to the orchestrator.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// Backing file missing, unreadable or corrupt
    #[error("data unavailable from {source_name}: {reason}")]
    DataUnavailable { source_name: String, reason: String },

    /// A semantic column role could not be resolved from the headers
    #[error("dataset '{dataset}' has no {role} column")]
    MissingColumn { dataset: String, role: String },

    /// A filter matched zero rows (recoverable)
    #[error("no rows in '{dataset}' match {filter}")]
    EmptyResult { dataset: String, filter: String },

    /// Network / API failure after retries
    #[error("upstream service error: {0}")]
    UpstreamService(String),

    /// The model answered but the structured reply could not be decoded
    #[error("invalid model reply: {0}")]
    InvalidModelReply(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    pub fn data_unavailable(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::DataUnavailable {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_column(dataset: impl Into<String>, role: impl Into<String>) -> Self {
        AgentError::MissingColumn {
            dataset: dataset.into(),
            role: role.into(),
        }
    }

    pub fn empty_result(dataset: impl Into<String>, filter: impl Into<String>) -> Self {
        AgentError::EmptyResult {
            dataset: dataset.into(),
            filter: filter.into(),
        }
    }

    pub fn is_empty_result(&self) -> bool {
        matches!(self, AgentError::EmptyResult { .. })
    }

    /// Plain-text message shown to the user (never a debug dump)
    pub fn user_message(&self) -> String {
        match self {
            AgentError::DataUnavailable { source_name, reason } => {
                format!("No se pudieron cargar los datos de {}: {}", source_name, reason)
            }
            AgentError::MissingColumn { dataset, role } => format!(
                "El conjunto de datos '{}' no contiene el campo necesario ({})",
                dataset, role
            ),
            AgentError::EmptyResult { dataset, filter } => format!(
                "No hay registros en '{}' que coincidan con el filtro: {}",
                dataset, filter
            ),
            AgentError::UpstreamService(detail) | AgentError::InvalidModelReply(detail) => format!(
                "El servicio de análisis no está disponible en este momento ({})",
                detail
            ),
            AgentError::Config(detail) => format!("Configuración inválida: {}", detail),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
