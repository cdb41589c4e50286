// ⚙️ Configuration
// Explicit configuration value handed to the orchestrator - nothing global.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_DATA_DIR: &str = "Datasets v2/Datasets v2";

// ============================================================================
// LLM SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,

    /// Never serialized back out
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,

    pub base_url: String,

    /// Attempts after the first failed call
    pub max_retries: u32,

    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 2000,
            temperature: 0.1,
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut errors = Vec::new();

        if self.api_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
            errors.push("API key is required (OPENAI_API_KEY)".to_string());
        }
        if self.model.trim().is_empty() {
            errors.push("model name is required".to_string());
        }
        if self.max_tokens == 0 {
            errors.push("max tokens must be positive".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            errors.push("temperature must be between 0 and 2".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Config(errors.join("; ")))
        }
    }
}

// ============================================================================
// AGENT SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub data_directory: PathBuf,

    /// Lower-case extensions including the dot
    pub supported_extensions: Vec<String>,

    /// Question/response pairs kept in memory
    pub history_limit: usize,

    /// Pairs injected into an LLM prompt
    pub history_context: usize,

    pub log_level: String,

    pub llm: LlmConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            data_directory: PathBuf::from(DEFAULT_DATA_DIR),
            supported_extensions: vec![".xlsx".to_string(), ".csv".to_string(), ".json".to_string()],
            history_limit: 10,
            history_context: 3,
            log_level: "info".to_string(),
            llm: LlmConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Config pointing at a data directory, everything else default
    pub fn with_data_directory(dir: impl Into<PathBuf>) -> Self {
        AgentConfig {
            data_directory: dir.into(),
            ..AgentConfig::default()
        }
    }

    /// Load `.env` (if any) and read the process environment
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (environment, map in tests)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AgentConfig::default();
        let llm_defaults = LlmConfig::default();

        let llm = LlmConfig {
            model: lookup("FINANCIAL_AGENT_MODEL").unwrap_or(llm_defaults.model),
            max_tokens: parse_or("FINANCIAL_AGENT_MAX_TOKENS", &lookup, llm_defaults.max_tokens),
            temperature: parse_or("FINANCIAL_AGENT_TEMPERATURE", &lookup, llm_defaults.temperature),
            api_key: lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()),
            base_url: lookup("FINANCIAL_AGENT_BASE_URL").unwrap_or(llm_defaults.base_url),
            max_retries: parse_or("FINANCIAL_AGENT_MAX_RETRIES", &lookup, llm_defaults.max_retries),
            timeout_secs: parse_or("FINANCIAL_AGENT_TIMEOUT", &lookup, llm_defaults.timeout_secs),
        };

        AgentConfig {
            data_directory: lookup("FINANCIAL_AGENT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_directory),
            log_level: lookup("FINANCIAL_AGENT_LOG_LEVEL")
                .map(|l| l.to_lowercase())
                .unwrap_or(defaults.log_level),
            llm,
            ..defaults
        }
    }

    /// Check the deterministic pipeline settings
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut errors = Vec::new();

        if !self.data_directory.is_dir() {
            errors.push(format!(
                "data directory {} does not exist",
                self.data_directory.display()
            ));
        }
        if self.supported_extensions.is_empty() {
            errors.push("at least one file extension must be supported".to_string());
        }
        if self.history_context > self.history_limit {
            errors.push("history context cannot exceed history limit".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Config(errors.join("; ")))
        }
    }

    pub fn supports_extension(&self, ext: &str) -> bool {
        let ext = format!(".{}", ext.trim_start_matches('.').to_lowercase());
        self.supported_extensions
            .iter()
            .any(|e| format!(".{}", e.trim_start_matches('.').to_lowercase()) == ext)
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> T
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparseable {}={:?}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}

// ============================================================================
// TESTS
// ============================================================================
