// 🤖 Model-backed Assistant
// Runs the deterministic pipeline through Aggregate, then asks a language
// model for the narrative. The model may ask for one extra breakdown.

use crate::aggregation::{breakdown, AggregationResult, Breakdown, BreakdownTable};
use crate::config::{AgentConfig, LlmConfig};
use crate::dataset::{Dataset, DatasetKind};
use crate::error::AgentError;
use crate::formatter;
use crate::history::ConversationHistory;
use crate::orchestrator::{Gathered, Orchestrator, PipelineRun, Stage, Terminal};
use crate::question::{Category, Question};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

// ============================================================================
// MODEL CONTRACT
// ============================================================================

/// What the model sends back
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Answer(String),
    NeedsMoreData {
        breakdown: Option<Breakdown>,
        request: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait AnalysisModel: Send + Sync {
    async fn analyze(&self, prompt: &ModelPrompt) -> Result<ModelReply, AgentError>;

    fn name(&self) -> &str;
}

/// Structured reply as the model writes it
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireReply {
    Answer {
        answer: String,
    },
    NeedsMoreData {
        #[serde(default)]
        breakdown: Option<String>,
        #[serde(default)]
        request: String,
    },
}

/// Decode the model's JSON object. Failures are not retryable.
pub fn parse_reply(content: &str) -> Result<ModelReply, AgentError> {
    let wire: WireReply = serde_json::from_str(content.trim())
        .map_err(|e| AgentError::InvalidModelReply(format!("could not decode reply: {}", e)))?;

    match wire {
        WireReply::Answer { answer } if answer.trim().is_empty() => {
            Err(AgentError::InvalidModelReply("empty answer".to_string()))
        }
        WireReply::Answer { answer } => Ok(ModelReply::Answer(answer)),
        WireReply::NeedsMoreData { breakdown, request } => Ok(ModelReply::NeedsMoreData {
            breakdown: breakdown
                .as_deref()
                .and_then(Breakdown::from_request)
                .or_else(|| Breakdown::from_request(&request)),
            request,
        }),
    }
}

// ============================================================================
// PROMPTS
// ============================================================================

const SYSTEM_PROMPT: &str = r#"Eres un analista financiero para una PyME mexicana. Respondes en español.
Recibes una pregunta y el resultado de un análisis ya calculado sobre los datos del negocio.
Usa solo los números del análisis; no inventes cifras. Los montos están en MXN.

Responde SOLO con un objeto JSON, en uno de estos dos formatos:
{"status": "answer", "answer": "<respuesta con viñetas, una idea por línea>"}
{"status": "needs_more_data", "breakdown": "by_counterparty|by_month|by_payment_terms|by_category", "request": "<qué necesitas>"}

Pide más datos solo si el análisis no alcanza para responder."#;

pub fn build_prompt(
    question: &Question,
    result: &AggregationResult,
    extra: Option<&BreakdownTable>,
    history_context: &str,
) -> ModelPrompt {
    let mut user = String::new();

    if !history_context.is_empty() {
        user.push_str("Contexto de la conversación:\n");
        user.push_str(history_context);
        user.push_str("\n\n");
    }

    user.push_str(&format!("Pregunta: {}\n", question.text.trim()));
    user.push_str(&format!("Categoría: {}\n\n", question.category));

    let analysis = serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string());
    user.push_str("Análisis calculado:\n");
    user.push_str(&analysis);

    if let Some(table) = extra {
        let table_json = serde_json::to_string_pretty(table).unwrap_or_else(|_| "{}".to_string());
        user.push_str(&format!("\n\nDesglose adicional {}:\n", table.breakdown));
        user.push_str(&table_json);
        user.push_str("\n\nYa no puedes pedir más datos; responde con status \"answer\".");
    }

    ModelPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Breakdown used when the model asks for "more data" without saying which
pub fn default_breakdown(category: Category) -> Breakdown {
    match category {
        Category::FixedExpenses => Breakdown::ByCategory,
        Category::PaymentTermsByProvider => Breakdown::ByPaymentTerms,
        Category::MonthWithMostInvoices => Breakdown::ByCounterparty,
        Category::TotalAmount | Category::AverageAmount | Category::TotalByTypeAndMonth => Breakdown::ByMonth,
        Category::PayableMax
        | Category::ReceivableMax
        | Category::InvoiceMax
        | Category::CashFlow
        | Category::ByProviderMax
        | Category::General => Breakdown::ByCounterparty,
    }
}

// ============================================================================
// RETRIES
// ============================================================================

/// Outcome of a single attempt
#[derive(Debug)]
pub enum Attempt {
    /// Network, 429 or 5xx
    Transient(String),
    Fatal(AgentError),
}

/// Run `op` until it succeeds, fails fatally, or `max_retries` extra
/// attempts are spent. Waits `backoff * attempt` between attempts.
pub async fn with_retries<T, F, Fut>(max_retries: u32, backoff: Duration, mut op: F) -> Result<T, AgentError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(e)) => return Err(e),
            Err(Attempt::Transient(detail)) if attempt >= max_retries => {
                return Err(AgentError::UpstreamService(format!(
                    "{} (después de {} intentos)",
                    detail,
                    attempt + 1
                )));
            }
            Err(Attempt::Transient(detail)) => {
                attempt += 1;
                warn!("transient model failure, retry {}/{}: {}", attempt, max_retries, detail);
                tokio::time::sleep(backoff * attempt).await;
            }
        }
    }
}

// ============================================================================
// OPENAI CLIENT
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Chat-completions client
pub struct OpenAiModel {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: String,
    backoff: Duration,
}

impl OpenAiModel {
    pub fn new(config: LlmConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let api_key = config.api_key.clone().unwrap_or_default();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("could not build HTTP client: {}", e)))?;

        Ok(OpenAiModel {
            client,
            config,
            api_key,
            backoff: Duration::from_millis(500),
        })
    }

    async fn call_once(&self, prompt: &ModelPrompt) -> Result<String, Attempt> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "response_format": {"type": "json_object"}
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Attempt::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Attempt::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Attempt::Fatal(AgentError::UpstreamService(format!(
                "HTTP {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            ))));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(AgentError::InvalidModelReply(format!("bad response body: {}", e))))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Attempt::Fatal(AgentError::InvalidModelReply("no choices in response".to_string())))
    }
}

#[async_trait]
impl AnalysisModel for OpenAiModel {
    async fn analyze(&self, prompt: &ModelPrompt) -> Result<ModelReply, AgentError> {
        let content = with_retries(self.config.max_retries, self.backoff, |_| self.call_once(prompt)).await?;
        debug!("model replied with {} chars", content.len());
        parse_reply(&content)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// ASSISTANT
// ============================================================================

pub struct ModelAssistant {
    orchestrator: Arc<Orchestrator>,
    model: Box<dyn AnalysisModel>,
    history: ConversationHistory,
    history_context: usize,
}

impl ModelAssistant {
    pub fn new(config: AgentConfig, model: Box<dyn AnalysisModel>) -> Self {
        let history = ConversationHistory::new(config.history_limit);
        let history_context = config.history_context;
        ModelAssistant {
            orchestrator: Arc::new(Orchestrator::new(config)),
            model,
            history,
            history_context,
        }
    }

    /// OpenAI-backed assistant from configuration
    pub fn openai(config: AgentConfig) -> Result<Self, AgentError> {
        let model = OpenAiModel::new(config.llm.clone())?;
        Ok(Self::new(config, Box::new(model)))
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut ConversationHistory {
        &mut self.history
    }

    pub async fn ask(&mut self, text: &str) -> PipelineRun {
        let id = Uuid::new_v4();
        let span = info_span!("assistant", run_id = %id, model = %self.model.name());
        let run = self.run(id, text).instrument(span).await;
        self.history.record(&run.question.text, run.question.category, run.text());
        run
    }

    async fn run(&self, id: Uuid, text: &str) -> PipelineRun {
        let mut trace = Vec::new();
        let question = self.orchestrator.classify(text, &mut trace);

        if question.needs_clarification {
            trace.push(Stage::AskUser);
            let prompt = question.clarification_prompt();
            return PipelineRun {
                id,
                question,
                trace,
                terminal: Terminal::Clarification(prompt),
            };
        }

        let terminal = match self.consult(&question, &mut trace).await {
            Ok(text) => {
                trace.push(Stage::Done);
                Terminal::Answer(text)
            }
            Err(e) => {
                warn!("assistant failed: {}", e);
                trace.push(Stage::Failed);
                Terminal::Error(e.user_message())
            }
        };

        PipelineRun {
            id,
            question,
            trace,
            terminal,
        }
    }

    /// Resolve → Load → Aggregate on the blocking pool
    async fn gather(&self, question: &Question, trace: &mut Vec<Stage>) -> Result<Gathered, AgentError> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let question = question.clone();
        let span = Span::current();
        let (gathered, stages) = tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            let mut stages = Vec::new();
            let gathered = orchestrator.gather(&question, &mut stages);
            (gathered, stages)
        })
        .await
        .map_err(|e| AgentError::data_unavailable("loader", e.to_string()))?;

        trace.extend(stages);
        gathered
    }

    async fn load_blocking(&self, kind: DatasetKind) -> Result<Dataset, AgentError> {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::task::spawn_blocking(move || orchestrator.loader().load(kind))
            .await
            .map_err(|e| AgentError::data_unavailable(kind.to_string(), e.to_string()))?
    }

    async fn consult(&self, question: &Question, trace: &mut Vec<Stage>) -> Result<String, AgentError> {
        let mut gathered = self.gather(question, trace).await?;

        let result = match gathered.outcome {
            Ok(result) => result,
            Err(empty) => {
                trace.push(Stage::Format);
                return Ok(formatter::format(question, &Err(empty)));
            }
        };

        let context = self.history.context(self.history_context);
        trace.push(Stage::Consult);
        let first = self
            .model
            .analyze(&build_prompt(question, &result, None, &context))
            .await?;

        let (kind, request) = match first {
            ModelReply::Answer(narrative) => {
                trace.push(Stage::Format);
                return Ok(formatter::format_model_answer(question, &result, &narrative));
            }
            ModelReply::NeedsMoreData { breakdown, request } => {
                (breakdown.unwrap_or_else(|| default_breakdown(question.category)), request)
            }
        };

        // One extra aggregation, then one more model call
        info!("model asked for more data ({}): {}", kind, request);
        trace.push(Stage::Aggregate);
        if !gathered.datasets.contains_key(&kind.dataset()) {
            match self.load_blocking(kind.dataset()).await {
                Ok(ds) => {
                    gathered.datasets.insert(ds.kind, ds);
                }
                Err(e) => warn!("breakdown dataset unavailable: {}", e),
            }
        }

        let table = match breakdown(kind, question, &gathered.datasets) {
            Ok(table) => table,
            Err(e) => {
                warn!("breakdown {} failed: {}", kind, e);
                trace.push(Stage::Format);
                return Ok(formatter::format_result(question, &result));
            }
        };

        trace.push(Stage::Consult);
        let second = self
            .model
            .analyze(&build_prompt(question, &result, Some(&table), &context))
            .await?;

        trace.push(Stage::Format);
        Ok(match second {
            ModelReply::Answer(narrative) => formatter::format_model_answer(question, &result, &narrative),
            ModelReply::NeedsMoreData { .. } => {
                info!("model asked for more data twice, using computed report");
                formatter::format_with_breakdown(question, &result, &table)
            }
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Replays canned replies and records every prompt
    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<ModelReply, AgentError>>>,
        prompts: Arc<Mutex<Vec<ModelPrompt>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<ModelReply, AgentError>>) -> (Self, Arc<Mutex<Vec<ModelPrompt>>>) {
            let prompts = Arc::new(Mutex::new(Vec::new()));
            (
                ScriptedModel {
                    replies: Mutex::new(replies.into()),
                    prompts: prompts.clone(),
                },
                prompts,
            )
        }
    }

    #[async_trait]
    impl AnalysisModel for ScriptedModel {
        async fn analyze(&self, prompt: &ModelPrompt) -> Result<ModelReply, AgentError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::UpstreamService("script exhausted".into())))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    const INVOICES: &str = "Tipo,Cliente/Proveedor,Fecha de Emisión,Monto (MXN)\n\
                            Por pagar,ACME,2024-03-01,100\n\
                            Por pagar,Globex,2024-03-05,300\n\
                            Por pagar,ACME,2024-04-01,250\n";

    fn assistant(replies: Vec<Result<ModelReply, AgentError>>) -> (TempDir, ModelAssistant, Arc<Mutex<Vec<ModelPrompt>>>) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("facturas.csv"), INVOICES).unwrap();
        let (model, prompts) = ScriptedModel::new(replies);
        let assistant = ModelAssistant::new(AgentConfig::with_data_directory(dir.path()), Box::new(model));
        (dir, assistant, prompts)
    }

    fn count(trace: &[Stage], stage: Stage) -> usize {
        trace.iter().filter(|s| **s == stage).count()
    }

    #[test]
    fn test_parse_answer() {
        let reply = parse_reply(r#"{"status": "answer", "answer": "Todo bien"}"#).unwrap();
        assert_eq!(reply, ModelReply::Answer("Todo bien".to_string()));
    }

    #[test]
    fn test_parse_needs_more_data() {
        let reply = parse_reply(r#"{"status": "needs_more_data", "breakdown": "by_month", "request": "ver por mes"}"#).unwrap();
        assert_eq!(
            reply,
            ModelReply::NeedsMoreData {
                breakdown: Some(Breakdown::ByMonth),
                request: "ver por mes".to_string()
            }
        );
    }

    #[test]
    fn test_parse_garbage_is_invalid_reply() {
        let err = parse_reply("NEED_ANALYSIS: por proveedor").unwrap_err();
        assert!(matches!(err, AgentError::InvalidModelReply(_)));
        assert!(parse_reply(r#"{"status": "answer", "answer": "  "}"#).is_err());
    }

    #[test]
    fn test_default_breakdown_is_total() {
        for category in Category::ALL {
            let _ = default_breakdown(category);
        }
        assert_eq!(default_breakdown(Category::FixedExpenses), Breakdown::ByCategory);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::ZERO, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Attempt::Transient("HTTP 503".into()))
                } else {
                    Ok("listo")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "listo");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AgentError> = with_retries(3, Duration::ZERO, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Attempt::Fatal(AgentError::InvalidModelReply("bad".into()))) }
        })
        .await;
        assert!(matches!(result, Err(AgentError::InvalidModelReply(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_upstream_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AgentError> = with_retries(2, Duration::ZERO, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Attempt::Transient("timeout".into())) }
        })
        .await;
        assert!(matches!(result, Err(AgentError::UpstreamService(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_direct_answer() {
        let (_dir, mut assistant, prompts) = assistant(vec![Ok(ModelReply::Answer("- La más alta es Globex.".into()))]);
        let run = assistant.ask("¿Cuál es la factura por pagar más alta?").await;

        assert!(run.text().contains("La más alta es Globex."));
        assert!(run.text().contains("facturas.csv"));
        assert_eq!(count(&run.trace, Stage::Consult), 1);
        assert_eq!(prompts.lock().unwrap().len(), 1);
        assert_eq!(assistant.history().len(), 1);
    }

    #[tokio::test]
    async fn test_one_escalation_then_answer() {
        let (_dir, mut assistant, prompts) = assistant(vec![
            Ok(ModelReply::NeedsMoreData {
                breakdown: Some(Breakdown::ByCounterparty),
                request: "por proveedor".into(),
            }),
            Ok(ModelReply::Answer("ACME concentra más.".into())),
        ]);
        let run = assistant.ask("¿Cuál es la factura por pagar más alta?").await;

        assert!(run.text().contains("ACME concentra más."));
        assert_eq!(count(&run.trace, Stage::Aggregate), 2);
        assert_eq!(count(&run.trace, Stage::Consult), 2);
        let prompts = prompts.lock().unwrap();
        assert!(prompts[1].user.contains("Desglose adicional"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_breakdown_loads_dataset_outside_first_gather() {
        let (dir, mut assistant, prompts) = assistant(vec![
            Ok(ModelReply::NeedsMoreData {
                breakdown: Some(Breakdown::ByCategory),
                request: "por categoría de gasto".into(),
            }),
            Ok(ModelReply::Answer("La renta domina.".into())),
        ]);
        fs::write(dir.path().join("gastos_fijos.csv"), "Gasto Fijo,Monto (MXN)\nRenta,15000\nLuz,800\n").unwrap();

        let run = assistant.ask("¿Cuál es la factura por pagar más alta?").await;

        assert!(run.text().contains("La renta domina."));
        assert_eq!(count(&run.trace, Stage::Load), 1);
        assert_eq!(count(&run.trace, Stage::Aggregate), 2);
        let prompts = prompts.lock().unwrap();
        assert!(prompts[1].user.contains("Renta"));
        assert!(prompts[1].user.contains("gastos_fijos.csv"));
    }

    #[tokio::test]
    async fn test_escalation_is_bounded() {
        let more = || {
            Ok(ModelReply::NeedsMoreData {
                breakdown: None,
                request: "más".into(),
            })
        };
        let (_dir, mut assistant, prompts) = assistant(vec![more(), more(), more()]);
        let run = assistant.ask("¿Cuál es la factura por pagar más alta?").await;

        assert_eq!(prompts.lock().unwrap().len(), 2);
        assert!(matches!(run.terminal, Terminal::Answer(_)));
        assert!(run.text().contains("Desglose"));
        assert!(run.text().contains("$300.00 MXN"));
        assert_eq!(run.trace.last(), Some(&Stage::Done));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_user_message() {
        let (_dir, mut assistant, _) = assistant(vec![Err(AgentError::UpstreamService("HTTP 503".into()))]);
        let run = assistant.ask("¿Cuál es la factura por pagar más alta?").await;

        assert!(run.is_error());
        assert!(run.text().contains("no está disponible"));
        assert_eq!(run.trace.last(), Some(&Stage::Failed));
    }

    #[tokio::test]
    async fn test_clarification_skips_model() {
        let (_dir, mut assistant, prompts) = assistant(vec![]);
        let run = assistant.ask("hola").await;

        assert!(matches!(run.terminal, Terminal::Clarification(_)));
        assert!(prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_feeds_next_prompt_only() {
        let (_dir, mut assistant, prompts) = assistant(vec![
            Ok(ModelReply::Answer("primera".into())),
            Ok(ModelReply::Answer("segunda".into())),
        ]);
        let first = assistant.ask("¿Cuál es la factura por pagar más alta?").await;
        let second = assistant.ask("¿Qué proveedor tiene el mayor monto?").await;

        assert_eq!(first.question.category, Category::PayableMax);
        assert_eq!(second.question.category, Category::ByProviderMax);
        let prompts = prompts.lock().unwrap();
        assert!(!prompts[0].user.contains("Contexto de la conversación"));
        assert!(prompts[1].user.contains("¿Cuál es la factura por pagar más alta?"));
    }
}
