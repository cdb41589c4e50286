// 🔀 Orchestrator
// Classify → (AskUser) → Resolve → Load → Aggregate → Format → Done.
// Any stage error moves the run to Failed with a plain-text message.

use crate::aggregation::{aggregate, AggregationResult};
use crate::classifier::QuestionClassifier;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::formatter;
use crate::loader::{DataLoader, DatasetMap};
use crate::question::Question;
use crate::resolver::{is_best_effort, resolve};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// RUN STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    AskUser,
    Resolve,
    Load,
    Aggregate,
    /// Model call (assistant runs only)
    Consult,
    Format,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Classify => "classify",
            Stage::AskUser => "ask_user",
            Stage::Resolve => "resolve",
            Stage::Load => "load",
            Stage::Aggregate => "aggregate",
            Stage::Consult => "consult",
            Stage::Format => "format",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Terminal {
    Answer(String),
    Clarification(String),
    Error(String),
}

/// One question's trip through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub question: Question,
    pub trace: Vec<Stage>,
    pub terminal: Terminal,
}

impl PipelineRun {
    pub fn text(&self) -> &str {
        match &self.terminal {
            Terminal::Answer(t) | Terminal::Clarification(t) | Terminal::Error(t) => t,
        }
    }

    pub fn visited(&self, stage: Stage) -> bool {
        self.trace.contains(&stage)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.terminal, Terminal::Error(_))
    }

    pub fn trace_line(&self) -> String {
        self.trace
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

/// State after Aggregate: the loaded datasets plus the aggregation outcome.
/// `outcome` only ever holds `EmptyResult` as an error.
pub struct Gathered {
    pub datasets: DatasetMap,
    pub outcome: Result<AggregationResult, AgentError>,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator {
    classifier: QuestionClassifier,
    loader: DataLoader,
}

impl Orchestrator {
    pub fn new(config: AgentConfig) -> Self {
        let loader = DataLoader::new(&config);
        Orchestrator {
            classifier: QuestionClassifier::new(),
            loader,
        }
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    pub fn classify(&self, text: &str, trace: &mut Vec<Stage>) -> Question {
        trace.push(Stage::Classify);
        let question = self.classifier.classify(text);
        debug!(
            "classified as {} (rule {}, month {:?}, direction {:?})",
            question.category, question.rule_id, question.month, question.direction
        );
        question
    }

    /// Resolve → Load → Aggregate
    pub fn gather(&self, question: &Question, trace: &mut Vec<Stage>) -> Result<Gathered, AgentError> {
        trace.push(Stage::Resolve);
        let kinds = resolve(question.category);
        debug!("resolved {} → {:?}", question.category, kinds);

        trace.push(Stage::Load);
        let datasets = if is_best_effort(question.category) {
            self.loader.load_available(&kinds)?
        } else {
            self.loader.load_all(&kinds)?
        };

        trace.push(Stage::Aggregate);
        let outcome = match aggregate(question, &datasets) {
            Ok(result) => Ok(result),
            Err(e) if e.is_empty_result() => {
                info!("empty result: {}", e);
                Err(e)
            }
            Err(e) => return Err(e),
        };

        Ok(Gathered { datasets, outcome })
    }

    /// Run the deterministic pipeline for one question
    pub fn answer(&self, text: &str) -> PipelineRun {
        let id = Uuid::new_v4();
        let span = info_span!("pipeline", run_id = %id);
        let _guard = span.enter();

        let mut trace = Vec::new();
        let question = self.classify(text, &mut trace);

        if question.needs_clarification {
            trace.push(Stage::AskUser);
            info!("asking for clarification");
            let prompt = question.clarification_prompt();
            return PipelineRun {
                id,
                question,
                trace,
                terminal: Terminal::Clarification(prompt),
            };
        }

        let terminal = match self.gather(&question, &mut trace) {
            Ok(gathered) => {
                trace.push(Stage::Format);
                let text = formatter::format(&question, &gathered.outcome);
                trace.push(Stage::Done);
                Terminal::Answer(text)
            }
            Err(e) => {
                warn!("pipeline failed: {}", e);
                trace.push(Stage::Failed);
                Terminal::Error(e.user_message())
            }
        };

        let run = PipelineRun {
            id,
            question,
            trace,
            terminal,
        };
        info!("finished: {}", run.trace_line());
        run
    }
}

// ============================================================================
// TESTS
// ============================================================================
