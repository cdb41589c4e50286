// Finance Agent - Command Line
// ask: one question, chat: interactive loop, sources: data directory report

use anyhow::Result;
use clap::{Parser, Subcommand};
use finance_agent::{AgentConfig, ConversationHistory, ModelAssistant, Orchestrator, PipelineRun};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const EXIT_WORDS: [&str; 4] = ["salir", "exit", "quit", "q"];
const DEFAULT_EXPORT: &str = "historial_conversacion.json";

#[derive(Parser)]
#[command(name = "finance-agent", version)]
#[command(about = "Preguntas en español sobre facturas, gastos fijos y estado de cuenta")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Data directory (overrides FINANCIAL_AGENT_DATA_DIR)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Ask the language model for the narrative (needs OPENAI_API_KEY)
    #[arg(long, global = true)]
    llm: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single question
    Ask {
        /// The question, e.g. "¿Cuál es la factura por pagar más alta?"
        #[arg(required = true)]
        question: Vec<String>,
    },
    /// Interactive session until salir/exit/quit/q
    Chat,
    /// List discovered data files
    Sources,
}

// ============================================================================
// ANSWERER
// ============================================================================

enum Answerer {
    Pipeline {
        orchestrator: Orchestrator,
        history: ConversationHistory,
    },
    Model(ModelAssistant),
}

impl Answerer {
    fn build(config: AgentConfig, use_llm: bool) -> Result<Self> {
        if use_llm {
            let assistant = ModelAssistant::openai(config).map_err(|e| anyhow::anyhow!(e.user_message()))?;
            return Ok(Answerer::Model(assistant));
        }
        let history = ConversationHistory::new(config.history_limit);
        Ok(Answerer::Pipeline {
            orchestrator: Orchestrator::new(config),
            history,
        })
    }

    async fn ask(&mut self, text: &str) -> PipelineRun {
        match self {
            Answerer::Pipeline { orchestrator, history } => {
                let run = orchestrator.answer(text);
                history.record(&run.question.text, run.question.category, run.text());
                run
            }
            Answerer::Model(assistant) => assistant.ask(text).await,
        }
    }

    fn history_mut(&mut self) -> &mut ConversationHistory {
        match self {
            Answerer::Pipeline { history, .. } => history,
            Answerer::Model(assistant) => assistant.history_mut(),
        }
    }
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_directory = dir;
    }

    let level = if cli.verbose { "debug".to_string() } else { config.log_level.clone() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = config.validate() {
        eprintln!("⚠️  {}", e.user_message());
    }
    debug!("data directory: {}", config.data_directory.display());

    match cli.command {
        Command::Ask { question } => {
            let mut answerer = Answerer::build(config, cli.llm)?;
            let run = answerer.ask(&question.join(" ")).await;
            println!("{}", run.text());
        }
        Command::Chat => {
            let answerer = Answerer::build(config, cli.llm)?;
            run_chat(answerer).await?;
        }
        Command::Sources => run_sources(&config)?,
    }

    Ok(())
}

async fn run_chat(mut answerer: Answerer) -> Result<()> {
    println!("💬 Asistente financiero");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Escribe tu pregunta. Comandos: historial, limpiar, exportar [archivo], salir\n");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("❓ ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else { break };
        let line = line?;
        let input = line.trim();

        if input.is_empty() {
            continue;
        }
        if EXIT_WORDS.contains(&input.to_lowercase().as_str()) {
            println!("👋 Hasta luego");
            break;
        }

        match input.to_lowercase().split_whitespace().next() {
            Some("historial") => {
                let history = answerer.history_mut();
                println!("📜 {} preguntas en memoria", history.len());
                for (category, count) in history.category_counts() {
                    println!("   {}: {}", category, count);
                }
                continue;
            }
            Some("limpiar") => {
                answerer.history_mut().clear();
                println!("✓ Historial borrado");
                continue;
            }
            Some("exportar") => {
                let path = input.split_whitespace().nth(1).unwrap_or(DEFAULT_EXPORT);
                match answerer.history_mut().export(std::path::Path::new(path)) {
                    Ok(()) => println!("✓ Historial exportado a {}", path),
                    Err(e) => eprintln!("❌ {:#}", e),
                }
                continue;
            }
            _ => {}
        }

        let run = answerer.ask(input).await;
        info!("run {} finished: {}", run.id, run.trace_line());
        println!("\n{}\n", run.text());
    }

    Ok(())
}

fn run_sources(config: &AgentConfig) -> Result<()> {
    let orchestrator = Orchestrator::new(config.clone());
    let overview = orchestrator
        .loader()
        .overview()
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    println!("📂 {}", orchestrator.loader().directory().display());
    if overview.is_empty() {
        println!("   (sin archivos reconocidos)");
    }
    for source in overview {
        match source.error {
            Some(err) => println!("❌ {} [{}]: {}", source.file_name, source.dataset, err),
            None => {
                println!(
                    "✓ {} [{}]: {} filas, {} columnas",
                    source.file_name,
                    source.dataset,
                    source.rows,
                    source.columns.len()
                );
                if !source.missing_roles.is_empty() {
                    let missing: Vec<String> = source.missing_roles.iter().map(|r| r.to_string()).collect();
                    println!("   ⚠️  sin columna para: {}", missing.join(", "));
                }
            }
        }
    }
    Ok(())
}
