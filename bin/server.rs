// Finance Agent - Web Server
// REST API with Axum over the deterministic pipeline

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use finance_agent::{AgentConfig, Orchestrator, SourceOverview, Stage, Terminal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    fn failed(data: T, error: String) -> Self {
        Self {
            success: false,
            data,
            error: Some(error),
        }
    }
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

#[derive(Serialize)]
struct AskResponse {
    run_id: String,
    category: String,
    terminal: Terminal,
    trace: Vec<Stage>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/ask - Answer one question
async fn ask(State(state): State<AppState>, Json(request): Json<AskRequest>) -> impl IntoResponse {
    if request.question.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::failed(None::<AskResponse>, "question is empty".to_string())),
        )
            .into_response();
    }

    // Loading reads files; keep it off the async workers
    let orchestrator = state.orchestrator.clone();
    let question = request.question;
    match tokio::task::spawn_blocking(move || orchestrator.answer(&question)).await {
        Ok(run) => {
            let response = AskResponse {
                run_id: run.id.to_string(),
                category: run.question.category.to_string(),
                trace: run.trace,
                terminal: run.terminal,
            };
            (StatusCode::OK, Json(ApiResponse::ok(Some(response)))).into_response()
        }
        Err(e) => {
            error!("pipeline task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::failed(None::<AskResponse>, "internal error".to_string())),
            )
                .into_response()
        }
    }
}

/// GET /api/sources - Discovered data files
async fn get_sources(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = state.orchestrator.clone();
    let overview = tokio::task::spawn_blocking(move || orchestrator.loader().overview()).await;

    match overview {
        Ok(Ok(sources)) => (StatusCode::OK, Json(ApiResponse::ok(sources))).into_response(),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::failed(Vec::<SourceOverview>::new(), e.user_message())),
        )
            .into_response(),
        Err(e) => {
            error!("sources task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::failed(Vec::<SourceOverview>::new(), "internal error".to_string())),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    println!("🌐 Finance Agent - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if let Err(e) = config.validate() {
        eprintln!("⚠️  {}", e.user_message());
    }
    info!("data directory: {}", config.data_directory.display());

    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(config)),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ask", post(ask))
        .route("/sources", get(get_sources))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("FINANCIAL_AGENT_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n🚀 Server running on http://{}", addr);
    println!("   POST /api/ask     {{\"question\": \"...\"}}");
    println!("   GET  /api/sources");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::Response;
    use std::fs;
    use tempfile::TempDir;

    fn state_with(files: &[(&str, &str)]) -> (TempDir, AppState) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let state = AppState {
            orchestrator: Arc::new(Orchestrator::new(AgentConfig::with_data_directory(dir.path()))),
        };
        (dir, state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const INVOICES: &str = "Tipo,Cliente/Proveedor,Fecha de Emisión,Monto (MXN)\n\
                            Por pagar,ACME,2024-03-01,100\n\
                            Por pagar,Globex,2024-03-05,300\n";

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"], "OK");
    }

    #[tokio::test]
    async fn test_ask_rejects_blank_question() {
        let (_dir, state) = state_with(&[]);
        let request = AskRequest { question: "   ".to_string() };
        let response = ask(State(state), Json(request)).await.into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["data"].is_null());
        assert_eq!(json["error"], "question is empty");
    }

    #[tokio::test]
    async fn test_ask_returns_run() {
        let (_dir, state) = state_with(&[("facturas.csv", INVOICES)]);
        let request = AskRequest {
            question: "¿Cuál es la factura por pagar más alta?".to_string(),
        };
        let response = ask(State(state), Json(request)).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["category"], "payable_max");
        assert_eq!(json["data"]["terminal"]["kind"], "answer");
        assert!(json["data"]["terminal"]["text"].as_str().unwrap().contains("$300.00 MXN"));
        assert_eq!(json["data"]["trace"].as_array().unwrap().last().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_sources_missing_directory_is_unavailable() {
        let state = AppState {
            orchestrator: Arc::new(Orchestrator::new(AgentConfig::with_data_directory("/no/such/data/dir"))),
        };
        let response = get_sources(State(state)).await.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_sources_lists_files() {
        let (_dir, state) = state_with(&[("facturas.csv", INVOICES)]);
        let response = get_sources(State(state)).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"][0]["file_name"], "facturas.csv");
        assert_eq!(json["data"][0]["rows"], 2);
    }
}
