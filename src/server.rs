//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/health` | Liveness plus configured environment |
//! | `POST` | `/api/ask` | Answer text only |
//! | `POST` | `/api/ask/detailed` | Answer with confidence, citations and guardrails |
//! | `POST` | `/api/refresh` | Refetch the corpus and rebuild the indices |
//! | `GET`  | `/api/insights` | Data-quality highlights and anomalies |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `timeout` (408), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::insights::{generate_insights, write_report};
use crate::models::{AnswerResult, ChatTurn, Citation, Guardrails};
use crate::qa::QaService;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    qa: Arc<QaService>,
}

impl AppState {
    pub fn new(config: Config, qa: Arc<QaService>) -> Self {
        Self {
            config: Arc::new(config),
            qa,
        }
    }
}

/// The API router with CORS applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/ask", post(handle_ask))
        .route("/api/ask/detailed", post(handle_ask_detailed))
        .route("/api/refresh", post(handle_refresh))
        .route("/api/insights", get(handle_insights))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` using the shared [`QaService`].
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let qa = crate::services::shared_services(config)?;
    let bind_addr = config.server.bind.clone();
    let app = router(AppState::new(config.clone(), qa));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, environment = %config.server.environment, "server.listening");
    println!("Listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::REQUEST_TIMEOUT,
        code: "timeout",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = format!("{:#}", err), "api.internal_error");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

// ============ GET /api/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    environment: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        environment: state.config.server.environment.clone(),
    })
}

// ============ POST /api/ask, /api/ask/detailed ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Serialize)]
struct AskResponse {
    answer: String,
}

#[derive(Serialize)]
struct DetailedAskResponse {
    answer: String,
    confidence: f64,
    reasoning: String,
    citations: Vec<Citation>,
    guardrails: Guardrails,
}

fn ask_body(body: Result<Json<AskRequest>, JsonRejection>) -> Result<AskRequest, AppError> {
    body.map(|Json(req)| req)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

async fn answer(state: &AppState, req: AskRequest) -> Result<AnswerResult, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let limit = Duration::from_secs(state.config.server.request_timeout_secs);
    tokio::time::timeout(
        limit,
        state.qa.ask(&req.question, &req.history, req.force_refresh),
    )
    .await
    .map_err(|_| timeout_error(format!("ask timed out after {}s", limit.as_secs())))?
    .map_err(internal)
}

async fn handle_ask(
    State(state): State<AppState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    let result = answer(&state, ask_body(body)?).await?;
    Ok(Json(AskResponse {
        answer: result.answer,
    }))
}

async fn handle_ask_detailed(
    State(state): State<AppState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<DetailedAskResponse>, AppError> {
    let result = answer(&state, ask_body(body)?).await?;
    Ok(Json(DetailedAskResponse {
        answer: result.answer,
        confidence: result.confidence,
        reasoning: result.reasoning,
        citations: result.citations,
        guardrails: result.guardrails,
    }))
}

// ============ POST /api/refresh ============

#[derive(Serialize)]
struct RefreshResponse {
    message: String,
    documents_indexed: usize,
}

async fn handle_refresh(State(state): State<AppState>) -> Result<Json<RefreshResponse>, AppError> {
    let snapshot = state.qa.index().ensure_ready(true).await.map_err(internal)?;
    tracing::info!(documents = snapshot.len(), generation = snapshot.generation, "api.refreshed");
    Ok(Json(RefreshResponse {
        message: "Index refreshed".to_string(),
        documents_indexed: snapshot.len(),
    }))
}

// ============ GET /api/insights ============

#[derive(Serialize)]
struct InsightsResponse {
    highlights: Vec<String>,
    anomalies: Vec<String>,
    generated_at: DateTime<Utc>,
}

async fn handle_insights(
    State(state): State<AppState>,
) -> Result<Json<InsightsResponse>, AppError> {
    let snapshot = state.qa.index().ensure_ready(false).await.map_err(internal)?;
    let report = generate_insights(&snapshot.corpus, Utc::now());
    if let Err(e) = write_report(&report, &state.config.storage.reports_dir) {
        tracing::warn!(error = %e, "api.insights_report_failed");
    }
    Ok(Json(InsightsResponse {
        highlights: report.highlights,
        anomalies: report.anomalies,
        generated_at: report.generated_at,
    }))
}
