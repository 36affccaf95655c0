use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tracing::{info, warn};

use crate::AppState;
use crate::config::AppConfig;
use crate::prompt::SkillSet;
use crate::relay::{AskRequest, UploadedFile};
use crate::security::rate_limit::rate_limit_middleware;

/// Name reported by the health check.
pub const SERVICE_NAME: &str = "pdf-analysis-api";

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        backend = ?config.llm.backend,
        model = %config.llm.model,
        ocr = config.ocr.api_key().is_some(),
        "LLM configuration loaded"
    );

    let skills = SkillSet::load_from_dir(&config.skills.dir)
        .await
        .unwrap_or_else(|e| {
            warn!(dir = %config.skills.dir, error = %e, "Failed to read skills directory");
            SkillSet::new()
        });
    info!(name: "skills.loaded", skills = ?skills.names(), "Skills loaded");

    let state = AppState::new(config, skills.system_prompt());
    spawn_limiter_purge(&state);

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let max_sessions = state.sessions.capacity();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        max_sessions,
        "Server started"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

/// Routes, limits and layers for the HTTP surface.
pub fn build_router(state: AppState) -> Router {
    let ask = Router::new()
        .route("/pdf/ask", post(pdf_ask))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/ping", get(ping))
        .merge(ask)
        .layer(DefaultBodyLimit::max(state.config.server.body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Drop rate-limit entries for clients that went quiet, once per window.
fn spawn_limiter_purge(state: &AppState) {
    let limiter = std::sync::Arc::clone(&state.rate_limiter);
    let period = limiter.window().max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = limiter.purge_idle(Instant::now());
            if purged > 0 {
                tracing::debug!(purged, "Purged idle rate-limit entries");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /ping - Health check.
async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": SERVICE_NAME }))
}

/// POST /pdf/ask - Stream an answer about an optional uploaded document.
async fn pdf_ask(State(state): State<AppState>, multipart: Multipart) -> Response {
    let req = match parse_ask_form(multipart).await {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Rejected ask request");
            return e.into_response();
        }
    };

    let frames = state.relay().run(req).map(Ok::<String, Infallible>);
    build_sse_response(Body::from_stream(frames))
}

/// Problems with the inbound form.
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("question is required")]
    MissingQuestion,

    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
}

impl IntoResponse for FormError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::MissingQuestion => StatusCode::BAD_REQUEST,
            Self::Multipart(e) => e.status(),
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Read the ask form. Empty fields count as absent.
async fn parse_ask_form(mut multipart: Multipart) -> Result<AskRequest, FormError> {
    let mut question = None;
    let mut req = AskRequest::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                if !filename.is_empty() && !bytes.is_empty() {
                    req.file = Some(UploadedFile { filename, bytes });
                }
            }
            "question" => question = non_empty(field.text().await?),
            "session_id" => req.session_id = non_empty(field.text().await?),
            "sdk_session_id" => req.upstream_session_id = non_empty(field.text().await?),
            other => {
                tracing::debug!(field = %other, "Ignoring unknown form field");
            }
        }
    }

    req.question = question.ok_or(FormError::MissingQuestion)?;
    Ok(req)
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

fn build_sse_response(body: Body) -> Response {
    let mut resp = Response::new(body);
    let h = resp.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    resp
}
