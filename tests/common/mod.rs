#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use pdf_ask::AppState;
use pdf_ask::config::{AppConfig, BackendKind};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// What the mock Messages endpoint answers with.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Stream these text deltas, then `message_stop` unless `truncated`.
    Deltas { parts: Vec<String>, truncated: bool },
    /// Fail with a status and body.
    Status(u16, String),
}

/// A recorded request to the mock.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub api_key: Option<String>,
    pub version: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct MockState {
    reply: MockReply,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

pub struct MockUpstream {
    pub base_url: String,
    pub seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl MockUpstream {
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

/// Spawn a local stand-in for the Messages API.
pub async fn spawn_mock_upstream(reply: MockReply) -> MockUpstream {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        reply,
        seen: Arc::clone(&seen),
    };

    let app = Router::new()
        .route("/v1/messages", post(mock_messages))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockUpstream {
        base_url: format!("http://{addr}"),
        seen,
    }
}

async fn mock_messages(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    state.seen.lock().unwrap().push(SeenRequest {
        api_key: header_str("x-api-key"),
        version: header_str("anthropic-version"),
        body,
    });

    match state.reply {
        MockReply::Status(status, body) => (
            StatusCode::from_u16(status).unwrap(),
            body,
        )
            .into_response(),
        MockReply::Deltas { parts, truncated } => {
            let mut out = String::from(
                "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
            );
            for part in parts {
                let delta = serde_json::json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": part },
                });
                out.push_str(&format!("event: content_block_delta\ndata: {delta}\n\n"));
            }
            if !truncated {
                out.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
            }
            ([(header::CONTENT_TYPE, "text/event-stream")], out).into_response()
        }
    }
}

/// Defaults with a direct backend pointed at `base_url` and no OCR.
pub fn test_config(base_url: &str) -> AppConfig {
    let mut config = AppConfig::load_from_args(["pdf-ask"]).unwrap();
    config.llm.backend = BackendKind::Direct;
    config.llm.base_url = base_url.to_string();
    config.llm.api_key = Some("test-key".to_string());
    config.llm.upstream_timeout_secs = 10;
    config.ocr.api_key = None;
    config.resilience.rate_limit_enabled = true;
    config.resilience.rate_limit_max_requests = 10;
    config.resilience.rate_limit_window_secs = 3600;
    config
}

pub fn test_state(config: AppConfig) -> AppState {
    AppState::new(config, "You analyze PDFs.")
}

/// JSON payloads of an SSE body, plus whether it ended with `[DONE]`.
pub fn parse_frames(body: &str) -> (Vec<Value>, bool) {
    let mut events = Vec::new();
    let mut done = false;
    for frame in body.split("\n\n").filter(|f| !f.is_empty()) {
        let data = frame.strip_prefix("data: ").unwrap();
        if data == "[DONE]" {
            done = true;
        } else {
            assert!(!done, "frame after [DONE]: {data}");
            events.push(serde_json::from_str(data).unwrap());
        }
    }
    (events, done)
}
