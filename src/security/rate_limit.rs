use crate::AppState;
use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; the client should retry after this long.
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Per-client trailing window limiter.
///
/// Each client keeps the timestamps of its admitted requests inside the
/// window. A check prunes expired timestamps, then either records the new
/// request or denies it; both happen under one lock so concurrent requests
/// from the same client cannot be admitted past the limit.
#[derive(Debug)]
pub struct WindowRateLimiter {
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
    limit: usize,
    window: Duration,
}

impl WindowRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self, client_id: &str) -> RateDecision {
        self.check_at(client_id, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, client_id: &str, now: Instant) -> RateDecision {
        let mut guard = self.lock();
        let stamps = guard.entry(client_id.to_string()).or_default();
        prune(stamps, now, self.window);

        if stamps.len() >= self.limit {
            return RateDecision::Denied {
                retry_after: self.window,
            };
        }

        stamps.push_back(now);
        RateDecision::Allowed
    }

    /// Forget clients with no request inside the window.
    ///
    /// Returns the number of clients removed.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
        before - guard.len()
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

/// Identify the caller: proxy headers first, then the peer address.
pub fn client_identifier(req: &Request) -> String {
    if let Some(id) = forwarded_client(req.headers()) {
        return id;
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let from_forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let from_real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    from_forwarded.or_else(from_real_ip).map(ToString::to_string)
}

fn describe_window(window: Duration) -> String {
    match window.as_secs() {
        60 => "minute".to_string(),
        3600 => "hour".to_string(),
        86_400 => "day".to_string(),
        secs => format!("{secs} seconds"),
    }
}

/// The 429 response sent when a client is over its limit.
pub fn rejection_response(limit: usize, window: Duration, retry_after: Duration) -> Response {
    let body = serde_json::json!({
        "error": format!(
            "Rate limit exceeded. Max {limit} questions per {}.",
            describe_window(window)
        )
    });

    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.as_secs().to_string())],
        Json(body),
    )
        .into_response()
}

/// Middleware to enforce per-client question limits
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.resilience.rate_limit_enabled {
        return next.run(req).await;
    }

    let client_id = client_identifier(&req);
    match state.rate_limiter.check(&client_id) {
        RateDecision::Allowed => next.run(req).await,
        RateDecision::Denied { retry_after } => {
            tracing::warn!(
                name: "rate_limit.denied",
                client = %client_id,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            rejection_response(
                state.rate_limiter.limit(),
                state.rate_limiter.window(),
                retry_after,
            )
        }
    }
}
