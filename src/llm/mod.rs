//! Upstream model backends.
//!
//! This module adapts the hosted model into a lazy sequence of
//! [`StreamEvent`]s. Two interchangeable backends sit behind the
//! [`UpstreamBackend`] trait; which one runs is a deployment-time choice.
//!
//! # Backends
//!
//! - [`DirectBackend`]: Anthropic Messages API token streaming (`/v1/messages`),
//!   with conversation continuity kept in the [`SessionStore`]
//! - [`AgentBackend`]: tool-augmented agent CLI (`stream-json` output), whose
//!   session is owned and resumed by the agent itself
//!
//! # Contract
//!
//! Every sequence returned by [`UpstreamBackend::open`] is finite and ends
//! with exactly one `complete` or `error` event. Failures never escape as
//! panics or `Err`s; they become that final `error` event.

pub mod agent;
pub mod anthropic;

pub use agent::AgentBackend;
pub use anthropic::DirectBackend;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;

use crate::config::{BackendKind, LlmConfig};
use crate::normalized::StreamEvent;
use crate::session::SessionStore;

/// Lazy, non-restartable sequence of normalized events.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Request to an upstream backend.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    /// Final user prompt (question plus any document context).
    pub prompt: String,
    /// System prompt for the model.
    pub system_prompt: String,
    /// Continuity id indexing the session store (direct backend).
    pub session_id: Option<String>,
    /// Opaque session id owned by the agent backend.
    pub upstream_session_id: Option<String>,
}

/// Failures talking to the model backend.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Required credentials or settings are missing.
    #[error("{0}")]
    Configuration(String),

    /// Connection-level failure.
    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Error reported inside the upstream stream.
    #[error("{error_type}: {message}")]
    Api { error_type: String, message: String },

    /// Payload that could not be decoded.
    #[error("{0}")]
    Decode(#[from] serde_json::Error),

    /// The agent process could not be run or exited abnormally.
    #[error("{0}")]
    Process(String),

    /// The stream ended before its completion marker.
    #[error("stream ended before {0}")]
    Incomplete(&'static str),

    /// No upstream event arrived within the deadline.
    #[error("no upstream event within {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Stable name of the failure class, used as the error frame prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Transport(_) => "TransportError",
            Self::Status { .. } => "StatusError",
            Self::Api { .. } => "ApiError",
            Self::Decode(_) => "DecodeError",
            Self::Process(_) => "ProcessError",
            Self::Incomplete(_) => "IncompleteStream",
            Self::Timeout(_) => "UpstreamTimeout",
        }
    }

    /// Convert into the terminal `error` event.
    ///
    /// Configuration failures carry their bare message; every other failure
    /// is prefixed with its kind.
    pub fn into_event(self) -> StreamEvent {
        match self {
            Self::Configuration(message) => StreamEvent::error(message),
            other => StreamEvent::error(format!("{}: {}", other.kind(), other)),
        }
    }
}

/// A model backend producing normalized event streams.
pub trait UpstreamBackend: Send + Sync + std::fmt::Debug {
    /// Fail fast when credentials are missing.
    fn ensure_configured(&self) -> Result<(), UpstreamError>;

    /// Start a streaming answer. Nothing happens until the stream is polled.
    fn open(&self, req: UpstreamRequest) -> EventStream;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// Build the configured backend.
pub fn build_backend(config: &LlmConfig, sessions: SessionStore) -> Arc<dyn UpstreamBackend> {
    match config.backend {
        BackendKind::Direct => Arc::new(DirectBackend::new(config.clone(), sessions)),
        BackendKind::Agent => Arc::new(AgentBackend::new(config.clone())),
    }
}

pub(crate) fn missing_api_key() -> UpstreamError {
    UpstreamError::Configuration("ANTHROPIC_API_KEY not configured".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_event_text() {
        let event = missing_api_key().into_event();
        assert_eq!(event, StreamEvent::error("ANTHROPIC_API_KEY not configured"));

        let api = UpstreamError::Api {
            error_type: "overloaded_error".to_string(),
            message: "Overloaded".to_string(),
        };
        assert_eq!(
            api.into_event(),
            StreamEvent::error("ApiError: overloaded_error: Overloaded")
        );
    }
}
