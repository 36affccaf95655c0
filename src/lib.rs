//! PDF question-answering stream relay.
//!
//! Accepts a question plus an optional PDF upload, extracts the document text
//! (OCR first, local text layer as fallback), sends both to a hosted model and
//! relays the streamed answer back as server-sent events.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP surface with per-client rate limiting
//! - **Relay**: per-request state machine with a guaranteed `[DONE]` sentinel
//! - **Upstream**: direct Messages API streaming or a tool-augmented agent CLI
//!
//! # Modules
//!
//! - [`extraction`]: OCR and text-layer extraction
//! - [`llm`]: upstream backends behind one trait
//! - [`normalized`]: unified streaming event model
//! - [`relay`]: SSE relay state machine
//! - [`session`]: bounded conversation history

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod extraction;
pub mod llm;
pub mod normalized;
pub mod prompt;
pub mod relay;
pub mod security;
pub mod server;
pub mod session;
pub mod telemetry;

use crate::config::AppConfig;
use crate::extraction::DocumentExtractor;
use crate::llm::UpstreamBackend;
use crate::relay::Relay;
use crate::security::rate_limit::WindowRateLimiter;

use session::SessionStore;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Per-client question limiter.
    pub rate_limiter: Arc<WindowRateLimiter>,
    /// Conversation history for the direct backend.
    pub sessions: SessionStore,
    /// Document text extractor.
    pub extractor: Arc<DocumentExtractor>,
    /// The configured model backend.
    pub backend: Arc<dyn UpstreamBackend>,
    /// System prompt, skills included.
    pub system_prompt: Arc<str>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("backend", &self.backend.name())
            .field("sessions", &self.sessions.len())
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Build every store and adapter from configuration.
    pub fn new(config: AppConfig, system_prompt: impl Into<Arc<str>>) -> Self {
        let rate_limiter = Arc::new(WindowRateLimiter::new(
            config.resilience.rate_limit_max_requests,
            config.resilience.rate_limit_window(),
        ));
        let sessions = SessionStore::new(config.sessions.max_sessions);
        let extractor = Arc::new(DocumentExtractor::from_config(&config.ocr));
        let backend = llm::build_backend(&config.llm, sessions.clone());

        Self {
            config: Arc::new(config),
            rate_limiter,
            sessions,
            extractor,
            backend,
            system_prompt: system_prompt.into(),
        }
    }

    /// A relay for one request.
    pub fn relay(&self) -> Relay {
        Relay::new(
            Arc::clone(&self.extractor),
            Arc::clone(&self.backend),
            Arc::clone(&self.system_prompt),
        )
        .with_upstream_timeout(self.config.llm.upstream_timeout())
    }
}
