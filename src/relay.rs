//! SSE relay for a single question.
//!
//! Drives one request through `Idle -> Extracting -> Prompting -> Streaming ->
//! Done` and renders every step as a wire frame. The run always ends with
//! exactly one `complete` or `error` frame followed by [`DONE_FRAME`], on every
//! path including a panic in any earlier step.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::extraction::{DocumentExtractor, is_pdf};
use crate::llm::{UpstreamBackend, UpstreamError, UpstreamRequest};
use crate::normalized::{DONE_FRAME, StreamEvent, sse_frame};
use crate::prompt::compose_prompt;

pub const STATUS_PROCESSING: &str = "Processing PDF...";
pub const STATUS_OCR: &str = "Running OCR with Gemini Flash...";
pub const STATUS_ANALYZING: &str = "Analyzing document...";

/// An uploaded document.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Bytes,
}

/// One question, as received from the client.
#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub question: String,
    pub file: Option<UploadedFile>,
    /// Continuity id for the session store.
    pub session_id: Option<String>,
    /// Upstream-owned session id to resume.
    pub upstream_session_id: Option<String>,
}

/// Per-request relay between the extractor, the backend and the client.
#[derive(Clone)]
pub struct Relay {
    extractor: Arc<DocumentExtractor>,
    backend: Arc<dyn UpstreamBackend>,
    system_prompt: Arc<str>,
    upstream_timeout: Option<Duration>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("backend", &self.backend.name())
            .field("ocr", &self.extractor.has_ocr())
            .field("upstream_timeout", &self.upstream_timeout)
            .finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(
        extractor: Arc<DocumentExtractor>,
        backend: Arc<dyn UpstreamBackend>,
        system_prompt: Arc<str>,
    ) -> Self {
        Self {
            extractor,
            backend,
            system_prompt,
            upstream_timeout: None,
        }
    }

    /// Fail the run when no upstream event arrives within `timeout`.
    #[must_use]
    pub fn with_upstream_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Wire frames for one question, ending with [`DONE_FRAME`].
    pub fn run(self, req: AskRequest) -> impl Stream<Item = String> + Send + 'static {
        let events = AssertUnwindSafe(self.events(req)).catch_unwind();

        async_stream::stream! {
            futures::pin_mut!(events);
            let mut terminal_sent = false;

            while let Some(next) = events.next().await {
                match next {
                    Ok(event) => {
                        terminal_sent = event.is_terminal();
                        yield sse_frame(&event);
                        if terminal_sent {
                            break;
                        }
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(name: "relay.panic", panic = %message, "Relay panicked");
                        yield sse_frame(&StreamEvent::error(format!("InternalError: {message}")));
                        terminal_sent = true;
                        break;
                    }
                }
            }

            if !terminal_sent {
                warn!(name: "relay.incomplete", "Upstream ended without a result");
                yield sse_frame(&UpstreamError::Incomplete("a result").into_event());
            }

            yield DONE_FRAME.to_string();
        }
    }

    /// The state machine proper. May end without a terminal event or panic;
    /// [`Relay::run`] closes both gaps.
    fn events(self, req: AskRequest) -> impl Stream<Item = StreamEvent> + Send + 'static {
        async_stream::stream! {
            info!(
                name: "relay.started",
                backend = self.backend.name(),
                question = %truncate(&req.question, 100),
                has_file = req.file.is_some(),
                session_id = ?req.session_id,
                "PDF ask request"
            );

            yield StreamEvent::status(STATUS_PROCESSING);

            if let Err(e) = self.backend.ensure_configured() {
                error!(error = %e, "Backend not configured");
                yield e.into_event();
                return;
            }

            // Extracting
            let mut document_text = String::new();
            if let Some(file) = &req.file {
                if self.extractor.has_ocr() && is_pdf(&file.filename) {
                    yield StreamEvent::status(STATUS_OCR);
                }
                match self.extractor.extract(&file.bytes, &file.filename).await {
                    Ok(text) => {
                        info!(
                            name: "relay.extracted",
                            filename = %file.filename,
                            chars = text.len(),
                            "Document text extracted"
                        );
                        document_text = text;
                    }
                    Err(e) => {
                        warn!(filename = %file.filename, error = %e, "Extraction failed");
                        yield StreamEvent::error(e.to_string());
                        return;
                    }
                }
            }

            // Prompting
            let upstream = UpstreamRequest {
                prompt: compose_prompt(&document_text, &req.question),
                system_prompt: self.system_prompt.to_string(),
                session_id: req.session_id.clone(),
                upstream_session_id: req.upstream_session_id.clone(),
            };
            yield StreamEvent::status(STATUS_ANALYZING);

            // Streaming
            let mut adapter = self.backend.open(upstream);
            let mut streamed = String::new();

            loop {
                let next = match self.upstream_timeout {
                    Some(limit) => match tokio::time::timeout(limit, adapter.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(name: "relay.timeout", timeout = ?limit, "Upstream idle timeout");
                            yield UpstreamError::Timeout(limit).into_event();
                            return;
                        }
                    },
                    None => adapter.next().await,
                };
                let Some(event) = next else {
                    return;
                };

                match event {
                    StreamEvent::Text { content } => {
                        streamed.push_str(&content);
                        yield StreamEvent::Text { content };
                    }
                    StreamEvent::Complete { content, session_id } => {
                        let content = if content.is_empty() { std::mem::take(&mut streamed) } else { content };
                        info!(
                            name: "relay.completed",
                            length = content.len(),
                            session_id = ?session_id,
                            "Answer complete"
                        );
                        yield StreamEvent::Complete { content, session_id };
                        return;
                    }
                    StreamEvent::Error { error } => {
                        error!(name: "relay.upstream_error", error = %error, "Upstream error");
                        yield StreamEvent::Error { error };
                        return;
                    }
                    other => {
                        tracing::debug!(kind = other.kind(), "Upstream event");
                        yield other;
                    }
                }
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "relay panicked".to_string()
    }
}
