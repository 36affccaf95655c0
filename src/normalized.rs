//! Normalized event types for streaming answers.
//!
//! Both upstream backends (direct Messages API streaming and the
//! tool-augmented agent) emit very different event shapes. They are folded
//! into the closed [`StreamEvent`] set at the adapter boundary so the relay
//! and the client only ever see one vocabulary.
//!
//! # Wire format
//!
//! Every event is written as a single `data:` line holding the JSON object,
//! followed by a blank line. The stream always ends with the literal
//! [`DONE_FRAME`].
//!
//! ```rust
//! use pdf_ask::normalized::{StreamEvent, sse_frame};
//!
//! let frame = sse_frame(&StreamEvent::text("Hello"));
//! assert_eq!(frame, "data: {\"type\":\"text\",\"content\":\"Hello\"}\n\n");
//! ```

use serde::{Deserialize, Serialize};

/// Terminal sentinel frame sent at the end of every relay run.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Normalized streaming events shared by the upstream adapters and the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Progress message for the client (extraction, analysis, ...).
    Status {
        /// Human-readable progress message.
        message: String,
    },

    /// Model reasoning trace fragment (agent backend only).
    Thinking {
        /// The reasoning fragment.
        content: String,
    },

    /// Incremental answer text.
    Text {
        /// The text fragment to append.
        content: String,
    },

    /// The agent invoked a tool.
    ToolCall {
        /// Tool name as reported upstream.
        tool_name: String,
        /// Tool input serialized as JSON text.
        tool_input: String,
    },

    /// The answer is finished.
    Complete {
        /// Full accumulated answer text.
        content: String,
        /// Session identifier to send back for a follow-up question.
        session_id: Option<String>,
    },

    /// The run failed. Terminal.
    Error {
        /// Error description, `"<Kind>: <message>"` for upstream failures.
        error: String,
    },
}

impl StreamEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Whether this event ends a run (`complete` or `error`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// The wire `type` tag of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Thinking { .. } => "thinking",
            Self::Text { .. } => "text",
            Self::ToolCall { .. } => "tool_call",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Serialize a [`StreamEvent`] as one SSE `data:` frame.
pub fn sse_frame(evt: &StreamEvent) -> String {
    let json = serde_json::to_string(evt).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "error": e.to_string() }).to_string()
    });

    format!("data: {json}\n\n")
}
