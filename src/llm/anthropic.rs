//! Anthropic Messages API streaming backend.
//!
//! Streams `/v1/messages` with `stream: true` and maps each text delta to a
//! `text` event. Prior turns for a known continuity id are replayed from the
//! [`SessionStore`]; the finished exchange is written back only once the
//! upstream reports `message_stop`, so an abandoned stream persists nothing.

use futures::StreamExt;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::normalized::StreamEvent;
use crate::session::{Session, SessionStore, Turn};

use super::{EventStream, UpstreamBackend, UpstreamError, UpstreamRequest, missing_api_key};

/// Messages API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Direct token-streaming backend.
#[derive(Clone)]
pub struct DirectBackend {
    http: reqwest::Client,
    config: LlmConfig,
    sessions: SessionStore,
}

impl std::fmt::Debug for DirectBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBackend")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl DirectBackend {
    #[must_use]
    pub fn new(config: LlmConfig, sessions: SessionStore) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            sessions,
        }
    }

    /// Prior turns of `history` followed by the new user prompt.
    fn conversation(history: Option<Session>, prompt: &str) -> Vec<Turn> {
        let mut turns = history.map(Session::into_turns).unwrap_or_default();
        turns.push(Turn::user(prompt));
        turns
    }

    async fn send(
        &self,
        api_key: &str,
        system_prompt: &str,
        turns: &[Turn],
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "stream": true,
            "system": system_prompt,
            "messages": turns,
        });

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }
        Ok(resp)
    }
}

impl UpstreamBackend for DirectBackend {
    fn ensure_configured(&self) -> Result<(), UpstreamError> {
        self.config.api_key().map(|_| ()).ok_or_else(missing_api_key)
    }

    fn open(&self, req: UpstreamRequest) -> EventStream {
        let backend = self.clone();

        let out = async_stream::stream! {
            let Some(api_key) = backend.config.api_key().map(ToString::to_string) else {
                yield missing_api_key().into_event();
                return;
            };

            let history = req.session_id.as_deref().and_then(|id| backend.sessions.get(id));
            if let Some(session) = &history {
                debug!(
                    session_id = %session.id(),
                    created_at = %session.created_at().to_rfc3339(),
                    prior_turns = session.turn_count(),
                    "Resuming session"
                );
            }
            let turns = Self::conversation(history, &req.prompt);
            info!(
                name: "upstream.direct.request",
                model = %backend.config.model,
                messages = turns.len(),
                "Direct API call"
            );

            let resp = match backend.send(&api_key, &req.system_prompt, &turns).await {
                Ok(resp) => resp,
                Err(e) => {
                    error!(error = %e, kind = e.kind(), "Direct API request failed");
                    yield e.into_event();
                    return;
                }
            };

            let byte_stream = resp.bytes_stream();
            futures::pin_mut!(byte_stream);

            let mut frames = SseFrameBuffer::default();
            let mut full_content = String::new();
            let mut stopped = false;

            'read: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let e = UpstreamError::from(e);
                        error!(error = %e, "Direct API stream interrupted");
                        yield e.into_event();
                        return;
                    }
                };

                for data in frames.push(&chunk) {
                    match decode_event(&data) {
                        Ok(Some(MessageDelta::Text(text))) => {
                            full_content.push_str(&text);
                            yield StreamEvent::Text { content: text };
                        }
                        Ok(Some(MessageDelta::Stop)) => {
                            stopped = true;
                            break 'read;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, kind = e.kind(), "Direct API stream error");
                            yield e.into_event();
                            return;
                        }
                    }
                }
            }

            if !stopped {
                yield UpstreamError::Incomplete("message_stop").into_event();
                return;
            }

            let session_id = req
                .session_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            backend.sessions.put(
                &session_id,
                vec![Turn::user(req.prompt.as_str()), Turn::assistant(full_content.as_str())],
            );

            info!(
                name: "upstream.direct.complete",
                length = full_content.len(),
                session_id = %session_id,
                "Direct API complete"
            );
            yield StreamEvent::Complete {
                content: full_content,
                session_id: Some(session_id),
            };
        };

        Box::pin(out)
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// The parts of a Messages stream the relay cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MessageDelta {
    Text(String),
    Stop,
}

/// Decode one SSE `data:` payload from the Messages stream.
///
/// Returns `Ok(None)` for bookkeeping events (`message_start`, `ping`, ...).
pub(crate) fn decode_event(data: &str) -> Result<Option<MessageDelta>, UpstreamError> {
    let v: serde_json::Value = serde_json::from_str(data)?;

    match v.get("type").and_then(|t| t.as_str()).unwrap_or_default() {
        "content_block_delta" => {
            let delta = &v["delta"];
            if delta.get("type").and_then(|t| t.as_str()) != Some("text_delta") {
                return Ok(None);
            }
            Ok(delta
                .get("text")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(|t| MessageDelta::Text(t.to_string())))
        }
        "message_stop" => Ok(Some(MessageDelta::Stop)),
        "error" => {
            let err = &v["error"];
            Err(UpstreamError::Api {
                error_type: err
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("error")
                    .to_string(),
                message: err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Unknown error")
                    .to_string(),
            })
        }
        _ => Ok(None),
    }
}

/// Reassembles SSE frames from arbitrary byte chunks.
#[derive(Debug, Default)]
pub(crate) struct SseFrameBuffer {
    buf: Vec<u8>,
}

impl SseFrameBuffer {
    /// Feed a chunk; returns the `data:` payload of every completed frame.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(pos) = find_double_newline(&self.buf) {
            let frame = self.buf.drain(..pos + 2).collect::<Vec<_>>();
            let text = String::from_utf8_lossy(&frame);

            let data = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect::<Vec<_>>()
                .join("\n");

            if !data.is_empty() {
                payloads.push(data);
            }
        }
        payloads
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
