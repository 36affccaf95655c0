//! Agent CLI backend.
//!
//! Runs the agent command in print mode with `stream-json` output and
//! normalizes each stdout line. The prompt goes in over stdin, so document
//! size is not bounded by argv limits. The child is killed when the stream
//! is dropped.
//!
//! ```text
//! {"type":"system","subtype":"init","session_id":"..."}
//! {"type":"assistant","message":{"content":[{"type":"text","text":"..."}]}}
//! {"type":"result","is_error":false,"result":"...","session_id":"..."}
//! ```

use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::LlmConfig;
use crate::normalized::StreamEvent;

use super::{EventStream, UpstreamBackend, UpstreamError, UpstreamRequest, missing_api_key};

/// Tools the agent may use while answering.
pub const ALLOWED_TOOLS: &[&str] = &["WebSearch", "WebFetch", "Read", "Glob", "Grep"];

/// Tool-augmented agent backend.
#[derive(Clone)]
pub struct AgentBackend {
    config: LlmConfig,
}

impl std::fmt::Debug for AgentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBackend")
            .field("command", &self.config.agent_command)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

impl AgentBackend {
    #[must_use]
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    /// Arguments for one print-mode run.
    fn args(&self, req: &UpstreamRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            self.config.model.clone(),
            "--system-prompt".to_string(),
            req.system_prompt.clone(),
            "--allowedTools".to_string(),
            ALLOWED_TOOLS.join(","),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];
        if let Some(id) = req.upstream_session_id.as_deref().filter(|s| !s.is_empty()) {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args
    }
}

impl UpstreamBackend for AgentBackend {
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

            info!(
                name: "upstream.agent.request",
                command = %backend.config.agent_command,
                model = %backend.config.model,
                resume = req.upstream_session_id.is_some(),
                "Agent run"
            );

            let spawned = Command::new(&backend.config.agent_command)
                .args(backend.args(&req))
                .env("ANTHROPIC_API_KEY", &api_key)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    error!(error = %e, "Failed to start agent");
                    yield UpstreamError::Process(format!(
                        "failed to start {}: {e}",
                        backend.config.agent_command
                    ))
                    .into_event();
                    return;
                }
            };

            let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
                (child.stdin.take(), child.stdout.take(), child.stderr.take())
            else {
                yield UpstreamError::Process("agent stdio unavailable".to_string()).into_event();
                return;
            };

            let prompt = req.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(error = %e, "Failed to write prompt to agent");
                }
                // stdin closes on drop
            });

            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });

            let mut lines = BufReader::new(stdout).lines();
            let mut normalizer = AgentNormalizer::default();

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield UpstreamError::Process(format!("reading agent output: {e}")).into_event();
                        return;
                    }
                };

                let line = line.trim();
                if !line.starts_with('{') {
                    continue;
                }

                let parsed = match serde_json::from_str::<AgentLine>(line) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        error!(error = %e, "Undecodable agent line");
                        yield UpstreamError::from(e).into_event();
                        return;
                    }
                };

                for event in normalizer.handle(parsed) {
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }
            }

            let status = child.wait().await;
            let stderr_text = stderr_task.await.unwrap_or_default();

            match status {
                Ok(status) if status.success() => {
                    debug!("Agent exited without a result line");
                    yield normalizer.finish();
                }
                Ok(status) => {
                    let detail = stderr_text.trim();
                    error!(%status, stderr = %detail, "Agent exited with failure");
                    yield UpstreamError::Process(if detail.is_empty() {
                        format!("agent exited with {status}")
                    } else {
                        format!("agent exited with {status}: {detail}")
                    })
                    .into_event();
                }
                Err(e) => {
                    yield UpstreamError::Process(format!("waiting for agent: {e}")).into_event();
                }
            }
        };

        Box::pin(out)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// One line of `stream-json` output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum AgentLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: AgentMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Error {
        #[serde(default)]
        error: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AgentMessage {
    #[serde(default)]
    content: MessageContent,
}

/// Message content is usually a block list; a bare string is one text block.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

impl MessageContent {
    fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            Self::Blocks(blocks) => blocks,
            Self::Text(text) => vec![ContentBlock::Text { text }],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Folds agent lines into normalized events.
#[derive(Debug, Default)]
pub(crate) struct AgentNormalizer {
    session_id: Option<String>,
    text: String,
}

impl AgentNormalizer {
    pub(crate) fn handle(&mut self, line: AgentLine) -> Vec<StreamEvent> {
        match line {
            AgentLine::System {
                subtype,
                session_id,
            } => {
                if subtype.as_deref() == Some("init")
                    && let Some(id) = session_id
                {
                    debug!(session_id = %id, "Agent session started");
                    self.session_id = Some(id);
                }
                Vec::new()
            }
            AgentLine::Assistant { message } => message
                .content
                .into_blocks()
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.is_empty() => {
                        self.text.push_str(&text);
                        Some(StreamEvent::text(text))
                    }
                    ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                        Some(StreamEvent::Thinking { content: thinking })
                    }
                    ContentBlock::ToolUse { name, input } => Some(StreamEvent::ToolCall {
                        tool_name: name,
                        tool_input: input.to_string(),
                    }),
                    _ => None,
                })
                .collect(),
            AgentLine::Result {
                is_error,
                result,
                session_id,
            } => {
                if let Some(id) = session_id {
                    self.session_id = Some(id);
                }
                if is_error {
                    let message = result.unwrap_or_else(|| "agent reported an error".to_string());
                    return vec![
                        UpstreamError::Api {
                            error_type: "agent_error".to_string(),
                            message,
                        }
                        .into_event(),
                    ];
                }
                let content = result.unwrap_or_else(|| std::mem::take(&mut self.text));
                vec![StreamEvent::Complete {
                    content,
                    session_id: self.session_id.take(),
                }]
            }
            AgentLine::Error { error, message } => {
                let message = message
                    .or_else(|| match error {
                        Some(serde_json::Value::String(s)) => Some(s),
                        Some(serde_json::Value::Object(obj)) => obj
                            .get("message")
                            .and_then(|m| m.as_str())
                            .map(ToString::to_string),
                        _ => None,
                    })
                    .unwrap_or_else(|| "Unknown error".to_string());
                vec![
                    UpstreamError::Api {
                        error_type: "agent_error".to_string(),
                        message,
                    }
                    .into_event(),
                ]
            }
            AgentLine::Other => Vec::new(),
        }
    }

    /// Completion for a clean exit that never printed a result line.
    pub(crate) fn finish(&mut self) -> StreamEvent {
        StreamEvent::Complete {
            content: std::mem::take(&mut self.text),
            session_id: self.session_id.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use futures::StreamExt;

    fn parse(line: &str) -> AgentLine {
        serde_json::from_str(line).unwrap()
    }

    fn config(command: &str) -> LlmConfig {
        LlmConfig {
            backend: BackendKind::Agent,
            model: "claude-haiku-4-5-20251001".to_string(),
            api_key: Some("test-key".to_string()),
            base_url: "http://127.0.0.1:9".to_string(),
            max_tokens: 1024,
            agent_command: command.to_string(),
            upstream_timeout_secs: 0,
        }
    }

    #[test]
    fn test_normalizes_full_run() {
        let mut n = AgentNormalizer::default();
        assert!(
            n.handle(parse(
                r#"{"type":"system","subtype":"init","session_id":"abc"}"#
            ))
            .is_empty()
        );

        let events = n.handle(parse(
            r#"{"type":"assistant","message":{"content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"tool_use","id":"t1","name":"WebSearch","input":{"query":"rust"}},
                {"type":"text","text":"Answer"}
            ]}}"#,
        ));
        assert_eq!(
            events,
            vec![
                StreamEvent::Thinking {
                    content: "hmm".to_string()
                },
                StreamEvent::ToolCall {
                    tool_name: "WebSearch".to_string(),
                    tool_input: r#"{"query":"rust"}"#.to_string(),
                },
                StreamEvent::text("Answer"),
            ]
        );

        let done = n.handle(parse(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"Answer"}"#,
        ));
        assert_eq!(
            done,
            vec![StreamEvent::Complete {
                content: "Answer".to_string(),
                session_id: Some("abc".to_string()),
            }]
        );
    }

    #[test]
    fn test_error_result_is_error_event() {
        let mut n = AgentNormalizer::default();
        let events = n.handle(parse(
            r#"{"type":"result","is_error":true,"result":"Credit balance is too low"}"#,
        ));
        assert_eq!(
            events,
            vec![StreamEvent::error(
                "ApiError: agent_error: Credit balance is too low"
            )]
        );
    }

    #[test]
    fn test_unknown_lines_ignored() {
        let mut n = AgentNormalizer::default();
        assert!(n.handle(parse(r#"{"type":"user","message":{}}"#)).is_empty());
        assert!(
            n.handle(parse(
                r#"{"type":"assistant","message":{"content":[{"type":"image","source":{}}]}}"#
            ))
            .is_empty()
        );
    }

    #[test]
    fn test_string_content_is_one_text_block() {
        let mut n = AgentNormalizer::default();
        let events = n.handle(parse(
            r#"{"type":"assistant","message":{"content":"plain"}}"#,
        ));
        assert_eq!(events, vec![StreamEvent::text("plain")]);
        assert_eq!(
            n.finish(),
            StreamEvent::Complete {
                content: "plain".to_string(),
                session_id: None,
            }
        );
    }

    #[test]
    fn test_assistant_without_message_is_skipped() {
        let mut n = AgentNormalizer::default();
        assert!(n.handle(parse(r#"{"type":"assistant"}"#)).is_empty());
        assert!(
            n.handle(parse(r#"{"type":"assistant","message":{}}"#))
                .is_empty()
        );
    }

    #[test]
    fn test_error_lines_become_api_errors() {
        let mut n = AgentNormalizer::default();
        assert_eq!(
            n.handle(parse(r#"{"type":"error","error":{"message":"boom"}}"#)),
            vec![StreamEvent::error("ApiError: agent_error: boom")]
        );
        assert_eq!(
            n.handle(parse(r#"{"type":"error","error":"overloaded"}"#)),
            vec![StreamEvent::error("ApiError: agent_error: overloaded")]
        );
        assert_eq!(
            n.handle(parse(r#"{"type":"error","message":"top level","error":"ignored"}"#)),
            vec![StreamEvent::error("ApiError: agent_error: top level")]
        );
        assert_eq!(
            n.handle(parse(r#"{"type":"error"}"#)),
            vec![StreamEvent::error("ApiError: agent_error: Unknown error")]
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_bare_configuration_error() {
        let backend = AgentBackend::new(LlmConfig {
            api_key: None,
            ..config("/definitely/not/an/agent")
        });
        assert!(backend.ensure_configured().is_err());
        let events: Vec<_> = backend.open(UpstreamRequest::default()).collect().await;
        assert_eq!(
            events,
            vec![StreamEvent::error("ANTHROPIC_API_KEY not configured")]
        );
    }

    #[test]
    fn test_resume_flag_only_with_session() {
        let backend = AgentBackend::new(config("claude"));
        let fresh = backend.args(&UpstreamRequest::default());
        assert!(!fresh.contains(&"--resume".to_string()));
        assert!(fresh.contains(&"WebSearch,WebFetch,Read,Glob,Grep".to_string()));

        let resumed = backend.args(&UpstreamRequest {
            upstream_session_id: Some("sess-9".to_string()),
            ..UpstreamRequest::default()
        });
        assert_eq!(&resumed[resumed.len() - 2..], ["--resume", "sess-9"]);
    }

    #[tokio::test]
    async fn test_missing_command_is_process_error() {
        let backend = AgentBackend::new(config("/definitely/not/an/agent"));
        let events: Vec<_> = backend.open(UpstreamRequest::default()).collect().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { error } => assert!(error.starts_with("ProcessError: ")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_runs_fake_agent() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "cat > /dev/null\n",
                "echo 'starting up'\n",
                "echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s-1\"}'\n",
                "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Hi\"}]}}'\n",
                "echo '{\"type\":\"result\",\"is_error\":false,\"result\":\"Hi\",\"session_id\":\"s-1\"}'\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = AgentBackend::new(config(script.to_str().unwrap()));
        let events: Vec<_> = backend
            .open(UpstreamRequest {
                prompt: "question".to_string(),
                ..UpstreamRequest::default()
            })
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::text("Hi"),
                StreamEvent::Complete {
                    content: "Hi".to_string(),
                    session_id: Some("s-1".to_string()),
                },
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_failing_agent_reports_exit_and_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("failing-agent");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "cat > /dev/null\n",
                "echo 'bad things' >&2\n",
                "exit 3\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = AgentBackend::new(config(script.to_str().unwrap()));
        let events: Vec<_> = backend
            .open(UpstreamRequest {
                prompt: "question".to_string(),
                ..UpstreamRequest::default()
            })
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { error } => {
                assert!(error.starts_with("ProcessError: agent exited with"), "{error}");
                assert!(error.contains('3'), "{error}");
                assert!(error.ends_with(": bad things"), "{error}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
