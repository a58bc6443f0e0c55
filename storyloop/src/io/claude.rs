//! Agent backend that drives the `claude` CLI in print mode.
//!
//! The CLI runs non-interactively with `--output-format stream-json`, emitting
//! one JSON object per stdout line. Assistant text blocks become narration,
//! `tool_use` blocks become tool notifications, and the final `result` line
//! carries success and cost.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::io::agent::{
    Agent, AgentRequest, AgentResult, AgentSession, SessionSender, session_channel,
};
use crate::io::config::AgentConfig;

/// Keep at most this much stderr for error reports.
const STDERR_LIMIT_BYTES: usize = 16_000;

/// Time the CLI gets to exit on its own once it has reported a result.
const EXIT_GRACE: Duration = Duration::from_secs(10);

/// Agent that spawns the `claude` CLI once per iteration.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    command: String,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl ClaudeCli {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            model: config.model.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            // stream-json requires verbose mode in print mode.
            .arg("--verbose")
            .arg("--permission-mode")
            .arg("bypassPermissions")
            .arg("--allowedTools")
            .arg(request.allowed_tools.join(","))
            .arg("--append-system-prompt")
            .arg(&request.system_prompt);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(&self.extra_args)
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Agent for ClaudeCli {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn start(&self, request: AgentRequest) -> Result<AgentSession> {
        info!(workdir = %request.workdir.display(), command = %self.command, "starting agent");

        let mut child = self
            .command(&request)
            .spawn()
            .with_context(|| format!("spawn {}", self.command))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, session) = session_channel();
        let pipes = Pipes {
            stdin,
            stdout,
            stderr,
        };
        let task = tokio::spawn(pump_session(child, pipes, request.prompt, request.timeout, tx));
        Ok(session.with_task(task))
    }
}

struct Pipes {
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

async fn pump_session(
    mut child: Child,
    pipes: Pipes,
    prompt: String,
    timeout: Duration,
    tx: SessionSender,
) {
    if let Err(err) = stream_output(&mut child, pipes, prompt, timeout, &tx).await {
        warn!(err = %format!("{err:#}"), "agent session failed");
        if !tx.fail(err) {
            debug!("session already dropped");
        }
    }
}

async fn stream_output(
    child: &mut Child,
    pipes: Pipes,
    prompt: String,
    timeout: Duration,
    tx: &SessionSender,
) -> Result<()> {
    let mut deadline = Instant::now() + timeout;
    let Pipes {
        mut stdin,
        stdout,
        stderr,
    } = pipes;
    let stderr_handle = tokio::spawn(read_limited(stderr, STDERR_LIMIT_BYTES));

    stdin
        .write_all(prompt.as_bytes())
        .await
        .context("write prompt")?;
    // Closing stdin tells the CLI the prompt is complete.
    drop(stdin);

    let mut lines = BufReader::new(stdout).lines();
    let mut saw_result = false;
    loop {
        let line = match timeout_at(deadline, lines.next_line()).await {
            Ok(line) => line.context("read agent output")?,
            Err(_) if saw_result => {
                warn!("agent still running after its result, killing");
                child.kill().await.context("kill agent")?;
                return Ok(());
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "agent timed out, killing");
                child.kill().await.context("kill agent")?;
                return Err(anyhow!("agent timed out after {:?}", timeout));
            }
        };
        let Some(line) = line else {
            break;
        };
        for item in parse_stream_line(&line) {
            let delivered = match item {
                StreamItem::Text(text) => tx.text(text),
                StreamItem::Tool { name, input } => tx.tool(name, input),
                StreamItem::Result(result) => {
                    saw_result = true;
                    deadline = deadline.min(Instant::now() + EXIT_GRACE);
                    tx.result(result)
                }
            };
            if !delivered {
                debug!("session dropped, stopping agent");
                child.kill().await.context("kill agent")?;
                return Ok(());
            }
        }
    }

    let status = match timeout_at(deadline, child.wait()).await {
        Ok(status) => status.context("wait for agent")?,
        Err(_) if saw_result => {
            warn!("agent did not exit after its result, killing");
            child.kill().await.context("kill agent")?;
            return Ok(());
        }
        Err(_) => {
            child.kill().await.context("kill agent")?;
            return Err(anyhow!("agent did not exit within {:?}", timeout));
        }
    };
    let stderr = match stderr_handle.await {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => format!("<stderr unreadable: {err}>"),
        Err(_) => "<stderr reader panicked>".to_string(),
    };

    if !saw_result {
        return Err(anyhow!(
            "agent exited with status {:?} without a result: {}",
            status.code(),
            stderr.trim()
        ));
    }
    if !status.success() {
        warn!(exit_code = ?status.code(), "agent exited non-zero after reporting a result");
    }
    debug!(exit_code = ?status.code(), "agent finished");
    Ok(())
}

async fn read_limited<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// One decoded unit of CLI output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Text(String),
    Tool { name: String, input: Value },
    Result(AgentResult),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Assistant {
        message: AssistantMessage,
    },
    #[serde(rename = "result")]
    Final(ResultLine),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultLine {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    result: Option<String>,
}

impl ResultLine {
    fn into_result(self) -> AgentResult {
        if !self.is_error && self.subtype == "success" {
            return AgentResult::success(self.total_cost_usd);
        }
        let errors = if !self.errors.is_empty() {
            self.errors
        } else if let Some(text) = self.result.filter(|text| !text.trim().is_empty()) {
            vec![text]
        } else {
            vec![format!("agent stopped: {}", self.subtype)]
        };
        AgentResult::failure(self.total_cost_usd, errors)
    }
}

/// Decode one stdout line. Lines that are not recognized produce no items.
pub fn parse_stream_line(line: &str) -> Vec<StreamItem> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let parsed: StreamLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(err = %err, "skipping undecodable agent output line");
            return Vec::new();
        }
    };
    match parsed {
        StreamLine::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => {
                    Some(StreamItem::Text(text))
                }
                ContentBlock::ToolUse { name, input } => Some(StreamItem::Tool { name, input }),
                _ => None,
            })
            .collect(),
        StreamLine::Final(result) => vec![StreamItem::Result(result.into_result())],
        StreamLine::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::agent::{AgentEvent, ToolInvocation};
    use serde_json::json;

    #[test]
    fn assistant_line_yields_text_and_tools_in_order() {
        let line = json!({
            "type": "assistant",
            "message": {
                "id": "msg_1",
                "content": [
                    {"type": "text", "text": "Reading the parser."},
                    {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {"file_path": "src/lib.rs"}},
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "   "}
                ]
            }
        })
        .to_string();

        let items = parse_stream_line(&line);
        assert_eq!(
            items,
            vec![
                StreamItem::Text("Reading the parser.".to_string()),
                StreamItem::Tool {
                    name: "Read".to_string(),
                    input: json!({"file_path": "src/lib.rs"}),
                },
            ]
        );
    }

    #[test]
    fn success_result_carries_cost() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.42,"result":"done","duration_ms":1200}"#;
        assert_eq!(
            parse_stream_line(line),
            vec![StreamItem::Result(AgentResult::success(0.42))]
        );
    }

    #[test]
    fn error_result_prefers_reported_errors() {
        let line = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"total_cost_usd":0.1,"errors":["tool crashed","gave up"]}"#;
        let items = parse_stream_line(line);
        let [StreamItem::Result(result)] = items.as_slice() else {
            panic!("expected one result, got {items:?}");
        };
        assert!(!result.success);
        assert_eq!(result.error_text(), "tool crashed; gave up");
    }

    #[test]
    fn error_result_falls_back_to_subtype() {
        let line = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        let items = parse_stream_line(line);
        let [StreamItem::Result(result)] = items.as_slice() else {
            panic!("expected one result, got {items:?}");
        };
        assert_eq!(result.errors, vec!["agent stopped: error_max_turns".to_string()]);
        assert_eq!(result.cost_usd, 0.0);
    }

    #[test]
    fn system_user_and_garbage_lines_are_ignored() {
        assert!(parse_stream_line(r#"{"type":"system","subtype":"init","tools":["Read"]}"#).is_empty());
        assert!(
            parse_stream_line(
                r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"ok"}]}}"#
            )
            .is_empty()
        );
        assert!(parse_stream_line("not json at all").is_empty());
        assert!(parse_stream_line("").is_empty());
    }

    #[test]
    fn command_line_grants_tools_without_confirmation() {
        let cli = ClaudeCli::from_config(&AgentConfig {
            model: Some("sonnet".to_string()),
            ..AgentConfig::default()
        });
        let request = AgentRequest {
            workdir: std::env::temp_dir(),
            prompt: "do it".to_string(),
            system_prompt: "preamble".to_string(),
            allowed_tools: vec!["Read".to_string(), "Bash".to_string()],
            timeout: Duration::from_secs(5),
        };
        let cmd = cli.command(&request);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "bypassPermissions"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read,Bash"]));
        assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let cli = ClaudeCli::from_config(&AgentConfig {
            command: "storyloop-no-such-agent-binary".to_string(),
            ..AgentConfig::default()
        });
        let request = AgentRequest {
            workdir: std::env::temp_dir(),
            prompt: "p".to_string(),
            system_prompt: "s".to_string(),
            allowed_tools: vec!["Read".to_string()],
            timeout: Duration::from_secs(5),
        };
        let err = cli.start(request).err().expect("spawn should fail");
        assert!(err.to_string().contains("spawn storyloop-no-such-agent-binary"));
    }

    /// Write an executable stand-in for the agent CLI. It ignores the CLI
    /// flags and consumes the prompt before running `body`.
    #[cfg(unix)]
    fn fake_agent(dir: &std::path::Path, body: &str) -> ClaudeCli {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        ClaudeCli::from_config(&AgentConfig {
            command: path.display().to_string(),
            ..AgentConfig::default()
        })
    }

    #[cfg(unix)]
    fn request_in(dir: &std::path::Path, timeout: Duration) -> AgentRequest {
        AgentRequest {
            workdir: dir.to_path_buf(),
            prompt: "work on S-1".to_string(),
            system_prompt: "preamble".to_string(),
            allowed_tools: vec!["Read".to_string()],
            timeout,
        }
    }

    #[cfg(unix)]
    async fn collect(mut session: AgentSession) -> Vec<Result<AgentEvent>> {
        let mut events = Vec::new();
        while let Some(event) = session.events.recv().await {
            events.push(event);
        }
        session.finish().await;
        events
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_text_tools_and_result_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let assistant = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Reading."},
                {"type": "tool_use", "name": "Read", "input": {"file_path": "a.rs"}},
                {"type": "text", "text": "Editing."},
                {"type": "tool_use", "name": "Edit", "input": {"file_path": "a.rs"}}
            ]}
        });
        let result = r#"{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.3}"#;
        let cli = fake_agent(
            temp.path(),
            &format!("echo '{assistant}'\necho '{result}'"),
        );

        let session = cli
            .start(request_in(temp.path(), Duration::from_secs(30)))
            .expect("start");
        let events: Vec<AgentEvent> = collect(session)
            .await
            .into_iter()
            .map(|event| event.expect("event"))
            .collect();

        assert_eq!(
            events,
            vec![
                AgentEvent::Text("Reading.".to_string()),
                AgentEvent::Tool(ToolInvocation {
                    name: "Read".to_string(),
                    input: json!({"file_path": "a.rs"}),
                }),
                AgentEvent::Text("Editing.".to_string()),
                AgentEvent::Tool(ToolInvocation {
                    name: "Edit".to_string(),
                    input: json!({"file_path": "a.rs"}),
                }),
                AgentEvent::Result(AgentResult::success(0.3)),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_agent_is_killed_at_the_deadline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cli = fake_agent(temp.path(), "sleep 30");

        let started = std::time::Instant::now();
        let session = cli
            .start(request_in(temp.path(), Duration::from_secs(1)))
            .expect("start");
        let events = collect(session).await;

        assert!(started.elapsed() < Duration::from_secs(20));
        let [Err(err)] = events.as_slice() else {
            panic!("expected a single error, got {events:?}");
        };
        assert!(err.to_string().contains("timed out"), "{err:#}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_without_result_reports_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cli = fake_agent(temp.path(), "echo 'credential rejected' >&2\nexit 3");

        let session = cli
            .start(request_in(temp.path(), Duration::from_secs(30)))
            .expect("start");
        let events = collect(session).await;

        let [Err(err)] = events.as_slice() else {
            panic!("expected a single error, got {events:?}");
        };
        let message = err.to_string();
        assert!(message.contains("without a result"), "{message}");
        assert!(message.contains("Some(3)"), "{message}");
        assert!(message.contains("credential rejected"), "{message}");
    }

    /// The session is not over until the process is: a second iteration must
    /// never overlap the first one's agent.
    #[cfg(unix)]
    #[tokio::test]
    async fn finish_waits_for_agent_exit_after_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("exited");
        let result = r#"{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.0}"#;
        let cli = fake_agent(
            temp.path(),
            &format!("echo '{result}'\nsleep 1\ntouch '{}'", marker.display()),
        );

        let mut session = cli
            .start(request_in(temp.path(), Duration::from_secs(30)))
            .expect("start");
        let first = session.events.recv().await.expect("event").expect("result");
        assert_eq!(first, AgentEvent::Result(AgentResult::success(0.0)));
        assert!(!marker.exists());

        session.finish().await;
        assert!(marker.exists());
    }
}
