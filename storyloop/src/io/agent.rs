//! Agent abstraction for story execution.
//!
//! The [`Agent`] trait decouples the run loop from the actual agent backend
//! (currently the `claude` CLI, see [`crate::io::claude`]). Tests use scripted
//! agents that replay predetermined sessions without spawning processes.
//!
//! A started session exposes one ordered, unbounded queue of narration, tool
//! invocations and a final [`AgentResult`]. The producer never waits on the
//! run loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory the agent operates in.
    pub workdir: PathBuf,
    /// Story prompt.
    pub prompt: String,
    /// Instruction preamble appended to the agent's own system prompt.
    pub system_prompt: String,
    /// Tools granted without an interactive confirmation gate.
    pub allowed_tools: Vec<String>,
    /// Maximum time for the whole session.
    pub timeout: Duration,
}

/// Terminal payload of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    /// Cost accrued by the session, in USD.
    pub cost_usd: f64,
    /// Error messages reported by the agent (empty on success).
    pub errors: Vec<String>,
}

impl AgentResult {
    pub fn success(cost_usd: f64) -> Self {
        Self {
            success: true,
            cost_usd,
            errors: Vec::new(),
        }
    }

    pub fn failure(cost_usd: f64, errors: Vec<String>) -> Self {
        Self {
            success: false,
            cost_usd,
            errors,
        }
    }

    /// Errors joined for display.
    pub fn error_text(&self) -> String {
        if self.errors.is_empty() {
            return "agent reported failure".to_string();
        }
        self.errors.join("; ")
    }
}

/// One unit of session output, in the order the agent produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Narration chunk.
    Text(String),
    /// The agent invoked a tool.
    Tool(ToolInvocation),
    /// Terminal payload; nothing meaningful follows it.
    Result(AgentResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub input: Value,
}

/// Receiving end of a running session.
///
/// Narration, tool notifications and the result share one queue so the run
/// loop sees them in arrival order. An `Err` is a transport failure; the
/// session is over.
pub struct AgentSession {
    pub events: mpsc::UnboundedReceiver<Result<AgentEvent>>,
    task: Option<JoinHandle<()>>,
}

impl AgentSession {
    /// Attach the task that owns the agent process.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Stop receiving and wait until the agent process is gone.
    ///
    /// The producer bounds this wait with its own deadline.
    pub async fn finish(mut self) {
        self.events.close();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(err) = task.await {
            warn!(error = %err, "agent session task did not complete");
        }
    }
}

/// Sending end handed to the producer of a session.
pub struct SessionSender {
    events: mpsc::UnboundedSender<Result<AgentEvent>>,
}

impl SessionSender {
    /// Returns false once the run loop has stopped receiving.
    pub fn text(&self, text: String) -> bool {
        self.events.send(Ok(AgentEvent::Text(text))).is_ok()
    }

    pub fn tool(&self, name: String, input: Value) -> bool {
        self.events
            .send(Ok(AgentEvent::Tool(ToolInvocation { name, input })))
            .is_ok()
    }

    pub fn result(&self, result: AgentResult) -> bool {
        self.events.send(Ok(AgentEvent::Result(result))).is_ok()
    }

    pub fn fail(&self, err: anyhow::Error) -> bool {
        self.events.send(Err(err)).is_ok()
    }
}

/// Create a connected sender/session pair.
pub fn session_channel() -> (SessionSender, AgentSession) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SessionSender { events: tx },
        AgentSession {
            events: rx,
            task: None,
        },
    )
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Start a session for `request`. Errors here are transport failures.
    ///
    /// Must be called from within a tokio runtime.
    fn start(&self, request: AgentRequest) -> Result<AgentSession>;
}
