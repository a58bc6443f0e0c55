//! Test-only helpers: document builders, event parsing, and a scripted agent.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::core::events::RunEvent;
use crate::core::prd::{Prd, Story};
use crate::io::agent::{Agent, AgentRequest, AgentResult, AgentSession, session_channel};
use crate::io::prd_store;

/// Create a deterministic story with default fields.
pub fn story(id: &str, priority: i64, passes: bool) -> Story {
    Story {
        id: id.to_string(),
        title: format!("{} title", id),
        description: format!("{} description", id),
        acceptance_criteria: Vec::new(),
        epic: String::new(),
        priority,
        passes,
        notes: String::new(),
    }
}

/// Create a document holding `stories` in the given order.
pub fn prd(stories: Vec<Story>) -> Prd {
    Prd {
        project: "demo".to_string(),
        source_document: "docs/brief.md".to_string(),
        branch_name: "feat/demo".to_string(),
        description: "Demo project".to_string(),
        stories,
    }
}

/// Write `prd` as `prd.json` under `dir`, returning the path.
pub fn write_prd(dir: &Path, prd: &Prd) -> Result<PathBuf> {
    let path = dir.join("prd.json");
    save_prd(&path, prd)?;
    Ok(path)
}

/// Overwrite the document at `path` (pretty JSON, trailing newline).
pub fn save_prd(path: &Path, prd: &Prd) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(prd)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

/// Parse a line-delimited event stream.
pub fn parse_events(raw: &[u8]) -> Vec<RunEvent> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(|line| serde_json::from_str(line).expect("event line"))
        .collect()
}

/// Writer whose every write fails.
pub struct BrokenWriter;

impl Write for BrokenWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
    }
}

/// How a scripted session ends.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Deliver a terminal result.
    Result(AgentResult),
    /// Fail the stream after the scripted output.
    StreamError(String),
    /// Fail before any session exists.
    StartError(String),
    /// Close the stream without a result.
    NoResult,
}

/// One unit of scripted agent output.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Text(String),
    Tool(String, Value),
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    /// Output sent before the outcome, in this order.
    pub steps: Vec<ScriptedStep>,
    /// Story ids marked `passes=true` in the document before the session ends.
    pub mark_passes: Vec<String>,
    /// Raw contents written over the document before the session ends.
    pub rewrite: Option<String>,
    pub outcome: ScriptedOutcome,
}

impl ScriptedTurn {
    pub fn succeed(cost_usd: f64) -> Self {
        Self {
            steps: Vec::new(),
            mark_passes: Vec::new(),
            rewrite: None,
            outcome: ScriptedOutcome::Result(AgentResult::success(cost_usd)),
        }
    }

    pub fn fail(cost_usd: f64, errors: &[&str]) -> Self {
        Self {
            outcome: ScriptedOutcome::Result(AgentResult::failure(
                cost_usd,
                errors.iter().map(|e| e.to_string()).collect(),
            )),
            ..Self::succeed(0.0)
        }
    }

    pub fn start_error(message: &str) -> Self {
        Self {
            outcome: ScriptedOutcome::StartError(message.to_string()),
            ..Self::succeed(0.0)
        }
    }

    pub fn stream_error(message: &str) -> Self {
        Self {
            outcome: ScriptedOutcome::StreamError(message.to_string()),
            ..Self::succeed(0.0)
        }
    }

    pub fn no_result() -> Self {
        Self {
            outcome: ScriptedOutcome::NoResult,
            ..Self::succeed(0.0)
        }
    }

    pub fn passing(mut self, story_id: &str) -> Self {
        self.mark_passes.push(story_id.to_string());
        self
    }

    pub fn rewrite(mut self, raw: &str) -> Self {
        self.rewrite = Some(raw.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.steps.push(ScriptedStep::Text(text.to_string()));
        self
    }

    pub fn tool(mut self, name: &str, input: Value) -> Self {
        self.steps.push(ScriptedStep::Tool(name.to_string(), input));
        self
    }
}

/// Agent that replays scripted turns and records every request.
///
/// Each session holds a short-lived task standing in for the agent process.
pub struct ScriptedAgent {
    prd_path: PathBuf,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<AgentRequest>>,
    live_sessions: Arc<AtomicUsize>,
    overlapping_starts: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(prd_path: &Path, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            prd_path: prd_path.to_path_buf(),
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            live_sessions: Arc::new(AtomicUsize::new(0)),
            overlapping_starts: AtomicUsize::new(0),
        }
    }

    /// Sessions started while an earlier session's task was still running.
    pub fn overlapping_starts(&self) -> usize {
        self.overlapping_starts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn mark_passes(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut doc = prd_store::load(&self.prd_path)?;
        for story in &mut doc.stories {
            if ids.contains(&story.id) {
                story.passes = true;
                story.notes = "done by scripted agent".to_string();
            }
        }
        save_prd(&self.prd_path, &doc)
    }
}

impl Agent for ScriptedAgent {
    fn start(&self, request: AgentRequest) -> Result<AgentSession> {
        self.requests.lock().expect("requests lock").push(request);
        let turn = self
            .turns
            .lock()
            .expect("turns lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no turns left"))?;

        if let ScriptedOutcome::StartError(message) = &turn.outcome {
            return Err(anyhow!("{message}"));
        }
        self.mark_passes(&turn.mark_passes)?;
        if let Some(raw) = &turn.rewrite {
            fs::write(&self.prd_path, raw)
                .with_context(|| format!("write {}", self.prd_path.display()))?;
        }

        if self.live_sessions.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapping_starts.fetch_add(1, Ordering::SeqCst);
        }
        let live = Arc::clone(&self.live_sessions);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            live.fetch_sub(1, Ordering::SeqCst);
        });

        let (tx, session) = session_channel();
        for step in turn.steps {
            match step {
                ScriptedStep::Text(text) => tx.text(text),
                ScriptedStep::Tool(name, input) => tx.tool(name, input),
            };
        }
        match turn.outcome {
            ScriptedOutcome::Result(result) => {
                tx.result(result);
            }
            ScriptedOutcome::StreamError(message) => {
                tx.fail(anyhow!("{message}"));
            }
            ScriptedOutcome::StartError(_) | ScriptedOutcome::NoResult => {}
        }
        Ok(session.with_task(task))
    }
}
