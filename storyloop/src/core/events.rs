//! Wire-level event protocol.
//!
//! Each event serializes to one JSON object tagged by `"type"` and carrying
//! exactly the fields of its kind. Order guarantees on the stream:
//!
//! - `run_started` precedes every other event of the run.
//! - For one iteration: `iteration_started`, then any `agent_text`/`agent_tool`,
//!   then `iteration_completed` or `iteration_failed`.
//! - `story_completed` follows the `iteration_completed` that produced it.
//! - Exactly one of `run_completed`/`run_failed` is the last event.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        total_stories: usize,
        completed_stories: usize,
    },
    RunCompleted {
        run_id: String,
        total_cost: f64,
        stories_completed: u32,
        duration_secs: f64,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
    IterationStarted {
        iteration: u32,
        story_id: String,
        story_title: String,
    },
    IterationCompleted {
        iteration: u32,
        story_id: String,
        cost: f64,
        duration_secs: f64,
        tools: BTreeMap<String, u32>,
    },
    IterationFailed {
        iteration: u32,
        story_id: String,
        error: String,
    },
    AgentText {
        text: String,
    },
    AgentTool {
        tool: String,
        detail: String,
    },
    StoryCompleted {
        story_id: String,
        passed: usize,
        total: usize,
    },
}

impl RunEvent {
    /// Protocol tag of this event (the `"type"` field).
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunFailed { .. } => "run_failed",
            RunEvent::IterationStarted { .. } => "iteration_started",
            RunEvent::IterationCompleted { .. } => "iteration_completed",
            RunEvent::IterationFailed { .. } => "iteration_failed",
            RunEvent::AgentText { .. } => "agent_text",
            RunEvent::AgentTool { .. } => "agent_tool",
            RunEvent::StoryCompleted { .. } => "story_completed",
        }
    }

    /// True for `run_completed` and `run_failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. }
        )
    }
}
