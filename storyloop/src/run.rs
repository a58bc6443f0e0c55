//! Iteration controller for `storyloop run`.
//!
//! A run is a bounded sequence of iterations. Each iteration re-reads the
//! requirements document, selects one story, hands it to the agent, streams the
//! agent's narration and tool use onto the event channel, then re-reads the
//! document to see whether the agent marked the story as passing.
//!
//! Failures inside an iteration (agent-reported or transport) are reported as
//! `iteration_failed` and the loop moves on. Failures outside the iteration
//! scope end the run with `run_failed`; a broken event channel ends it with no
//! further events.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::events::RunEvent;
use crate::core::prd::{Prd, Story};
use crate::core::selector::{progress, select_next};
use crate::core::tool_usage::ToolUsage;
use crate::io::agent::{
    Agent, AgentEvent, AgentRequest, AgentResult, AgentSession, ToolInvocation,
};
use crate::io::config::{RunConfig, RunnerConfig};
use crate::io::emitter::{EmitError, Emitter};
use crate::io::prd_store;
use crate::io::prompt::PromptEngine;
use crate::io::tool_detail::tool_detail;

/// The run ended with `run_failed` on the event channel.
#[derive(Debug, Error)]
#[error("run {run_id} failed: {error}")]
pub struct RunFailed {
    pub run_id: String,
    pub error: String,
}

/// Reason why `run_loop` stopped iterating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every story passes.
    Complete,
    /// The configured `max_iterations` were used up.
    MaxIterations,
    /// Cancellation was requested at an iteration boundary.
    Cancelled,
}

/// Summary of a run that ended with `run_completed`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub iterations: u32,
    pub stories_completed: u32,
    pub total_cost: f64,
    pub duration: Duration,
    pub stop: LoopStop,
}

/// Accounting state owned by one run.
#[derive(Debug)]
struct RunContext {
    total_cost: f64,
    stories_completed: u32,
    iteration: u32,
    started: Instant,
}

impl RunContext {
    fn new() -> Self {
        Self {
            total_cost: 0.0,
            stories_completed: 0,
            iteration: 0,
            started: Instant::now(),
        }
    }
}

/// Drive the agent through the backlog until every story passes, the iteration
/// budget is spent, or `cancel` fires at an iteration boundary.
///
/// Emits exactly one `run_completed` (returning `Ok`) or one `run_failed`
/// (returning a [`RunFailed`] error). An [`EmitError`] is returned as-is.
pub async fn run_loop<A: Agent, W: Write>(
    config: &RunConfig,
    runner: &RunnerConfig,
    agent: &A,
    emitter: &mut Emitter<W>,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let mut controller = Controller {
        config,
        runner,
        agent,
        emitter,
        ctx: RunContext::new(),
        tools: ToolUsage::new(),
    };

    match controller.drive(cancel).await {
        Ok(summary) => Ok(summary),
        Err(err) if err.downcast_ref::<EmitError>().is_some() => Err(err),
        Err(err) => {
            let message = format!("{err:#}");
            error!(run_id = %config.run_id, error = %message, "run failed");
            controller.emit(RunEvent::RunFailed {
                run_id: config.run_id.clone(),
                error: message.clone(),
            })?;
            Err(RunFailed {
                run_id: config.run_id.clone(),
                error: message,
            }
            .into())
        }
    }
}

struct Controller<'a, A: Agent, W: Write> {
    config: &'a RunConfig,
    runner: &'a RunnerConfig,
    agent: &'a A,
    emitter: &'a mut Emitter<W>,
    ctx: RunContext,
    tools: ToolUsage,
}

impl<A: Agent, W: Write> Controller<'_, A, W> {
    fn emit(&mut self, event: RunEvent) -> Result<()> {
        self.emitter.emit(&event)
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<RunSummary> {
        let prd = prd_store::load(&self.config.prd_path)?;
        let prompts = PromptEngine::new(self.config.system_prompt.as_deref())
            .context("load prompt templates")?;
        let counts = progress(&prd);
        self.emit(RunEvent::RunStarted {
            run_id: self.config.run_id.clone(),
            total_stories: counts.total,
            completed_stories: counts.completed,
        })?;
        self.emitter.log(format_args!(
            "run {} started: {}/{} stories complete, up to {} iterations",
            self.config.run_id, counts.completed, counts.total, self.config.max_iterations
        ));

        let mut stop = LoopStop::MaxIterations;
        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                info!(iteration, "cancellation requested, stopping before next iteration");
                stop = LoopStop::Cancelled;
                break;
            }
            let prd = prd_store::load(&self.config.prd_path)?;
            let Some(story) = select_next(&prd).cloned() else {
                stop = LoopStop::Complete;
                break;
            };
            self.ctx.iteration = iteration;
            self.iterate(&prompts, &prd, &story).await?;
        }

        match prd_store::load(&self.config.prd_path) {
            Ok(prd) => {
                let counts = progress(&prd);
                info!(completed = counts.completed, total = counts.total, "final progress");
            }
            Err(err) => warn!(error = %format!("{err:#}"), "final progress unavailable"),
        }

        let duration = self.ctx.started.elapsed();
        self.emit(RunEvent::RunCompleted {
            run_id: self.config.run_id.clone(),
            total_cost: self.ctx.total_cost,
            stories_completed: self.ctx.stories_completed,
            duration_secs: duration.as_secs_f64(),
        })?;
        self.emitter.log(format_args!(
            "run {} completed: {} stories in {} iterations, ${:.4}",
            self.config.run_id, self.ctx.stories_completed, self.ctx.iteration, self.ctx.total_cost
        ));

        Ok(RunSummary {
            run_id: self.config.run_id.clone(),
            iterations: self.ctx.iteration,
            stories_completed: self.ctx.stories_completed,
            total_cost: self.ctx.total_cost,
            duration,
            stop,
        })
    }

    #[instrument(skip_all, fields(iteration = self.ctx.iteration, story_id = %story.id))]
    async fn iterate(&mut self, prompts: &PromptEngine, prd: &Prd, story: &Story) -> Result<()> {
        let iteration = self.ctx.iteration;
        let started = Instant::now();
        self.tools.reset();
        self.emit(RunEvent::IterationStarted {
            iteration,
            story_id: story.id.clone(),
            story_title: story.title.clone(),
        })?;
        self.emitter.log(format_args!(
            "iteration {iteration}: {} - {}",
            story.id, story.title
        ));

        let result = match self.invoke_and_stream(prompts, prd, story).await {
            Ok(result) => result,
            Err(err) if err.downcast_ref::<EmitError>().is_some() => return Err(err),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "iteration failed");
                self.emit(RunEvent::IterationFailed {
                    iteration,
                    story_id: story.id.clone(),
                    error: message,
                })?;
                return Ok(());
            }
        };

        if !result.success {
            let message = result.error_text();
            warn!(error = %message, "agent reported failure");
            self.emit(RunEvent::IterationFailed {
                iteration,
                story_id: story.id.clone(),
                error: message,
            })?;
        }

        self.reconcile(story, &result, started)
    }

    async fn invoke_and_stream(
        &mut self,
        prompts: &PromptEngine,
        prd: &Prd,
        story: &Story,
    ) -> Result<AgentResult> {
        let prompt = prompts
            .render_story(prd, story, &self.config.prd_path)
            .context("render story prompt")?;
        let request = AgentRequest {
            workdir: self.config.project_dir.clone(),
            prompt,
            system_prompt: prompts.system_prompt().to_string(),
            allowed_tools: self.runner.agent.allowed_tools.clone(),
            timeout: self.runner.iteration_timeout(),
        };
        let mut session = self.agent.start(request).context("start agent")?;

        let outcome = self.stream(&mut session).await;
        // The next iteration must not overlap this agent process.
        session.finish().await;
        outcome
    }

    /// Re-emit session output in arrival order until the result arrives.
    async fn stream(&mut self, session: &mut AgentSession) -> Result<AgentResult> {
        while let Some(event) = session.events.recv().await {
            match event.context("agent stream failed")? {
                AgentEvent::Text(text) => self.emit(RunEvent::AgentText { text })?,
                AgentEvent::Tool(tool) => self.on_tool(tool)?,
                AgentEvent::Result(result) => return Ok(result),
            }
        }
        Err(anyhow!("agent stream ended without a result"))
    }

    fn on_tool(&mut self, tool: ToolInvocation) -> Result<()> {
        self.tools.record(&tool.name);
        let detail = tool_detail(&tool.name, &tool.input);
        debug!(tool = %tool.name, detail = %detail, "agent tool use");
        self.emit(RunEvent::AgentTool {
            tool: tool.name,
            detail,
        })
    }

    fn reconcile(&mut self, story: &Story, result: &AgentResult, started: Instant) -> Result<()> {
        let iteration = self.ctx.iteration;
        self.ctx.total_cost += result.cost_usd;
        let duration = started.elapsed();
        self.emit(RunEvent::IterationCompleted {
            iteration,
            story_id: story.id.clone(),
            cost: result.cost_usd,
            duration_secs: duration.as_secs_f64(),
            tools: self.tools.snapshot(),
        })?;
        info!(
            cost = result.cost_usd,
            duration_secs = duration.as_secs_f64(),
            total_cost = self.ctx.total_cost,
            "iteration completed"
        );

        // The agent may have rewritten the document; only a fresh read counts.
        let prd = match prd_store::load(&self.config.prd_path) {
            Ok(prd) => prd,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not re-read document, story not counted");
                return Ok(());
            }
        };
        if !prd.find_story(&story.id).is_some_and(|s| s.passes) {
            debug!("story still open");
            return Ok(());
        }

        self.ctx.stories_completed += 1;
        let counts = progress(&prd);
        self.emit(RunEvent::StoryCompleted {
            story_id: story.id.clone(),
            passed: counts.completed,
            total: counts.total,
        })?;
        self.emitter.log(format_args!(
            "story {} complete ({}/{})",
            story.id, counts.completed, counts.total
        ));
        Ok(())
    }
}
