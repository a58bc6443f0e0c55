//! Prompt construction for agent invocations.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::prd::{Prd, Story};
use crate::core::selector::progress;

const STORY_TEMPLATE: &str = include_str!("prompts/story.md");
const SYSTEM_PROMPT: &str = include_str!("prompts/system.md");

/// Selected story context for template rendering.
#[derive(Debug, Clone, Serialize)]
struct StoryContext {
    id: String,
    title: String,
    description: String,
    acceptance_criteria: Vec<String>,
    epic: String,
    priority: i64,
    notes: String,
}

impl StoryContext {
    fn from_story(story: &Story) -> Self {
        Self {
            id: story.id.clone(),
            title: story.title.clone(),
            description: story.description.trim().to_string(),
            acceptance_criteria: story.acceptance_criteria.clone(),
            epic: story.epic.clone(),
            priority: story.priority,
            notes: story.notes.trim().to_string(),
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    system_prompt: String,
}

impl PromptEngine {
    /// `system_override` replaces the built-in instruction preamble.
    pub fn new(system_override: Option<&str>) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("story", STORY_TEMPLATE)?;
        let system_prompt = system_override.unwrap_or(SYSTEM_PROMPT).trim().to_string();
        Ok(Self { env, system_prompt })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn render_story(&self, prd: &Prd, story: &Story, prd_path: &Path) -> Result<String> {
        let counts = progress(prd);
        let template = self.env.get_template("story")?;
        let rendered = template.render(context! {
            project => prd.project.as_str(),
            branch_name => (!prd.branch_name.trim().is_empty()).then(|| prd.branch_name.trim()),
            description => (!prd.description.trim().is_empty()).then(|| prd.description.trim()),
            source_document => (!prd.source_document.trim().is_empty()).then(|| prd.source_document.trim()),
            prd_path => prd_path.display().to_string(),
            completed => counts.completed,
            total => counts.total,
            story => StoryContext::from_story(story),
        })?;
        Ok(rendered)
    }
}
