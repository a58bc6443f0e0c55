//! Selection helpers for `storyloop select` and `storyloop status`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::prd::{Prd, Progress};
use crate::core::selector::{progress, select_next};
use crate::io::prd_store;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every story passes.
    Complete,
    /// Next story to work on.
    Open(SelectedStory),
}

/// Minimal selected story metadata for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedStory {
    pub id: String,
    pub title: String,
    pub priority: i64,
}

/// Select the next story from an in-memory document.
pub fn select_story(prd: &Prd) -> SelectOutcome {
    match select_next(prd) {
        Some(story) => SelectOutcome::Open(SelectedStory {
            id: story.id.clone(),
            title: story.title.clone(),
            priority: story.priority,
        }),
        None => SelectOutcome::Complete,
    }
}

/// Load the document from disk and select the next story.
pub fn select_from_path(path: &Path) -> Result<SelectOutcome> {
    let prd = prd_store::load(path).context("load document for selection")?;
    Ok(select_story(&prd))
}

/// Snapshot for `storyloop status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub project: String,
    pub progress: Progress,
    pub next: SelectOutcome,
}

impl StatusReport {
    pub fn render(&self) -> String {
        let next = match &self.next {
            SelectOutcome::Complete => "none (all stories pass)".to_string(),
            SelectOutcome::Open(story) => format!(
                "{} - {} (priority {})",
                story.id, story.title, story.priority
            ),
        };
        format!(
            "project: {}\nprogress: {}/{} stories pass\nnext: {}",
            self.project, self.progress.completed, self.progress.total, next
        )
    }
}

pub fn status_from_path(path: &Path) -> Result<StatusReport> {
    let prd = prd_store::load(path).context("load document for status")?;
    Ok(StatusReport {
        project: prd.project.clone(),
        progress: progress(&prd),
        next: select_story(&prd),
    })
}
