//! Deterministic selection logic for the requirements document.

use std::cmp::Reverse;

use crate::core::prd::{Prd, Progress, Story};

/// Count passing stories against the total.
pub fn progress(prd: &Prd) -> Progress {
    Progress {
        completed: prd.stories.iter().filter(|story| story.passes).count(),
        total: prd.stories.len(),
    }
}

/// Pick the open story with the highest `priority`; ties go to the earliest in
/// document order.
///
/// Returns `None` when every story passes (the document is complete).
pub fn select_next(prd: &Prd) -> Option<&Story> {
    prd.stories
        .iter()
        .enumerate()
        .filter(|(_, story)| !story.passes)
        .min_by_key(|(index, story)| (Reverse(story.priority), *index))
        .map(|(_, story)| story)
}
