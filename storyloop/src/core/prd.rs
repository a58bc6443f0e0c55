//! Requirements document (PRD) types.
//!
//! The document is owned by the delegated agent: it may rewrite the file between
//! iterations. These types are immutable snapshots of one read.

use serde::{Deserialize, Serialize};

/// Backlog plus project metadata, in on-disk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    pub project: String,
    #[serde(default)]
    pub source_document: String,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub description: String,
    /// Document order doubles as the selection tie-break order.
    #[serde(alias = "userStories")]
    pub stories: Vec<Story>,
}

/// One backlog item. `passes` is the sole completion flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub epic: String,
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
}

/// Completion counts for a document snapshot. `completed <= total` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

impl Prd {
    /// First story with `id`. Duplicate ids are tolerated, later ones are shadowed.
    pub fn find_story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|story| story.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_document_with_defaults() {
        let raw = r#"{
            "project": "demo",
            "branchName": "feat/demo",
            "stories": [
                {"id": "S-1", "title": "First", "priority": 2, "acceptanceCriteria": ["builds"]}
            ]
        }"#;
        let prd: Prd = serde_json::from_str(raw).expect("parse");
        assert_eq!(prd.branch_name, "feat/demo");
        assert_eq!(prd.source_document, "");
        let story = &prd.stories[0];
        assert_eq!(story.acceptance_criteria, vec!["builds".to_string()]);
        assert!(!story.passes);
        assert_eq!(story.notes, "");
    }

    #[test]
    fn accepts_user_stories_alias() {
        let raw = r#"{"project": "demo", "userStories": [{"id": "US-1", "title": "T", "priority": 1, "passes": true}]}"#;
        let prd: Prd = serde_json::from_str(raw).expect("parse");
        assert_eq!(prd.stories.len(), 1);
        assert!(prd.stories[0].passes);
    }

    #[test]
    fn find_story_takes_first_duplicate() {
        let raw = r#"{"project": "demo", "stories": [
            {"id": "dup", "title": "first", "priority": 1},
            {"id": "dup", "title": "second", "priority": 9, "passes": true}
        ]}"#;
        let prd: Prd = serde_json::from_str(raw).expect("parse");
        let found = prd.find_story("dup").expect("story");
        assert_eq!(found.title, "first");
        assert!(prd.find_story("missing").is_none());
    }
}
