//! Per-iteration tool invocation counts.

use std::collections::BTreeMap;

/// Counts tool invocations for the current iteration only.
///
/// Reset once at the start of every iteration, never mid-iteration.
#[derive(Debug, Default, Clone)]
pub struct ToolUsage {
    counts: BTreeMap<String, u32>,
}

impl ToolUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }

    pub fn record(&mut self, tool: &str) {
        *self.counts.entry(tool.to_string()).or_insert(0) += 1;
    }

    /// Independent copy of the current counts.
    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.counts.clone()
    }
}
