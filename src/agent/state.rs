use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Literal substring the agent emits when it considers the task finished.
pub const TASK_SUMMARY_MARKER: &str = "<task_summary>";

/// Returns true if `text` carries the completion marker.
pub fn has_completion_marker(text: &str) -> bool {
    text.contains(TASK_SUMMARY_MARKER)
}

/// State accumulated across the turns of one job.
///
/// Owned by a single run loop; tools reach it only through the tool set
/// adapter, which holds the only mutable borrow during a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Set once, from the first marker-bearing assistant message.
    pub summary: Option<String>,
    /// Path to last written content. Entries are never removed.
    pub files: BTreeMap<String, String>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the summary. Later calls are ignored once one is set.
    /// Returns true when this call stored the summary.
    pub fn record_summary(&mut self, text: &str) -> bool {
        if self.has_summary() {
            return false;
        }
        self.summary = Some(text.to_string());
        true
    }

    pub fn has_summary(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    pub fn merge_files<I>(&mut self, written: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (path, content) in written {
            self.files.insert(path, content);
        }
    }

    /// A run is complete when it produced a summary and at least one file.
    pub fn is_complete(&self) -> bool {
        self.has_summary() && !self.files.is_empty()
    }
}
