//! The bounded reasoning loop and its result types.

use crate::core::constants::PREVIEW_WIDTH;

pub mod arguments;
pub mod prompt;
pub mod run;

pub use run::{AgentRequest, AgentRunner};

/// Terminal outcome of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// The model produced a final natural-language answer.
    Ok,
    /// The iteration cap ran out; the output summarizes partial progress.
    Partial,
    /// An unrecoverable failure: unknown tool, repeated all-failed
    /// batches, or a model transport error.
    Error,
    /// Policy refusals accumulated past the stop threshold.
    Blocked,
}

/// One tool invocation as observed by the caller, in request order.
#[derive(Debug, Clone)]
pub struct ToolCallFact {
    pub name: String,
    /// Truncated rendering of the argument map.
    pub arguments: String,
    pub success: bool,
    pub error: Option<String>,
    /// Truncated output, present on success.
    pub output: Option<String>,
}

/// What every run returns: best-effort text, a status, and the full
/// ordered list of tool-call facts. "No result" is never an outcome.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub output: String,
    pub status: AgentStatus,
    pub tool_calls: Vec<ToolCallFact>,
}

/// Bounds a preview string to [`PREVIEW_WIDTH`] characters, marking the
/// cut with an ellipsis. Operates on characters, not bytes.
pub fn truncate_preview(text: &str) -> String {
    let mut chars = text.chars();
    let preview: String = chars.by_ref().take(PREVIEW_WIDTH).collect();
    if chars.next().is_some() {
        format!("{}…", preview)
    } else {
        preview
    }
}
