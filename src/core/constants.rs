//! Shared constants used across the runtime.

/// Upper bound on reasoning-loop iterations for a single run.
pub const DEFAULT_MAX_ITERATIONS: usize = 8;

/// Tool executions without a contract timeout fall back to this bound.
pub const DEFAULT_TOOL_TIMEOUT_SECONDS: u64 = 30;

/// One protocol round trip to a remote tool server is bounded by this.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 60;

/// Per-task conversation turns retained in the run-state document.
pub const DEFAULT_HISTORY_TURNS: usize = 20;

/// Blocked tool results needed before a run terminates as blocked.
pub const BLOCKED_STOP_THRESHOLD: usize = 2;

/// Consecutive all-failed, text-free iterations before a run aborts.
pub const MAX_CONSECUTIVE_FAILED_BATCHES: usize = 3;

/// Width of argument/output previews in tool-call facts and summaries.
pub const PREVIEW_WIDTH: usize = 120;

/// Registry names for remote tool adapters are truncated to this length.
pub const TOOL_NAME_MAX_LEN: usize = 64;

/// Recent message ids retained per conversation in the shared services.
pub const RECENT_MESSAGES_PER_CHAT: usize = 32;

/// Inbound protocol frames larger than this are discarded.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Protocol version advertised during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
