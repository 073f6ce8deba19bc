//! Capability contracts, providers, and execution results.
//!
//! A capability ("tool") is a named, schema-described operation an agent run
//! may request. In-process providers implement [`Tool`]; remote adapters
//! created by the MCP manager satisfy the same contract, so the registry
//! depends only on this interface.

use std::any::Any;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::services::SharedServices;

pub mod registry;

pub use registry::{RegistryError, ToolRegistry};

/// How much damage a misused invocation of this capability could do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// Schema describing one callable operation.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Registry-unique name (an optional provider prefix is prepended at
    /// registration).
    pub name: String,
    pub description: String,
    /// JSON parameter schema; the root type must be "object".
    pub parameters: Value,
    /// Execution bound; the registry default applies when absent.
    pub timeout: Option<Duration>,
    pub risk: RiskTier,
    /// Whether this tool may run concurrently with others in a batch.
    pub parallel_safe: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({"type": "object", "properties": {}}),
            timeout: None,
            risk: RiskTier::Low,
            parallel_safe: true,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_risk(mut self, risk: RiskTier) -> Self {
        self.risk = risk;
        self
    }

    /// Marks the tool as side-effecting: batches containing it run
    /// strictly sequentially.
    pub fn sequential(mut self) -> Self {
        self.parallel_safe = false;
        self
    }
}

/// One tool invocation as requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The single result type every path through the registry produces.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub meta: Option<Map<String, Value>>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            meta: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            meta: None,
        }
    }

    /// A policy refusal: not a technical failure, and never worth retrying.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::fail(reason).with_meta("blocked", Value::Bool(true))
    }

    /// The distinct failure class for a name the registry cannot resolve.
    pub fn unknown_tool(name: &str) -> Self {
        Self::fail(format!("Unknown tool '{name}'."))
            .with_meta("unknown_tool", Value::Bool(true))
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    fn meta_flag(&self, key: &str) -> bool {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_blocked(&self) -> bool {
        self.meta_flag("blocked")
    }

    pub fn is_unknown_tool(&self) -> bool {
        self.meta_flag("unknown_tool")
    }
}

/// The subset of registered capability names permitted for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowList {
    All,
    None,
    Only(BTreeSet<String>),
}

impl AllowList {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowList::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn permits(&self, name: &str) -> bool {
        match self {
            AllowList::All => true,
            AllowList::None => false,
            AllowList::Only(names) => names.contains(name),
        }
    }
}

/// Per-run execution context handed to every provider.
#[derive(Clone)]
pub struct ToolContext {
    /// Working-directory root for file-producing tools.
    pub workdir: PathBuf,
    /// Root for durable artifacts (run state, caches).
    pub state_root: PathBuf,
    /// Session/task identifier of the run requesting the execution.
    pub task_id: String,
    pub allow_list: AllowList,
    pub services: Arc<SharedServices>,
    /// Opaque handle back to the hosting application; a minority of
    /// providers downcast it to message the end user directly.
    pub host: Option<Arc<dyn Any + Send + Sync>>,
}

impl ToolContext {
    pub fn new(
        workdir: impl Into<PathBuf>,
        state_root: impl Into<PathBuf>,
        task_id: impl Into<String>,
        services: Arc<SharedServices>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            state_root: state_root.into(),
            task_id: task_id.into(),
            allow_list: AllowList::All,
            services,
            host: None,
        }
    }

    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn Any + Send + Sync>) -> Self {
        self.host = Some(host);
        self
    }
}

/// A capability provider: one contract, one execution path.
///
/// Providers are stateless except through the injected [`SharedServices`];
/// anything else they need arrives in the per-call [`ToolContext`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, arguments: Map<String, Value>, context: ToolContext) -> ToolResult;

    /// Optional prefix prepended to the contract name at registration.
    fn name_prefix(&self) -> Option<&str> {
        None
    }

    /// Called once at registration with the process-wide shared services.
    fn bind(&mut self, _services: Arc<SharedServices>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_and_unknown_flags_are_distinct() {
        let blocked = ToolResult::blocked("policy says no");
        assert!(!blocked.success);
        assert!(blocked.is_blocked());
        assert!(!blocked.is_unknown_tool());

        let unknown = ToolResult::unknown_tool("ghost");
        assert!(unknown.is_unknown_tool());
        assert!(!unknown.is_blocked());
        assert_eq!(unknown.error.as_deref(), Some("Unknown tool 'ghost'."));
    }

    #[test]
    fn allow_list_sentinels() {
        assert!(AllowList::All.permits("anything"));
        assert!(!AllowList::None.permits("anything"));

        let some = AllowList::only(["echo", "search"]);
        assert!(some.permits("echo"));
        assert!(!some.permits("delete"));
    }
}
