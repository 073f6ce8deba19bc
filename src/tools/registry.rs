//! Central capability catalog.
//!
//! The registry merges in-process providers and remote adapters behind one
//! interface, validates arguments before any provider runs, bounds every
//! execution with a timeout, and decides whether a batch may dispatch in
//! parallel. After construction it never raises: every failure becomes a
//! structured [`ToolResult`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future;
use serde_json::{Map, Value};
use tracing::debug;

use crate::api::{ChatToolDefinition, ChatToolFunction};
use crate::core::constants::DEFAULT_TOOL_TIMEOUT_SECONDS;
use crate::core::services::SharedServices;
use crate::tools::{AllowList, Tool, ToolCall, ToolContext, ToolResult, ToolSpec};

/// Registration is the only phase where a programmer error may surface.
#[derive(Debug)]
pub enum RegistryError {
    /// Another provider already registered this effective name.
    DuplicateName(String),

    /// The contract's parameter schema root is not an object.
    InvalidSchema { tool: String, reason: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateName(name) => {
                write!(f, "A tool named '{name}' is already registered")
            }
            RegistryError::InvalidSchema { tool, reason } => {
                write!(f, "Invalid parameter schema for tool '{tool}': {reason}")
            }
        }
    }
}

impl StdError for RegistryError {}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    specs: HashMap<String, ToolSpec>,
    /// Registration order, used for stable definition listings.
    order: Vec<String>,
    services: Arc<SharedServices>,
    default_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(services: Arc<SharedServices>) -> Self {
        Self {
            tools: HashMap::new(),
            specs: HashMap::new(),
            order: Vec::new(),
            services,
            default_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECONDS),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn register(&mut self, mut tool: Box<dyn Tool>) -> Result<(), RegistryError> {
        let mut spec = tool.spec();
        let effective_name = match tool.name_prefix() {
            Some(prefix) => format!("{prefix}{}", spec.name),
            None => spec.name.clone(),
        };

        if self.tools.contains_key(&effective_name) {
            return Err(RegistryError::DuplicateName(effective_name));
        }
        let root_type = spec.parameters.get("type").and_then(Value::as_str);
        if root_type != Some("object") {
            return Err(RegistryError::InvalidSchema {
                tool: effective_name,
                reason: format!(
                    "root type must be \"object\", got {}",
                    root_type.unwrap_or("none")
                ),
            });
        }

        tool.bind(self.services.clone());
        spec.name = effective_name.clone();
        debug!(tool = %effective_name, "Registered tool");
        self.specs.insert(effective_name.clone(), spec);
        self.order.push(effective_name.clone());
        self.tools.insert(effective_name, Arc::from(tool));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    /// Registered names permitted by the allow-list, in registration order.
    pub fn tool_names(&self, allow_list: &AllowList) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| allow_list.permits(name))
            .cloned()
            .collect()
    }

    /// Renders the allowed contracts into the model-facing tool envelope.
    pub fn definitions(&self, allow_list: &AllowList) -> Vec<ChatToolDefinition> {
        self.order
            .iter()
            .filter(|name| allow_list.permits(name))
            .filter_map(|name| self.specs.get(name))
            .map(|spec| ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: spec.name.clone(),
                    description: (!spec.description.is_empty())
                        .then(|| spec.description.clone()),
                    parameters: spec.parameters.clone(),
                },
            })
            .collect()
    }

    /// Executes one call, yielding exactly one result on every path.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        context: &ToolContext,
    ) -> ToolResult {
        if !context.allow_list.permits(name) {
            return ToolResult::fail(format!("Tool '{name}' is not permitted for this run."));
        }
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::unknown_tool(name);
        };
        let spec = &self.specs[name];

        let violations = validate_arguments(&spec.parameters, &arguments);
        if !violations.is_empty() {
            return ToolResult::fail(format!(
                "Invalid arguments for '{name}': {}.",
                violations.join("; ")
            ))
            .with_meta(
                "validation",
                Value::Array(violations.into_iter().map(Value::String).collect()),
            );
        }

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let tool = tool.clone();
        let call_context = context.clone();
        // Spawned so a panicking provider surfaces as a JoinError instead
        // of unwinding through the registry.
        let mut handle = tokio::spawn(async move { tool.execute(arguments, call_context).await });
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                ToolResult::fail(format!("Tool '{name}' execution failed: {join_err}."))
            }
            Err(_) => {
                handle.abort();
                ToolResult::fail(format!(
                    "Tool '{name}' timed out after {}s.",
                    timeout.as_secs()
                ))
            }
        }
    }

    /// Dispatches a batch, preserving input order in the returned results.
    ///
    /// The batch runs concurrently only when every call names a resolvable,
    /// allowed, parallel-safe tool; a single call that misses any of those
    /// conditions forces the whole batch onto the sequential path. That
    /// all-or-nothing rule is what keeps a side-effecting tool from racing
    /// another tool in the same turn.
    pub async fn execute_many(
        &self,
        calls: &[ToolCall],
        context: &ToolContext,
    ) -> Vec<ToolResult> {
        let all_parallel_safe = calls.iter().all(|call| {
            context.allow_list.permits(&call.name)
                && self
                    .specs
                    .get(&call.name)
                    .is_some_and(|spec| spec.parallel_safe)
        });

        if all_parallel_safe {
            future::join_all(
                calls
                    .iter()
                    .map(|call| self.execute(&call.name, call.arguments.clone(), context)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results
                    .push(self.execute(&call.name, call.arguments.clone(), context).await);
            }
            results
        }
    }
}

/// Checks required fields, primitive types, and enum membership, reporting
/// every violation at once. Properties outside the schema pass through.
fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Vec<String> {
    let mut violations = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !arguments.contains_key(field) {
                violations.push(format!("missing required field '{field}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return violations;
    };
    for (field, property) in properties {
        let Some(value) = arguments.get(field) else {
            continue;
        };
        if let Some(expected) = property.get("type").and_then(Value::as_str) {
            if !value_matches_type(value, expected) {
                violations.push(format!("field '{field}' must be of type {expected}"));
            }
        }
        if let Some(allowed) = property.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
                violations.push(format!(
                    "field '{field}' must be one of [{}]",
                    options.join(", ")
                ));
            }
        }
    }

    violations
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords never fail a call.
        _ => true,
    }
}
