//! Lifecycle and discovery coordinator for configured remote tool servers.
//!
//! One manager owns every transport. Server failures are isolated: an
//! unreachable or misconfigured server is logged and skipped while the
//! rest keep working. Discovery results are cached on disk so adapters for
//! previously seen tools can be registered before any server answers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::config::{Config, McpServerConfig};
use crate::core::constants::TOOL_NAME_MAX_LEN;
use crate::mcp::cache::{ToolCache, ToolSnapshot};
use crate::mcp::protocol::RemoteToolInfo;
use crate::mcp::transport::{HttpTransport, McpTransport, McpTransportKind, StdioClient};
use crate::tools::{RiskTier, Tool, ToolContext, ToolRegistry, ToolResult, ToolSpec};

pub struct McpManager {
    servers: Vec<McpServerConfig>,
    clients: HashMap<String, Arc<dyn McpTransport>>,
    cache: ToolCache,
    known: ToolSnapshot,
}

impl McpManager {
    pub fn from_config(config: &Config) -> Self {
        let cache = ToolCache::new(&config.state_root());
        let known = cache.load();
        Self {
            servers: config
                .mcp_servers
                .iter()
                .filter(|server| server.is_enabled())
                .cloned()
                .collect(),
            clients: HashMap::new(),
            cache,
            known,
        }
    }

    /// Tools known from the cache and from discovery, keyed by server id.
    pub fn known_tools(&self) -> &ToolSnapshot {
        &self.known
    }

    /// Builds and starts a transport for every enabled server that does
    /// not have one yet. Failures are logged per server and never block
    /// the others; a failed server is retried on the next call.
    pub async fn ensure_started(&mut self) {
        for server in &self.servers {
            if self.clients.contains_key(&server.id) {
                continue;
            }
            let client: Arc<dyn McpTransport> = match McpTransportKind::from_config(server) {
                Ok(McpTransportKind::Stdio) => Arc::new(StdioClient::new(server.clone())),
                Ok(McpTransportKind::Http) => Arc::new(HttpTransport::new(server.clone())),
                Err(err) => {
                    warn!("Skipping server '{}': {}", server.id, err);
                    continue;
                }
            };
            if let Err(err) = client.start().await {
                warn!("Failed to start server '{}': {}", server.id, err);
                continue;
            }
            if let Err(err) = client.initialize().await {
                warn!("Handshake with '{}' failed: {}", server.id, err);
            }
            self.clients.insert(server.id.clone(), client);
        }
    }

    /// Polls every started server for its tool listing. Fresh results are
    /// merged into the known set without removing cached entries; the
    /// cache is rewritten only when every configured server answered.
    pub async fn list_all_tools(&mut self) -> &ToolSnapshot {
        let mut all_succeeded = true;
        for server in &self.servers {
            let Some(client) = self.clients.get(&server.id) else {
                all_succeeded = false;
                continue;
            };
            match client.list_tools().await {
                Ok(tools) => {
                    debug!("Server '{}' listed {} tools", server.id, tools.len());
                    merge_tools(self.known.entry(server.id.clone()).or_default(), tools);
                }
                Err(err) => {
                    warn!("Tool listing from '{}' failed: {}", server.id, err);
                    all_succeeded = false;
                }
            }
        }
        if all_succeeded && !self.servers.is_empty() {
            if let Err(err) = self.cache.store(&self.known) {
                warn!("Failed to persist tool cache: {}", err);
            }
        }
        &self.known
    }

    /// Registers an adapter for every known remote tool whose server has a
    /// started transport. Returns the number of adapters registered.
    pub fn register_tools(&self, registry: &mut ToolRegistry) -> usize {
        let mut taken: HashSet<String> = HashSet::new();
        let mut registered = 0;
        for (server_id, tools) in &self.known {
            let Some(client) = self.clients.get(server_id) else {
                debug!("Server '{}' not started; its tools stay unregistered", server_id);
                continue;
            };
            let timeout = self
                .servers
                .iter()
                .find(|server| &server.id == server_id)
                .and_then(|server| server.timeout_seconds)
                .map(Duration::from_secs);
            for tool in tools {
                let name = adapter_tool_name(server_id, &tool.name, |candidate| {
                    taken.contains(candidate) || registry.contains(candidate)
                });
                taken.insert(name.clone());
                let adapter = RemoteTool::new(
                    name,
                    server_id.clone(),
                    tool.clone(),
                    Arc::clone(client),
                    timeout,
                );
                match registry.register(Box::new(adapter)) {
                    Ok(()) => registered += 1,
                    Err(err) => {
                        warn!("Could not register '{}/{}': {}", server_id, tool.name, err)
                    }
                }
            }
        }
        registered
    }

    pub async fn stop_all(&mut self) {
        for (server_id, client) in self.clients.drain() {
            debug!("Stopping server '{}'", server_id);
            client.stop().await;
        }
    }
}

/// Adapter exposing one remote tool through the local capability contract.
/// Remote execution is opaque, so every adapter is treated as
/// side-effecting and runs sequentially within a batch.
struct RemoteTool {
    spec: ToolSpec,
    server_id: String,
    remote_name: String,
    transport: Arc<dyn McpTransport>,
}

impl RemoteTool {
    fn new(
        name: String,
        server_id: String,
        info: RemoteToolInfo,
        transport: Arc<dyn McpTransport>,
        timeout: Option<Duration>,
    ) -> Self {
        let mut spec = ToolSpec::new(name, info.description)
            .with_parameters(guard_schema(info.input_schema))
            .with_risk(RiskTier::Medium)
            .sequential();
        spec.timeout = timeout;
        Self {
            spec,
            server_id,
            remote_name: info.name,
            transport,
        }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn execute(&self, arguments: Map<String, Value>, _context: ToolContext) -> ToolResult {
        match self.transport.call_tool(&self.remote_name, &arguments).await {
            Ok(output) => ToolResult::ok(output),
            Err(err) => ToolResult::fail(format!(
                "Remote tool '{}' on '{}' failed: {}",
                self.remote_name, self.server_id, err
            )),
        }
    }
}

/// Replaces a schema whose root is not an object; the registry rejects
/// anything else.
fn guard_schema(schema: Value) -> Value {
    let is_object_root = schema
        .as_object()
        .map(|root| {
            root.get("type")
                .and_then(Value::as_str)
                .map_or(true, |kind| kind == "object")
        })
        .unwrap_or(false);
    if is_object_root {
        schema
    } else {
        serde_json::json!({"type": "object", "properties": {}})
    }
}

/// Derives the registry name for a remote tool: `mcp_{server}_{tool}`
/// restricted to `[A-Za-z0-9_-]`, underscore runs collapsed, trimmed,
/// truncated, with `_2`, `_3`, ... appended on collision.
pub(crate) fn adapter_tool_name(
    server_id: &str,
    tool_name: &str,
    is_taken: impl Fn(&str) -> bool,
) -> String {
    let raw = format!("mcp_{}_{}", server_id, tool_name);
    let mut base = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for ch in raw.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '-' {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        base.push(mapped);
    }
    let mut base = base.trim_matches('_').to_string();
    base.truncate(TOOL_NAME_MAX_LEN);

    if !is_taken(&base) {
        return base;
    }
    for ordinal in 2.. {
        let suffix = format!("_{}", ordinal);
        let mut candidate = base.clone();
        candidate.truncate(TOOL_NAME_MAX_LEN - suffix.len());
        candidate.push_str(&suffix);
        if !is_taken(&candidate) {
            return candidate;
        }
    }
    unreachable!("collision counter exhausted")
}

/// Updates existing entries by name and appends new ones; tools absent
/// from the fresh listing are retained until the cache is rebuilt.
fn merge_tools(known: &mut Vec<RemoteToolInfo>, fresh: Vec<RemoteToolInfo>) {
    for tool in fresh {
        match known.iter_mut().find(|existing| existing.name == tool.name) {
            Some(existing) => *existing = tool,
            None => known.push(tool),
        }
    }
}
