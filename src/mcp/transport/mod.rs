//! Transport abstractions for remote tool servers.
//!
//! One interface, two backends: a spawned child process speaking the
//! dual-framed byte-stream protocol, or plain HTTP POSTs against one
//! endpoint. Implementations normalize failures into `Err(String)` so the
//! manager can isolate one server's trouble from another's.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::config::McpServerConfig;
use crate::mcp::protocol::RemoteToolInfo;

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioClient;

/// Supported transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    Stdio,
    Http,
}

impl McpTransportKind {
    pub fn from_config(config: &McpServerConfig) -> Result<Self, String> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("stdio")
            .to_ascii_lowercase();
        match transport.as_str() {
            "stdio" | "stream" => Ok(McpTransportKind::Stdio),
            "http" => Ok(McpTransportKind::Http),
            other => Err(format!("Unsupported transport: {}", other)),
        }
    }
}

/// Contract shared by both transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establishes the connection. Idempotent: a started transport stays
    /// started.
    async fn start(&self) -> Result<(), String>;

    /// Best-effort handshake; a failure here must not block later calls.
    async fn initialize(&self) -> Result<(), String>;

    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, String>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, String>;

    /// Tears the connection down. Never fails.
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(transport: Option<&str>) -> McpServerConfig {
        McpServerConfig {
            id: "alpha".to_string(),
            display_name: "Alpha".to_string(),
            transport: transport.map(str::to_string),
            command: None,
            args: None,
            env: None,
            base_url: None,
            headers: None,
            timeout_seconds: None,
            enabled: None,
        }
    }

    #[test]
    fn transport_kind_resolution() {
        assert_eq!(
            McpTransportKind::from_config(&config(Some("stdio"))),
            Ok(McpTransportKind::Stdio)
        );
        assert_eq!(
            McpTransportKind::from_config(&config(Some("stream"))),
            Ok(McpTransportKind::Stdio)
        );
        assert_eq!(
            McpTransportKind::from_config(&config(Some("HTTP"))),
            Ok(McpTransportKind::Http)
        );
        assert_eq!(
            McpTransportKind::from_config(&config(None)),
            Ok(McpTransportKind::Stdio)
        );
        assert!(McpTransportKind::from_config(&config(Some("carrier-pigeon"))).is_err());
    }
}
