//! HTTP transport for remote tool servers.
//!
//! Every protocol message is a POST of one JSON-RPC envelope to the
//! server's single endpoint; the response body carries the matching
//! envelope. Connections are pooled by the underlying client, so
//! `start`/`stop` only build and drop that client.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::config::McpServerConfig;
use crate::core::constants::DEFAULT_REQUEST_TIMEOUT_SECONDS;
use crate::mcp::protocol::{
    call_tool_params, initialize_params, parse_tool_list, render_tool_content, JsonRpcRequest,
    JsonRpcResponse, RemoteToolInfo, METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_LIST_TOOLS,
};

use super::McpTransport;

pub struct HttpTransport {
    config: McpServerConfig,
    next_request_id: AtomicI64,
    client: tokio::sync::Mutex<Option<reqwest::Client>>,
}

impl HttpTransport {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            next_request_id: AtomicI64::new(1),
            client: tokio::sync::Mutex::new(None),
        }
    }

    fn endpoint(&self) -> Result<String, String> {
        self.config
            .base_url
            .clone()
            .ok_or_else(|| format!("Server '{}' has no base URL.", self.config.id))
    }

    fn build_client(&self) -> Result<reqwest::Client, String> {
        let request_timeout = Duration::from_secs(
            self.config
                .timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        );
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|err| format!("Failed to build HTTP client: {}", err))
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<reqwest::Response, String> {
        let endpoint = self.endpoint()?;
        let client = {
            let guard = self.client.lock().await;
            guard
                .clone()
                .ok_or_else(|| format!("Server '{}' is not started.", self.config.id))?
        };

        let mut builder = client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(request);
        if let Some(headers) = &self.config.headers {
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|err| format!("Request to '{}' failed: {}", self.config.id, err))?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        Ok(response)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let response = self.post(&request).await?;
        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|err| format!("Invalid response from '{}': {}", self.config.id, err))?;
        envelope.into_result()
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), String> {
        let request = JsonRpcRequest::notification(method, params);
        // Notification responses carry no envelope worth reading.
        self.post(&request).await.map(|_| ())
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn start(&self) -> Result<(), String> {
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.build_client()?);
        Ok(())
    }

    async fn initialize(&self) -> Result<(), String> {
        self.request(METHOD_INITIALIZE, initialize_params()).await?;
        if let Err(err) = self.notify(METHOD_INITIALIZED, Value::Null).await {
            debug!("[{}] initialized notification failed: {}", self.config.id, err);
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, String> {
        let result = self.request(METHOD_LIST_TOOLS, Value::Null).await?;
        parse_tool_list(result)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, String> {
        let result = self
            .request(METHOD_CALL_TOOL, call_tool_params(name, arguments))
            .await?;
        let rendered = render_tool_content(&result);
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(rendered);
        }
        Ok(rendered)
    }

    async fn stop(&self) {
        self.client.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn server_config(base_url: String) -> McpServerConfig {
        McpServerConfig {
            id: "alpha".to_string(),
            display_name: "Alpha".to_string(),
            transport: Some("http".to_string()),
            command: None,
            args: None,
            env: None,
            base_url: Some(base_url),
            headers: None,
            timeout_seconds: Some(5),
            enabled: None,
        }
    }

    /// Serves one connection, returning the captured request bytes.
    async fn one_shot_server(status_line: &'static str, body: String) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        let (capture_tx, capture_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = vec![0u8; 16 * 1024];
            let read = stream.read(&mut buffer).await.expect("read");
            let request = String::from_utf8_lossy(&buffer[..read]).to_string();
            let response = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.expect("write");
            let _ = capture_tx.send(request);
        });
        (format!("http://{}", address), capture_rx)
    }

    #[tokio::test]
    async fn tool_calls_post_one_envelope_and_render_text() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": "42"}]}
        })
        .to_string();
        let (base_url, capture) = one_shot_server("HTTP/1.1 200 OK", body).await;

        let transport = HttpTransport::new(server_config(base_url));
        transport.start().await.expect("start");

        let mut arguments = Map::new();
        arguments.insert("query".to_string(), json!("meaning of life"));
        let output = transport
            .call_tool("search", &arguments)
            .await
            .expect("call succeeds");
        assert_eq!(output, "42");

        let request = capture.await.expect("request captured");
        assert!(request.contains("\"method\":\"tools/call\""));
        assert!(request.contains("\"name\":\"search\""));
        assert!(request.contains("meaning of life"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (base_url, _capture) =
            one_shot_server("HTTP/1.1 500 Internal Server Error", String::new()).await;

        let transport = HttpTransport::new(server_config(base_url));
        transport.start().await.expect("start");

        let err = transport.list_tools().await.expect_err("should fail");
        assert!(err.contains("HTTP error"));
        assert!(err.contains("500"));
    }

    #[tokio::test]
    async fn tool_result_error_flag_becomes_a_failure() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "isError": true,
                "content": [{"type": "text", "text": "disk on fire"}]
            }
        })
        .to_string();
        let (base_url, _capture) = one_shot_server("HTTP/1.1 200 OK", body).await;

        let transport = HttpTransport::new(server_config(base_url));
        transport.start().await.expect("start");

        let mut arguments = Map::new();
        arguments.insert("path".to_string(), json!("/tmp"));
        let err = transport
            .call_tool("scan", &arguments)
            .await
            .expect_err("flagged error");
        assert_eq!(err, "disk on fire");
    }

    #[tokio::test]
    async fn configured_headers_ride_along() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}).to_string();
        let (base_url, capture) = one_shot_server("HTTP/1.1 200 OK", body).await;

        let mut config = server_config(base_url);
        let mut headers = std::collections::HashMap::new();
        headers.insert("X-Api-Key".to_string(), "sesame".to_string());
        config.headers = Some(headers);

        let transport = HttpTransport::new(config);
        transport.start().await.expect("start");
        let tools = transport.list_tools().await.expect("list");
        assert!(tools.is_empty());

        let request = capture.await.expect("request captured");
        assert!(request.to_lowercase().contains("x-api-key: sesame"));
    }
}
