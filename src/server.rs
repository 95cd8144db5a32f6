//! MCP tool server.
//!
//! Exposes the tool registry over a stateless JSON-RPC 2.0 endpoint at
//! `POST /mcp/jsonrpc`, plus a `GET /health` probe. The framing is the
//! small MCP subset the retrieval layer needs:
//!
//! | Method | Result |
//! |--------|--------|
//! | `initialize` | server info and capabilities |
//! | `tools/list` | tool descriptors with parameter schemas |
//! | `tools/call` | tool output as text content, or an error result |
//!
//! Input problems become tool error results (`isError: true`); only an
//! unknown method or a malformed request produces a JSON-RPC error
//! object. Handlers are stateless, so concurrent requests need no
//! coordination beyond the shared store pool.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::tools::{ToolContext, ToolRegistry};

/// Shared state for all route handlers.
#[derive(Clone)]
struct AppState {
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
}

/// Build the tool-server router.
pub fn router(registry: ToolRegistry, ctx: ToolContext) -> Router {
    let state = AppState {
        registry: Arc::new(registry),
        ctx: Arc::new(ctx),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/mcp/jsonrpc", post(handle_jsonrpc))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Run the tool server until the process terminates.
pub async fn run_server(
    bind: &str,
    registry: ToolRegistry,
    ctx: ToolContext,
) -> anyhow::Result<()> {
    let app = router(registry, ctx);

    tracing::info!(bind, "MCP server listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

const METHOD_NOT_FOUND: i64 = -32601;

fn success(id: Option<Value>, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn rpc_error(id: Option<Value>, code: i64, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.into(),
        }),
    }
}

/// Wrap tool output in an MCP content result.
fn tool_result(value: &Value) -> Value {
    let text = serde_json::to_string_pretty(value).unwrap_or_default();
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": false,
    })
}

/// Wrap a tool failure in an MCP error result (not a transport fault).
fn tool_error(message: &str) -> Value {
    json!({
        "content": [{"type": "text", "text": message}],
        "isError": true,
    })
}

async fn handle_jsonrpc(
    State(state): State<AppState>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    let response = match request.method.as_str() {
        "initialize" => success(
            request.id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "platform-fabric",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        // Notifications carry no id and expect no meaningful reply.
        "notifications/initialized" => success(request.id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = state
                .registry
                .tools()
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name(),
                        "description": tool.description(),
                        "inputSchema": tool.parameters_schema(),
                    })
                })
                .collect();
            success(request.id, json!({"tools": tools}))
        }
        "tools/call" => {
            let name = request.params["name"].as_str().unwrap_or("");
            let Some(tool) = state.registry.find(name) else {
                return Json(rpc_error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("no tool registered with name: {}", name),
                ));
            };
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));

            match tool.execute(arguments, &state.ctx).await {
                Ok(value) => success(request.id, tool_result(&value)),
                Err(err) => {
                    tracing::warn!(tool = name, error = %err, "tool call failed");
                    success(request.id, tool_error(&err.to_string()))
                }
            }
        }
        other => rpc_error(
            request.id,
            METHOD_NOT_FOUND,
            format!("unknown method: {}", other),
        ),
    };

    Json(response)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_wraps_json_text() {
        let value = json!({"hits": 2});
        let wrapped = tool_result(&value);
        assert_eq!(wrapped["isError"], json!(false));
        let text = wrapped["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("\"hits\": 2"));
    }

    #[test]
    fn test_tool_error_is_result_not_fault() {
        let wrapped = tool_error("pr_number must be positive");
        assert_eq!(wrapped["isError"], json!(true));
        assert_eq!(
            wrapped["content"][0]["text"],
            json!("pr_number must be positive")
        );
    }

    #[test]
    fn test_request_decoding_defaults() {
        let request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/list"
        }))
        .unwrap();
        assert_eq!(request.method, "tools/list");
        assert!(request.params.is_null());
    }
}
