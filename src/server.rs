//! Line-delimited JSON-RPC 2.0 over stdio.
//!
//! One request per line in, one response per line out. Requests run
//! concurrently; a single writer task serializes the responses, so their
//! order follows completion, not arrival.

use std::sync::Arc;

use anyhow::Result;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::gateway::ExecutionGateway;

pub const TOOL_NAME: &str = "runJavaScript";

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct RunArguments {
    code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreSecretParams {
    value: SecretString,
    #[serde(default)]
    read_once: bool,
}

/// A JSON-RPC error object, before it is tied to a request id.
#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_params(e: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {e}"))
    }
}

pub struct Server {
    gateway: Arc<ExecutionGateway>,
}

impl Server {
    pub fn new(gateway: Arc<ExecutionGateway>) -> Self {
        Self { gateway }
    }

    /// Serves requests from `reader` until it reaches end of input, then
    /// waits for in-flight requests to finish writing their responses.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);

        let write_handle = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = out_rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let server = Arc::clone(&self);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_line(&line).await {
                    if out_tx.send(response.to_string()).await.is_err() {
                        warn!("Response dropped: output closed");
                    }
                }
            });
        }
        info!("Input closed, waiting for pending requests");

        drop(out_tx);
        write_handle.await??;
        Ok(())
    }

    /// Handles one raw line. Returns `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unparseable request: {e}");
                return Some(error_response(
                    Value::Null,
                    RpcError::new(PARSE_ERROR, format!("parse error: {e}")),
                ));
            }
        };
        self.handle_request(request).await
    }

    async fn handle_request(&self, request: Request) -> Option<Value> {
        let Some(id) = request.id else {
            debug!("Notification {}", request.method);
            return None;
        };
        debug!("Request {id}: {}", request.method);

        let outcome = match request.method.as_str() {
            "initialize" => Ok(initialize_result()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": [tool_descriptor()] })),
            "tools/call" => self.call_tool(request.params).await,
            "secrets/store" => self.store_secret(request.params),
            other => Err(RpcError::new(METHOD_NOT_FOUND, format!("method not found: {other}"))),
        };

        Some(match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(e) => error_response(id, e),
        })
    }

    async fn call_tool(&self, params: Value) -> Result<Value, RpcError> {
        let params: ToolCallParams = serde_json::from_value(params).map_err(RpcError::invalid_params)?;
        if params.name != TOOL_NAME {
            return Err(RpcError::new(INVALID_PARAMS, format!("unknown tool: {}", params.name)));
        }
        let args: RunArguments = serde_json::from_value(params.arguments).map_err(RpcError::invalid_params)?;

        let (text, is_error) = match self.gateway.run(&args.code).await {
            Ok(output) => (output, false),
            Err(failure) => (failure.message, true),
        };
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        }))
    }

    fn store_secret(&self, params: Value) -> Result<Value, RpcError> {
        let params: StoreSecretParams = serde_json::from_value(params).map_err(RpcError::invalid_params)?;
        // Ingestion failures are reported generically
        self.gateway
            .store_secret(params.value, params.read_once)
            .map(Value::String)
            .map_err(|e| {
                warn!("Secret ingestion failed: {e}");
                RpcError::new(INVALID_PARAMS, "secret could not be stored")
            })
    }
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": error.code, "message": error.message },
    })
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn tool_descriptor() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Run JavaScript in a sandbox and return the result as text. \
            The global `fetch(url, options)` makes HTTP requests; await it, and await \
            response.text() or response.json(). Write `runjs:secret:<id>` wherever a \
            stored secret should be used; the value is filled in inside the sandbox only. \
            The final expression, or a top-level `return`, is the result.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "JavaScript source" }
            },
            "required": ["code"],
        },
    })
}
