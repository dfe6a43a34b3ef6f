//! Minimal JSON-RPC 2.0 client over a child's stdio
//!
//! Requests are correlated by numeric ID. Frames that are not responses to
//! our requests (notifications and server-initiated requests) are forwarded
//! unchanged so a [`StreamDecoder`](super::process::StreamDecoder) can read
//! them like any other NDJSON stream.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// Failure of a single request
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("{0} timed out")]
    Timeout(String),

    #[error("connection closed before {0} completed")]
    Closed(String),

    #[error("{method} failed ({code}): {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },
}

/// Request side of a JSON-RPC connection
pub struct JsonRpcClient {
    writer: mpsc::UnboundedSender<String>,
    pending: Pending,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// Route `frames` through the client. Returns the client and the stream
    /// of frames that were not responses.
    pub fn attach(
        writer: mpsc::UnboundedSender<String>,
        mut frames: mpsc::Receiver<String>,
    ) -> (Self, mpsc::Receiver<String>) {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, out_rx) = mpsc::channel(256);

        let routing = pending.clone();
        tokio::spawn(async move {
            while let Some(line) = frames.recv().await {
                if let Some((id, result)) = as_response(&line) {
                    let waiter = routing.lock().ok().and_then(|mut p| p.remove(&id));
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(result);
                        continue;
                    }
                }
                if out_tx.send(line).await.is_err() {
                    break;
                }
            }
            // Dropping waiters wakes every in-flight request with Closed
            if let Ok(mut p) = routing.lock() {
                p.clear();
            }
        });

        (
            Self {
                writer,
                pending,
                next_id: AtomicU64::new(1),
            },
            out_rx,
        )
    }

    /// Send a request and wait for its response
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, tx);
        }

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if self.writer.send(frame.to_string()).is_err() {
            self.forget(id);
            return Err(RpcError::Closed(method.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(RpcError::Remote { code, message, .. }))) => Err(RpcError::Remote {
                method: method.to_string(),
                code,
                message,
            }),
            Ok(Ok(Err(other))) => Err(other),
            Ok(Err(_)) => Err(RpcError::Closed(method.to_string())),
            Err(_) => {
                self.forget(id);
                Err(RpcError::Timeout(method.to_string()))
            }
        }
    }

    /// Fire-and-forget notification
    pub fn notify(&self, method: &str, params: Option<Value>) -> bool {
        let mut frame = json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            frame["params"] = params;
        }
        self.writer.send(frame.to_string()).is_ok()
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&id);
        }
    }
}

/// Error response for a server-initiated request we do not serve
pub fn method_not_found(id: &Value, method: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32601, "message": format!("{} is not supported by this client", method) }
    })
    .to_string()
}

/// Parse `line` as a response to one of our numeric-ID requests
fn as_response(line: &str) -> Option<(u64, Result<Value, RpcError>)> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    let id = value.get("id")?.as_u64()?;
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Some((
            id,
            Err(RpcError::Remote {
                method: String::new(),
                code,
                message,
            }),
        ));
    }
    Some((id, Ok(value.get("result").cloned().unwrap_or(Value::Null))))
}
