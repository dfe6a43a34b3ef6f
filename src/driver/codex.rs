//! Codex driver
//!
//! Codex is driven through `codex app-server`, a JSON-RPC 2.0 server on
//! stdio. A run is one thread with one turn:
//!
//! ```text
//! initialize ─▶ initialized ─▶ thread/start ─▶ turn/start ─▶ ... ─▶ turn/completed
//! ```
//!
//! Once the turn completes stdin is closed and the server exits on its own.

use super::jsonrpc::{self, JsonRpcClient, RpcError};
use super::process::{self, Decoded, Finish, ProcessSpec, StreamDecoder, Supervised};
use super::{AgentEvent, Driver, DriverSettings, LaunchSpec, Session};
use crate::error::{Error, Result};
use crate::run::{AgentKind, Command, ModelDescriptor, ModelInventory};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Deadline for each handshake request
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on `model/list` pages
const MAX_MODEL_PAGES: usize = 20;

pub struct CodexDriver {
    settings: DriverSettings,
}

/// A running app-server with its RPC client attached
struct AppServer {
    child: tokio::process::Child,
    client: JsonRpcClient,
    writer: tokio::sync::mpsc::UnboundedSender<String>,
    notifications: tokio::sync::mpsc::Receiver<String>,
    stderr: tokio::process::ChildStderr,
}

impl CodexDriver {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    fn start_server(
        &self,
        run_id: &str,
        workdir: &Path,
        env: Vec<(String, String)>,
    ) -> Result<AppServer> {
        let mut args = self.settings.args.clone();
        args.push("app-server".to_string());

        let mut env = env;
        env.extend(self.settings.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let spec = ProcessSpec {
            program: self.settings.command.clone(),
            args,
            workdir: workdir.to_path_buf(),
            env,
            piped_stdin: true,
        };
        let spawned = process::spawn(&spec, run_id, AgentKind::Codex)?;
        let stdin = spawned
            .stdin
            .ok_or_else(|| Error::launch(run_id, AgentKind::Codex, "stdin not captured"))?;
        let writer = process::stdin_writer(stdin);
        let (client, notifications) =
            JsonRpcClient::attach(writer.clone(), process::read_lines(spawned.stdout));

        Ok(AppServer {
            child: spawned.child,
            client,
            writer,
            notifications,
            stderr: spawned.stderr,
        })
    }
}

async fn initialize(client: &JsonRpcClient) -> std::result::Result<(), RpcError> {
    client
        .request(
            "initialize",
            json!({
                "clientInfo": {
                    "name": "agent-worker",
                    "title": "agent-worker",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
            HANDSHAKE_TIMEOUT,
        )
        .await?;
    if !client.notify("initialized", None) {
        return Err(RpcError::Closed("initialized".to_string()));
    }
    Ok(())
}

/// Approval policy and sandbox for a run
fn policy(yolo: bool, mode: Option<&str>) -> (&'static str, &'static str) {
    if yolo {
        return ("never", "danger-full-access");
    }
    match mode {
        Some("plan") | Some("read-only") => ("on-request", "read-only"),
        _ => ("on-request", "workspace-write"),
    }
}

fn thread_start_params(spec: &LaunchSpec, model: Option<String>) -> Value {
    let (approval, sandbox) = policy(spec.yolo, spec.mode.as_deref());
    let mut params = json!({
        "cwd": spec.workdir.to_string_lossy(),
        "approvalPolicy": approval,
        "sandbox": sandbox,
    });
    if let Some(model) = model {
        params["model"] = Value::String(model);
    }
    params
}

fn thread_id_of(response: &Value) -> Option<String> {
    response
        .get("thread")
        .and_then(|t| t.get("id"))
        .and_then(Value::as_str)
        .or_else(|| response.get("threadId").and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl Driver for CodexDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Session> {
        let env = spec
            .callback
            .env_for(&spec.run_id, &spec.session_id, AgentKind::Codex);
        let server = self.start_server(&spec.run_id, &spec.workdir, env)?;
        let launch_err = |e: RpcError| Error::launch(&spec.run_id, AgentKind::Codex, e);

        // Dropping `server` on any error path kills the child
        initialize(&server.client).await.map_err(launch_err)?;

        let thread = server
            .client
            .request(
                "thread/start",
                thread_start_params(&spec, self.settings.model_for(&spec)),
                HANDSHAKE_TIMEOUT,
            )
            .await
            .map_err(launch_err)?;
        let thread_id = thread_id_of(&thread).ok_or_else(|| {
            Error::launch(&spec.run_id, AgentKind::Codex, "thread/start response missing thread id")
        })?;

        server
            .client
            .request(
                "turn/start",
                json!({
                    "threadId": thread_id,
                    "input": [{ "type": "text", "text": spec.prompt }],
                }),
                HANDSHAKE_TIMEOUT,
            )
            .await
            .map_err(launch_err)?;

        tracing::info!(
            run_id = %spec.run_id,
            session_id = %spec.session_id,
            thread_id = %thread_id,
            "Codex turn started"
        );

        let AppServer {
            child,
            client,
            writer,
            notifications,
            stderr,
        } = server;
        drop(client);

        Ok(process::supervise(Supervised {
            run_id: spec.run_id,
            session_id: spec.session_id,
            agent: AgentKind::Codex,
            child,
            frames: notifications,
            stderr,
            input: Some(writer),
            decoder: Box::new(CodexDecoder { thread_id: Some(thread_id) }),
            terminate_grace: self.settings.terminate_grace,
        }))
    }

    async fn discover_models(&self, workdir: &Path) -> Result<ModelInventory> {
        let deadline = self.settings.probe_timeout;
        let probe = async {
            let server = self
                .start_server("model-discovery", workdir, Vec::new())
                .map_err(|e| Error::discovery(AgentKind::Codex, e))?;
            let discovery_err = |e: RpcError| Error::discovery(AgentKind::Codex, e);
            initialize(&server.client).await.map_err(discovery_err)?;

            let mut models = Vec::new();
            let mut seen = HashSet::new();
            let mut default_model = None;
            let mut cursor: Option<String> = None;

            for _ in 0..MAX_MODEL_PAGES {
                let page = server
                    .client
                    .request(
                        "model/list",
                        json!({ "cursor": cursor, "limit": null }),
                        deadline,
                    )
                    .await
                    .map_err(discovery_err)?;
                let parsed = parse_model_page(&page);
                for model in parsed.models {
                    if seen.insert(model.value.clone()) {
                        models.push(model);
                    }
                }
                if default_model.is_none() {
                    default_model = parsed.default_model;
                }
                cursor = parsed.next_cursor;
                if cursor.is_none() {
                    break;
                }
            }
            Ok::<_, Error>((models, default_model))
        };

        let (models, listed_default) = tokio::time::timeout(deadline, probe)
            .await
            .map_err(|_| Error::discovery(AgentKind::Codex, format!("model/list timed out after {:?}", deadline)))??;

        let default_model = listed_default
            .or_else(|| self.settings.default_model.clone())
            .or_else(|| models.first().map(|m| m.value.clone()))
            .unwrap_or_default();
        Ok(ModelInventory {
            default_model,
            models,
        })
    }

    async fn discover_commands(&self) -> Result<Vec<Command>> {
        Ok(vec![
            Command::new("init", "Create an AGENTS.md file with instructions for Codex"),
            Command::new("review", "Review current changes and find issues"),
            Command::new("compact", "Summarize the conversation to free context"),
            Command::new("diff", "Show git diff including untracked files"),
            Command::new("status", "Show session configuration and token usage"),
        ])
    }
}

struct ModelPage {
    models: Vec<ModelDescriptor>,
    default_model: Option<String>,
    next_cursor: Option<String>,
}

fn parse_model_page(page: &Value) -> ModelPage {
    let mut models = Vec::new();
    let mut default_model = None;
    let items = page.get("data").and_then(Value::as_array);
    for item in items.into_iter().flatten() {
        let Some(id) = item
            .get("model")
            .and_then(Value::as_str)
            .or_else(|| item.get("id").and_then(Value::as_str))
        else {
            continue;
        };
        let display_name = item
            .get("displayName")
            .and_then(Value::as_str)
            .unwrap_or(id);
        let description = item
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if default_model.is_none()
            && item
                .get("isDefault")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        {
            default_model = Some(id.to_string());
        }
        models.push(ModelDescriptor::new(id, display_name, description));
    }
    ModelPage {
        models,
        default_model,
        next_cursor: page
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
    }
}

// =============================================================================
// Notification decoding
// =============================================================================

pub(crate) struct CodexDecoder {
    thread_id: Option<String>,
}

impl CodexDecoder {
    fn item_event(item: &Value) -> Option<AgentEvent> {
        match item.get("type").and_then(Value::as_str)? {
            "agentMessage" => Some(AgentEvent::Message {
                text: item
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "commandExecution" => Some(AgentEvent::ToolUse {
                name: "shell".to_string(),
            }),
            "fileChange" => Some(AgentEvent::ToolUse {
                name: "apply_patch".to_string(),
            }),
            "mcpToolCall" => Some(AgentEvent::ToolUse {
                name: item
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("mcp")
                    .to_string(),
            }),
            "webSearch" => Some(AgentEvent::ToolUse {
                name: "web_search".to_string(),
            }),
            _ => None,
        }
    }

    /// Server-initiated request; approvals are declined since no one is
    /// present to grant them
    fn answer(id: &Value, method: &str, params: &Value) -> Decoded {
        let reply = if method.ends_with("requestApproval") {
            Some(json!({ "decision": "decline" }))
        } else if method == "execCommandApproval" || method == "applyPatchApproval" {
            Some(json!({ "decision": "denied" }))
        } else {
            None
        };
        match reply {
            Some(result) => Decoded {
                events: vec![AgentEvent::Other {
                    kind: "approval_declined".to_string(),
                    data: json!({ "method": method, "params": params }),
                }],
                replies: vec![json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()],
                finish: None,
            },
            None => Decoded {
                replies: vec![jsonrpc::method_not_found(id, method)],
                ..Default::default()
            },
        }
    }
}

impl StreamDecoder for CodexDecoder {
    fn decode(&mut self, line: &str) -> Decoded {
        let Ok(frame) = serde_json::from_str::<Value>(line) else {
            return Decoded::event(AgentEvent::Other {
                kind: "text".to_string(),
                data: Value::String(line.to_string()),
            });
        };
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        if let Some(id) = frame.get("id") {
            if !method.is_empty() {
                return Self::answer(id, &method, &params);
            }
        }

        match method.as_str() {
            "thread/started" => {
                let id = params
                    .get("thread")
                    .and_then(|t| t.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| self.thread_id.clone());
                Decoded::event(AgentEvent::Init {
                    agent_session_id: id,
                    model: None,
                })
            }
            "item/completed" => match params.get("item").and_then(Self::item_event) {
                Some(event) => Decoded::event(event),
                None => Decoded::default(),
            },
            "turn/completed" => {
                let turn = params.get("turn").cloned().unwrap_or(Value::Null);
                let status = turn
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("completed");
                let error = turn
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let success = status == "completed" && error.is_none();
                let text = error.clone().unwrap_or_else(|| status.to_string());
                Decoded {
                    events: vec![AgentEvent::Result {
                        success,
                        text: text.clone(),
                    }],
                    replies: Vec::new(),
                    finish: Some(if success {
                        Finish::Success
                    } else {
                        Finish::Failure(format!("codex turn {}: {}", status, text))
                    }),
                }
            }
            "error" => {
                let message = params
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                let will_retry = params
                    .get("willRetry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Decoded {
                    events: vec![AgentEvent::Other {
                        kind: "error".to_string(),
                        data: params.clone(),
                    }],
                    replies: Vec::new(),
                    finish: (!will_retry).then(|| Finish::Failure(format!("codex error: {}", message))),
                }
            }
            "" => Decoded::default(),
            other => Decoded::event(AgentEvent::Other {
                kind: other.to_string(),
                data: params,
            }),
        }
    }

    fn close_stdin_on_finish(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(command: &str, args: Vec<String>) -> DriverSettings {
        DriverSettings {
            command: command.to_string(),
            args,
            env: Default::default(),
            default_model: None,
            terminate_grace: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_policy() {
        assert_eq!(policy(true, Some("plan")), ("never", "danger-full-access"));
        assert_eq!(policy(false, Some("plan")), ("on-request", "read-only"));
        assert_eq!(policy(false, None), ("on-request", "workspace-write"));
    }

    #[test]
    fn test_parse_model_page() {
        let page = json!({
            "data": [
                { "model": "gpt-5-codex", "displayName": "GPT-5 Codex", "description": "tuned", "isDefault": true },
                { "id": "gpt-5", "displayName": "GPT-5" },
                { "displayName": "nameless" }
            ],
            "nextCursor": "abc"
        });
        let parsed = parse_model_page(&page);
        assert_eq!(parsed.models.len(), 2);
        assert_eq!(parsed.models[0], ModelDescriptor::new("gpt-5-codex", "GPT-5 Codex", "tuned"));
        assert_eq!(parsed.models[1].value, "gpt-5");
        assert_eq!(parsed.default_model.as_deref(), Some("gpt-5-codex"));
        assert_eq!(parsed.next_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn test_decode_turn_completed() {
        let mut d = CodexDecoder { thread_id: None };
        let ok = d.decode(r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"turn":{"id":"t","status":"completed"}}}"#);
        assert_eq!(ok.finish, Some(Finish::Success));

        let failed = d.decode(r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"turn":{"status":"failed","error":{"message":"rate limited"}}}}"#);
        assert!(matches!(failed.finish, Some(Finish::Failure(ref m)) if m.contains("rate limited")));
        assert!(d.close_stdin_on_finish());
    }

    #[test]
    fn test_decode_error_notification() {
        let mut d = CodexDecoder { thread_id: None };
        let retrying = d.decode(r#"{"method":"error","params":{"error":{"message":"blip"},"willRetry":true}}"#);
        assert!(retrying.finish.is_none());
        let fatal = d.decode(r#"{"method":"error","params":{"error":{"message":"auth"}}}"#);
        assert_eq!(fatal.finish, Some(Finish::Failure("codex error: auth".into())));
    }

    #[test]
    fn test_decode_items() {
        let mut d = CodexDecoder { thread_id: Some("th".into()) };
        let msg = d.decode(r#"{"method":"item/completed","params":{"item":{"type":"agentMessage","text":"done"}}}"#);
        assert_eq!(msg.events, vec![AgentEvent::Message { text: "done".into() }]);
        let cmd = d.decode(r#"{"method":"item/completed","params":{"item":{"type":"commandExecution"}}}"#);
        assert_eq!(cmd.events, vec![AgentEvent::ToolUse { name: "shell".into() }]);
        let started = d.decode(r#"{"method":"thread/started","params":{}}"#);
        assert_eq!(
            started.events,
            vec![AgentEvent::Init { agent_session_id: Some("th".into()), model: None }]
        );
    }

    #[test]
    fn test_approval_requests_are_declined() {
        let mut d = CodexDecoder { thread_id: None };
        let out = d.decode(r#"{"jsonrpc":"2.0","id":9,"method":"item/commandExecution/requestApproval","params":{}}"#);
        let reply: Value = serde_json::from_str(&out.replies[0]).unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["result"]["decision"], "decline");

        let unknown = d.decode(r#"{"jsonrpc":"2.0","id":10,"method":"something/else","params":{}}"#);
        let reply: Value = serde_json::from_str(&unknown.replies[0]).unwrap();
        assert_eq!(reply["error"]["code"], -32601);
    }

    /// Scripted app-server: answers initialize (id 1), skips the
    /// `initialized` notification, answers model/list (id 2)
    #[cfg(unix)]
    #[tokio::test]
    async fn test_discover_models_passes_inventory_through() {
        let script = r#"
read -r line
echo '{"jsonrpc":"2.0","id":1,"result":{"userAgent":"codex"}}'
read -r line
read -r line
echo '{"jsonrpc":"2.0","id":2,"result":{"data":[{"model":"gpt-5-codex","displayName":"GPT-5 Codex","description":"Optimized for coding","isDefault":true},{"model":"gpt-5","displayName":"GPT-5","description":"General"}]}}'
read -r line
"#;
        let driver = CodexDriver::new(settings("sh", vec!["-c".to_string(), script.to_string()]));
        let inventory = driver.discover_models(&std::env::temp_dir()).await.unwrap();
        assert_eq!(inventory.default_model, "gpt-5-codex");
        assert_eq!(
            inventory.models,
            vec![
                ModelDescriptor::new("gpt-5-codex", "GPT-5 Codex", "Optimized for coding"),
                ModelDescriptor::new("gpt-5", "GPT-5", "General"),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discover_models_timeout() {
        let mut s = settings("sh", vec!["-c".to_string(), "sleep 5".to_string()]);
        s.probe_timeout = Duration::from_millis(200);
        let err = CodexDriver::new(s)
            .discover_models(&std::env::temp_dir())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }
}
