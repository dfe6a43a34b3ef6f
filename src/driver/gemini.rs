//! Gemini CLI driver
//!
//! `gemini --prompt=<prompt> --output-format stream-json` emits one JSON record per
//! line: `init`, `message`, `tool_use`, `tool_result`, `error`, `result`.

use super::process::{self, Decoded, Finish, ProcessSpec, StreamDecoder, Supervised};
use super::{AgentEvent, Driver, DriverSettings, LaunchSpec, Session};
use crate::error::Result;
use crate::run::{AgentKind, Command, ModelDescriptor, ModelInventory};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

const DEFAULT_MODEL: &str = "gemini-2.5-pro";

pub struct GeminiDriver {
    settings: DriverSettings,
}

impl GeminiDriver {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    fn build_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = self.settings.args.clone();
        // Joined form keeps a prompt with a leading dash from parsing as a flag
        args.extend([
            format!("--prompt={}", spec.prompt),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ]);
        if let Some(model) = self.settings.model_for(spec) {
            args.push("-m".to_string());
            args.push(model);
        }
        if spec.yolo {
            args.push("--yolo".to_string());
        } else if let Some(mode) = spec.mode.as_deref().filter(|m| !m.is_empty()) {
            args.push("--approval-mode".to_string());
            args.push(mode.to_string());
        }
        args
    }
}

#[async_trait]
impl Driver for GeminiDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::Gemini
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Session> {
        let mut env = spec
            .callback
            .env_for(&spec.run_id, &spec.session_id, AgentKind::Gemini);
        env.extend(self.settings.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let process_spec = ProcessSpec {
            program: self.settings.command.clone(),
            args: self.build_args(&spec),
            workdir: spec.workdir.clone(),
            env,
            piped_stdin: false,
        };
        let spawned = process::spawn(&process_spec, &spec.run_id, AgentKind::Gemini)?;

        Ok(process::supervise(Supervised {
            run_id: spec.run_id,
            session_id: spec.session_id,
            agent: AgentKind::Gemini,
            child: spawned.child,
            frames: process::read_lines(spawned.stdout),
            stderr: spawned.stderr,
            input: None,
            decoder: Box::new(GeminiDecoder),
            terminate_grace: self.settings.terminate_grace,
        }))
    }

    async fn discover_models(&self, workdir: &Path) -> Result<ModelInventory> {
        process::probe(
            AgentKind::Gemini,
            &self.settings.command,
            &["--version".to_string()],
            Some(workdir),
            self.settings.probe_timeout,
        )
        .await?;

        Ok(ModelInventory {
            default_model: self
                .settings
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            models: vec![
                ModelDescriptor::new("gemini-2.5-pro", "Gemini 2.5 Pro", "Most capable reasoning model"),
                ModelDescriptor::new("gemini-2.5-flash", "Gemini 2.5 Flash", "Fast and cost-efficient"),
                ModelDescriptor::new(
                    "gemini-2.5-flash-lite",
                    "Gemini 2.5 Flash Lite",
                    "Lowest latency",
                ),
            ],
        })
    }

    async fn discover_commands(&self) -> Result<Vec<Command>> {
        Ok(vec![
            Command::new("compress", "Replace the context with a summary"),
            Command::new("memory", "Manage hierarchical memory").with_hint("show|add|refresh"),
            Command::new("stats", "Show session statistics"),
            Command::new("tools", "List available tools"),
            Command::new("mcp", "List configured MCP servers"),
        ])
    }
}

pub(crate) struct GeminiDecoder;

impl StreamDecoder for GeminiDecoder {
    fn decode(&mut self, line: &str) -> Decoded {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            return Decoded::event(AgentEvent::Other {
                kind: "text".to_string(),
                data: Value::String(line.to_string()),
            });
        };
        let str_field = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);

        match record.get("type").and_then(Value::as_str).unwrap_or_default() {
            "init" => Decoded::event(AgentEvent::Init {
                agent_session_id: str_field("session_id"),
                model: str_field("model"),
            }),
            "message" if str_field("role").as_deref() == Some("assistant") => {
                Decoded::event(AgentEvent::Message {
                    text: str_field("content").unwrap_or_default(),
                })
            }
            "tool_use" => Decoded::event(AgentEvent::ToolUse {
                name: str_field("tool_name").unwrap_or_else(|| "tool".to_string()),
            }),
            "error" => {
                let message = str_field("message").unwrap_or_else(|| "unknown error".to_string());
                let fatal = str_field("severity").as_deref() != Some("warning");
                Decoded {
                    events: vec![AgentEvent::Other {
                        kind: "error".to_string(),
                        data: record.clone(),
                    }],
                    replies: Vec::new(),
                    finish: fatal.then(|| Finish::Failure(format!("gemini error: {}", message))),
                }
            }
            "result" => {
                let success = str_field("status").as_deref() == Some("success");
                let text = record
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| str_field("status"))
                    .unwrap_or_default();
                Decoded {
                    events: vec![AgentEvent::Result {
                        success,
                        text: text.clone(),
                    }],
                    replies: Vec::new(),
                    finish: Some(if success {
                        Finish::Success
                    } else {
                        Finish::Failure(format!("gemini result: {}", text))
                    }),
                }
            }
            other => Decoded::event(AgentEvent::Other {
                kind: (if other.is_empty() { "unknown" } else { other }).to_string(),
                data: record.clone(),
            }),
        }
    }
}
