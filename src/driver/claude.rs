//! Claude Code driver
//!
//! Runs `claude -p` headless with `--output-format stream-json` and reads
//! NDJSON records from stdout. Hooks are registered inline through
//! `--settings` so every hook event, and the plan hand-off on `ExitPlanMode`,
//! runs the worker helper.

use super::process::{self, Decoded, Finish, ProcessSpec, StreamDecoder, Supervised};
use super::{AgentEvent, CallbackTarget, Driver, DriverSettings, LaunchSpec, Session};
use crate::error::Result;
use crate::run::{AgentKind, Command, ModelDescriptor, ModelInventory};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;

/// Hook events the helper is registered for
const HOOK_EVENTS: &[&str] = &[
    "PreToolUse",
    "PostToolUse",
    "Notification",
    "UserPromptSubmit",
    "Stop",
    "SubagentStop",
    "PreCompact",
    "SessionStart",
    "SessionEnd",
];

/// Hook events that take a tool matcher
const TOOL_HOOK_EVENTS: &[&str] = &["PreToolUse", "PostToolUse"];

/// Tool whose invocation carries the plan
const PLAN_TOOL: &str = "ExitPlanMode";

pub struct ClaudeDriver {
    settings: DriverSettings,
}

impl ClaudeDriver {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    fn build_args(&self, spec: &LaunchSpec) -> Result<Vec<String>> {
        let mut args = self.settings.args.clone();
        args.extend([
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--session-id".to_string(),
            spec.session_id.clone(),
        ]);

        if let Some(model) = self.settings.model_for(spec) {
            args.push("--model".to_string());
            args.push(model);
        }

        if spec.yolo {
            args.push("--dangerously-skip-permissions".to_string());
        } else if let Some(mode) = spec.mode.as_deref().filter(|m| !m.is_empty()) {
            args.push("--permission-mode".to_string());
            args.push(mode.to_string());
        }

        args.push("--settings".to_string());
        args.push(serde_json::to_string(&hook_settings(&spec.callback))?);
        // Prompt goes last, after `--`, so a leading dash is never read as a flag
        args.push("--".to_string());
        args.push(spec.prompt.clone());
        Ok(args)
    }
}

/// Inline settings registering the helper for every hook event
fn hook_settings(callback: &CallbackTarget) -> Value {
    let mut hooks = Map::new();
    for event in HOOK_EVENTS {
        let report = json!({
            "type": "command",
            "command": callback.helper_invocation(&["hook", event]),
        });
        let mut groups = Vec::new();
        if *event == "PreToolUse" {
            groups.push(json!({
                "matcher": PLAN_TOOL,
                "hooks": [{ "type": "command", "command": callback.helper_invocation(&["plan"]) }],
            }));
        }
        if TOOL_HOOK_EVENTS.contains(event) {
            groups.push(json!({ "matcher": "*", "hooks": [report] }));
        } else {
            groups.push(json!({ "hooks": [report] }));
        }
        hooks.insert(event.to_string(), Value::Array(groups));
    }
    json!({ "hooks": hooks })
}

#[async_trait]
impl Driver for ClaudeDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Session> {
        let mut env = spec
            .callback
            .env_for(&spec.run_id, &spec.session_id, AgentKind::Claude);
        env.extend(self.settings.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let process_spec = ProcessSpec {
            program: self.settings.command.clone(),
            args: self.build_args(&spec)?,
            workdir: spec.workdir.clone(),
            env,
            piped_stdin: false,
        };
        let spawned = process::spawn(&process_spec, &spec.run_id, AgentKind::Claude)?;

        Ok(process::supervise(Supervised {
            run_id: spec.run_id,
            session_id: spec.session_id,
            agent: AgentKind::Claude,
            child: spawned.child,
            frames: process::read_lines(spawned.stdout),
            stderr: spawned.stderr,
            input: None,
            decoder: Box::new(ClaudeDecoder),
            terminate_grace: self.settings.terminate_grace,
        }))
    }

    async fn discover_models(&self, workdir: &Path) -> Result<ModelInventory> {
        let version = process::probe(
            AgentKind::Claude,
            &self.settings.command,
            &["--version".to_string()],
            Some(workdir),
            self.settings.probe_timeout,
        )
        .await?;
        tracing::debug!(version = %version.trim(), "Claude CLI probed");

        let models = vec![
            ModelDescriptor::new("sonnet", "Sonnet", "Latest Sonnet model for everyday coding"),
            ModelDescriptor::new("opus", "Opus", "Latest Opus model for complex work"),
            ModelDescriptor::new("haiku", "Haiku", "Latest Haiku model for quick tasks"),
        ];
        Ok(ModelInventory {
            default_model: self
                .settings
                .default_model
                .clone()
                .unwrap_or_else(|| "sonnet".to_string()),
            models,
        })
    }

    async fn discover_commands(&self) -> Result<Vec<Command>> {
        Ok(vec![
            Command::new("compact", "Summarize the conversation to free context")
                .with_hint("[instructions]"),
            Command::new("init", "Create a CLAUDE.md with codebase documentation"),
            Command::new("review", "Review a pull request").with_hint("[pr]"),
            Command::new("pr-comments", "Fetch comments from a pull request"),
            Command::new("security-review", "Review pending changes for security issues"),
            Command::new("cost", "Show token usage for this session"),
        ])
    }
}

// =============================================================================
// stream-json decoding
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    System {
        #[serde(default)]
        subtype: String,
        session_id: Option<String>,
        model: Option<String>,
    },
    Assistant {
        message: AssistantBody,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        result: Option<String>,
        #[serde(default)]
        errors: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct AssistantBody {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { name: String },
    #[serde(other)]
    Other,
}

pub(crate) struct ClaudeDecoder;

impl StreamDecoder for ClaudeDecoder {
    fn decode(&mut self, line: &str) -> Decoded {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                return Decoded::event(AgentEvent::Other {
                    kind: "text".to_string(),
                    data: Value::String(line.to_string()),
                })
            }
        };

        match serde_json::from_value::<Record>(value.clone()) {
            Ok(Record::System {
                subtype,
                session_id,
                model,
            }) if subtype == "init" => Decoded::event(AgentEvent::Init {
                agent_session_id: session_id,
                model,
            }),
            Ok(Record::Assistant { message }) => Decoded {
                events: message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(AgentEvent::Message { text }),
                        ContentBlock::ToolUse { name } => Some(AgentEvent::ToolUse { name }),
                        ContentBlock::Other => None,
                    })
                    .collect(),
                ..Default::default()
            },
            Ok(Record::Result {
                subtype,
                is_error,
                result,
                errors,
            }) => {
                let success = !is_error && subtype == "success";
                let text = result.unwrap_or_default();
                let finish = if success {
                    Finish::Success
                } else if !errors.is_empty() {
                    Finish::Failure(errors.join("; "))
                } else if !text.is_empty() {
                    Finish::Failure(text.clone())
                } else {
                    Finish::Failure(format!("claude reported {}", subtype))
                };
                Decoded {
                    events: vec![AgentEvent::Result { success, text }],
                    finish: Some(finish),
                    ..Default::default()
                }
            }
            _ => Decoded::event(AgentEvent::Other {
                kind: value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                data: value,
            }),
        }
    }
}
