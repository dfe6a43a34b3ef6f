//! OpenCode driver
//!
//! `opencode run --format json` prints one JSON event per line. Each event
//! carries a `part` whose shape depends on `type`.

use super::process::{self, Decoded, Finish, ProcessSpec, StreamDecoder, Supervised};
use super::{AgentEvent, Driver, DriverSettings, LaunchSpec, Session};
use crate::error::{Error, Result};
use crate::run::{AgentKind, Command, ModelDescriptor, ModelInventory};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;

/// Inline config granting every permission, used for yolo runs
const CONFIG_CONTENT_ENV: &str = "OPENCODE_CONFIG_CONTENT";

pub struct OpenCodeDriver {
    settings: DriverSettings,
}

impl OpenCodeDriver {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    fn build_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = self.settings.args.clone();
        args.extend(["run".to_string(), "--format".to_string(), "json".to_string()]);
        if let Some(model) = self.settings.model_for(spec) {
            args.push("-m".to_string());
            args.push(model);
        }
        if let Some(mode) = spec.mode.as_deref().filter(|m| !m.is_empty() && *m != "default") {
            args.push("--agent".to_string());
            args.push(mode.to_string());
        }
        args.push("--".to_string());
        args.push(spec.prompt.clone());
        args
    }
}

#[async_trait]
impl Driver for OpenCodeDriver {
    fn kind(&self) -> AgentKind {
        AgentKind::OpenCode
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Session> {
        let mut env = spec
            .callback
            .env_for(&spec.run_id, &spec.session_id, AgentKind::OpenCode);
        if spec.yolo {
            let config = json!({
                "permission": { "edit": "allow", "bash": "allow", "webfetch": "allow" }
            });
            env.push((CONFIG_CONTENT_ENV.to_string(), config.to_string()));
        }
        env.extend(self.settings.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let process_spec = ProcessSpec {
            program: self.settings.command.clone(),
            args: self.build_args(&spec),
            workdir: spec.workdir.clone(),
            env,
            piped_stdin: false,
        };
        let spawned = process::spawn(&process_spec, &spec.run_id, AgentKind::OpenCode)?;

        Ok(process::supervise(Supervised {
            run_id: spec.run_id,
            session_id: spec.session_id,
            agent: AgentKind::OpenCode,
            child: spawned.child,
            frames: process::read_lines(spawned.stdout),
            stderr: spawned.stderr,
            input: None,
            decoder: Box::new(OpenCodeDecoder { announced: false }),
            terminate_grace: self.settings.terminate_grace,
        }))
    }

    async fn discover_models(&self, workdir: &Path) -> Result<ModelInventory> {
        let mut args = self.settings.args.clone();
        args.push("models".to_string());
        let stdout = process::probe(
            AgentKind::OpenCode,
            &self.settings.command,
            &args,
            Some(workdir),
            self.settings.probe_timeout,
        )
        .await?;

        let models = parse_model_lines(&stdout);
        if models.is_empty() {
            return Err(Error::discovery(AgentKind::OpenCode, "opencode models listed nothing"));
        }
        let default_model = self
            .settings
            .default_model
            .clone()
            .unwrap_or_else(|| models[0].value.clone());
        Ok(ModelInventory {
            default_model,
            models,
        })
    }

    async fn discover_commands(&self) -> Result<Vec<Command>> {
        Ok(vec![
            Command::new("init", "Create or update AGENTS.md"),
            Command::new("compact", "Compact the session"),
            Command::new("review", "Review changes").with_hint("[commit|branch|pr]"),
            Command::new("share", "Share the session"),
        ])
    }
}

/// One `provider/model` per line; anything else is ignored
fn parse_model_lines(stdout: &str) -> Vec<ModelDescriptor> {
    stdout
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let (provider, model) = line.split_once('/')?;
            if provider.is_empty() || model.is_empty() || line.contains(char::is_whitespace) {
                return None;
            }
            Some(ModelDescriptor::new(line, model, provider))
        })
        .collect()
}

pub(crate) struct OpenCodeDecoder {
    announced: bool,
}

impl StreamDecoder for OpenCodeDecoder {
    fn decode(&mut self, line: &str) -> Decoded {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            return Decoded::event(AgentEvent::Other {
                kind: "text".to_string(),
                data: Value::String(line.to_string()),
            });
        };
        let part = event.get("part").cloned().unwrap_or(Value::Null);
        let mut decoded = Decoded::default();

        if !self.announced {
            if let Some(session) = event.get("sessionID").and_then(Value::as_str) {
                self.announced = true;
                decoded.events.push(AgentEvent::Init {
                    agent_session_id: Some(session.to_string()),
                    model: None,
                });
            }
        }

        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "text" => decoded.events.push(AgentEvent::Message {
                text: part
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "tool_use" => decoded.events.push(AgentEvent::ToolUse {
                name: part
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string(),
            }),
            "error" => {
                let error = event.get("error").cloned().unwrap_or(Value::Null);
                let message = error
                    .get("data")
                    .and_then(|d| d.get("message"))
                    .or_else(|| error.get("message"))
                    .and_then(Value::as_str)
                    .or_else(|| error.get("name").and_then(Value::as_str))
                    .unwrap_or("unknown error")
                    .to_string();
                decoded.events.push(AgentEvent::Result {
                    success: false,
                    text: message.clone(),
                });
                decoded.finish = Some(Finish::Failure(format!("opencode error: {}", message)));
            }
            other => decoded.events.push(AgentEvent::Other {
                kind: (if other.is_empty() { "unknown" } else { other }).to_string(),
                data: event.clone(),
            }),
        }
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CallbackTarget;
    use crate::secret::CtlSecret;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(command: &str) -> DriverSettings {
        DriverSettings {
            command: command.to_string(),
            args: vec![],
            env: Default::default(),
            default_model: None,
            terminate_grace: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_args() {
        let driver = OpenCodeDriver::new(settings("opencode"));
        let spec = LaunchSpec {
            run_id: "r".to_string(),
            session_id: "s".to_string(),
            prompt: "add tests".to_string(),
            workdir: PathBuf::from("/tmp"),
            model: Some("anthropic/claude-sonnet-4".to_string()),
            mode: Some("plan".to_string()),
            yolo: false,
            callback: CallbackTarget {
                ctl_url: "http://127.0.0.1:1".to_string(),
                secret: Arc::new(CtlSecret::generate()),
                helper_command: PathBuf::from("agent-worker"),
            },
        };
        assert_eq!(
            driver.build_args(&spec),
            vec![
                "run",
                "--format",
                "json",
                "-m",
                "anthropic/claude-sonnet-4",
                "--agent",
                "plan",
                "--",
                "add tests"
            ]
        );
    }

    #[test]
    fn test_parse_model_lines() {
        let models = parse_model_lines(
            "anthropic/claude-sonnet-4\nopenai/gpt-5\n\nnot a model\nWarning: cache stale\n",
        );
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].value, "anthropic/claude-sonnet-4");
        assert_eq!(models[0].display_name, "claude-sonnet-4");
        assert_eq!(models[0].description, "anthropic");
    }

    #[test]
    fn test_decode() {
        let mut d = OpenCodeDecoder { announced: false };
        let first = d.decode(r#"{"type":"step_start","sessionID":"ses_1","part":{}}"#);
        assert!(matches!(&first.events[0], AgentEvent::Init { agent_session_id: Some(id), .. } if id == "ses_1"));
        assert_eq!(first.events.len(), 2);

        let text = d.decode(r#"{"type":"text","sessionID":"ses_1","part":{"text":"hello"}}"#);
        assert_eq!(text.events, vec![AgentEvent::Message { text: "hello".into() }]);

        let tool = d.decode(r#"{"type":"tool_use","part":{"tool":"bash"}}"#);
        assert_eq!(tool.events, vec![AgentEvent::ToolUse { name: "bash".into() }]);

        let err = d.decode(r#"{"type":"error","error":{"name":"ProviderAuthError","data":{"message":"no key"}}}"#);
        assert_eq!(err.finish, Some(Finish::Failure("opencode error: no key".into())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discover_models_from_cli() {
        let mut s = settings("sh");
        s.args = vec![
            "-c".to_string(),
            "printf 'openai/gpt-5\\nanthropic/claude-opus-4\\n'".to_string(),
        ];
        let inventory = OpenCodeDriver::new(s)
            .discover_models(&std::env::temp_dir())
            .await
            .unwrap();
        assert_eq!(inventory.default_model, "openai/gpt-5");
        assert_eq!(inventory.models.len(), 2);
    }
}
