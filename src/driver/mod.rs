//! Agent drivers
//!
//! One [`Driver`] per agent CLI. A driver turns a [`LaunchSpec`] into a live
//! [`Session`] and answers discovery probes; nothing outside this module
//! branches on which agent it is talking to.
//!
//! ```text
//! RunManager ──launch──▶ Driver ──spawn──▶ agent CLI ──stdout──▶ decoder
//!     ▲                                        │                   │
//!     └──────── Session { events, outcome } ◀──┴── supervisor ◀────┘
//! ```

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod jsonrpc;
pub mod opencode;
pub mod process;

use crate::config::{AgentConfig, AgentsConfig};
use crate::error::{Error, Result};
use crate::run::{AgentKind, Command, ModelInventory};
use crate::secret::CtlSecret;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub use claude::ClaudeDriver;
pub use codex::CodexDriver;
pub use gemini::GeminiDriver;
pub use opencode::OpenCodeDriver;

/// Environment variable names of the helper callback contract
pub mod env {
    pub const CTL_URL: &str = "AGENT_WORKER_CTL_URL";
    pub const CTL_TOKEN: &str = "AGENT_WORKER_CTL_TOKEN";
    pub const RUN_ID: &str = "AGENT_WORKER_RUN_ID";
    pub const SESSION_ID: &str = "AGENT_WORKER_SESSION_ID";
    pub const AGENT: &str = "AGENT_WORKER_AGENT";
    /// Public secret; stripped from every child environment
    pub const PUBLIC_SECRET: &str = "AGENT_WORKER_SECRET";
}

// =============================================================================
// Launch input
// =============================================================================

/// Where a spawned agent's helper reports back to
#[derive(Clone)]
pub struct CallbackTarget {
    /// Base URL of the CTL listener (`http://127.0.0.1:<port>`)
    pub ctl_url: String,
    pub secret: Arc<CtlSecret>,
    /// Executable invoked as `<helper> hook <Name>` / `<helper> plan`
    pub helper_command: PathBuf,
}

impl CallbackTarget {
    /// Child environment for one session
    pub fn env_for(&self, run_id: &str, session_id: &str, agent: AgentKind) -> Vec<(String, String)> {
        vec![
            (env::CTL_URL.to_string(), self.ctl_url.clone()),
            (env::CTL_TOKEN.to_string(), self.secret.as_str().to_string()),
            (env::RUN_ID.to_string(), run_id.to_string()),
            (env::SESSION_ID.to_string(), session_id.to_string()),
            (env::AGENT.to_string(), agent.to_string()),
        ]
    }

    /// Shell command line that runs the helper with `args`
    pub fn helper_invocation(&self, args: &[&str]) -> String {
        let mut parts = vec![shell_quote(&self.helper_command.to_string_lossy())];
        parts.extend(args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

impl std::fmt::Debug for CallbackTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTarget")
            .field("ctl_url", &self.ctl_url)
            .field("secret", &self.secret)
            .field("helper_command", &self.helper_command)
            .finish()
    }
}

/// Everything a driver needs to start one session
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub run_id: String,
    /// Chosen by the run manager before launch
    pub session_id: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub yolo: bool,
    pub callback: CallbackTarget,
}

// =============================================================================
// Session
// =============================================================================

/// Normalized agent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Agent-side session or thread established
    Init {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Assistant text
    Message { text: String },
    /// Tool invocation
    ToolUse { name: String },
    /// Final result record of a turn
    Result { success: bool, text: String },
    /// Any record without a normalized form
    Other { kind: String, data: serde_json::Value },
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Exit code 0 and no failure record
    Completed,
    /// Abnormal exit or a failure record
    Failed(String),
    /// Stopped through [`SessionControl::terminate`]
    Terminated,
}

/// Cancellation control of a live session
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Stop the process and wait until it is gone. Idempotent; safe after exit.
    async fn terminate(&self);
}

/// Live handle returned by [`Driver::launch`]
pub struct Session {
    pub id: String,
    /// Ends when the process exits
    pub events: mpsc::Receiver<AgentEvent>,
    /// Resolves once, after `events` has closed
    pub outcome: oneshot::Receiver<SessionExit>,
    pub control: Arc<dyn SessionControl>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Uniform contract over agent CLIs
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Start the agent. Returns once the process or connection is established.
    async fn launch(&self, spec: LaunchSpec) -> Result<Session>;

    /// Probe supported models for a working directory
    async fn discover_models(&self, workdir: &Path) -> Result<ModelInventory>;

    /// Built-in commands of this agent
    async fn discover_commands(&self) -> Result<Vec<Command>>;
}

/// Per-driver settings shared by every agent implementation
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub default_model: Option<String>,
    /// Wait between the kill signal and a forced kill
    pub terminate_grace: Duration,
    /// Deadline for discovery subprocesses
    pub probe_timeout: Duration,
}

impl DriverSettings {
    pub fn from_config(agent: &AgentConfig, terminate_grace: Duration, probe_timeout: Duration) -> Self {
        Self {
            command: agent.command.clone(),
            args: agent.args.clone(),
            env: agent.env.clone(),
            default_model: agent.default_model.clone(),
            terminate_grace,
            probe_timeout,
        }
    }

    /// Requested model, else the configured default
    pub fn model_for(&self, spec: &LaunchSpec) -> Option<String> {
        spec.model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.default_model.clone())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Maps agent selectors to drivers
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<AgentKind, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every enabled agent from configuration
    pub fn from_config(agents: &AgentsConfig, terminate_grace: Duration, probe_timeout: Duration) -> Self {
        let mut registry = Self::new();
        for kind in AgentKind::ALL {
            let agent = agents.get(kind);
            if !agent.enabled {
                tracing::info!(agent = %kind, "Agent disabled in configuration");
                continue;
            }
            let settings = DriverSettings::from_config(agent, terminate_grace, probe_timeout);
            let driver: Arc<dyn Driver> = match kind {
                AgentKind::Claude => Arc::new(ClaudeDriver::new(settings)),
                AgentKind::Codex => Arc::new(CodexDriver::new(settings)),
                AgentKind::Gemini => Arc::new(GeminiDriver::new(settings)),
                AgentKind::OpenCode => Arc::new(OpenCodeDriver::new(settings)),
            };
            registry.register(driver);
        }
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&kind).cloned()
    }

    /// Resolve a wire selector; unknown or unregistered agents are an error
    pub fn resolve(&self, selector: &str) -> Result<(AgentKind, Arc<dyn Driver>)> {
        let kind: AgentKind = selector.parse()?;
        let driver = self
            .get(kind)
            .ok_or_else(|| Error::UnknownAgent(format!("{} (not enabled on this worker)", kind)))?;
        Ok((kind, driver))
    }

    /// Registered agents in stable order
    pub fn kinds(&self) -> Vec<AgentKind> {
        AgentKind::ALL
            .into_iter()
            .filter(|k| self.drivers.contains_key(k))
            .collect()
    }
}

/// POSIX single-quote a word unless it is plainly safe
pub(crate) fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
