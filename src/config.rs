//! Worker configuration management
//!
//! Loaded from TOML; every field has a default so an empty file (or no file)
//! yields a runnable worker.

use crate::error::{Error, Result};
use crate::run::AgentKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity
    pub worker: WorkerSection,

    /// Control-plane-facing listener
    pub public: PublicConfig,

    /// Loopback callback listener
    pub ctl: CtlConfig,

    /// Reconciliation loop tuning
    pub reconcile: ReconcileConfig,

    /// Model/command discovery
    pub discovery: DiscoveryConfig,

    /// Per-agent CLI settings
    pub agents: AgentsConfig,

    /// Run record storage
    pub storage: StorageConfig,
}

impl WorkerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker.id.trim().is_empty() {
            return Err(Error::Config("worker.id must not be empty".to_string()));
        }
        if self.reconcile.interval_ms == 0 {
            return Err(Error::Config(
                "reconcile.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.reconcile.batch_limit == 0 {
            return Err(Error::Config(
                "reconcile.batch_limit must be greater than zero".to_string(),
            ));
        }
        if self.ctl.relay_capacity == 0 {
            return Err(Error::Config(
                "ctl.relay_capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(tls) = &self.public.tls {
            if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
                return Err(Error::Config(
                    "public.tls requires both cert and key".to_string(),
                ));
            }
        }
        for kind in AgentKind::ALL {
            let agent = self.agents.get(kind);
            if agent.enabled && agent.command.trim().is_empty() {
                return Err(Error::Config(format!(
                    "agents.{}.command must not be empty",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Worker identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Identifier stamped on every run this worker creates
    pub id: String,

    /// Executable agents invoke for hook/plan callbacks.
    /// Defaults to the running worker binary.
    pub helper_command: Option<PathBuf>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            helper_command: None,
        }
    }
}

/// Public listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// TLS material provisioned by the overlay network
    pub tls: Option<TlsConfig>,
}

impl Default for PublicConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
            tls: None,
        }
    }
}

/// Certificate and key paths (PEM)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// CTL listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CtlConfig {
    /// Deadline applied by helpers calling the CTL listener
    pub request_timeout_secs: u64,

    /// Bounded queue between event ingestion and the relay
    pub relay_capacity: usize,
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            relay_capacity: 1024,
        }
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Interval between scans when nothing wakes the loop
    pub interval_ms: u64,

    /// Maximum pending runs handled per scan
    pub batch_limit: usize,

    /// Deadline for a single driver launch
    pub launch_timeout_secs: u64,

    /// Wait after the kill signal before a session is forcibly dropped
    pub terminate_grace_secs: u64,
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            batch_limit: 16,
            launch_timeout_secs: 60,
            terminate_grace_secs: 5,
        }
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Hard deadline for one probe
    pub timeout_secs: u64,

    /// How long a model inventory stays cached (0 disables caching)
    pub cache_ttl_secs: u64,
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            cache_ttl_secs: 300,
        }
    }
}

/// Settings for all agent CLIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub claude: AgentConfig,
    pub codex: AgentConfig,
    pub gemini: AgentConfig,
    pub opencode: AgentConfig,
}

impl AgentsConfig {
    pub fn get(&self, kind: AgentKind) -> &AgentConfig {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Codex => &self.codex,
            AgentKind::Gemini => &self.gemini,
            AgentKind::OpenCode => &self.opencode,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            claude: AgentConfig::with_command("claude"),
            codex: AgentConfig::with_command("codex"),
            gemini: AgentConfig::with_command("gemini"),
            opencode: AgentConfig::with_command("opencode"),
        }
    }
}

/// One agent CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Register a driver for this agent
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Binary name or path
    pub command: String,

    /// Extra arguments placed before the generated ones
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Model used when a run does not name one
    #[serde(default)]
    pub default_model: Option<String>,
}

impl AgentConfig {
    pub fn with_command(command: &str) -> Self {
        Self {
            enabled: true,
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            default_model: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Run store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Base directory for the file backend
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-worker");
        Self {
            backend: StorageBackend::Memory,
            base_dir: base,
        }
    }
}
