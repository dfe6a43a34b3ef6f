//! Worker error types

use thiserror::Error;

/// agent-worker error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup, never retried)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent selector that does not resolve to a registered driver
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Process or connection could not be established
    #[error("Launch error for run {run_id} ({agent}): {reason}")]
    Launch {
        run_id: String,
        agent: String,
        reason: String,
    },

    /// Model or command probe failed or timed out
    #[error("Discovery error ({agent}): {reason}")]
    Discovery { agent: String, reason: String },

    /// Missing or invalid bearer token
    #[error("Authentication failed")]
    Authentication,

    /// Agent process exited abnormally mid-run
    #[error("Session fault for run {run_id}: {reason}")]
    SessionFault { run_id: String, reason: String },

    /// Unknown run or session
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current run state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed request payload
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Event relay queue is full
    #[error("Busy: {0}")]
    Busy(String),

    /// Run store error
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code used in wire error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIGURATION",
            Error::UnknownAgent(_) => "UNKNOWN_AGENT",
            Error::Launch { .. } => "LAUNCH_FAILED",
            Error::Discovery { .. } => "DISCOVERY_FAILED",
            Error::Authentication => "UNAUTHENTICATED",
            Error::SessionFault { .. } => "SESSION_FAULT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::Busy(_) => "BUSY",
            Error::Store(_) => "STORE",
            Error::Io(_) | Error::Serialization(_) | Error::Http(_) | Error::Internal(_) => {
                "INTERNAL"
            }
        }
    }

    pub(crate) fn launch(run_id: &str, agent: impl ToString, reason: impl ToString) -> Self {
        Error::Launch {
            run_id: run_id.to_string(),
            agent: agent.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn discovery(agent: impl ToString, reason: impl ToString) -> Self {
        Error::Discovery {
            agent: agent.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for agent-worker operations
pub type Result<T> = std::result::Result<T, Error>;
