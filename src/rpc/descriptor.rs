//! API reflection document served at `/.well-known/agent-worker.json`

use crate::run::AgentKind;
use serde::Serialize;

/// One public route
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub method: &'static str,
    pub path: &'static str,
    pub description: &'static str,
}

/// Self-description of a worker's public surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDescriptor {
    pub name: &'static str,
    pub version: &'static str,
    pub worker_id: String,
    pub agents: Vec<AgentKind>,
    pub tls: bool,
    /// Authentication scheme every endpoint requires
    pub auth: &'static str,
    pub endpoints: Vec<Endpoint>,
}

const ENDPOINTS: &[(&str, &str, &str)] = &[
    ("POST", "/api/v1/runs", "Create a pending run"),
    ("GET", "/api/v1/runs", "List runs of a thread (?threadId=)"),
    ("GET", "/api/v1/runs/:id", "Get a run"),
    ("POST", "/api/v1/runs/:id/cancel", "Cancel a run"),
    ("GET", "/api/v1/agents", "List enabled agents"),
    ("GET", "/api/v1/agents/:agent/models", "Discover models (?workdir=)"),
    ("GET", "/api/v1/agents/:agent/commands", "Discover built-in commands"),
    ("GET", "/api/v1/events", "Run event stream (SSE, ?runId=)"),
    ("GET", "/.well-known/agent-worker.json", "This document"),
    ("GET", "/health", "Liveness probe"),
];

pub fn build_descriptor(worker_id: &str, agents: Vec<AgentKind>, tls: bool) -> WorkerDescriptor {
    WorkerDescriptor {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        worker_id: worker_id.to_string(),
        agents,
        tls,
        auth: "bearer",
        endpoints: ENDPOINTS
            .iter()
            .map(|&(method, path, description)| Endpoint {
                method,
                path,
                description,
            })
            .collect(),
    }
}
