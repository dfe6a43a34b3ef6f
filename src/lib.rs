//! agent-worker - Worker node for coding-agent sessions
//!
//! A central control plane asks the worker to run coding agents (Claude
//! Code, Codex, Gemini CLI, OpenCode) against local working directories. The
//! worker owns the lifecycle of every session it starts and lets the agents
//! call back through a private, per-process authenticated channel.
//!
//! ## Architecture
//!
//! ```text
//!        control plane
//!              │ Bearer <public secret>
//! ┌────────────▼──────────────────────────────────────────────────────┐
//! │                          agent-worker                             │
//! │  ┌──────────────────────┐          ┌──────────────────────────┐   │
//! │  │ Public listener      │          │ CTL listener             │   │
//! │  │ (host:port, TLS opt) │          │ (127.0.0.1:0)            │   │
//! │  └──────────┬───────────┘          └────────────▲─────────────┘   │
//! │             │ create / cancel / discover        │ hooks / plans   │
//! │  ┌──────────▼───────────────────────────────────┴─────────────┐   │
//! │  │                       Run Manager                           │   │
//! │  │  - reconciliation loop: pending runs -> sessions            │   │
//! │  │  - one watcher per session, terminal status on exit         │   │
//! │  │  - per-run locks, event relay, discovery cache              │   │
//! │  └──────────┬──────────────────────────────────────────────────┘   │
//! │             │ launch / discover                                    │
//! │  ┌──────────▼───────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐       │
//! │  │ claude           │ │ codex    │ │ gemini   │ │ opencode │       │
//! │  └──────────┬───────┘ └────┬─────┘ └────┬─────┘ └────┬─────┘       │
//! └─────────────┼──────────────┼────────────┼────────────┼─────────────┘
//!               ▼              ▼            ▼            ▼
//!          agent CLI processes ──spawn──▶ `agent-worker hook|plan`
//!                                          (Bearer <CTL secret>)
//! ```
//!
//! ## Modules
//!
//! - [`worker`]: assembly and start/stop ordering
//! - [`manager`]: run lifecycle, reconciliation, event ingestion
//! - [`driver`]: one driver per agent CLI
//! - [`run`]: run records and the store collaborator
//! - [`rpc`]: public and CTL HTTP surfaces
//! - [`listener`]: socket binding and TLS
//! - [`secret`]: the two secret domains
//! - [`helper`]: the `hook` / `plan` helper client
//! - [`config`]: configuration management

pub mod config;
pub mod driver;
pub mod error;
pub mod helper;
pub mod listener;
pub mod manager;
pub mod rpc;
pub mod run;
pub mod secret;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::WorkerConfig;
pub use error::{Error, Result};
pub use manager::RunManager;
pub use worker::{Worker, WorkerBuilder};
