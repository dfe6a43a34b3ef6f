//! Run store collaborator
//!
//! The worker only needs a key-value view of run records keyed by run ID.
//! The relational store the control plane uses sits behind this trait;
//! [`MemoryRunStore`] and [`FileRunStore`](super::FileRunStore) make the
//! worker runnable on its own.

use crate::error::{Error, Result};
use crate::run::types::{AgentRun, RunStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A status transition requested by the run manager
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: RunStatus,
    /// Assigned on the first launch attempt; rejected if it would change
    pub session_id: Option<String>,
    /// Terminal error text
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: RunStatus) -> Self {
        Self {
            status,
            session_id: None,
            error: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Persistence interface for run records
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_agent_run(&self, run: AgentRun) -> Result<AgentRun>;

    async fn get_agent_run(&self, id: &str) -> Result<Option<AgentRun>>;

    async fn list_agent_runs_by_thread(&self, thread_id: &str) -> Result<Vec<AgentRun>>;

    /// Oldest first, at most `limit`
    async fn list_pending_agent_runs(&self, limit: usize) -> Result<Vec<AgentRun>>;

    async fn list_agent_runs_by_status(&self, status: RunStatus) -> Result<Vec<AgentRun>>;

    /// Apply a transition; invalid transitions are rejected without mutation
    async fn update_agent_run_status(&self, id: &str, update: StatusUpdate) -> Result<AgentRun>;
}

/// Validate and apply `update` to `run` in place
pub(crate) fn apply_update(run: &mut AgentRun, update: &StatusUpdate) -> Result<()> {
    if !run.status.can_transition_to(update.status) {
        return Err(Error::InvalidState(format!(
            "run {} cannot move from {} to {}",
            run.id, run.status, update.status
        )));
    }
    if let Some(session_id) = &update.session_id {
        if !run.session_id.is_empty() && &run.session_id != session_id {
            return Err(Error::InvalidState(format!(
                "run {} already bound to session {}",
                run.id, run.session_id
            )));
        }
        run.session_id = session_id.clone();
    }
    if let Some(error) = &update.error {
        run.error = error.clone();
    }
    run.status = update.status;
    run.updated_at = Utc::now().max(run.updated_at);
    Ok(())
}

pub(crate) fn pending_oldest_first<'a>(
    runs: impl Iterator<Item = &'a AgentRun>,
    limit: usize,
) -> Vec<AgentRun> {
    let mut pending: Vec<AgentRun> = runs
        .filter(|r| r.status == RunStatus::Pending)
        .cloned()
        .collect();
    pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    pending.truncate(limit);
    pending
}

/// In-memory run store
#[derive(Default, Clone)]
pub struct MemoryRunStore {
    runs: Arc<RwLock<HashMap<String, AgentRun>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_runs(runs: Vec<AgentRun>) -> Self {
        let map = runs.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            runs: Arc::new(RwLock::new(map)),
        }
    }

    /// Overwrite a record that was validated and persisted elsewhere
    pub(crate) async fn commit(&self, run: AgentRun) {
        self.runs.write().await.insert(run.id.clone(), run);
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_agent_run(&self, run: AgentRun) -> Result<AgentRun> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(Error::InvalidState(format!("run {} already exists", run.id)));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_agent_run(&self, id: &str) -> Result<Option<AgentRun>> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn list_agent_runs_by_thread(&self, thread_id: &str) -> Result<Vec<AgentRun>> {
        let runs = self.runs.read().await;
        let mut matched: Vec<AgentRun> = runs
            .values()
            .filter(|r| r.thread_id == thread_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matched)
    }

    async fn list_pending_agent_runs(&self, limit: usize) -> Result<Vec<AgentRun>> {
        let runs = self.runs.read().await;
        Ok(pending_oldest_first(runs.values(), limit))
    }

    async fn list_agent_runs_by_status(&self, status: RunStatus) -> Result<Vec<AgentRun>> {
        let runs = self.runs.read().await;
        Ok(runs.values().filter(|r| r.status == status).cloned().collect())
    }

    async fn update_agent_run_status(&self, id: &str, update: StatusUpdate) -> Result<AgentRun> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("run {}", id)))?;
        apply_update(run, &update)?;
        Ok(run.clone())
    }
}
