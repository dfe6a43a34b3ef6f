//! Run manager
//!
//! The only component that mutates run records or holds live sessions.
//!
//! - `create_run` persists a pending record and wakes the loop
//! - the reconciliation loop launches pending runs through their driver
//! - one watcher per session relays output and records the terminal status
//! - `cancel_run` terminates (running) or short-circuits (pending) a run
//! - hook and plan ingestion validate the session and hand off to the relay
//!
//! Every transition of a run happens under that run's lock.

use super::cache::DiscoveryCache;
use super::events::{EventKind, EventRelay, HookReport, PlanSubmission, RunEvent};
use super::locks::RunLocks;
use crate::config::{DiscoveryConfig, ReconcileConfig};
use crate::driver::{CallbackTarget, DriverRegistry, LaunchSpec, Session, SessionControl, SessionExit};
use crate::error::{Error, Result};
use crate::run::{
    AgentKind, AgentRun, Command, ModelInventory, RunSpec, RunStatus, RunStore, StatusUpdate,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Error text for running runs found without a session at startup
pub const SESSION_LOST: &str = "session lost across worker restart";

/// Error text for sessions stopped by worker shutdown
pub const WORKER_SHUTDOWN: &str = "worker shutting down";

/// Settings the manager runs with
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub worker_id: String,
    pub reconcile: ReconcileConfig,
    pub discovery: DiscoveryConfig,
    pub relay_capacity: usize,
    /// Working directory for runs that do not name one
    pub default_workdir: PathBuf,
}

/// A session currently owned by the manager
#[derive(Clone)]
struct LiveSession {
    run_id: String,
    session_id: String,
    agent: AgentKind,
    control: Arc<dyn SessionControl>,
    /// Set once a cancel or shutdown started terminating it
    stopping: Arc<AtomicBool>,
}

/// Outcome of startup recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running records marked failed
    pub orphaned: usize,
    /// Pending records left for the loop
    pub pending: usize,
}

struct Inner {
    settings: ManagerSettings,
    store: Arc<dyn RunStore>,
    drivers: DriverRegistry,
    callback: CallbackTarget,
    /// run ID -> live session
    live: RwLock<HashMap<String, LiveSession>>,
    /// session ID -> run ID
    sessions: RwLock<HashMap<String, String>>,
    locks: RunLocks,
    wake: Notify,
    shutdown: CancellationToken,
    /// Reconciliation loop and in-flight launches
    tasks: TaskTracker,
    watchers: TaskTracker,
    relay: EventRelay,
    cache: DiscoveryCache,
}

/// Owns run lifecycles for one worker
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<Inner>,
}

impl RunManager {
    /// Must be called inside a Tokio runtime
    pub fn new(
        settings: ManagerSettings,
        store: Arc<dyn RunStore>,
        drivers: DriverRegistry,
        callback: CallbackTarget,
    ) -> Self {
        let relay = EventRelay::new(settings.relay_capacity);
        let cache = DiscoveryCache::new(settings.discovery.cache_ttl());
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                drivers,
                callback,
                live: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                locks: RunLocks::new(),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                watchers: TaskTracker::new(),
                relay,
                cache,
            }),
        }
    }

    // =========================================================================
    // Desired state
    // =========================================================================

    /// Persist a pending run. Never launches; the loop does.
    pub async fn create_run(&self, spec: RunSpec) -> Result<AgentRun> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::InvalidState("worker is shutting down".to_string()));
        }
        if spec.prompt.trim().is_empty() {
            return Err(Error::BadRequest("prompt must not be empty".to_string()));
        }
        let (agent, _) = self.inner.drivers.resolve(&spec.agent)?;

        let id = match spec.id {
            Some(id) => {
                validate_run_id(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let workdir = spec
            .workdir
            .filter(|w| !w.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.inner.settings.default_workdir.clone());

        let now = Utc::now();
        let run = AgentRun {
            id,
            thread_id: spec.thread_id,
            worker_id: self.inner.settings.worker_id.clone(),
            prompt: spec.prompt,
            status: RunStatus::Pending,
            agent,
            model: spec.model.unwrap_or_default(),
            mode: spec.mode.unwrap_or_default(),
            yolo: spec.yolo,
            workdir: workdir.to_string_lossy().into_owned(),
            session_id: String::new(),
            error: String::new(),
            created_at: now,
            updated_at: now,
        };

        let run = self.inner.store.create_agent_run(run).await?;
        tracing::info!(
            run_id = %run.id,
            thread_id = %run.thread_id,
            agent = %run.agent,
            "Run created"
        );
        self.inner.wake.notify_one();
        Ok(run)
    }

    /// Cancel a run. Terminal runs are left untouched.
    pub async fn cancel_run(&self, run_id: &str) -> Result<AgentRun> {
        let _guard = self.inner.locks.acquire(run_id).await;
        let run = self
            .inner
            .store
            .get_agent_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?;

        match run.status {
            status if status.is_terminal() => {
                tracing::debug!(run_id = run_id, status = %status, "Cancel of terminal run ignored");
                Ok(run)
            }
            RunStatus::Pending => {
                let run = self
                    .inner
                    .store
                    .update_agent_run_status(run_id, StatusUpdate::to(RunStatus::Cancelled))
                    .await?;
                tracing::info!(run_id = run_id, "Pending run cancelled");
                Ok(run)
            }
            _ => {
                let live = self.inner.live.read().await.get(run_id).cloned();
                if let Some(live) = &live {
                    live.stopping.store(true, Ordering::SeqCst);
                    live.control.terminate().await;
                }
                let run = self
                    .inner
                    .store
                    .update_agent_run_status(run_id, StatusUpdate::to(RunStatus::Cancelled))
                    .await?;
                tracing::info!(
                    run_id = run_id,
                    session_id = %run.session_id,
                    "Running run cancelled"
                );
                self.inner.relay.publish(RunEvent::new(
                    &run.id,
                    &run.session_id,
                    run.agent,
                    EventKind::Exited {
                        status: RunStatus::Cancelled,
                        error: None,
                    },
                ));
                Ok(run)
            }
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<AgentRun> {
        self.inner
            .store
            .get_agent_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))
    }

    pub async fn list_runs_by_thread(&self, thread_id: &str) -> Result<Vec<AgentRun>> {
        self.inner.store.list_agent_runs_by_thread(thread_id).await
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Registered agents
    pub fn agents(&self) -> Vec<AgentKind> {
        self.inner.drivers.kinds()
    }

    pub async fn discover_models(&self, agent: &str, workdir: Option<&Path>) -> Result<ModelInventory> {
        let (kind, driver) = self.inner.drivers.resolve(agent)?;
        let workdir = workdir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.inner.settings.default_workdir.clone());

        if let Some(hit) = self.inner.cache.models(kind, &workdir) {
            return Ok(hit);
        }

        let deadline = self.inner.settings.discovery.timeout();
        let inventory = tokio::time::timeout(deadline, driver.discover_models(&workdir))
            .await
            .map_err(|_| Error::discovery(kind, format!("model discovery timed out after {:?}", deadline)))??;

        self.inner.cache.store_models(kind, &workdir, &inventory);
        Ok(inventory)
    }

    pub async fn discover_commands(&self, agent: &str) -> Result<Vec<Command>> {
        let (kind, driver) = self.inner.drivers.resolve(agent)?;
        if let Some(hit) = self.inner.cache.commands(kind) {
            return Ok(hit);
        }

        let deadline = self.inner.settings.discovery.timeout();
        let commands = tokio::time::timeout(deadline, driver.discover_commands())
            .await
            .map_err(|_| Error::discovery(kind, format!("command discovery timed out after {:?}", deadline)))??;

        self.inner.cache.store_commands(kind, &commands);
        Ok(commands)
    }

    // =========================================================================
    // Event ingestion
    // =========================================================================

    /// Accept a hook report from a live session
    pub async fn handle_hook_report(&self, report: HookReport) -> Result<()> {
        if report.hook_name.trim().is_empty() {
            return Err(Error::BadRequest("hook name must not be empty".to_string()));
        }
        let live = self.live_session(&report.session_id).await?;
        if live.agent != report.agent {
            return Err(Error::BadRequest(format!(
                "session {} belongs to {}, not {}",
                report.session_id, live.agent, report.agent
            )));
        }
        self.inner.relay.submit(RunEvent::new(
            &live.run_id,
            &live.session_id,
            live.agent,
            EventKind::Hook {
                name: report.hook_name,
                payload: report.payload,
            },
        ))
    }

    /// Accept a plan from a live session
    pub async fn handle_plan_submission(&self, submission: PlanSubmission) -> Result<()> {
        if submission.plan.trim().is_empty() {
            return Err(Error::BadRequest("plan must not be empty".to_string()));
        }
        let live = self.live_session(&submission.session_id).await?;
        self.inner.relay.submit(RunEvent::new(
            &live.run_id,
            &live.session_id,
            live.agent,
            EventKind::Plan {
                text: submission.plan,
            },
        ))
    }

    async fn live_session(&self, session_id: &str) -> Result<LiveSession> {
        let run_id = self
            .inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no running session {}", session_id)))?;
        let live = self
            .inner
            .live
            .read()
            .await
            .get(&run_id)
            .cloned()
            .filter(|l| l.session_id == session_id && !l.stopping.load(Ordering::SeqCst))
            .ok_or_else(|| Error::NotFound(format!("no running session {}", session_id)))?;
        Ok(live)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.relay.subscribe()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Fail running records that have no session in this process
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for run in self
            .inner
            .store
            .list_agent_runs_by_status(RunStatus::Running)
            .await?
        {
            let _guard = self.inner.locks.acquire(&run.id).await;
            if self.inner.live.read().await.contains_key(&run.id) {
                continue;
            }
            match self
                .inner
                .store
                .update_agent_run_status(
                    &run.id,
                    StatusUpdate::to(RunStatus::Failed).with_error(SESSION_LOST),
                )
                .await
            {
                Ok(_) => {
                    report.orphaned += 1;
                    tracing::warn!(
                        run_id = %run.id,
                        session_id = %run.session_id,
                        "Running run has no session after restart, marked failed"
                    );
                }
                Err(Error::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }

        report.pending = self
            .inner
            .store
            .list_agent_runs_by_status(RunStatus::Pending)
            .await?
            .len();
        tracing::info!(
            orphaned = report.orphaned,
            pending = report.pending,
            "Run recovery complete"
        );
        self.inner.wake.notify_one();
        Ok(report)
    }

    /// Spawn the reconciliation loop
    pub fn start(&self) {
        let manager = self.clone();
        self.inner.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(manager.inner.settings.reconcile.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = manager.inner.settings.reconcile.interval_ms,
                "Reconciliation loop started"
            );
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    _ = manager.inner.wake.notified() => {}
                    _ = ticker.tick() => {}
                }
                if let Err(e) = manager.reconcile_once().await {
                    tracing::warn!("Reconciliation pass failed: {}", e);
                }
            }
            tracing::info!("Reconciliation loop stopped");
        });
    }

    /// One scan of pending runs; returns how many launches were started
    pub async fn reconcile_once(&self) -> Result<usize> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(0);
        }
        self.inner.locks.prune();

        let pending = self
            .inner
            .store
            .list_pending_agent_runs(self.inner.settings.reconcile.batch_limit)
            .await?;

        let mut started = 0;
        for run in pending {
            // Held means a launch or cancel is already in progress
            let Some(guard) = self.inner.locks.try_acquire(&run.id) else {
                continue;
            };
            let manager = self.clone();
            self.inner.tasks.spawn(async move {
                manager.launch_run(run.id, guard).await;
            });
            started += 1;
        }
        Ok(started)
    }

    async fn launch_run(&self, run_id: String, _guard: super::locks::RunGuard) {
        let run = match self.inner.store.get_agent_run(&run_id).await {
            Ok(Some(run)) if run.status == RunStatus::Pending => run,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(run_id = %run_id, "Failed to load run for launch: {}", e);
                return;
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let result = match self.inner.drivers.get(run.agent) {
            Some(driver) => {
                let spec = LaunchSpec {
                    run_id: run.id.clone(),
                    session_id: session_id.clone(),
                    prompt: run.prompt.clone(),
                    workdir: PathBuf::from(&run.workdir),
                    model: Some(run.model.clone()).filter(|m| !m.is_empty()),
                    mode: Some(run.mode.clone()).filter(|m| !m.is_empty()),
                    yolo: run.yolo,
                    callback: self.inner.callback.clone(),
                };
                let deadline = self.inner.settings.reconcile.launch_timeout();
                match tokio::time::timeout(deadline, driver.launch(spec)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::launch(
                        &run.id,
                        run.agent,
                        format!("launch timed out after {:?}", deadline),
                    )),
                }
            }
            None => Err(Error::UnknownAgent(format!(
                "{} (not enabled on this worker)",
                run.agent
            ))),
        };

        match result {
            Ok(session) => self.register_session(run, session).await,
            Err(e) => {
                tracing::warn!(
                    run_id = %run.id,
                    agent = %run.agent,
                    "Launch failed: {}",
                    e
                );
                let update = StatusUpdate::to(RunStatus::Failed)
                    .with_session(&session_id)
                    .with_error(e.to_string());
                if let Err(e) = self.inner.store.update_agent_run_status(&run.id, update).await {
                    tracing::error!(run_id = %run.id, "Failed to record launch failure: {}", e);
                }
                self.inner.relay.publish(RunEvent::new(
                    &run.id,
                    &session_id,
                    run.agent,
                    EventKind::Exited {
                        status: RunStatus::Failed,
                        error: Some(e.to_string()),
                    },
                ));
            }
        }
    }

    async fn register_session(&self, run: AgentRun, session: Session) {
        let update = StatusUpdate::to(RunStatus::Running).with_session(&session.id);
        if let Err(e) = self.inner.store.update_agent_run_status(&run.id, update).await {
            tracing::error!(
                run_id = %run.id,
                session_id = %session.id,
                "Failed to record running state, terminating session: {}",
                e
            );
            session.control.terminate().await;
            return;
        }

        let live = LiveSession {
            run_id: run.id.clone(),
            session_id: session.id.clone(),
            agent: run.agent,
            control: session.control.clone(),
            stopping: Arc::new(AtomicBool::new(false)),
        };
        self.inner
            .sessions
            .write()
            .await
            .insert(session.id.clone(), run.id.clone());
        self.inner.live.write().await.insert(run.id.clone(), live);

        tracing::info!(
            run_id = %run.id,
            session_id = %session.id,
            agent = %run.agent,
            "Run is running"
        );

        let manager = self.clone();
        self.inner.watchers.spawn(async move {
            manager.watch_session(run.id, run.agent, session).await;
        });
    }

    async fn watch_session(&self, run_id: String, agent: AgentKind, mut session: Session) {
        while let Some(event) = session.events.recv().await {
            self.inner.relay.publish(RunEvent::new(
                &run_id,
                &session.id,
                agent,
                EventKind::Output { event },
            ));
        }
        let exit = (&mut session.outcome)
            .await
            .unwrap_or_else(|_| SessionExit::Failed("session ended without an outcome".to_string()));

        let _guard = self.inner.locks.acquire(&run_id).await;
        self.forget_session(&run_id, &session.id).await;

        let run = match self.inner.store.get_agent_run(&run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(run_id = %run_id, "Failed to load run after exit: {}", e);
                return;
            }
        };
        if run.status != RunStatus::Running {
            // Cancel already recorded the terminal status
            return;
        }

        let update = match exit {
            SessionExit::Completed => StatusUpdate::to(RunStatus::Completed),
            SessionExit::Failed(reason) => {
                let fault = Error::SessionFault {
                    run_id: run_id.clone(),
                    reason,
                };
                StatusUpdate::to(RunStatus::Failed).with_error(fault.to_string())
            }
            SessionExit::Terminated if self.inner.shutdown.is_cancelled() => {
                StatusUpdate::to(RunStatus::Failed).with_error(WORKER_SHUTDOWN)
            }
            SessionExit::Terminated => {
                StatusUpdate::to(RunStatus::Failed).with_error("session terminated unexpectedly")
            }
        };

        let status = update.status;
        let error = update.error.clone();
        match self.inner.store.update_agent_run_status(&run_id, update).await {
            Ok(_) => {
                tracing::info!(
                    run_id = %run_id,
                    session_id = %session.id,
                    status = %status,
                    "Run finished"
                );
                self.inner.relay.publish(RunEvent::new(
                    &run_id,
                    &session.id,
                    agent,
                    EventKind::Exited { status, error },
                ));
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, "Failed to record run exit: {}", e);
            }
        }
    }

    async fn forget_session(&self, run_id: &str, session_id: &str) {
        let mut live = self.inner.live.write().await;
        if live.get(run_id).map(|l| l.session_id.as_str()) == Some(session_id) {
            live.remove(run_id);
        }
        drop(live);
        self.inner.sessions.write().await.remove(session_id);
    }

    /// Stop the loop, let in-flight launches settle, terminate every session
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let live: Vec<LiveSession> = self.inner.live.read().await.values().cloned().collect();
        if !live.is_empty() {
            tracing::info!(sessions = live.len(), "Terminating live sessions");
        }
        futures::future::join_all(live.iter().map(|l| {
            l.stopping.store(true, Ordering::SeqCst);
            l.control.terminate()
        }))
        .await;

        self.inner.watchers.close();
        self.inner.watchers.wait().await;
        tracing::info!("Run manager stopped");
    }

    /// Number of sessions currently owned
    pub async fn live_count(&self) -> usize {
        self.inner.live.read().await.len()
    }
}

/// Run IDs become file names and URL segments
fn validate_run_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::BadRequest(format!("invalid run id {:?}", id)))
    }
}
