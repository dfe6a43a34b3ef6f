//! Test fixtures shared across modules

use crate::config::{DiscoveryConfig, ReconcileConfig};
use crate::driver::{
    AgentEvent, CallbackTarget, Driver, DriverRegistry, LaunchSpec, Session, SessionControl,
    SessionExit,
};
use crate::error::{Error, Result};
use crate::manager::{ManagerSettings, RunManager};
use crate::run::{
    AgentKind, AgentRun, Command, MemoryRunStore, ModelDescriptor, ModelInventory, RunStatus,
};
use crate::secret::CtlSecret;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A pending claude run in the temp directory
pub fn sample_run(id: &str, thread_id: &str) -> AgentRun {
    let now = Utc::now();
    AgentRun {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        worker_id: "test-worker".to_string(),
        prompt: "fix the build".to_string(),
        status: RunStatus::Pending,
        agent: AgentKind::Claude,
        model: String::new(),
        mode: String::new(),
        yolo: false,
        workdir: std::env::temp_dir().to_string_lossy().into_owned(),
        session_id: String::new(),
        error: String::new(),
        created_at: now,
        updated_at: now,
    }
}

pub fn callback_target() -> CallbackTarget {
    CallbackTarget {
        ctl_url: "http://127.0.0.1:9".to_string(),
        secret: Arc::new(CtlSecret::generate()),
        helper_command: PathBuf::from("agent-worker"),
    }
}

pub fn manager_settings() -> ManagerSettings {
    ManagerSettings {
        worker_id: "test-worker".to_string(),
        reconcile: ReconcileConfig {
            interval_ms: 50,
            batch_limit: 16,
            launch_timeout_secs: 1,
            terminate_grace_secs: 1,
        },
        discovery: DiscoveryConfig {
            timeout_secs: 1,
            cache_ttl_secs: 300,
        },
        relay_capacity: 64,
        default_workdir: std::env::temp_dir(),
    }
}

pub fn test_manager(drivers: Vec<FakeDriver>) -> (RunManager, MemoryRunStore) {
    test_manager_with_runs(drivers, Vec::new())
}

pub fn test_manager_with_runs(
    drivers: Vec<FakeDriver>,
    runs: Vec<AgentRun>,
) -> (RunManager, MemoryRunStore) {
    let store = MemoryRunStore::from_runs(runs);
    let mut registry = DriverRegistry::new();
    for driver in drivers {
        registry.register(Arc::new(driver));
    }
    let manager = RunManager::new(
        manager_settings(),
        Arc::new(store.clone()),
        registry,
        callback_target(),
    );
    (manager, store)
}

// =============================================================================
// Fake driver
// =============================================================================

#[derive(Default)]
struct FakeState {
    launches: AtomicUsize,
    discoveries: AtomicUsize,
    fail_with: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    hang_launch: AtomicBool,
    hang_discovery: AtomicBool,
    sessions: Mutex<Vec<FakeSession>>,
    launched: Mutex<Vec<LaunchSpec>>,
}

/// Scriptable in-process driver
#[derive(Clone)]
pub struct FakeDriver {
    kind: AgentKind,
    state: Arc<FakeState>,
}

impl FakeDriver {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn fail_launches(&self, reason: &str) {
        *self.state.fail_with.lock().unwrap() = Some(reason.to_string());
    }

    pub fn delay_launches(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }

    pub fn hang_launches(&self) {
        self.state.hang_launch.store(true, Ordering::SeqCst);
    }

    pub fn hang_discovery(&self) {
        self.state.hang_discovery.store(true, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn discover_count(&self) -> usize {
        self.state.discoveries.load(Ordering::SeqCst)
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.state.launched.lock().unwrap().clone()
    }

    pub fn inventory(&self) -> ModelInventory {
        ModelInventory {
            default_model: format!("{}-large", self.kind),
            models: vec![
                ModelDescriptor::new(format!("{}-large", self.kind), "Large", "most capable"),
                ModelDescriptor::new(format!("{}-small", self.kind), "Small", "fastest"),
            ],
        }
    }

    /// Waits until the `index`-th session has been launched
    pub async fn session(&self, index: usize) -> FakeSession {
        for _ in 0..500 {
            let found = self.state.sessions.lock().unwrap().get(index).cloned();
            if let Some(session) = found {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} was never launched", index);
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Session> {
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        self.state.launched.lock().unwrap().push(spec.clone());

        let delay = *self.state.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.hang_launch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let fail = self.state.fail_with.lock().unwrap().clone();
        if let Some(reason) = fail {
            return Err(Error::launch(&spec.run_id, self.kind, reason));
        }

        let (events_tx, events) = mpsc::channel(64);
        let (outcome_tx, outcome) = oneshot::channel();
        let control = Arc::new(FakeControl {
            terminations: AtomicUsize::new(0),
            events: Mutex::new(Some(events_tx)),
            outcome: Mutex::new(Some(outcome_tx)),
        });
        self.state.sessions.lock().unwrap().push(FakeSession {
            id: spec.session_id.clone(),
            control: control.clone(),
        });

        Ok(Session {
            id: spec.session_id,
            events,
            outcome,
            control,
        })
    }

    async fn discover_models(&self, _workdir: &Path) -> Result<ModelInventory> {
        self.state.discoveries.fetch_add(1, Ordering::SeqCst);
        if self.state.hang_discovery.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.inventory())
    }

    async fn discover_commands(&self) -> Result<Vec<Command>> {
        Ok(vec![Command::new("review", "Review changes")])
    }
}

// =============================================================================
// Fake session
// =============================================================================

pub struct FakeControl {
    terminations: AtomicUsize,
    events: Mutex<Option<mpsc::Sender<AgentEvent>>>,
    outcome: Mutex<Option<oneshot::Sender<SessionExit>>>,
}

impl FakeControl {
    fn end(&self, exit: SessionExit) {
        self.events.lock().unwrap().take();
        if let Some(tx) = self.outcome.lock().unwrap().take() {
            let _ = tx.send(exit);
        }
    }
}

#[async_trait]
impl SessionControl for FakeControl {
    async fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.end(SessionExit::Terminated);
    }
}

/// Test-side handle of a launched fake session
#[derive(Clone)]
pub struct FakeSession {
    pub id: String,
    control: Arc<FakeControl>,
}

impl FakeSession {
    pub async fn emit_text(&self, text: &str) {
        let tx = self.control.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(AgentEvent::Message {
                    text: text.to_string(),
                })
                .await;
        }
    }

    /// End the session as if the process exited
    pub async fn finish(&self, exit: SessionExit) {
        self.control.end(exit);
    }

    pub fn terminate_count(&self) -> usize {
        self.control.terminations.load(Ordering::SeqCst)
    }
}
