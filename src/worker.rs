//! Worker assembly
//!
//! Owns the configuration, both secrets, the store, the driver registry, the
//! run manager and both listeners. Start order matters: the CTL address is
//! part of every launch, so the CTL listener is bound before the manager
//! exists, and the public listener only opens once recovery is done.

use crate::config::{StorageBackend, WorkerConfig};
use crate::driver::{CallbackTarget, DriverRegistry};
use crate::error::{Error, Result};
use crate::listener::BoundListener;
use crate::manager::{ManagerSettings, RunManager};
use crate::rpc::{ctl_router, public_router, PublicState};
use crate::run::{FileRunStore, MemoryRunStore, RunStore};
use crate::secret::{CtlSecret, PublicSecret};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long stop waits for listeners to drain open connections
const LISTENER_DRAIN: Duration = Duration::from_secs(5);

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Everything that only exists while the worker runs
struct Runtime {
    manager: RunManager,
    listeners: CancellationToken,
    servers: Vec<(&'static str, JoinHandle<Result<()>>)>,
    public_addr: SocketAddr,
    ctl_addr: SocketAddr,
}

pub struct Worker {
    config: WorkerConfig,
    public_secret: Arc<PublicSecret>,
    /// Generated once per process; never persisted
    ctl_secret: Arc<CtlSecret>,
    store: Arc<dyn RunStore>,
    drivers: DriverRegistry,
    state: RwLock<WorkerState>,
    runtime: Mutex<Option<Runtime>>,
}

impl Worker {
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn public_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().await.as_ref().map(|r| r.public_addr)
    }

    pub async fn ctl_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().await.as_ref().map(|r| r.ctl_addr)
    }

    pub async fn manager(&self) -> Option<RunManager> {
        self.runtime.lock().await.as_ref().map(|r| r.manager.clone())
    }

    /// Bind CTL, recover, start reconciling, then open the public listener
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != WorkerState::Stopped {
            return Err(Error::InvalidState("worker already running".to_string()));
        }
        *state = WorkerState::Starting;
        drop(state);

        match self.start_inner().await {
            Ok(runtime) => {
                *self.runtime.lock().await = Some(runtime);
                *self.state.write().await = WorkerState::Running;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = WorkerState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<Runtime> {
        tracing::info!(worker_id = %self.config.worker.id, "Starting agent worker");
        let listeners = CancellationToken::new();

        let ctl = BoundListener::ctl().await?;
        let ctl_addr = ctl.local_addr();
        let callback = CallbackTarget {
            ctl_url: ctl.base_url(),
            secret: self.ctl_secret.clone(),
            helper_command: self.helper_command(),
        };
        tracing::info!(
            %ctl_addr,
            ctl_secret = %self.ctl_secret.fingerprint(),
            "CTL listener bound"
        );

        let manager = RunManager::new(
            self.manager_settings(),
            self.store.clone(),
            self.drivers.clone(),
            callback,
        );
        let mut servers = vec![(
            "ctl",
            tokio::spawn(ctl.serve(
                ctl_router(manager.clone(), self.ctl_secret.clone()),
                listeners.clone(),
            )),
        )];

        let started = async {
            manager.recover().await?;
            manager.start();
            BoundListener::public(&self.config.public).await
        }
        .await;
        let public = match started {
            Ok(public) => public,
            Err(e) => {
                listeners.cancel();
                manager.shutdown().await;
                return Err(e);
            }
        };

        let public_addr = public.local_addr();
        let state = PublicState {
            manager: manager.clone(),
            worker_id: self.config.worker.id.clone(),
            tls: public.is_tls(),
            closing: listeners.clone(),
        };
        tracing::info!(
            %public_addr,
            tls = public.is_tls(),
            agents = ?manager.agents(),
            public_secret = %self.public_secret.fingerprint(),
            "Public listener bound"
        );
        servers.push((
            "public",
            tokio::spawn(public.serve(
                public_router(state, self.public_secret.clone()),
                listeners.clone(),
            )),
        ));

        Ok(Runtime {
            manager,
            listeners,
            servers,
            public_addr,
            ctl_addr,
        })
    }

    /// Close both listeners, then stop the manager and every session
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != WorkerState::Running {
            return Ok(());
        }
        *state = WorkerState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping agent worker");
        let runtime = self.runtime.lock().await.take();
        if let Some(runtime) = runtime {
            runtime.listeners.cancel();
            for (name, mut server) in runtime.servers {
                match tokio::time::timeout(LISTENER_DRAIN, &mut server).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => tracing::warn!(listener = name, "Listener failed: {}", e),
                    Ok(Err(e)) => tracing::warn!(listener = name, "Listener task panicked: {}", e),
                    Err(_) => {
                        tracing::warn!(listener = name, "Listener did not drain in time");
                        server.abort();
                    }
                }
            }
            runtime.manager.shutdown().await;
        }

        *self.state.write().await = WorkerState::Stopped;
        tracing::info!("Agent worker stopped");
        Ok(())
    }

    fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            worker_id: self.config.worker.id.clone(),
            reconcile: self.config.reconcile.clone(),
            discovery: self.config.discovery.clone(),
            relay_capacity: self.config.ctl.relay_capacity,
            default_workdir: std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
        }
    }

    /// Configured helper, else this executable
    fn helper_command(&self) -> PathBuf {
        self.config
            .worker
            .helper_command
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_PKG_NAME")))
    }
}

/// Builder for [`Worker`]
pub struct WorkerBuilder {
    config: WorkerConfig,
    public_secret: Option<String>,
    store: Option<Arc<dyn RunStore>>,
    drivers: Option<DriverRegistry>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            public_secret: None,
            store: None,
            drivers: None,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.public.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.public.port = port;
        self
    }

    pub fn public_secret(mut self, secret: impl Into<String>) -> Self {
        self.public_secret = Some(secret.into());
        self
    }

    /// Replace the configured store backend
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the drivers built from `[agents]`
    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = Some(drivers);
        self
    }

    pub async fn build(self) -> Result<Worker> {
        self.config.validate()?;
        let public_secret = PublicSecret::new(self.public_secret.unwrap_or_default())?;

        let store: Arc<dyn RunStore> = match self.store {
            Some(store) => store,
            None => match self.config.storage.backend {
                StorageBackend::Memory => Arc::new(MemoryRunStore::new()),
                StorageBackend::File => {
                    Arc::new(FileRunStore::open(&self.config.storage.base_dir).await?)
                }
            },
        };
        let drivers = self.drivers.unwrap_or_else(|| {
            DriverRegistry::from_config(
                &self.config.agents,
                self.config.reconcile.terminate_grace(),
                self.config.discovery.timeout(),
            )
        });
        if drivers.kinds().is_empty() {
            return Err(Error::Config("no agent is enabled".to_string()));
        }

        Ok(Worker {
            config: self.config,
            public_secret: Arc::new(public_secret),
            ctl_secret: Arc::new(CtlSecret::generate()),
            store,
            drivers,
            state: RwLock::new(WorkerState::Stopped),
            runtime: Mutex::new(None),
        })
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
