//! Discovery result cache
//!
//! Model inventories depend on the working directory (project config can
//! change the set), so they are keyed by `(agent, workdir)` and expire after
//! a TTL. Built-in commands are static per agent version and are kept until
//! restart.

use crate::run::{AgentKind, Command, ModelInventory};
use moka::sync::Cache;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Distinct (agent, workdir) inventories kept at once
pub const MODEL_CACHE_CAPACITY: u64 = 512;

pub struct DiscoveryCache {
    models: Option<Cache<(AgentKind, PathBuf), ModelInventory>>,
    commands: Mutex<HashMap<AgentKind, Vec<Command>>>,
}

impl DiscoveryCache {
    /// A zero TTL disables model caching
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, MODEL_CACHE_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: u64) -> Self {
        let models = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build()
        });
        Self {
            models,
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn models(&self, agent: AgentKind, workdir: &Path) -> Option<ModelInventory> {
        self.models
            .as_ref()?
            .get(&(agent, workdir.to_path_buf()))
    }

    pub fn store_models(&self, agent: AgentKind, workdir: &Path, inventory: &ModelInventory) {
        if let Some(models) = &self.models {
            models.insert((agent, workdir.to_path_buf()), inventory.clone());
        }
    }

    pub fn commands(&self, agent: AgentKind) -> Option<Vec<Command>> {
        self.commands.lock().ok()?.get(&agent).cloned()
    }

    pub fn store_commands(&self, agent: AgentKind, commands: &[Command]) {
        if let Ok(mut cache) = self.commands.lock() {
            cache.insert(agent, commands.to_vec());
        }
    }
}
