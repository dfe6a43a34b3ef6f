//! Run store with file-based JSON persistence
//!
//! Directory layout:
//! ```text
//! <base_dir>/runs/
//! ├── <run-id>.json
//! └── ...
//! ```
//!
//! Records are cached in memory and written through on every mutation, so a
//! restarted worker sees the same pending and running runs it left behind.
//! A mutation reaches the cache only after its file is on disk.

use crate::error::{Error, Result};
use crate::run::store::{apply_update, MemoryRunStore, RunStore, StatusUpdate};
use crate::run::types::{AgentRun, RunStatus};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// JSON-file backed run store
pub struct FileRunStore {
    runs_dir: PathBuf,
    cache: MemoryRunStore,
    /// Serializes mutate-then-write so files never go backwards
    write_lock: Mutex<()>,
}

impl FileRunStore {
    /// Open (or create) a store at the given base directory
    pub async fn open(base_dir: &Path) -> Result<Self> {
        let runs_dir = base_dir.join("runs");
        tokio::fs::create_dir_all(&runs_dir).await.map_err(|e| {
            Error::Store(format!("failed to create {}: {}", runs_dir.display(), e))
        })?;

        let runs = load_json_files(&runs_dir).await;
        tracing::info!(dir = %runs_dir.display(), count = runs.len(), "Loaded run records");

        Ok(Self {
            runs_dir,
            cache: MemoryRunStore::from_runs(runs),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            || id.starts_with('.')
        {
            return Err(Error::BadRequest(format!("run id not storable: {:?}", id)));
        }
        Ok(self.runs_dir.join(format!("{}.json", id)))
    }

    async fn persist(&self, run: &AgentRun) -> Result<()> {
        let path = self.path_for(&run.id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(run)?;
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            return Err(Error::Store(format!("failed to write {}: {}", tmp.display(), e)));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Store(format!("failed to commit {}: {}", path.display(), e)));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn create_agent_run(&self, run: AgentRun) -> Result<AgentRun> {
        self.path_for(&run.id)?;
        let _guard = self.write_lock.lock().await;
        if self.cache.get_agent_run(&run.id).await?.is_some() {
            return Err(Error::InvalidState(format!("run {} already exists", run.id)));
        }
        self.persist(&run).await?;
        self.cache.create_agent_run(run).await
    }

    async fn get_agent_run(&self, id: &str) -> Result<Option<AgentRun>> {
        self.cache.get_agent_run(id).await
    }

    async fn list_agent_runs_by_thread(&self, thread_id: &str) -> Result<Vec<AgentRun>> {
        self.cache.list_agent_runs_by_thread(thread_id).await
    }

    async fn list_pending_agent_runs(&self, limit: usize) -> Result<Vec<AgentRun>> {
        self.cache.list_pending_agent_runs(limit).await
    }

    async fn list_agent_runs_by_status(&self, status: RunStatus) -> Result<Vec<AgentRun>> {
        self.cache.list_agent_runs_by_status(status).await
    }

    async fn update_agent_run_status(&self, id: &str, update: StatusUpdate) -> Result<AgentRun> {
        let _guard = self.write_lock.lock().await;
        let mut run = self
            .cache
            .get_agent_run(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", id)))?;
        apply_update(&mut run, &update)?;
        self.persist(&run).await?;
        self.cache.commit(run.clone()).await;
        Ok(run)
    }
}

/// Load every parseable `*.json` record; unreadable files are skipped with a warning
async fn load_json_files(dir: &Path) -> Vec<AgentRun> {
    let mut items = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read directory {}: {}", dir.display(), e);
            }
            return items;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<AgentRun>(&data) {
                Ok(run) => items.push(run),
                Err(e) => tracing::warn!("Failed to parse {}: {}", path.display(), e),
            },
            Err(e) => tracing::warn!("Failed to read {}: {}", path.display(), e),
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_run;
    use tempfile::TempDir;

    async fn make_store() -> (FileRunStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_create_writes_file() {
        let (store, dir) = make_store().await;
        store.create_agent_run(sample_run("run-1", "t1")).await.unwrap();
        assert!(dir.path().join("runs").join("run-1.json").exists());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let (store, dir) = make_store().await;
        store.create_agent_run(sample_run("run-1", "t1")).await.unwrap();
        store.create_agent_run(sample_run("run-2", "t1")).await.unwrap();
        store
            .update_agent_run_status(
                "run-1",
                StatusUpdate::to(RunStatus::Running).with_session("sess-1"),
            )
            .await
            .unwrap();
        drop(store);

        let reopened = FileRunStore::open(dir.path()).await.unwrap();
        let run = reopened.get_agent_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.session_id, "sess-1");
        assert_eq!(reopened.list_pending_agent_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let runs = dir.path().join("runs");
        std::fs::create_dir_all(&runs).unwrap();
        std::fs::write(runs.join("bad.json"), "{not json").unwrap();
        std::fs::write(runs.join("notes.txt"), "ignored").unwrap();

        let store = FileRunStore::open(dir.path()).await.unwrap();
        assert!(store
            .list_agent_runs_by_status(RunStatus::Pending)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let (store, _dir) = make_store().await;
        let err = store
            .create_agent_run(sample_run("../escape", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert!(store.get_agent_run("../escape").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_file_untouched() {
        let (store, dir) = make_store().await;
        store.create_agent_run(sample_run("run-1", "t1")).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("runs/run-1.json")).unwrap();

        assert!(store
            .update_agent_run_status("run-1", StatusUpdate::to(RunStatus::Completed))
            .await
            .is_err());
        let after = std::fs::read_to_string(dir.path().join("runs/run-1.json")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_record() {
        let (store, dir) = make_store().await;
        // A directory where the temp file goes makes the write fail
        std::fs::create_dir_all(dir.path().join("runs/run-1.json.tmp")).unwrap();

        let err = store
            .create_agent_run(sample_run("run-1", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert!(store.get_agent_run("run-1").await.unwrap().is_none());
        assert!(store.list_pending_agent_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_status() {
        let (store, dir) = make_store().await;
        store.create_agent_run(sample_run("run-1", "t1")).await.unwrap();
        std::fs::create_dir_all(dir.path().join("runs/run-1.json.tmp")).unwrap();

        let err = store
            .update_agent_run_status(
                "run-1",
                StatusUpdate::to(RunStatus::Failed).with_error("launch failed"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        let run = store.get_agent_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.error.is_empty());

        std::fs::remove_dir(dir.path().join("runs/run-1.json.tmp")).unwrap();
        let run = store
            .update_agent_run_status(
                "run-1",
                StatusUpdate::to(RunStatus::Running).with_session("sess-1"),
            )
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
        let reopened = FileRunStore::open(dir.path()).await.unwrap();
        let on_disk = reopened.get_agent_run("run-1").await.unwrap().unwrap();
        assert_eq!(on_disk.session_id, "sess-1");
    }
}
