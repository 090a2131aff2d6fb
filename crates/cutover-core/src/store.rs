//! Run persistence
//!
//! One record per plan. Saving a record with a lower `sequence` than the
//! stored one is refused, so a slow writer can never roll the record back.

use crate::error::StoreError;
use cutover_traffic::MigrationRun;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Durable home of [`MigrationRun`] records
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Latest record for `plan`, if any
    async fn load(&self, plan: &str) -> Result<Option<MigrationRun>, StoreError>;

    /// Replace the record for `run.plan_name`
    async fn save(&self, run: &MigrationRun) -> Result<(), StoreError>;
}

fn check_sequence(stored: Option<&MigrationRun>, run: &MigrationRun) -> Result<(), StoreError> {
    match stored {
        Some(stored) if stored.sequence > run.sequence => Err(StoreError::StaleSequence {
            plan: run.plan_name.clone(),
            stored: stored.sequence,
            attempted: run.sequence,
        }),
        _ => Ok(()),
    }
}

/// JSON files under a directory, one `<plan>.json` per plan
///
/// Writes go to `<plan>.json.tmp`, are flushed to disk, then renamed over the
/// record, and the directory is flushed after the rename. A crash leaves
/// either the old or the new record.
#[derive(Debug)]
pub struct FileRunStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRunStore {
    /// Store rooted at `dir`; created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Root directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path for `plan`
    ///
    /// # Errors
    /// `InvalidKey` unless the name is non-empty ASCII alphanumerics, `-`,
    /// `_` or `.`, and not a dot path
    pub fn path_for(&self, plan: &str) -> Result<PathBuf, StoreError> {
        let valid = !plan.is_empty()
            && !plan.starts_with('.')
            && plan
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::InvalidKey(plan.to_string()));
        }
        Ok(self.dir.join(format!("{plan}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Option<MigrationRun>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let io = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(io)?;
        file.write_all(bytes).await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        drop(file);
        tokio::fs::rename(&tmp, path).await.map_err(io)?;
        self.sync_dir().await
    }

    /// Flush the directory entry so the rename itself survives a crash
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<(), StoreError> {
        let io = |source| StoreError::Io {
            path: self.dir.clone(),
            source,
        };
        let dir = tokio::fs::File::open(&self.dir).await.map_err(io)?;
        dir.sync_all().await.map_err(io)
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl RunStore for FileRunStore {
    async fn load(&self, plan: &str) -> Result<Option<MigrationRun>, StoreError> {
        let path = self.path_for(plan)?;
        self.read(&path).await
    }

    async fn save(&self, run: &MigrationRun) -> Result<(), StoreError> {
        let path = self.path_for(&run.plan_name)?;
        let _guard = self.write_lock.lock().await;
        let stored = self.read(&path).await?;
        check_sequence(stored.as_ref(), run)?;

        let bytes = serde_json::to_vec_pretty(run)?;
        self.write_atomic(&path, &bytes).await?;
        tracing::debug!(plan = %run.plan_name, sequence = run.sequence, path = %path.display(), "run saved");
        Ok(())
    }
}

/// In-process store that also keeps every accepted save
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, MigrationRun>>,
    history: Mutex<Vec<MigrationRun>>,
}

impl MemoryRunStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `run`
    #[must_use]
    pub fn with_run(run: MigrationRun) -> Self {
        let store = Self::default();
        store.runs.lock().insert(run.plan_name.clone(), run);
        store
    }

    /// Every accepted save, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<MigrationRun> {
        self.history.lock().clone()
    }
}

#[async_trait::async_trait]
impl RunStore for MemoryRunStore {
    async fn load(&self, plan: &str) -> Result<Option<MigrationRun>, StoreError> {
        Ok(self.runs.lock().get(plan).cloned())
    }

    async fn save(&self, run: &MigrationRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock();
        check_sequence(runs.get(&run.plan_name), run)?;
        runs.insert(run.plan_name.clone(), run.clone());
        self.history.lock().push(run.clone());
        Ok(())
    }
}
