//! Deployment record store
//!
//! Keeps the deployment history in `records.json` inside the data directory,
//! newest first, and guards runs with a lock file next to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::config::env::constants::MAX_RECORD_HISTORY;
use crate::domain::deploy::PipelineState;
use crate::domain::record::DeploymentRecord;
use crate::error::{DeployError, DeployResult};

const RECORDS_FILE_NAME: &str = "records.json";
const LOCK_FILE_NAME: &str = "deploy.lock";

/// On-disk layout
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    /// Format version
    version: u32,
    saved_at: DateTime<Utc>,
    records: Vec<DeploymentRecord>,
}

/// Deployment history
pub struct RecordStore {
    path: PathBuf,
    /// Newest first
    records: VecDeque<DeploymentRecord>,
    max_history: usize,
}

impl RecordStore {
    /// Load the history from `dir`, starting empty when there is none
    pub async fn open(dir: &Path) -> DeployResult<Self> {
        Self::open_with_capacity(dir, MAX_RECORD_HISTORY).await
    }

    pub async fn open_with_capacity(dir: &Path, max_history: usize) -> DeployResult<Self> {
        let path = dir.join(RECORDS_FILE_NAME);

        let records = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            let file: RecordFile = serde_json::from_str(&content)?;
            debug!(
                path = %path.display(),
                records = file.records.len(),
                saved_at = %file.saved_at,
                "Loaded deployment records"
            );
            file.records.into_iter().collect()
        } else {
            VecDeque::new()
        };

        let mut store = Self {
            path,
            records,
            max_history,
        };
        store.records.truncate(store.max_history);
        Ok(store)
    }

    /// Insert a record or replace the one with the same release id
    pub fn upsert(&mut self, record: DeploymentRecord) {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.release_id == record.release_id)
        {
            *existing = record;
            return;
        }

        self.records.push_front(record);
        while self.records.len() > self.max_history {
            self.records.pop_back();
        }
    }

    /// Write the history (atomic)
    pub async fn save(&self) -> DeployResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = RecordFile {
            version: 1,
            saved_at: Utc::now(),
            records: self.records.iter().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        info!(
            path = %self.path.display(),
            records = self.records.len(),
            "Saved deployment records"
        );
        Ok(())
    }

    /// Latest release that finished healthy
    pub fn current_release(&self) -> Option<&DeploymentRecord> {
        self.records
            .iter()
            .find(|r| r.state == PipelineState::Succeeded)
    }

    pub fn latest(&self) -> Option<&DeploymentRecord> {
        self.records.front()
    }

    pub fn get(&self, release_id: &str) -> Option<&DeploymentRecord> {
        self.records.iter().find(|r| r.release_id == release_id)
    }

    /// Newest first
    pub fn history(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Exclusive run lock, released on drop
#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
}

impl DeployLock {
    /// Take the lock, reclaiming it once if its holder is no longer running
    pub fn acquire(dir: &Path) -> DeployResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);

        match Self::create(&path) {
            Err(DeployError::Locked(_)) if Self::is_stale(&path) => {
                tracing::warn!(path = %path.display(), "Removing stale deploy lock");
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Self::create(&path)
            }
            result => result,
        }
    }

    fn create(path: &Path) -> DeployResult<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!(path = %path.display(), "Acquired deploy lock");
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(DeployError::Locked(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A lock is stale when it names a process that no longer exists.
    /// Unreadable or empty lock files are treated as held.
    fn is_stale(path: &Path) -> bool {
        let holder = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok());
        match holder {
            Some(pid) => !process_alive(pid),
            None => false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove deploy lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::{DeployStatus, ReleaseSource};

    fn record(id: &str, state: PipelineState) -> DeploymentRecord {
        let mut rec = DeploymentRecord::new(
            id.to_string(),
            "app.example.com".to_string(),
            ReleaseSource::Git {
                repo_url: None,
                branch: "main".to_string(),
            },
            None,
        );
        rec.state = state;
        rec
    }

    #[tokio::test]
    async fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        assert!(store.is_empty());
        assert!(store.current_release().is_none());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RecordStore::open(dir.path()).await.unwrap();
        store.upsert(record("r1", PipelineState::Succeeded));
        store.upsert(record("r2", PipelineState::Failed));
        store.save().await.unwrap();

        let store = RecordStore::open(dir.path()).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().unwrap().release_id, "r2");
        assert_eq!(store.current_release().unwrap().release_id, "r1");
        assert!(!dir.path().join("records.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RecordStore::open(dir.path()).await.unwrap();
        store.upsert(record("r1", PipelineState::Migrating));

        let mut done = record("r1", PipelineState::Succeeded);
        done.complete(DeployStatus::Success);
        store.upsert(done);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("r1").unwrap().status, DeployStatus::Success);
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RecordStore::open(dir.path()).await.unwrap();
        for i in 0..(MAX_RECORD_HISTORY + 5) {
            store.upsert(record(&format!("r{}", i), PipelineState::Succeeded));
        }
        assert_eq!(store.len(), MAX_RECORD_HISTORY);
        assert_eq!(store.latest().unwrap().release_id, format!("r{}", MAX_RECORD_HISTORY + 4));
        assert!(store.get("r0").is_none());

        store.save().await.unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        assert_eq!(store.len(), MAX_RECORD_HISTORY);
    }

    #[tokio::test]
    async fn test_rolled_back_release_is_not_current() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RecordStore::open(dir.path()).await.unwrap();
        store.upsert(record("good", PipelineState::Succeeded));
        store.upsert(record("bad", PipelineState::RolledBack));
        assert_eq!(store.current_release().unwrap().release_id, "good");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("records.json"), "{not json").unwrap();
        assert!(matches!(
            RecordStore::open(dir.path()).await,
            Err(DeployError::Json(_))
        ));
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();

        let lock = DeployLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
        assert!(matches!(
            DeployLock::acquire(dir.path()),
            Err(DeployError::Locked(_))
        ));

        drop(lock);
        assert!(!dir.path().join("deploy.lock").exists());
        assert!(DeployLock::acquire(dir.path()).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_left_by_killed_run_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // Above the kernel's pid_max ceiling, so never a live process
        std::fs::write(dir.path().join("deploy.lock"), "4194305\n").unwrap();

        let lock = DeployLock::acquire(dir.path()).unwrap();
        let holder = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_lock_held_by_live_or_unknown_process_stays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.lock");

        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(matches!(
            DeployLock::acquire(dir.path()),
            Err(DeployError::Locked(_))
        ));

        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            DeployLock::acquire(dir.path()),
            Err(DeployError::Locked(_))
        ));
        assert!(path.exists());
    }
}
