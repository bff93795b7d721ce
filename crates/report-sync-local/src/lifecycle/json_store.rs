use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use report_sync_core::{LifecycleRecord, LifecycleStatus, LifecycleStore, SyncError};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const STATE_FILE: &str = "lifecycle.json";
const LOCK_FILE: &str = "lifecycle.lock";
const STATE_VERSION: u32 = 1;

/// On-disk layout of the lifecycle file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LifecycleState {
    version: u32,
    #[serde(default)]
    documents: BTreeMap<String, LifecycleRecord>,
    /// Hash of the last successfully published content per path.
    #[serde(default)]
    file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    runs: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    usage: BTreeMap<String, u64>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            documents: BTreeMap::new(),
            file_hashes: BTreeMap::new(),
            runs: BTreeMap::new(),
            usage: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct StatePaths {
    dir: PathBuf,
    state: PathBuf,
    lock: PathBuf,
}

impl StatePaths {
    /// Run `f` on the current state while holding the store lock.
    ///
    /// With `write`, the state is persisted afterwards through a temp file
    /// and rename, unless `f` failed.
    fn transact<T, F>(&self, write: bool, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut LifecycleState) -> Result<T, SyncError>,
    {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SyncError::Io(format!(
                "Failed to create state dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock)
            .map_err(|e| SyncError::Io(format!("Failed to open lifecycle lock: {}", e)))?;
        let locked = if write {
            lock.lock_exclusive()
        } else {
            lock.lock_shared()
        };
        locked.map_err(|e| SyncError::Lock(format!("Failed to lock lifecycle store: {}", e)))?;

        let result = self.read().and_then(|mut state| {
            let out = f(&mut state)?;
            if write {
                self.write(&state)?;
            }
            Ok(out)
        });

        let _ = FileExt::unlock(&lock);
        result
    }

    fn read(&self) -> Result<LifecycleState, SyncError> {
        if !self.state.exists() {
            return Ok(LifecycleState::default());
        }
        let raw = fs::read_to_string(&self.state).map_err(|e| {
            SyncError::Io(format!("Failed to read {}: {}", self.state.display(), e))
        })?;
        if raw.trim().is_empty() {
            return Ok(LifecycleState::default());
        }
        serde_json::from_str(&raw).map_err(|e| {
            SyncError::Serialization(format!(
                "Failed to parse {}: {}",
                self.state.display(),
                e
            ))
        })
    }

    fn write(&self, state: &LifecycleState) -> Result<(), SyncError> {
        let json = serde_json::to_string_pretty(state).map_err(|e| {
            SyncError::Serialization(format!("Failed to serialize lifecycle state: {}", e))
        })?;

        let temp_path = self.state.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(|e| {
            SyncError::Io(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;
        fs::rename(&temp_path, &self.state).map_err(|e| {
            SyncError::Io(format!(
                "Failed to rename temp file to {}: {}",
                self.state.display(),
                e
            ))
        })
    }
}

/// Lifecycle store persisted as one JSON file.
///
/// Every call is a read-modify-write cycle serialized across processes by an
/// fs2 lock on `{state_dir}/lifecycle.lock`. File I/O runs on the blocking
/// thread pool.
#[derive(Debug, Clone)]
pub struct JsonLifecycleStore {
    paths: StatePaths,
}

impl JsonLifecycleStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref().to_path_buf();
        Self {
            paths: StatePaths {
                state: dir.join(STATE_FILE),
                lock: dir.join(LOCK_FILE),
                dir,
            },
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.paths.state
    }

    async fn transact<T, F>(&self, write: bool, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut LifecycleState) -> Result<T, SyncError> + Send + 'static,
        T: Send + 'static,
    {
        let paths = self.paths.clone();
        tokio::task::spawn_blocking(move || paths.transact(write, f))
            .await
            .map_err(|e| SyncError::Internal(format!("Lifecycle task failed: {}", e)))?
    }
}

#[async_trait]
impl LifecycleStore for JsonLifecycleStore {
    fn store_name(&self) -> &'static str {
        "json"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_document_status(&self, path: &str) -> Result<Option<LifecycleRecord>, SyncError> {
        let path = path.to_string();
        self.transact(false, move |state| Ok(state.documents.get(&path).cloned()))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn register_document(
        &self,
        path: &str,
        doc_type: Option<&str>,
        status: LifecycleStatus,
        content_hash: Option<&str>,
        claimed_by: Option<&str>,
    ) -> Result<(), SyncError> {
        let path = path.to_string();
        let doc_type = doc_type.map(str::to_string);
        let content_hash = content_hash.map(str::to_string);
        let claimed_by = claimed_by.map(str::to_string);

        self.transact(true, move |state| {
            let record = state
                .documents
                .entry(path.clone())
                .or_insert_with(|| LifecycleRecord::new(path.clone(), status));
            record.status = status;
            if doc_type.is_some() {
                record.doc_type = doc_type;
            }
            record.content_hash = content_hash;
            record.claimed_by = claimed_by;
            record.updated_at = Utc::now();
            debug!("Registered {} as {}", path, status);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn update_document_status(
        &self,
        path: &str,
        status: LifecycleStatus,
    ) -> Result<(), SyncError> {
        let path = path.to_string();
        self.transact(true, move |state| {
            let record = state
                .documents
                .get_mut(&path)
                .ok_or_else(|| SyncError::Store(format!("No lifecycle record for {}", path)))?;
            record.status = status;
            if status != LifecycleStatus::InProgress {
                record.claimed_by = None;
            }
            record.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn release_stale_claims(&self, ttl: Duration) -> Result<usize, SyncError> {
        self.transact(true, move |state| {
            let now = Utc::now();
            let mut released = 0;
            for record in state.documents.values_mut() {
                if record.is_stale_claim(ttl, now) {
                    debug!(
                        "Releasing stale claim on {} held by {:?} since {}",
                        record.path, record.claimed_by, record.updated_at
                    );
                    record.status = LifecycleStatus::Draft;
                    record.claimed_by = None;
                    record.updated_at = now;
                    released += 1;
                }
            }
            Ok(released)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn record_sync(
        &self,
        path: &str,
        remote_id: &str,
        remote_url: Option<&str>,
        doc_type: Option<&str>,
        content_hash: &str,
    ) -> Result<(), SyncError> {
        let mut record = LifecycleRecord::new(path, LifecycleStatus::Published);
        record.notion_page_id = Some(remote_id.to_string());
        record.notion_url = remote_url.map(str::to_string);
        record.doc_type = doc_type.map(str::to_string);
        record.content_hash = Some(content_hash.to_string());
        let hash = content_hash.to_string();

        self.transact(true, move |state| {
            state.file_hashes.insert(record.path.clone(), hash);
            state.documents.insert(record.path.clone(), record);
            Ok(())
        })
        .await
    }

    async fn get_file_hash(&self, path: &str) -> Result<Option<String>, SyncError> {
        let path = path.to_string();
        self.transact(false, move |state| Ok(state.file_hashes.get(&path).cloned()))
            .await
    }

    async fn last_run(&self, job: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let job = job.to_string();
        self.transact(false, move |state| Ok(state.runs.get(&job).copied()))
            .await
    }

    async fn mark_run(&self, job: &str, at: DateTime<Utc>) -> Result<(), SyncError> {
        let job = job.to_string();
        self.transact(true, move |state| {
            state.runs.insert(job, at);
            Ok(())
        })
        .await
    }

    async fn increment_usage(&self, metric: &str, by: u64) -> Result<(), SyncError> {
        let metric = metric.to_string();
        self.transact(true, move |state| {
            *state.usage.entry(metric).or_insert(0) += by;
            Ok(())
        })
        .await
    }
}
