//! Batch and single-document synchronization.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::document::{Document, Readiness};
use crate::error::SyncError;
use crate::lifecycle::{LifecycleRecord, LifecycleStatus, LifecycleStore};
use crate::lock::{LockAcquireResult, LockManager};
use crate::mapper::ValidationReport;
use crate::publish::{PublishEngine, PublishResult};
use crate::remote::PageSummary;

/// Job name used for the once-a-day gate of full scans.
pub const SYNC_ALL_JOB: &str = "sync_all";

/// `record_sync` calls made before falling back to a status-only commit.
const COMMIT_ATTEMPTS: u32 = 2;

const INDEX_STEMS: &[&str] = &["index", "_index"];
const ARCHIVE_DIRS: &[&str] = &["archive", "_archive"];

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Age after which an `in_progress` claim is considered abandoned.
    pub claim_ttl: Duration,
    pub lock_timeout: Duration,
    /// Case-insensitive substrings matched against file name and path.
    pub ignore_patterns: Vec<String>,
    /// Identifies this process in claims.
    pub actor_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(15 * 60),
            lock_timeout: Duration::from_secs(5),
            ignore_patterns: Vec::new(),
            actor_id: format!("pid-{}", std::process::id()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Republish even when the stored hash matches; also bypasses the run gate.
    pub force: bool,
    /// Validate only: no lock, no state change, no remote call.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedDocument {
    pub path: String,
    pub reason: String,
    pub page_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDocument {
    pub path: String,
    pub error: String,
}

/// Aggregated outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: Vec<PublishResult>,
    pub skipped: Vec<SkippedDocument>,
    pub failed: Vec<FailedDocument>,
    /// The run was suppressed because a full scan already ran today.
    pub gated: bool,
}

/// Non-error result of syncing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Published(PublishResult),
    Skipped(SkippedDocument),
}

/// Why a path is never considered for publishing, if it is excluded.
///
/// `relative` is the path below the scanned root; patterns are also matched
/// against the full path.
pub fn exclusion_reason(
    relative: &Path,
    full: &Path,
    ignore_patterns: &[String],
) -> Option<&'static str> {
    let stem = relative
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let in_archive = relative.components().any(|c| {
        let name = c.as_os_str().to_string_lossy().to_lowercase();
        ARCHIVE_DIRS.contains(&name.as_str())
    });
    if INDEX_STEMS.contains(&stem.as_str()) || in_archive {
        return Some("excluded_index_or_archive");
    }

    let file_name = full
        .file_name()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let full_path = full.to_string_lossy().to_lowercase();
    let matched = ignore_patterns
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| file_name.contains(&p) || full_path.contains(&p));
    matched.then_some("excluded_pattern")
}

/// Drives fingerprinting, claims, locking and publishing per document.
pub struct SyncOrchestrator {
    engine: PublishEngine,
    lifecycle: Arc<dyn LifecycleStore>,
    locks: Arc<dyn LockManager>,
    config: SyncConfig,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("engine", &self.engine)
            .field("store", &self.lifecycle.store_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(
        engine: PublishEngine,
        lifecycle: Arc<dyn LifecycleStore>,
        locks: Arc<dyn LockManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            engine,
            lifecycle,
            locks,
            config,
        }
    }

    pub fn engine(&self) -> &PublishEngine {
        &self.engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Sync every Markdown document under `root`.
    ///
    /// Per-document terminal failures are collected in `failed`; the batch
    /// always runs to completion.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_all(&self, root: &Path, options: SyncOptions) -> Result<SyncReport, SyncError> {
        if !options.force && !options.dry_run {
            if let Some(last) = self.lifecycle.last_run(SYNC_ALL_JOB).await? {
                if last.date_naive() == Utc::now().date_naive() {
                    info!("Full sync already ran today at {}, skipping (use --force)", last);
                    return Ok(SyncReport {
                        gated: true,
                        ..Default::default()
                    });
                }
            }
        }

        let released = self.release_stale_claims().await?;
        if released > 0 {
            info!("Released {} stale claim(s)", released);
        }

        let mut report = SyncReport::default();
        for path in self.enumerate(root) {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            if let Some(reason) = exclusion_reason(relative, &path, &self.config.ignore_patterns) {
                debug!("Excluding {}: {}", path.display(), reason);
                report.skipped.push(SkippedDocument {
                    path: path.to_string_lossy().to_string(),
                    reason: reason.to_string(),
                    page_id: None,
                });
                continue;
            }

            match self.sync_document(&path, options).await {
                Ok(SyncOutcome::Published(result)) => report.success.push(result),
                Ok(SyncOutcome::Skipped(skipped)) => report.skipped.push(skipped),
                Err(e) => {
                    warn!("Failed to sync {}: {}", path.display(), e);
                    report.failed.push(FailedDocument {
                        path: path.to_string_lossy().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !options.dry_run && report.failed.is_empty() {
            self.lifecycle.mark_run(SYNC_ALL_JOB, Utc::now()).await?;
        }

        info!(
            "Sync finished: {} published, {} skipped, {} failed",
            report.success.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Sync one document, claiming and locking it around the publish.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_document(&self, path: &Path, options: SyncOptions) -> Result<SyncOutcome, SyncError> {
        let doc = Document::load(path).await?;
        let key = doc.key();

        if let Readiness::NotReady(reason) = doc.readiness() {
            debug!("{} is not ready: {}", key, reason);
            return Ok(skip(&key, reason, None));
        }

        let fingerprint = doc.fingerprint();
        if let Some(outcome) = self.check_record(&key, &fingerprint, options.force).await? {
            return Ok(outcome);
        }

        if options.dry_run {
            let report = self.engine.validate(&doc);
            for warning in &report.warnings {
                debug!("{}: {}", key, warning);
            }
            let reason = if report.valid {
                "dry_run".to_string()
            } else {
                format!("dry_run_invalid: {}", report.errors.join("; "))
            };
            return Ok(skip(&key, reason, None));
        }

        if self.engine.config().dry_run_forced {
            return Ok(skip(&key, "publish_disabled".to_string(), None));
        }

        let guard = match self.locks.acquire(&key, self.config.lock_timeout).await? {
            LockAcquireResult::Acquired(guard) => guard,
            LockAcquireResult::TryAgainLater => {
                info!("Could not lock {} within {:?}", key, self.config.lock_timeout);
                return Ok(skip(&key, "lock_timeout".to_string(), None));
            }
        };

        // Another process may have published while we waited for the lock.
        if let Some(outcome) = self.check_record(&key, &fingerprint, options.force).await? {
            return Ok(outcome);
        }

        let doc_type = doc.doc_type();
        self.lifecycle
            .register_document(
                &key,
                doc_type.as_deref(),
                LifecycleStatus::InProgress,
                Some(&fingerprint),
                Some(&self.config.actor_id),
            )
            .await?;

        let outcome = match self.engine.publish(&doc, &fingerprint).await {
            Ok(result) => match result.page_id.as_deref() {
                Some(page_id) if !result.skipped => self
                    .commit(&key, page_id, result.url.as_deref(), doc_type.as_deref(), &fingerprint)
                    .await
                    .map(|()| SyncOutcome::Published(result)),
                _ => {
                    self.revert_claim(&key).await;
                    Ok(SyncOutcome::Skipped(SkippedDocument {
                        path: key.clone(),
                        reason: result.reason.unwrap_or_else(|| "not_published".to_string()),
                        page_id: result.page_id,
                    }))
                }
            },
            Err(e) => {
                self.revert_claim(&key).await;
                Err(e)
            }
        };

        drop(guard);
        outcome
    }

    /// Publish one document, returning skips as a skipped result.
    ///
    /// Terminal failures are returned as errors.
    pub async fn publish_document(&self, path: &Path, force: bool) -> Result<PublishResult, SyncError> {
        let options = SyncOptions {
            force,
            dry_run: false,
        };
        match self.sync_document(path, options).await? {
            SyncOutcome::Published(result) => Ok(result),
            SyncOutcome::Skipped(skipped) => Ok(PublishResult::skipped(skipped.reason, skipped.page_id)),
        }
    }

    /// Local-only validation of one document.
    pub async fn validate_document(&self, path: &Path) -> Result<ValidationReport, SyncError> {
        let doc = Document::load(path).await?;
        Ok(self.engine.validate(&doc))
    }

    pub async fn release_stale_claims(&self) -> Result<usize, SyncError> {
        self.lifecycle.release_stale_claims(self.config.claim_ttl).await
    }

    pub async fn list_published(&self, status: Option<&str>) -> Result<Vec<PageSummary>, SyncError> {
        self.engine.list_published(status).await
    }

    /// Skip outcome derived from the lifecycle record, if any applies.
    async fn check_record(
        &self,
        key: &str,
        fingerprint: &str,
        force: bool,
    ) -> Result<Option<SyncOutcome>, SyncError> {
        let Some(record) = self.lifecycle.get_document_status(key).await? else {
            return Ok(None);
        };

        if record.is_claimed_by_other(&self.config.actor_id, self.config.claim_ttl, Utc::now()) {
            info!(
                "{} is being published by {}",
                key,
                record.claimed_by.as_deref().unwrap_or("another actor")
            );
            return Ok(Some(skip(key, "claimed_elsewhere".to_string(), None)));
        }

        if record.status == LifecycleStatus::Published && !force {
            let stored = self.stored_hash(key, &record).await?;
            if stored.as_deref() == Some(fingerprint) {
                debug!("{} unchanged since last publish", key);
                return Ok(Some(skip(
                    key,
                    "already_published".to_string(),
                    record.notion_page_id.clone(),
                )));
            }
        }

        Ok(None)
    }

    async fn stored_hash(&self, key: &str, record: &LifecycleRecord) -> Result<Option<String>, SyncError> {
        match &record.content_hash {
            Some(hash) => Ok(Some(hash.clone())),
            None => self.lifecycle.get_file_hash(key).await,
        }
    }

    /// Record a created page, retrying once.
    ///
    /// When the store keeps failing, the claim is still turned into a
    /// `published` record: the claim already carries the fingerprint, so later
    /// runs skip the document instead of creating a second page.
    async fn commit(
        &self,
        key: &str,
        page_id: &str,
        url: Option<&str>,
        doc_type: Option<&str>,
        fingerprint: &str,
    ) -> Result<(), SyncError> {
        let mut last_error = None;
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self
                .lifecycle
                .record_sync(key, page_id, url, doc_type, fingerprint)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Recording {} as {} failed (attempt {}): {}", key, page_id, attempt, e);
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!("{} was published as {} but could not be recorded: {}", key, page_id, cause);
        if let Err(e) = self
            .lifecycle
            .update_document_status(key, LifecycleStatus::Published)
            .await
        {
            error!("Failed to mark {} as published: {}", key, e);
        }
        Err(SyncError::Store(format!(
            "{} was published as {} but recording it failed: {}",
            key, page_id, cause
        )))
    }

    async fn revert_claim(&self, key: &str) {
        if let Err(e) = self
            .lifecycle
            .update_document_status(key, LifecycleStatus::Draft)
            .await
        {
            warn!("Failed to release claim on {}: {}", key, e);
        }
    }

    fn enumerate(&self, root: &Path) -> Vec<PathBuf> {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
            })
            .collect()
    }
}

fn skip(key: &str, reason: String, page_id: Option<String>) -> SyncOutcome {
    SyncOutcome::Skipped(SkippedDocument {
        path: key.to_string(),
        reason,
        page_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::publish::PublishConfig;
    use crate::schema::{PropertySpec, PropertyType, RemoteSchema, SchemaAdapter};
    use crate::testing::{FakeRemote, MemoryLifecycleStore, MemoryLock, RecordingAlert};
    use tempfile::TempDir;

    const READY: &str = "---\ntype: daily\ndate: 2024-03-05\nstatus: ready\n---\n# Daily\n\nCalm markets.\n";

    struct Harness {
        dir: TempDir,
        remote: Arc<FakeRemote>,
        store: Arc<MemoryLifecycleStore>,
        locks: Arc<MemoryLock>,
        alerts: Arc<RecordingAlert>,
        sync: Arc<SyncOrchestrator>,
    }

    impl Harness {
        fn write(&self, relative: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, content).unwrap();
            path
        }

        fn key(&self, relative: &str) -> String {
            std::fs::canonicalize(self.dir.path())
                .unwrap()
                .join(relative)
                .to_string_lossy()
                .to_string()
        }
    }

    fn schema() -> RemoteSchema {
        let mut schema = RemoteSchema::default();
        schema.insert("Name", PropertySpec::new(PropertyType::Title));
        schema.insert(
            "Status",
            PropertySpec::with_options(PropertyType::Select, ["Draft"]),
        );
        schema
    }

    fn harness_with(publish: PublishConfig, sync: SyncConfig) -> Harness {
        let remote = Arc::new(FakeRemote::new(schema()));
        let store = Arc::new(MemoryLifecycleStore::default());
        let locks = Arc::new(MemoryLock::default());
        let alerts = Arc::new(RecordingAlert::default());
        let adapter = Arc::new(SchemaAdapter::new(remote.clone(), "db-1", None));
        let engine = PublishEngine::new(remote.clone(), adapter, store.clone(), alerts.clone(), publish);
        let orchestrator = SyncOrchestrator::new(engine, store.clone(), locks.clone(), sync);
        Harness {
            dir: TempDir::new().unwrap(),
            remote,
            store,
            locks,
            alerts,
            sync: Arc::new(orchestrator),
        }
    }

    fn harness() -> Harness {
        harness_with(
            PublishConfig {
                base_delay: Duration::from_millis(1),
                ..Default::default()
            },
            SyncConfig {
                actor_id: "actor-test".into(),
                lock_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        )
    }

    fn publish_opts() -> SyncOptions {
        SyncOptions::default()
    }

    #[test]
    fn test_exclusion_rules() {
        let patterns = vec!["Scratch".to_string()];
        let full = Path::new("/data/reports/index.md");
        assert_eq!(
            exclusion_reason(Path::new("index.md"), full, &patterns),
            Some("excluded_index_or_archive")
        );
        assert_eq!(
            exclusion_reason(Path::new("2023/_archive/old.md"), full, &patterns),
            Some("excluded_index_or_archive")
        );
        assert_eq!(
            exclusion_reason(
                Path::new("scratch-notes.md"),
                Path::new("/data/reports/scratch-notes.md"),
                &patterns
            ),
            Some("excluded_pattern")
        );
        assert_eq!(
            exclusion_reason(
                Path::new("daily.md"),
                Path::new("/data/reports/daily.md"),
                &patterns
            ),
            None
        );
    }

    #[tokio::test]
    async fn test_publish_then_idempotent_skip() {
        let h = harness();
        let path = h.write("daily.md", READY);

        let first = h.sync.sync_document(&path, publish_opts()).await.unwrap();
        let page_id = match first {
            SyncOutcome::Published(result) => result.page_id.unwrap(),
            other => panic!("expected publish, got {:?}", other),
        };
        let record = h.store.record(&h.key("daily.md")).unwrap();
        assert_eq!(record.status, LifecycleStatus::Published);
        assert_eq!(record.notion_page_id.as_deref(), Some(page_id.as_str()));

        let second = h.sync.publish_document(&path, false).await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.reason.as_deref(), Some("already_published"));
        assert_eq!(second.page_id.as_deref(), Some(page_id.as_str()));
        assert_eq!(h.remote.calls("create_page"), 1);
        assert!(!h.locks.is_held(&h.key("daily.md")));
    }

    #[tokio::test]
    async fn test_changed_content_is_republished() {
        let h = harness();
        let path = h.write("daily.md", READY);
        h.sync.publish_document(&path, false).await.unwrap();

        h.write("daily.md", &READY.replace("Calm", "Calmer"));
        let result = h.sync.publish_document(&path, false).await.unwrap();

        assert!(!result.skipped);
        assert_eq!(h.remote.calls("create_page"), 2);
    }

    #[tokio::test]
    async fn test_force_republishes_unchanged() {
        let h = harness();
        let path = h.write("daily.md", READY);
        h.sync.publish_document(&path, false).await.unwrap();

        let result = h.sync.publish_document(&path, true).await.unwrap();
        assert!(!result.skipped);
        assert_eq!(h.remote.calls("create_page"), 2);
    }

    #[tokio::test]
    async fn test_cached_published_record_makes_no_remote_calls() {
        let h = harness();
        let path = h.write(
            "daily.md",
            "---\nstatus: published\n---\n# Daily\n\nAlready out.\n",
        );
        let fingerprint = Document::load(&path).await.unwrap().fingerprint();
        let mut record = LifecycleRecord::new(h.key("daily.md"), LifecycleStatus::Published);
        record.content_hash = Some(fingerprint);
        record.notion_page_id = Some("cached-page".into());
        h.store.insert(record);

        let result = h.sync.publish_document(&path, false).await.unwrap();

        assert!(result.skipped);
        assert_eq!(result.page_id.as_deref(), Some("cached-page"));
        assert_eq!(h.remote.total_calls(), 0);
        assert_eq!(h.locks.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_file_hash_is_used_when_record_has_none() {
        let h = harness();
        let path = h.write("daily.md", READY);
        let fingerprint = Document::load(&path).await.unwrap().fingerprint();
        let mut record = LifecycleRecord::new(h.key("daily.md"), LifecycleStatus::Published);
        record.notion_page_id = Some("old-page".into());
        h.store.insert(record);
        h.store.set_file_hash(&h.key("daily.md"), &fingerprint);

        let result = h.sync.publish_document(&path, false).await.unwrap();
        assert_eq!(result.reason.as_deref(), Some("already_published"));
    }

    #[tokio::test]
    async fn test_draft_is_skipped_without_lock() {
        let h = harness();
        let path = h.write("draft.md", "---\nstatus: draft\n---\nwork in progress\n");

        let result = h.sync.publish_document(&path, false).await.unwrap();

        assert!(result.skipped);
        assert!(result.reason.unwrap().contains("draft"));
        assert_eq!(h.locks.acquisitions(), 0);
        assert_eq!(h.remote.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_live_claim_elsewhere_is_respected() {
        let h = harness();
        let path = h.write("daily.md", READY);
        let mut record = LifecycleRecord::new(h.key("daily.md"), LifecycleStatus::InProgress);
        record.claimed_by = Some("other-actor".into());
        h.store.insert(record);

        let result = h.sync.publish_document(&path, true).await.unwrap();
        assert_eq!(result.reason.as_deref(), Some("claimed_elsewhere"));
        assert_eq!(h.remote.calls("create_page"), 0);
    }

    #[tokio::test]
    async fn test_stale_claim_is_released_and_published() {
        let h = harness();
        let path = h.write("daily.md", READY);
        let mut record = LifecycleRecord::new(h.key("daily.md"), LifecycleStatus::InProgress);
        record.claimed_by = Some("crashed-actor".into());
        record.updated_at = Utc::now() - chrono::Duration::minutes(30);
        h.store.insert(record);

        assert_eq!(h.sync.release_stale_claims().await.unwrap(), 1);
        assert_eq!(
            h.store.record(&h.key("daily.md")).unwrap().status,
            LifecycleStatus::Draft
        );

        let result = h.sync.publish_document(&path, false).await.unwrap();
        assert!(!result.skipped);
        assert_eq!(h.remote.calls("create_page"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_publishes_create_once() {
        let h = harness();
        h.remote.set_create_delay(Duration::from_millis(100));
        let path = h.write("daily.md", READY);

        let (a, b) = tokio::join!(
            h.sync.publish_document(&path, false),
            h.sync.publish_document(&path, false)
        );
        let results = [a.unwrap(), b.unwrap()];

        assert_eq!(h.remote.calls("create_page"), 1);
        assert_eq!(results.iter().filter(|r| !r.skipped).count(), 1);
        let skipped = results.iter().find(|r| r.skipped).unwrap();
        assert!(matches!(
            skipped.reason.as_deref(),
            Some("lock_timeout") | Some("claimed_elsewhere") | Some("already_published")
        ));
    }

    #[tokio::test]
    async fn test_dry_run_reports_ragged_table_without_network() {
        let h = harness();
        let path = h.write("table.md", "# Levels\n\n| a | b | c | d |\n|---|---|---|---|\n| 1 | 2 | 3 |\n");

        let report = h.sync.validate_document(&path).await.unwrap();
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec!["Table row 0 has 3 cells but table_width is 4".to_string()]
        );

        let outcome = h
            .sync
            .sync_document(
                &path,
                SyncOptions {
                    force: false,
                    dry_run: true,
                },
            )
            .await
            .unwrap();
        match outcome {
            SyncOutcome::Skipped(s) => assert!(s.reason.starts_with("dry_run_invalid: Table row 0")),
            other => panic!("expected skip, got {:?}", other),
        }
        assert_eq!(h.remote.total_calls(), 0);
        assert_eq!(h.locks.acquisitions(), 0);
        assert!(h.store.record(&h.key("table.md")).is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_reverts_claim() {
        let h = harness();
        let path = h.write("daily.md", READY);
        h.remote.script_create(vec![Err(RemoteError::Api {
            status: 403,
            code: "restricted_resource".into(),
            message: "no access".into(),
        })]);

        let err = h.sync.publish_document(&path, false).await.unwrap_err();
        assert!(matches!(err, SyncError::TerminalPublish { .. }));
        assert_eq!(
            h.store.record(&h.key("daily.md")).unwrap().status,
            LifecycleStatus::Draft
        );
        assert_eq!(h.alerts.messages().len(), 1);
        assert!(!h.locks.is_held(&h.key("daily.md")));
    }

    #[tokio::test]
    async fn test_sync_all_buckets_and_gate() {
        let h = harness();
        h.write("daily.md", READY);
        h.write("draft.md", "---\nstatus: wip\n---\nlater\n");
        h.write("index.md", "# Index\n");
        h.write("archive/old.md", READY);
        h.write("notes.txt", "not markdown");
        h.write("broken.md", READY.replace("Daily", "Broken").as_str());
        h.remote.script_create(vec![
            Ok(crate::remote::CreatedPage {
                id: "broken-page".into(),
                url: None,
            }),
            Err(RemoteError::Api {
                status: 404,
                code: "object_not_found".into(),
                message: "database gone".into(),
            }),
        ]);

        let report = h.sync.sync_all(h.dir.path(), publish_opts()).await.unwrap();

        // sorted: broken.md, daily.md, draft.md, index.md; archive/ first
        assert_eq!(report.success.len(), 1);
        assert_eq!(report.success[0].page_id.as_deref(), Some("broken-page"));
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].path.ends_with("daily.md"));
        let reasons: Vec<&str> = report.skipped.iter().map(|s| s.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec!["excluded_index_or_archive", "status_wip", "excluded_index_or_archive"]
        );
        assert!(!report.gated);

        // A failure keeps the gate open, so mark the day as done explicitly.
        h.store.mark_run(SYNC_ALL_JOB, Utc::now()).await.unwrap();
        let gated = h.sync.sync_all(h.dir.path(), publish_opts()).await.unwrap();
        assert!(gated.gated);
        assert!(gated.success.is_empty() && gated.skipped.is_empty());

        let forced = h
            .sync
            .sync_all(
                h.dir.path(),
                SyncOptions {
                    force: true,
                    dry_run: false,
                },
            )
            .await
            .unwrap();
        assert!(!forced.gated);
        let forced_reasons: Vec<&str> = forced.skipped.iter().map(|s| s.reason.as_str()).collect();
        assert_eq!(
            forced_reasons,
            vec!["excluded_index_or_archive", "status_wip", "excluded_index_or_archive"]
        );
        assert_eq!(forced.success.len(), 2);
    }

    #[tokio::test]
    async fn test_path_spellings_share_one_record() {
        let h = harness();
        let path = h.write("daily.md", READY);
        std::fs::create_dir_all(h.dir.path().join("sub")).unwrap();

        let first = h.sync.publish_document(&path, false).await.unwrap();
        assert!(!first.skipped);

        let dotted = h.dir.path().join(".").join("daily.md");
        let second = h.sync.publish_document(&dotted, false).await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.reason.as_deref(), Some("already_published"));

        let through_parent = h.dir.path().join("sub/../daily.md");
        let third = h.sync.publish_document(&through_parent, false).await.unwrap();
        assert_eq!(third.reason.as_deref(), Some("already_published"));

        assert_eq!(h.remote.calls("create_page"), 1);
        assert!(h.store.record(&h.key("daily.md")).is_some());
    }

    #[tokio::test]
    async fn test_unrecorded_publish_is_not_created_twice() {
        let h = harness();
        let path = h.write("daily.md", READY);
        h.store.fail_record_sync(usize::MAX);

        let err = h.sync.publish_document(&path, false).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(ref msg) if msg.contains("page-1")));
        assert_eq!(h.remote.calls("create_page"), 1);

        let record = h.store.record(&h.key("daily.md")).unwrap();
        assert_eq!(record.status, LifecycleStatus::Published);
        assert!(record.claimed_by.is_none());
        assert!(!h.locks.is_held(&h.key("daily.md")));

        // Stale-claim release leaves it alone and the next run skips it
        assert_eq!(h.sync.release_stale_claims().await.unwrap(), 0);
        let again = h.sync.publish_document(&path, false).await.unwrap();
        assert_eq!(again.reason.as_deref(), Some("already_published"));
        assert_eq!(h.remote.calls("create_page"), 1);
    }

    #[tokio::test]
    async fn test_record_sync_is_retried_once() {
        let h = harness();
        let path = h.write("daily.md", READY);
        h.store.fail_record_sync(1);

        let result = h.sync.publish_document(&path, false).await.unwrap();

        assert!(!result.skipped);
        let record = h.store.record(&h.key("daily.md")).unwrap();
        assert_eq!(record.notion_page_id, result.page_id);
        assert_eq!(h.remote.calls("create_page"), 1);
    }

    #[tokio::test]
    async fn test_schema_without_published_option_still_publishes() {
        let h = harness();
        let path = h.write("daily.md", READY);

        let result = h.sync.publish_document(&path, false).await.unwrap();

        assert!(!result.skipped);
        assert_eq!(
            h.remote.options_added(),
            vec![("Status".to_string(), "Published".to_string())]
        );
    }
}
