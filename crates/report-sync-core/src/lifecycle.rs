use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Publish status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Draft,
    /// Claimed by an actor that is publishing it right now.
    InProgress,
    Published,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Draft => "draft",
            LifecycleStatus::InProgress => "in_progress",
            LifecycleStatus::Published => "published",
        }
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-document publish record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub path: String,
    pub status: LifecycleStatus,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub notion_page_id: Option<String>,
    #[serde(default)]
    pub notion_url: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
    /// Actor that holds (or last held) the claim.
    #[serde(default)]
    pub claimed_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleRecord {
    pub fn new(path: impl Into<String>, status: LifecycleStatus) -> Self {
        Self {
            path: path.into(),
            status,
            content_hash: None,
            notion_page_id: None,
            notion_url: None,
            doc_type: None,
            claimed_by: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether this is an `in_progress` claim older than `ttl` at `now`.
    pub fn is_stale_claim(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.status != LifecycleStatus::InProgress {
            return false;
        }
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        now.signed_duration_since(self.updated_at) > ttl
    }

    /// Whether another actor holds a live claim on this document.
    pub fn is_claimed_by_other(&self, actor_id: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.status == LifecycleStatus::InProgress
            && self.claimed_by.as_deref() != Some(actor_id)
            && !self.is_stale_claim(ttl, now)
    }
}

/// Durable record of each document's publish lifecycle.
///
/// This is the single source of truth shared between processes. Implementations
/// must make every method atomic with respect to other callers of the same
/// store.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Returns the store identifier (e.g., "json").
    fn store_name(&self) -> &'static str;

    async fn get_document_status(&self, path: &str)
        -> Result<Option<LifecycleRecord>, SyncError>;

    /// Insert or overwrite the record for `path`, stamping `updated_at`.
    async fn register_document(
        &self,
        path: &str,
        doc_type: Option<&str>,
        status: LifecycleStatus,
        content_hash: Option<&str>,
        claimed_by: Option<&str>,
    ) -> Result<(), SyncError>;

    /// Change only the status (and `updated_at`) of an existing record.
    async fn update_document_status(
        &self,
        path: &str,
        status: LifecycleStatus,
    ) -> Result<(), SyncError>;

    /// Revert `in_progress` records older than `ttl` to draft.
    ///
    /// Returns the number of claims released.
    async fn release_stale_claims(&self, ttl: Duration) -> Result<usize, SyncError>;

    /// Commit a successful publish.
    async fn record_sync(
        &self,
        path: &str,
        remote_id: &str,
        remote_url: Option<&str>,
        doc_type: Option<&str>,
        content_hash: &str,
    ) -> Result<(), SyncError>;

    /// Last known content hash for `path`, if any.
    async fn get_file_hash(&self, path: &str) -> Result<Option<String>, SyncError>;

    // =========================================================================
    // Run bookkeeping
    // =========================================================================

    async fn last_run(&self, job: &str) -> Result<Option<DateTime<Utc>>, SyncError>;

    async fn mark_run(&self, job: &str, at: DateTime<Utc>) -> Result<(), SyncError>;

    /// Bump a usage counter.
    async fn increment_usage(&self, metric: &str, by: u64) -> Result<(), SyncError>;
}
