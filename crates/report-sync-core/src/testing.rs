//! In-memory doubles for the external seams, used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{RemoteError, SyncError};
use crate::lifecycle::{LifecycleRecord, LifecycleStatus, LifecycleStore};
use crate::lock::{LockAcquireResult, LockGuard, LockManager};
use crate::notify::AlertSink;
use crate::remote::{
    ContainerInfo, CreatePageRequest, CreatedPage, QueryPage, QueryRequest, RemoteStore,
};
use crate::schema::{ParentRef, PropertySpec, RemoteSchema};

/// Scriptable remote store that records every call.
pub struct FakeRemote {
    schema: Mutex<RemoteSchema>,
    container: Mutex<Result<ContainerInfo, RemoteError>>,
    container_failures: Mutex<VecDeque<RemoteError>>,
    legacy_failures: Mutex<VecDeque<RemoteError>>,
    create_script: Mutex<VecDeque<Result<CreatedPage, RemoteError>>>,
    create_delay: Mutex<Option<Duration>>,
    option_failure: Mutex<Option<RemoteError>>,
    query_results: Mutex<QueryPage>,
    query_pages: Mutex<VecDeque<QueryPage>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    created: Mutex<Vec<CreatePageRequest>>,
    queries: Mutex<Vec<QueryRequest>>,
    options_added: Mutex<Vec<(String, String)>>,
}

impl FakeRemote {
    /// A remote whose container lists one data source, `ds-1`, with `schema`.
    pub fn new(schema: RemoteSchema) -> Self {
        Self {
            schema: Mutex::new(schema),
            container: Mutex::new(Ok(ContainerInfo {
                data_source_ids: vec!["ds-1".to_string()],
                properties: None,
            })),
            container_failures: Mutex::new(VecDeque::new()),
            legacy_failures: Mutex::new(VecDeque::new()),
            create_script: Mutex::new(VecDeque::new()),
            create_delay: Mutex::new(None),
            option_failure: Mutex::new(None),
            query_results: Mutex::new(QueryPage::default()),
            query_pages: Mutex::new(VecDeque::new()),
            calls: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            options_added: Mutex::new(Vec::new()),
        }
    }

    pub fn set_container(&self, info: ContainerInfo) {
        *self.container.lock().unwrap() = Ok(info);
    }

    pub fn fail_container(&self, err: RemoteError) {
        *self.container.lock().unwrap() = Err(err);
    }

    /// Fail the next container fetch only.
    pub fn fail_container_once(&self, err: RemoteError) {
        self.container_failures.lock().unwrap().push_back(err);
    }

    /// Fail the next legacy schema fetch only.
    pub fn fail_legacy_once(&self, err: RemoteError) {
        self.legacy_failures.lock().unwrap().push_back(err);
    }

    /// Results for the next create calls; once drained, creates succeed.
    pub fn script_create(&self, results: Vec<Result<CreatedPage, RemoteError>>) {
        self.create_script.lock().unwrap().extend(results);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_option_add(&self, err: RemoteError) {
        *self.option_failure.lock().unwrap() = Some(err);
    }

    /// Page returned by every query once the scripted pages are used up.
    pub fn set_query_results(&self, page: QueryPage) {
        *self.query_results.lock().unwrap() = page;
    }

    pub fn set_query_pages(&self, pages: Vec<QueryPage>) {
        *self.query_pages.lock().unwrap() = pages.into();
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn created(&self) -> Vec<CreatePageRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<QueryRequest> {
        self.queries.lock().unwrap().clone()
    }

    pub fn options_added(&self) -> Vec<(String, String)> {
        self.options_added.lock().unwrap().clone()
    }

    fn record(&self, method: &'static str) {
        *self.calls.lock().unwrap().entry(method).or_insert(0) += 1;
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn fetch_container(&self, _container_id: &str) -> Result<ContainerInfo, RemoteError> {
        self.record("fetch_container");
        if let Some(err) = self.container_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.container.lock().unwrap().clone()
    }

    async fn fetch_data_source(&self, _data_source_id: &str) -> Result<RemoteSchema, RemoteError> {
        self.record("fetch_data_source");
        Ok(self.schema.lock().unwrap().clone())
    }

    async fn fetch_legacy_schema(&self, _container_id: &str) -> Result<RemoteSchema, RemoteError> {
        self.record("fetch_legacy_schema");
        if let Some(err) = self.legacy_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.schema.lock().unwrap().clone())
    }

    async fn create_page(&self, request: &CreatePageRequest) -> Result<CreatedPage, RemoteError> {
        self.record("create_page");
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let index = {
            let mut created = self.created.lock().unwrap();
            created.push(request.clone());
            created.len()
        };
        let scripted = self.create_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(CreatedPage {
                id: format!("page-{}", index),
                url: Some(format!("https://notion.so/page-{}", index)),
            })
        })
    }

    async fn query(
        &self,
        _target: &ParentRef,
        request: &QueryRequest,
    ) -> Result<QueryPage, RemoteError> {
        self.record("query");
        self.queries.lock().unwrap().push(request.clone());
        let scripted = self.query_pages.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.query_results.lock().unwrap().clone()))
    }

    async fn add_property_option(
        &self,
        _target: &ParentRef,
        property: &str,
        _spec: &PropertySpec,
        option: &str,
    ) -> Result<(), RemoteError> {
        self.record("add_property_option");
        if let Some(err) = self.option_failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.options_added
            .lock()
            .unwrap()
            .push((property.to_string(), option.to_string()));
        Ok(())
    }
}

/// Lifecycle store kept in process memory.
#[derive(Default)]
pub struct MemoryLifecycleStore {
    records: Mutex<HashMap<String, LifecycleRecord>>,
    hashes: Mutex<HashMap<String, String>>,
    runs: Mutex<HashMap<String, DateTime<Utc>>>,
    usage: Mutex<HashMap<String, u64>>,
    record_sync_failures: Mutex<usize>,
}

impl MemoryLifecycleStore {
    pub fn insert(&self, record: LifecycleRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.path.clone(), record);
    }

    pub fn record(&self, path: &str) -> Option<LifecycleRecord> {
        self.records.lock().unwrap().get(path).cloned()
    }

    pub fn set_file_hash(&self, path: &str, hash: &str) {
        self.hashes
            .lock()
            .unwrap()
            .insert(path.to_string(), hash.to_string());
    }

    /// Fail the next `times` calls to `record_sync`.
    pub fn fail_record_sync(&self, times: usize) {
        *self.record_sync_failures.lock().unwrap() = times;
    }

    pub fn usage(&self, metric: &str) -> u64 {
        self.usage.lock().unwrap().get(metric).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LifecycleStore for MemoryLifecycleStore {
    fn store_name(&self) -> &'static str {
        "memory"
    }

    async fn get_document_status(&self, path: &str) -> Result<Option<LifecycleRecord>, SyncError> {
        Ok(self.record(path))
    }

    async fn register_document(
        &self,
        path: &str,
        doc_type: Option<&str>,
        status: LifecycleStatus,
        content_hash: Option<&str>,
        claimed_by: Option<&str>,
    ) -> Result<(), SyncError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(path.to_string())
            .or_insert_with(|| LifecycleRecord::new(path, status));
        record.status = status;
        record.doc_type = doc_type.map(str::to_string).or(record.doc_type.take());
        record.content_hash = content_hash.map(str::to_string);
        record.claimed_by = claimed_by.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_document_status(
        &self,
        path: &str,
        status: LifecycleStatus,
    ) -> Result<(), SyncError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(path)
            .ok_or_else(|| SyncError::Store(format!("No record for {}", path)))?;
        record.status = status;
        if status != LifecycleStatus::InProgress {
            record.claimed_by = None;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn release_stale_claims(&self, ttl: Duration) -> Result<usize, SyncError> {
        let now = Utc::now();
        let mut released = 0;
        for record in self.records.lock().unwrap().values_mut() {
            if record.is_stale_claim(ttl, now) {
                record.status = LifecycleStatus::Draft;
                record.claimed_by = None;
                record.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn record_sync(
        &self,
        path: &str,
        remote_id: &str,
        remote_url: Option<&str>,
        doc_type: Option<&str>,
        content_hash: &str,
    ) -> Result<(), SyncError> {
        {
            let mut failures = self.record_sync_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::Store("lifecycle file is read-only".to_string()));
            }
        }
        let mut record = LifecycleRecord::new(path, LifecycleStatus::Published);
        record.notion_page_id = Some(remote_id.to_string());
        record.notion_url = remote_url.map(str::to_string);
        record.doc_type = doc_type.map(str::to_string);
        record.content_hash = Some(content_hash.to_string());
        self.insert(record);
        self.set_file_hash(path, content_hash);
        Ok(())
    }

    async fn get_file_hash(&self, path: &str) -> Result<Option<String>, SyncError> {
        Ok(self.hashes.lock().unwrap().get(path).cloned())
    }

    async fn last_run(&self, job: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.runs.lock().unwrap().get(job).copied())
    }

    async fn mark_run(&self, job: &str, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.runs.lock().unwrap().insert(job.to_string(), at);
        Ok(())
    }

    async fn increment_usage(&self, metric: &str, by: u64) -> Result<(), SyncError> {
        *self
            .usage
            .lock()
            .unwrap()
            .entry(metric.to_string())
            .or_insert(0) += by;
        Ok(())
    }
}

/// Process-local lock manager.
#[derive(Default)]
pub struct MemoryLock {
    held: Arc<Mutex<HashSet<String>>>,
    acquisitions: Mutex<usize>,
}

struct MemoryLockHandle {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for MemoryLockHandle {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.key);
    }
}

impl MemoryLock {
    pub fn acquisitions(&self) -> usize {
        *self.acquisitions.lock().unwrap()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().unwrap().contains(key)
    }
}

#[async_trait]
impl LockManager for MemoryLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockAcquireResult, SyncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.held.lock().unwrap().insert(key.to_string()) {
                *self.acquisitions.lock().unwrap() += 1;
                let handle = MemoryLockHandle {
                    held: self.held.clone(),
                    key: key.to_string(),
                };
                return Ok(LockAcquireResult::Acquired(LockGuard::new(key, Box::new(handle))));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(LockAcquireResult::TryAgainLater);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Alert sink that keeps every message.
#[derive(Default)]
pub struct RecordingAlert {
    messages: Mutex<Vec<String>>,
    fail_next: Mutex<bool>,
}

impl RecordingAlert {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl AlertSink for RecordingAlert {
    async fn send_alert(&self, text: &str) -> Result<(), SyncError> {
        self.messages.lock().unwrap().push(text.to_string());
        let mut fail = self.fail_next.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(SyncError::Io("alert channel unavailable".to_string()));
        }
        Ok(())
    }
}
