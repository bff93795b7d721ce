//! Core types and traits for the report publish-synchronization engine.
//!
//! This crate holds everything that does not depend on a concrete backend:
//! - `RemoteStore`: Schema discovery, page creation and queries on the remote
//! - `LifecycleStore`: Durable per-document publish state shared across processes
//! - `LockManager`: Per-document mutual exclusion
//! - `AlertSink`: Notification of terminal failures
//! - `PublishEngine` / `SyncOrchestrator`: The publish state machine and batch driver

mod blocks;
mod document;
mod error;
mod fingerprint;
mod lifecycle;
mod lock;
mod mapper;
mod notify;
mod publish;
mod remote;
mod schema;
mod sync;

#[cfg(test)]
mod testing;

pub use blocks::{normalize_tables, render_markdown, rich_text, validate_blocks, Block};
pub use document::{Document, Metadata, Readiness};
pub use error::{RemoteError, SyncError};
pub use fingerprint::{fingerprint, normalize_body};
pub use lifecycle::{LifecycleRecord, LifecycleStatus, LifecycleStore};
pub use lock::{LockAcquireResult, LockGuard, LockManager};
pub use mapper::{
    normalize_date, normalize_relation_id, normalize_tags, payload_to_json, MappedProperties,
    MissingOption, PropertyMapper, PropertyNames, PropertyPayload, PropertyValue, Severity,
    ValidationNote, ValidationReport,
};
pub use notify::{terminal_alert_text, AlertSink};
pub use publish::{
    backoff_delay, classify_failure, max_total_backoff, next_after_failure, FailureClass,
    MismatchKind, PublishConfig, PublishEngine, PublishResult, SchemaMismatch, Transition,
    METRIC_PUBLISH_DEGRADED, METRIC_PUBLISH_SUCCESS,
};
pub use remote::{
    ContainerInfo, CreatePageRequest, CreatedPage, PageSummary, QueryPage, QueryRequest,
    RemoteStore,
};
pub use schema::{
    ParentRef, PropertySpec, PropertyType, RemoteSchema, ResolvedSchema, SchemaAdapter,
};
pub use sync::{
    exclusion_reason, FailedDocument, SkippedDocument, SyncConfig, SyncOptions, SyncOrchestrator,
    SyncOutcome, SyncReport, SYNC_ALL_JOB,
};
