//! Single-document publish with retry, schema repair and minimal fallback.
//!
//! One publish walks an explicit state machine:
//!
//! ```text
//! Building   -> Attempting                        (schema, payload, option preflight, blocks)
//! Attempting -> Succeeded
//!            -> SchemaRepair -> Attempting        (immediate, no attempt consumed)
//!            -> Backoff -> Attempting             (transient, attempts left)
//!            -> MinimalFallback -> Succeeded | ExhaustedFailed
//!            -> ExhaustedFailed                   (fatal)
//! ```
//!
//! The transition decisions ([`classify_failure`], [`next_after_failure`],
//! [`backoff_delay`]) are pure functions; the engine only performs the side
//! effects each state asks for.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::blocks::{normalize_tables, render_markdown};
use crate::document::Document;
use crate::error::{RemoteError, SyncError};
use crate::lifecycle::LifecycleStore;
use crate::mapper::{
    PropertyMapper, PropertyNames, PropertyPayload, PropertyValue, ValidationReport,
};
use crate::notify::{terminal_alert_text, AlertSink};
use crate::remote::{CreatePageRequest, CreatedPage, PageSummary, QueryRequest, RemoteStore};
use crate::schema::{
    ParentRef, PropertySpec, PropertyType, RemoteSchema, ResolvedSchema, SchemaAdapter,
};

/// Blocks accepted by a single create call.
pub const DEFAULT_MAX_BLOCKS: usize = 100;

/// Usage counter bumped on every successful publish.
pub const METRIC_PUBLISH_SUCCESS: &str = "publish_success";
/// Usage counter bumped when a publish only succeeded in degraded form.
pub const METRIC_PUBLISH_DEGRADED: &str = "publish_degraded";

const QUERY_PAGE_SIZE: u32 = 100;

/// Tunables for the publish engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishConfig {
    /// Create calls allowed for transient failures, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the random jitter, as a fraction of the delay.
    pub jitter_ratio: f64,
    pub max_blocks: usize,
    /// Skip every publish with reason `publish_disabled`.
    pub dry_run_forced: bool,
    pub property_names: PropertyNames,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            jitter_ratio: 0.25,
            max_blocks: DEFAULT_MAX_BLOCKS,
            dry_run_forced: false,
            property_names: PropertyNames::default(),
        }
    }
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub page_id: Option<String>,
    pub url: Option<String>,
    pub doc_type: Option<String>,
    pub tags: Vec<String>,
    pub skipped: bool,
    pub reason: Option<String>,
    /// Published with the minimal payload only.
    pub degraded: bool,
    /// Total create calls made.
    pub attempts: u32,
    /// Blocks left out because of the per-call limit.
    pub truncated_blocks: usize,
}

impl PublishResult {
    pub fn skipped(reason: impl Into<String>, page_id: Option<String>) -> Self {
        Self {
            page_id,
            skipped: true,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// What exactly the remote disliked about a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchKind {
    /// An enumerated option does not exist.
    MissingOption(Option<String>),
    /// The property exists with another representation.
    WrongType(Option<PropertyType>),
    /// The property is absent or its value cannot be expressed.
    Unusable,
}

/// A validation failure attributable to one payload property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub property: String,
    pub kind: MismatchKind,
}

/// Classification of a failed create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    SchemaMismatch(SchemaMismatch),
    /// Network, conflict, rate limit or server error.
    Transient,
    /// Any other client-side rejection.
    Rejected,
    /// Authentication or addressing; retrying cannot help.
    Fatal,
}

/// What the state machine does after a failed create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Repair(SchemaMismatch),
    /// Sleep with the backoff for the current attempt, then try again.
    Retry,
    MinimalFallback,
    Terminal,
}

/// Classify a create failure against the payload that caused it.
pub fn classify_failure(err: &RemoteError, payload: &PropertyPayload) -> FailureClass {
    if err.is_fatal() {
        return FailureClass::Fatal;
    }
    if err.is_transient() {
        return FailureClass::Transient;
    }
    match err {
        RemoteError::Api { status: 400, message, .. } => match mentioned_property(message, payload) {
            Some(property) => FailureClass::SchemaMismatch(SchemaMismatch {
                property,
                kind: mismatch_kind(message),
            }),
            None => FailureClass::Rejected,
        },
        RemoteError::Api { .. } => FailureClass::Rejected,
        // A create whose response cannot be read may still have succeeded.
        RemoteError::Decode(_) => FailureClass::Fatal,
        RemoteError::Network(_) => FailureClass::Transient,
    }
}

/// Longest non-title payload property named in the error message.
fn mentioned_property(message: &str, payload: &PropertyPayload) -> Option<String> {
    payload
        .iter()
        .filter(|(_, value)| !matches!(value, PropertyValue::Title(_)))
        .map(|(name, _)| name)
        .filter(|name| message.contains(name.as_str()))
        .max_by_key(|name| name.len())
        .cloned()
}

fn mismatch_kind(message: &str) -> MismatchKind {
    let lower = message.to_lowercase();
    if let Some((_, rest)) = lower.split_once("expected to be ") {
        let tag: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        let kind = PropertyType::from_remote(&tag);
        return MismatchKind::WrongType((kind != PropertyType::Unknown).then_some(kind));
    }
    if lower.contains("option") {
        let quoted = message
            .split('"')
            .nth(1)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        return MismatchKind::MissingOption(quoted);
    }
    MismatchKind::Unusable
}

/// Decide the next state after a failed create call.
///
/// `attempt` is the 1-based count of backoff-budgeted attempts so far.
/// A property already in `repaired` is not repaired again; the failure is
/// then handled like a transient one.
pub fn next_after_failure(
    class: &FailureClass,
    attempt: u32,
    max_attempts: u32,
    repaired: &HashSet<String>,
) -> Transition {
    match class {
        FailureClass::Fatal => Transition::Terminal,
        FailureClass::Rejected => Transition::MinimalFallback,
        FailureClass::SchemaMismatch(mismatch) if !repaired.contains(&mismatch.property) => {
            Transition::Repair(mismatch.clone())
        }
        FailureClass::SchemaMismatch(_) | FailureClass::Transient => {
            if attempt < max_attempts {
                Transition::Retry
            } else {
                Transition::MinimalFallback
            }
        }
    }
}

/// Backoff before attempt `attempt + 1`.
///
/// `base * 2^(attempt-1)` plus `jitter_sample * jitter_ratio` of that delay,
/// where `jitter_sample` is uniform in `[0, 1)`.
pub fn backoff_delay(base: Duration, attempt: u32, jitter_ratio: f64, jitter_sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    let jitter = delay.mul_f64(jitter_ratio.max(0.0) * jitter_sample.clamp(0.0, 1.0));
    delay.saturating_add(jitter)
}

/// Upper bound of the total sleep across `attempts` create calls.
pub fn max_total_backoff(base: Duration, attempts: u32, jitter_ratio: f64) -> Duration {
    (1..attempts)
        .map(|attempt| backoff_delay(base, attempt, jitter_ratio, 1.0))
        .fold(Duration::ZERO, Duration::saturating_add)
}

#[derive(Debug)]
enum PublishState {
    Attempting,
    SchemaRepair(SchemaMismatch),
    Backoff,
    MinimalFallback,
    Succeeded { page: CreatedPage, degraded: bool },
    ExhaustedFailed(RemoteError),
}

/// Publishes single documents to the remote store.
pub struct PublishEngine {
    remote: Arc<dyn RemoteStore>,
    schema: Arc<SchemaAdapter>,
    lifecycle: Arc<dyn LifecycleStore>,
    alerts: Arc<dyn AlertSink>,
    mapper: PropertyMapper,
    config: PublishConfig,
}

impl std::fmt::Debug for PublishEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishEngine")
            .field("backend", &self.remote.backend_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PublishEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        schema: Arc<SchemaAdapter>,
        lifecycle: Arc<dyn LifecycleStore>,
        alerts: Arc<dyn AlertSink>,
        config: PublishConfig,
    ) -> Self {
        let mut config = config;
        config.max_attempts = config.max_attempts.max(1);
        Self {
            remote,
            schema,
            lifecycle,
            alerts,
            mapper: PropertyMapper::new(config.property_names.clone()),
            config,
        }
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    pub fn schema_adapter(&self) -> &SchemaAdapter {
        &self.schema
    }

    /// Publish `doc` whose content fingerprint is `fingerprint`.
    ///
    /// Returns `Err(SyncError::TerminalPublish)` once every recovery path is
    /// exhausted; an alert has been sent by then.
    #[instrument(skip(self, doc, fingerprint), level = "debug", fields(path = %doc.path.display()))]
    pub async fn publish(&self, doc: &Document, fingerprint: &str) -> Result<PublishResult, SyncError> {
        if self.config.dry_run_forced {
            info!("Publishing disabled, skipping {}", doc.path.display());
            return Ok(PublishResult::skipped("publish_disabled", None));
        }

        let (resolved, mut attempt) = self.discover_with_backoff(doc).await?;
        let target = resolved.target.clone();

        let mapped = self.mapper.map(doc, fingerprint, &resolved.schema);
        for note in &mapped.notes {
            warn!("{}: {}: {}", doc.path.display(), note.field, note.message);
        }

        let mut payload = mapped.payload;
        for missing in &mapped.missing_options {
            if let Some(value) = payload.get(&missing.property).cloned() {
                self.add_option(&target, &resolved.schema, &missing.property, &value, &missing.option)
                    .await;
            }
        }

        let mut blocks = render_markdown(&doc.body);
        let fixed = normalize_tables(&mut blocks);
        if fixed > 0 {
            debug!("Normalized {} table row(s) in {}", fixed, doc.path.display());
        }
        let truncated_blocks = blocks.len().saturating_sub(self.config.max_blocks);
        if truncated_blocks > 0 {
            warn!(
                "{} has {} blocks, sending the first {} ({} truncated)",
                doc.path.display(),
                blocks.len(),
                self.config.max_blocks,
                truncated_blocks
            );
            blocks.truncate(self.config.max_blocks);
        }

        let mut result = PublishResult {
            doc_type: mapped.doc_type.clone(),
            tags: mapped.tags.clone(),
            truncated_blocks,
            ..Default::default()
        };

        if let Some(existing) = self
            .find_by_fingerprint(&target, &resolved.schema, fingerprint)
            .await
        {
            info!(
                "{} already exists remotely as {}, skipping create",
                doc.path.display(),
                existing.id
            );
            result.page_id = Some(existing.id);
            result.url = existing.url;
            result.reason = Some("remote_match".to_string());
            return Ok(result);
        }

        let mut calls: u32 = 0;
        let mut repaired: HashSet<String> = HashSet::new();
        let mut last_error: Option<RemoteError> = None;
        let mut state = PublishState::Attempting;

        loop {
            state = match state {
                PublishState::Attempting => {
                    calls += 1;
                    let request = CreatePageRequest {
                        parent: target.clone(),
                        properties: payload.clone(),
                        children: blocks.clone(),
                    };
                    match self.remote.create_page(&request).await {
                        Ok(page) => PublishState::Succeeded {
                            page,
                            degraded: false,
                        },
                        Err(e) => {
                            let class = classify_failure(&e, &payload);
                            let next =
                                next_after_failure(&class, attempt, self.config.max_attempts, &repaired);
                            warn!(
                                "Create attempt {} for {} failed ({:?}, next {:?}): {}",
                                calls,
                                doc.path.display(),
                                class,
                                next,
                                e
                            );
                            let state = match next {
                                Transition::Repair(mismatch) => PublishState::SchemaRepair(mismatch),
                                Transition::Retry => PublishState::Backoff,
                                Transition::MinimalFallback => PublishState::MinimalFallback,
                                Transition::Terminal => PublishState::ExhaustedFailed(e.clone()),
                            };
                            last_error = Some(e);
                            state
                        }
                    }
                }
                PublishState::SchemaRepair(mismatch) => {
                    repaired.insert(mismatch.property.clone());
                    if self.repair(&target, &mut payload, &mismatch).await {
                        PublishState::Attempting
                    } else if attempt < self.config.max_attempts {
                        PublishState::Backoff
                    } else {
                        PublishState::MinimalFallback
                    }
                }
                PublishState::Backoff => {
                    self.sleep_backoff(attempt).await;
                    attempt += 1;
                    PublishState::Attempting
                }
                PublishState::MinimalFallback => {
                    calls += 1;
                    let request = CreatePageRequest {
                        parent: target.clone(),
                        properties: self.mapper.minimal(doc, &resolved.schema),
                        children: blocks.clone(),
                    };
                    warn!("Falling back to minimal payload for {}", doc.path.display());
                    match self.remote.create_page(&request).await {
                        Ok(page) => PublishState::Succeeded {
                            page,
                            degraded: true,
                        },
                        Err(e) => PublishState::ExhaustedFailed(e),
                    }
                }
                PublishState::Succeeded { page, degraded } => {
                    info!(
                        "Published {} as {} after {} call(s){}",
                        doc.path.display(),
                        page.id,
                        calls,
                        if degraded { " (minimal payload)" } else { "" }
                    );
                    result.page_id = Some(page.id);
                    result.url = page.url;
                    result.attempts = calls;
                    result.degraded = degraded;
                    if degraded {
                        result.reason = Some("minimal_fallback".to_string());
                    }
                    self.count_success(degraded).await;
                    return Ok(result);
                }
                PublishState::ExhaustedFailed(e) => {
                    if let Some(previous) = last_error.take() {
                        debug!("Last regular attempt failed with: {}", previous);
                    }
                    return Err(self.fail(doc, calls, e).await);
                }
            };
        }
    }

    /// Discover the schema, backing off on transient failures.
    ///
    /// Discovery shares the attempt budget with the create calls; the returned
    /// attempt number is the one the first create call runs under.
    async fn discover_with_backoff(&self, doc: &Document) -> Result<(ResolvedSchema, u32), SyncError> {
        let mut attempt: u32 = 1;
        loop {
            match self.schema.discover().await {
                Ok(resolved) => return Ok((resolved, attempt)),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        "Schema discovery attempt {} for {} failed: {}",
                        attempt,
                        doc.path.display(),
                        e
                    );
                    self.sleep_backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(self.fail(doc, 0, e).await),
            }
        }
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let sample: f64 = rand::thread_rng().gen();
        let delay = backoff_delay(self.config.base_delay, attempt, self.config.jitter_ratio, sample);
        debug!("Backing off {:?} before attempt {}", delay, attempt + 1);
        tokio::time::sleep(delay).await;
    }

    /// Local-only checks, using the schema when one is already cached.
    pub fn validate(&self, doc: &Document) -> ValidationReport {
        let blocks = render_markdown(&doc.body);
        let cached = self.schema.cached_schema();
        self.mapper
            .validate(doc, &blocks, cached.as_ref().map(|resolved| &resolved.schema))
    }

    /// Every record on the target, newest first, optionally filtered by status.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_published(&self, status: Option<&str>) -> Result<Vec<PageSummary>, SyncError> {
        let resolved = self.schema.discover().await?;
        let names = &self.config.property_names;

        let filter = status.and_then(|wanted| {
            let spec = resolved.schema.get(&names.status)?;
            let key = match spec.kind {
                PropertyType::Status => "status",
                PropertyType::Select => "select",
                _ => return None,
            };
            Some(json!({ "property": names.status, key: { "equals": wanted } }))
        });
        let sorts = match resolved.schema.get(&names.date) {
            Some(spec) if spec.kind == PropertyType::Date => {
                vec![json!({ "property": names.date, "direction": "descending" })]
            }
            _ => vec![json!({ "timestamp": "created_time", "direction": "descending" })],
        };

        let mut request = QueryRequest {
            filter,
            sorts,
            start_cursor: None,
            page_size: Some(QUERY_PAGE_SIZE),
        };
        let mut pages = Vec::new();
        loop {
            let page = self.remote.query(&resolved.target, &request).await?;
            pages.extend(page.results);
            match page.next_cursor {
                Some(cursor) if page.has_more => request.start_cursor = Some(cursor),
                _ => break,
            }
        }
        debug!("Listed {} record(s)", pages.len());
        Ok(pages)
    }

    /// A remote record already carrying `fingerprint`, if the schema tracks it.
    async fn find_by_fingerprint(
        &self,
        target: &ParentRef,
        schema: &RemoteSchema,
        fingerprint: &str,
    ) -> Option<PageSummary> {
        let property = &self.config.property_names.content_hash;
        if schema.get(property)?.kind != PropertyType::RichText {
            return None;
        }
        let request = QueryRequest {
            filter: Some(json!({ "property": property, "rich_text": { "equals": fingerprint } })),
            page_size: Some(1),
            ..Default::default()
        };
        match self.remote.query(target, &request).await {
            Ok(page) => page.results.into_iter().next(),
            Err(e) => {
                warn!("Reconciliation query failed, continuing with create: {}", e);
                None
            }
        }
    }

    /// Try to add `option` to `property`; true on success.
    async fn add_option(
        &self,
        target: &ParentRef,
        schema: &RemoteSchema,
        property: &str,
        value: &PropertyValue,
        option: &str,
    ) -> bool {
        let spec = schema
            .get(property)
            .cloned()
            .unwrap_or_else(|| PropertySpec::new(value.kind()));
        if !spec.kind.has_options() {
            debug!("{} is {}, it has no options to extend", property, spec.kind);
            return false;
        }
        match self
            .remote
            .add_property_option(target, property, &spec, option)
            .await
        {
            Ok(()) => {
                info!("Added option '{}' to property {}", option, property);
                self.schema.update_cached(|schema| {
                    if let Some(spec) = schema.properties.get_mut(property) {
                        if spec.find_option(option).is_none() {
                            spec.options.push(option.to_string());
                        }
                    }
                });
                true
            }
            Err(e) => {
                warn!("Could not add option '{}' to {}: {}", option, property, e);
                false
            }
        }
    }

    /// Apply a repair to `payload`; false when there was nothing to repair.
    async fn repair(
        &self,
        target: &ParentRef,
        payload: &mut PropertyPayload,
        mismatch: &SchemaMismatch,
    ) -> bool {
        let Some(value) = payload.get(&mismatch.property).cloned() else {
            return false;
        };
        let property = mismatch.property.as_str();

        let replacement = match &mismatch.kind {
            MismatchKind::MissingOption(option) => {
                let option = option
                    .clone()
                    .or_else(|| value.selected_option().map(str::to_string));
                let schema = self
                    .schema
                    .cached_schema()
                    .map(|resolved| resolved.schema)
                    .unwrap_or_default();
                if let Some(option) = option {
                    if self.add_option(target, &schema, property, &value, &option).await {
                        return true;
                    }
                }
                value.kind().swapped().and_then(|kind| value.reshape(kind))
            }
            MismatchKind::WrongType(kind) => {
                self.schema.invalidate();
                kind.and_then(|kind| value.reshape(kind))
                    .or_else(|| value.kind().swapped().and_then(|kind| value.reshape(kind)))
            }
            MismatchKind::Unusable => {
                self.schema.invalidate();
                None
            }
        };

        match replacement {
            Some(reshaped) => {
                info!(
                    "Repairing {}: sending it as {} instead of {}",
                    property,
                    reshaped.kind(),
                    value.kind()
                );
                payload.insert(mismatch.property.clone(), reshaped);
            }
            None => {
                info!("Repairing {}: dropping the property", property);
                payload.remove(property);
            }
        }
        true
    }

    async fn count_success(&self, degraded: bool) {
        if let Err(e) = self.lifecycle.increment_usage(METRIC_PUBLISH_SUCCESS, 1).await {
            warn!("Failed to record usage: {}", e);
        }
        if degraded {
            if let Err(e) = self.lifecycle.increment_usage(METRIC_PUBLISH_DEGRADED, 1).await {
                warn!("Failed to record usage: {}", e);
            }
        }
    }

    /// Build the terminal error and report it to the alert sink.
    async fn fail(&self, doc: &Document, attempts: u32, err: RemoteError) -> SyncError {
        let path = doc.key();
        let last_error = err.to_string();
        error!(
            "Publishing {} failed after {} attempt(s): {}",
            path, attempts, last_error
        );
        let text = terminal_alert_text(&path, attempts, &last_error);
        if let Err(e) = self.alerts.send_alert(&text).await {
            error!("Failed to send alert for {}: {}", path, e);
        }
        SyncError::TerminalPublish {
            path,
            attempts,
            last_error,
        }
    }
}
