//! Remote property schema and its session-scoped discovery.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::RemoteError;
use crate::remote::RemoteStore;

/// Closed set of property representations the mapper knows how to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Title,
    RichText,
    Select,
    Status,
    MultiSelect,
    Date,
    Relation,
    Unknown,
}

impl PropertyType {
    /// Parse the remote's type tag (`"multi_select"`, `"status"`, ...).
    pub fn from_remote(tag: &str) -> Self {
        match tag.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "title" => PropertyType::Title,
            "rich_text" | "text" => PropertyType::RichText,
            "select" => PropertyType::Select,
            "status" => PropertyType::Status,
            "multi_select" => PropertyType::MultiSelect,
            "date" => PropertyType::Date,
            "relation" => PropertyType::Relation,
            _ => PropertyType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Title => "title",
            PropertyType::RichText => "rich_text",
            PropertyType::Select => "select",
            PropertyType::Status => "status",
            PropertyType::MultiSelect => "multi_select",
            PropertyType::Date => "date",
            PropertyType::Relation => "relation",
            PropertyType::Unknown => "unknown",
        }
    }

    /// Single-choice representations that can stand in for each other.
    pub fn swapped(&self) -> Option<PropertyType> {
        match self {
            PropertyType::Select => Some(PropertyType::Status),
            PropertyType::Status => Some(PropertyType::Select),
            _ => None,
        }
    }

    /// Whether the type carries an enumerated option list.
    pub fn has_options(&self) -> bool {
        matches!(
            self,
            PropertyType::Select | PropertyType::Status | PropertyType::MultiSelect
        )
    }
}

impl std::fmt::Display for PropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type and options of one remote property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub kind: PropertyType,
    #[serde(default)]
    pub options: Vec<String>,
}

impl PropertySpec {
    pub fn new(kind: PropertyType) -> Self {
        Self {
            kind,
            options: Vec::new(),
        }
    }

    pub fn with_options<I, S>(kind: PropertyType, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    /// Case-insensitive lookup returning the remote's spelling of an option.
    pub fn find_option(&self, wanted: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.eq_ignore_ascii_case(wanted.trim()))
            .map(String::as_str)
    }
}

/// Property name -> declared spec, as discovered from the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSchema {
    pub properties: BTreeMap<String, PropertySpec>,
}

impl RemoteSchema {
    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: PropertySpec) {
        self.properties.insert(name.into(), spec);
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Name of the mandatory title property, if the schema declares one.
    pub fn title_property(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|(_, spec)| spec.kind == PropertyType::Title)
            .map(|(name, _)| name.as_str())
    }

    /// Parse a Notion-style `properties` object.
    ///
    /// Entries without a usable `type` become [`PropertyType::Unknown`].
    pub fn from_notion_properties(properties: &Value) -> Result<Self, RemoteError> {
        let map = properties
            .as_object()
            .ok_or_else(|| RemoteError::Decode("properties is not an object".to_string()))?;

        let mut schema = RemoteSchema::default();
        for (name, prop) in map {
            let tag = prop.get("type").and_then(Value::as_str).unwrap_or("");
            let kind = PropertyType::from_remote(tag);
            let options = prop
                .get(tag)
                .and_then(|body| body.get("options"))
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| o.get("name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            schema.insert(name.clone(), PropertySpec { kind, options });
        }
        Ok(schema)
    }
}

/// Where new pages are created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ParentRef {
    /// The top-level container, used when no child data source exists.
    Database(String),
    /// A child data source resolved from the container.
    DataSource(String),
}

impl ParentRef {
    pub fn id(&self) -> &str {
        match self {
            ParentRef::Database(id) | ParentRef::DataSource(id) => id,
        }
    }

    /// The `parent` object of a page-create request.
    pub fn to_json(&self) -> Value {
        match self {
            ParentRef::Database(id) => json!({ "type": "database_id", "database_id": id }),
            ParentRef::DataSource(id) => {
                json!({ "type": "data_source_id", "data_source_id": id })
            }
        }
    }
}

/// A schema together with the parent it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSchema {
    pub target: ParentRef,
    pub schema: RemoteSchema,
}

/// Discovers and caches the property schema of one container.
///
/// Discovery resolves the container's child data source first and reads
/// its properties. Any failure in that path falls back to the legacy
/// single-phase fetch of the container's own properties. The resolved child
/// id is memoized for the lifetime of the adapter; `invalidate` only drops
/// the property map.
pub struct SchemaAdapter {
    remote: Arc<dyn RemoteStore>,
    container_id: String,
    pinned_data_source: Option<String>,
    data_source_id: Mutex<Option<String>>,
    cached: Mutex<Option<ResolvedSchema>>,
}

impl std::fmt::Debug for SchemaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaAdapter")
            .field("container_id", &self.container_id)
            .field("pinned_data_source", &self.pinned_data_source)
            .finish_non_exhaustive()
    }
}

impl SchemaAdapter {
    /// Create an adapter for `container_id`.
    ///
    /// `pinned_data_source` is an operator override that skips child
    /// resolution entirely.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        container_id: impl Into<String>,
        pinned_data_source: Option<String>,
    ) -> Self {
        Self {
            remote,
            container_id: container_id.into(),
            pinned_data_source: pinned_data_source.filter(|s| !s.trim().is_empty()),
            data_source_id: Mutex::new(None),
            cached: Mutex::new(None),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// The child data source in use, pinned or learned.
    pub fn data_source_id(&self) -> Option<String> {
        self.pinned_data_source.clone().or_else(|| {
            self.data_source_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Return the cached schema, discovering it on first use.
    #[instrument(skip(self), level = "debug", fields(container = %self.container_id))]
    pub async fn discover(&self) -> Result<ResolvedSchema, RemoteError> {
        if let Some(cached) = self.cached_schema() {
            return Ok(cached);
        }

        let resolved = match self.discover_two_phase().await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "Schema discovery via data source failed for {} ({}), using legacy property fetch",
                    self.container_id, e
                );
                let schema = self.remote.fetch_legacy_schema(&self.container_id).await?;
                ResolvedSchema {
                    target: ParentRef::Database(self.container_id.clone()),
                    schema,
                }
            }
        };

        debug!(
            "Discovered {} properties on {:?}",
            resolved.schema.properties.len(),
            resolved.target
        );
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(resolved.clone());
        Ok(resolved)
    }

    /// Drop the cached property map so the next `discover` refetches it.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Patch the cached schema after a successful schema mutation.
    pub fn update_cached<F>(&self, update: F)
    where
        F: FnOnce(&mut RemoteSchema),
    {
        if let Some(resolved) = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            update(&mut resolved.schema);
        }
    }

    /// The cached schema, without triggering discovery.
    pub fn cached_schema(&self) -> Option<ResolvedSchema> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn discover_two_phase(&self) -> Result<ResolvedSchema, RemoteError> {
        let data_source_id = match self.data_source_id() {
            Some(id) => id,
            None => {
                let container = self.remote.fetch_container(&self.container_id).await?;
                match container.data_source_ids.into_iter().next() {
                    Some(id) => {
                        info!(
                            "Resolved data source {} for container {}",
                            id, self.container_id
                        );
                        *self
                            .data_source_id
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
                        id
                    }
                    None => {
                        debug!(
                            "Container {} has no child data source, treating it as terminal",
                            self.container_id
                        );
                        let schema = match container.properties {
                            Some(props) if !props.is_empty() => props,
                            _ => self.remote.fetch_legacy_schema(&self.container_id).await?,
                        };
                        return Ok(ResolvedSchema {
                            target: ParentRef::Database(self.container_id.clone()),
                            schema,
                        });
                    }
                }
            }
        };

        let schema = self.remote.fetch_data_source(&data_source_id).await?;
        if schema.is_empty() {
            return Err(RemoteError::Decode(format!(
                "data source {} returned no properties",
                data_source_id
            )));
        }

        Ok(ResolvedSchema {
            target: ParentRef::DataSource(data_source_id),
            schema,
        })
    }
}
