use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blocks::Block;
use crate::error::RemoteError;
use crate::mapper::PropertyPayload;
use crate::schema::{ParentRef, PropertySpec, RemoteSchema};

/// What the container itself reports during the first discovery phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Child data sources, in the order the remote lists them.
    pub data_source_ids: Vec<String>,
    /// Properties declared directly on the container, if any.
    pub properties: Option<RemoteSchema>,
}

/// A page-create request.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatePageRequest {
    pub parent: ParentRef,
    pub properties: PropertyPayload,
    /// Content blocks, already capped to what one call accepts.
    pub children: Vec<Block>,
}

/// Identity of a page the remote created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPage {
    pub id: String,
    pub url: Option<String>,
}

/// Filter/sort/pagination for listing records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sorts: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

/// One record returned by a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub properties: Value,
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub results: Vec<PageSummary>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Remote hierarchical content store abstraction.
///
/// The store owns a container which may hold child data sources; each owns a
/// property schema and the published records. Implementations only translate
/// calls to the wire; retry, repair and caching policy live in the engine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the backend identifier (e.g., "notion").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Schema discovery
    // =========================================================================

    /// Read the container and list its child data sources.
    async fn fetch_container(&self, container_id: &str) -> Result<ContainerInfo, RemoteError>;

    /// Read the property schema of a child data source.
    async fn fetch_data_source(&self, data_source_id: &str) -> Result<RemoteSchema, RemoteError>;

    /// Single-phase property fetch of the container (pre data-source API).
    async fn fetch_legacy_schema(&self, container_id: &str) -> Result<RemoteSchema, RemoteError>;

    // =========================================================================
    // Records
    // =========================================================================

    /// Create a record with properties and content blocks.
    async fn create_page(&self, request: &CreatePageRequest) -> Result<CreatedPage, RemoteError>;

    /// List records matching a filter.
    async fn query(
        &self,
        target: &ParentRef,
        request: &QueryRequest,
    ) -> Result<QueryPage, RemoteError>;

    // =========================================================================
    // Schema mutation
    // =========================================================================

    /// Append `option` to an enumerated property, keeping `spec.options`.
    async fn add_property_option(
        &self,
        target: &ParentRef,
        property: &str,
        spec: &PropertySpec,
        option: &str,
    ) -> Result<(), RemoteError>;
}
