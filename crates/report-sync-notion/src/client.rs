use std::time::Duration;

use async_trait::async_trait;
use report_sync_core::{
    payload_to_json, ContainerInfo, CreatePageRequest, CreatedPage, ParentRef, PropertySpec,
    QueryPage, QueryRequest, RemoteError, RemoteSchema, RemoteStore,
};
use reqwest::{Client as HttpClient, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// API version with the container/data-source split.
pub const NOTION_VERSION: &str = "2025-09-03";
/// API version where a database owns its properties directly.
pub const LEGACY_NOTION_VERSION: &str = "2022-06-28";

pub const DEFAULT_API_BASE: &str = "https://api.notion.com";

/// Connection settings for [`NotionClient`].
#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    /// Scheme and host, without the `/v1` prefix.
    pub api_base: String,
    pub request_timeout: Duration,
}

impl NotionConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Notion REST API client.
///
/// Translates [`RemoteStore`] calls to HTTP; it never retries on its own.
pub struct NotionClient {
    http_client: HttpClient,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotionClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    /// Create a new client. Every request is bounded by `request_timeout`.
    pub fn new(config: NotionConfig) -> Result<Self, RemoteError> {
        let http_client = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    fn authorized(&self, request: RequestBuilder, version: &str) -> RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", version)
    }

    /// Legacy database targets are addressed with the legacy API version.
    fn version_for(target: &ParentRef) -> &'static str {
        match target {
            ParentRef::DataSource(_) => NOTION_VERSION,
            ParentRef::Database(_) => LEGACY_NOTION_VERSION,
        }
    }

    fn target_path(target: &ParentRef) -> String {
        match target {
            ParentRef::DataSource(id) => format!("data_sources/{}", id),
            ParentRef::Database(id) => format!("databases/{}", id),
        }
    }

    /// Send a request and decode the JSON body of a success response.
    async fn execute(&self, request: RequestBuilder, what: &str) -> Result<Value, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body: Option<ErrorBody> = serde_json::from_str(&text).ok();
            let (code, message) = match body {
                Some(ErrorBody { code, message }) => (
                    code.unwrap_or_else(|| status.as_str().to_string()),
                    message.unwrap_or(text),
                ),
                None => (status.as_str().to_string(), text),
            };
            debug!("{} failed with status {}: {} {}", what, status, code, message);
            return Err(RemoteError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Decode(format!("Failed to read {} response: {}", what, e)))
    }

    fn properties_of(body: &Value, what: &str) -> Result<RemoteSchema, RemoteError> {
        let properties = body
            .get("properties")
            .ok_or_else(|| RemoteError::Decode(format!("{} response has no properties", what)))?;
        RemoteSchema::from_notion_properties(properties)
    }
}

#[async_trait]
impl RemoteStore for NotionClient {
    fn backend_name(&self) -> &'static str {
        "notion"
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch_container(&self, container_id: &str) -> Result<ContainerInfo, RemoteError> {
        let request = self.authorized(
            self.http_client
                .get(self.url(&format!("databases/{}", container_id))),
            NOTION_VERSION,
        );
        let body = self.execute(request, "Database GET").await?;

        let data_source_ids: Vec<String> = body
            .get("data_sources")
            .and_then(Value::as_array)
            .map(|sources| {
                sources
                    .iter()
                    .filter_map(|s| s.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let properties = match body.get("properties") {
            Some(props) => Some(RemoteSchema::from_notion_properties(props)?),
            None => None,
        };

        debug!(
            "Database {} lists {} data source(s)",
            container_id,
            data_source_ids.len()
        );
        Ok(ContainerInfo {
            data_source_ids,
            properties,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch_data_source(&self, data_source_id: &str) -> Result<RemoteSchema, RemoteError> {
        let request = self.authorized(
            self.http_client
                .get(self.url(&format!("data_sources/{}", data_source_id))),
            NOTION_VERSION,
        );
        let body = self.execute(request, "Data source GET").await?;
        Self::properties_of(&body, "Data source GET")
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch_legacy_schema(&self, container_id: &str) -> Result<RemoteSchema, RemoteError> {
        let request = self.authorized(
            self.http_client
                .get(self.url(&format!("databases/{}", container_id))),
            LEGACY_NOTION_VERSION,
        );
        let body = self.execute(request, "Legacy database GET").await?;
        Self::properties_of(&body, "Legacy database GET")
    }

    #[instrument(skip(self, request), level = "debug", fields(parent = request.parent.id(), blocks = request.children.len()))]
    async fn create_page(&self, request: &CreatePageRequest) -> Result<CreatedPage, RemoteError> {
        let children: Vec<Value> = request.children.iter().map(|b| b.to_json()).collect();
        let body = json!({
            "parent": request.parent.to_json(),
            "properties": payload_to_json(&request.properties),
            "children": children,
        });

        let http = self.authorized(
            self.http_client.post(self.url("pages")).json(&body),
            Self::version_for(&request.parent),
        );
        let response = self.execute(http, "Page create").await?;

        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Decode("Page create response has no id".to_string()))?
            .to_string();
        let url = response
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string);

        debug!("Created page {}", id);
        Ok(CreatedPage { id, url })
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn query(
        &self,
        target: &ParentRef,
        request: &QueryRequest,
    ) -> Result<QueryPage, RemoteError> {
        let http = self.authorized(
            self.http_client
                .post(self.url(&format!("{}/query", Self::target_path(target))))
                .json(request),
            Self::version_for(target),
        );
        let body = self.execute(http, "Query").await?;
        let page: QueryPage = serde_json::from_value(body)
            .map_err(|e| RemoteError::Decode(format!("Invalid query response: {}", e)))?;

        debug!("Query returned {} result(s), has_more={}", page.results.len(), page.has_more);
        Ok(page)
    }

    #[instrument(skip(self, spec), level = "debug")]
    async fn add_property_option(
        &self,
        target: &ParentRef,
        property: &str,
        spec: &PropertySpec,
        option: &str,
    ) -> Result<(), RemoteError> {
        // The remote replaces the option list, so existing options are re-sent.
        let mut options: Vec<Value> = spec.options.iter().map(|o| json!({ "name": o })).collect();
        if spec.find_option(option).is_none() {
            options.push(json!({ "name": option }));
        }
        let kind = spec.kind.as_str();
        let body = json!({
            "properties": {
                property: { kind: { "options": options } }
            }
        });

        let http = self.authorized(
            self.http_client
                .patch(self.url(&Self::target_path(target)))
                .json(&body),
            Self::version_for(target),
        );
        self.execute(http, "Schema PATCH").await?;

        debug!("Added option '{}' to {}", option, property);
        Ok(())
    }
}
