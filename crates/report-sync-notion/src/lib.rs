//! Notion backend for report-sync.
//!
//! Implements `RemoteStore` over the Notion REST API, speaking both the
//! data-source API and the legacy database API used as discovery fallback.

mod client;

pub use client::{
    NotionClient, NotionConfig, DEFAULT_API_BASE, LEGACY_NOTION_VERSION, NOTION_VERSION,
};
