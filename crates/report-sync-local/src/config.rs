use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use report_sync_core::{PublishConfig, SyncConfig, SyncError};
use report_sync_notion::{NotionConfig, DEFAULT_API_BASE};

/// Configuration for the report-sync runner.
#[derive(Parser, Debug, Clone)]
#[command(name = "report-sync")]
#[command(about = "Publish local markdown reports to a Notion database")]
pub struct Config {
    /// Notion integration token
    #[arg(long, env = "NOTION_TOKEN", hide_env_values = true)]
    pub notion_token: Option<String>,

    /// Target database (container) id
    #[arg(long, env = "NOTION_DATABASE_ID")]
    pub notion_database_id: Option<String>,

    /// Pin a child data source instead of resolving it from the database
    #[arg(long, env = "NOTION_DATA_SOURCE_ID")]
    pub notion_data_source_id: Option<String>,

    /// Notion API root
    #[arg(long, default_value = DEFAULT_API_BASE, env = "NOTION_API_BASE")]
    pub notion_api_base: String,

    /// Per-request timeout for Notion calls
    #[arg(long, default_value = "30", env = "NOTION_REQUEST_TIMEOUT_SECS")]
    pub notion_request_timeout_secs: u64,

    /// Create calls allowed per document for transient failures
    #[arg(long, default_value = "3", env = "PUBLISH_MAX_ATTEMPTS")]
    pub publish_max_attempts: u32,

    /// First backoff delay; doubles on each retry
    #[arg(long, default_value = "1000", env = "PUBLISH_BASE_DELAY_MS")]
    pub publish_base_delay_ms: u64,

    /// Random jitter added to each delay, as a fraction of it
    #[arg(long, default_value = "0.25", env = "PUBLISH_JITTER_RATIO")]
    pub publish_jitter_ratio: f64,

    /// Skip every remote write
    #[arg(
        long,
        env = "PUBLISH_DISABLED",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub publish_disabled: bool,

    /// Age after which an in-progress claim is considered abandoned
    #[arg(long, default_value = "900", env = "CLAIM_TTL_SECS")]
    pub claim_ttl_secs: u64,

    /// How long to wait for another process holding a document lock
    #[arg(long, default_value = "5", env = "LOCK_TIMEOUT_SECS")]
    pub lock_timeout_secs: u64,

    /// Comma-separated substrings excluding files from batch runs
    #[arg(long, env = "SYNC_IGNORE_PATTERNS", value_delimiter = ',')]
    pub sync_ignore_patterns: Vec<String>,

    /// Directory for the lifecycle file and document locks
    #[arg(long, env = "REPORT_SYNC_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Telegram bot token for failure alerts
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: Option<String>,

    /// Telegram chat receiving failure alerts
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish every ready document under a directory
    Sync {
        root: PathBuf,
        /// Ignore the once-per-day gate and the local/remote hash checks
        #[arg(long)]
        force: bool,
        /// Validate locally without any remote write
        #[arg(long)]
        dry_run: bool,
    },
    /// Publish one document
    Publish {
        file: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Check one document without publishing it; the remote schema is read
    /// when Notion credentials are configured
    Validate { file: PathBuf },
    /// Print the discovered database schema
    Schema,
    /// List published pages
    Query {
        #[arg(long)]
        status: Option<String>,
    },
    /// Revert abandoned in-progress claims to draft
    ReleaseStale,
}

impl Config {
    /// Get the effective state directory.
    pub fn effective_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("report-sync")
        })
    }

    pub fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            max_attempts: self.publish_max_attempts.max(1),
            base_delay: Duration::from_millis(self.publish_base_delay_ms),
            jitter_ratio: self.publish_jitter_ratio.clamp(0.0, 1.0),
            dry_run_forced: self.publish_disabled,
            ..PublishConfig::default()
        }
    }

    pub fn sync_config(&self, actor_id: impl Into<String>) -> SyncConfig {
        SyncConfig {
            claim_ttl: Duration::from_secs(self.claim_ttl_secs),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            ignore_patterns: self
                .sync_ignore_patterns
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            actor_id: actor_id.into(),
        }
    }

    pub fn notion_config(&self) -> Result<NotionConfig, SyncError> {
        let token = self
            .notion_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SyncError::InvalidArgument("NOTION_TOKEN is required".to_string()))?;
        Ok(NotionConfig {
            token: token.to_string(),
            api_base: self.notion_api_base.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(self.notion_request_timeout_secs),
        })
    }

    pub fn database_id(&self) -> Result<&str, SyncError> {
        self.notion_database_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                SyncError::InvalidArgument("NOTION_DATABASE_ID is required".to_string())
            })
    }
}
