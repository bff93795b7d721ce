//! Alert sinks for terminal publish failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use report_sync_core::{AlertSink, RemoteError, SyncError};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, instrument};

/// Telegram Bot API root.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Sends alerts to one Telegram chat through the Bot API.
pub struct TelegramAlert {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramAlert {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }
}

impl std::fmt::Debug for TelegramAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramAlert")
            .field("api_base", &self.api_base)
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AlertSink for TelegramAlert {
    #[instrument(skip(self, text), level = "debug")]
    async fn send_alert(&self, text: &str) -> Result<(), SyncError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&SendMessageRequest {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api {
                status: status.as_u16(),
                code: "telegram_error".to_string(),
                message: body,
            }
            .into());
        }

        debug!("Alert delivered to chat {}", self.chat_id);
        Ok(())
    }
}

/// Fallback sink that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlert;

#[async_trait]
impl AlertSink for LogAlert {
    async fn send_alert(&self, text: &str) -> Result<(), SyncError> {
        error!("{}", text);
        Ok(())
    }
}

/// Telegram when both credentials are present, the log otherwise.
pub fn alert_sink_from(
    bot_token: Option<&str>,
    chat_id: Option<&str>,
) -> Result<Arc<dyn AlertSink>, SyncError> {
    match (
        bot_token.filter(|s| !s.is_empty()),
        chat_id.filter(|s| !s.is_empty()),
    ) {
        (Some(token), Some(chat)) => Ok(Arc::new(TelegramAlert::new(
            TELEGRAM_API_BASE,
            token,
            chat,
        )?)),
        _ => Ok(Arc::new(LogAlert)),
    }
}
