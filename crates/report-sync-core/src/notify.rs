use async_trait::async_trait;

use crate::error::SyncError;

/// Out-of-band notification channel for terminal failures.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, text: &str) -> Result<(), SyncError>;
}

/// Alert text for a publish that could not be completed.
pub fn terminal_alert_text(path: &str, attempts: u32, last_error: &str) -> String {
    format!(
        "report-sync: publishing {} failed after {} attempt(s)\nlast error: {}",
        path, attempts, last_error
    )
}
