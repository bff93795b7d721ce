mod alert;
mod config;
mod lifecycle;
mod lock;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use report_sync_core::{
    render_markdown, Document, LifecycleStore, LockManager, PropertyMapper, PublishEngine,
    RemoteStore, SchemaAdapter, SyncOptions, SyncOrchestrator,
};
use report_sync_notion::NotionClient;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alert::alert_sink_from;
use config::{Command, Config};
use lifecycle::JsonLifecycleStore;
use lock::FileLock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    tokio::select! {
        result = run(config) => result,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping");
            anyhow::bail!("interrupted")
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let state_dir = config.effective_state_dir();
    let lifecycle = Arc::new(JsonLifecycleStore::new(&state_dir));
    info!("  Lifecycle file: {}", lifecycle.state_file().display());

    match config.command.clone() {
        Command::ReleaseStale => {
            let ttl = Duration::from_secs(config.claim_ttl_secs);
            let released = lifecycle.release_stale_claims(ttl).await?;
            info!("Released {} stale claim(s)", released);
            print_json(&serde_json::json!({ "released": released }))
        }
        Command::Validate { file }
            if config.notion_token.is_none() || config.notion_database_id.is_none() =>
        {
            // Local checks only
            let doc = Document::load(&file).await?;
            let mapper = PropertyMapper::new(config.publish_config().property_names);
            let report = mapper.validate(&doc, &render_markdown(&doc.body), None);
            print_json(&report)
        }
        command => {
            let orchestrator = build_orchestrator(&config, lifecycle)?;
            execute(&orchestrator, command).await
        }
    }
}

fn build_orchestrator(
    config: &Config,
    lifecycle: Arc<JsonLifecycleStore>,
) -> anyhow::Result<SyncOrchestrator> {
    let notion = NotionClient::new(config.notion_config()?)?;
    let remote: Arc<dyn RemoteStore> = Arc::new(notion);
    let schema = Arc::new(SchemaAdapter::new(
        Arc::clone(&remote),
        config.database_id()?,
        config.notion_data_source_id.clone(),
    ));
    let alerts = alert_sink_from(
        config.telegram_bot_token.as_deref(),
        config.telegram_chat_id.as_deref(),
    )?;
    let lifecycle: Arc<dyn LifecycleStore> = lifecycle;
    let locks: Arc<dyn LockManager> = Arc::new(FileLock::new(config.effective_state_dir()));

    let actor_id = format!("report-sync-{}", uuid::Uuid::new_v4());
    info!("  Actor: {}", actor_id);
    info!("  Store: {}", lifecycle.store_name());

    let engine = PublishEngine::new(
        remote,
        schema,
        Arc::clone(&lifecycle),
        alerts,
        config.publish_config(),
    );
    Ok(SyncOrchestrator::new(
        engine,
        lifecycle,
        locks,
        config.sync_config(actor_id),
    ))
}

async fn execute(orchestrator: &SyncOrchestrator, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Sync {
            root,
            force,
            dry_run,
        } => {
            let report = orchestrator
                .sync_all(&root, SyncOptions { force, dry_run })
                .await
                .with_context(|| format!("sync of {} failed", root.display()))?;
            info!(
                "Sync finished: {} published, {} skipped, {} failed",
                report.success.len(),
                report.skipped.len(),
                report.failed.len()
            );
            print_json(&report)?;
            if !report.failed.is_empty() {
                anyhow::bail!("{} document(s) failed to publish", report.failed.len());
            }
            Ok(())
        }
        Command::Publish { file, force } => {
            let result = orchestrator.publish_document(&file, force).await?;
            print_json(&result)
        }
        Command::Validate { file } => {
            // Warm the schema cache so remote mismatches show up as warnings
            if let Err(e) = orchestrator.engine().schema_adapter().discover().await {
                warn!("Schema discovery failed, validating locally only: {}", e);
            }
            let report = orchestrator.validate_document(&file).await?;
            print_json(&report)
        }
        Command::Schema => {
            let resolved = orchestrator.engine().schema_adapter().discover().await?;
            print_json(&resolved)
        }
        Command::Query { status } => {
            let pages = orchestrator.list_published(status.as_deref()).await?;
            print_json(&pages)
        }
        // Handled in `run` without building a remote client
        Command::ReleaseStale => anyhow::bail!("release-stale does not use the orchestrator"),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
