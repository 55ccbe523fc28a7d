//! LiveDesk background worker
//!
//! Runs the waiting-session sweep on a cron schedule against the shared
//! Postgres store, so sessions nobody polls still get routed or handed to
//! the automated responder.

use std::sync::Arc;

use livedesk_api::{
    config::ConfigError,
    desk::{sweep_waiting_sessions, ChatService},
    state::build_desk,
    telemetry, Config,
};
use tokio_cron_scheduler::{Job, JobScheduler};

/// Every 15 seconds (seconds-resolution cron)
const DEFAULT_SWEEP_CRON: &str = "*/15 * * * * *";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    telemetry::init_tracing(config.log_json);

    // An in-memory store would only ever see its own (empty) sessions
    if config.database_url.is_none() {
        return Err(ConfigError::Missing("DATABASE_URL").into());
    }

    let cron = std::env::var("SWEEP_CRON").unwrap_or_else(|_| DEFAULT_SWEEP_CRON.to_string());
    let batch = config.sweep_batch_size;
    let desk: Arc<ChatService> = Arc::new(build_desk(&config).await?);

    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create scheduler: {}", e))?;

    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let desk = desk.clone();
        Box::pin(async move {
            if let Err(e) = sweep_waiting_sessions(&desk, batch).await {
                tracing::error!(error = %e, "Waiting-session sweep failed");
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("invalid SWEEP_CRON {:?}: {}", cron, e))?;

    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow::anyhow!("failed to schedule sweep: {}", e))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start scheduler: {}", e))?;

    tracing::info!(cron = %cron, batch, "LiveDesk worker started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler did not shut down cleanly");
    }
    tracing::info!("LiveDesk worker stopped");
    Ok(())
}
