//! Shared application state and service wiring

use std::sync::Arc;

use livedesk_shared::{create_pool, run_migrations};

use crate::assistant::{AutomatedResponder, CannedResponder, FallbackAssistant, HttpAutomatedResponder};
use crate::config::Config;
use crate::desk::ChatService;
use crate::directory::{MemoryResponderDirectory, PgResponderDirectory, ResponderDirectory};
use crate::store::{MemorySessionStore, PgSessionStore, SessionStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub desk: Arc<ChatService>,
}

impl AppState {
    pub fn new(config: Config, desk: ChatService) -> Self {
        Self {
            config: Arc::new(config),
            desk: Arc::new(desk),
        }
    }
}

/// Pick the automated responder adapter for this configuration
pub fn build_assistant(config: &Config) -> Option<FallbackAssistant> {
    if !config.bot_fallback_enabled {
        return None;
    }

    let responder: Arc<dyn AutomatedResponder> = match &config.bot_endpoint_url {
        Some(endpoint) => {
            tracing::info!(endpoint = %endpoint, "Using HTTP automated responder");
            Arc::new(HttpAutomatedResponder::new(endpoint.clone(), config.bot_api_key.clone()))
        }
        None => {
            tracing::info!("No bot endpoint configured, using canned replies");
            Arc::new(CannedResponder::new(config.bot_canned_reply.clone()))
        }
    };

    Some(FallbackAssistant::new(
        responder,
        config.bot_reply_timeout(),
        config.breaker_config(),
    ))
}

/// Connect storage (Postgres when `DATABASE_URL` is set, memory otherwise)
/// and assemble the chat service
pub async fn build_desk(config: &Config) -> anyhow::Result<ChatService> {
    let (store, directory): (Arc<dyn SessionStore>, Arc<dyn ResponderDirectory>) =
        match &config.database_url {
            Some(url) => {
                let pool = create_pool(url, config.database_max_connections).await?;
                run_migrations(&pool).await?;
                tracing::info!("Connected to Postgres, migrations applied");
                (
                    Arc::new(PgSessionStore::new(pool.clone())),
                    Arc::new(PgResponderDirectory::new(pool)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, sessions are kept in memory only");
                (
                    Arc::new(MemorySessionStore::new()),
                    Arc::new(MemoryResponderDirectory::new()),
                )
            }
        };

    Ok(ChatService::new(
        store,
        directory,
        build_assistant(config),
        config.desk_settings(),
    ))
}
