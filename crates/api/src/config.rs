//! Application configuration

use std::env;
use std::time::Duration;

use crate::assistant::CircuitBreakerConfig;
use crate::desk::DeskSettings;
use crate::sync::SyncConfig;

pub const DEFAULT_CANNED_REPLY: &str = "Thanks for reaching out! All of our agents are busy right now, someone will be with you shortly.";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database (unset runs on the in-memory store and directory)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Routing
    pub wait_threshold_secs: u64,
    pub assign_max_attempts: u32,

    // Automated responder
    pub bot_fallback_enabled: bool,
    pub bot_endpoint_url: Option<String>,
    pub bot_api_key: Option<String>,
    pub bot_canned_reply: String,
    pub bot_reply_timeout_ms: u64,
    pub bot_breaker_failure_threshold: u32,

    // Limits
    pub max_message_length: usize,
    pub max_subject_length: usize,

    // Sweeper
    pub enable_embedded_sweeper: bool,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    /// How long applied load-change tokens are remembered
    pub load_op_retention_hours: u64,

    // Viewer sync
    pub sync_poll_interval_ms: u64,
    pub sync_degraded_after: u32,

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),

            // Routing
            wait_threshold_secs: {
                let raw = env::var("WAIT_THRESHOLD_SECS").unwrap_or_else(|_| "120".to_string());
                match raw.parse::<u64>() {
                    Ok(secs) if secs > 0 => secs,
                    _ => {
                        return Err(ConfigError::Invalid {
                            var: "WAIT_THRESHOLD_SECS",
                            reason: format!("expected a positive number of seconds, got {:?}", raw),
                        })
                    }
                }
            },
            assign_max_attempts: env::var("ASSIGN_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),

            // Automated responder
            bot_fallback_enabled: env::var("BOT_FALLBACK_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            bot_endpoint_url: env::var("BOT_ENDPOINT_URL").ok().filter(|url| !url.is_empty()),
            bot_api_key: env::var("BOT_API_KEY").ok().filter(|key| !key.is_empty()),
            bot_canned_reply: env::var("BOT_CANNED_REPLY")
                .unwrap_or_else(|_| DEFAULT_CANNED_REPLY.to_string()),
            bot_reply_timeout_ms: env::var("BOT_REPLY_TIMEOUT_MS")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .unwrap_or(4000),
            bot_breaker_failure_threshold: env::var("BOT_BREAKER_FAILURE_THRESHOLD")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            // Limits
            max_message_length: {
                let raw = env::var("MAX_MESSAGE_LENGTH").unwrap_or_else(|_| "50000".to_string());
                match raw.parse::<usize>() {
                    Ok(len) if len > 0 => len,
                    _ => {
                        return Err(ConfigError::Invalid {
                            var: "MAX_MESSAGE_LENGTH",
                            reason: format!("expected a positive length, got {:?}", raw),
                        })
                    }
                }
            },
            max_subject_length: env::var("MAX_SUBJECT_LENGTH")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),

            // Sweeper
            enable_embedded_sweeper: env::var("ENABLE_EMBEDDED_SWEEPER")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),
            sweep_batch_size: env::var("SWEEP_BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            load_op_retention_hours: env::var("LOAD_OP_RETENTION_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .unwrap_or(24),

            // Viewer sync
            sync_poll_interval_ms: env::var("SYNC_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            sync_degraded_after: env::var("SYNC_DEGRADED_AFTER")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),

            // Logging
            log_json: env::var("LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    pub fn desk_settings(&self) -> DeskSettings {
        DeskSettings {
            wait_threshold: Duration::from_secs(self.wait_threshold_secs),
            assign_max_attempts: self.assign_max_attempts,
            bot_fallback_enabled: self.bot_fallback_enabled,
            max_message_length: self.max_message_length,
            max_subject_length: self.max_subject_length,
            operation_retention: Duration::from_secs(self.load_op_retention_hours.max(1) * 3600),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(self.sync_poll_interval_ms.max(1)),
            degraded_after: self.sync_degraded_after.max(1),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.bot_breaker_failure_threshold.max(1),
            ..CircuitBreakerConfig::default()
        }
    }

    pub fn bot_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.bot_reply_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "DATABASE_URL",
        "WAIT_THRESHOLD_SECS",
        "BOT_FALLBACK_ENABLED",
        "BOT_ENDPOINT_URL",
        "MAX_MESSAGE_LENGTH",
        "SYNC_DEGRADED_AFTER",
        "LOAD_OP_RETENTION_HOURS",
        "LOG_FORMAT",
    ];

    /// Helper to clear env vars before and after tests
    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        assert_eq!(config.wait_threshold_secs, 120);
        assert!(config.bot_fallback_enabled);
        assert!(config.bot_endpoint_url.is_none());
        assert_eq!(config.bot_canned_reply, DEFAULT_CANNED_REPLY);
        assert_eq!(config.max_message_length, 50_000);
        assert!(!config.log_json);

        let settings = config.desk_settings();
        assert_eq!(settings.wait_threshold, Duration::from_secs(120));
        assert_eq!(settings.operation_retention, Duration::from_secs(24 * 3600));
        assert_eq!(config.sync_config().degraded_after, 3);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://localhost/livedesk");
        env::set_var("WAIT_THRESHOLD_SECS", "30");
        env::set_var("BOT_FALLBACK_ENABLED", "false");
        env::set_var("SYNC_DEGRADED_AFTER", "5");
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/livedesk")
        );
        assert_eq!(config.wait_threshold_secs, 30);
        assert!(!config.bot_fallback_enabled);
        assert_eq!(config.sync_degraded_after, 5);
        assert!(config.log_json);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_wait_threshold_must_be_positive() {
        cleanup_config();

        for bad in ["0", "-5", "soon"] {
            env::set_var("WAIT_THRESHOLD_SECS", bad);
            match Config::from_env() {
                Err(ConfigError::Invalid { var, .. }) => assert_eq!(var, "WAIT_THRESHOLD_SECS"),
                other => panic!("Expected Invalid error for {:?}, got: {:?}", bad, other),
            }
        }

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_empty_database_url_means_memory() {
        cleanup_config();
        env::set_var("DATABASE_URL", "");

        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());

        cleanup_config();
    }
}
