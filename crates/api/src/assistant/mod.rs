//! Automated responder seam
//!
//! The text generation itself is an opaque collaborator. The desk only ever
//! calls it through [`FallbackAssistant`], which bounds latency with a
//! timeout and stops hammering a failing endpoint with a circuit breaker.

pub mod canned;
pub mod circuit_breaker;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livedesk_shared::{DeskError, Message, SessionId};

pub use canned::CannedResponder;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use http::HttpAutomatedResponder;

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("Automated responder request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Automated responder returned status {0}")]
    Status(u16),

    #[error("Automated responder timed out after {0:?}")]
    Timeout(Duration),

    #[error("Automated responder circuit is open")]
    CircuitOpen,

    #[error("Automated responder returned an invalid reply: {0}")]
    InvalidReply(String),
}

impl From<AssistantError> for DeskError {
    fn from(err: AssistantError) -> Self {
        DeskError::ServiceUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotReply {
    pub content: String,
}

/// Produces a reply for an ordered transcript
#[async_trait]
pub trait AutomatedResponder: Send + Sync {
    async fn generate_reply(&self, transcript: &[Message]) -> Result<BotReply, AssistantError>;
}

/// Timeout + circuit breaker wrapper the desk uses for every bot call
pub struct FallbackAssistant {
    responder: Arc<dyn AutomatedResponder>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl FallbackAssistant {
    pub fn new(
        responder: Arc<dyn AutomatedResponder>,
        timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            responder,
            breaker: CircuitBreaker::new("automated_responder", breaker),
            timeout,
        }
    }

    /// Ask for a reply. Timeouts count as failures towards opening the breaker.
    pub async fn reply(
        &self,
        session_id: SessionId,
        transcript: &[Message],
    ) -> Result<BotReply, AssistantError> {
        let timeout = self.timeout;
        let result = self
            .breaker
            .call(|| async {
                match tokio::time::timeout(timeout, self.responder.generate_reply(transcript)).await
                {
                    Ok(reply) => reply,
                    Err(_) => Err(AssistantError::Timeout(timeout)),
                }
            })
            .await;

        match result {
            Ok(reply) if reply.content.trim().is_empty() => {
                Err(AssistantError::InvalidReply("empty reply".to_string()))
            }
            Ok(reply) => {
                tracing::debug!(session_id = %session_id, "Automated reply generated");
                Ok(reply)
            }
            Err(CircuitBreakerError::Rejected) => Err(AssistantError::CircuitOpen),
            Err(CircuitBreakerError::Inner(err)) => Err(err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowResponder {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl AutomatedResponder for SlowResponder {
        async fn generate_reply(&self, _: &[Message]) -> Result<BotReply, AssistantError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(BotReply {
                content: "late".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_timeout_then_breaker_opens() {
        let slow = Arc::new(SlowResponder {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let assistant = FallbackAssistant::new(
            slow.clone(),
            Duration::from_millis(10),
            CircuitBreakerConfig {
                failure_threshold: 2,
                min_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(60),
            },
        );
        let session = SessionId::new();

        for _ in 0..2 {
            let err = assistant.reply(session, &[]).await.unwrap_err();
            assert!(matches!(err, AssistantError::Timeout(_)));
        }

        let err = assistant.reply(session, &[]).await.unwrap_err();
        assert!(matches!(err, AssistantError::CircuitOpen));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_canned_reply_passes_through() {
        let assistant = FallbackAssistant::new(
            Arc::new(CannedResponder::new("hang tight")),
            Duration::from_secs(1),
            CircuitBreakerConfig::default(),
        );
        let reply = assistant.reply(SessionId::new(), &[]).await.unwrap();
        assert_eq!(reply.content, "hang tight");
    }
}
