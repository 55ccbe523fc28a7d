//! Session source backed by the LiveDesk HTTP API

use std::time::Duration;

use async_trait::async_trait;
use livedesk_shared::{ChatSession, ResponderRef, SessionFilter, SessionId};
use reqwest::{Client, Response};
use serde::Deserialize;

use super::{SessionSource, SyncError};
use crate::desk::NewMessage;

/// Maximum retry attempts for a message post
const MAX_RETRIES: usize = 3;

/// Base delay for exponential backoff
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum delay between retries
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

pub struct HttpSessionSource {
    http_client: Client,
    base_url: String,
    retry_base_delay: Duration,
    max_retries: usize,
}

#[derive(Deserialize)]
struct SessionList {
    sessions: Vec<ChatSession>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl HttpSessionSource {
    /// `base_url` is the server root, e.g. `http://localhost:3000`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http_client: Client, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry_base_delay: RETRY_BASE_DELAY,
            max_retries: MAX_RETRIES,
        }
    }

    pub fn with_retry_policy(mut self, base_delay: Duration, max_retries: usize) -> Self {
        self.retry_base_delay = base_delay;
        self.max_retries = max_retries;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn post_once(
        &self,
        id: SessionId,
        message: &NewMessage,
    ) -> Result<ChatSession, SyncError> {
        let response = self
            .http_client
            .post(self.url(&format!("/sessions/{}/messages", id)))
            .json(message)
            .send()
            .await?;
        decode(response).await
    }
}

/// Turn an API response into a value or the API's error envelope
async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| SyncError::Transport(format!("invalid response body: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (status.as_str().to_string(), body),
    };
    Err(SyncError::Rejected {
        status: status.as_u16(),
        code,
        message,
    })
}

fn filter_query(filter: &SessionFilter) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(client_id) = filter.client_id {
        query.push(("client_id", client_id.to_string()));
    }
    match filter.responder {
        Some(ResponderRef::Human(id)) => query.push(("responder_id", id.to_string())),
        Some(ResponderRef::Automated) => query.push(("automated", "true".to_string())),
        None => {}
    }
    if filter.include_waiting {
        query.push(("include_waiting", "true".to_string()));
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        query.push(("status", statuses.join(",")));
    }
    query
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch_session(&self, id: SessionId) -> Result<ChatSession, SyncError> {
        let response = self
            .http_client
            .get(self.url(&format!("/sessions/{}", id)))
            .send()
            .await?;
        decode(response).await
    }

    async fn fetch_sessions(&self, filter: &SessionFilter) -> Result<Vec<ChatSession>, SyncError> {
        let response = self
            .http_client
            .get(self.url("/sessions"))
            .query(&filter_query(filter))
            .send()
            .await?;
        let list: SessionList = decode(response).await?;
        Ok(list.sessions)
    }

    /// Retries transient failures with the same dedup token, so a post that
    /// landed before its response was lost is not stored twice
    async fn post_message(
        &self,
        id: SessionId,
        message: NewMessage,
    ) -> Result<ChatSession, SyncError> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy =
            ExponentialBackoff::from_millis(self.retry_base_delay.as_millis() as u64)
                .max_delay(RETRY_MAX_DELAY)
                .take(self.max_retries)
                .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.post_once(id, &message).await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(session_id = %id, error = %e, "Transient error - will retry");
                    Err(result)
                }
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use livedesk_shared::{ClientId, Priority, ResponderId, SessionStatus};
    use time::OffsetDateTime;

    fn session() -> ChatSession {
        ChatSession::new(
            ClientId::new(),
            "Refund",
            Priority::High,
            serde_json::json!({"page": "/orders"}),
            OffsetDateTime::now_utc(),
        )
    }

    fn source(server: &mockito::Server) -> HttpSessionSource {
        HttpSessionSource::new(server.url()).with_retry_policy(Duration::from_millis(1), 3)
    }

    #[test]
    fn test_staff_filter_query() {
        let responder = ResponderId::new();
        let query = filter_query(&SessionFilter::staff_queue(responder));
        assert_eq!(
            query,
            vec![
                ("responder_id", responder.to_string()),
                ("include_waiting", "true".to_string()),
                ("status", "waiting,active".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_session() {
        let mut server = mockito::Server::new_async().await;
        let expected = session();
        let mock = server
            .mock("GET", format!("/api/v1/sessions/{}", expected.id).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&expected).unwrap())
            .create_async()
            .await;

        let fetched = source(&server).fetch_session(expected.id).await.unwrap();
        assert_eq!(fetched.id, expected.id);
        assert_eq!(fetched.status, SessionStatus::Waiting);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_sessions_sends_filter() {
        let mut server = mockito::Server::new_async().await;
        let client = ClientId::new();
        let mock = server
            .mock("GET", "/api/v1/sessions")
            .match_query(mockito::Matcher::UrlEncoded(
                "client_id".into(),
                client.to_string(),
            ))
            .with_status(200)
            .with_body(serde_json::json!({"sessions": [session()]}).to_string())
            .create_async()
            .await;

        let sessions = source(&server)
            .fetch_sessions(&SessionFilter::open_for_client(client))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let id = SessionId::new();
        let mock = server
            .mock("POST", format!("/api/v1/sessions/{}/messages", id).as_str())
            .with_status(409)
            .with_body(
                r#"{"error":{"code":"INVALID_STATE","message":"session is completed"}}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let message = NewMessage::from_client(ClientId::new(), "hello", Some("tok".into()));
        let err = source(&server).post_message(id, message).await.unwrap_err();
        match err {
            SyncError::Rejected { status, code, .. } => {
                assert_eq!(status, 409);
                assert_eq!(code, "INVALID_STATE");
            }
            other => panic!("unexpected error: {other}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unavailable_is_retried_with_same_token() {
        let mut server = mockito::Server::new_async().await;
        let id = SessionId::new();
        let mock = server
            .mock("POST", format!("/api/v1/sessions/{}/messages", id).as_str())
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"dedup_token": "same-token"}),
            ))
            .with_status(503)
            .with_body(r#"{"error":{"code":"SERVICE_UNAVAILABLE","message":"store down"}}"#)
            .expect(4)
            .create_async()
            .await;

        let message = NewMessage::from_client(ClientId::new(), "hello", Some("same-token".into()));
        let err = source(&server).post_message(id, message).await.unwrap_err();
        assert!(err.is_transient());
        mock.assert_async().await;
    }
}
