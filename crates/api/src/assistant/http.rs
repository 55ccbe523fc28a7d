//! HTTP automated responder
//!
//! POSTs the transcript as JSON to a configured endpoint and expects
//! `{"reply": "..."}` back.

use async_trait::async_trait;
use livedesk_shared::{Message, SenderType};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{AssistantError, AutomatedResponder, BotReply};

pub struct HttpAutomatedResponder {
    http_client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ReplyRequest<'a> {
    transcript: Vec<TranscriptEntry<'a>>,
}

#[derive(Serialize)]
struct TranscriptEntry<'a> {
    seq: i64,
    role: SenderType,
    content: &'a str,
}

#[derive(Deserialize)]
struct ReplyResponse {
    reply: String,
}

impl HttpAutomatedResponder {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_client(Client::new(), endpoint, api_key)
    }

    pub fn with_client(http_client: Client, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl AutomatedResponder for HttpAutomatedResponder {
    async fn generate_reply(&self, transcript: &[Message]) -> Result<BotReply, AssistantError> {
        let body = ReplyRequest {
            transcript: transcript
                .iter()
                .map(|m| TranscriptEntry {
                    seq: m.seq,
                    role: m.sender_type,
                    content: &m.content,
                })
                .collect(),
        };

        let mut request = self.http_client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = %status, "Automated responder returned an error status");
            return Err(AssistantError::Status(status.as_u16()));
        }

        let parsed: ReplyResponse = response
            .json()
            .await
            .map_err(|e| AssistantError::InvalidReply(e.to_string()))?;

        Ok(BotReply {
            content: parsed.reply,
        })
    }
}
