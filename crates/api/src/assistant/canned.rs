//! Fixed-text automated responder used when no bot endpoint is configured

use async_trait::async_trait;
use livedesk_shared::Message;

use super::{AssistantError, AutomatedResponder, BotReply};

pub struct CannedResponder {
    reply: String,
}

impl CannedResponder {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl AutomatedResponder for CannedResponder {
    async fn generate_reply(&self, _transcript: &[Message]) -> Result<BotReply, AssistantError> {
        Ok(BotReply {
            content: self.reply.clone(),
        })
    }
}
