use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::sleep};

use crate::{
    domain::{ChatId, UserId},
    extractor,
    ports::{Assistant, ChatTransport},
    Result,
};

/// Assistant reached over a chat transport: the question goes to the
/// assistant's chat and the reply is read back from the same chat.
///
/// Replies carry no correlation id, so only one question is in flight per
/// assistant at a time. Interim replies ("thinking...") are skipped until one
/// carries a letter; the caller's deadline bounds the wait.
pub struct TransportAssistant {
    transport: Arc<dyn ChatTransport>,
    chat: ChatId,
    assistant_id: Option<UserId>,
    poll_interval: Duration,
    inflight: Mutex<()>,
}

impl TransportAssistant {
    pub fn new(transport: Arc<dyn ChatTransport>, chat: ChatId) -> Self {
        Self {
            transport,
            chat,
            assistant_id: None,
            poll_interval: Duration::from_secs(1),
            inflight: Mutex::new(()),
        }
    }

    /// Only accept replies from this sender.
    pub fn with_assistant_id(mut self, id: UserId) -> Self {
        self.assistant_id = Some(id);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl Assistant for TransportAssistant {
    async fn ask(&self, prompt: &str) -> Result<String> {
        let _turn = self.inflight.lock().await;

        let sent = self.transport.send_text(self.chat, prompt, None).await?;

        loop {
            while let Some(msg) = self.transport.receive_next(self.chat).await? {
                if msg.message_id.0 <= sent.message_id.0 {
                    continue;
                }
                if let Some(expected) = self.assistant_id {
                    if msg.sender_id != Some(expected) {
                        continue;
                    }
                }
                if msg.text.trim().is_empty() {
                    continue;
                }
                if extractor::extract(&msg.text).is_some() {
                    return Ok(msg.text);
                }
                tracing::debug!(chat = self.chat.0, "interim assistant reply skipped");
            }
            sleep(self.poll_interval).await;
        }
    }
}
