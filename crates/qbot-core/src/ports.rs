//! Hexagonal ports. Telegram and the assistant backends live behind these
//! traits in adapter crates.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::{Account, ChatId, InboundMessage, MessageId, MessageRef},
    Result,
};

/// One connected chat session.
///
/// Connection problems come back as `Error::Transport` (retryable),
/// `Error::Auth` or `Error::Banned`; they are never encoded in message data.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Next unseen message in `chat`, oldest first. `None` when caught up.
    async fn receive_next(&self, chat: ChatId) -> Result<Option<InboundMessage>>;

    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef>;

    /// Re-establish the session after a transport error.
    async fn reconnect(&self) -> Result<()>;
}

/// External authentication collaborator: turns an account's stored
/// references into a connected session.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn ChatTransport>>;
}

/// Slow external question answerer.
///
/// Implementations may take arbitrarily long; the resolver owns the deadline
/// and drops the future when it elapses.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn ask(&self, prompt: &str) -> Result<String>;
}
