//! Telegram adapter (teloxide, Bot API).
//!
//! Implements the `qbot-core` transport ports over `getUpdates` polling.
//! One `Bot` serves every chat the account can see; updates are buffered
//! per chat so the quiz monitor and the assistant reader never steal each
//! other's messages. Only chats that have been read from or sent to are
//! buffered; updates from any other chat are dropped.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    env,
    sync::Arc,
};

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{Message, UpdateKind},
    ApiError, RequestError,
};
use tokio::{sync::Mutex, time::sleep};

use qbot_core::{
    domain::{Account, ChatId, InboundMessage, MessageId, MessageRef, UserId},
    errors::Error,
    ports::{ChatTransport, SessionConnector},
    Result,
};

/// Per-chat buffer bound; older updates are dropped first.
const MAX_PENDING_PER_CHAT: usize = 1000;

#[derive(Default)]
struct PollState {
    offset: i32,
    watched: HashSet<i64>,
    pending: HashMap<i64, VecDeque<InboundMessage>>,
}

impl PollState {
    fn watch(&mut self, chat: ChatId) {
        self.watched.insert(chat.0);
    }

    /// Returns false if the message's chat is not watched.
    fn enqueue(&mut self, msg: InboundMessage) -> bool {
        if !self.watched.contains(&msg.chat_id.0) {
            return false;
        }
        let queue = self.pending.entry(msg.chat_id.0).or_default();
        if queue.len() == MAX_PENDING_PER_CHAT {
            queue.pop_front();
        }
        queue.push_back(msg);
        true
    }

    fn pop(&mut self, chat: ChatId) -> Option<InboundMessage> {
        self.pending.get_mut(&chat.0).and_then(VecDeque::pop_front)
    }
}

pub struct TelegramTransport {
    bot: Bot,
    poll_timeout_secs: u32,
    state: Mutex<PollState>,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            poll_timeout_secs: 0,
            state: Mutex::new(PollState::default()),
        }
    }

    /// Long-poll timeout for `getUpdates`. Zero (the default) polls without waiting.
    pub fn with_poll_timeout(mut self, secs: u32) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    tracing::debug!(retry_after_secs = d.as_secs(), "telegram rate limit, retrying");
                    sleep(d).await;
                }
                Err(e) => return Err(map_err(e)),
            }
        }
    }

    async fn fetch_updates(&self, st: &mut PollState) -> Result<()> {
        let offset = st.offset;
        let timeout = self.poll_timeout_secs;
        let updates = self
            .with_retry(|| self.bot.get_updates().offset(offset).timeout(timeout))
            .await?;

        let mut dropped = 0usize;
        for update in updates {
            st.offset = st.offset.max(update.id + 1);
            let Some(msg) = update_message(&update.kind).and_then(to_inbound) else {
                continue;
            };
            if !st.enqueue(msg) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::trace!(dropped, "ignored updates from unwatched chats");
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn receive_next(&self, chat: ChatId) -> Result<Option<InboundMessage>> {
        let mut st = self.state.lock().await;
        st.watch(chat);
        if let Some(msg) = st.pop(chat) {
            return Ok(Some(msg));
        }
        self.fetch_updates(&mut st).await?;
        Ok(st.pop(chat))
    }

    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        // replies to what we send must not be dropped before the first read
        self.state.lock().await.watch(chat);
        let msg = self
            .with_retry(|| {
                let req = self.bot.send_message(Self::tg_chat(chat), text.to_string());
                match reply_to {
                    Some(id) => req.reply_to_message_id(teloxide::types::MessageId(id.0)),
                    None => req,
                }
            })
            .await?;
        Ok(MessageRef {
            chat_id: chat,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        // Bot API sessions are stateless; a successful getMe is a live session.
        self.with_retry(|| self.bot.get_me()).await?;
        Ok(())
    }
}

/// Resolves `Account::credential_ref` as the name of an environment variable
/// holding the bot token.
#[derive(Clone, Debug, Default)]
pub struct TelegramConnector {
    poll_timeout_secs: u32,
}

impl TelegramConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_timeout(mut self, secs: u32) -> Self {
        self.poll_timeout_secs = secs;
        self
    }
}

#[async_trait]
impl SessionConnector for TelegramConnector {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn ChatTransport>> {
        let token = env::var(&account.credential_ref)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                Error::Auth(format!(
                    "{} is not set for account '{}'",
                    account.credential_ref, account.name
                ))
            })?;

        let bot = Bot::new(token);
        let me = bot.get_me().await.map_err(map_err)?;
        tracing::info!(
            account = %account.name,
            bot = me.username(),
            bot_id = me.id.0,
            "telegram session ready"
        );

        Ok(Arc::new(
            TelegramTransport::new(bot).with_poll_timeout(self.poll_timeout_secs),
        ))
    }
}

pub fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::NotFound) => Error::Auth("telegram rejected the bot token".into()),
        RequestError::Api(
            api @ (ApiError::BotKicked | ApiError::BotKickedFromSupergroup | ApiError::BotBlocked),
        ) => Error::Banned(format!("telegram: {api}")),
        RequestError::Network(e) => Error::Transport(format!("telegram network error: {e}")),
        RequestError::RetryAfter(d) => {
            Error::Transport(format!("telegram rate limit, retry after {}s", d.as_secs()))
        }
        RequestError::Io(e) => Error::Transport(format!("telegram i/o error: {e}")),
        other => Error::External(format!("telegram error: {other}")),
    }
}

fn update_message(kind: &UpdateKind) -> Option<&Message> {
    match kind {
        UpdateKind::Message(m) | UpdateKind::ChannelPost(m) => Some(m),
        _ => None,
    }
}

/// Convert a Bot API message. Messages without text or caption are dropped.
pub fn to_inbound(msg: &Message) -> Option<InboundMessage> {
    let text = msg.text().or_else(|| msg.caption())?.to_string();
    let sender_id = msg
        .from()
        .and_then(|u| i64::try_from(u.id.0).ok())
        .or_else(|| msg.sender_chat().map(|c| c.id.0))
        .map(UserId);
    let buttons = msg
        .reply_markup()
        .map(|markup| {
            markup
                .inline_keyboard
                .iter()
                .flatten()
                .map(|b| b.text.clone())
                .collect()
        })
        .unwrap_or_default();

    Some(InboundMessage {
        chat_id: ChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
        sender_id,
        text,
        buttons,
        sent_at: msg.date,
    })
}
