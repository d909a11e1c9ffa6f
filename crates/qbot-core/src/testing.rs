//! Fakes for the ports, shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    domain::{Account, AccountId, ChatId, InboundMessage, MessageId, MessageRef, UserId},
    ports::{Assistant, ChatTransport, SessionConnector},
    Error, Result,
};

pub fn inbound(chat: ChatId, id: i32, sender: Option<i64>, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: chat,
        message_id: MessageId(id),
        sender_id: sender.map(UserId),
        text: text.to_string(),
        buttons: Vec::new(),
        sent_at: Utc::now(),
    }
}

pub fn account(name: &str) -> Account {
    Account {
        name: AccountId(name.to_string()),
        credential_ref: format!("{}_TOKEN", name.to_uppercase()),
        session_ref: None,
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Fault {
    Transport,
    Auth,
    Banned,
    /// Panics instead of returning an error.
    Panic,
}

impl Fault {
    fn into_error(self, what: &str) -> Error {
        match self {
            Fault::Transport => Error::Transport(format!("{what}: connection reset")),
            Fault::Auth => Error::Auth(format!("{what}: session expired")),
            Fault::Banned => Error::Banned(format!("{what}: account banned")),
            Fault::Panic => panic!("{what}: fake transport blew up"),
        }
    }
}

#[derive(Default)]
struct TransportState {
    inbox: VecDeque<InboundMessage>,
    after_send: VecDeque<InboundMessage>,
    next_sent_id: i32,
    sent: Vec<(ChatId, String, Option<MessageId>)>,
    receive_faults: VecDeque<Fault>,
    send_faults: VecDeque<Fault>,
    reconnect_faults: VecDeque<Fault>,
    always_fail_receive: Option<Fault>,
    broken_receive: Option<Fault>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<TransportState>,
    receive_calls: AtomicUsize,
    reconnect_calls: AtomicUsize,
}

impl FakeTransport {
    fn st(&self) -> std::sync::MutexGuard<'_, TransportState> {
        // A `Fault::Panic` poisons the lock; later calls still need the state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, msg: InboundMessage) {
        self.st().inbox.push_back(msg);
    }

    /// Delivered to the inbox once the next `send_text` happens.
    pub fn push_after_send(&self, msg: InboundMessage) {
        self.st().after_send.push_back(msg);
    }

    pub fn set_next_sent_id(&self, id: i32) {
        self.st().next_sent_id = id;
    }

    pub fn fail_receive(&self, fault: Fault) {
        self.st().receive_faults.push_back(fault);
    }

    pub fn fail_receive_forever(&self, fault: Fault) {
        self.st().always_fail_receive = Some(fault);
    }

    /// Receive keeps failing even though reconnects succeed.
    pub fn break_receive(&self, fault: Fault) {
        self.st().broken_receive = Some(fault);
    }

    pub fn fail_send(&self, fault: Fault, times: usize) {
        let mut st = self.st();
        for _ in 0..times {
            st.send_faults.push_back(fault);
        }
    }

    pub fn fail_reconnect(&self, fault: Fault, times: usize) {
        let mut st = self.st();
        for _ in 0..times {
            st.reconnect_faults.push_back(fault);
        }
    }

    pub fn sent(&self) -> Vec<(ChatId, String, Option<MessageId>)> {
        self.st().sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.st().sent.iter().map(|(_, t, _)| t.clone()).collect()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn receive_next(&self, chat: ChatId) -> Result<Option<InboundMessage>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.st();
        if let Some(fault) = st.broken_receive.or(st.always_fail_receive) {
            return Err(fault.into_error("receive"));
        }
        if let Some(fault) = st.receive_faults.pop_front() {
            return Err(fault.into_error("receive"));
        }
        let pos = st.inbox.iter().position(|m| m.chat_id == chat);
        Ok(pos.and_then(|i| st.inbox.remove(i)))
    }

    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        let mut st = self.st();
        if let Some(fault) = st.send_faults.pop_front() {
            return Err(fault.into_error("send"));
        }
        st.sent.push((chat, text.to_string(), reply_to));
        st.next_sent_id += 1;
        let id = MessageId(st.next_sent_id);
        let released: Vec<_> = st.after_send.drain(..).collect();
        st.inbox.extend(released);
        Ok(MessageRef {
            chat_id: chat,
            message_id: id,
        })
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.st();
        if let Some(fault) = st.reconnect_faults.pop_front() {
            return Err(fault.into_error("reconnect"));
        }
        st.always_fail_receive = None;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    After(Duration, String),
    Fail,
    Never,
}

#[derive(Default)]
pub struct FakeAssistant {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeAssistant {
    pub fn replying(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Assistant for FakeAssistant {
    async fn ask(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Never);
        match reply {
            Reply::Text(t) => Ok(t),
            Reply::After(d, t) => {
                tokio::time::sleep(d).await;
                Ok(t)
            }
            Reply::Fail => Err(Error::Transport("assistant chat unreachable".into())),
            Reply::Never => future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct FakeConnector {
    transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
    faults: Mutex<HashMap<String, Fault>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn with_transport(&self, name: &str, transport: Arc<FakeTransport>) {
        self.transports
            .lock()
            .unwrap()
            .insert(name.to_string(), transport);
    }

    pub fn fail_for(&self, name: &str, fault: Fault) {
        self.faults.lock().unwrap().insert(name.to_string(), fault);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn ChatTransport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.faults.lock().unwrap().get(&account.name.0).copied() {
            return Err(fault.into_error("connect"));
        }
        let transport = self
            .transports
            .lock()
            .unwrap()
            .entry(account.name.0.clone())
            .or_default()
            .clone();
        Ok(transport)
    }
}
