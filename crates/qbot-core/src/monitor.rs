//! Per-account scan / detect / resolve / submit loop.
//!
//! ```text
//! Idle -> Scanning -> Detecting -> Resolving -> Submitting -> Scanning ...
//!    any transport error -> Disconnected -> Reconnecting -> Scanning
//! ```
//!
//! Auth and ban errors end the loop immediately; transient transport errors
//! are retried with bounded backoff before the monitor gives up.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    audit::SubmissionLog,
    config::DEFAULT_QUIZ_SOURCE_ID,
    detector::QuizDetector,
    domain::{AccountId, ChatId, InboundMessage, MessageId, QuizMessage, SubmissionRecord, UserId},
    errors::Error,
    ports::ChatTransport,
    resolver::{AnswerResolver, Resolution},
    Result,
};

/// Upper bound on messages marked as seen while skipping the startup backlog.
const BACKLOG_DRAIN_LIMIT: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorSettings {
    pub quiz_chat: ChatId,
    pub quiz_source: UserId,
    pub scan_interval: Duration,
    pub max_scan_messages: usize,
    pub max_quiz_age: Duration,
    pub post_quiz_cooldown: Duration,
    pub submit_attempts: u32,
    pub submit_backoff: Duration,
    pub receive_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,
    pub seen_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            quiz_chat: ChatId(0),
            quiz_source: UserId(DEFAULT_QUIZ_SOURCE_ID),
            scan_interval: Duration::from_secs(5),
            max_scan_messages: 50,
            max_quiz_age: Duration::from_secs(300),
            post_quiz_cooldown: Duration::from_secs(60),
            submit_attempts: 3,
            submit_backoff: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(30),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            seen_capacity: 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Scanning,
    Detecting,
    Resolving,
    Submitting,
    Disconnected,
    Reconnecting,
    /// Waiting for re-authentication outside the core.
    Paused,
    Stopped,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorState::Idle => "idle",
            MonitorState::Scanning => "scanning",
            MonitorState::Detecting => "detecting",
            MonitorState::Resolving => "resolving",
            MonitorState::Submitting => "submitting",
            MonitorState::Disconnected => "disconnected",
            MonitorState::Reconnecting => "reconnecting",
            MonitorState::Paused => "paused",
            MonitorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a monitor's `run()` returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorExit {
    Cancelled,
    AuthRequired(String),
    Banned(String),
    TransportExhausted(String),
}

impl MonitorExit {
    /// Whether a supervisor may restart the monitor after this exit.
    pub fn is_restartable(&self) -> bool {
        matches!(self, MonitorExit::TransportExhausted(_))
    }

    fn from_fatal(err: Error) -> Self {
        match err {
            Error::Auth(msg) => MonitorExit::AuthRequired(msg),
            Error::Banned(msg) => MonitorExit::Banned(msg),
            other => MonitorExit::TransportExhausted(other.to_string()),
        }
    }
}

/// Bounded FIFO set of processed message ids.
struct SeenSet {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

pub struct AccountMonitor {
    account: AccountId,
    transport: Arc<dyn ChatTransport>,
    resolver: Arc<AnswerResolver>,
    submissions: Arc<SubmissionLog>,
    detector: QuizDetector,
    settings: MonitorSettings,
    state: Arc<watch::Sender<MonitorState>>,
    seen: SeenSet,
    /// Consecutive failed recovery cycles; reset by a successful receive.
    failures: u32,
}

impl AccountMonitor {
    pub fn new(
        account: AccountId,
        transport: Arc<dyn ChatTransport>,
        resolver: Arc<AnswerResolver>,
        submissions: Arc<SubmissionLog>,
        settings: MonitorSettings,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Idle);
        Self {
            account,
            transport,
            resolver,
            submissions,
            detector: QuizDetector::new(settings.quiz_source),
            settings,
            state: Arc::new(state),
            seen: SeenSet::new(settings.seen_capacity),
            failures: 0,
        }
    }

    /// Publish state through an externally owned channel (kept across restarts).
    pub fn with_state_sender(mut self, state: Arc<watch::Sender<MonitorState>>) -> Self {
        self.state = state;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Run until cancelled or the session becomes unusable.
    pub async fn run(mut self, cancel: CancellationToken) -> MonitorExit {
        self.set_state(MonitorState::Idle);
        tracing::info!(account = %self.account, chat = self.settings.quiz_chat.0, "monitor started");

        let exit = self.run_inner(&cancel).await;
        let final_state = match &exit {
            MonitorExit::Cancelled | MonitorExit::Banned(_) => MonitorState::Stopped,
            MonitorExit::AuthRequired(_) => MonitorState::Paused,
            MonitorExit::TransportExhausted(_) => MonitorState::Disconnected,
        };
        self.set_state(final_state);

        match &exit {
            MonitorExit::Cancelled => tracing::info!(account = %self.account, "monitor stopped"),
            other => tracing::warn!(account = %self.account, exit = ?other, "monitor exited"),
        }
        exit
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> MonitorExit {
        if let Err(e) = self.skip_backlog(cancel).await {
            if let Err(exit) = self.recover(e, cancel).await {
                return exit;
            }
        }

        loop {
            if cancel.is_cancelled() {
                return MonitorExit::Cancelled;
            }

            self.set_state(MonitorState::Scanning);
            let wait = match self.scan(cancel).await {
                Ok(true) => self.settings.post_quiz_cooldown,
                Ok(false) => self.settings.scan_interval,
                Err(e) => {
                    if let Err(exit) = self.recover(e, cancel).await {
                        return exit;
                    }
                    continue;
                }
            };

            if cancel.is_cancelled() {
                return MonitorExit::Cancelled;
            }
            self.set_state(MonitorState::Idle);
            if !sleep_or_cancel(wait, cancel).await {
                return MonitorExit::Cancelled;
            }
        }
    }

    /// Mark everything already in the channel as seen.
    async fn skip_backlog(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut skipped = 0usize;
        for _ in 0..BACKLOG_DRAIN_LIMIT {
            let Some(msg) = self.receive(cancel).await? else {
                break;
            };
            if self.seen.insert(msg.message_id) {
                skipped += 1;
            }
        }
        tracing::info!(account = %self.account, skipped, "skipped channel backlog");
        Ok(())
    }

    /// One scan tick. Returns true if a quiz was handled, which triggers the
    /// post-quiz cooldown.
    async fn scan(&mut self, cancel: &CancellationToken) -> Result<bool> {
        for _ in 0..self.settings.max_scan_messages {
            let Some(msg) = self.receive(cancel).await? else {
                return Ok(false);
            };
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if self.handle_message(msg, cancel).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_message(&mut self, msg: InboundMessage, cancel: &CancellationToken) -> Result<bool> {
        if !self.seen.insert(msg.message_id) {
            return Ok(false);
        }

        self.set_state(MonitorState::Detecting);
        let Some(quiz) = self.detector.detect(&msg) else {
            return Ok(false);
        };

        let age = (Utc::now() - quiz.arrived_at).to_std().unwrap_or_default();
        if age > self.settings.max_quiz_age {
            tracing::debug!(
                account = %self.account,
                message_id = quiz.message_id.0,
                age_secs = age.as_secs(),
                "skipping stale quiz"
            );
            return Ok(false);
        }

        tracing::info!(
            account = %self.account,
            message_id = quiz.message_id.0,
            options = quiz.options.len(),
            "quiz detected"
        );

        self.set_state(MonitorState::Resolving);
        let resolution = self.resolver.resolve(&quiz, &self.account, cancel).await;
        if cancel.is_cancelled() {
            return Ok(false);
        }

        self.set_state(MonitorState::Submitting);
        self.submit(&quiz, &resolution, cancel).await?;
        Ok(true)
    }

    /// Reply with the letter, retrying transient failures. Only session-fatal
    /// errors propagate; anything else is recorded and swallowed.
    async fn submit(
        &self,
        quiz: &QuizMessage,
        resolution: &Resolution,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let text = resolution.letter.to_string();
        let attempts = self.settings.submit_attempts.max(1);
        let mut backoff = self.settings.submit_backoff;
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self
                .transport
                .send_text(quiz.channel, &text, Some(quiz.message_id))
                .await
            {
                Ok(sent) => {
                    tracing::info!(
                        account = %self.account,
                        letter = %resolution.letter,
                        message_id = sent.message_id.0,
                        attempt,
                        "answer submitted"
                    );
                    self.audit(resolution, true, None);
                    return Ok(());
                }
                Err(e) if e.is_session_fatal() => {
                    self.audit(resolution, false, Some(e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(account = %self.account, attempt, error = %e, "submission failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        if !sleep_or_cancel(backoff, cancel).await {
                            break;
                        }
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        let err = Error::Submission(match last_err {
            Some(e) => format!("gave up after {attempts} attempts: {e}"),
            None => "cancelled before delivery".to_string(),
        });
        tracing::warn!(account = %self.account, letter = %resolution.letter, error = %err, "answer not delivered");
        self.audit(resolution, false, Some(err.to_string()));
        Ok(())
    }

    /// Handle a receive/send error: pause on fatal errors, otherwise back off
    /// and reconnect. Failures count across calls until a receive succeeds, so
    /// a session that reconnects fine but never delivers still runs out of
    /// attempts.
    async fn recover(&mut self, err: Error, cancel: &CancellationToken) -> std::result::Result<(), MonitorExit> {
        if cancel.is_cancelled() {
            return Err(MonitorExit::Cancelled);
        }
        if err.is_session_fatal() {
            return Err(MonitorExit::from_fatal(err));
        }

        tracing::warn!(account = %self.account, error = %err, failures = self.failures, "connection lost");
        self.set_state(MonitorState::Disconnected);

        let mut last = err;
        loop {
            if self.failures >= self.settings.reconnect_attempts {
                return Err(MonitorExit::TransportExhausted(last.to_string()));
            }
            self.failures += 1;
            let attempt = self.failures;

            if !sleep_or_cancel(self.reconnect_delay(), cancel).await {
                return Err(MonitorExit::Cancelled);
            }

            self.set_state(MonitorState::Reconnecting);
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(MonitorExit::Cancelled),
                res = self.transport.reconnect() => res,
            };
            match res {
                Ok(()) => {
                    tracing::info!(account = %self.account, attempt, "reconnected");
                    return Ok(());
                }
                Err(e) if e.is_session_fatal() => return Err(MonitorExit::from_fatal(e)),
                Err(e) => {
                    tracing::warn!(account = %self.account, attempt, error = %e, "reconnect failed");
                    self.set_state(MonitorState::Disconnected);
                    last = e;
                }
            }
        }
    }

    /// Backoff before the current attempt: doubles per consecutive failure, capped.
    fn reconnect_delay(&self) -> Duration {
        let doublings = self.failures.saturating_sub(1).min(16);
        self.settings
            .reconnect_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.settings.reconnect_backoff_max)
    }

    async fn receive(&mut self, cancel: &CancellationToken) -> Result<Option<InboundMessage>> {
        let chat = self.settings.quiz_chat;
        let res = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            res = timeout(self.settings.receive_timeout, self.transport.receive_next(chat)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(Error::Transport(format!(
                    "receive timed out after {}s",
                    self.settings.receive_timeout.as_secs()
                ))),
            },
        };
        if res.is_ok() {
            self.failures = 0;
        }
        res
    }

    fn audit(&self, resolution: &Resolution, delivered: bool, error: Option<String>) {
        let record = SubmissionRecord {
            fingerprint: resolution.fingerprint.as_str().to_string(),
            letter: resolution.letter,
            account_id: self.account.clone(),
            submitted_at: Utc::now(),
            delivered,
            error,
        };
        if let Err(e) = self.submissions.record(record) {
            tracing::warn!(account = %self.account, error = %e, "failed to write submission log");
        }
    }

    fn set_state(&self, next: MonitorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(account = %self.account, state = %next, seen = self.seen.len(), "monitor state");
        }
    }
}

/// Returns false if cancelled before `dur` elapsed.
async fn sleep_or_cancel(dur: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{AnswerCache, MemoryStore},
        domain::Letter,
        resolver::ResolverSettings,
        testing::{inbound, FakeAssistant, FakeTransport, Fault, Reply},
    };
    use tokio::task::JoinHandle;

    const CHAT: ChatId = ChatId(-100);
    const SOURCE: i64 = 77;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            quiz_chat: CHAT,
            quiz_source: UserId(SOURCE),
            ..MonitorSettings::default()
        }
    }

    fn quiz_msg(id: i32, question: &str) -> InboundMessage {
        inbound(
            CHAT,
            id,
            Some(SOURCE),
            &format!("{question}\nA) Venus\nB) Mars\nC) Jupiter\nD) Saturn"),
        )
    }

    struct Harness {
        transport: Arc<FakeTransport>,
        assistant: Arc<FakeAssistant>,
        submissions: Arc<SubmissionLog>,
        cancel: CancellationToken,
        state: watch::Receiver<MonitorState>,
        handle: JoinHandle<MonitorExit>,
    }

    fn spawn(transport: Arc<FakeTransport>, replies: Vec<Reply>) -> Harness {
        let assistant = Arc::new(FakeAssistant::replying(replies));
        let cache = Arc::new(AnswerCache::open(Box::new(MemoryStore::default())));
        let resolver = Arc::new(AnswerResolver::new(
            cache,
            assistant.clone(),
            ResolverSettings::default(),
        ));
        let submissions = Arc::new(SubmissionLog::in_memory());
        let monitor = AccountMonitor::new(
            AccountId("main".into()),
            transport.clone(),
            resolver,
            submissions.clone(),
            settings(),
        );
        let state = monitor.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));
        Harness {
            transport,
            assistant,
            submissions,
            cancel,
            state,
            handle,
        }
    }

    async fn wait(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn answers_new_quiz_and_skips_backlog() {
        let transport = Arc::new(FakeTransport::default());
        transport.push(quiz_msg(1, "Old question?"));
        let h = spawn(transport.clone(), vec![Reply::Text("Answer: B".into())]);

        wait(1).await;
        transport.push(quiz_msg(2, "Which planet is red?"));
        wait(6).await;

        assert_eq!(h.transport.sent(), vec![(CHAT, "B".to_string(), Some(MessageId(2)))]);
        assert_eq!(h.assistant.calls(), 1);
        let records = h.submissions.recent();
        assert_eq!(records.len(), 1);
        assert!(records[0].delivered);
        assert_eq!(records[0].letter, Letter::B);

        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap(), MonitorExit::Cancelled);
        assert_eq!(*h.state.borrow(), MonitorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_other_senders_and_non_quizzes() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![]);

        wait(1).await;
        transport.push(inbound(CHAT, 5, Some(SOURCE), "gm everyone"));
        transport.push(inbound(
            CHAT,
            6,
            Some(12345),
            "Fake quiz?\nA) one\nB) two",
        ));
        transport.push(inbound(CHAT, 7, None, "Anon?\nA) one\nB) two"));
        wait(11).await;

        assert!(h.transport.sent().is_empty());
        assert_eq!(h.assistant.calls(), 0);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_quiz_is_not_answered() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![Reply::Text("A".into())]);

        wait(1).await;
        let mut old = quiz_msg(3, "Which planet is red?");
        old.sent_at = Utc::now() - chrono::Duration::minutes(10);
        transport.push(old);
        wait(6).await;

        assert!(h.transport.sent().is_empty());
        assert_eq!(h.assistant.calls(), 0);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn same_message_is_processed_once() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![Reply::Text("C".into())]);

        wait(1).await;
        transport.push(quiz_msg(4, "Which planet is red?"));
        transport.push(quiz_msg(4, "Which planet is red?"));
        wait(70).await;

        assert_eq!(h.transport.sent_texts(), vec!["C".to_string()]);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn submission_retries_then_succeeds() {
        let transport = Arc::new(FakeTransport::default());
        transport.fail_send(Fault::Transport, 2);
        let h = spawn(transport.clone(), vec![Reply::Text("Answer: D".into())]);

        wait(1).await;
        transport.push(quiz_msg(8, "Which planet is red?"));
        wait(10).await;

        assert_eq!(h.transport.sent_texts(), vec!["D".to_string()]);
        let records = h.submissions.recent();
        assert_eq!(records.len(), 1);
        assert!(records[0].delivered);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_submission_is_reported_and_monitor_keeps_going() {
        let transport = Arc::new(FakeTransport::default());
        transport.fail_send(Fault::Transport, 3);
        let h = spawn(
            transport.clone(),
            vec![Reply::Text("A".into()), Reply::Text("C".into())],
        );

        wait(1).await;
        transport.push(quiz_msg(9, "First question?"));
        wait(10).await;
        assert!(h.transport.sent().is_empty());
        let records = h.submissions.recent();
        assert_eq!(records.len(), 1);
        assert!(!records[0].delivered);
        assert!(records[0].error.as_deref().unwrap_or("").contains("3 attempts"));

        // Cooldown, then the next quiz goes through.
        wait(60).await;
        transport.push(quiz_msg(10, "Second question?"));
        wait(6).await;
        assert_eq!(h.transport.sent_texts(), vec!["C".to_string()]);
        assert!(!h.handle.is_finished());

        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap(), MonitorExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_transient_error() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![Reply::Text("B".into())]);

        wait(1).await;
        transport.fail_receive(Fault::Transport);
        wait(6).await;
        assert_eq!(transport.reconnect_calls(), 1);

        transport.push(quiz_msg(11, "Which planet is red?"));
        wait(6).await;
        assert_eq!(h.transport.sent_texts(), vec!["B".to_string()]);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_reconnect_attempts() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![]);

        wait(1).await;
        transport.fail_receive_forever(Fault::Transport);
        transport.fail_reconnect(Fault::Transport, 5);

        let exit = h.handle.await.unwrap();
        assert!(matches!(exit, MonitorExit::TransportExhausted(_)));
        assert!(exit.is_restartable());
        assert_eq!(transport.reconnect_calls(), 5);
        assert_eq!(*h.state.borrow(), MonitorState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_without_delivery_still_exhausts() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![]);

        wait(1).await;
        let started = tokio::time::Instant::now();
        let receives_before = transport.receive_calls();
        transport.break_receive(Fault::Transport);

        let exit = h.handle.await.unwrap();
        assert!(matches!(exit, MonitorExit::TransportExhausted(_)));
        assert_eq!(transport.reconnect_calls(), 5);
        // one failed receive per cycle, plus the one that started it
        assert_eq!(transport.receive_calls() - receives_before, 6);
        // 1 + 2 + 4 + 8 + 16 seconds of backoff
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert_eq!(*h.state.borrow(), MonitorState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_receive_resets_reconnect_budget() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![]);

        wait(1).await;
        for _ in 0..4 {
            transport.fail_receive(Fault::Transport);
        }
        wait(30).await;
        assert_eq!(transport.reconnect_calls(), 4);

        for _ in 0..4 {
            transport.fail_receive(Fault::Transport);
        }
        wait(30).await;
        assert_eq!(transport.reconnect_calls(), 8);
        assert!(!h.handle.is_finished());

        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap(), MonitorExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_error_pauses_without_reconnect() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![]);

        wait(1).await;
        transport.fail_receive(Fault::Auth);

        let exit = h.handle.await.unwrap();
        assert!(matches!(exit, MonitorExit::AuthRequired(_)));
        assert!(!exit.is_restartable());
        assert_eq!(transport.reconnect_calls(), 0);
        assert_eq!(*h.state.borrow(), MonitorState::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn ban_during_submission_stops_monitor() {
        let transport = Arc::new(FakeTransport::default());
        transport.fail_send(Fault::Banned, 1);
        let h = spawn(transport.clone(), vec![Reply::Text("A".into())]);

        wait(1).await;
        transport.push(quiz_msg(12, "Which planet is red?"));

        let exit = h.handle.await.unwrap();
        assert!(matches!(exit, MonitorExit::Banned(_)));
        assert_eq!(h.submissions.recent().len(), 1);
        assert!(!h.submissions.recent()[0].delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_resolution() {
        let transport = Arc::new(FakeTransport::default());
        let h = spawn(transport.clone(), vec![Reply::Never]);

        wait(1).await;
        transport.push(quiz_msg(13, "Which planet is red?"));
        wait(6).await;
        assert_eq!(*h.state.borrow(), MonitorState::Resolving);

        let started = tokio::time::Instant::now();
        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap(), MonitorExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn seen_set_evicts_oldest() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert(MessageId(1)));
        assert!(seen.insert(MessageId(2)));
        assert!(!seen.insert(MessageId(2)));
        assert!(seen.insert(MessageId(3)));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert(MessageId(1)));
    }
}
