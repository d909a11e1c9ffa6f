//! Answer resolution: cache, single-flight assistant query, fallback.
//!
//! Every fingerprint has at most one ticket in the ticket table. The first
//! caller to claim it owns the assistant round trip; everyone else attaches
//! as a waiter and receives the owner's letter through a `watch` channel.
//! `resolve()` never fails: every error path degrades to the fallback letter.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    sync::watch,
    time::{timeout, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::AnswerCache,
    domain::{AccountId, Letter, QuizMessage},
    extractor,
    fingerprint::QuestionFingerprint,
    ports::Assistant,
    prompt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolverSettings {
    /// How long the ticket owner waits for the assistant.
    pub reply_timeout: Duration,
    /// Extra time waiters allow on top of `reply_timeout`.
    pub reply_grace: Duration,
    pub fallback: Letter,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(20),
            reply_grace: Duration::from_secs(2),
            fallback: Letter::B,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionSource {
    Cache,
    /// This call owned the ticket and the assistant's reply parsed.
    Assistant,
    /// Another account's ticket delivered the letter.
    Shared,
    Fallback,
}

#[derive(Clone, Debug)]
pub struct Resolution {
    pub fingerprint: QuestionFingerprint,
    pub letter: Letter,
    pub source: ResolutionSource,
}

struct Ticket {
    id: u64,
    owner: AccountId,
    deadline: Instant,
    result: watch::Receiver<Option<Letter>>,
    waiters: usize,
}

enum Claim<'a> {
    Owner(TicketGuard<'a>),
    Waiter {
        result: watch::Receiver<Option<Letter>>,
        deadline: Instant,
        owner: AccountId,
    },
}

enum Outcome {
    Reply(String),
    NoReply,
    Cancelled,
}

pub struct AnswerResolver {
    cache: Arc<AnswerCache>,
    assistant: Arc<dyn Assistant>,
    settings: ResolverSettings,
    // Critical sections never await, so a std mutex keeps ticket creation atomic
    // and lets the guard clean up from `Drop`.
    tickets: Mutex<HashMap<QuestionFingerprint, Ticket>>,
    next_ticket: AtomicU64,
}

impl AnswerResolver {
    pub fn new(
        cache: Arc<AnswerCache>,
        assistant: Arc<dyn Assistant>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            cache,
            assistant,
            settings,
            tickets: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<AnswerCache> {
        &self.cache
    }

    pub fn settings(&self) -> ResolverSettings {
        self.settings
    }

    /// Number of live tickets.
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }

    /// Resolve a letter for `quiz`.
    ///
    /// Returns within `reply_timeout + reply_grace` (plus cache I/O). Cancelling
    /// `cancel` aborts any wait immediately with the fallback letter.
    pub async fn resolve(
        &self,
        quiz: &QuizMessage,
        account: &AccountId,
        cancel: &CancellationToken,
    ) -> Resolution {
        let fingerprint = QuestionFingerprint::of(&quiz.text);

        if let Some(letter) = self.cache.lookup(&fingerprint).await {
            self.cache.upsert(&fingerprint, letter).await;
            return self.done(account, fingerprint, letter, ResolutionSource::Cache);
        }

        match self.claim(&fingerprint, account) {
            Claim::Waiter {
                result,
                deadline,
                owner,
            } => {
                tracing::info!(
                    account = %account,
                    owner = %owner,
                    fingerprint = fingerprint.short(),
                    "question already being resolved, waiting"
                );
                match wait_for_result(result, deadline, cancel).await {
                    Some(letter) => {
                        self.done(account, fingerprint, letter, ResolutionSource::Shared)
                    }
                    None => {
                        tracing::warn!(
                            account = %account,
                            fingerprint = fingerprint.short(),
                            "no shared result before deadline, using fallback"
                        );
                        let letter = self.settings.fallback;
                        self.done(account, fingerprint, letter, ResolutionSource::Fallback)
                    }
                }
            }
            Claim::Owner(guard) => self.resolve_as_owner(quiz, account, guard, cancel).await,
        }
    }

    async fn resolve_as_owner(
        &self,
        quiz: &QuizMessage,
        account: &AccountId,
        guard: TicketGuard<'_>,
        cancel: &CancellationToken,
    ) -> Resolution {
        let fingerprint = guard.fingerprint.clone();

        // A previous owner may have finished between our cache miss and the claim.
        if let Some(letter) = self.cache.lookup(&fingerprint).await {
            self.cache.upsert(&fingerprint, letter).await;
            guard.complete(letter);
            return self.done(account, fingerprint, letter, ResolutionSource::Cache);
        }

        tracing::info!(
            account = %account,
            fingerprint = fingerprint.short(),
            "asking assistant"
        );
        let request = prompt::render(quiz, self.settings.reply_timeout);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            res = timeout(self.settings.reply_timeout, self.assistant.ask(&request)) => match res {
                Ok(Ok(reply)) => Outcome::Reply(reply),
                Ok(Err(e)) => {
                    tracing::warn!(account = %account, error = %e, "assistant request failed");
                    Outcome::NoReply
                }
                Err(_) => {
                    tracing::warn!(
                        account = %account,
                        fingerprint = fingerprint.short(),
                        timeout_secs = self.settings.reply_timeout.as_secs(),
                        "assistant did not reply in time"
                    );
                    Outcome::NoReply
                }
            },
        };

        let (letter, source) = match outcome {
            Outcome::Cancelled => {
                // Ticket is dropped without a result; waiters fall back on their own.
                drop(guard);
                let letter = self.settings.fallback;
                return self.done(account, fingerprint, letter, ResolutionSource::Fallback);
            }
            Outcome::Reply(reply) => match extractor::extract_with_strategy(&reply) {
                Some((letter, strategy)) => {
                    tracing::debug!(?strategy, %letter, "letter extracted from reply");
                    (letter, ResolutionSource::Assistant)
                }
                None => {
                    tracing::warn!(
                        account = %account,
                        reply = %crate::audit::truncate_text(&reply, 120),
                        "no letter in assistant reply"
                    );
                    (self.settings.fallback, ResolutionSource::Fallback)
                }
            },
            Outcome::NoReply => (self.settings.fallback, ResolutionSource::Fallback),
        };

        // Cache before releasing the ticket so late arrivals hit the cache.
        self.cache.upsert_for(quiz, &fingerprint, letter).await;
        guard.complete(letter);
        self.done(account, fingerprint, letter, source)
    }

    fn claim(&self, fingerprint: &QuestionFingerprint, account: &AccountId) -> Claim<'_> {
        let mut table = self.table();
        if let Some(ticket) = table.get_mut(fingerprint) {
            ticket.waiters += 1;
            return Claim::Waiter {
                result: ticket.result.clone(),
                deadline: ticket.deadline,
                owner: ticket.owner.clone(),
            };
        }

        let (tx, rx) = watch::channel(None);
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        table.insert(
            fingerprint.clone(),
            Ticket {
                id,
                owner: account.clone(),
                deadline: Instant::now() + self.settings.reply_timeout + self.settings.reply_grace,
                result: rx,
                waiters: 0,
            },
        );
        Claim::Owner(TicketGuard {
            resolver: self,
            fingerprint: fingerprint.clone(),
            id,
            tx,
        })
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<QuestionFingerprint, Ticket>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn done(
        &self,
        account: &AccountId,
        fingerprint: QuestionFingerprint,
        letter: Letter,
        source: ResolutionSource,
    ) -> Resolution {
        tracing::info!(
            account = %account,
            fingerprint = fingerprint.short(),
            %letter,
            ?source,
            "question resolved"
        );
        Resolution {
            fingerprint,
            letter,
            source,
        }
    }
}

/// Ownership of one ticket. Dropping it removes the ticket; a guard dropped
/// without `complete()` closes the channel so waiters stop waiting.
struct TicketGuard<'a> {
    resolver: &'a AnswerResolver,
    fingerprint: QuestionFingerprint,
    id: u64,
    tx: watch::Sender<Option<Letter>>,
}

impl TicketGuard<'_> {
    fn complete(self, letter: Letter) {
        let waiters = self
            .resolver
            .table()
            .get(&self.fingerprint)
            .map(|t| t.waiters)
            .unwrap_or(0);
        // Err only means nobody is subscribed any more.
        let _ = self.tx.send(Some(letter));
        if waiters > 0 {
            tracing::debug!(fingerprint = self.fingerprint.short(), waiters, "waking waiters");
        }
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.resolver.table();
        if table.get(&self.fingerprint).map(|t| t.id) == Some(self.id) {
            table.remove(&self.fingerprint);
        }
    }
}

async fn wait_for_result(
    mut result: watch::Receiver<Option<Letter>>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Option<Letter> {
    let wait = async move {
        loop {
            let current = *result.borrow_and_update();
            if current.is_some() {
                return current;
            }
            if result.changed().await.is_err() {
                // Owner went away; it may still have sent right before dropping.
                let last = *result.borrow();
                return last;
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => None,
        res = timeout_at(deadline, wait) => res.ok().flatten(),
    }
}
