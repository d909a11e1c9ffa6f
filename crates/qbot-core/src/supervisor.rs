//! Owns one task per account plus the shared resolver.
//!
//! Each account task connects its session, runs the monitor as a child task
//! and applies the restart policy. A panic inside a monitor surfaces as a
//! `JoinError` in its own account task and never reaches the others.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    audit::SubmissionLog,
    cache::AnswerCacheEntry,
    domain::{Account, AccountId, ConnectionState},
    monitor::{AccountMonitor, MonitorExit, MonitorSettings, MonitorState},
    ports::SessionConnector,
    resolver::AnswerResolver,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_backoff: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AccountStatus {
    pub account: AccountId,
    pub connection: ConnectionState,
    pub monitor: MonitorState,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Health {
    connection: ConnectionState,
    restarts: u32,
    last_error: Option<String>,
}

struct AccountSlot {
    account: AccountId,
    health: Arc<Mutex<Health>>,
    state: watch::Receiver<MonitorState>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct Supervisor {
    connector: Arc<dyn SessionConnector>,
    resolver: Arc<AnswerResolver>,
    submissions: Arc<SubmissionLog>,
    monitor_settings: MonitorSettings,
    settings: SupervisorSettings,
    cancel: CancellationToken,
    slots: Vec<AccountSlot>,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        resolver: Arc<AnswerResolver>,
        submissions: Arc<SubmissionLog>,
        monitor_settings: MonitorSettings,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            connector,
            resolver,
            submissions,
            monitor_settings,
            settings,
            cancel: CancellationToken::new(),
            slots: Vec::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<AnswerResolver> {
        &self.resolver
    }

    /// Launch a task for every account that is not already running.
    /// Returns how many were started.
    pub fn start(&mut self, accounts: &[Account]) -> usize {
        let mut started = 0;
        for account in accounts {
            if self.slots.iter().any(|s| s.account == account.name) {
                tracing::debug!(account = %account.name, "already supervised");
                continue;
            }

            let (state_tx, state_rx) = watch::channel(MonitorState::Idle);
            let health = Arc::new(Mutex::new(Health {
                connection: ConnectionState::Disconnected,
                restarts: 0,
                last_error: None,
            }));
            let cancel = self.cancel.child_token();

            let task = AccountTask {
                account: account.clone(),
                connector: self.connector.clone(),
                resolver: self.resolver.clone(),
                submissions: self.submissions.clone(),
                monitor_settings: self.monitor_settings,
                settings: self.settings,
                health: health.clone(),
                state: Arc::new(state_tx),
                cancel: cancel.clone(),
            };
            let handle = tokio::spawn(task.run());

            self.slots.push(AccountSlot {
                account: account.name.clone(),
                health,
                state: state_rx,
                cancel,
                handle: Some(handle),
            });
            started += 1;
        }
        tracing::info!(started, total = self.slots.len(), "monitors launched");
        started
    }

    /// Cancel one account's work. Shared resolver state is left alone.
    pub fn disconnect(&self, name: &AccountId) -> bool {
        match self.slots.iter().find(|s| &s.account == name) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything, wait for account tasks (bounded), then flush the cache.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!(accounts = self.slots.len(), "stopping monitors");
        self.cancel.cancel();

        for slot in &mut self.slots {
            let Some(mut handle) = slot.handle.take() else {
                continue;
            };
            match timeout(self.settings.shutdown_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(account = %slot.account, error = %e, "account task failed");
                }
                Err(_) => {
                    tracing::warn!(account = %slot.account, "account task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.resolver.cache().flush().await?;
        tracing::info!("monitors stopped, cache flushed");
        Ok(())
    }

    /// True once every account task has returned.
    pub fn is_idle(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.handle.as_ref().map_or(true, |h| h.is_finished()))
    }

    pub fn statuses(&self) -> Vec<AccountStatus> {
        self.slots
            .iter()
            .map(|slot| {
                let health = slot.health.lock().unwrap_or_else(|e| e.into_inner());
                AccountStatus {
                    account: slot.account.clone(),
                    connection: health.connection,
                    monitor: *slot.state.borrow(),
                    restarts: health.restarts,
                    last_error: health.last_error.clone(),
                }
            })
            .collect()
    }

    /// Cached answers, most recently used first.
    pub async fn list_cached_answers(&self) -> Vec<AnswerCacheEntry> {
        self.resolver.cache().entries().await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Aborts the monitor task if the account task itself is aborted.
struct ChildTask(JoinHandle<MonitorExit>);

impl Drop for ChildTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct AccountTask {
    account: Account,
    connector: Arc<dyn SessionConnector>,
    resolver: Arc<AnswerResolver>,
    submissions: Arc<SubmissionLog>,
    monitor_settings: MonitorSettings,
    settings: SupervisorSettings,
    health: Arc<Mutex<Health>>,
    state: Arc<watch::Sender<MonitorState>>,
    cancel: CancellationToken,
}

enum Attempt {
    /// Stop supervising this account.
    Finished,
    /// Failure the restart policy covers.
    Failed(String),
}

impl AccountTask {
    async fn run(self) {
        let name = self.account.name.clone();
        loop {
            let failure = match self.attempt().await {
                Attempt::Finished => return,
                Attempt::Failed(reason) => reason,
            };

            let restarts = {
                let mut health = self.health();
                health.connection = ConnectionState::Disconnected;
                health.last_error = Some(failure.clone());
                health.restarts
            };
            if restarts >= self.settings.max_restarts {
                tracing::error!(account = %name, restarts, error = %failure, "giving up on account");
                self.state.send_replace(MonitorState::Stopped);
                return;
            }

            tracing::warn!(
                account = %name,
                error = %failure,
                backoff_secs = self.settings.restart_backoff.as_secs(),
                "monitor failed, restarting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state.send_replace(MonitorState::Stopped);
                    return;
                }
                _ = tokio::time::sleep(self.settings.restart_backoff) => {}
            }
            self.health().restarts += 1;
        }
    }

    async fn attempt(&self) -> Attempt {
        let name = &self.account.name;
        self.health().connection = ConnectionState::Connecting;

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.settle(ConnectionState::Disconnected, MonitorState::Stopped, None);
                return Attempt::Finished;
            }
            res = self.connector.connect(&self.account) => res,
        };
        let transport = match connected {
            Ok(t) => t,
            Err(Error::Banned(msg)) => {
                tracing::error!(account = %name, error = %msg, "account banned");
                self.settle(ConnectionState::Banned, MonitorState::Stopped, Some(msg));
                return Attempt::Finished;
            }
            Err(Error::Auth(msg)) => {
                tracing::warn!(account = %name, error = %msg, "account needs re-authentication");
                self.settle(ConnectionState::Disconnected, MonitorState::Paused, Some(msg));
                return Attempt::Finished;
            }
            Err(e) => return Attempt::Failed(format!("connect failed: {e}")),
        };

        self.health().connection = ConnectionState::Authenticated;
        tracing::info!(account = %name, "session connected");

        let monitor = AccountMonitor::new(
            name.clone(),
            transport,
            self.resolver.clone(),
            self.submissions.clone(),
            self.monitor_settings,
        )
        .with_state_sender(self.state.clone());
        let mut child = ChildTask(tokio::spawn(monitor.run(self.cancel.clone())));

        match (&mut child.0).await {
            Ok(MonitorExit::Cancelled) => {
                self.health().connection = ConnectionState::Disconnected;
                Attempt::Finished
            }
            Ok(MonitorExit::AuthRequired(msg)) => {
                self.settle(ConnectionState::Disconnected, MonitorState::Paused, Some(msg));
                Attempt::Finished
            }
            Ok(MonitorExit::Banned(msg)) => {
                self.settle(ConnectionState::Banned, MonitorState::Stopped, Some(msg));
                Attempt::Finished
            }
            Ok(MonitorExit::TransportExhausted(msg)) => Attempt::Failed(msg),
            Err(e) if e.is_panic() => {
                tracing::error!(account = %name, "monitor panicked");
                Attempt::Failed("monitor panicked".to_string())
            }
            Err(e) => Attempt::Failed(format!("monitor task failed: {e}")),
        }
    }

    fn settle(&self, connection: ConnectionState, monitor: MonitorState, error: Option<String>) {
        let mut health = self.health();
        health.connection = connection;
        if error.is_some() {
            health.last_error = error;
        }
        drop(health);
        self.state.send_replace(monitor);
    }

    fn health(&self) -> std::sync::MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}
