use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{ChatId, Letter, UserId},
    errors::Error,
    monitor::MonitorSettings,
    resolver::ResolverSettings,
    supervisor::SupervisorSettings,
    Result,
};

/// Quiz bot watched when `QBOT_QUIZ_SOURCE_ID` is unset.
pub const DEFAULT_QUIZ_SOURCE_ID: i64 = 7_901_924_377;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssistantBackend {
    /// Ask over the chat transport (an assistant bot in a private chat).
    Transport {
        chat: ChatId,
        assistant_id: Option<UserId>,
        /// Account whose session talks to the assistant; first account if unset.
        account: Option<String>,
    },
    /// OpenAI-compatible chat completions endpoint.
    OpenAi {
        api_key: String,
        model: String,
        base_url: String,
    },
}

/// Typed configuration, read from the environment (plus `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub data_dir: PathBuf,
    pub accounts_file: PathBuf,
    pub cache_file: PathBuf,
    pub submissions_log: PathBuf,

    // Channels
    pub quiz_chat: ChatId,
    pub quiz_source: UserId,
    pub assistant: AssistantBackend,

    // Resolver
    pub reply_timeout: Duration,
    pub reply_grace: Duration,

    // Monitor
    pub scan_interval: Duration,
    pub max_scan_messages: usize,
    pub max_quiz_age: Duration,
    pub post_quiz_cooldown: Duration,
    pub submit_attempts: u32,
    pub submit_backoff: Duration,
    pub reconnect_attempts: u32,

    // Supervisor
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let data_dir = data_dir()?;

        let quiz_chat = env_i64("QBOT_QUIZ_CHAT_ID").map(ChatId).ok_or_else(|| {
            Error::Config("QBOT_QUIZ_CHAT_ID environment variable is required".to_string())
        })?;
        let quiz_source = UserId(env_i64("QBOT_QUIZ_SOURCE_ID").unwrap_or(DEFAULT_QUIZ_SOURCE_ID));

        let backend = env_str("QBOT_ASSISTANT_BACKEND")
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_else(|| "transport".to_string());
        let assistant = match backend.as_str() {
            "transport" => AssistantBackend::Transport {
                chat: env_i64("QBOT_ASSISTANT_CHAT_ID").map(ChatId).ok_or_else(|| {
                    Error::Config(
                        "QBOT_ASSISTANT_CHAT_ID is required for the transport assistant"
                            .to_string(),
                    )
                })?,
                assistant_id: env_i64("QBOT_ASSISTANT_BOT_ID").map(UserId),
                account: env_str("QBOT_ASSISTANT_ACCOUNT").and_then(non_empty),
            },
            "openai" => AssistantBackend::OpenAi {
                api_key: env_str("OPENAI_API_KEY").and_then(non_empty).ok_or_else(|| {
                    Error::Config("OPENAI_API_KEY is required for the openai assistant".to_string())
                })?,
                model: env_str("QBOT_OPENAI_MODEL")
                    .and_then(non_empty)
                    .unwrap_or_else(|| "gpt-4o-mini".to_string()),
                base_url: env_str("QBOT_OPENAI_BASE_URL")
                    .and_then(non_empty)
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            },
            other => {
                return Err(Error::Config(format!(
                    "unknown QBOT_ASSISTANT_BACKEND: {other} (expected transport or openai)"
                )))
            }
        };

        Ok(Self {
            accounts_file: data_dir.join(ACCOUNTS_FILE),
            cache_file: data_dir.join(CACHE_FILE),
            submissions_log: data_dir.join(SUBMISSIONS_LOG),
            data_dir,
            quiz_chat,
            quiz_source,
            assistant,
            reply_timeout: secs("QBOT_REPLY_TIMEOUT_SECS", 20),
            reply_grace: secs("QBOT_REPLY_GRACE_SECS", 2),
            scan_interval: secs("QBOT_SCAN_INTERVAL_SECS", 5),
            max_scan_messages: env_usize("QBOT_MAX_SCAN_MESSAGES").unwrap_or(50).max(1),
            max_quiz_age: secs("QBOT_MAX_QUIZ_AGE_SECS", 300),
            post_quiz_cooldown: secs("QBOT_POST_QUIZ_COOLDOWN_SECS", 60),
            submit_attempts: env_u32("QBOT_SUBMIT_ATTEMPTS").unwrap_or(3).max(1),
            submit_backoff: Duration::from_millis(env_u64("QBOT_SUBMIT_BACKOFF_MS").unwrap_or(1000)),
            reconnect_attempts: env_u32("QBOT_RECONNECT_ATTEMPTS").unwrap_or(5),
            max_restarts: env_u32("QBOT_MAX_RESTARTS").unwrap_or(3),
            restart_backoff: secs("QBOT_RESTART_BACKOFF_SECS", 10),
            shutdown_grace: secs("QBOT_SHUTDOWN_GRACE_SECS", 10),
        })
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            reply_timeout: self.reply_timeout,
            reply_grace: self.reply_grace,
            fallback: Letter::B,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            quiz_chat: self.quiz_chat,
            quiz_source: self.quiz_source,
            scan_interval: self.scan_interval,
            max_scan_messages: self.max_scan_messages,
            max_quiz_age: self.max_quiz_age,
            post_quiz_cooldown: self.post_quiz_cooldown,
            submit_attempts: self.submit_attempts,
            submit_backoff: self.submit_backoff,
            reconnect_attempts: self.reconnect_attempts,
            ..MonitorSettings::default()
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            max_restarts: self.max_restarts,
            restart_backoff: self.restart_backoff,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Resolve and create the data dir (`QBOT_DATA_DIR`, default `~/.quiz_bot`).
///
/// Loads `.env` first, so commands that only touch the stores can call this
/// without the full `Config`.
pub fn data_dir() -> Result<PathBuf> {
    load_dotenv_if_present(Path::new(".env"));

    let home = home_dir().ok_or_else(|| Error::Config("HOME is not set".to_string()))?;
    let data_dir = env_path("QBOT_DATA_DIR").unwrap_or_else(|| home.join(".quiz_bot"));
    if data_dir.exists() && !data_dir.is_dir() {
        return Err(Error::InvalidPath {
            path: data_dir,
            reason: "data dir is not a directory".to_string(),
        });
    }
    fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

pub const ACCOUNTS_FILE: &str = "accounts.json";
pub const CACHE_FILE: &str = "answers.json";
pub const SUBMISSIONS_LOG: &str = "submissions.log";

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(key).unwrap_or(default))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
